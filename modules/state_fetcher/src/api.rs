//! REST API client
//!
//! Every request picks up the bearer token and the selected class from the
//! shared session. A 401 on anything but the login call means the token is
//! dead, so the stored credentials are dropped before the error is returned.

use std::sync::Arc;
use std::time::Duration;

use podium_common::session::{Session, SessionError, SessionStore};
use podium_common::ClassId;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};
use url::Url;

use crate::configuration::FetcherConfig;

/// Session shared between the API client and its owner
pub type SharedSession = Arc<RwLock<SessionStore>>;

pub const LOGIN_PATH: &str = "/auth/login";

const CLASS_ID_PARAM: &str = "class_id";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Failed to initialize HTTP client: {0}")]
    ClientInit(#[from] reqwest::Error),

    #[error("Invalid API URL {0}: {1}")]
    InvalidUrl(String, url::ParseError),

    #[error("Request to {0} failed: {1}")]
    RequestFailed(String, reqwest::Error),

    #[error("Session rejected by server, log in again")]
    Unauthorized,

    #[error("Request to {path} failed with HTTP status {status}: {detail}")]
    Status {
        path: String,
        status: StatusCode,
        detail: String,
    },

    #[error("Invalid payload format from {0}")]
    InvalidPayload(String),

    #[error("Cannot decode response from {0}: {1}")]
    Decode(String, serde_json::Error),

    #[error("No class selected")]
    NoClassSelected,

    #[error("Not logged in")]
    NotLoggedIn,

    #[error(transparent)]
    Session(#[from] SessionError),
}

pub struct ApiClient {
    client: Client,
    base: Url,
    session: SharedSession,
}

impl ApiClient {
    pub fn new(config: &FetcherConfig, session: SharedSession) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let mut base = Url::parse(&config.api_base)
            .map_err(|e| ApiError::InvalidUrl(config.api_base.clone(), e))?;

        // Url::join replaces the last segment unless the path ends in '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self {
            client,
            base,
            session,
        })
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let value = self.send(Method::GET, path, query, None::<&()>).await?;
        decode(path, value)
    }

    /// GET that must answer with a JSON object
    pub async fn get_object<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let value = self.send(Method::GET, path, query, None::<&()>).await?;
        if !value.is_object() {
            return Err(ApiError::InvalidPayload(path.to_string()));
        }
        decode(path, value)
    }

    pub async fn post<B, T>(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: &B,
    ) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let value = self.send(Method::POST, path, query, Some(body)).await?;
        decode(path, value)
    }

    async fn send<B>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<Value, ApiError>
    where
        B: Serialize + ?Sized,
    {
        let context = self.session.read().await.context();
        let url = self.endpoint(path, query, context.class_id)?;
        debug!("{method} {url}");

        let mut request = self.client.request(method, url);
        if let Some(token) = &context.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response =
            request.send().await.map_err(|e| ApiError::RequestFailed(path.to_string(), e))?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED && !path.contains(LOGIN_PATH) {
            self.reject_credentials().await;
            return Err(ApiError::Unauthorized);
        }

        let text = response.text().await.map_err(|e| ApiError::RequestFailed(path.to_string(), e))?;
        if !status.is_success() {
            return Err(ApiError::Status {
                path: path.to_string(),
                status,
                detail: error_detail(status, &text),
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|_| ApiError::InvalidPayload(path.to_string()))
    }

    /// Resolve `path` against the base and add the selected class unless the caller chose one
    fn endpoint(
        &self,
        path: &str,
        query: &[(&str, String)],
        class_id: Option<ClassId>,
    ) -> Result<Url, ApiError> {
        let mut url = self
            .base
            .join(path.trim_start_matches('/'))
            .map_err(|e| ApiError::InvalidUrl(path.to_string(), e))?;

        let mut pairs: Vec<(&str, String)> = query.to_vec();
        if let Some(class_id) = class_id {
            if !pairs.iter().any(|(key, _)| *key == CLASS_ID_PARAM) {
                pairs.push((CLASS_ID_PARAM, class_id.to_string()));
            }
        }

        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }
        Ok(url)
    }

    async fn reject_credentials(&self) {
        warn!("Server rejected the session token, clearing credentials");
        let mut session = self.session.write().await;
        if let Err(e) = session.update(Session::clear_credentials).await {
            error!("Cannot persist cleared session: {e}");
        }
    }
}

fn decode<T: DeserializeOwned>(path: &str, value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::Decode(path.to_string(), e))
}

/// Pull the server's `detail` message out of an error body
fn error_detail(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => match map.get("detail") {
            Some(Value::String(detail)) => detail.clone(),
            Some(other) => other.to_string(),
            None => body.to_string(),
        },
        _ if !body.trim().is_empty() => body.trim().to_string(),
        _ => status.canonical_reason().unwrap_or("unknown error").to_string(),
    }
}
