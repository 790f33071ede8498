//! Podium realtime sync module
//! Keeps the shared class snapshot in step with the server: REST first, then
//! the WebSocket feed, with a fresh REST read before every reconnect.

mod configuration;
mod connection;
mod heartbeat;
mod manager;

#[cfg(test)]
mod test_server;

use std::sync::Arc;

use anyhow::Result;
use config::Config;
use futures::FutureExt;
use podium_common::{ClassId, SystemStore};
use podium_module_state_fetcher::{ApiError, SharedSession, StateFetcher};
use thiserror::Error;
use tracing::{info, warn};

pub use crate::configuration::{ConnectionSettings, SyncConfig};
pub use crate::connection::ConnectionId;
pub use crate::heartbeat::HeartbeatMonitor;
pub use crate::manager::{
    endpoint_url, ConnectionManager, ConnectionManagerHandle, ConnectionState, Reconcile,
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("connection manager has shut down")]
    ManagerStopped,

    #[error("invalid real-time endpoint {0}: {1}")]
    InvalidEndpoint(String, url::ParseError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Control flow around the shared snapshot
///
/// `mount` reads the authoritative state and then opens the real-time
/// connection. Messages sent while the socket was down are lost, so every
/// automatic reconnect reads the state again before the new socket opens.
pub struct SyncClient {
    store: SystemStore,
    fetcher: Arc<StateFetcher>,
    connection: ConnectionManagerHandle,
}

impl SyncClient {
    pub fn new(settings: ConnectionSettings, fetcher: StateFetcher) -> Self {
        let store = fetcher.store().clone();
        let fetcher = Arc::new(fetcher);
        let connection = ConnectionManager::spawn_with_reconcile(
            settings,
            store.clone(),
            Some(reconcile_with(fetcher.clone())),
        );

        Self {
            store,
            fetcher,
            connection,
        }
    }

    pub fn try_load(config: &Config, session: SharedSession) -> Result<Self> {
        let cfg = SyncConfig::try_load(config)?;
        info!("Using real-time endpoint {}", cfg.ws_url);
        let fetcher = StateFetcher::try_load(config, session, SystemStore::new())?;
        Ok(Self::new(cfg.settings()?, fetcher))
    }

    pub fn store(&self) -> &SystemStore {
        &self.store
    }

    pub fn connection(&self) -> &ConnectionManagerHandle {
        &self.connection
    }

    pub fn fetcher(&self) -> &StateFetcher {
        &self.fetcher
    }

    pub fn session(&self) -> &SharedSession {
        self.fetcher.api().session()
    }

    async fn class_id(&self) -> Option<ClassId> {
        self.session().read().await.context().class_id
    }

    /// Populate the snapshot, then follow the real-time feed
    pub async fn mount(&self) -> Result<(), SyncError> {
        let class_id = self.class_id().await;
        if self.fetcher.fetch_state(class_id).await.is_err() {
            warn!("Starting from last known state");
        }
        self.fetcher.fetch_debate_progress(class_id).await;
        self.connection.connect(class_id).await
    }

    /// Read the state again and replace the connection, for when the feed looks stale
    pub async fn resync(&self) -> Result<(), SyncError> {
        let class_id = self.class_id().await;
        if self.fetcher.fetch_state(class_id).await.is_err() {
            warn!("Resyncing without fresh state");
        }
        self.connection.reconnect().await
    }

    /// Follow another class with the current token
    pub async fn switch_class(&self, class_id: ClassId, class_name: &str) -> Result<(), SyncError> {
        self.connection.disconnect().await?;
        self.fetcher.api().switch_class(class_id, class_name).await?;
        self.mount().await
    }

    /// Drop the connection, the session and the snapshot
    pub async fn logout(&self) -> Result<(), SyncError> {
        self.connection.disconnect().await?;
        self.fetcher.api().logout().await?;
        self.store.reset();
        Ok(())
    }
}

fn reconcile_with(fetcher: Arc<StateFetcher>) -> Reconcile {
    Arc::new(move |class_id| {
        let fetcher = fetcher.clone();
        async move {
            if fetcher.fetch_state(Some(class_id)).await.is_err() {
                warn!(%class_id, "Reconnecting without fresh state");
            }
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_server::{wait_for_state, TestServer};
    use podium_common::session::{Session, SessionStore};
    use podium_common::{Stage, StateSnapshot};
    use podium_module_state_fetcher::{ApiClient, FetcherConfig, DEBATE_PROGRESS_PATH, STATE_PATH};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::RwLock;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session(class_id: Option<u64>) -> SharedSession {
        Arc::new(RwLock::new(SessionStore::ephemeral(Session {
            token: Some("tok".to_string()),
            current_class_id: class_id.map(ClassId),
            ..Default::default()
        })))
    }

    fn client(ws: &TestServer, rest: &MockServer, session: SharedSession) -> SyncClient {
        let config = FetcherConfig {
            api_base: rest.uri(),
            request_timeout_secs: 5,
            session_file: None,
        };
        let fetcher = StateFetcher::new(ApiClient::new(&config, session).unwrap(), SystemStore::new());
        let settings = ConnectionSettings {
            endpoint: ws.endpoint(),
            reconnect_delay: Duration::from_millis(50),
            heartbeat_interval: Duration::from_secs(60),
        };
        SyncClient::new(settings, fetcher)
    }

    async fn mount_rest(rest: &MockServer, class_id: &str, stage: &str) {
        Mock::given(method("GET"))
            .and(path(STATE_PATH))
            .and(query_param("class_id", class_id))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "class_id": class_id.parse::<u64>().unwrap(),
                "current_stage": stage,
                "snatch_slots_remaining": 3,
                "countdown": null
            })))
            .mount(rest)
            .await;
        Mock::given(method("GET"))
            .and(path(DEBATE_PROGRESS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(rest)
            .await;
    }

    #[tokio::test]
    async fn mount_fetches_then_connects() {
        let mut ws = TestServer::start().await;
        let rest = MockServer::start().await;
        mount_rest(&rest, "4", "PRESENTATION").await;

        let client = client(&ws, &rest, session(Some(4)));
        client.mount().await.unwrap();

        let snapshot = client.store().snapshot();
        assert_eq!(snapshot.stage, Stage::Presentation);
        assert!(snapshot.debate_progress.is_some());

        let conn = ws.next_connection().await;
        assert_eq!(conn.query.as_deref(), Some("class_id=4"));
        wait_for_state(client.connection(), ConnectionState::Open).await;

        conn.send_text(r#"{"type":"STATE_UPDATE","data":{"current_stage":"QNA_SNATCH"}}"#);
        let mut rx = client.store().subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.stage == Stage::QnaSnatch))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn mount_without_class_stays_offline() {
        let ws = TestServer::start().await;
        let rest = MockServer::start().await;

        let client = client(&ws, &rest, session(None));
        client.mount().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(ws.accepted(), 0);
        assert!(rest.received_requests().await.unwrap().is_empty());
        assert_eq!(client.connection().state(), ConnectionState::Idle);
        assert!(client.store().snapshot().debate_progress.unwrap().error().is_some());
    }

    fn state_reads(requests: &[wiremock::Request]) -> usize {
        requests.iter().filter(|r| r.url.path() == STATE_PATH).count()
    }

    #[tokio::test]
    async fn state_is_read_before_reconnecting() {
        let mut ws = TestServer::start().await;
        let rest = MockServer::start().await;
        mount_rest(&rest, "4", "IDLE").await;

        let client = client(&ws, &rest, session(Some(4)));
        client.mount().await.unwrap();
        ws.next_connection().await.close();
        let _second = ws.next_connection().await;

        // One read on mount, one finished before the second socket was opened
        let requests = rest.received_requests().await.unwrap();
        assert_eq!(state_reads(&requests), 2);
    }

    #[tokio::test]
    async fn slow_reconciliation_never_overwrites_live_messages() {
        let mut ws = TestServer::start().await;
        let rest = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(STATE_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"class_id": 4, "current_stage": "IDLE"}))
                    .set_delay(Duration::from_millis(200)),
            )
            .mount(&rest)
            .await;

        let client = client(&ws, &rest, session(Some(4)));
        client.mount().await.unwrap();
        ws.next_connection().await.close();

        let second = ws.next_connection().await;
        wait_for_state(client.connection(), ConnectionState::Open).await;
        second.send_text(r#"{"type":"STATE_UPDATE","data":{"current_stage":"QNA_SNATCH"}}"#);

        let mut rx = client.store().subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.stage == Stage::QnaSnatch))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(client.store().snapshot().stage, Stage::QnaSnatch);
        assert_eq!(state_reads(&rest.received_requests().await.unwrap()), 2);
    }

    #[tokio::test]
    async fn resync_reconnects_even_when_state_read_fails() {
        let mut ws = TestServer::start().await;
        let rest = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(STATE_PATH))
            .respond_with(ResponseTemplate::new(503))
            .mount(&rest)
            .await;

        let client = client(&ws, &rest, session(Some(4)));
        client.mount().await.unwrap();
        let mut first = ws.next_connection().await;
        wait_for_state(client.connection(), ConnectionState::Open).await;

        client.resync().await.unwrap();
        first.wait_closed().await;
        let second = ws.next_connection().await;
        assert_eq!(second.query.as_deref(), Some("class_id=4"));
        assert_eq!(state_reads(&rest.received_requests().await.unwrap()), 2);
        assert_eq!(client.store().snapshot().stage, Stage::Idle);
    }

    #[tokio::test]
    async fn switch_class_moves_the_connection() {
        let mut ws = TestServer::start().await;
        let rest = MockServer::start().await;
        mount_rest(&rest, "4", "IDLE").await;
        mount_rest(&rest, "5", "PRE_VOTING").await;

        let client = client(&ws, &rest, session(Some(4)));
        client.mount().await.unwrap();
        let mut first = ws.next_connection().await;

        client.switch_class(ClassId(5), "Class 5").await.unwrap();
        first.wait_closed().await;
        let second = ws.next_connection().await;
        assert_eq!(second.query.as_deref(), Some("class_id=5"));
        assert_eq!(client.store().snapshot().stage, Stage::PreVoting);
    }

    #[tokio::test]
    async fn logout_resets_everything() {
        let mut ws = TestServer::start().await;
        let rest = MockServer::start().await;
        mount_rest(&rest, "4", "PRESENTATION").await;

        let session = session(Some(4));
        let client = client(&ws, &rest, session.clone());
        client.mount().await.unwrap();
        let mut conn = ws.next_connection().await;

        client.logout().await.unwrap();
        conn.wait_closed().await;
        assert_eq!(client.store().snapshot(), StateSnapshot::default());
        assert!(!session.read().await.session().is_logged_in());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ws.accepted(), 1);
    }
}
