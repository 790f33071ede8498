//! Podium state fetcher module
//! Reads authoritative class state over REST and overwrites the shared snapshot

mod api;
mod auth;
mod configuration;

use std::sync::Arc;

use anyhow::Result;
use config::Config;
use podium_common::session::{Session, SessionStore};
use podium_common::{ClassId, DebateProgress, DebateProgressState, SystemState, SystemStore};
use tokio::sync::RwLock;
use tracing::{error, info, info_span, warn, Instrument};

pub use crate::api::{ApiClient, ApiError, SharedSession, LOGIN_PATH};
pub use crate::configuration::FetcherConfig;

pub const STATE_PATH: &str = "/admin/state";
pub const DEBATE_PROGRESS_PATH: &str = "/admin/debate/progress";

const NO_CLASS_MARKER: &str = "No class selected";

/// Open the configured session file, or an in-memory session if none is configured
pub async fn open_session(config: &FetcherConfig) -> Result<SharedSession> {
    let store = match &config.session_file {
        Some(path) => SessionStore::open(path).await?,
        None => SessionStore::ephemeral(Session::default()),
    };
    Ok(Arc::new(RwLock::new(store)))
}

/// Reconciliation fetcher
pub struct StateFetcher {
    api: ApiClient,
    store: SystemStore,
}

impl StateFetcher {
    pub fn new(api: ApiClient, store: SystemStore) -> Self {
        Self { api, store }
    }

    /// Build from configuration, sharing `session` with the caller
    pub fn try_load(config: &Config, session: SharedSession, store: SystemStore) -> Result<Self> {
        let cfg = FetcherConfig::try_load(config)?;
        info!("Using API at {}", cfg.api_base);
        Ok(Self::new(ApiClient::new(&cfg, session)?, store))
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn store(&self) -> &SystemStore {
        &self.store
    }

    /// Replace stage, team, slots and countdown from `GET /admin/state`
    ///
    /// Without a class this fails straight away. On any failure the snapshot
    /// keeps its last known values.
    pub async fn fetch_state(&self, class_id: Option<ClassId>) -> Result<SystemState, ApiError> {
        let Some(class_id) = class_id else {
            error!("Cannot fetch state: no class selected");
            return Err(ApiError::NoClassSelected);
        };

        let span = info_span!("state_fetcher.fetch_state", %class_id);
        async {
            let query = [("class_id", class_id.to_string())];
            match self.api.get_object::<SystemState>(STATE_PATH, &query).await {
                Ok(state) => {
                    let changed = self.store.reconcile(&state);
                    info!(stage = %state.current_stage, changed, "Reconciled class state");
                    Ok(state)
                }
                Err(e) => {
                    error!("Failed to fetch class state: {e}");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Refresh debate progress from `GET /admin/debate/progress`
    ///
    /// Never fails: a failed read leaves an error marker in the debate
    /// progress field and the rest of the snapshot untouched.
    pub async fn fetch_debate_progress(&self, class_id: Option<ClassId>) -> DebateProgressState {
        let state = match class_id {
            None => {
                warn!("Cannot fetch debate progress: no class selected");
                DebateProgressState::Error(NO_CLASS_MARKER.to_string())
            }
            Some(class_id) => {
                let query = [("class_id", class_id.to_string())];
                match self.api.get_object::<DebateProgress>(DEBATE_PROGRESS_PATH, &query).await {
                    Ok(progress) => DebateProgressState::Loaded(progress),
                    Err(e) => {
                        warn!(%class_id, "Failed to fetch debate progress: {e}");
                        DebateProgressState::Error(e.to_string())
                    }
                }
            }
        };

        self.store.set_debate_progress(state.clone());
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::{config_for, logged_in, shared};
    use podium_common::{Stage, StateSnapshot};
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(server: &MockServer, store: &SystemStore) -> StateFetcher {
        let api = ApiClient::new(&config_for(server), shared(logged_in(Some(3)))).unwrap();
        StateFetcher::new(api, store.clone())
    }

    fn state_body(stage: &str, countdown: Option<u32>) -> serde_json::Value {
        json!({
            "class_id": 3,
            "current_stage": stage,
            "current_team_id": 8,
            "current_team_name": "Team08",
            "current_team_topic": null,
            "snatch_slots_remaining": 2,
            "snatch_start_time": null,
            "countdown": countdown,
            "teacher_avg_score": null,
            "student_avg_score": null,
            "final_score": null
        })
    }

    async fn mount_state(server: &MockServer, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path(STATE_PATH))
            .and(query_param("class_id", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn fetch_state_overwrites_snapshot() {
        let server = MockServer::start().await;
        mount_state(&server, state_body("PRESENTATION", None)).await;
        let store = SystemStore::new();

        let state = fetcher(&server, &store).fetch_state(Some(ClassId(3))).await.unwrap();
        assert_eq!(state.current_stage, Stage::Presentation);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.stage, Stage::Presentation);
        assert_eq!(snapshot.current_team.map(|t| t.id), Some(8));
        assert_eq!(snapshot.remaining_slots, 2);
    }

    #[tokio::test]
    async fn missing_countdown_outside_snatch_window_is_zeroed() {
        let server = MockServer::start().await;
        mount_state(&server, state_body("IDLE", None)).await;
        let store = SystemStore::new();
        store.apply(&podium_common::InboundMessage::TimerUpdate(
            podium_common::messages::TimerUpdate { countdown: 14 },
        ));

        fetcher(&server, &store).fetch_state(Some(ClassId(3))).await.unwrap();
        assert_eq!(store.snapshot().countdown_seconds, 0);
    }

    #[tokio::test]
    async fn missing_countdown_in_snatch_window_is_kept() {
        let server = MockServer::start().await;
        mount_state(&server, state_body("QNA_SNATCH", None)).await;
        let store = SystemStore::new();
        store.apply(&podium_common::InboundMessage::TimerUpdate(
            podium_common::messages::TimerUpdate { countdown: 14 },
        ));

        fetcher(&server, &store).fetch_state(Some(ClassId(3))).await.unwrap();
        assert_eq!(store.snapshot().countdown_seconds, 14);
    }

    #[tokio::test]
    async fn fetch_state_without_class_fails_fast() {
        let server = MockServer::start().await;
        let store = SystemStore::new();

        let result = fetcher(&server, &store).fetch_state(None).await;
        assert!(matches!(result, Err(ApiError::NoClassSelected)));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_fetch_keeps_last_known_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(STATE_PATH))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let store = SystemStore::new();

        let result = fetcher(&server, &store).fetch_state(Some(ClassId(3))).await;
        assert!(matches!(result, Err(ApiError::Status { .. })));
        assert_eq!(store.snapshot(), StateSnapshot::default());
    }

    #[tokio::test]
    async fn debate_progress_is_stored() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DEBATE_PROGRESS_PATH))
            .and(query_param("class_id", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "contest_id": 1,
                "voting_enabled": {"pre_voting": true},
                "pre_voting_progress": {"total": 30, "submitted": 12, "percentage": 40}
            })))
            .mount(&server)
            .await;
        let store = SystemStore::new();

        let state = fetcher(&server, &store).fetch_debate_progress(Some(ClassId(3))).await;
        let progress = state.progress().unwrap();
        assert!(progress.voting_enabled.pre_voting);
        assert_eq!(progress.pre_voting_progress.submitted, 12);
        assert_eq!(store.snapshot().debate_progress, Some(state));
    }

    #[tokio::test]
    async fn debate_progress_failure_leaves_marker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DEBATE_PROGRESS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([1, 2])))
            .mount(&server)
            .await;
        let store = SystemStore::new();

        let state = fetcher(&server, &store).fetch_debate_progress(Some(ClassId(3))).await;
        assert!(state.error().unwrap().contains("Invalid payload format"));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.debate_progress, Some(state));
        assert_eq!(snapshot.stage, Stage::Idle);
    }

    #[tokio::test]
    async fn debate_progress_without_class_leaves_marker() {
        let server = MockServer::start().await;
        let store = SystemStore::new();

        let state = fetcher(&server, &store).fetch_debate_progress(None).await;
        assert_eq!(state.error(), Some(NO_CLASS_MARKER));
    }

    #[tokio::test]
    async fn in_memory_session_without_file() {
        let config = FetcherConfig {
            api_base: "http://127.0.0.1:8000".to_string(),
            request_timeout_secs: 10,
            session_file: None,
        };
        let session = open_session(&config).await.unwrap();
        assert!(!session.try_read().unwrap().session().is_logged_in());
    }
}
