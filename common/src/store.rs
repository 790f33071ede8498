//! Shared reactive state store
//!
//! Observers hold a `watch::Receiver<StateSnapshot>` and see every change
//! the moment it is applied. Questions are not state and go out on a
//! broadcast channel instead.

use crate::messages::InboundMessage;
use crate::snapshot::{reduce, StateSnapshot};
use crate::types::{DebateProgressState, SystemState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::debug;

const QUESTION_CHANNEL_CAPACITY: usize = 64;

struct StoreInner {
    snapshot: watch::Sender<StateSnapshot>,
    questions: broadcast::Sender<serde_json::Value>,
    messages_applied: AtomicU64,
}

/// Cloneable handle on the single shared snapshot
#[derive(Clone)]
pub struct SystemStore {
    inner: Arc<StoreInner>,
}

impl Default for SystemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemStore {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(StateSnapshot::default());
        let (questions, _) = broadcast::channel(QUESTION_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                snapshot,
                questions,
                messages_applied: AtomicU64::new(0),
            }),
        }
    }

    /// Copy of the current snapshot
    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn subscribe_questions(&self) -> broadcast::Receiver<serde_json::Value> {
        self.inner.questions.subscribe()
    }

    /// Number of real-time messages that went through the reducer
    pub fn messages_applied(&self) -> u64 {
        self.inner.messages_applied.load(Ordering::Relaxed)
    }

    /// Run one real-time message through the reducer, returns true if the snapshot changed
    pub fn apply(&self, message: &InboundMessage) -> bool {
        self.inner.messages_applied.fetch_add(1, Ordering::Relaxed);

        let mut question = None;
        let changed = self.inner.snapshot.send_if_modified(|snapshot| {
            let reduction = reduce(snapshot, message);
            question = reduction.question;
            snapshot.apply(reduction.patch)
        });

        if let Some(question) = question {
            if self.inner.questions.send(question).is_err() {
                debug!("No question listeners");
            }
        }
        changed
    }

    /// Overwrite from an authoritative read
    pub fn reconcile(&self, state: &SystemState) -> bool {
        self.inner.snapshot.send_if_modified(|snapshot| snapshot.reconcile(state))
    }

    pub fn set_debate_progress(&self, progress: DebateProgressState) -> bool {
        self.inner.snapshot.send_if_modified(|snapshot| {
            if snapshot.debate_progress.as_ref() == Some(&progress) {
                return false;
            }
            snapshot.debate_progress = Some(progress);
            true
        })
    }

    /// Back to initial values, on logout only
    pub fn reset(&self) {
        self.inner.snapshot.send_if_modified(|snapshot| {
            let changed = *snapshot != StateSnapshot::default();
            snapshot.reset();
            changed
        });
    }
}
