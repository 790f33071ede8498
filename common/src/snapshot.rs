//! Shared state snapshot and the pure message reducer
//!
//! The snapshot is written by exactly two paths: `reduce` + `apply` for
//! real-time messages, and `reconcile` for an authoritative REST read.

use crate::messages::InboundMessage;
use crate::types::{DebateProgressState, ScoreProgress, Stage, SystemState, Team};

/// Snatch slots a fresh class starts with
pub const DEFAULT_SNATCH_SLOTS: u32 = 3;

/// Client view of the class state
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StateSnapshot {
    pub stage: Stage,
    pub current_team: Option<Team>,
    pub remaining_slots: u32,

    /// Snatch window start, milliseconds since the Unix epoch
    pub slot_window_start: Option<u64>,

    pub countdown_seconds: u32,
    pub score_progress: ScoreProgress,
    pub debate_progress: Option<DebateProgressState>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            stage: Stage::Idle,
            current_team: None,
            remaining_slots: DEFAULT_SNATCH_SLOTS,
            slot_window_start: None,
            countdown_seconds: 0,
            score_progress: ScoreProgress::default(),
            debate_progress: None,
        }
    }
}

/// Partial update: `Some` fields are replaced, `None` fields are left alone
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SnapshotPatch {
    pub stage: Option<Stage>,
    pub current_team: Option<Option<Team>>,
    pub remaining_slots: Option<u32>,
    pub slot_window_start: Option<Option<u64>>,
    pub countdown_seconds: Option<u32>,
    pub score_progress: Option<ScoreProgress>,
    pub debate_progress: Option<DebateProgressState>,
}

impl SnapshotPatch {
    pub fn is_empty(&self) -> bool {
        *self == SnapshotPatch::default()
    }

    /// Drop every field that already holds the same value in `current`
    fn without_unchanged(mut self, current: &StateSnapshot) -> Self {
        fn keep_changed<T: PartialEq>(field: &mut Option<T>, current: &T) {
            if field.as_ref() == Some(current) {
                *field = None;
            }
        }

        keep_changed(&mut self.stage, &current.stage);
        keep_changed(&mut self.current_team, &current.current_team);
        keep_changed(&mut self.remaining_slots, &current.remaining_slots);
        keep_changed(&mut self.slot_window_start, &current.slot_window_start);
        keep_changed(&mut self.countdown_seconds, &current.countdown_seconds);
        keep_changed(&mut self.score_progress, &current.score_progress);
        if self.debate_progress.is_some() && self.debate_progress == current.debate_progress {
            self.debate_progress = None;
        }
        self
    }
}

/// Result of reducing one message
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Reduction {
    /// Fields that change
    pub patch: SnapshotPatch,

    /// Question payload to hand to listeners, never stored
    pub question: Option<serde_json::Value>,
}

/// Map one inbound message onto the fields it is authoritative for
pub fn reduce(current: &StateSnapshot, message: &InboundMessage) -> Reduction {
    let mut patch = SnapshotPatch::default();
    let mut question = None;

    match message {
        InboundMessage::StageUpdate(update) => {
            patch.stage = Some(update.stage.clone());
            patch.current_team = Some(update.current_team.clone());
            patch.remaining_slots = update.slots_remaining;
            patch.slot_window_start = Some(update.window_start);
            if !update.stage.is_snatch_window() {
                patch.countdown_seconds = Some(0);
            }
        }
        InboundMessage::DebateUpdate(update) => {
            if let Some(stage) = &update.stage {
                patch.stage = Some(stage.clone());
                if !stage.is_snatch_window() {
                    patch.countdown_seconds = Some(0);
                }
            }
            patch.debate_progress = update.progress.clone().map(DebateProgressState::Loaded);
        }
        InboundMessage::ScoreProgress(update) => {
            patch.score_progress = Some(ScoreProgress {
                submitted: update.submitted_count,
                total: update.total_count,
            });
        }
        InboundMessage::SnatchUpdate(update) => {
            patch.remaining_slots = Some(update.slots_remaining);
        }
        InboundMessage::TimerUpdate(update) => {
            patch.countdown_seconds = Some(update.countdown);
        }
        InboundMessage::NewQuestion(payload) => {
            question = Some(payload.clone());
        }
        InboundMessage::Unknown(_) => {}
    }

    Reduction {
        patch: patch.without_unchanged(current),
        question,
    }
}

impl StateSnapshot {
    /// Apply a partial update, returns true if anything changed
    pub fn apply(&mut self, patch: SnapshotPatch) -> bool {
        if patch.is_empty() {
            return false;
        }
        let before = self.clone();

        if let Some(stage) = patch.stage {
            self.stage = stage;
        }
        if let Some(team) = patch.current_team {
            self.current_team = team;
        }
        if let Some(slots) = patch.remaining_slots {
            self.remaining_slots = slots;
        }
        if let Some(start) = patch.slot_window_start {
            self.slot_window_start = start;
        }
        if let Some(countdown) = patch.countdown_seconds {
            self.countdown_seconds = countdown;
        }
        if let Some(progress) = patch.score_progress {
            self.score_progress = progress;
        }
        if let Some(progress) = patch.debate_progress {
            self.debate_progress = Some(progress);
        }

        *self != before
    }

    /// Replace stage, team, slot and countdown fields from an authoritative read
    pub fn reconcile(&mut self, state: &SystemState) -> bool {
        let before = self.clone();

        self.stage = state.current_stage.clone();
        self.current_team = state.current_team();
        self.remaining_slots = state.snatch_slots_remaining;
        self.slot_window_start = state.snatch_start_time;
        match state.countdown {
            Some(countdown) => self.countdown_seconds = countdown,
            None if !self.stage.is_snatch_window() => self.countdown_seconds = 0,
            None => {}
        }

        *self != before
    }

    /// Back to initial values
    pub fn reset(&mut self) {
        *self = StateSnapshot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{
        DebateUpdate, ScoreProgressUpdate, SnatchUpdate, StageUpdate, TimerUpdate,
    };
    use crate::types::{ClassId, DebateProgress};

    fn run(snapshot: &mut StateSnapshot, message: &InboundMessage) -> Option<serde_json::Value> {
        let reduction = reduce(snapshot, message);
        snapshot.apply(reduction.patch);
        reduction.question
    }

    fn stage_update(stage: &str) -> InboundMessage {
        InboundMessage::StageUpdate(StageUpdate {
            stage: Stage::from(stage),
            current_team: None,
            slots_remaining: Some(3),
            window_start: None,
        })
    }

    fn snatching(slots: u32, countdown: u32) -> StateSnapshot {
        StateSnapshot {
            stage: Stage::QnaSnatch,
            remaining_slots: slots,
            countdown_seconds: countdown,
            ..StateSnapshot::default()
        }
    }

    #[test]
    fn snatch_update_touches_only_slots() {
        let mut snapshot = snatching(3, 12);
        run(
            &mut snapshot,
            &InboundMessage::SnatchUpdate(SnatchUpdate { slots_remaining: 1 }),
        );
        assert_eq!(snapshot, snatching(1, 12));
    }

    #[test]
    fn stage_change_away_from_snatch_clears_countdown() {
        let mut snapshot = snatching(2, 8);
        run(&mut snapshot, &stage_update("VOTING"));
        assert_eq!(snapshot.stage, Stage::Other("VOTING".to_string()));
        assert_eq!(snapshot.countdown_seconds, 0);
    }

    #[test]
    fn countdown_is_zero_after_any_non_snatch_stage_update() {
        let stages = ["QNA_SNATCH", "PRESENTATION", "QNA_SNATCH", "QNA_INPUT", "FINISHED"];
        let mut snapshot = StateSnapshot::default();
        for stage in stages {
            run(
                &mut snapshot,
                &InboundMessage::TimerUpdate(TimerUpdate { countdown: 17 }),
            );
            run(&mut snapshot, &stage_update(stage));
            if snapshot.stage.is_snatch_window() {
                assert_eq!(snapshot.countdown_seconds, 17);
            } else {
                assert_eq!(snapshot.countdown_seconds, 0, "stage {stage}");
            }
        }
    }

    #[test]
    fn stage_update_without_slot_count_keeps_slots() {
        let mut snapshot = snatching(1, 0);
        let message = InboundMessage::StageUpdate(StageUpdate {
            stage: Stage::QnaInput,
            current_team: Some(Team {
                id: 5,
                name: None,
                topic: None,
            }),
            slots_remaining: None,
            window_start: Some(42),
        });
        run(&mut snapshot, &message);
        assert_eq!(snapshot.remaining_slots, 1);
        assert_eq!(snapshot.slot_window_start, Some(42));
        assert_eq!(snapshot.current_team.map(|t| t.id), Some(5));
    }

    #[test]
    fn unknown_tag_changes_nothing() {
        let mut snapshot = snatching(2, 9);
        snapshot.debate_progress = Some(DebateProgressState::Error("boom".to_string()));
        let before = snapshot.clone();

        let reduction = reduce(&snapshot, &InboundMessage::Unknown("FOO".to_string()));
        assert!(reduction.patch.is_empty());
        assert!(reduction.question.is_none());
        assert!(!snapshot.apply(reduction.patch));
        assert_eq!(snapshot, before);
    }

    #[test]
    fn score_progress_replaces_pair() {
        let mut snapshot = StateSnapshot::default();
        run(
            &mut snapshot,
            &InboundMessage::ScoreProgress(ScoreProgressUpdate {
                submitted_count: 4,
                total_count: 6,
            }),
        );
        assert_eq!(
            snapshot.score_progress,
            ScoreProgress {
                submitted: 4,
                total: 6
            }
        );
    }

    #[test]
    fn debate_update_replaces_progress_and_stage() {
        let mut snapshot = snatching(3, 5);
        let progress = DebateProgress::default();
        run(
            &mut snapshot,
            &InboundMessage::DebateUpdate(DebateUpdate {
                stage: Some(Stage::PreVoting),
                progress: Some(progress.clone()),
            }),
        );
        assert_eq!(snapshot.stage, Stage::PreVoting);
        assert_eq!(snapshot.countdown_seconds, 0);
        assert_eq!(
            snapshot.debate_progress,
            Some(DebateProgressState::Loaded(progress))
        );
    }

    #[test]
    fn debate_update_without_progress_keeps_previous() {
        let mut snapshot = StateSnapshot::default();
        snapshot.debate_progress = Some(DebateProgressState::Loaded(DebateProgress::default()));
        let before = snapshot.debate_progress.clone();
        run(
            &mut snapshot,
            &InboundMessage::DebateUpdate(DebateUpdate {
                stage: None,
                progress: None,
            }),
        );
        assert_eq!(snapshot.debate_progress, before);
    }

    #[test]
    fn new_question_is_emitted_not_stored() {
        let mut snapshot = snatching(3, 4);
        let before = snapshot.clone();
        let payload = serde_json::json!({"content": "How?"});
        let question = run(&mut snapshot, &InboundMessage::NewQuestion(payload.clone()));
        assert_eq!(question, Some(payload));
        assert_eq!(snapshot, before);
    }

    #[test]
    fn reduction_omits_fields_that_already_match() {
        let snapshot = snatching(2, 0);
        let reduction = reduce(
            &snapshot,
            &InboundMessage::SnatchUpdate(SnatchUpdate { slots_remaining: 2 }),
        );
        assert!(reduction.patch.is_empty());
    }

    fn system_state(stage: &str, countdown: Option<u32>) -> SystemState {
        SystemState {
            class_id: ClassId(1),
            current_stage: Stage::from(stage),
            current_team_id: None,
            current_team_name: None,
            current_team_topic: None,
            snatch_slots_remaining: 2,
            snatch_start_time: None,
            countdown,
        }
    }

    #[test]
    fn reconcile_without_countdown_outside_snatch_zeroes_it() {
        let mut snapshot = snatching(3, 11);
        snapshot.reconcile(&system_state("IDLE", None));
        assert_eq!(snapshot.stage, Stage::Idle);
        assert_eq!(snapshot.countdown_seconds, 0);
        assert_eq!(snapshot.remaining_slots, 2);
    }

    #[test]
    fn reconcile_without_countdown_in_snatch_keeps_it() {
        let mut snapshot = snatching(3, 11);
        snapshot.reconcile(&system_state("QNA_SNATCH", None));
        assert_eq!(snapshot.countdown_seconds, 11);
    }

    #[test]
    fn reconcile_takes_server_countdown() {
        let mut snapshot = StateSnapshot::default();
        snapshot.reconcile(&system_state("QNA_SNATCH", Some(25)));
        assert_eq!(snapshot.countdown_seconds, 25);
    }

    #[test]
    fn reconcile_leaves_progress_fields_alone() {
        let mut snapshot = StateSnapshot::default();
        snapshot.score_progress = ScoreProgress {
            submitted: 1,
            total: 2,
        };
        snapshot.debate_progress = Some(DebateProgressState::Error("offline".to_string()));
        let expected_score = snapshot.score_progress;
        let expected_debate = snapshot.debate_progress.clone();

        snapshot.reconcile(&system_state("PRESENTATION", None));
        assert_eq!(snapshot.score_progress, expected_score);
        assert_eq!(snapshot.debate_progress, expected_debate);
    }
}
