//! Core type definitions for Podium

use std::fmt;

/// Class identifier, the tenant that scopes both REST and real-time state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ClassId(pub u64);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ClassId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Competition stage as broadcast by the server
///
/// Stages the server adds later arrive as `Other` so the client keeps
/// working with an unknown stage name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Stage {
    #[default]
    Idle,
    Presentation,
    QnaSnatch,
    QnaInput,
    ScoringTeacher,
    ScoringStudent,
    Finished,
    PreVoting,
    DebateInProgress,
    PostVoting,
    JudgeScoring,
    ResultsSealed,
    ResultsRevealed,
    Other(String),
}

impl Stage {
    /// True for the timed snatch window, the only stage where a countdown means anything
    pub fn is_snatch_window(&self) -> bool {
        matches!(self, Stage::QnaSnatch)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Stage::Idle => "IDLE",
            Stage::Presentation => "PRESENTATION",
            Stage::QnaSnatch => "QNA_SNATCH",
            Stage::QnaInput => "QNA_INPUT",
            Stage::ScoringTeacher => "SCORING_TEACHER",
            Stage::ScoringStudent => "SCORING_STUDENT",
            Stage::Finished => "FINISHED",
            Stage::PreVoting => "PRE_VOTING",
            Stage::DebateInProgress => "DEBATE_IN_PROGRESS",
            Stage::PostVoting => "POST_VOTING",
            Stage::JudgeScoring => "JUDGE_SCORING",
            Stage::ResultsSealed => "RESULTS_SEALED",
            Stage::ResultsRevealed => "RESULTS_REVEALED",
            Stage::Other(name) => name,
        }
    }
}

impl From<String> for Stage {
    fn from(name: String) -> Self {
        match name.as_str() {
            "IDLE" => Stage::Idle,
            "PRESENTATION" => Stage::Presentation,
            "QNA_SNATCH" => Stage::QnaSnatch,
            "QNA_INPUT" => Stage::QnaInput,
            "SCORING_TEACHER" => Stage::ScoringTeacher,
            "SCORING_STUDENT" => Stage::ScoringStudent,
            "FINISHED" => Stage::Finished,
            "PRE_VOTING" => Stage::PreVoting,
            "DEBATE_IN_PROGRESS" => Stage::DebateInProgress,
            "POST_VOTING" => Stage::PostVoting,
            "JUDGE_SCORING" => Stage::JudgeScoring,
            "RESULTS_SEALED" => Stage::ResultsSealed,
            "RESULTS_REVEALED" => Stage::ResultsRevealed,
            _ => Stage::Other(name),
        }
    }
}

impl From<&str> for Stage {
    fn from(name: &str) -> Self {
        Stage::from(name.to_string())
    }
}

impl From<Stage> for String {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Team currently presenting or being questioned
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Team {
    /// User id of the team account
    pub id: u64,

    /// Display name
    #[serde(default)]
    pub name: Option<String>,

    /// Presentation topic
    #[serde(default)]
    pub topic: Option<String>,
}

/// Judge score submission progress for the current team
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ScoreProgress {
    pub submitted: u64,
    pub total: u64,
}

/// Which voting and scoring channels are open
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct VotingEnabled {
    pub pre_voting: bool,
    pub post_voting: bool,
    pub judge_scoring: bool,
}

/// Submission counter for one voting or scoring phase
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PhaseProgress {
    pub total: u64,
    pub submitted: u64,
    pub percentage: u64,
}

/// Debate voting and scoring progress
///
/// The server answers with an empty object while no contest exists, which
/// decodes to all-default fields.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DebateProgress {
    pub voting_enabled: VotingEnabled,
    pub pre_voting_progress: PhaseProgress,
    pub post_voting_progress: PhaseProgress,
    pub judge_scoring_progress: PhaseProgress,
}

/// Debate progress slot of the snapshot: either a value or a visible error marker
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateProgressState {
    Loaded(DebateProgress),
    Error(String),
}

impl DebateProgressState {
    pub fn progress(&self) -> Option<&DebateProgress> {
        match self {
            DebateProgressState::Loaded(progress) => Some(progress),
            DebateProgressState::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            DebateProgressState::Loaded(_) => None,
            DebateProgressState::Error(message) => Some(message),
        }
    }
}

/// Authoritative class state returned by `GET /admin/state`
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SystemState {
    pub class_id: ClassId,

    pub current_stage: Stage,

    #[serde(default)]
    pub current_team_id: Option<u64>,

    #[serde(default)]
    pub current_team_name: Option<String>,

    #[serde(default)]
    pub current_team_topic: Option<String>,

    pub snatch_slots_remaining: u32,

    /// Snatch window start, milliseconds since the Unix epoch
    #[serde(default)]
    pub snatch_start_time: Option<u64>,

    /// Seconds left on the server countdown, if one is running
    #[serde(default)]
    pub countdown: Option<u32>,
}

impl SystemState {
    pub fn current_team(&self) -> Option<Team> {
        self.current_team_id.map(|id| Team {
            id,
            name: self.current_team_name.clone(),
            topic: self.current_team_topic.clone(),
        })
    }
}
