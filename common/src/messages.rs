//! Definition of the real-time wire messages
//!
//! Every inbound text frame is either a reserved heartbeat control payload or
//! a JSON envelope `{"type": <tag>, "data": <payload>}`. `Frame::parse`
//! classifies a frame so that control payloads can be filtered before the
//! reducer ever sees them.

use crate::types::{DebateProgress, Stage, Team};
use serde::Deserialize;
use thiserror::Error;

/// Heartbeat probe sent by the client
pub const PING: &str = "ping";

/// Heartbeat acknowledgment sent by the server
pub const PONG: &str = "pong";

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not a JSON message envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("payload of '{tag}' message is malformed: {source}")]
    Payload {
        tag: String,
        source: serde_json::Error,
    },

    #[error("'{0}' message carries no stage")]
    MissingStage(String),
}

/// Reserved heartbeat payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    Ping,
    Pong,
}

/// A classified inbound text frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ControlFrame),
    Message(InboundMessage),
}

impl Frame {
    /// Classify a raw text frame
    pub fn parse(text: &str) -> Result<Frame, FrameError> {
        match text {
            PING => return Ok(Frame::Control(ControlFrame::Ping)),
            PONG => return Ok(Frame::Control(ControlFrame::Pong)),
            _ => {}
        }

        let envelope: Envelope = serde_json::from_str(text)?;
        match envelope.tag.as_str() {
            PONG => Ok(Frame::Control(ControlFrame::Pong)),
            PING => Ok(Frame::Control(ControlFrame::Ping)),
            _ => InboundMessage::from_envelope(envelope).map(Frame::Message),
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    tag: String,

    #[serde(default)]
    data: serde_json::Value,
}

/// Stage change broadcast (`state_update` / `STATE_UPDATE`)
#[derive(Debug, Clone, PartialEq)]
pub struct StageUpdate {
    pub stage: Stage,
    pub current_team: Option<Team>,

    /// None when the server left the slot count out
    pub slots_remaining: Option<u32>,

    /// Snatch window start, milliseconds since the Unix epoch
    pub window_start: Option<u64>,
}

#[derive(Deserialize)]
struct RawStageUpdate {
    current_stage: Option<Stage>,
    stage: Option<Stage>,
    current_team: Option<Team>,
    current_team_id: Option<u64>,
    current_team_name: Option<String>,
    current_team_topic: Option<String>,
    snatch_slots_remaining: Option<u32>,
    snatch_start_time: Option<u64>,
}

/// Debate stage and progress broadcast (`debate_update`)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DebateUpdate {
    #[serde(default)]
    pub stage: Option<Stage>,

    #[serde(default)]
    pub progress: Option<DebateProgress>,
}

/// Judge score submission counter (`SCORE_PROGRESS`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ScoreProgressUpdate {
    pub submitted_count: u64,
    pub total_count: u64,
}

/// Remaining snatch slots (`SNATCH_UPDATE`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SnatchUpdate {
    pub slots_remaining: u32,
}

/// Server countdown tick (`TIMER_UPDATE`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TimerUpdate {
    pub countdown: u32,
}

/// Inbound real-time message, one variant per known tag
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    StageUpdate(StageUpdate),
    DebateUpdate(DebateUpdate),
    ScoreProgress(ScoreProgressUpdate),
    SnatchUpdate(SnatchUpdate),
    TimerUpdate(TimerUpdate),

    /// Question payload, forwarded to listeners as-is
    NewQuestion(serde_json::Value),

    /// Tag this client does not know about
    Unknown(String),
}

impl InboundMessage {
    fn from_envelope(envelope: Envelope) -> Result<Self, FrameError> {
        let Envelope { tag, data } = envelope;
        let message = match tag.as_str() {
            "state_update" | "STATE_UPDATE" => {
                let raw: RawStageUpdate = decode(&tag, data)?;
                InboundMessage::StageUpdate(raw.into_update(&tag)?)
            }
            "debate_update" => InboundMessage::DebateUpdate(decode(&tag, data)?),
            "SCORE_PROGRESS" => InboundMessage::ScoreProgress(decode(&tag, data)?),
            "SNATCH_UPDATE" => InboundMessage::SnatchUpdate(decode(&tag, data)?),
            "TIMER_UPDATE" => InboundMessage::TimerUpdate(decode(&tag, data)?),
            "NEW_QUESTION" => InboundMessage::NewQuestion(data),
            _ => InboundMessage::Unknown(tag),
        };
        Ok(message)
    }

    /// Wire tag, for logging
    pub fn tag(&self) -> &str {
        match self {
            InboundMessage::StageUpdate(_) => "state_update",
            InboundMessage::DebateUpdate(_) => "debate_update",
            InboundMessage::ScoreProgress(_) => "SCORE_PROGRESS",
            InboundMessage::SnatchUpdate(_) => "SNATCH_UPDATE",
            InboundMessage::TimerUpdate(_) => "TIMER_UPDATE",
            InboundMessage::NewQuestion(_) => "NEW_QUESTION",
            InboundMessage::Unknown(tag) => tag,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    tag: &str,
    data: serde_json::Value,
) -> Result<T, FrameError> {
    serde_json::from_value(data).map_err(|source| FrameError::Payload {
        tag: tag.to_string(),
        source,
    })
}

impl RawStageUpdate {
    fn into_update(self, tag: &str) -> Result<StageUpdate, FrameError> {
        // current_stage is what the admin router sends; the broadcaster uses stage
        let stage = self
            .current_stage
            .or(self.stage)
            .ok_or_else(|| FrameError::MissingStage(tag.to_string()))?;

        let current_team = self.current_team.or_else(|| {
            self.current_team_id.map(|id| Team {
                id,
                name: self.current_team_name,
                topic: self.current_team_topic,
            })
        });

        Ok(StageUpdate {
            stage,
            current_team,
            slots_remaining: self.snatch_slots_remaining,
            window_start: self.snatch_start_time,
        })
    }
}
