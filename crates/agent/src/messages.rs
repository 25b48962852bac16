//! Coordinator wire protocol.
//!
//! Every frame is a JSON object internally tagged by `"type"` (kebab-case)
//! with camelCase fields, e.g.
//! `{"type":"seek","sessionId":"sess_1","time":7.0}`. Messages are
//! validated at the boundary: anything that does not match a variant here
//! is rejected by [`parse_inbound`] and never reaches the agent.

use serde::{Deserialize, Serialize};
use streamsight_core::detection::Detection;
use streamsight_core::types::{SessionId, WorkerId};

// ---------------------------------------------------------------------------
// Inbound (coordinator -> worker)
// ---------------------------------------------------------------------------

/// All control messages a worker understands.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundMessage {
    /// Reply to [`OutboundMessage::Register`].
    WorkerRegistered(WorkerRegistered),

    /// Assign a session to a specific worker.
    StartProcessing(StartProcessing),

    /// Stop the active session. Without a session id it stops whatever
    /// is running.
    StopProcessing(StopProcessing),

    /// Jump the active session to a new offset.
    #[serde(alias = "player-seek")]
    Seek(Seek),

    /// Current time reported by the viewer's player.
    PlayerTime(PlayerTime),

    /// Viewer player state change.
    PlayerState(PlayerStateChange),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRegistered {
    pub worker_id: WorkerId,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartProcessing {
    pub worker_id: WorkerId,
    pub session_id: SessionId,
    #[serde(alias = "videoUrl")]
    pub stream_ref: String,
    /// Seconds into the stream to start from.
    #[serde(default)]
    pub start_offset: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopProcessing {
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seek {
    pub session_id: SessionId,
    pub time: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerTime {
    pub session_id: SessionId,
    pub time: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStateChange {
    pub session_id: SessionId,
    pub state: PlayerState,
}

/// Viewer-side playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    Ended,
    Paused,
    Playing,
    /// Buffering and any future states; ignored by the session loop.
    #[serde(other)]
    Other,
}

/// Parse a coordinator text frame into a typed message.
///
/// Returns `Err` for malformed JSON, unknown `type` values, or missing
/// required fields. Callers should log and continue.
pub fn parse_inbound(text: &str) -> Result<InboundMessage, serde_json::Error> {
    serde_json::from_str(text)
}

// ---------------------------------------------------------------------------
// Outbound (worker -> coordinator)
// ---------------------------------------------------------------------------

/// Everything a worker publishes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundMessage {
    Register(Register),
    StreamStarted(StreamStarted),
    StreamError(StreamError),
    AiBoxes(AiBoxes),
    WorkerError(WorkerError),
    SessionEnded(SessionEnded),
}

impl OutboundMessage {
    /// The session this message belongs to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            OutboundMessage::Register(_) => None,
            OutboundMessage::StreamStarted(m) => Some(&m.session_id),
            OutboundMessage::StreamError(m) => Some(&m.session_id),
            OutboundMessage::AiBoxes(m) => Some(&m.session_id),
            OutboundMessage::WorkerError(m) => Some(&m.session_id),
            OutboundMessage::SessionEnded(m) => Some(&m.session_id),
        }
    }

    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Register(_) => "register",
            OutboundMessage::StreamStarted(_) => "stream-started",
            OutboundMessage::StreamError(_) => "stream-error",
            OutboundMessage::AiBoxes(_) => "ai-boxes",
            OutboundMessage::WorkerError(_) => "worker-error",
            OutboundMessage::SessionEnded(_) => "session-ended",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Register {
    pub worker_id: WorkerId,
    pub model: String,
    /// RFC 3339 process start time; lets the coordinator spot restarts.
    pub started_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStarted {
    pub session_id: SessionId,
    pub stream_ref: String,
    /// Stream length in seconds; 0 for live streams.
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamError {
    pub session_id: SessionId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiBoxes {
    pub session_id: SessionId,
    /// Video time (seconds) of the analysed frame.
    pub timestamp: f64,
    pub boxes: Vec<Detection>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerError {
    pub session_id: SessionId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEnded {
    pub session_id: SessionId,
    pub reason: EndReason,
}

/// Terminal state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    /// End of stream, a read failure, or the viewer's player ended.
    Ended,
    /// A stop or preemption request.
    Stopped,
    Error,
}
