//! Outbound event sink.
//!
//! Sessions never touch the WebSocket directly. They push
//! [`OutboundMessage`]s into a bounded channel that the connection task
//! drains. Publishing is non-blocking: when the channel is full or the
//! link is gone the message is dropped and the caller gets a
//! [`PublishError`], so a slow coordinator can never stall frame analysis.

use tokio::sync::mpsc;

use crate::messages::OutboundMessage;

/// Default channel capacity between sessions and the connection task.
pub const DEFAULT_PUBLISH_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("outbound buffer is full, message dropped")]
    Full,

    #[error("coordinator link is closed")]
    Closed,
}

/// Cloneable handle used by sessions and the agent to emit events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<OutboundMessage>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self { tx }
    }

    /// Queue `message` for delivery without waiting.
    pub fn publish(&self, message: OutboundMessage) -> Result<(), PublishError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PublishError::Full,
            mpsc::error::TrySendError::Closed(_) => PublishError::Closed,
        })
    }

    /// Queue `message` and log instead of failing. Used for lifecycle
    /// events whose loss the coordinator tolerates.
    pub fn publish_or_log(&self, message: OutboundMessage) {
        let kind = message.kind();
        if let Err(e) = self.publish(message) {
            tracing::warn!(kind, error = %e, "Failed to publish event");
        }
    }
}

/// Create a sink and the receiver the connection task drains.
pub fn channel(capacity: usize) -> (EventSink, mpsc::Receiver<OutboundMessage>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSink::new(tx), rx)
}
