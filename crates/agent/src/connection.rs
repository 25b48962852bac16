//! Coordinator link driver.
//!
//! Connects (with backoff), registers the worker, then multiplexes with
//! `tokio::select!`:
//!
//! - inbound WebSocket frames, parsed and dispatched to the agent
//! - outbound events queued by sessions, written to the socket
//! - session lifecycle events, applied to the agent
//! - a registration retry tick while unacknowledged
//!
//! When the socket drops the agent is told (it stops its session and
//! becomes unregistered) and the loop reconnects. Cancellation ends
//! everything after stopping the active session.

use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::agent::WorkerAgent;
use crate::client::{ClientError, CoordinatorClient};
use crate::messages::{parse_inbound, OutboundMessage};
use crate::reconnect::{connect_with_backoff, Backoff, ReconnectConfig};
use crate::session::SessionEvent;

/// Interval between `register` retries while unacknowledged.
pub const REGISTER_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Why a single connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEnd {
    /// The socket closed or failed; reconnect.
    Lost,
    /// Shutdown was requested.
    Cancelled,
}

/// Channels the link pumps besides the socket itself.
pub struct LinkChannels {
    pub outbound: mpsc::Receiver<OutboundMessage>,
    pub session_events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Run the worker until `cancel` fires.
pub async fn run(
    client: &CoordinatorClient,
    agent: &mut WorkerAgent,
    channels: &mut LinkChannels,
    cancel: &CancellationToken,
) {
    loop {
        tracing::info!(
            worker_id = %agent.worker_id(),
            url = client.ws_url(),
            "Connecting to coordinator",
        );
        let mut backoff = Backoff::new(ReconnectConfig::default());
        let Some(conn) =
            connect_with_backoff(client.worker_id(), &mut backoff, cancel, move || client.connect())
                .await
        else {
            break;
        };

        let end = drive(conn.ws_stream, agent, channels, cancel).await;
        tracing::warn!(
            worker_id = %agent.worker_id(),
            conn_id = %conn.conn_id,
            ?end,
            "Coordinator link ended",
        );
        agent.on_disconnected().await;

        if end == LinkEnd::Cancelled {
            break;
        }
    }

    agent.shutdown().await;
    tracing::info!(worker_id = %agent.worker_id(), "Worker stopped");
}

/// Drive one established connection until it drops or `cancel` fires.
pub async fn drive<S>(
    ws: S,
    agent: &mut WorkerAgent,
    channels: &mut LinkChannels,
    cancel: &CancellationToken,
) -> LinkEnd
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    if let Err(e) = send_json(&mut sink, &agent.register_message()).await {
        tracing::error!(error = %e, "Failed to send registration");
        return LinkEnd::Lost;
    }

    let mut register_tick = tokio::time::interval_at(
        tokio::time::Instant::now() + REGISTER_RETRY_INTERVAL,
        REGISTER_RETRY_INTERVAL,
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = sink.send(Message::Close(None)).await {
                    tracing::debug!(error = %e, "Close frame not sent");
                }
                return LinkEnd::Cancelled;
            }
            Some(event) = channels.session_events.recv() => {
                agent.on_session_event(event);
            }
            Some(message) = channels.outbound.recv() => {
                if let Err(e) = send_json(&mut sink, &message).await {
                    tracing::error!(kind = message.kind(), error = %e, "Failed to send event");
                    return LinkEnd::Lost;
                }
            }
            _ = register_tick.tick(), if agent.needs_registration() => {
                tracing::info!(worker_id = %agent.worker_id(), "Retrying registration");
                if let Err(e) = send_json(&mut sink, &agent.register_message()).await {
                    tracing::error!(error = %e, "Failed to send registration");
                    return LinkEnd::Lost;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => handle_text(agent, &text).await,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // Handled automatically by tungstenite.
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "Coordinator closed WebSocket");
                        return LinkEnd::Lost;
                    }
                    Some(Ok(_)) => {
                        // Binary / raw frames are not part of the protocol.
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "WebSocket receive error");
                        return LinkEnd::Lost;
                    }
                    None => {
                        tracing::info!("WebSocket stream exhausted");
                        return LinkEnd::Lost;
                    }
                }
            }
        }
    }
}

/// Parse and dispatch one text frame.
async fn handle_text(agent: &mut WorkerAgent, text: &str) {
    match parse_inbound(text) {
        Ok(message) => agent.handle_inbound(message).await,
        Err(e) => {
            tracing::warn!(error = %e, raw = %text, "Unknown or malformed message");
        }
    }
}

/// Serialise `message` and send it as a text frame.
async fn send_json<S>(sink: &mut S, message: &OutboundMessage) -> Result<(), ClientError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(message)?;
    tracing::trace!(kind = message.kind(), "Sending");
    sink.send(Message::Text(json)).await?;
    Ok(())
}
