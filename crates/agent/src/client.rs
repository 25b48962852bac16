//! Coordinator WebSocket endpoint.

use std::time::Duration;

use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Upper bound on a single connect + handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot reach coordinator at {url}: {source}")]
    Connect {
        url: String,
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("coordinator at {url} did not answer within {}s", CONNECT_TIMEOUT.as_secs())]
    Timeout { url: String },

    #[error("websocket error: {0}")]
    Protocol(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("cannot encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where and as whom a worker connects.
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    worker_id: String,
    ws_url: String,
}

/// An open link, tagged with a per-connection id for log correlation.
pub struct CoordinatorConnection {
    pub conn_id: String,
    pub ws_stream: WsStream,
}

impl CoordinatorClient {
    pub fn new(worker_id: String, ws_url: String) -> Self {
        Self { worker_id, ws_url }
    }

    /// Worker this client connects as.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Coordinator WebSocket endpoint.
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Open the link, bounded by [`CONNECT_TIMEOUT`].
    pub async fn connect(&self) -> Result<CoordinatorConnection, ClientError> {
        let handshake = connect_async(self.ws_url.as_str());
        let (ws_stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, handshake)
            .await
            .map_err(|_| ClientError::Timeout {
                url: self.ws_url.clone(),
            })?
            .map_err(|source| ClientError::Connect {
                url: self.ws_url.clone(),
                source,
            })?;

        let conn_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(
            worker_id = %self.worker_id,
            conn_id = %conn_id,
            url = %self.ws_url,
            "Connected to coordinator",
        );
        Ok(CoordinatorConnection { conn_id, ws_stream })
    }
}
