//! `streamsight-agent` -- one analysis worker.
//!
//! Connects to the coordinator over WebSocket, registers its worker id,
//! and runs at most one detection session at a time. Every flag can also
//! be given as an environment variable (see `--help`); a `.env` file in
//! the working directory is loaded first.
//!
//! Exit status is 1 when configuration is invalid or the detector cannot be
//! warmed up, so a supervisor sees a failed start.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streamsight_agent::agent::WorkerAgent;
use streamsight_agent::client::CoordinatorClient;
use streamsight_agent::config::AgentConfig;
use streamsight_agent::connection::{self, LinkChannels};
use streamsight_agent::detector::{Detector, HttpDetector};
use streamsight_agent::publish;
use streamsight_agent::session::SessionContext;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamsight_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AgentConfig::parse();
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    }

    tracing::info!(
        worker_id = %config.worker_id,
        server = %config.server,
        model = %config.model,
        detector_url = %config.detector_url,
        "Starting streamsight-agent",
    );

    let detector = match HttpDetector::new(config.detector_url.clone(), config.model.clone()) {
        Ok(detector) => detector,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build detector client");
            std::process::exit(1);
        }
    };
    if let Err(e) = detector.warm_up().await {
        tracing::error!(error = %e, "Detector warm-up failed");
        std::process::exit(1);
    }

    let (sink, outbound) = publish::channel(config.publish_buffer);
    let ctx = SessionContext {
        opener: Arc::new(config.opener()),
        detector: Arc::new(detector),
        sink,
        settings: config.session_settings(),
    };

    let (mut agent, session_events) = WorkerAgent::new(config.agent_options(), ctx);
    let mut channels = LinkChannels {
        outbound,
        session_events,
    };
    let client = CoordinatorClient::new(config.worker_id.clone(), config.server.clone());

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        signal_cancel.cancel();
    });

    connection::run(&client, &mut agent, &mut channels, &cancel).await;
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
