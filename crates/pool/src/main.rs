//! `streamsight-pool` -- keeps N `streamsight-agent` processes running.
//!
//! Exits 0 after a clean shutdown (SIGINT / SIGTERM) and 1 when the pool
//! cannot be started.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streamsight_pool::cli::PoolArgs;
use streamsight_pool::supervisor::PoolSupervisor;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamsight_pool=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = PoolArgs::parse();
    if args.workers == 0 {
        tracing::error!("--workers must be at least 1");
        std::process::exit(1);
    }

    let launcher = match args.launcher() {
        Ok(launcher) => launcher,
        Err(e) => {
            tracing::error!(error = %e, "Cannot locate agent binary");
            std::process::exit(1);
        }
    };

    tracing::info!(
        workers = args.workers,
        server = %args.server,
        model = %args.model,
        agent_bin = %launcher.agent_bin.display(),
        "Starting streamsight-pool",
    );

    let mut supervisor = PoolSupervisor::new(Arc::new(launcher), args.pool_config());

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        signal_cancel.cancel();
    });

    let started = tokio::select! {
        result = supervisor.start() => result,
        _ = cancel.cancelled() => Ok(()),
    };
    if let Err(e) = started {
        tracing::error!(error = %e, "Pool failed to start");
        supervisor.shutdown_all().await;
        std::process::exit(1);
    }

    supervisor.monitor(&cancel).await;
    supervisor.shutdown_all().await;
    tracing::info!("Pool stopped");
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
