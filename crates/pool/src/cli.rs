//! Pool command-line interface.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::process::CommandLauncher;
use crate::supervisor::PoolConfig;

/// Name of the agent binary looked up next to the supervisor.
const AGENT_BIN_NAME: &str = "streamsight-agent";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Run and supervise a pool of streamsight agents")]
pub struct PoolArgs {
    /// Number of agents to keep running.
    #[arg(long, env = "STREAMSIGHT_WORKERS", default_value_t = 5)]
    pub workers: usize,

    /// Coordinator WebSocket endpoint, passed to every agent.
    #[arg(long, env = "COORDINATOR_WS_URL", default_value = "ws://localhost:3000/ws/worker")]
    pub server: String,

    /// Detection model, passed to every agent.
    #[arg(long, env = "MODEL_PATH", default_value = "yolov12.pt")]
    pub model: String,

    /// Agent executable. Defaults to `streamsight-agent` next to this binary.
    #[arg(long, env = "STREAMSIGHT_AGENT_BIN")]
    pub agent_bin: Option<PathBuf>,

    /// Seconds between liveness checks.
    #[arg(long, default_value_t = 5)]
    pub monitor_interval_secs: u64,

    /// Milliseconds between agent launches at startup.
    #[arg(long, default_value_t = 1000)]
    pub stagger_ms: u64,

    /// Seconds agents get to exit after SIGTERM before being killed.
    #[arg(long, default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Extra arguments forwarded verbatim to every agent.
    #[arg(last = true)]
    pub agent_args: Vec<String>,
}

impl PoolArgs {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            stagger: Duration::from_millis(self.stagger_ms),
            monitor_interval: Duration::from_secs(self.monitor_interval_secs.max(1)),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }

    /// Resolve the agent binary path.
    pub fn agent_bin(&self) -> std::io::Result<PathBuf> {
        if let Some(bin) = &self.agent_bin {
            return Ok(bin.clone());
        }
        let exe = std::env::current_exe()?;
        let dir = exe.parent().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "current executable has no parent directory",
            )
        })?;
        Ok(dir.join(format!("{AGENT_BIN_NAME}{}", std::env::consts::EXE_SUFFIX)))
    }

    pub fn launcher(&self) -> std::io::Result<CommandLauncher> {
        Ok(CommandLauncher {
            agent_bin: self.agent_bin()?,
            server: self.server.clone(),
            model: self.model.clone(),
            extra_args: self.agent_args.clone(),
        })
    }
}
