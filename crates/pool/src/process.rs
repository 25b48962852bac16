//! Agent process launching and control.
//!
//! The supervisor only sees the [`AgentLauncher`] / [`AgentProcess`]
//! traits, so tests can substitute in-memory processes.
//! [`CommandLauncher`] is the real implementation on top of
//! `tokio::process`.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn agent {worker_id}: {source}")]
    Spawn {
        worker_id: String,
        source: std::io::Error,
    },

    #[error("failed to signal agent: {0}")]
    Signal(std::io::Error),

    #[error("failed to wait for agent: {0}")]
    Wait(std::io::Error),
}

/// How an agent process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// Starts agent processes.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self, worker_id: &str) -> Result<Box<dyn AgentProcess>, LaunchError>;
}

/// A running (or exited) agent process.
#[async_trait]
pub trait AgentProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking liveness check: `Some` once the process has exited.
    fn try_exit(&mut self) -> Result<Option<ExitInfo>, LaunchError>;

    /// Ask the process to exit (SIGTERM on unix).
    fn terminate(&mut self) -> Result<(), LaunchError>;

    /// Force the process down and reap it.
    async fn kill(&mut self) -> Result<(), LaunchError>;

    /// Wait for the process to exit.
    async fn wait(&mut self) -> Result<ExitInfo, LaunchError>;
}

// ---------------------------------------------------------------------------
// OS processes
// ---------------------------------------------------------------------------

/// Launches `streamsight-agent` binaries.
///
/// Each agent gets `--worker-id`, `--server` and `--model`; `extra_args`
/// are passed first, verbatim. Stdio is inherited so agent logs surface in
/// the supervisor's output.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    pub agent_bin: PathBuf,
    pub server: String,
    pub model: String,
    pub extra_args: Vec<String>,
}

#[async_trait]
impl AgentLauncher for CommandLauncher {
    async fn launch(&self, worker_id: &str) -> Result<Box<dyn AgentProcess>, LaunchError> {
        let child = Command::new(&self.agent_bin)
            .args(&self.extra_args)
            .arg("--worker-id")
            .arg(worker_id)
            .arg("--server")
            .arg(&self.server)
            .arg("--model")
            .arg(&self.model)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                worker_id: worker_id.to_string(),
                source,
            })?;

        tracing::info!(worker_id, pid = child.id(), "Agent started");
        Ok(Box::new(ChildProcess { child }))
    }
}

pub struct ChildProcess {
    child: Child,
}

#[async_trait]
impl AgentProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit(&mut self) -> Result<Option<ExitInfo>, LaunchError> {
        self.child
            .try_wait()
            .map(|status| status.map(ExitInfo::from))
            .map_err(LaunchError::Wait)
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<(), LaunchError> {
        let Some(pid) = self.child.id() else {
            // Already reaped.
            return Ok(());
        };
        let pid = libc::pid_t::try_from(pid)
            .map_err(|e| LaunchError::Signal(std::io::Error::other(e)))?;
        // SAFETY: `pid` is a child we spawned and have not reaped yet.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(LaunchError::Signal(std::io::Error::last_os_error()))
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<(), LaunchError> {
        self.child.start_kill().map_err(LaunchError::Signal)
    }

    async fn kill(&mut self) -> Result<(), LaunchError> {
        self.child.kill().await.map_err(LaunchError::Signal)
    }

    async fn wait(&mut self) -> Result<ExitInfo, LaunchError> {
        self.child
            .wait()
            .await
            .map(ExitInfo::from)
            .map_err(LaunchError::Wait)
    }
}
