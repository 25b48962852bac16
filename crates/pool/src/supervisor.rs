//! Fixed-size agent pool supervision.
//!
//! [`PoolSupervisor`] launches `workers` agents named `worker-1..N`,
//! polls them on a fixed interval, and relaunches any that exited under
//! the same worker id. The session an exited agent was running is not
//! recovered; the coordinator notices the loss and reassigns.

use std::sync::Arc;
use std::time::Duration;

use streamsight_core::types::WorkerId;
use streamsight_core::worker::pooled_worker_id;
use tokio_util::sync::CancellationToken;

use crate::process::{AgentLauncher, AgentProcess, ExitInfo, LaunchError};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    /// Delay between consecutive launches at startup.
    pub stagger: Duration,
    pub monitor_interval: Duration,
    /// How long agents get to exit after SIGTERM before being killed.
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            stagger: Duration::from_millis(1000),
            monitor_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("agent {worker_id} exited during startup (exit code {code:?})")]
    EarlyExit {
        worker_id: WorkerId,
        code: Option<i32>,
    },
}

struct ManagedAgent {
    worker_id: WorkerId,
    process: Option<Box<dyn AgentProcess>>,
    restarts: u32,
}

impl ManagedAgent {
    /// Reap the process if it has exited. Returns the exit, if any.
    fn reap(&mut self) -> Option<ExitInfo> {
        let process = self.process.as_mut()?;
        match process.try_exit() {
            Ok(Some(exit)) => {
                self.process = None;
                Some(exit)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(worker_id = %self.worker_id, error = %e, "Liveness check failed");
                None
            }
        }
    }
}

pub struct PoolSupervisor {
    launcher: Arc<dyn AgentLauncher>,
    config: PoolConfig,
    agents: Vec<ManagedAgent>,
    shutting_down: bool,
}

impl PoolSupervisor {
    pub fn new(launcher: Arc<dyn AgentLauncher>, config: PoolConfig) -> Self {
        Self {
            launcher,
            config,
            agents: Vec::new(),
            shutting_down: false,
        }
    }

    /// Launch every agent, `stagger` apart, so model loads do not all
    /// happen at once. Fails if any agent cannot be spawned or exits before
    /// startup completes.
    pub async fn start(&mut self) -> Result<(), SupervisorError> {
        for index in 1..=self.config.workers {
            let worker_id = pooled_worker_id(index);
            let process = self.launcher.launch(&worker_id).await?;
            self.agents.push(ManagedAgent {
                worker_id,
                process: Some(process),
                restarts: 0,
            });

            tokio::time::sleep(self.config.stagger).await;

            for agent in &mut self.agents {
                if let Some(exit) = agent.reap() {
                    return Err(SupervisorError::EarlyExit {
                        worker_id: agent.worker_id.clone(),
                        code: exit.code,
                    });
                }
            }
        }

        tracing::info!(workers = self.agents.len(), "Pool started");
        Ok(())
    }

    /// One liveness pass: relaunch every agent that has exited. Returns the
    /// number of agents relaunched.
    pub async fn check_once(&mut self) -> usize {
        if self.shutting_down {
            return 0;
        }

        let mut relaunched = 0;
        for agent in &mut self.agents {
            if let Some(exit) = agent.reap() {
                tracing::warn!(
                    worker_id = %agent.worker_id,
                    code = ?exit.code,
                    "Agent exited",
                );
            }
            if agent.process.is_some() {
                continue;
            }

            match self.launcher.launch(&agent.worker_id).await {
                Ok(process) => {
                    agent.process = Some(process);
                    agent.restarts += 1;
                    relaunched += 1;
                    tracing::info!(
                        worker_id = %agent.worker_id,
                        restarts = agent.restarts,
                        "Agent restarted",
                    );
                }
                Err(e) => {
                    tracing::error!(
                        worker_id = %agent.worker_id,
                        error = %e,
                        "Agent restart failed, retrying next interval",
                    );
                }
            }
        }
        relaunched
    }

    /// Poll agents every `monitor_interval` until `cancel` fires.
    pub async fn monitor(&mut self, cancel: &CancellationToken) {
        let period = self.config.monitor_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.check_once().await;
                }
            }
        }
    }

    /// SIGTERM every agent, wait up to `shutdown_grace` for them all, then
    /// kill whatever is left. No agent is relaunched afterwards.
    pub async fn shutdown_all(&mut self) {
        self.shutting_down = true;
        tracing::info!(agents = self.running_count(), "Stopping agents");

        for agent in &mut self.agents {
            if let Some(process) = agent.process.as_mut() {
                if let Err(e) = process.terminate() {
                    tracing::warn!(worker_id = %agent.worker_id, error = %e, "Failed to signal agent");
                }
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        for agent in &mut self.agents {
            let Some(mut process) = agent.process.take() else {
                continue;
            };
            match tokio::time::timeout_at(deadline, process.wait()).await {
                Ok(Ok(exit)) => {
                    tracing::info!(worker_id = %agent.worker_id, code = ?exit.code, "Agent stopped");
                }
                Ok(Err(e)) => {
                    tracing::warn!(worker_id = %agent.worker_id, error = %e, "Failed to wait for agent");
                }
                Err(_) => {
                    tracing::warn!(worker_id = %agent.worker_id, "Agent ignored SIGTERM, killing");
                    if let Err(e) = process.kill().await {
                        tracing::error!(worker_id = %agent.worker_id, error = %e, "Failed to kill agent");
                    }
                }
            }
        }
    }

    /// Agents currently alive. Reaps any that have exited.
    pub fn running_count(&mut self) -> usize {
        let mut running = 0;
        for agent in &mut self.agents {
            agent.reap();
            if agent.process.is_some() {
                running += 1;
            }
        }
        running
    }

    pub fn worker_ids(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.worker_id.as_str()).collect()
    }

    /// How many times `worker_id` has been relaunched.
    pub fn restarts(&self, worker_id: &str) -> Option<u32> {
        self.agents
            .iter()
            .find(|a| a.worker_id == worker_id)
            .map(|a| a.restarts)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }
}
