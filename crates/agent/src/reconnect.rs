//! Backoff schedule for (re)connecting to the coordinator.
//!
//! The first attempt after a link loss is immediate. Every failed attempt
//! after that waits twice as long as the previous one, capped at 30s.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Delay sequence for one reconnect episode.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    upcoming: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            upcoming: config.initial_delay,
            failures: 0,
        }
    }

    /// Record a failed attempt and return how long to wait before the next.
    pub fn fail(&mut self) -> Duration {
        self.failures += 1;
        let delay = self.upcoming.min(self.config.max_delay);
        let grown = self.upcoming.as_secs_f64() * self.config.multiplier;
        self.upcoming = Duration::try_from_secs_f64(grown)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay);
        delay
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Call `connect` until it succeeds, sleeping per `backoff` between
/// failures. `None` once `cancel` fires.
pub async fn connect_with_backoff<T, E, F, Fut>(
    worker_id: &str,
    backoff: &mut Backoff,
    cancel: &CancellationToken,
    mut connect: F,
) -> Option<T>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return None,
            outcome = connect() => outcome,
        };

        let error = match outcome {
            Ok(link) => return Some(link),
            Err(e) => e,
        };
        let delay = backoff.fail();
        tracing::warn!(
            worker_id,
            attempt = backoff.failures(),
            error = %error,
            retry_in_ms = delay.as_millis() as u64,
            "Coordinator connect failed",
        );

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
