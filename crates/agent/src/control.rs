//! Control signals shared between the agent and a running session.
//!
//! The agent writes (seek, stop, pause, player time) from its message
//! dispatch; the session loop reads them between frames. Every write wakes
//! the session so a pacing sleep is cut short as soon as something changes.
//! Seeks are last-write-wins: only the most recent target is kept.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::messages::EndReason;

#[derive(Debug, Default)]
struct ControlState {
    pending_seek: Option<f64>,
    stop: Option<EndReason>,
    paused: bool,
    player_time: Option<f64>,
}

/// Why an interruptible wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The full duration elapsed.
    Elapsed,
    /// A stop was requested.
    Stop,
    /// A seek is pending.
    Seek,
    /// Pause or resume toggled.
    PauseChanged,
}

#[derive(Debug, Default)]
pub struct SessionControl {
    state: Mutex<ControlState>,
    notify: Notify,
}

impl SessionControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ControlState) -> R) -> R {
        // A poisoned lock only means another holder panicked mid-update;
        // the plain-data state is still usable.
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Record a seek target. Replaces any seek not yet applied.
    pub fn request_seek(&self, time: f64) {
        let time = if time.is_finite() { time.max(0.0) } else { 0.0 };
        self.with_state(|s| s.pending_seek = Some(time));
        self.notify.notify_one();
    }

    /// Consume the pending seek, if any.
    pub fn take_pending_seek(&self) -> Option<f64> {
        self.with_state(|s| s.pending_seek.take())
    }

    /// Ask the session to finish. The first reason wins.
    pub fn request_stop(&self, reason: EndReason) {
        self.with_state(|s| {
            s.stop.get_or_insert(reason);
        });
        self.notify.notify_one();
    }

    pub fn stop_reason(&self) -> Option<EndReason> {
        self.with_state(|s| s.stop)
    }

    pub fn set_paused(&self, paused: bool) {
        let changed = self.with_state(|s| std::mem::replace(&mut s.paused, paused) != paused);
        if changed {
            self.notify.notify_one();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.with_state(|s| s.paused)
    }

    pub fn set_player_time(&self, time: f64) {
        self.with_state(|s| s.player_time = Some(time));
    }

    /// Last time reported by the viewer's player.
    pub fn player_time(&self) -> Option<f64> {
        self.with_state(|s| s.player_time)
    }

    fn pending_wake(&self, paused_before: bool) -> Option<Wake> {
        self.with_state(|s| {
            if s.stop.is_some() {
                Some(Wake::Stop)
            } else if s.pending_seek.is_some() {
                Some(Wake::Seek)
            } else if s.paused != paused_before {
                Some(Wake::PauseChanged)
            } else {
                None
            }
        })
    }

    /// Sleep for `duration` unless a stop, seek, or pause toggle arrives
    /// first.
    pub async fn sleep_interruptible(&self, duration: Duration) -> Wake {
        let paused_before = self.is_paused();
        let deadline = tokio::time::Instant::now() + duration;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a write between the check and
            // the await still wakes us.
            notified.as_mut().enable();

            if let Some(wake) = self.pending_wake(paused_before) {
                return wake;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Wake::Elapsed,
                _ = &mut notified => {}
            }
        }
    }

    /// Block while paused. Returns `false` if a stop arrived meanwhile.
    pub async fn wait_while_paused(&self) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.stop_reason().is_some() {
                return false;
            }
            if !self.is_paused() {
                return true;
            }
            notified.await;
        }
    }
}
