//! Playback pacing.
//!
//! [`PlaybackPacer`] keeps frame analysis aligned with the stream's own
//! timeline. It tracks a pair of anchors (wall clock, video clock) taken at
//! the last reset and, for each frame, reports how long to wait so the
//! frame is not analysed before its moment in the video. It only throttles:
//! a frame that is already late is processed immediately, never skipped.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct PlaybackPacer {
    real_anchor: Instant,
    video_anchor: f64,
}

impl PlaybackPacer {
    /// Start pacing from `video_time` seconds at wall-clock `now`.
    pub fn new(now: Instant, video_time: f64) -> Self {
        Self {
            real_anchor: now,
            video_anchor: video_time,
        }
    }

    /// Re-anchor after a seek (or the initial start, or a resume).
    ///
    /// Pre-reset history is discarded, so jumps never accumulate drift.
    pub fn reset(&mut self, now: Instant, video_time: f64) {
        self.real_anchor = now;
        self.video_anchor = video_time;
    }

    /// Video time (seconds) at the last reset.
    pub fn video_anchor(&self) -> f64 {
        self.video_anchor
    }

    /// How long to wait before consuming a frame positioned at
    /// `video_time`. Never negative.
    pub fn delay_at(&self, video_time: f64, now: Instant) -> Duration {
        let elapsed_video = video_time - self.video_anchor;
        let elapsed_real = now.saturating_duration_since(self.real_anchor).as_secs_f64();
        let wait = elapsed_video - elapsed_real;

        if wait.is_finite() && wait > 0.0 {
            Duration::try_from_secs_f64(wait).unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        }
    }

    /// [`delay_at`](Self::delay_at) against the current time.
    pub fn delay(&self, video_time: f64) -> Duration {
        self.delay_at(video_time, Instant::now())
    }
}
