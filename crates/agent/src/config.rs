//! Agent configuration from command-line flags and environment variables.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use streamsight_core::error::CoreError;
use streamsight_core::worker::validate_worker_id;

use crate::agent::AgentOptions;
use crate::detector::DetectionThresholds;
use crate::session::SessionSettings;
use crate::source::FfmpegOpener;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Streamsight analysis worker")]
pub struct AgentConfig {
    /// Unique id of this worker (1-128 chars of `[A-Za-z0-9._-]`).
    #[arg(long, env = "STREAMSIGHT_WORKER_ID")]
    pub worker_id: String,

    /// Coordinator WebSocket endpoint.
    #[arg(long, env = "COORDINATOR_WS_URL", default_value = "ws://localhost:3000/ws/worker")]
    pub server: String,

    /// Detection model served by the detector endpoint.
    #[arg(long, env = "MODEL_PATH", default_value = "yolov12.pt")]
    pub model: String,

    /// HTTP inference endpoint.
    #[arg(long, env = "DETECTOR_URL", default_value = "http://localhost:8000/detect")]
    pub detector_url: String,

    /// Minimum detector confidence (0-1).
    #[arg(long, env = "DETECTOR_CONFIDENCE", default_value_t = 0.5)]
    pub confidence: f32,

    /// Detector-side overlap threshold.
    #[arg(long, env = "DETECTOR_IOU", default_value_t = 0.45)]
    pub detector_iou: f32,

    /// IoU above which same-class boxes are merged before publishing.
    /// Zero or below disables merging.
    #[arg(long, env = "DEDUP_IOU", default_value_t = 0.8)]
    pub dedup_iou: f32,

    /// Resolution preference, best first.
    #[arg(
        long,
        env = "STREAM_RESOLUTIONS",
        value_delimiter = ',',
        default_value = "720p,480p,360p,1080p,best"
    )]
    pub resolutions: Vec<String>,

    /// How long a preempted session may take to stop.
    #[arg(long, env = "PREEMPT_TIMEOUT_MS", default_value_t = 1000)]
    pub preempt_timeout_ms: u64,

    /// Outbound event buffer; events beyond it are dropped.
    #[arg(long, env = "PUBLISH_BUFFER", default_value_t = 64)]
    pub publish_buffer: usize,

    #[arg(long, env = "FFMPEG_BIN", default_value = "ffmpeg")]
    pub ffmpeg_bin: String,

    #[arg(long, env = "FFPROBE_BIN", default_value = "ffprobe")]
    pub ffprobe_bin: String,

    #[arg(long, env = "YTDLP_BIN", default_value = "yt-dlp")]
    pub ytdlp_bin: String,
}

impl AgentConfig {
    /// Check values clap cannot.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_worker_id(&self.worker_id)?;
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(CoreError::Validation(format!(
                "confidence must be within 0..=1, got {}",
                self.confidence
            )));
        }
        if self.publish_buffer == 0 {
            return Err(CoreError::Validation(
                "publish buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn agent_options(&self) -> AgentOptions {
        AgentOptions {
            worker_id: self.worker_id.clone(),
            model: self.model.clone(),
            preempt_timeout: Duration::from_millis(self.preempt_timeout_ms),
        }
    }

    pub fn session_settings(&self) -> Arc<SessionSettings> {
        let resolutions = self
            .resolutions
            .iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        Arc::new(SessionSettings {
            resolutions,
            thresholds: DetectionThresholds {
                confidence: self.confidence,
                overlap: self.detector_iou,
            },
            dedup_iou: self.dedup_iou,
        })
    }

    pub fn opener(&self) -> FfmpegOpener {
        FfmpegOpener {
            ffmpeg_bin: self.ffmpeg_bin.clone(),
            ffprobe_bin: self.ffprobe_bin.clone(),
            ytdlp_bin: self.ytdlp_bin.clone(),
        }
    }
}
