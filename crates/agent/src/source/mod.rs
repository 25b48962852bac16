//! Frame sources.
//!
//! A [`FrameSource`] yields decoded frames for one stream in timeline order
//! and can jump to a new offset. Sources are produced by a
//! [`FrameSourceOpener`] for a given stream reference and resolution
//! preference; [`open_with_fallback`] walks the preference list until one
//! opens.

pub mod ffmpeg;
pub mod ytdlp;

use async_trait::async_trait;
use streamsight_core::ffprobe::{FfprobeError, StreamInfo};
use streamsight_core::frame::Frame;

pub use ffmpeg::{FfmpegOpener, FfmpegSource};

/// Resolution labels tried in order when none are configured.
pub const DEFAULT_RESOLUTIONS: &[&str] = &["720p", "480p", "360p", "1080p", "best"];

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("stream could not be resolved: {0}")]
    Resolve(String),

    #[error(transparent)]
    Probe(#[from] FfprobeError),

    #[error("decoder could not be started: {0}")]
    Spawn(std::io::Error),

    #[error("frame read failed: {0}")]
    Read(std::io::Error),

    #[error("no resolution could be opened (tried {tried}): {last}")]
    Exhausted { tried: String, last: String },
}

/// One opened stream, exclusively owned by a session.
#[async_trait]
pub trait FrameSource: Send {
    fn info(&self) -> StreamInfo;

    /// Timeline position (seconds) of the frame the next
    /// [`next_frame`](Self::next_frame) call returns.
    fn next_position(&self) -> f64;

    /// Jump so the next frame is at or just after `time`.
    async fn seek(&mut self, time: f64) -> Result<(), SourceError>;

    /// Read the next frame. `Ok(None)` marks end of stream.
    async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Release decoder resources. Idempotent.
    async fn close(&mut self);

    /// Stream length in seconds; 0 when unknown (live).
    fn duration_secs(&self) -> f64 {
        let info = self.info();
        if info.total_frames > 0 && info.fps > 0.0 {
            info.total_frames as f64 / info.fps
        } else {
            info.duration_secs
        }
    }
}

/// Opens frame sources for stream references.
#[async_trait]
pub trait FrameSourceOpener: Send + Sync {
    async fn open(
        &self,
        stream_ref: &str,
        resolution: &str,
    ) -> Result<Box<dyn FrameSource>, SourceError>;
}

/// Try each resolution in order; return the first source that opens.
pub async fn open_with_fallback(
    opener: &dyn FrameSourceOpener,
    stream_ref: &str,
    resolutions: &[String],
) -> Result<(Box<dyn FrameSource>, String), SourceError> {
    let fallback: Vec<String>;
    let resolutions = if resolutions.is_empty() {
        fallback = DEFAULT_RESOLUTIONS.iter().map(|r| r.to_string()).collect();
        &fallback
    } else {
        resolutions
    };

    let mut last = String::from("no attempts made");
    for resolution in resolutions {
        match opener.open(stream_ref, resolution).await {
            Ok(source) => return Ok((source, resolution.clone())),
            Err(e) => {
                tracing::warn!(stream_ref, resolution = %resolution, error = %e, "Failed to open stream");
                last = e.to_string();
            }
        }
    }

    Err(SourceError::Exhausted {
        tried: resolutions.join(","),
        last,
    })
}
