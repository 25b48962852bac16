//! `ffprobe` invocation and output parsing.
//!
//! The frame source needs a stream's frame rate, frame count, duration, and
//! picture size before it can start decoding raw frames. This module runs
//! `ffprobe` once per opened stream and reduces its JSON output to a
//! [`StreamInfo`].

use serde::Deserialize;

/// Frame rate assumed when the container does not report one.
pub const FALLBACK_FPS: f64 = 30.0;

/// Error type for ffprobe operations.
#[derive(Debug, thiserror::Error)]
pub enum FfprobeError {
    #[error("ffprobe binary could not be started: {0}")]
    NotFound(std::io::Error),

    #[error("ffprobe failed (exit code {exit_code:?}): {stderr}")]
    ExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("failed to parse ffprobe output: {0}")]
    ParseError(String),

    #[error("input has no usable video stream")]
    NoVideoStream,
}

// ---------------------------------------------------------------------------
// ffprobe JSON output structures
// ---------------------------------------------------------------------------

/// Top-level ffprobe JSON output (`-print_format json -show_format -show_streams`).
#[derive(Debug, Deserialize)]
pub struct FfprobeOutput {
    #[serde(default)]
    pub streams: Vec<FfprobeStream>,
    #[serde(default)]
    pub format: Option<FfprobeFormat>,
}

/// A single stream from ffprobe output.
#[derive(Debug, Default, Deserialize)]
pub struct FfprobeStream {
    pub codec_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// e.g. "30/1" or "24000/1001"
    pub avg_frame_rate: Option<String>,
    pub r_frame_rate: Option<String>,
    pub duration: Option<String>,
    pub nb_frames: Option<String>,
}

/// Format-level metadata from ffprobe.
#[derive(Debug, Default, Deserialize)]
pub struct FfprobeFormat {
    pub duration: Option<String>,
}

/// What the frame source needs to know about a video stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub fps: f64,
    /// Zero when neither the container nor the duration allows an estimate
    /// (live streams).
    pub total_frames: u64,
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run `ffprobe` against `input` (a path or URL) and summarise its first
/// video stream.
pub async fn probe_stream(ffprobe_bin: &str, input: &str) -> Result<StreamInfo, FfprobeError> {
    let output = tokio::process::Command::new(ffprobe_bin)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
            "-select_streams",
            "v:0",
        ])
        .arg(input)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(FfprobeError::NotFound)?;

    if !output.status.success() {
        return Err(FfprobeError::ExecutionFailed {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let parsed = parse_output(&String::from_utf8_lossy(&output.stdout))?;
    stream_info(&parsed)
}

/// Parse raw ffprobe JSON.
pub fn parse_output(json: &str) -> Result<FfprobeOutput, FfprobeError> {
    serde_json::from_str(json).map_err(|e| FfprobeError::ParseError(e.to_string()))
}

/// Reduce ffprobe output to a [`StreamInfo`].
///
/// Fails when there is no video stream or it reports no picture size.
pub fn stream_info(probe: &FfprobeOutput) -> Result<StreamInfo, FfprobeError> {
    let stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or(FfprobeError::NoVideoStream)?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(FfprobeError::NoVideoStream),
    };

    let fps = [stream.avg_frame_rate.as_deref(), stream.r_frame_rate.as_deref()]
        .into_iter()
        .flatten()
        .map(parse_fraction)
        .find(|fps| *fps > 0.0)
        .unwrap_or(FALLBACK_FPS);

    let duration_secs = probe
        .format
        .as_ref()
        .and_then(|f| parse_positive(f.duration.as_deref()))
        .or_else(|| parse_positive(stream.duration.as_deref()))
        .unwrap_or(0.0);

    let total_frames = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|n| *n > 0)
        .unwrap_or_else(|| (duration_secs * fps).round() as u64);

    // Prefer frames / fps when the container is explicit about its length.
    let duration_secs = if total_frames > 0 && duration_secs == 0.0 {
        total_frames as f64 / fps
    } else {
        duration_secs
    };

    Ok(StreamInfo {
        fps,
        total_frames,
        duration_secs,
        width,
        height,
    })
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn parse_positive(value: Option<&str>) -> Option<f64> {
    value
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
}

/// Parse a fraction string like `"30/1"` into a float. `"0/0"` yields 0.
pub fn parse_fraction(s: &str) -> f64 {
    match s.split_once('/') {
        Some((num, den)) => {
            let num = num.trim().parse::<f64>().unwrap_or(0.0);
            let den = den.trim().parse::<f64>().unwrap_or(0.0);
            if den > 0.0 {
                num / den
            } else {
                0.0
            }
        }
        None => s.trim().parse::<f64>().unwrap_or(0.0),
    }
}
