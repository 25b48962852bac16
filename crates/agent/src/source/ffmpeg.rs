//! ffmpeg-backed frame source.
//!
//! `ffprobe` supplies frame rate, frame count and picture size; `ffmpeg`
//! then decodes the stream to packed RGB24 on stdout, one
//! `width * height * 3` chunk per frame. Seeking restarts the decoder with
//! `-ss` at the new offset.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

use streamsight_core::ffprobe::{probe_stream, StreamInfo};
use streamsight_core::frame::{rgb24_frame_len, Frame};

use super::{ytdlp, FrameSource, FrameSourceOpener, SourceError};

/// External tool locations.
#[derive(Debug, Clone)]
pub struct FfmpegOpener {
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    pub ytdlp_bin: String,
}

impl Default for FfmpegOpener {
    fn default() -> Self {
        Self {
            ffmpeg_bin: "ffmpeg".into(),
            ffprobe_bin: "ffprobe".into(),
            ytdlp_bin: "yt-dlp".into(),
        }
    }
}

#[async_trait]
impl FrameSourceOpener for FfmpegOpener {
    async fn open(
        &self,
        stream_ref: &str,
        resolution: &str,
    ) -> Result<Box<dyn FrameSource>, SourceError> {
        let input = if ytdlp::needs_resolution(stream_ref) {
            ytdlp::resolve(&self.ytdlp_bin, stream_ref, resolution).await?
        } else {
            stream_ref.to_string()
        };

        let info = probe_stream(&self.ffprobe_bin, &input).await?;
        tracing::debug!(
            resolution,
            fps = info.fps,
            total_frames = info.total_frames,
            width = info.width,
            height = info.height,
            "Probed stream",
        );

        let mut source = FfmpegSource::new(self.ffmpeg_bin.clone(), input, info);
        source.start_decoder(0.0)?;
        Ok(Box::new(source))
    }
}

/// A running ffmpeg decoder for one input.
pub struct FfmpegSource {
    ffmpeg_bin: String,
    input: String,
    info: StreamInfo,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    /// Offset the current decoder was started at.
    segment_start: f64,
    /// Frames read since `segment_start`.
    frames_read: u64,
}

impl FfmpegSource {
    pub fn new(ffmpeg_bin: String, input: String, info: StreamInfo) -> Self {
        Self {
            ffmpeg_bin,
            input,
            info,
            child: None,
            stdout: None,
            segment_start: 0.0,
            frames_read: 0,
        }
    }

    fn start_decoder(&mut self, at: f64) -> Result<(), SourceError> {
        let mut child = Command::new(&self.ffmpeg_bin)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin"])
            .arg("-ss")
            .arg(format!("{at:.3}"))
            .arg("-i")
            .arg(&self.input)
            .args(["-an", "-sn", "-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(SourceError::Spawn)?;

        self.stdout = child.stdout.take();
        self.child = Some(child);
        self.segment_start = at;
        self.frames_read = 0;
        Ok(())
    }

    async fn stop_decoder(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "ffmpeg already exited");
            }
        }
    }
}

#[async_trait]
impl FrameSource for FfmpegSource {
    fn info(&self) -> StreamInfo {
        self.info
    }

    fn next_position(&self) -> f64 {
        self.segment_start + self.frames_read as f64 / self.info.fps
    }

    async fn seek(&mut self, time: f64) -> Result<(), SourceError> {
        self.stop_decoder().await;
        self.start_decoder(time.max(0.0))
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };

        let mut pixels = vec![0u8; rgb24_frame_len(self.info.width, self.info.height)];
        match stdout.read_exact(&mut pixels).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(SourceError::Read(e)),
        }

        let position = self.next_position();
        self.frames_read += 1;

        Ok(Frame::from_rgb24(
            self.info.width,
            self.info.height,
            pixels,
            position,
        ))
    }

    async fn close(&mut self) {
        self.stop_decoder().await;
    }
}
