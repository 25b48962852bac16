//! Per-assignment analysis loop.
//!
//! A [`WorkerSession`] owns one stream for one session id. It opens the
//! stream (walking the resolution fallbacks), then repeats
//! pace -> read -> detect -> dedup -> publish until the stream ends or a
//! stop is requested through its [`SessionControl`]. Every event it
//! publishes carries its own session id, and it always reports a final
//! [`SessionEventKind::Finished`] to the agent, whatever the exit path.

use std::sync::Arc;
use std::time::Duration;

use streamsight_core::detection::{post_process, DEFAULT_DEDUP_IOU_THRESHOLD};
use streamsight_core::pacer::PlaybackPacer;
use streamsight_core::types::SessionId;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::control::{SessionControl, Wake};
use crate::detector::{DetectionThresholds, Detector};
use crate::messages::{AiBoxes, EndReason, OutboundMessage, SessionEnded, StreamError, StreamStarted};
use crate::publish::EventSink;
use crate::source::{open_with_fallback, FrameSource, FrameSourceOpener};

const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// What to analyse.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    pub session_id: SessionId,
    pub stream_ref: String,
    pub start_offset: f64,
}

/// Tunables shared by every session of a worker.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub resolutions: Vec<String>,
    pub thresholds: DetectionThresholds,
    pub dedup_iou: f32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            resolutions: crate::source::DEFAULT_RESOLUTIONS
                .iter()
                .map(|r| r.to_string())
                .collect(),
            thresholds: DetectionThresholds::default(),
            dedup_iou: DEFAULT_DEDUP_IOU_THRESHOLD,
        }
    }
}

/// Collaborators a session needs; cheap to clone per assignment.
#[derive(Clone)]
pub struct SessionContext {
    pub opener: Arc<dyn FrameSourceOpener>,
    pub detector: Arc<dyn Detector>,
    pub sink: EventSink,
    pub settings: Arc<SessionSettings>,
}

/// Lifecycle notification from a session to its agent.
///
/// `run` is the agent-assigned run number, so a late event from a
/// preempted run is never mistaken for the current one even when the
/// coordinator reuses a session id.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub run: u64,
    pub session_id: SessionId,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    /// The stream opened and analysis is about to begin.
    Started,
    /// The loop exited and the frame source is released.
    Finished {
        reason: EndReason,
        error: Option<String>,
    },
}

pub struct WorkerSession {
    run: u64,
    request: SessionRequest,
    ctx: SessionContext,
    control: Arc<SessionControl>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

enum Opened {
    Ready(Box<dyn FrameSource>),
    /// Stopped before analysis began.
    Stopped(EndReason),
}

/// Throughput counters for the periodic debug line.
struct LoopStats {
    frames: u64,
    boxes: u64,
    last_report: Instant,
}

impl WorkerSession {
    pub fn new(
        run: u64,
        request: SessionRequest,
        ctx: SessionContext,
        control: Arc<SessionControl>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            run,
            request,
            ctx,
            control,
            events,
        }
    }

    /// Run to completion and return how the session ended.
    pub async fn run(self) -> EndReason {
        let session_id = self.request.session_id.clone();

        let (reason, error) = match self.open().await {
            Ok(Opened::Ready(mut source)) => {
                let reason = self.analyse(source.as_mut()).await;
                source.close().await;
                (reason, None)
            }
            Ok(Opened::Stopped(reason)) => (reason, None),
            Err(message) => {
                self.ctx.sink.publish_or_log(OutboundMessage::StreamError(StreamError {
                    session_id: session_id.clone(),
                    message: message.clone(),
                }));
                (EndReason::Error, Some(message))
            }
        };

        tracing::info!(session_id = %session_id, ?reason, "Session finished");

        self.ctx.sink.publish_or_log(OutboundMessage::SessionEnded(SessionEnded {
            session_id,
            reason,
        }));
        self.notify(SessionEventKind::Finished { reason, error });
        reason
    }

    fn notify(&self, kind: SessionEventKind) {
        let event = SessionEvent {
            run: self.run,
            session_id: self.request.session_id.clone(),
            kind,
        };
        if self.events.send(event).is_err() {
            tracing::debug!(
                session_id = %self.request.session_id,
                "Agent no longer listening for session events",
            );
        }
    }

    /// Open the stream, apply the start offset, and announce it. A stop
    /// requested while opening releases the source unannounced.
    async fn open(&self) -> Result<Opened, String> {
        let req = &self.request;
        let (mut source, resolution) = open_with_fallback(
            self.ctx.opener.as_ref(),
            &req.stream_ref,
            &self.ctx.settings.resolutions,
        )
        .await
        .map_err(|e| e.to_string())?;

        if let Some(reason) = self.control.stop_reason() {
            source.close().await;
            return Ok(Opened::Stopped(reason));
        }

        if req.start_offset > 0.0 {
            if let Err(e) = source.seek(req.start_offset).await {
                source.close().await;
                return Err(format!("seek to start offset {} failed: {e}", req.start_offset));
            }
            if let Some(reason) = self.control.stop_reason() {
                source.close().await;
                return Ok(Opened::Stopped(reason));
            }
        }

        let duration = source.duration_secs();
        tracing::info!(
            session_id = %req.session_id,
            stream_ref = %req.stream_ref,
            resolution = %resolution,
            duration,
            fps = source.info().fps,
            "Stream opened",
        );

        self.ctx.sink.publish_or_log(OutboundMessage::StreamStarted(StreamStarted {
            session_id: req.session_id.clone(),
            stream_ref: req.stream_ref.clone(),
            duration,
        }));
        self.notify(SessionEventKind::Started);

        Ok(Opened::Ready(source))
    }

    /// The frame loop. Returns the end reason; never fails.
    async fn analyse(&self, source: &mut dyn FrameSource) -> EndReason {
        let session_id = &self.request.session_id;
        let settings = &self.ctx.settings;
        let control = &self.control;

        let mut pacer = PlaybackPacer::new(Instant::now(), source.next_position());
        let mut stats = LoopStats {
            frames: 0,
            boxes: 0,
            last_report: Instant::now(),
        };

        loop {
            if let Some(reason) = control.stop_reason() {
                return reason;
            }

            if control.is_paused() {
                tracing::debug!(session_id = %session_id, "Paused");
                if !control.wait_while_paused().await {
                    return control.stop_reason().unwrap_or(EndReason::Stopped);
                }
                // Time spent paused is not lag.
                pacer.reset(Instant::now(), source.next_position());
                tracing::debug!(session_id = %session_id, "Resumed");
            }

            if let Some(target) = control.take_pending_seek() {
                if let Err(e) = source.seek(target).await {
                    tracing::warn!(session_id = %session_id, target, error = %e, "Seek failed");
                    return EndReason::Ended;
                }
                pacer.reset(Instant::now(), source.next_position());
                tracing::info!(session_id = %session_id, target, "Seek applied");
            }

            let delay = pacer.delay(source.next_position());
            if !delay.is_zero() && control.sleep_interruptible(delay).await != Wake::Elapsed {
                continue;
            }

            let frame = match source.next_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::info!(session_id = %session_id, "End of stream");
                    return EndReason::Ended;
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Frame read failed, ending session");
                    return EndReason::Ended;
                }
            };

            let raw = match self.ctx.detector.detect(&frame, &settings.thresholds).await {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        position = frame.position_secs,
                        error = %e,
                        "Detector failed, publishing empty frame",
                    );
                    Vec::new()
                }
            };

            let boxes = post_process(&raw, frame.width(), frame.height(), settings.dedup_iou);
            stats.frames += 1;
            stats.boxes += boxes.len() as u64;

            let event = OutboundMessage::AiBoxes(AiBoxes {
                session_id: session_id.clone(),
                timestamp: frame.position_secs,
                boxes,
            });
            if let Err(e) = self.ctx.sink.publish(event) {
                tracing::debug!(session_id = %session_id, error = %e, "Dropped ai-boxes event");
            }

            self.report(&mut stats, frame.position_secs);
        }
    }

    fn report(&self, stats: &mut LoopStats, position: f64) {
        if stats.last_report.elapsed() < STATS_INTERVAL {
            return;
        }
        let drift = self.control.player_time().map(|t| position - t);
        tracing::debug!(
            session_id = %self.request.session_id,
            frames = stats.frames,
            boxes = stats.boxes,
            position,
            drift = ?drift,
            "Session throughput",
        );
        stats.frames = 0;
        stats.boxes = 0;
        stats.last_report = Instant::now();
    }
}
