//! In-memory collaborators and a driver for agent tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use streamsight_agent::agent::{AgentOptions, WorkerAgent};
use streamsight_agent::detector::{DetectionThresholds, Detector, DetectorError};
use streamsight_agent::messages::{parse_inbound, OutboundMessage};
use streamsight_agent::publish;
use streamsight_agent::session::{SessionContext, SessionEvent, SessionSettings};
use streamsight_agent::source::{FrameSource, FrameSourceOpener, SourceError};
use streamsight_core::detection::{PixelBox, RawDetection};
use streamsight_core::ffprobe::StreamInfo;
use streamsight_core::frame::Frame;
use streamsight_core::worker::WorkerState;
use tokio::sync::mpsc;

pub const WORKER_ID: &str = "worker-1";
pub const FRAME_SIZE: u32 = 200;

// ---------------------------------------------------------------------------
// Frame source
// ---------------------------------------------------------------------------

/// A synthetic stream of blank frames.
pub struct FakeSource {
    fps: f64,
    total_frames: u64,
    next: u64,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl FrameSource for FakeSource {
    fn info(&self) -> StreamInfo {
        StreamInfo {
            fps: self.fps,
            total_frames: self.total_frames,
            duration_secs: self.total_frames as f64 / self.fps,
            width: FRAME_SIZE,
            height: FRAME_SIZE,
        }
    }

    fn next_position(&self) -> f64 {
        self.next as f64 / self.fps
    }

    async fn seek(&mut self, time: f64) -> Result<(), SourceError> {
        self.next = (time * self.fps).round() as u64;
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.next >= self.total_frames {
            return Ok(None);
        }
        let position = self.next_position();
        self.next += 1;
        Ok(Some(Frame::new(RgbImage::new(FRAME_SIZE, FRAME_SIZE), position)))
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Opens [`FakeSource`]s at any resolution, or rejects everything when
/// `fail_all` is set.
pub struct FakeOpener {
    pub fps: f64,
    pub total_frames: u64,
    pub fail_all: bool,
    pub opens: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
}

impl FakeOpener {
    /// 10 second stream at 5 fps.
    pub fn ten_seconds() -> Self {
        Self {
            fps: 5.0,
            total_frames: 50,
            fail_all: false,
            opens: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_all: true,
            ..Self::ten_seconds()
        }
    }
}

#[async_trait]
impl FrameSourceOpener for FakeOpener {
    async fn open(
        &self,
        stream_ref: &str,
        resolution: &str,
    ) -> Result<Box<dyn FrameSource>, SourceError> {
        if self.fail_all {
            return Err(SourceError::Resolve(format!(
                "{stream_ref} unavailable at {resolution}"
            )));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSource {
            fps: self.fps,
            total_frames: self.total_frames,
            next: 0,
            closes: self.closes.clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectorMode {
    /// Two same-class boxes with IoU 0.9.
    OverlappingPair,
    /// Every call is rejected.
    Broken,
    /// Every call panics.
    Panics,
    /// Every call hangs for the given time before answering.
    Stalls(Duration),
}

pub struct FakeDetector {
    pub mode: DetectorMode,
    pub calls: AtomicUsize,
}

impl FakeDetector {
    fn with_mode(mode: DetectorMode) -> Self {
        Self {
            mode,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn overlapping_pair() -> Self {
        Self::with_mode(DetectorMode::OverlappingPair)
    }

    pub fn broken() -> Self {
        Self::with_mode(DetectorMode::Broken)
    }

    pub fn panicking() -> Self {
        Self::with_mode(DetectorMode::Panics)
    }

    pub fn stalling(delay: Duration) -> Self {
        Self::with_mode(DetectorMode::Stalls(delay))
    }
}

#[async_trait]
impl Detector for FakeDetector {
    async fn warm_up(&self) -> Result<(), DetectorError> {
        Ok(())
    }

    async fn detect(
        &self,
        _frame: &Frame,
        _thresholds: &DetectionThresholds,
    ) -> Result<Vec<RawDetection>, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            DetectorMode::OverlappingPair => {}
            DetectorMode::Broken => {
                return Err(DetectorError::Rejected {
                    status: 503,
                    body: "model unavailable".into(),
                });
            }
            DetectorMode::Panics => panic!("inference backend crashed"),
            DetectorMode::Stalls(delay) => tokio::time::sleep(delay).await,
        }
        Ok(vec![
            RawDetection {
                class_label: "person".into(),
                confidence: 0.75,
                bbox: PixelBox::new(0.0, 0.0, 100.0, 100.0),
            },
            RawDetection {
                class_label: "person".into(),
                confidence: 0.5,
                bbox: PixelBox::new(0.0, 0.0, 100.0, 90.0),
            },
        ])
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Stands in for the connection task: feeds messages to the agent, applies
/// session events, and collects outbound messages.
pub struct Harness {
    pub agent: WorkerAgent,
    pub opener: Arc<FakeOpener>,
    pub detector: Arc<FakeDetector>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    outbound: mpsc::Receiver<OutboundMessage>,
}

impl Harness {
    pub fn new(opener: FakeOpener, detector: FakeDetector) -> Self {
        let opener = Arc::new(opener);
        let detector = Arc::new(detector);
        let (sink, outbound) = publish::channel(256);
        let ctx = SessionContext {
            opener: opener.clone(),
            detector: detector.clone(),
            sink,
            settings: Arc::new(SessionSettings::default()),
        };
        let options = AgentOptions {
            worker_id: WORKER_ID.into(),
            model: "test-model".into(),
            preempt_timeout: Duration::from_millis(1000),
        };
        let (agent, events) = WorkerAgent::new(options, ctx);
        Self {
            agent,
            opener,
            detector,
            events,
            outbound,
        }
    }

    /// Feed one raw JSON frame to the agent.
    pub async fn send(&mut self, json: &str) {
        let msg = parse_inbound(json).expect("test message must parse");
        self.agent.handle_inbound(msg).await;
    }

    pub async fn register(&mut self) {
        self.send(&format!(
            r#"{{"type":"worker-registered","workerId":"{WORKER_ID}","success":true}}"#
        ))
        .await;
        assert_eq!(self.agent.state(), WorkerState::Idle);
    }

    pub async fn start(&mut self, session_id: &str, offset: f64) {
        self.send(&format!(
            r#"{{"type":"start-processing","workerId":"{WORKER_ID}","sessionId":"{session_id}","streamRef":"file:///clip.mp4","startOffset":{offset}}}"#
        ))
        .await;
    }

    /// Next outbound message, applying session events while waiting.
    pub async fn next_outbound(&mut self) -> OutboundMessage {
        loop {
            tokio::select! {
                biased;
                Some(event) = self.events.recv() => self.agent.on_session_event(event),
                Some(message) = self.outbound.recv() => return message,
            }
        }
    }

    /// Outbound messages up to and including the `session-ended` for
    /// `session_id`.
    pub async fn until_ended(&mut self, session_id: &str) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        loop {
            let message = self.next_outbound().await;
            let done = matches!(&message, OutboundMessage::SessionEnded(m) if m.session_id == session_id);
            out.push(message);
            if done {
                return out;
            }
        }
    }

    /// Apply session events until the worker holds no session.
    pub async fn settle(&mut self) {
        while self.agent.current_session().is_some() {
            let event = self.events.recv().await.expect("agent keeps the sender");
            self.agent.on_session_event(event);
        }
    }

    /// Whatever is already queued, without waiting.
    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            out.push(message);
        }
        out
    }
}
