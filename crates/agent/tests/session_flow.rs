//! End-to-end agent tests: registration, assignment, the paced frame loop,
//! seeks, stops, preemption, and failure reporting. Collaborators are
//! in-memory fakes and the clock is paused, so pacing sleeps complete
//! instantly while keeping their relative order.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use streamsight_agent::control::SessionControl;
use streamsight_agent::messages::{EndReason, OutboundMessage};
use streamsight_agent::publish;
use streamsight_agent::session::{
    SessionContext, SessionEventKind, SessionRequest, SessionSettings, WorkerSession,
};
use streamsight_core::worker::WorkerState;
use tokio::sync::mpsc;
use tokio::time::Instant;

use common::{FakeDetector, FakeOpener, Harness, WORKER_ID};

fn ai_boxes(messages: &[OutboundMessage], session_id: &str) -> Vec<(f64, usize)> {
    messages
        .iter()
        .filter_map(|m| match m {
            OutboundMessage::AiBoxes(b) if b.session_id == session_id => {
                Some((b.timestamp, b.boxes.len()))
            }
            _ => None,
        })
        .collect()
}

async fn next_boxes(h: &mut Harness) -> (String, f64, usize) {
    loop {
        if let OutboundMessage::AiBoxes(b) = h.next_outbound().await {
            return (b.session_id, b.timestamp, b.boxes.len());
        }
    }
}

// ---------------------------------------------------------------------------
// Registration and addressing
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn register_message_carries_identity() {
    let h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::overlapping_pair());
    assert_eq!(h.agent.state(), WorkerState::Unregistered);

    let json = serde_json::to_value(h.agent.register_message()).unwrap();
    assert_eq!(json["type"], "register");
    assert_eq!(json["workerId"], WORKER_ID);
    assert_eq!(json["model"], "test-model");
    assert!(json["startedAt"].is_string());
}

#[tokio::test(start_paused = true)]
async fn assignment_before_registration_is_ignored() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::overlapping_pair());
    h.start("S1", 0.0).await;

    assert_eq!(h.agent.state(), WorkerState::Unregistered);
    assert!(h.agent.current_session().is_none());
    assert_eq!(h.opener.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn rejected_registration_keeps_worker_unregistered() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::overlapping_pair());
    h.send(&format!(
        r#"{{"type":"worker-registered","workerId":"{WORKER_ID}","success":false,"error":"duplicate id"}}"#
    ))
    .await;
    assert!(h.agent.needs_registration());
}

#[tokio::test(start_paused = true)]
async fn acknowledgement_for_another_worker_is_ignored() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::overlapping_pair());
    h.send(r#"{"type":"worker-registered","workerId":"worker-9","success":true}"#)
        .await;
    assert_eq!(h.agent.state(), WorkerState::Unregistered);
}

#[tokio::test(start_paused = true)]
async fn assignment_for_another_worker_is_ignored() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::overlapping_pair());
    h.register().await;
    h.send(r#"{"type":"start-processing","workerId":"worker-2","sessionId":"S9","streamRef":"x"}"#)
        .await;

    assert_eq!(h.agent.state(), WorkerState::Idle);
    assert_eq!(h.opener.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn session_messages_while_idle_are_ignored() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::overlapping_pair());
    h.register().await;
    h.send(r#"{"type":"stop-processing","sessionId":"S1"}"#).await;
    h.send(r#"{"type":"seek","sessionId":"S1","time":3.0}"#).await;
    h.send(r#"{"type":"stop-processing"}"#).await;

    assert_eq!(h.agent.state(), WorkerState::Idle);
    assert!(h.drain().is_empty());
}

// ---------------------------------------------------------------------------
// Full session
// ---------------------------------------------------------------------------

/// 10s / 5fps stream, detector returns two same-class boxes with IoU 0.9:
/// one event per frame, one box per event, in timeline order.
#[tokio::test(start_paused = true)]
async fn full_stream_publishes_one_deduplicated_box_per_frame() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::overlapping_pair());
    h.register().await;
    h.start("S1", 0.0).await;
    assert_eq!(h.agent.state(), WorkerState::Assigned);

    let messages = h.until_ended("S1").await;

    assert_matches!(
        &messages[0],
        OutboundMessage::StreamStarted(s) if s.session_id == "S1" && (s.duration - 10.0).abs() < 1e-9
    );
    assert_matches!(
        messages.last(),
        Some(OutboundMessage::SessionEnded(e)) if e.reason == EndReason::Ended
    );

    let boxes = ai_boxes(&messages, "S1");
    assert_eq!(boxes.len(), 50);
    assert!(boxes.iter().all(|(_, n)| *n == 1));
    assert!(boxes.windows(2).all(|w| w[0].0 <= w[1].0));
    assert_eq!(boxes[0].0, 0.0);

    // Every event belongs to the assigned session.
    assert!(messages.iter().all(|m| m.session_id() == Some("S1")));

    h.settle().await;
    assert_eq!(h.agent.state(), WorkerState::Idle);
    assert_eq!(h.opener.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn loop_follows_video_pace() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::overlapping_pair());
    h.register().await;

    let started = Instant::now();
    h.start("S1", 0.0).await;
    h.until_ended("S1").await;

    // 50 frames at 5 fps: the last frame (t = 9.8s) is not analysed early.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(9800), "finished after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(11), "finished after {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn start_offset_skips_ahead() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::overlapping_pair());
    h.register().await;
    h.start("S1", 8.0).await;

    let messages = h.until_ended("S1").await;
    let boxes = ai_boxes(&messages, "S1");
    assert_eq!(boxes.len(), 10);
    assert_eq!(boxes[0].0, 8.0);
}

// ---------------------------------------------------------------------------
// Seek / stop
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn seek_jumps_timeline_without_waiting() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::overlapping_pair());
    h.register().await;
    h.start("S1", 0.0).await;

    loop {
        let (_, timestamp, _) = next_boxes(&mut h).await;
        if timestamp >= 1.0 {
            break;
        }
    }
    assert_eq!(h.agent.state(), WorkerState::Processing);

    let seek_at = Instant::now();
    h.send(r#"{"type":"seek","sessionId":"S1","time":7.0}"#).await;

    let (session_id, timestamp, boxes) = next_boxes(&mut h).await;
    assert_eq!(session_id, "S1");
    assert_eq!(timestamp, 7.0);
    assert_eq!(boxes, 1);
    // The pacer was re-anchored at 7.0, so that frame needed no wait.
    assert!(seek_at.elapsed() < Duration::from_millis(10));

    let rest = h.until_ended("S1").await;
    let after = ai_boxes(&rest, "S1");
    assert_eq!(after.len(), 14);
    assert!(after.iter().all(|(t, _)| *t > 7.0));
}

#[tokio::test(start_paused = true)]
async fn only_latest_pending_seek_applies() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::overlapping_pair());
    h.register().await;
    h.start("S1", 0.0).await;
    next_boxes(&mut h).await;

    h.send(r#"{"type":"seek","sessionId":"S1","time":3.0}"#).await;
    h.send(r#"{"type":"player-seek","sessionId":"S1","time":6.0}"#).await;

    let (_, timestamp, _) = next_boxes(&mut h).await;
    assert_eq!(timestamp, 6.0);
}

#[tokio::test(start_paused = true)]
async fn backward_seek_restarts_segment() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::overlapping_pair());
    h.register().await;
    h.start("S1", 5.0).await;
    next_boxes(&mut h).await;

    h.send(r#"{"type":"seek","sessionId":"S1","time":1.0}"#).await;
    let (_, timestamp, _) = next_boxes(&mut h).await;
    assert_eq!(timestamp, 1.0);
}

#[tokio::test(start_paused = true)]
async fn stop_ends_session_promptly() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::overlapping_pair());
    h.register().await;
    h.start("S1", 0.0).await;
    for _ in 0..3 {
        next_boxes(&mut h).await;
    }

    let stop_at = Instant::now();
    h.send(r#"{"type":"stop-processing","sessionId":"S1"}"#).await;

    let rest = h.until_ended("S1").await;
    assert!(ai_boxes(&rest, "S1").len() <= 1);
    assert_matches!(
        rest.last(),
        Some(OutboundMessage::SessionEnded(e)) if e.reason == EndReason::Stopped
    );

    h.settle().await;
    assert_eq!(h.agent.state(), WorkerState::Idle);
    assert!(stop_at.elapsed() < Duration::from_secs(1));
    assert_eq!(h.opener.closes.load(Ordering::SeqCst), 1);

    // Nothing else for S1 afterwards.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unscoped_stop_ends_active_session() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::overlapping_pair());
    h.register().await;
    h.start("S1", 0.0).await;
    next_boxes(&mut h).await;

    h.send(r#"{"type":"stop-processing"}"#).await;
    let rest = h.until_ended("S1").await;
    assert_matches!(
        rest.last(),
        Some(OutboundMessage::SessionEnded(e)) if e.reason == EndReason::Stopped
    );
}

#[tokio::test(start_paused = true)]
async fn stale_session_ids_are_dropped() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::overlapping_pair());
    h.register().await;
    h.start("S1", 0.0).await;
    next_boxes(&mut h).await;

    h.send(r#"{"type":"stop-processing","sessionId":"S2"}"#).await;
    h.send(r#"{"type":"seek","sessionId":"S2","time":9.0}"#).await;
    h.send(r#"{"type":"player-state","sessionId":"S2","state":"ended"}"#).await;

    let (session_id, timestamp, _) = next_boxes(&mut h).await;
    assert_eq!(session_id, "S1");
    assert!(timestamp < 9.0);
    assert_eq!(h.agent.state(), WorkerState::Processing);
    assert_eq!(h.agent.current_session(), Some("S1"));
}

// ---------------------------------------------------------------------------
// Preemption
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn new_assignment_preempts_running_session() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::overlapping_pair());
    h.register().await;
    h.start("S1", 0.0).await;
    next_boxes(&mut h).await;

    h.start("S2", 0.0).await;
    assert_eq!(h.agent.current_session(), Some("S2"));

    let messages = h.until_ended("S2").await;
    let s1_end = messages
        .iter()
        .position(|m| matches!(m, OutboundMessage::SessionEnded(e) if e.session_id == "S1"))
        .expect("S1 reported as ended");
    assert_matches!(
        &messages[s1_end],
        OutboundMessage::SessionEnded(e) if e.reason == EndReason::Stopped
    );

    let s2_start = messages
        .iter()
        .position(|m| matches!(m, OutboundMessage::StreamStarted(s) if s.session_id == "S2"))
        .expect("S2 started");
    assert!(s1_end < s2_start);
    assert!(ai_boxes(&messages[s2_start..], "S1").is_empty());
    assert_eq!(ai_boxes(&messages, "S2").len(), 50);

    h.settle().await;
    assert_eq!(h.agent.state(), WorkerState::Idle);
}

#[tokio::test(start_paused = true)]
async fn reassigning_same_session_restarts_it() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::overlapping_pair());
    h.register().await;
    h.start("S1", 0.0).await;
    next_boxes(&mut h).await;

    h.start("S1", 4.0).await;
    assert_eq!(h.agent.current_session(), Some("S1"));

    // First the preempted run's end, then the new run from 4.0.
    h.until_ended("S1").await;
    assert_eq!(h.agent.current_session(), Some("S1"));
    let (_, timestamp, _) = next_boxes(&mut h).await;
    assert_eq!(timestamp, 4.0);
}

#[tokio::test(start_paused = true)]
async fn stalled_session_is_abandoned_after_preempt_timeout() {
    let mut h = Harness::new(
        FakeOpener::ten_seconds(),
        FakeDetector::stalling(Duration::from_secs(60)),
    );
    h.register().await;
    h.start("S1", 0.0).await;
    // Wait until S1 is stuck inside the detector and cannot see a stop.
    while h.detector.calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    let preempted_at = Instant::now();
    h.start("S2", 0.0).await;
    let waited = preempted_at.elapsed();
    assert!(waited >= Duration::from_millis(1000), "waited {waited:?}");
    assert!(waited < Duration::from_millis(1500), "waited {waited:?}");
    assert_eq!(h.agent.current_session(), Some("S2"));

    let messages = h.drain();
    assert_matches!(
        messages.first(),
        Some(OutboundMessage::StreamStarted(s)) if s.session_id == "S1"
    );
    let s1_ends: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            OutboundMessage::SessionEnded(e) if e.session_id == "S1" => Some(e.reason),
            _ => None,
        })
        .collect();
    assert_eq!(s1_ends, vec![EndReason::Stopped]);
}

// ---------------------------------------------------------------------------
// Player state
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn pause_suspends_and_play_resumes() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::overlapping_pair());
    h.register().await;
    h.start("S1", 0.0).await;
    let (_, before, _) = next_boxes(&mut h).await;

    h.send(r#"{"type":"player-state","sessionId":"S1","state":"paused"}"#).await;
    let idle = tokio::time::timeout(Duration::from_secs(5), next_boxes(&mut h)).await;
    assert!(idle.is_err(), "no frames while paused");

    h.send(r#"{"type":"player-state","sessionId":"S1","state":"playing"}"#).await;
    let resume_at = Instant::now();
    let (_, after, _) = next_boxes(&mut h).await;
    assert!(after > before);
    // Re-anchored on resume: the paused time is not made up in a burst or
    // charged as a wait.
    assert!(resume_at.elapsed() < Duration::from_millis(10));
}

#[tokio::test(start_paused = true)]
async fn player_ended_finishes_session_as_ended() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::overlapping_pair());
    h.register().await;
    h.start("S1", 0.0).await;
    next_boxes(&mut h).await;

    h.send(r#"{"type":"player-time","sessionId":"S1","time":0.4}"#).await;
    h.send(r#"{"type":"player-state","sessionId":"S1","state":"ended"}"#).await;

    let rest = h.until_ended("S1").await;
    assert_matches!(
        rest.last(),
        Some(OutboundMessage::SessionEnded(e)) if e.reason == EndReason::Ended
    );
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn unopenable_stream_reports_errors_and_returns_to_idle() {
    let mut h = Harness::new(FakeOpener::failing(), FakeDetector::overlapping_pair());
    h.register().await;
    h.start("S1", 0.0).await;

    let first = h.next_outbound().await;
    assert_matches!(first, OutboundMessage::StreamError(e) if e.session_id == "S1");

    let ended = h.next_outbound().await;
    assert_matches!(ended, OutboundMessage::SessionEnded(e) if e.reason == EndReason::Error);

    let worker_error = h.next_outbound().await;
    assert_matches!(worker_error, OutboundMessage::WorkerError(e) if e.session_id == "S1");

    assert_eq!(h.agent.state(), WorkerState::Idle);
    assert!(h.agent.current_session().is_none());

    // The worker takes new work after a failed session.
    h.start("S2", 0.0).await;
    assert_eq!(h.agent.current_session(), Some("S2"));
}

#[tokio::test(start_paused = true)]
async fn detector_failures_publish_empty_frames() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::broken());
    h.register().await;
    h.start("S1", 0.0).await;

    let messages = h.until_ended("S1").await;
    let boxes = ai_boxes(&messages, "S1");
    assert_eq!(boxes.len(), 50);
    assert!(boxes.iter().all(|(_, n)| *n == 0));
    assert_eq!(h.detector.calls.load(Ordering::SeqCst), 50);
    assert_matches!(
        messages.last(),
        Some(OutboundMessage::SessionEnded(e)) if e.reason == EndReason::Ended
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_session_and_unregisters() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::overlapping_pair());
    h.register().await;
    h.start("S1", 0.0).await;
    next_boxes(&mut h).await;

    h.agent.on_disconnected().await;
    assert_eq!(h.agent.state(), WorkerState::Unregistered);
    assert!(h.agent.current_session().is_none());

    let rest = h.until_ended("S1").await;
    assert_matches!(
        rest.last(),
        Some(OutboundMessage::SessionEnded(e)) if e.reason == EndReason::Stopped
    );

    // Assignments wait for the next acknowledgement.
    h.start("S2", 0.0).await;
    assert!(h.agent.current_session().is_none());
    h.register().await;
    h.start("S2", 0.0).await;
    assert_eq!(h.agent.current_session(), Some("S2"));
}

#[tokio::test(start_paused = true)]
async fn panicking_session_reports_error_and_returns_to_idle() {
    let mut h = Harness::new(FakeOpener::ten_seconds(), FakeDetector::panicking());
    h.register().await;
    h.start("S1", 0.0).await;

    let started = h.next_outbound().await;
    assert_matches!(started, OutboundMessage::StreamStarted(s) if s.session_id == "S1");

    let ended = h.next_outbound().await;
    assert_matches!(
        ended,
        OutboundMessage::SessionEnded(e) if e.session_id == "S1" && e.reason == EndReason::Error
    );

    let worker_error = h.next_outbound().await;
    assert_matches!(
        worker_error,
        OutboundMessage::WorkerError(e) if e.session_id == "S1" && e.message.contains("inference backend crashed")
    );

    assert_eq!(h.agent.state(), WorkerState::Idle);
    assert!(h.agent.current_session().is_none());

    h.start("S2", 0.0).await;
    assert_eq!(h.agent.current_session(), Some("S2"));
}

#[tokio::test(start_paused = true)]
async fn session_stopped_while_opening_is_never_announced() {
    let opener = Arc::new(FakeOpener::ten_seconds());
    let (sink, mut outbound) = publish::channel(16);
    let ctx = SessionContext {
        opener: opener.clone(),
        detector: Arc::new(FakeDetector::overlapping_pair()),
        sink,
        settings: Arc::new(SessionSettings::default()),
    };
    let control = Arc::new(SessionControl::new());
    control.request_stop(EndReason::Stopped);
    let (events_tx, mut events) = mpsc::unbounded_channel();

    let request = SessionRequest {
        session_id: "S1".into(),
        stream_ref: "file:///clip.mp4".into(),
        start_offset: 0.0,
    };
    let session = WorkerSession::new(1, request, ctx, control, events_tx);
    assert_eq!(session.run().await, EndReason::Stopped);

    let published = outbound.try_recv().unwrap();
    assert_matches!(
        published,
        OutboundMessage::SessionEnded(e) if e.reason == EndReason::Stopped
    );
    assert!(outbound.try_recv().is_err());
    assert_eq!(opener.closes.load(Ordering::SeqCst), 1);

    let event = events.try_recv().unwrap();
    assert_matches!(
        event.kind,
        SessionEventKind::Finished { reason: EndReason::Stopped, error: None }
    );
    assert!(events.try_recv().is_err());
}
