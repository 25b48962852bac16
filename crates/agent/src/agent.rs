//! Worker registration and message dispatch.
//!
//! [`WorkerAgent`] owns the worker's lifecycle state and at most one
//! running [`WorkerSession`]. Every inbound coordinator message goes
//! through [`WorkerAgent::handle_inbound`], which resolves once whether the
//! message is addressed to this worker or its current session and then
//! hands it to a typed handler. Messages for other workers or stale
//! sessions are dropped without error.

use std::sync::Arc;
use std::time::Duration;

use streamsight_core::error::CoreError;
use streamsight_core::types::{SessionId, WorkerId};
use streamsight_core::worker::{Worker, WorkerState};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinError, JoinHandle};

use crate::control::SessionControl;
use crate::messages::{
    EndReason, InboundMessage, OutboundMessage, PlayerState, Register, SessionEnded,
    StartProcessing, WorkerError, WorkerRegistered,
};
use crate::publish::EventSink;
use crate::session::{
    SessionContext, SessionEvent, SessionEventKind, SessionRequest, WorkerSession,
};

/// Default bound on how long a preempted session may take to stop.
pub const DEFAULT_PREEMPT_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub worker_id: WorkerId,
    /// Model name announced on registration.
    pub model: String,
    pub preempt_timeout: Duration,
}

/// A command addressed to the running session.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SessionCommand {
    Stop,
    Seek(f64),
    PlayerTime(f64),
    PlayerState(PlayerState),
}

/// Where an inbound message goes after addressing is resolved.
enum Route {
    Registered(WorkerRegistered),
    Start(StartProcessing),
    Session(SessionCommand),
    /// Not for this worker, or for a session it is not running.
    Drop(&'static str),
}

struct ActiveSession {
    run: u64,
    session_id: SessionId,
    control: Arc<SessionControl>,
    /// Watcher around the session task; see [`watch_session`].
    handle: JoinHandle<EndReason>,
    /// The session task itself.
    task: AbortHandle,
}

pub struct WorkerAgent {
    worker: Worker,
    model: String,
    started_at: String,
    preempt_timeout: Duration,
    ctx: SessionContext,
    active: Option<ActiveSession>,
    next_run: u64,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl WorkerAgent {
    /// Create an agent. The returned receiver carries session lifecycle
    /// events that must be fed back through
    /// [`on_session_event`](Self::on_session_event).
    pub fn new(
        options: AgentOptions,
        ctx: SessionContext,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let agent = Self {
            worker: Worker::new(options.worker_id),
            model: options.model,
            started_at: chrono::Utc::now().to_rfc3339(),
            preempt_timeout: options.preempt_timeout,
            ctx,
            active: None,
            next_run: 0,
            events_tx,
        };
        (agent, events_rx)
    }

    /// Identity announced on registration.
    pub fn worker_id(&self) -> &str {
        self.worker.id()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.worker.state()
    }

    /// Session currently owned by this worker, if any.
    pub fn current_session(&self) -> Option<&str> {
        self.worker.session()
    }

    /// True until the coordinator acknowledges registration.
    pub fn needs_registration(&self) -> bool {
        self.worker.state() == WorkerState::Unregistered
    }

    /// The `register` message for this worker.
    pub fn register_message(&self) -> OutboundMessage {
        OutboundMessage::Register(Register {
            worker_id: self.worker.id().to_string(),
            model: self.model.clone(),
            started_at: self.started_at.clone(),
        })
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Resolve addressing for `msg`. Session-scoped messages only route to
    /// the running session when the ids match; a stop without an id routes
    /// to whatever is running.
    fn route(&self, msg: InboundMessage) -> Route {
        let (target, command) = match msg {
            InboundMessage::WorkerRegistered(m) => {
                return if m.worker_id == self.worker.id() {
                    Route::Registered(m)
                } else {
                    Route::Drop("registration for another worker")
                };
            }
            InboundMessage::StartProcessing(m) => {
                return if m.worker_id != self.worker.id() {
                    Route::Drop("assignment for another worker")
                } else if self.needs_registration() {
                    Route::Drop("assignment before registration")
                } else {
                    Route::Start(m)
                };
            }
            InboundMessage::StopProcessing(m) => (m.session_id, SessionCommand::Stop),
            InboundMessage::Seek(m) => (Some(m.session_id), SessionCommand::Seek(m.time)),
            InboundMessage::PlayerTime(m) => {
                (Some(m.session_id), SessionCommand::PlayerTime(m.time))
            }
            InboundMessage::PlayerState(m) => {
                (Some(m.session_id), SessionCommand::PlayerState(m.state))
            }
        };

        let Some(active) = &self.active else {
            return Route::Drop("no active session");
        };
        match target {
            Some(id) if id != active.session_id => Route::Drop("stale session id"),
            _ => Route::Session(command),
        }
    }

    /// Handle one coordinator message.
    pub async fn handle_inbound(&mut self, msg: InboundMessage) {
        match self.route(msg) {
            Route::Registered(m) => self.on_registered(m),
            Route::Start(m) => self.on_start(m).await,
            Route::Session(command) => self.on_session_command(command),
            Route::Drop(why) => {
                tracing::trace!(worker_id = %self.worker.id(), reason = why, "Ignoring message");
            }
        }
    }

    fn on_registered(&mut self, m: WorkerRegistered) {
        if !m.success {
            tracing::warn!(
                worker_id = %self.worker.id(),
                error = m.error.as_deref().unwrap_or("unspecified"),
                "Registration rejected, will retry",
            );
            return;
        }
        match self.worker.mark_registered() {
            Ok(()) => tracing::info!(worker_id = %self.worker.id(), "Registered with coordinator"),
            Err(_) => tracing::debug!(
                worker_id = %self.worker.id(),
                state = %self.worker.state(),
                "Duplicate registration acknowledgement",
            ),
        }
    }

    async fn on_start(&mut self, m: StartProcessing) {
        if let Some(previous) = self.active.take() {
            tracing::info!(
                worker_id = %self.worker.id(),
                previous = %previous.session_id,
                next = %m.session_id,
                "Preempting active session",
            );
            self.stop_session(previous).await;
        }
        self.settle_to_idle();

        if let Err(e) = self.worker.assign(m.session_id.clone()) {
            tracing::error!(worker_id = %self.worker.id(), error = %e, "Cannot accept assignment");
            return;
        }

        self.next_run += 1;
        let run = self.next_run;
        let control = Arc::new(SessionControl::new());
        let request = SessionRequest {
            session_id: m.session_id.clone(),
            stream_ref: m.stream_ref,
            start_offset: m.start_offset,
        };

        tracing::info!(
            worker_id = %self.worker.id(),
            session_id = %request.session_id,
            stream_ref = %request.stream_ref,
            start_offset = request.start_offset,
            "Session assigned",
        );

        let session = WorkerSession::new(
            run,
            request,
            self.ctx.clone(),
            control.clone(),
            self.events_tx.clone(),
        );
        let task = tokio::spawn(session.run());
        let abort = task.abort_handle();
        let handle = tokio::spawn(watch_session(
            task,
            run,
            m.session_id.clone(),
            self.ctx.sink.clone(),
            self.events_tx.clone(),
        ));

        self.active = Some(ActiveSession {
            run,
            session_id: m.session_id,
            control,
            handle,
            task: abort,
        });
    }

    fn on_session_command(&mut self, command: SessionCommand) {
        let Some(active) = &self.active else {
            return;
        };
        let control = &active.control;
        match command {
            SessionCommand::Stop => {
                tracing::info!(session_id = %active.session_id, "Stop requested");
                control.request_stop(EndReason::Stopped);
            }
            SessionCommand::Seek(time) => {
                tracing::debug!(session_id = %active.session_id, time, "Seek requested");
                control.request_seek(time);
            }
            SessionCommand::PlayerTime(time) => control.set_player_time(time),
            SessionCommand::PlayerState(PlayerState::Paused) => control.set_paused(true),
            SessionCommand::PlayerState(PlayerState::Playing) => control.set_paused(false),
            SessionCommand::PlayerState(PlayerState::Ended) => {
                control.request_stop(EndReason::Ended)
            }
            SessionCommand::PlayerState(PlayerState::Other) => {}
        }
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Apply a lifecycle event from a session. Events from runs other than
    /// the active one are ignored.
    pub fn on_session_event(&mut self, event: SessionEvent) {
        let is_current = self
            .active
            .as_ref()
            .is_some_and(|a| a.run == event.run && a.session_id == event.session_id);
        if !is_current {
            tracing::trace!(session_id = %event.session_id, run = event.run, "Ignoring stale session event");
            return;
        }

        match event.kind {
            SessionEventKind::Started => {
                if let Err(e) = self.worker.begin_processing(&event.session_id) {
                    tracing::warn!(session_id = %event.session_id, error = %e, "Unexpected start event");
                }
            }
            SessionEventKind::Finished { reason, error } => {
                self.active = None;
                match reason {
                    EndReason::Error => self.fail_session(&event.session_id, error),
                    EndReason::Ended | EndReason::Stopped => {
                        if let Err(e) = self.worker.release() {
                            tracing::warn!(session_id = %event.session_id, error = %e, "Release failed");
                        }
                    }
                }
                tracing::info!(
                    worker_id = %self.worker.id(),
                    session_id = %event.session_id,
                    ?reason,
                    state = %self.worker.state(),
                    "Worker available",
                );
            }
        }
    }

    /// Report a failed session and return to idle.
    fn fail_session(&mut self, session_id: &str, error: Option<String>) {
        let message = error.unwrap_or_else(|| "session failed".to_string());
        if let Err(e) = self.worker.fail() {
            tracing::warn!(session_id, error = %e, "Cannot mark worker failed");
        }
        self.ctx
            .sink
            .publish_or_log(OutboundMessage::WorkerError(WorkerError {
                session_id: session_id.to_string(),
                message,
            }));
        if let Err(e) = self.worker.recover() {
            tracing::warn!(session_id, error = %e, "Cannot recover worker");
        }
    }

    /// Ask a session to stop and wait for it, up to the preemption bound.
    /// A session that does not stop in time is aborted.
    async fn stop_session(&mut self, mut active: ActiveSession) {
        active.control.request_stop(EndReason::Stopped);
        match tokio::time::timeout(self.preempt_timeout, &mut active.handle).await {
            Ok(Ok(reason)) => {
                tracing::debug!(session_id = %active.session_id, ?reason, "Session stopped");
            }
            Ok(Err(e)) => {
                tracing::warn!(session_id = %active.session_id, error = %e, "Session task failed");
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %active.session_id,
                    timeout_ms = self.preempt_timeout.as_millis() as u64,
                    "Session did not stop in time, aborting",
                );
                active.task.abort();
                active.handle.abort();
                self.ctx
                    .sink
                    .publish_or_log(OutboundMessage::SessionEnded(SessionEnded {
                        session_id: active.session_id.clone(),
                        reason: EndReason::Stopped,
                    }));
            }
        }
    }

    /// Bring a busy or failed worker back to idle after its session has
    /// been taken away.
    fn settle_to_idle(&mut self) {
        let result: Result<(), CoreError> = match self.worker.state() {
            WorkerState::Assigned | WorkerState::Processing => self.worker.release().map(|_| ()),
            WorkerState::Error => self.worker.recover().map(|_| ()),
            WorkerState::Idle | WorkerState::Unregistered => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(worker_id = %self.worker.id(), error = %e, "Cannot return to idle");
        }
    }

    /// The coordinator link dropped: stop any session and fall back to
    /// unregistered until the next acknowledgement.
    pub async fn on_disconnected(&mut self) {
        if let Some(active) = self.active.take() {
            self.stop_session(active).await;
        }
        if let Some(session_id) = self.worker.disconnect() {
            tracing::warn!(
                worker_id = %self.worker.id(),
                session_id = %session_id,
                "Coordinator link lost during session",
            );
        }
    }

    /// Stop any running session before the process exits.
    pub async fn shutdown(&mut self) {
        if let Some(active) = self.active.take() {
            self.stop_session(active).await;
            self.settle_to_idle();
        }
    }
}

/// Await a session task and report it as failed if it panicked, so the
/// agent still sees `Finished` and returns to idle. An aborted task is the
/// preemption path, which reports on its own.
async fn watch_session(
    task: JoinHandle<EndReason>,
    run: u64,
    session_id: SessionId,
    sink: EventSink,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> EndReason {
    let error = match task.await {
        Ok(reason) => return reason,
        Err(e) if e.is_cancelled() => return EndReason::Stopped,
        Err(e) => panic_message(e),
    };

    tracing::error!(session_id = %session_id, error = %error, "Session task panicked");
    sink.publish_or_log(OutboundMessage::SessionEnded(SessionEnded {
        session_id: session_id.clone(),
        reason: EndReason::Error,
    }));
    let event = SessionEvent {
        run,
        session_id,
        kind: SessionEventKind::Finished {
            reason: EndReason::Error,
            error: Some(error),
        },
    };
    if events.send(event).is_err() {
        tracing::debug!("Agent no longer listening for session events");
    }
    EndReason::Error
}

fn panic_message(e: JoinError) -> String {
    let payload = match e.try_into_panic() {
        Ok(payload) => payload,
        Err(e) => return e.to_string(),
    };
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("session panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("session panicked: {s}")
    } else {
        "session panicked".to_string()
    }
}
