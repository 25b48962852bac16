//! Worker identity validation and lifecycle state machine.
//!
//! A [`Worker`] is owned by exactly one agent process and mutated only by
//! that agent's control loop. Every transition goes through a method here so
//! the "one session per worker" rule is enforced in a single place.

use std::fmt;

use serde::Serialize;

use crate::error::CoreError;
use crate::types::{SessionId, WorkerId};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum length of a worker id.
const MAX_WORKER_ID_LEN: usize = 128;

/// Prefix used by the pool supervisor when numbering workers.
pub const WORKER_ID_PREFIX: &str = "worker-";

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a worker id.
///
/// Rules:
/// - Must not be empty.
/// - Must not exceed `MAX_WORKER_ID_LEN` characters.
/// - Must contain only ASCII alphanumeric, hyphen, underscore, or dot characters.
pub fn validate_worker_id(id: &str) -> Result<(), CoreError> {
    if id.is_empty() {
        return Err(CoreError::Validation(
            "Worker id must not be empty".to_string(),
        ));
    }
    if id.len() > MAX_WORKER_ID_LEN {
        return Err(CoreError::Validation(format!(
            "Worker id must not exceed {MAX_WORKER_ID_LEN} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(CoreError::Validation(
            "Worker id may only contain alphanumeric, hyphen, underscore, or dot characters"
                .to_string(),
        ));
    }
    Ok(())
}

/// Build the id of the `index`-th pooled worker (1-based), e.g. `worker-3`.
pub fn pooled_worker_id(index: usize) -> WorkerId {
    format!("{WORKER_ID_PREFIX}{index}")
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of a worker agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Connected (or connecting) but not yet acknowledged by the coordinator.
    Unregistered,
    Idle,
    /// A session was accepted; its frame source is still being opened.
    Assigned,
    Processing,
    /// The last session failed; the failure is being reported.
    Error,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Unregistered => "unregistered",
            WorkerState::Idle => "idle",
            WorkerState::Assigned => "assigned",
            WorkerState::Processing => "processing",
            WorkerState::Error => "error",
        };
        f.write_str(s)
    }
}

/// A worker's identity, lifecycle state, and current session.
#[derive(Debug, Clone)]
pub struct Worker {
    id: WorkerId,
    state: WorkerState,
    session: Option<SessionId>,
}

impl Worker {
    /// Create a worker in the `unregistered` state.
    pub fn new(id: impl Into<WorkerId>) -> Self {
        Self {
            id: id.into(),
            state: WorkerState::Unregistered,
            session: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// The session currently owned by this worker, if any.
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// True when `session_id` names the session this worker is running.
    pub fn is_current_session(&self, session_id: &str) -> bool {
        self.session.as_deref() == Some(session_id)
    }

    /// `unregistered -> idle`, on a positive registration acknowledgement.
    pub fn mark_registered(&mut self) -> Result<(), CoreError> {
        self.expect_state(&[WorkerState::Unregistered], "register")?;
        self.state = WorkerState::Idle;
        Ok(())
    }

    /// `idle -> assigned`. Only an idle worker accepts a new session.
    pub fn assign(&mut self, session_id: impl Into<SessionId>) -> Result<(), CoreError> {
        self.expect_state(&[WorkerState::Idle], "accept an assignment")?;
        self.state = WorkerState::Assigned;
        self.session = Some(session_id.into());
        Ok(())
    }

    /// `assigned -> processing` once the session's frame source is open.
    pub fn begin_processing(&mut self, session_id: &str) -> Result<(), CoreError> {
        self.expect_session(session_id)?;
        self.expect_state(&[WorkerState::Assigned], "begin processing")?;
        self.state = WorkerState::Processing;
        Ok(())
    }

    /// `assigned | processing -> idle` after a session ends or is released.
    pub fn release(&mut self) -> Result<SessionId, CoreError> {
        self.expect_state(
            &[WorkerState::Assigned, WorkerState::Processing],
            "release a session",
        )?;
        self.state = WorkerState::Idle;
        // Busy states always carry a session.
        Ok(self.session.take().unwrap_or_default())
    }

    /// `assigned | processing -> error`. The session id is kept so the
    /// failure can be reported against it.
    pub fn fail(&mut self) -> Result<(), CoreError> {
        self.expect_state(
            &[WorkerState::Assigned, WorkerState::Processing],
            "fail a session",
        )?;
        self.state = WorkerState::Error;
        Ok(())
    }

    /// `error -> idle` once the failure has been reported.
    pub fn recover(&mut self) -> Result<SessionId, CoreError> {
        self.expect_state(&[WorkerState::Error], "recover")?;
        self.state = WorkerState::Idle;
        Ok(self.session.take().unwrap_or_default())
    }

    /// Any state `-> unregistered` on connection loss. Returns the session
    /// that was dropped, if one was active.
    pub fn disconnect(&mut self) -> Option<SessionId> {
        self.state = WorkerState::Unregistered;
        self.session.take()
    }

    fn expect_state(&self, allowed: &[WorkerState], action: &'static str) -> Result<(), CoreError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition {
                from: self.state,
                action,
            })
        }
    }

    fn expect_session(&self, session_id: &str) -> Result<(), CoreError> {
        match self.session.as_deref() {
            Some(current) if current == session_id => Ok(()),
            current => Err(CoreError::SessionMismatch {
                expected: current.unwrap_or("<none>").to_string(),
                actual: session_id.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
