use crate::worker::WorkerState;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid worker transition: cannot {action} while {from}")]
    InvalidTransition {
        from: WorkerState,
        action: &'static str,
    },

    #[error("Session mismatch: expected {expected}, got {actual}")]
    SessionMismatch { expected: String, actual: String },
}
