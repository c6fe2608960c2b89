//! Rollout engine error types.

use thiserror::Error;

use helmsman_core::WorkloadRef;
use helmsman_state::{RolloutState, StateError};

use crate::adapter::AdapterError;
use crate::machine::Command;

pub type RolloutResult<T> = Result<T, RolloutError>;

/// Errors surfaced by the dispatcher and the convergence monitor.
#[derive(Debug, Clone, Error)]
pub enum RolloutError {
    /// Missing or unknown input the caller can correct.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{workload} is already supervised by {holder}")]
    Conflict { workload: WorkloadRef, holder: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cannot {command} a rollout that is {from}")]
    InvalidTransition { from: RolloutState, command: Command },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("target deleted: {0}")]
    Deletion(String),

    #[error("state store error: {0}")]
    State(StateError),

    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("unexpected: {0}")]
    Unexpected(String),
}

/// Coarse classification for callers that map errors onto responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    InvalidTransition,
    Timeout,
    Deletion,
    Unexpected,
}

impl RolloutError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RolloutError::Validation(_) => ErrorKind::Validation,
            RolloutError::Conflict { .. } => ErrorKind::Conflict,
            RolloutError::NotFound(_) => ErrorKind::NotFound,
            RolloutError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            RolloutError::Timeout(_) => ErrorKind::Timeout,
            RolloutError::Deletion(_) => ErrorKind::Deletion,
            RolloutError::State(_) | RolloutError::Adapter(_) | RolloutError::Unexpected(_) => {
                ErrorKind::Unexpected
            }
        }
    }

    /// Errors the caller can fix by changing the request.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation
                | ErrorKind::Conflict
                | ErrorKind::NotFound
                | ErrorKind::InvalidTransition
        )
    }
}

impl From<StateError> for RolloutError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(key) => RolloutError::NotFound(key),
            other => RolloutError::State(other),
        }
    }
}
