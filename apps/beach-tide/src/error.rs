use std::time::Duration;

use thiserror::Error;

use crate::host::HostError;
use crate::session::SessionStatus;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session {0} is not connected")]
    SessionNotConnected(String),
    #[error("host did not answer {call} within {timeout:?}")]
    HostUnresponsive {
        call: &'static str,
        timeout: Duration,
    },
    #[error("host failed to spawn session {id}: {message}")]
    SpawnFailed { id: String, message: String },
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error("session {0} was removed")]
    SessionRemoved(String),
    #[error("cannot {operation} session {id} while it is {status}")]
    InvalidTransition {
        id: String,
        operation: &'static str,
        status: SessionStatus,
    },
    #[error("another lifecycle operation is running for session {0}")]
    OperationPending(String),
    #[error("host error: {0}")]
    Host(HostError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<HostError> for EngineError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::Unresponsive { call, timeout } => {
                EngineError::HostUnresponsive { call, timeout }
            }
            HostError::Transport(inner) => EngineError::Transport(inner),
            other => EngineError::Host(other),
        }
    }
}

impl EngineError {
    /// Failures that may succeed if the caller tries again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::HostUnresponsive { .. }
                | EngineError::OperationPending(_)
                | EngineError::Transport(_)
        )
    }
}
