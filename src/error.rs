use std::io;

use thiserror::Error;
use tonic::Status;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} is already running")]
    AlreadyRunning(String),

    #[error("failed to launch engine: {0}")]
    Spawn(#[from] io::Error),

    #[error("session {id} failed to start: {reason}")]
    StartFailed { id: String, reason: String },

    #[error("session {0} is not running")]
    NotRunning(String),

    /// Only surfaced through status notifications, never returned by a call.
    #[error("session {id} hit a fatal stream error: {pattern}")]
    FatalStream { id: String, pattern: &'static str },

    #[error("invalid session descriptor: {0}")]
    InvalidDescriptor(String),
}

impl From<SessionError> for Status {
    fn from(err: SessionError) -> Self {
        let message = err.to_string();
        match err {
            SessionError::AlreadyRunning(_) => Status::already_exists(message),
            SessionError::Spawn(_) => Status::unavailable(message),
            SessionError::StartFailed { .. } => Status::aborted(message),
            SessionError::NotRunning(_) => Status::failed_precondition(message),
            SessionError::FatalStream { .. } => Status::internal(message),
            SessionError::InvalidDescriptor(_) => Status::invalid_argument(message),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} has an invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
