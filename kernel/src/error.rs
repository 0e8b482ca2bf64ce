// Stream Errors
//
// The error taxonomy visible at the stream boundary. Append conflicts
// and bridge gaps are recovered internally and never show up here.

use crate::bridge::BridgeError;
use crate::frame::ErrorFrame;
use crate::log::LogError;
use crate::state::StateError;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Caller may not observe this build. Nothing was read or sent.
    #[error("authorization denied")]
    AuthorizationDenied,

    /// Transient storage failure; reconnecting with the last seen id recovers.
    #[error("event log unavailable: {0}")]
    LogUnavailable(String),

    /// An ordering bug was caught before it reached the client.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("live subscription refused: {0}")]
    Bridge(#[from] BridgeError),
}

/// How the boundary should report a failed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    AccessDenied,
    Retryable,
    Aborted,
}

impl StreamStatus {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StreamStatus::AccessDenied)
    }
}

impl StreamError {
    pub fn status(&self) -> StreamStatus {
        match self {
            StreamError::AuthorizationDenied => StreamStatus::AccessDenied,
            StreamError::LogUnavailable(_) | StreamError::Bridge(_) => StreamStatus::Retryable,
            StreamError::ProtocolViolation(_) => StreamStatus::Aborted,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            StreamError::AuthorizationDenied => "access_denied",
            StreamError::LogUnavailable(_) => "log_unavailable",
            StreamError::ProtocolViolation(_) => "protocol_violation",
            StreamError::Bridge(_) => "stream_capacity",
        }
    }

    pub fn to_error_frame(&self) -> ErrorFrame {
        ErrorFrame {
            code: self.code().to_string(),
            message: self.to_string(),
            retryable: self.status().is_retryable(),
        }
    }
}

impl From<LogError> for StreamError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::Unavailable(reason) => StreamError::LogUnavailable(reason),
            other => StreamError::LogUnavailable(other.to_string()),
        }
    }
}

impl From<StateError> for StreamError {
    fn from(err: StateError) -> Self {
        StreamError::ProtocolViolation(err.to_string())
    }
}
