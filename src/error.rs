//! Typed error taxonomy feeding the JSON `error` event boundary.
//!
//! Internal call chains keep using `anyhow::Result` with `?`, the same as
//! the rest of the crate. `ErrorKind` only exists at the handful of sites
//! that need to decide the `code` field of an outgoing `error` event.

use serde::Serialize;
use thiserror::Error;

/// The `code` field of an `error` event: a numeric HTTP-ish status, or the
/// literal `"other"` for conditions that don't map to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Numeric(u32),
    Other,
}

impl Serialize for ErrorCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            ErrorCode::Numeric(n) => serializer.serialize_u32(*n),
            ErrorCode::Other => serializer.serialize_str("other"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("transient network error: {0}")]
    Transient(String),

    #[error("auth not ready")]
    AuthNotReady,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("fatal startup error {code}: {reason}")]
    FatalStartup { code: u32, reason: String },

    #[error("audio/tts failure: {0}")]
    AudioFailure(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ErrorKind {
    /// The `code` field of the `error` event: 409/404/500/other.
    pub fn code(&self) -> ErrorCode {
        match self {
            ErrorKind::FatalStartup { code, .. } => ErrorCode::Numeric(*code),
            ErrorKind::Internal(_) => ErrorCode::Numeric(500),
            _ => ErrorCode::Other,
        }
    }

    pub fn reason(&self) -> String {
        self.to_string()
    }

    /// Whether the condition that produced this error is worth retrying
    /// with backoff, versus surfacing immediately and giving up.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ErrorKind::Transient(_) | ErrorKind::AuthNotReady)
    }

    /// Whether this error should end the process — fatal-startup codes
    /// are the only ones that do.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::FatalStartup { .. })
    }
}

/// Classifies a raw `reqwest` error as transient: connection reset,
/// refused, timed out, broken pipe, or DNS failure.
pub fn classify_reqwest_error(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() || err.is_connect() {
        return ErrorKind::Transient(err.to_string());
    }
    ErrorKind::Internal(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_startup_code_passthrough() {
        let err = ErrorKind::FatalStartup {
            code: 409,
            reason: "Riot client already running".to_string(),
        };
        assert_eq!(err.code(), ErrorCode::Numeric(409));
        assert!(err.is_fatal());
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_internal_maps_to_500() {
        let err = ErrorKind::Internal("boom".to_string());
        assert_eq!(err.code(), ErrorCode::Numeric(500));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_transient_is_retriable_and_other_code() {
        let err = ErrorKind::Transient("connection reset".to_string());
        assert_eq!(err.code(), ErrorCode::Other);
        assert!(err.is_retriable());
    }

    #[test]
    fn test_auth_not_ready_is_retriable() {
        assert!(ErrorKind::AuthNotReady.is_retriable());
        assert!(!ErrorKind::AuthNotReady.is_fatal());
    }
}
