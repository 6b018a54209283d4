//! Error taxonomy shared by the daemon and its clients.
//!
//! Every [`ExecdError`] variant has a matching [`ErrorKind`] so that a failure
//! raised inside the daemon is rebuilt into the same variant on the client
//! side of the wire.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result alias used throughout execd.
pub type ExecdResult<T> = Result<T, ExecdError>;

/// Errors produced by exec session operations.
#[derive(Debug, Error)]
pub enum ExecdError {
    /// Unknown exec session or container reference.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation not valid for the current session or container state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Malformed request (empty command, relative working dir, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Namespace entry or process creation failed.
    #[error("launch failed: {0}")]
    Launch(String),

    /// uid/gid/name resolution failed.
    #[error("identity: {0}")]
    Identity(String),

    /// Caller-side give-up. Never stored in session state.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Malformed frame or control message.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Daemon configuration is unusable.
    #[error("config: {0}")]
    Config(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Serialisable discriminant of [`ExecdError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    InvalidArgument,
    Launch,
    Identity,
    Timeout,
    Protocol,
    Config,
    Internal,
    Io,
}

impl ExecdError {
    /// Wire discriminant for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecdError::NotFound(_) => ErrorKind::NotFound,
            ExecdError::InvalidState(_) => ErrorKind::InvalidState,
            ExecdError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ExecdError::Launch(_) => ErrorKind::Launch,
            ExecdError::Identity(_) => ErrorKind::Identity,
            ExecdError::Timeout(_) => ErrorKind::Timeout,
            ExecdError::Protocol(_) => ErrorKind::Protocol,
            ExecdError::Config(_) => ErrorKind::Config,
            ExecdError::Internal(_) => ErrorKind::Internal,
            ExecdError::Io(_) => ErrorKind::Io,
        }
    }

    /// Message without the kind prefix added by `Display`.
    pub fn message(&self) -> String {
        match self {
            ExecdError::NotFound(m)
            | ExecdError::InvalidState(m)
            | ExecdError::InvalidArgument(m)
            | ExecdError::Launch(m)
            | ExecdError::Identity(m)
            | ExecdError::Timeout(m)
            | ExecdError::Protocol(m)
            | ExecdError::Config(m)
            | ExecdError::Internal(m) => m.clone(),
            ExecdError::Io(e) => e.to_string(),
        }
    }

    /// Rebuild an error received over the wire.
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::NotFound => ExecdError::NotFound(message),
            ErrorKind::InvalidState => ExecdError::InvalidState(message),
            ErrorKind::InvalidArgument => ExecdError::InvalidArgument(message),
            ErrorKind::Launch => ExecdError::Launch(message),
            ErrorKind::Identity => ExecdError::Identity(message),
            ErrorKind::Timeout => ExecdError::Timeout(message),
            ErrorKind::Protocol => ExecdError::Protocol(message),
            ErrorKind::Config => ExecdError::Config(message),
            ErrorKind::Internal => ExecdError::Internal(message),
            ErrorKind::Io => ExecdError::Io(io::Error::other(message)),
        }
    }
}

impl From<serde_json::Error> for ExecdError {
    fn from(err: serde_json::Error) -> Self {
        ExecdError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip_keeps_variant() {
        let err = ExecdError::Identity("unable to find user nobody2".into());
        let rebuilt = ExecdError::from_wire(err.kind(), err.message());
        assert!(matches!(rebuilt, ExecdError::Identity(ref m) if m == "unable to find user nobody2"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::InvalidState).unwrap();
        assert_eq!(json, "\"invalid_state\"");
    }

    #[test]
    fn test_display_has_category_prefix() {
        let err = ExecdError::NotFound("exec abc".into());
        assert_eq!(err.to_string(), "not found: exec abc");
    }
}
