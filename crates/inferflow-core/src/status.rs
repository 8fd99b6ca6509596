//! Result codes and facade-level errors.
//!
//! `Status` travels with every item through the pipeline and into the
//! completion callback; `Error` is what the facade returns when a call is
//! rejected before any work is enqueued.

use serde::{Deserialize, Serialize};

/// Per-item result code carried through the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// The item was processed (or explicitly discarded by the client).
    #[default]
    Success,
    /// A processor or the accelerator backend failed.
    ErrorBackend,
    /// A payload could not be downcast to the expected type.
    WrongType,
    /// The request timed out before completing.
    Timeout,
    /// An argument was rejected before the request was enqueued.
    InvalidParam,
}

impl Status {
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Success => "Success",
            Status::ErrorBackend => "ErrorBackend",
            Status::WrongType => "WrongType",
            Status::Timeout => "Timeout",
            Status::InvalidParam => "InvalidParam",
        };
        f.write_str(s)
    }
}

/// Errors returned by the facade for rejected calls.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("backend failure: {0}")]
    Backend(String),

    #[error("request timed out")]
    Timeout,

    #[error("wrong payload type: {0}")]
    WrongType(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_success() {
        assert!(Status::Success.is_success());
        assert!(!Status::Timeout.is_success());
        assert!(!Status::ErrorBackend.is_success());
    }

    #[test]
    fn test_display() {
        assert_eq!(Status::Timeout.to_string(), "Timeout");
        assert_eq!(Status::default().to_string(), "Success");
    }
}
