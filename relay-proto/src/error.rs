//! Protocol error codes and client-side error types.
//!
//! Error codes are string tags on the wire; `fatal` on an ERROR envelope is
//! advisory to the client's reconnect policy.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable error codes carried by ERROR envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Frame or payload failed to decode.
    Malformed,
    /// Declared frame length exceeds the negotiated maximum.
    FrameTooLarge,
    /// Envelope type tag not recognized.
    UnknownType,
    /// SEND addressed to a name the registry has never seen.
    UnknownRecipient,
    /// CHANNEL_MESSAGE from a non-member.
    NotMember,
    /// HELLO for an agent name that already has a live session.
    DuplicateConnection,
    /// Resume token expired or unknown.
    ResumeTooOld,
    /// A sync wait or RPC deadline expired.
    Timeout,
    /// Unexpected server-side failure.
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "MALFORMED",
            Self::FrameTooLarge => "FRAME_TOO_LARGE",
            Self::UnknownType => "UNKNOWN_TYPE",
            Self::UnknownRecipient => "UNKNOWN_RECIPIENT",
            Self::NotMember => "NOT_MEMBER",
            Self::DuplicateConnection => "DUPLICATE_CONNECTION",
            Self::ResumeTooOld => "RESUME_TOO_OLD",
            Self::Timeout => "TIMEOUT",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Whether the server tears the session down after emitting this code.
    pub fn default_fatal(&self) -> bool {
        matches!(
            self,
            Self::Malformed | Self::FrameTooLarge | Self::DuplicateConnection
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a pending request or sync wait failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The deadline expired before a response arrived.
    Timeout,
    /// The owning session disconnected with waiters outstanding.
    Disconnected,
    /// The server answered with an ERROR envelope.
    Rejected(ErrorCode, String),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timed out"),
            Self::Disconnected => f.write_str("session disconnected"),
            Self::Rejected(code, msg) => write!(f, "{}: {}", code, msg),
        }
    }
}

/// Errors surfaced by the daemon client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected to the daemon")]
    NotConnected,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("server error {code}: {message}")]
    Server { code: ErrorCode, message: String },
    #[error("request failed: {0}")]
    Failed(FailureCause),
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] crate::frame::FrameError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_round_trip() {
        for code in [
            ErrorCode::Malformed,
            ErrorCode::FrameTooLarge,
            ErrorCode::UnknownType,
            ErrorCode::UnknownRecipient,
            ErrorCode::NotMember,
            ErrorCode::DuplicateConnection,
            ErrorCode::ResumeTooOld,
            ErrorCode::Timeout,
            ErrorCode::InternalError,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
            let back: ErrorCode = serde_json::from_str(&json).unwrap();
            assert_eq!(back, code);
        }
    }

    #[test]
    fn test_default_fatal() {
        assert!(ErrorCode::DuplicateConnection.default_fatal());
        assert!(!ErrorCode::ResumeTooOld.default_fatal());
        assert!(!ErrorCode::NotMember.default_fatal());
    }
}
