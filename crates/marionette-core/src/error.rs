//! Client error types with suggestions.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{RequestId, RpcError};
use crate::state::SessionState;

/// Stable error codes for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Transport,
    Timeout,
    Remote,
    ToolFailed,
    Decode,
    SessionClosed,
    InvalidState,
    InvalidInput,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Transport => write!(f, "TRANSPORT"),
            ErrorCode::Timeout => write!(f, "TIMEOUT"),
            ErrorCode::Remote => write!(f, "REMOTE"),
            ErrorCode::ToolFailed => write!(f, "TOOL_FAILED"),
            ErrorCode::Decode => write!(f, "DECODE"),
            ErrorCode::SessionClosed => write!(f, "SESSION_CLOSED"),
            ErrorCode::InvalidState => write!(f, "INVALID_STATE"),
            ErrorCode::InvalidInput => write!(f, "INVALID_INPUT"),
        }
    }
}

/// A tool result did not have the shape an operation expects.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("result is missing {0}")]
    Missing(&'static str),

    #[error("unknown content item type '{0}'")]
    UnknownContentType(String),

    #[error("malformed {what}: {source}")]
    Shape {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid base64 image data: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Everything a driver operation can fail with.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The peer executable could not be started.
    #[error("failed to spawn peer '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Reading from or writing to the peer failed. The session is unusable.
    #[error("transport failure: {0}")]
    Transport(#[source] io::Error),

    /// No response arrived for a request within its timeout.
    #[error("request {id} ({method}) timed out after {}ms", .timeout.as_millis())]
    Timeout {
        id: RequestId,
        method: String,
        timeout: Duration,
    },

    /// The peer answered with a JSON-RPC `error`.
    #[error("peer rejected {method}: {error}")]
    Remote { method: String, error: RpcError },

    /// A tool ran but reported failure in its result.
    #[error("tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    /// The result did not decode into the expected domain value.
    #[error("could not decode {context}: {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: DecodeError,
    },

    /// The session shut down or lost its transport while the call was pending.
    #[error("session closed")]
    SessionClosed,

    /// The operation is not valid in the session's current state.
    #[error("'{operation}' requires a {required} session, but it is {actual}")]
    InvalidState {
        operation: &'static str,
        required: &'static str,
        actual: SessionState,
    },

    /// Request parameters could not be serialized.
    #[error("failed to encode {method} request: {source}")]
    Encode {
        method: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ClientError {
    pub fn decode(context: &'static str, source: DecodeError) -> Self {
        Self::Decode { context, source }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ClientError::Spawn { .. } | ClientError::Transport(_) => ErrorCode::Transport,
            ClientError::Timeout { .. } => ErrorCode::Timeout,
            ClientError::Remote { .. } => ErrorCode::Remote,
            ClientError::ToolFailed { .. } => ErrorCode::ToolFailed,
            ClientError::Decode { .. } => ErrorCode::Decode,
            ClientError::SessionClosed => ErrorCode::SessionClosed,
            ClientError::InvalidState { .. } => ErrorCode::InvalidState,
            ClientError::Encode { .. } => ErrorCode::InvalidInput,
        }
    }

    /// Whether this error ends the session.
    ///
    /// Timeouts, remote errors and decode failures only fail the one call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Spawn { .. } | ClientError::Transport(_) | ClientError::SessionClosed
        )
    }

    /// A hint on what to try next.
    pub fn suggestion(&self) -> &'static str {
        match self {
            ClientError::Spawn { .. } => {
                "Check that the peer executable is installed and on PATH, or set MARIONETTE_PEER"
            }
            ClientError::Transport(_) => {
                "The peer process may have exited. Re-run with --verbose to see its stderr"
            }
            ClientError::Timeout { .. } => {
                "Raise --timeout or check that the app is still running and responsive"
            }
            ClientError::Remote { .. } => {
                "The peer rejected the request. Run 'marionette tools' to check the available tools"
            }
            ClientError::ToolFailed { .. } => {
                "Run 'marionette elements' to check the target exists on the current screen"
            }
            ClientError::Decode { .. } => {
                "The peer returned an unexpected result. Check that the peer version is supported"
            }
            ClientError::SessionClosed => "The session is gone. Start a new one and retry",
            ClientError::InvalidState { .. } => {
                "Complete the handshake first, and connect to the app before UI operations"
            }
            ClientError::Encode { .. } => "Check the tool arguments are valid JSON",
        }
    }
}
