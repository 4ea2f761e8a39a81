//! Error type shared by every layer of the client.
//!
//! Connection-level failures (`Connect`, `Io`, `Disconnected`) are what a
//! caller sees when the daemon goes away. `Protocol` means the peer sent
//! bytes that are not a delimited UTF-8 JSON document. Application errors
//! (a response carrying an `error` member) are ordinary data and only become
//! [`RpcError::Remote`] when the caller asks for it via
//! [`Frame::into_result`](crate::frame::Frame::into_result).

use std::path::PathBuf;

use crate::frame::RequestId;

/// Result alias used throughout the library.
pub type Result<T, E = RpcError> = std::result::Result<T, E>;

/// Errors produced by the client.
#[derive(Debug)]
pub enum RpcError {
    /// Could not open the socket.
    Connect {
        /// Endpoint that was dialled.
        path: PathBuf,
        /// Underlying OS error.
        source: std::io::Error,
    },
    /// Read or write failed on an established connection.
    Io(std::io::Error),
    /// The primary connection is no longer served (shutdown or peer closed).
    Disconnected,
    /// A frame was not valid UTF-8 or not valid JSON.
    Protocol(String),
    /// The request could not be built from the caller's input.
    InvalidRequest(String),
    /// A caller-supplied id is already waiting for a response.
    DuplicateId(RequestId),
    /// The daemon answered with an `error` member.
    Remote {
        /// Human-readable message from `error.message`.
        message: String,
        /// The complete `error` value.
        error: serde_json::Value,
    },
}

impl RpcError {
    /// Returns `true` for failures of the transport itself.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Io(_) | Self::Disconnected)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect { path, source } => {
                write!(f, "Failed to connect to {}: {source}", path.display())
            }
            Self::Io(e) => write!(f, "Socket I/O error: {e}"),
            Self::Disconnected => write!(f, "Connection closed"),
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            Self::InvalidRequest(msg) => write!(f, "Invalid request: {msg}"),
            Self::DuplicateId(id) => write!(f, "Request id already pending: {id}"),
            Self::Remote { message, .. } => write!(f, "Remote error: {message}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connect { source, .. } => Some(source),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
