//! Error types for muxwire.
//!
//! Transport and framing faults terminate the connection and reach every
//! pending caller as [`ClientError::ConnectionClosed`]. Application failures
//! reported by the server arrive on normal response frames and are turned
//! into [`ClientError::Server`] by [`map_error_payload`].

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::client::ConnectionState;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The transport could not be established (refused, unreachable, timed out).
    #[error("Connect error: {0}")]
    Connect(String),

    /// Credentials were rejected by the server.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Malformed frame header (checkbit mismatch, oversized length).
    #[error("Framing error: {0}")]
    Framing(String),

    /// Request submitted while the connection is not ready.
    #[error("Connection not ready (state: {0:?})")]
    NotReady(ConnectionState),

    /// The caller's deadline elapsed before a response arrived.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection was torn down while the request was pending.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Every request id is currently outstanding.
    #[error("Request ids exhausted")]
    IdsExhausted,

    /// A request id was registered twice.
    #[error("Duplicate request id: {0}")]
    DuplicateId(u16),

    /// Application-level failure reported by the server.
    #[error("{kind:?} ({code}): {message}")]
    Server {
        /// Mapped error kind.
        kind: ErrorKind,
        /// Raw error code as sent by the server.
        code: i64,
        /// Server-supplied message, unmodified.
        message: String,
    },

    /// I/O error on the socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// JSON conversion error for argument or event values.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl ClientError {
    /// The server error kind, if this is an application-level error.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Server { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// The server-supplied message, if this is an application-level error.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            ClientError::Server { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Whether the error ended the whole connection rather than one request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Framing(_) | ClientError::ConnectionClosed | ClientError::Io(_)
        )
    }

    /// Duplicate the error for fan-out to several waiters.
    ///
    /// Only the variants that are delivered to more than one pending request
    /// need to be exact; anything else collapses to `ConnectionClosed`.
    pub(crate) fn fan_out(&self) -> ClientError {
        match self {
            ClientError::Timeout(d) => ClientError::Timeout(*d),
            ClientError::Framing(msg) => ClientError::Framing(msg.clone()),
            ClientError::Auth(msg) => ClientError::Auth(msg.clone()),
            _ => ClientError::ConnectionClosed,
        }
    }
}

/// Result type alias using ClientError.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Application-level error kinds the server reports on response frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed request: syntax, bad data, invalid value, wrong arity.
    BadRequest,
    /// Requested item does not exist.
    Lookup,
    /// Value has the wrong type.
    Type,
    /// Integer overflow.
    Overflow,
    /// Division by zero.
    ZeroDivision,
    /// Operation not permitted, and the fallback for unknown codes.
    Operation,
    /// Caller lacks the required privileges.
    Forbidden,
    /// Explicit assertion failed.
    Assertion,
    /// Node-level failure (not ready, shutting down, ...).
    Node,
    /// Credentials refused for this request.
    Auth,
}

/// Wire error codes.
pub mod codes {
    /// Assertion failed in server code.
    pub const ASSERTION: i64 = -50;
    /// Node unavailable or not ready.
    pub const NODE: i64 = -51;
    /// Code did not parse.
    pub const SYNTAX: i64 = -52;
    /// Malformed request data.
    pub const BAD_DATA: i64 = -53;
    /// Name or index not found.
    pub const LOOKUP: i64 = -54;
    /// Missing privileges for the scope.
    pub const FORBIDDEN: i64 = -55;
    /// Authentication failed.
    pub const AUTH: i64 = -56;
    /// Quota exceeded.
    pub const MAX_QUOTA: i64 = -57;
    /// Division by zero.
    pub const ZERO_DIV: i64 = -58;
    /// Integer overflow.
    pub const OVERFLOW: i64 = -59;
    /// Invalid value.
    pub const VALUE: i64 = -60;
    /// Wrong type.
    pub const TYPE: i64 = -61;
    /// Wrong number of arguments.
    pub const NUM_ARGUMENTS: i64 = -62;
    /// Operation not allowed. Unknown codes map here as well.
    pub const OPERATION: i64 = -63;
}

impl ErrorKind {
    /// Map a raw server error code to its kind.
    pub fn from_code(code: i64) -> Self {
        match code {
            codes::ASSERTION => ErrorKind::Assertion,
            codes::NODE => ErrorKind::Node,
            codes::SYNTAX | codes::BAD_DATA | codes::VALUE | codes::NUM_ARGUMENTS => {
                ErrorKind::BadRequest
            }
            codes::LOOKUP => ErrorKind::Lookup,
            codes::FORBIDDEN => ErrorKind::Forbidden,
            codes::AUTH => ErrorKind::Auth,
            codes::ZERO_DIV => ErrorKind::ZeroDivision,
            codes::OVERFLOW => ErrorKind::Overflow,
            codes::TYPE => ErrorKind::Type,
            _ => ErrorKind::Operation,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error_code: i64,
    error_msg: String,
}

/// Translate an error response payload into a typed error.
///
/// Never fails: a payload that cannot be decoded becomes an
/// [`ErrorKind::Operation`] error describing the problem.
pub fn map_error_payload(payload: &[u8]) -> ClientError {
    match rmp_serde::from_slice::<ErrorPayload>(payload) {
        Ok(err) => ClientError::Server {
            kind: ErrorKind::from_code(err.error_code),
            code: err.error_code,
            message: err.error_msg,
        },
        Err(e) => ClientError::Server {
            kind: ErrorKind::Operation,
            code: codes::OPERATION,
            message: format!("undecodable error payload: {}", e),
        },
    }
}
