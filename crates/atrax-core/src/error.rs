use serde_json::Value;
use thiserror::Error;

/// The error taxonomy shared by every layer of the proxy fabric.
///
/// Transport and session errors are recovered locally where possible; only
/// [`AtraxError::to_jsonrpc`] turns one of these into a wire-level JSON-RPC
/// error object, and that happens at exactly one boundary (Downstream/Router).
#[derive(Error, Debug)]
pub enum AtraxError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("transport closed")]
    TransportClosed,

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("write backpressure: pending buffer exceeds {limit} bytes")]
    WriteBackpressure { limit: usize },

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("upstream error {code}: {message}")]
    UpstreamError {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("session '{0}' is down")]
    SessionDown(String),

    #[error("name conflict for '{name}' between sessions '{first}' and '{second}'")]
    NameConflict {
        name: String,
        first: String,
        second: String,
    },

    #[error("unknown name: {0}")]
    UnknownName(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Standard JSON-RPC 2.0 error codes.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Proxy-internal error range, distinct from the standard JSON-RPC codes above.
    pub const SERVER_ERROR_TIMEOUT: i64 = -32000;
    pub const SERVER_ERROR_SESSION_DOWN: i64 = -32001;
    pub const SERVER_ERROR_TRANSPORT_UNAVAILABLE: i64 = -32002;
    pub const SERVER_ERROR_WRITE_BACKPRESSURE: i64 = -32003;
    pub const SERVER_ERROR_HANDSHAKE_FAILED: i64 = -32004;
}

impl AtraxError {
    /// Maps this error to a `(code, message, data)` JSON-RPC error object.
    ///
    /// This is the only place an `AtraxError` is turned into wire bytes;
    /// everywhere else it stays a typed `Result`.
    pub fn to_jsonrpc(&self) -> (i64, String, Option<Value>) {
        match self {
            AtraxError::UpstreamError {
                code,
                message,
                data,
            } => (*code, message.clone(), data.clone()),
            AtraxError::UnknownName(name) => (
                codes::METHOD_NOT_FOUND,
                format!("unknown name: {name}"),
                Some(serde_json::json!({ "name": name })),
            ),
            AtraxError::Timeout(d) => (
                codes::SERVER_ERROR_TIMEOUT,
                format!("request timed out after {d:?}"),
                None,
            ),
            AtraxError::SessionDown(name) => (
                codes::SERVER_ERROR_SESSION_DOWN,
                format!("session '{name}' is down"),
                Some(serde_json::json!({ "session": name })),
            ),
            AtraxError::TransportUnavailable(reason) => (
                codes::SERVER_ERROR_TRANSPORT_UNAVAILABLE,
                format!("transport unavailable: {reason}"),
                None,
            ),
            AtraxError::WriteBackpressure { limit } => (
                codes::SERVER_ERROR_WRITE_BACKPRESSURE,
                format!("write backpressure: pending buffer exceeds {limit} bytes"),
                None,
            ),
            AtraxError::HandshakeFailed(reason) => (
                codes::SERVER_ERROR_HANDSHAKE_FAILED,
                format!("handshake failed: {reason}"),
                None,
            ),
            AtraxError::ConfigInvalid(msg) => (codes::INVALID_REQUEST, msg.clone(), None),
            AtraxError::ProtocolViolation(msg) => (codes::INVALID_REQUEST, msg.clone(), None),
            other => (codes::INTERNAL_ERROR, other.to_string(), None),
        }
    }
}

pub type Result<T> = std::result::Result<T, AtraxError>;
