//! Error types for Quill Core

use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::rpc::RequestId;

/// Main error type for Quill operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Call failed: {0}")]
    Call(#[from] CallError),

    #[error("Connection is not ready (state: {0})")]
    NotReady(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of the engine subprocess or its pipes. Always fatal to the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to spawn engine process: {0}")]
    Spawn(String),

    #[error("Failed to capture engine {0}")]
    MissingPipe(&'static str),

    #[error("Broken pipe while writing to engine: {0}")]
    BrokenPipe(String),

    #[error("Failed to read from engine: {0}")]
    Read(String),

    #[error("Engine exited unexpectedly (exit code: {code:?})")]
    UnexpectedExit { code: Option<i32> },

    #[error("Transport is closed")]
    Closed,
}

/// A single line of engine output could not be turned into a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("Invalid JSON ({reason}): {snippet}")]
    InvalidJson { reason: String, snippet: String },

    #[error("Line exceeds {limit} bytes, discarded")]
    LineTooLong { limit: usize },

    #[error("Stream ended inside a message ({0} bytes pending)")]
    Truncated(usize),
}

/// A well-formed JSON value that does not fit the RPC protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Response for unknown or already resolved request: {0}")]
    UnknownRequestId(RequestId),

    #[error("Malformed response for request {id}: {reason}")]
    MalformedResponse { id: RequestId, reason: String },

    #[error("Invalid message id: {0}")]
    InvalidId(String),

    #[error("Invalid params for '{method}': {reason}")]
    InvalidParams { method: String, reason: String },

    #[error("Unrecognized message: {0}")]
    UnrecognizedMessage(String),
}

/// Error value returned by the engine in place of a `result`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RemoteError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Interpret whatever the engine put in the `error` field.
    ///
    /// Objects shaped like `{code, message, data}` are read field by field;
    /// anything else is kept verbatim in `data`.
    pub fn from_value(value: Value) -> Self {
        let code = value.get("code").and_then(Value::as_i64);
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);

        match (code, message) {
            (Some(code), Some(message)) => Self {
                code,
                message,
                data: value.get("data").cloned(),
            },
            _ => Self {
                code: 0,
                message: match &value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                },
                data: Some(value),
            },
        }
    }

    pub fn to_value(&self) -> Value {
        let mut value = serde_json::json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(data) = &self.data {
            value["data"] = data.clone();
        }
        value
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Why a connection reached its terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called.
    Shutdown,
    Transport(TransportError),
    Protocol(ProtocolError),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Shutdown => f.write_str("normal shutdown"),
            CloseReason::Transport(e) => write!(f, "transport error: {}", e),
            CloseReason::Protocol(e) => write!(f, "protocol error: {}", e),
        }
    }
}

/// Failure delivered to a request callback.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    /// The engine answered this request with an `error`.
    #[error("Engine returned error: {0}")]
    Application(RemoteError),

    #[error("Connection closed ({0})")]
    ConnectionClosed(CloseReason),

    #[error("Request timed out")]
    Timeout,

    #[error("Failed to decode result: {0}")]
    Decode(String),
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;
