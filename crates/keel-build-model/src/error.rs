use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC error object returned by a build backend.
///
/// Errors are cloneable so a single failure can be handed to every waiter of a shared
/// computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// The transport to the backend went away before a response arrived.
    pub const CONNECTION_CLOSED: i64 = -32099;
    pub const REQUEST_CANCELLED: i64 = -32800;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            Self::METHOD_NOT_FOUND,
            format!("method not found: {method}"),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }

    pub fn cancelled() -> Self {
        Self::new(Self::REQUEST_CANCELLED, "request cancelled")
    }

    pub fn connection_closed() -> Self {
        Self::new(Self::CONNECTION_CLOSED, "build server connection closed")
    }

    pub fn is_method_not_found(&self) -> bool {
        self.code == Self::METHOD_NOT_FOUND
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == Self::REQUEST_CANCELLED
    }
}

impl From<serde_json::Error> for ResponseError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(Self::PARSE_ERROR, err.to_string())
    }
}
