#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("message too large: {len} > {max}")]
    MessageTooLarge { len: usize, max: usize },

    #[error("missing Content-Length header")]
    MissingContentLength,

    #[error("invalid header line: {line}")]
    InvalidHeader { line: String },

    #[error("decode error: {message}")]
    Decode { message: String },

    #[error("connection closed")]
    ConnectionClosed,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Decode {
            message: err.to_string(),
        }
    }
}
