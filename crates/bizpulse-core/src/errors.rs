use thiserror::Error;

/// Failures decoding frames or payloads.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
    #[error("unknown message kind: {0}")]
    UnknownKind(String),
}

impl ProtocolError {
    /// Code sent back to the client in an `error` frame.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => crate::messages::codes::INVALID_JSON,
            Self::InvalidPayload { .. } => crate::messages::codes::INVALID_PAYLOAD,
            Self::UnknownKind(_) => crate::messages::codes::UNKNOWN_ERROR,
        }
    }
}
