//! Envelope errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),

    #[error("invalid {kind} message: {reason}")]
    InvalidMessage { kind: &'static str, reason: String },

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn invalid(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            kind,
            reason: reason.into(),
        }
    }
}
