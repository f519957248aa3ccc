//! Call-related error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("relay transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("media negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("parse error: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        CallError::Parse(err.to_string())
    }
}
