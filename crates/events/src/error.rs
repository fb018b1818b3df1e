use thiserror::Error;

use crate::types::EventKind;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    Frame(#[source] serde_json::Error),

    #[error("Failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Payload of {kind} does not match the expected shape: {source}")]
    Payload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("Expected a {expected} envelope, got {actual}")]
    KindMismatch { expected: EventKind, actual: EventKind },
}

pub type Result<T> = std::result::Result<T, CodecError>;
