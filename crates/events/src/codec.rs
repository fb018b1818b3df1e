//! JSON text-frame codec for [`Envelope`]s.
//!
//! One frame carries exactly one envelope:
//! `{"id": <uuid>, "type": <tag>, "payload": <object>, "timestamp": <iso-8601>}`.
//! Decoding only insists on `type`; a frame without `id` gets a fresh one,
//! without `timestamp` the decode instant, without `payload` `null`.

use crate::error::{CodecError, Result};
use crate::types::Envelope;

pub fn encode(envelope: &Envelope) -> Result<String> {
    serde_json::to_string(envelope).map_err(CodecError::Encode)
}

pub fn decode(frame: &str) -> Result<Envelope> {
    serde_json::from_str(frame).map_err(CodecError::Frame)
}
