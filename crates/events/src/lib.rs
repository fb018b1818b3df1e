//! Event system for the interview session transport
//!
//! This crate provides the wire envelope, the envelope codec, the typed
//! domain payloads and the subscription bus that routes decoded envelopes
//! to handlers.

mod bus;
pub mod codec;
mod error;
mod payloads;
mod types;

pub use bus::{handler, DispatchReport, EventBus, Handler, HandlerRef, Subscription};
pub use error::{CodecError, Result};
pub use payloads::*;
pub use types::*;
