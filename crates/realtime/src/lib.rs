//! Real-time transport for interview sessions.
//!
//! [`ConnectionManager`] keeps one persistent connection per session,
//! reconnecting with exponential backoff when it drops, and dispatches every
//! inbound event on an [`events::EventBus`]. [`SessionEvents`] layers the
//! named session events on top.

mod config;
mod error;
mod facade;
mod manager;
pub mod memory;
mod policy;
mod stats;
pub mod timer;
mod transport;
mod websocket;

pub use config::{ConnectionConfig, DEFAULT_WS_URL, WS_URL_ENV};
pub use error::{ConfigError, Result, TransportError};
pub use facade::SessionEvents;
pub use manager::{ConnectionManager, ConnectionManagerBuilder, ConnectionState};
pub use policy::{ReconnectPolicy, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS};
pub use stats::StatsSnapshot;
pub use timer::{ManualTimer, Timer, TokioTimer};
pub use transport::{FrameSink, SessionTarget, Transport, TransportChannel, TransportEvent};
pub use websocket::WebSocketTransport;
