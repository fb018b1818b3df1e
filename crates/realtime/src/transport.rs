//! Transport capability used by the connection manager.
//!
//! A transport opens one duplex channel per call: frames are written through
//! the returned [`FrameSink`], and messages, errors and the final close arrive
//! on the event receiver. Dropping the receiver detaches the channel, so
//! notifications from an abandoned transport can never reach the manager.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::error::{Result, TransportError};

/// Where to connect: the relay base URL plus the session scope
#[derive(Clone, PartialEq, Eq)]
pub struct SessionTarget {
    base_url: Url,
    session_id: String,
    credential: String,
}

impl SessionTarget {
    pub fn new(base_url: Url, session_id: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            base_url,
            session_id: session_id.into(),
            credential: credential.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    /// `{base}/ws?session_id={id}&token={credential}`
    pub fn url(&self) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                TransportError::InvalidTarget(format!("{} cannot be a base URL", self.base_url))
            })?
            .pop_if_empty()
            .push("ws");
        url.query_pairs_mut()
            .append_pair("session_id", &self.session_id)
            .append_pair("token", &self.credential);
        Ok(url)
    }
}

impl fmt::Debug for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTarget")
            .field("base_url", &self.base_url.as_str())
            .field("session_id", &self.session_id)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// Notification from an open transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame arrived
    Message(String),
    /// The transport reported an error; a `Closed` follows
    Error(String),
    /// The transport is gone
    Closed { code: Option<u16>, reason: String },
}

/// Write half of an open transport
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Close the transport. Errors are swallowed; the channel is unusable
    /// afterwards either way.
    async fn close(&mut self);
}

/// An open transport
pub struct TransportChannel {
    pub sink: Box<dyn FrameSink>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens transports for a session target
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Name of the transport backend
    fn name(&self) -> &'static str;

    async fn open(&self, target: &SessionTarget) -> Result<TransportChannel>;
}
