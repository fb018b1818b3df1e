//! In-memory transport for driving a connection without a network.
//!
//! [`MemoryTransport`] is handed to the connection manager; the paired
//! [`MemoryServer`] scripts how each open resolves and yields a
//! [`MemoryPeer`] for every accepted open, through which frames can be
//! delivered, inspected and the connection closed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Result, TransportError};
use crate::transport::{FrameSink, SessionTarget, Transport, TransportChannel, TransportEvent};

const PEER_CAPACITY: usize = 64;

/// How the next `open` resolves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Accept,
    Reject(String),
    /// Never resolve; the open stays in flight until it is cancelled
    Stall,
}

struct Shared {
    script: VecDeque<OpenOutcome>,
    opened: Vec<SessionTarget>,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryTransport {
    /// Create a transport and the server side that controls it. Opens are
    /// accepted unless an outcome has been scripted.
    pub fn pair() -> (Self, MemoryServer) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(Shared {
            script: VecDeque::new(),
            opened: Vec::new(),
            peers: peers_tx,
        }));

        (
            Self {
                shared: shared.clone(),
            },
            MemoryServer {
                shared,
                peers: peers_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open(&self, target: &SessionTarget) -> Result<TransportChannel> {
        let outcome = {
            let mut shared = lock(&self.shared);
            shared.opened.push(target.clone());
            shared.script.pop_front().unwrap_or(OpenOutcome::Accept)
        };

        match outcome {
            OpenOutcome::Accept => {}
            OpenOutcome::Reject(reason) => return Err(TransportError::Open(reason)),
            OpenOutcome::Stall => std::future::pending::<()>().await,
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(PEER_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let closed_by_client = Arc::new(AtomicBool::new(false));

        let peer = MemoryPeer {
            target: target.clone(),
            inbound: inbound_tx,
            outbound: outbound_rx,
            closed_by_client: closed_by_client.clone(),
        };
        // the server may have been dropped; the peer is then simply unobserved
        let _ = lock(&self.shared).peers.send(peer);

        Ok(TransportChannel {
            sink: Box::new(MemorySink {
                outbound: outbound_tx,
                closed_by_client,
            }),
            events: inbound_rx,
        })
    }
}

struct MemorySink {
    outbound: mpsc::UnboundedSender<String>,
    closed_by_client: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: String) -> Result<()> {
        if self.closed_by_client.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.outbound.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {
        self.closed_by_client.store(true, Ordering::SeqCst);
    }
}

/// Server side of a [`MemoryTransport`]
pub struct MemoryServer {
    shared: Arc<Mutex<Shared>>,
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryServer {
    /// Queue the outcome of a future open
    pub fn script(&self, outcome: OpenOutcome) {
        lock(&self.shared).script.push_back(outcome);
    }

    /// Queue `count` rejected opens
    pub fn reject_next(&self, count: usize) {
        for attempt in 0..count {
            self.script(OpenOutcome::Reject(format!("refused (scripted #{})", attempt + 1)));
        }
    }

    /// Number of `open` calls so far, including failed and stalled ones
    pub fn open_count(&self) -> usize {
        lock(&self.shared).opened.len()
    }

    /// Targets of every `open` call, in order
    pub fn opened_targets(&self) -> Vec<SessionTarget> {
        lock(&self.shared).opened.clone()
    }

    /// Wait for the next accepted connection
    pub async fn next_peer(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }
}

/// Server end of one accepted in-memory connection
pub struct MemoryPeer {
    target: SessionTarget,
    inbound: mpsc::Sender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<String>,
    closed_by_client: Arc<AtomicBool>,
}

impl MemoryPeer {
    pub fn target(&self) -> &SessionTarget {
        &self.target
    }

    /// Deliver a text frame to the client. Returns false once the client
    /// has let go of this connection.
    pub async fn deliver(&self, frame: impl Into<String>) -> bool {
        self.inbound
            .send(TransportEvent::Message(frame.into()))
            .await
            .is_ok()
    }

    /// Close the connection from the server side
    pub async fn close(&self, code: u16, reason: &str) -> bool {
        self.inbound
            .send(TransportEvent::Closed {
                code: Some(code),
                reason: reason.to_string(),
            })
            .await
            .is_ok()
    }

    /// Report a transport error followed by the close it causes
    pub async fn fail(&self, error: &str) -> bool {
        self.inbound
            .send(TransportEvent::Error(error.to_string()))
            .await
            .is_ok()
            && self
                .inbound
                .send(TransportEvent::Closed {
                    code: None,
                    reason: error.to_string(),
                })
                .await
                .is_ok()
    }

    /// Frames the client has written so far and not yet taken
    pub fn sent(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Wait for the next frame written by the client
    pub async fn next_sent(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    pub fn closed_by_client(&self) -> bool {
        self.closed_by_client.load(Ordering::SeqCst)
    }

    /// Whether the client still listens on this connection
    pub fn is_attached(&self) -> bool {
        !self.inbound.is_closed()
    }
}
