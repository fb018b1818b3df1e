//! Lifecycle of one session connection.
//!
//! A [`ConnectionManager`] is a cheap, cloneable handle to a driver task that
//! exclusively owns the transport. Every operation (connect, send, disconnect,
//! inbound dispatch, reconnect timer) is processed on that task in order, so
//! connection state is never mutated concurrently.
//!
//! ```text
//!  connect()        open ok                 close / open failed
//! Disconnected ──► Connecting ──────► Connected ─────────────────► Reconnecting
//!      ▲               ▲                                              │
//!      │               └──────────── timer fires ─────────────────────┤
//!      └──────── disconnect() / attempts exhausted ───────────────────┘
//! ```

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use url::Url;

use events::{
    codec, ConnectionEstablished, ConnectionLost, DomainPayload, Envelope, EventBus, EventKind,
    HandlerRef, Subscription,
};

use crate::config::ConnectionConfig;
use crate::error::{ConfigError, TransportError};
use crate::policy::ReconnectPolicy;
use crate::stats::{ConnectionStats, StatsSnapshot};
use crate::timer::{Timer, TokioTimer};
use crate::transport::{FrameSink, SessionTarget, Transport, TransportChannel, TransportEvent};

/// Lifecycle state of a session connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Command {
    Connect {
        session_id: String,
        credential: String,
    },
    Send(Envelope),
    Disconnect,
    Barrier(oneshot::Sender<()>),
}

/// Builder for a [`ConnectionManager`]
pub struct ConnectionManagerBuilder {
    transport: Arc<dyn Transport>,
    ws_url: Url,
    policy: ReconnectPolicy,
    timer: Arc<dyn Timer>,
    bus: EventBus,
}

impl ConnectionManagerBuilder {
    pub fn policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn timer(mut self, timer: impl Timer) -> Self {
        self.timer = Arc::new(timer);
        self
    }

    /// Dispatch inbound events on an existing bus instead of a fresh one
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    /// Start the driver task. Must be called within a Tokio runtime.
    pub fn spawn(self) -> ConnectionManager {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let stats = Arc::new(ConnectionStats::default());

        let driver = Driver {
            transport: self.transport,
            timer: self.timer,
            bus: self.bus.clone(),
            policy: self.policy,
            ws_url: self.ws_url,
            stats: stats.clone(),
            state: state_tx,
            commands: commands_rx,
            target: None,
            sink: None,
            inbound: None,
            opening: None,
            retry: None,
            attempts: 0,
            reconnect_enabled: false,
            inbound_burst: 0,
        };
        tokio::spawn(driver.run());

        ConnectionManager {
            commands: commands_tx,
            state: state_rx,
            bus: self.bus,
            stats,
        }
    }
}

/// Handle to one session connection.
///
/// Clones share the connection. The driver task stops, closing the
/// transport, once every handle is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    bus: EventBus,
    stats: Arc<ConnectionStats>,
}

impl ConnectionManager {
    pub fn builder(transport: impl Transport, ws_url: Url) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            transport: Arc::new(transport),
            ws_url,
            policy: ReconnectPolicy::default(),
            timer: Arc::new(TokioTimer),
            bus: EventBus::new(),
        }
    }

    /// Spawn a manager using the URL and reconnect policy from `config`
    pub fn from_config(
        transport: impl Transport,
        config: &ConnectionConfig,
    ) -> Result<Self, ConfigError> {
        let ws_url = config.ws_url()?;
        Ok(Self::builder(transport, ws_url)
            .policy(config.reconnect)
            .spawn())
    }

    /// Open the connection for `session_id`.
    ///
    /// Ignored while a connection is already being opened or is open. While
    /// reconnecting, the pending retry is replaced by an immediate attempt
    /// with a fresh attempt budget.
    pub fn connect(&self, session_id: impl Into<String>, credential: impl Into<String>) {
        self.command(Command::Connect {
            session_id: session_id.into(),
            credential: credential.into(),
        });
    }

    /// Send an event to the session. Dropped with a warning unless the
    /// connection is open; there is no outbound queue.
    pub fn send(&self, kind: impl Into<EventKind>, payload: Value) {
        self.send_envelope(Envelope::new(kind, payload));
    }

    /// Send a prebuilt envelope, keeping its id and timestamp
    pub fn send_envelope(&self, envelope: Envelope) {
        self.command(Command::Send(envelope));
    }

    /// Close the connection, cancel any pending reconnect and clear every
    /// subscription. Only a new [`ConnectionManager::connect`] reopens it.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver that observes every state transition
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the connection reaches `target`. Returns false if the
    /// driver stopped first.
    pub async fn wait_for_state(&self, target: ConnectionState) -> bool {
        self.state
            .clone()
            .wait_for(move |current| *current == target)
            .await
            .is_ok()
    }

    /// Resolve once every operation issued before this call has been
    /// processed by the driver
    pub async fn barrier(&self) {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Barrier(tx));
        let _ = rx.await;
    }

    /// Bus that inbound and local events are dispatched on
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Register `handler` for `kind` on this connection's bus
    pub fn subscribe(&self, kind: impl Into<EventKind>, handler: HandlerRef) -> Subscription {
        self.bus.subscribe(kind, handler)
    }

    pub fn on<F>(&self, kind: impl Into<EventKind>, f: F) -> Subscription
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus.on(kind, f)
    }

    /// Remove `handler` from `kind`. Returns false if it was not registered.
    pub fn unsubscribe(&self, kind: &EventKind, handler: &HandlerRef) -> bool {
        self.bus.unsubscribe(kind, handler)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.bus.handler_failure_count())
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Connection driver has stopped, ignoring command");
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

struct Driver {
    transport: Arc<dyn Transport>,
    timer: Arc<dyn Timer>,
    bus: EventBus,
    policy: ReconnectPolicy,
    ws_url: Url,
    stats: Arc<ConnectionStats>,
    state: watch::Sender<ConnectionState>,
    commands: mpsc::UnboundedReceiver<Command>,
    target: Option<SessionTarget>,
    sink: Option<Box<dyn FrameSink>>,
    inbound: Option<mpsc::Receiver<TransportEvent>>,
    /// In-flight transport open; at most one
    opening: Option<BoxFuture<'static, Result<TransportChannel, TransportError>>>,
    /// Pending reconnect timer; dropping it cancels the retry
    retry: Option<BoxFuture<'static, ()>>,
    attempts: u32,
    reconnect_enabled: bool,
    /// Inbound events handled since commands were last checked
    inbound_burst: usize,
}

/// Inbound events handled back to back before a pending command gets a turn
const INBOUND_BURST: usize = 32;

async fn wait_slot<T>(slot: &mut Option<BoxFuture<'static, T>>) -> T {
    match slot {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_event(inbound: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                _ = wait_slot(&mut self.retry) => {
                    self.retry = None;
                    self.on_retry_due();
                }

                opened = wait_slot(&mut self.opening) => {
                    self.opening = None;
                    self.on_opened(opened);
                }

                event = next_event(&mut self.inbound) => {
                    self.on_transport_event(event);
                    self.inbound_burst += 1;
                    if self.inbound_burst >= INBOUND_BURST {
                        self.inbound_burst = 0;
                        if let Ok(command) = self.commands.try_recv() {
                            self.on_command(command).await;
                        }
                    }
                }

                command = self.commands.recv() => {
                    self.inbound_burst = 0;
                    match command {
                        Some(command) => self.on_command(command).await,
                        None => break,
                    }
                }
            }
        }

        self.close_transport().await;
        debug!("Connection driver stopped");
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.current_state();
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if previous != next {
            debug!(from = %previous, to = %next, "Connection state changed");
        }
    }

    fn session_id(&self) -> String {
        self.target
            .as_ref()
            .map(|target| target.session_id().to_string())
            .unwrap_or_default()
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                session_id,
                credential,
            } => self.on_connect(session_id, credential),
            Command::Send(envelope) => self.on_send(envelope).await,
            Command::Disconnect => self.on_disconnect().await,
            Command::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    fn on_connect(&mut self, session_id: String, credential: String) {
        let state = self.current_state();
        if matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!(session_id = %session_id, state = %state, "Connect ignored");
            return;
        }

        self.retry = None;
        self.attempts = 0;
        self.stats.set_reconnect_attempts(0);
        self.reconnect_enabled = true;
        self.target = Some(SessionTarget::new(
            self.ws_url.clone(),
            session_id,
            credential,
        ));
        self.start_open();
    }

    fn start_open(&mut self) {
        let Some(target) = self.target.clone() else {
            return;
        };
        let transport = self.transport.clone();

        info!(
            session_id = %target.session_id(),
            transport = transport.name(),
            attempt = self.attempts,
            "Opening connection"
        );

        self.stats.record_open();
        self.set_state(ConnectionState::Connecting);
        self.opening = Some(Box::pin(async move { transport.open(&target).await }));
    }

    fn on_opened(&mut self, result: Result<TransportChannel, TransportError>) {
        match result {
            Ok(channel) => {
                self.sink = Some(channel.sink);
                self.inbound = Some(channel.events);
                self.attempts = 0;
                self.stats.set_reconnect_attempts(0);
                self.set_state(ConnectionState::Connected);

                let session_id = self.session_id();
                info!(session_id = %session_id, "Connection established");
                self.dispatch_local(ConnectionEstablished::new(session_id));
            }
            Err(e) => {
                warn!(
                    session_id = %self.session_id(),
                    attempt = self.attempts,
                    error = %e,
                    "Failed to open connection"
                );
                self.stats.record_open_failure();
                self.on_connection_lost();
            }
        }
    }

    fn on_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Message(frame)) => self.on_frame(&frame),
            Some(TransportEvent::Error(e)) => {
                warn!(session_id = %self.session_id(), error = %e, "Transport error");
            }
            Some(TransportEvent::Closed { code, reason }) => {
                info!(
                    session_id = %self.session_id(),
                    code = ?code,
                    reason = %reason,
                    "Connection closed"
                );
                self.on_closed();
            }
            None => {
                info!(session_id = %self.session_id(), "Transport ended without close");
                self.on_closed();
            }
        }
    }

    fn on_frame(&mut self, frame: &str) {
        self.stats.record_received();
        match codec::decode(frame) {
            Ok(envelope) if envelope.kind.is_local() => {
                self.stats.record_protocol_error();
                warn!(kind = %envelope.kind, id = %envelope.id, "Dropping inbound frame with local-only kind");
            }
            Ok(envelope) => {
                self.bus.dispatch(&envelope);
            }
            Err(e) => {
                self.stats.record_protocol_error();
                warn!(error = %e, "Dropping undecodable frame");
            }
        }
    }

    fn on_closed(&mut self) {
        self.sink = None;
        self.inbound = None;
        self.on_connection_lost();
    }

    /// The transport is gone or never opened: retry, or give up
    fn on_connection_lost(&mut self) {
        if !self.reconnect_enabled || self.target.is_none() {
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let attempt = self.attempts.saturating_add(1);
        match self.policy.delay_for(attempt) {
            Some(delay) => {
                self.attempts = attempt;
                self.stats.set_reconnect_attempts(attempt);
                self.set_state(ConnectionState::Reconnecting);
                info!(
                    session_id = %self.session_id(),
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Scheduling reconnect"
                );
                self.retry = Some(self.timer.sleep(delay));
            }
            None => {
                let session_id = self.session_id();
                error!(
                    session_id = %session_id,
                    attempts = self.attempts,
                    "Reconnect attempts exhausted"
                );
                self.target = None;
                self.set_state(ConnectionState::Disconnected);
                self.dispatch_local(ConnectionLost::new(session_id, self.attempts));
            }
        }
    }

    fn on_retry_due(&mut self) {
        if self.current_state() != ConnectionState::Reconnecting {
            return;
        }
        debug!(attempt = self.attempts, "Reconnect timer fired");
        self.start_open();
    }

    async fn on_send(&mut self, envelope: Envelope) {
        if envelope.kind.is_local() {
            self.stats.record_dropped_send();
            warn!(kind = %envelope.kind, "Refusing to send local-only event");
            return;
        }

        let state = self.current_state();
        if state != ConnectionState::Connected || self.sink.is_none() {
            self.stats.record_dropped_send();
            warn!(
                kind = %envelope.kind,
                state = %state,
                "Not connected, dropping outbound event"
            );
            return;
        }

        let frame = match codec::encode(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.record_dropped_send();
                warn!(kind = %envelope.kind, error = %e, "Failed to encode outbound event");
                return;
            }
        };

        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        match sink.send(frame).await {
            Ok(()) => {
                self.stats.record_sent();
                debug!(kind = %envelope.kind, id = %envelope.id, "Event sent");
            }
            Err(e) => {
                self.stats.record_dropped_send();
                warn!(kind = %envelope.kind, error = %e, "Failed to send event");
            }
        }
    }

    async fn on_disconnect(&mut self) {
        info!(session_id = %self.session_id(), "Disconnecting");

        self.reconnect_enabled = false;
        self.retry = None;
        self.opening = None;
        self.close_transport().await;
        self.target = None;
        self.bus.clear();
        self.attempts = 0;
        self.stats.set_reconnect_attempts(0);
        self.set_state(ConnectionState::Disconnected);
    }

    async fn close_transport(&mut self) {
        self.inbound = None;
        if let Some(mut sink) = self.sink.take() {
            sink.close().await;
        }
    }

    fn dispatch_local<P: DomainPayload>(&self, payload: P) {
        match payload.into_envelope() {
            Ok(envelope) => {
                self.bus.dispatch(&envelope);
            }
            Err(e) => warn!(error = %e, "Failed to build local event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryServer, MemoryTransport, OpenOutcome};
    use crate::timer::ManualTimer;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn ws_url() -> Url {
        Url::parse("ws://localhost:3001").unwrap()
    }

    fn setup(max_attempts: u32) -> (ConnectionManager, MemoryServer, ManualTimer) {
        let (transport, server) = MemoryTransport::pair();
        let timer = ManualTimer::new();
        let manager = ConnectionManager::builder(transport, ws_url())
            .policy(ReconnectPolicy::new(Duration::from_millis(1000), max_attempts))
            .timer(timer.clone())
            .spawn();
        (manager, server, timer)
    }

    fn millis(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_millis).collect()
    }

    #[tokio::test]
    async fn test_connect_reaches_connected() {
        let (manager, mut server, _timer) = setup(5);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.connect("session-1", "secret");
        let peer = server.next_peer().await.unwrap();
        assert!(manager.wait_for_state(ConnectionState::Connected).await);

        assert!(manager.is_connected());
        assert_eq!(peer.target().session_id(), "session-1");
        assert_eq!(peer.target().credential(), "secret");
        assert_eq!(manager.stats().opens, 1);
    }

    #[tokio::test]
    async fn test_connection_established_event() {
        let (manager, mut server, _timer) = setup(5);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        manager.on(EventKind::ConnectionEstablished, move |envelope| {
            let payload = ConnectionEstablished::from_envelope(envelope)?;
            log.lock().unwrap().push(payload.session_id);
            Ok(())
        });

        manager.connect("session-7", "secret");
        let _peer = server.next_peer().await.unwrap();
        manager.barrier().await;

        assert_eq!(*seen.lock().unwrap(), vec!["session-7".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_connect_while_connecting_opens_once() {
        let (manager, server, _timer) = setup(5);
        server.script(OpenOutcome::Stall);

        manager.connect("session-1", "secret");
        manager.connect("session-1", "secret");
        manager.barrier().await;

        assert_eq!(server.open_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_connect_while_connected_is_noop() {
        let (manager, mut server, _timer) = setup(5);

        manager.connect("session-1", "secret");
        let _peer = server.next_peer().await.unwrap();
        manager.wait_for_state(ConnectionState::Connected).await;

        manager.connect("session-2", "other");
        manager.barrier().await;

        assert_eq!(server.open_count(), 1);
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn test_send_while_connected_writes_frame() {
        let (manager, mut server, _timer) = setup(5);

        manager.connect("session-1", "secret");
        let mut peer = server.next_peer().await.unwrap();
        manager.wait_for_state(ConnectionState::Connected).await;

        manager.send("question_asked", json!({"question": "Why this role?"}));
        let frame = peer.next_sent().await.unwrap();
        let envelope = codec::decode(&frame).unwrap();

        assert_eq!(envelope.kind, EventKind::QuestionAsked);
        assert_eq!(envelope.payload["question"], "Why this role?");
        assert_eq!(manager.stats().frames_sent, 1);
    }

    #[tokio::test]
    async fn test_send_before_connect_is_dropped() {
        let (manager, server, _timer) = setup(5);

        manager.send(EventKind::SessionStatus, json!({"status": "active"}));
        manager.barrier().await;

        assert_eq!(manager.stats().sends_dropped, 1);
        assert_eq!(server.open_count(), 0);
    }

    #[tokio::test]
    async fn test_inbound_frames_are_dispatched_in_order() {
        let (manager, mut server, _timer) = setup(5);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        manager.on(EventKind::AiSuggestion, move |envelope| {
            log.lock().unwrap().push(envelope.payload["suggestion"].clone());
            Ok(())
        });

        manager.connect("session-1", "secret");
        let peer = server.next_peer().await.unwrap();

        for n in 0..3 {
            let frame = codec::encode(&Envelope::new(
                EventKind::AiSuggestion,
                json!({"suggestion": n}),
            ))
            .unwrap();
            assert!(peer.deliver(frame).await);
        }
        manager.barrier().await;

        assert_eq!(*seen.lock().unwrap(), vec![json!(0), json!(1), json!(2)]);
        assert_eq!(manager.stats().frames_received, 3);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let (manager, mut server, _timer) = setup(5);
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        manager.on(EventKind::UserJoined, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        manager.connect("session-1", "secret");
        let peer = server.next_peer().await.unwrap();

        peer.deliver("{not json").await;
        peer.deliver(r#"{"type":"user_joined","payload":{"name":"Sam"}}"#)
            .await;
        manager.barrier().await;

        assert!(manager.is_connected());
        assert_eq!(manager.stats().protocol_errors, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_handler_keeps_connection() {
        let (manager, mut server, _timer) = setup(5);
        let count = Arc::new(AtomicUsize::new(0));

        manager.on(EventKind::Error, |_| anyhow::bail!("ui unavailable"));
        let counter = count.clone();
        manager.on(EventKind::Error, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        manager.connect("session-1", "secret");
        let peer = server.next_peer().await.unwrap();
        peer.deliver(r#"{"type":"error","payload":{"message":"boom"}}"#)
            .await;
        manager.barrier().await;

        assert!(manager.is_connected());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats().handler_failures, 1);
    }

    #[tokio::test]
    async fn test_inbound_local_kinds_are_not_dispatched() {
        let (manager, mut server, _timer) = setup(5);
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        manager.on(EventKind::ConnectionLost, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        manager.connect("session-1", "secret");
        let peer = server.next_peer().await.unwrap();
        manager.wait_for_state(ConnectionState::Connected).await;

        peer.deliver(r#"{"type":"connection_lost","payload":{"sessionId":"session-1","attempts":5}}"#)
            .await;
        peer.deliver(r#"{"type":"connection_established","payload":{"sessionId":"session-1"}}"#)
            .await;
        manager.barrier().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(manager.is_connected());
        let stats = manager.stats();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.protocol_errors, 2);
    }

    #[tokio::test]
    async fn test_local_kinds_are_never_sent() {
        let (manager, mut server, _timer) = setup(5);

        manager.connect("session-1", "secret");
        let mut peer = server.next_peer().await.unwrap();
        manager.wait_for_state(ConnectionState::Connected).await;

        manager.send(
            EventKind::ConnectionEstablished,
            json!({"sessionId": "session-1"}),
        );
        manager.send_envelope(ConnectionLost::new("session-1", 5).into_envelope().unwrap());
        manager.send(EventKind::SessionStatus, json!({"status": "active"}));

        let frame = peer.next_sent().await.unwrap();
        assert_eq!(codec::decode(&frame).unwrap().kind, EventKind::SessionStatus);
        manager.barrier().await;

        assert!(peer.sent().is_empty());
        let stats = manager.stats();
        assert_eq!(stats.sends_dropped, 2);
        assert_eq!(stats.frames_sent, 1);
    }

    #[tokio::test]
    async fn test_disconnect_not_held_back_by_inbound_flood() {
        let (manager, mut server, _timer) = setup(5);

        manager.connect("session-1", "secret");
        let peer = server.next_peer().await.unwrap();
        manager.wait_for_state(ConnectionState::Connected).await;

        let frame = codec::encode(&Envelope::new(EventKind::UserJoined, json!({}))).unwrap();
        let flood = tokio::spawn(async move {
            let mut delivered = 0usize;
            while peer.deliver(frame.clone()).await {
                delivered += 1;
            }
            delivered
        });

        while manager.stats().frames_received < 100 {
            tokio::task::yield_now().await;
        }
        manager.disconnect();

        let disconnected = tokio::time::timeout(
            Duration::from_secs(5),
            manager.wait_for_state(ConnectionState::Disconnected),
        )
        .await;
        assert!(matches!(disconnected, Ok(true)));

        // the flood stops once the connection lets go of its receiver
        let delivered = flood.await.unwrap();
        assert!(delivered >= 100);
    }

    #[tokio::test]
    async fn test_backoff_delays_double() {
        let (manager, mut server, timer) = setup(5);

        manager.connect("session-1", "secret");
        let peer = server.next_peer().await.unwrap();
        manager.wait_for_state(ConnectionState::Connected).await;

        server.reject_next(2);
        assert!(peer.close(1006, "network lost").await);

        timer.wait_for_scheduled(1).await;
        timer.fire_next();
        timer.wait_for_scheduled(2).await;
        timer.fire_next();
        timer.wait_for_scheduled(3).await;
        manager.barrier().await;

        assert_eq!(timer.history(), millis(&[1000, 2000, 4000]));
        assert_eq!(manager.stats().reconnect_attempts, 3);
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert_eq!(server.open_count(), 3);
    }

    #[tokio::test]
    async fn test_successful_reconnect_resets_attempts() {
        let (manager, mut server, timer) = setup(5);

        manager.connect("session-1", "secret");
        let peer = server.next_peer().await.unwrap();
        manager.wait_for_state(ConnectionState::Connected).await;

        server.reject_next(1);
        peer.fail("connection reset").await;

        timer.wait_for_scheduled(1).await;
        timer.fire_next();
        timer.wait_for_scheduled(2).await;
        timer.fire_next();

        let second = server.next_peer().await.unwrap();
        assert!(manager.wait_for_state(ConnectionState::Connected).await);
        assert_eq!(manager.stats().reconnect_attempts, 0);

        // a fresh drop starts over at the base delay
        second.close(1001, "going away").await;
        timer.wait_for_scheduled(3).await;
        assert_eq!(timer.history(), millis(&[1000, 2000, 1000]));
    }

    #[tokio::test]
    async fn test_reconnect_uses_same_target() {
        let (manager, mut server, timer) = setup(5);

        manager.connect("session-1", "secret");
        let peer = server.next_peer().await.unwrap();
        manager.wait_for_state(ConnectionState::Connected).await;

        peer.close(1006, "").await;
        timer.wait_for_scheduled(1).await;
        timer.fire_next();
        let _again = server.next_peer().await.unwrap();

        let targets = server.opened_targets();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0], targets[1]);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let (manager, mut server, timer) = setup(5);
        let lost = Arc::new(Mutex::new(Vec::new()));

        let log = lost.clone();
        manager.on(EventKind::ConnectionLost, move |envelope| {
            log.lock().unwrap().push(ConnectionLost::from_envelope(envelope)?);
            Ok(())
        });

        manager.connect("session-1", "secret");
        let peer = server.next_peer().await.unwrap();
        manager.wait_for_state(ConnectionState::Connected).await;

        server.reject_next(5);
        peer.close(1006, "network lost").await;

        for n in 1..=5 {
            timer.wait_for_scheduled(n).await;
            timer.fire_next();
        }
        assert!(manager.wait_for_state(ConnectionState::Disconnected).await);

        assert_eq!(
            timer.history(),
            millis(&[1000, 2000, 4000, 8000, 16000])
        );
        assert_eq!(server.open_count(), 6);

        let lost = lost.lock().unwrap().clone();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].session_id, "session-1");
        assert_eq!(lost[0].attempts, 5);

        // a late close from the first transport goes nowhere
        assert!(!peer.close(1006, "late").await);
        manager.barrier().await;
        assert_eq!(timer.history().len(), 5);
        assert_eq!(timer.pending(), 0);
        assert_eq!(server.open_count(), 6);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_after_exhaustion() {
        let (manager, mut server, timer) = setup(1);

        manager.connect("session-1", "secret");
        let peer = server.next_peer().await.unwrap();
        manager.wait_for_state(ConnectionState::Connected).await;

        server.reject_next(1);
        peer.close(1006, "").await;
        timer.wait_for_scheduled(1).await;
        timer.fire_next();
        manager.wait_for_state(ConnectionState::Disconnected).await;

        manager.connect("session-1", "secret");
        let _peer = server.next_peer().await.unwrap();
        assert!(manager.wait_for_state(ConnectionState::Connected).await);
    }

    #[tokio::test]
    async fn test_send_while_reconnecting_is_dropped() {
        let (manager, mut server, timer) = setup(5);

        manager.connect("session-1", "secret");
        let mut peer = server.next_peer().await.unwrap();
        manager.wait_for_state(ConnectionState::Connected).await;

        peer.close(1006, "network lost").await;
        timer.wait_for_scheduled(1).await;
        manager.barrier().await;
        assert_eq!(manager.state(), ConnectionState::Reconnecting);

        manager.send("question_asked", json!({"question": "Still there?"}));
        manager.barrier().await;

        assert!(peer.sent().is_empty());
        let stats = manager.stats();
        assert_eq!(stats.sends_dropped, 1);
        assert_eq!(stats.frames_sent, 0);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_reconnect() {
        let (manager, mut server, timer) = setup(5);

        manager.connect("session-1", "secret");
        let peer = server.next_peer().await.unwrap();
        manager.wait_for_state(ConnectionState::Connected).await;

        peer.close(1006, "network lost").await;
        timer.wait_for_scheduled(1).await;
        assert_eq!(timer.pending(), 1);

        manager.disconnect();
        manager.barrier().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(timer.pending(), 0);
        assert_eq!(timer.fire_next(), None);
        manager.barrier().await;
        assert_eq!(server.open_count(), 1);
        assert_eq!(manager.stats().reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_disconnect_closes_transport_and_clears_handlers() {
        let (manager, mut server, _timer) = setup(5);
        manager.on(EventKind::QuestionAsked, |_| Ok(()));

        manager.connect("session-1", "secret");
        let peer = server.next_peer().await.unwrap();
        manager.wait_for_state(ConnectionState::Connected).await;

        manager.disconnect();
        manager.barrier().await;

        assert!(peer.closed_by_client());
        assert!(!peer.is_attached());
        assert_eq!(manager.bus().handler_count(&EventKind::QuestionAsked), 0);

        // no reconnect after an explicit disconnect
        assert!(!peer.close(1000, "bye").await);
        manager.barrier().await;
        assert_eq!(server.open_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_in_flight_open() {
        let (manager, server, timer) = setup(5);
        server.script(OpenOutcome::Stall);

        manager.connect("session-1", "secret");
        manager.barrier().await;
        assert_eq!(manager.state(), ConnectionState::Connecting);

        manager.disconnect();
        manager.barrier().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(timer.history().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_connect_after_disconnect() {
        let (manager, mut server, _timer) = setup(5);

        manager.connect("session-1", "secret");
        let _first = server.next_peer().await.unwrap();
        manager.wait_for_state(ConnectionState::Connected).await;

        manager.disconnect();
        manager.connect("session-1", "secret");
        let _second = server.next_peer().await.unwrap();

        assert!(manager.wait_for_state(ConnectionState::Connected).await);
        assert_eq!(server.open_count(), 2);
    }

    #[tokio::test]
    async fn test_connect_while_reconnecting_retries_now() {
        let (manager, mut server, timer) = setup(5);

        manager.connect("session-1", "secret");
        let peer = server.next_peer().await.unwrap();
        manager.wait_for_state(ConnectionState::Connected).await;

        peer.close(1006, "").await;
        timer.wait_for_scheduled(1).await;

        manager.connect("session-1", "secret");
        let _again = server.next_peer().await.unwrap();
        assert!(manager.wait_for_state(ConnectionState::Connected).await);

        // the superseded timer is gone
        assert_eq!(timer.pending(), 0);
        assert_eq!(server.open_count(), 2);
    }

    #[tokio::test]
    async fn test_independent_managers() {
        let (first, mut first_server, _t1) = setup(5);
        let (second, _second_server, _t2) = setup(5);

        first.connect("session-a", "secret");
        let _peer = first_server.next_peer().await.unwrap();
        first.wait_for_state(ConnectionState::Connected).await;
        second.barrier().await;

        assert!(first.is_connected());
        assert_eq!(second.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_dropping_handles_closes_transport() {
        let (manager, mut server, _timer) = setup(5);

        manager.connect("session-1", "secret");
        let peer = server.next_peer().await.unwrap();
        manager.wait_for_state(ConnectionState::Connected).await;

        let mut state = manager.state_changes();
        drop(manager);

        // the driver drops its state sender on exit
        while state.changed().await.is_ok() {}
        assert!(peer.closed_by_client());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_backoff() {
        let (transport, mut server) = MemoryTransport::pair();
        let manager = ConnectionManager::builder(transport, ws_url())
            .policy(ReconnectPolicy::new(Duration::from_millis(1000), 5))
            .spawn();

        manager.connect("session-1", "secret");
        let peer = server.next_peer().await.unwrap();
        manager.wait_for_state(ConnectionState::Connected).await;

        let dropped_at = tokio::time::Instant::now();
        peer.close(1006, "").await;
        let _again = server.next_peer().await.unwrap();

        assert!(dropped_at.elapsed() >= Duration::from_millis(1000));
        assert!(manager.wait_for_state(ConnectionState::Connected).await);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionState::Connected.as_str(), "connected");
    }
}
