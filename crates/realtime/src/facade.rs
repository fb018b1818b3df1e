//! Named session events on top of a [`ConnectionManager`].
//!
//! Every emit builds the payload for its fixed event kind and hands the
//! envelope to the manager; every listener subscribes to that kind and
//! decodes the payload before calling back. A payload that does not match
//! the expected shape surfaces as a handler error on the bus.

use serde_json::{Map, Value};
use tracing::warn;

use events::{
    AiSuggestion, ConnectionEstablished, ConnectionLost, DomainPayload, EventKind,
    QuestionAsked, ResponseSent, SessionStatus, Subscription, SupportIntervention,
    VoiceRecognition,
};

use crate::manager::ConnectionManager;

/// Named emit and listen pairs for a session connection
#[derive(Clone, Debug)]
pub struct SessionEvents {
    manager: ConnectionManager,
}

impl SessionEvents {
    /// Wrap `manager`; clones of the façade share it
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Underlying connection
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Send `question_asked`
    pub fn emit_question(&self, question: impl Into<String>, session_id: impl Into<String>) {
        self.emit(QuestionAsked::new(question, session_id));
    }

    /// Send `response_sent`
    pub fn emit_response(&self, response: impl Into<String>, conversation_id: impl Into<String>) {
        self.emit(ResponseSent::new(response, conversation_id));
    }

    /// Send `ai_suggestion`
    pub fn emit_ai_suggestion(
        &self,
        suggestion: impl Into<String>,
        conversation_id: impl Into<String>,
    ) {
        self.emit(AiSuggestion::new(suggestion, conversation_id));
    }

    /// Send `support_intervention`; `sessionId` and `timestamp` in
    /// `intervention` are replaced
    pub fn emit_support_intervention(
        &self,
        intervention: Map<String, Value>,
        session_id: impl Into<String>,
    ) {
        self.emit(SupportIntervention::new(intervention, session_id));
    }

    /// Feed a speech-to-text transcript into the session
    pub fn emit_voice_recognition(&self, transcript: impl Into<String>, is_final: bool) {
        self.emit(VoiceRecognition::new(transcript, is_final));
    }

    /// Send `session_status`
    pub fn emit_session_status(&self, status: impl Into<String>, session_id: impl Into<String>) {
        self.emit(SessionStatus::new(status, session_id));
    }

    /// Send any domain payload under its own event kind
    pub fn emit<P: DomainPayload>(&self, payload: P) {
        match payload.into_envelope() {
            Ok(envelope) => self.manager.send_envelope(envelope),
            Err(e) => warn!(kind = %P::kind(), error = %e, "Failed to build outbound event"),
        }
    }

    /// Listen for `question_asked`
    pub fn on_question_asked<F>(&self, f: F) -> Subscription
    where
        F: Fn(QuestionAsked) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listen(f)
    }

    /// Listen for `response_sent`
    pub fn on_response_sent<F>(&self, f: F) -> Subscription
    where
        F: Fn(ResponseSent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listen(f)
    }

    /// Listen for `ai_suggestion`
    pub fn on_ai_suggestion<F>(&self, f: F) -> Subscription
    where
        F: Fn(AiSuggestion) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listen(f)
    }

    /// Listen for `support_intervention`
    pub fn on_support_intervention<F>(&self, f: F) -> Subscription
    where
        F: Fn(SupportIntervention) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listen(f)
    }

    /// Listen for `voice_recognition`
    pub fn on_voice_recognition<F>(&self, f: F) -> Subscription
    where
        F: Fn(VoiceRecognition) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listen(f)
    }

    /// Listen for `session_status`
    pub fn on_session_status<F>(&self, f: F) -> Subscription
    where
        F: Fn(SessionStatus) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listen(f)
    }

    /// Called each time the transport opens, including after a reconnect
    pub fn on_connection_established<F>(&self, f: F) -> Subscription
    where
        F: Fn(ConnectionEstablished) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listen(f)
    }

    /// Called once reconnect attempts are exhausted
    pub fn on_connection_lost<F>(&self, f: F) -> Subscription
    where
        F: Fn(ConnectionLost) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listen(f)
    }

    // Presence and error payloads are defined by the relay, so they are
    // passed through untyped.

    /// Listen for `user_joined` presence events
    pub fn on_user_joined<F>(&self, f: F) -> Subscription
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listen_raw(EventKind::UserJoined, f)
    }

    /// Listen for `user_left` presence events
    pub fn on_user_left<F>(&self, f: F) -> Subscription
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listen_raw(EventKind::UserLeft, f)
    }

    /// Listen for `error` events sent by the relay
    pub fn on_error<F>(&self, f: F) -> Subscription
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listen_raw(EventKind::Error, f)
    }

    /// Subscribe to `P`'s event kind with the payload decoded
    pub fn listen<P, F>(&self, f: F) -> Subscription
    where
        P: DomainPayload + 'static,
        F: Fn(P) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.manager.on(P::kind(), move |envelope| {
            let payload = P::from_envelope(envelope)?;
            f(payload)
        })
    }

    fn listen_raw<F>(&self, kind: EventKind, f: F) -> Subscription
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.manager.on(kind, move |envelope| f(&envelope.payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryPeer, MemoryServer, MemoryTransport};
    use crate::manager::ConnectionState;
    use crate::timer::ManualTimer;
    use events::{codec, Envelope};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use url::Url;

    async fn connected() -> (SessionEvents, MemoryServer, MemoryPeer) {
        let (transport, mut server) = MemoryTransport::pair();
        let manager = ConnectionManager::builder(transport, Url::parse("ws://localhost:3001").unwrap())
            .timer(ManualTimer::new())
            .spawn();
        let events = SessionEvents::new(manager);

        events.manager().connect("session-1", "secret");
        let peer = server.next_peer().await.unwrap();
        events
            .manager()
            .wait_for_state(ConnectionState::Connected)
            .await;
        (events, server, peer)
    }

    async fn next_envelope(peer: &mut MemoryPeer) -> Envelope {
        codec::decode(&peer.next_sent().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_emit_question() {
        let (events, _server, mut peer) = connected().await;

        events.emit_question("What is ownership?", "session-1");
        let envelope = next_envelope(&mut peer).await;

        assert_eq!(envelope.kind, EventKind::QuestionAsked);
        assert_eq!(envelope.payload["question"], "What is ownership?");
        assert_eq!(envelope.payload["sessionId"], "session-1");
        assert!(envelope.payload["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_emit_each_kind_uses_its_tag() {
        let (events, _server, mut peer) = connected().await;

        events.emit_response("I would use a B-tree", "conv-1");
        events.emit_ai_suggestion("Mention complexity", "conv-1");
        events.emit_voice_recognition("I would", false);
        events.emit_session_status("paused", "session-1");

        let mut kinds = Vec::new();
        for _ in 0..4 {
            kinds.push(next_envelope(&mut peer).await.kind);
        }
        assert_eq!(
            kinds,
            vec![
                EventKind::ResponseSent,
                EventKind::AiSuggestion,
                EventKind::VoiceRecognition,
                EventKind::SessionStatus,
            ]
        );
    }

    #[tokio::test]
    async fn test_emit_support_intervention() {
        let (events, _server, mut peer) = connected().await;

        let mut intervention = Map::new();
        intervention.insert("type".to_string(), json!("hint"));
        intervention.insert("content".to_string(), json!("slow down"));
        events.emit_support_intervention(intervention, "session-1");

        let envelope = next_envelope(&mut peer).await;
        assert_eq!(envelope.kind, EventKind::SupportIntervention);
        assert_eq!(envelope.payload["type"], "hint");
        assert_eq!(envelope.payload["content"], "slow down");
        assert_eq!(envelope.payload["sessionId"], "session-1");
    }

    #[tokio::test]
    async fn test_typed_listener_receives_payload() {
        let (events, _server, peer) = connected().await;
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        events.on_ai_suggestion(move |suggestion| {
            log.lock().unwrap().push(suggestion);
            Ok(())
        });

        let frame = codec::encode(
            &AiSuggestion::new("Ask about team size", "conv-2")
                .into_envelope()
                .unwrap(),
        )
        .unwrap();
        peer.deliver(frame).await;
        events.manager().barrier().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].suggestion, "Ask about team size");
        assert_eq!(seen[0].conversation_id, "conv-2");
    }

    #[tokio::test]
    async fn test_typed_listener_shape_mismatch_is_handler_failure() {
        let (events, _server, peer) = connected().await;
        let calls = Arc::new(Mutex::new(0));

        let counter = calls.clone();
        events.on_voice_recognition(move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        peer.deliver(r#"{"type":"voice_recognition","payload":{"transcript":42}}"#)
            .await;
        events.manager().barrier().await;

        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(events.manager().stats().handler_failures, 1);
        assert!(events.manager().is_connected());
    }

    #[tokio::test]
    async fn test_presence_listeners() {
        let (events, _server, peer) = connected().await;
        let seen = Arc::new(Mutex::new(Vec::new()));

        let joined = seen.clone();
        events.on_user_joined(move |payload| {
            joined.lock().unwrap().push(("joined", payload.clone()));
            Ok(())
        });
        let left = seen.clone();
        events.on_user_left(move |payload| {
            left.lock().unwrap().push(("left", payload.clone()));
            Ok(())
        });

        peer.deliver(r#"{"type":"user_joined","payload":{"userId":"u1"}}"#)
            .await;
        peer.deliver(r#"{"type":"user_left","payload":{"userId":"u1"}}"#)
            .await;
        events.manager().barrier().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("joined", json!({"userId": "u1"})),
                ("left", json!({"userId": "u1"})),
            ]
        );
    }

    #[tokio::test]
    async fn test_error_listener() {
        let (events, _server, peer) = connected().await;
        let messages = Arc::new(Mutex::new(Vec::new()));

        let log = messages.clone();
        events.on_error(move |payload| {
            log.lock().unwrap().push(payload["message"].clone());
            Ok(())
        });

        peer.deliver(r#"{"type":"error","payload":{"message":"session expired"}}"#)
            .await;
        events.manager().barrier().await;

        assert_eq!(*messages.lock().unwrap(), vec![json!("session expired")]);
    }

    #[tokio::test]
    async fn test_emit_while_disconnected_is_dropped() {
        let (transport, _server) = MemoryTransport::pair();
        let manager = ConnectionManager::builder(transport, Url::parse("ws://localhost:3001").unwrap())
            .spawn();
        let events = SessionEvents::new(manager);

        events.emit_session_status("active", "session-1");
        events.manager().barrier().await;

        assert_eq!(events.manager().stats().sends_dropped, 1);
    }

    #[tokio::test]
    async fn test_listener_cancel() {
        let (events, _server, peer) = connected().await;
        let calls = Arc::new(Mutex::new(0));

        let counter = calls.clone();
        let subscription = events.on_session_status(move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });
        assert!(subscription.cancel());

        let frame = codec::encode(&SessionStatus::new("active", "s").into_envelope().unwrap())
            .unwrap();
        peer.deliver(frame).await;
        events.manager().barrier().await;

        assert_eq!(*calls.lock().unwrap(), 0);
    }
}
