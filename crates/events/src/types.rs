//! Envelope and event kinds for the interview session transport

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Envelope wrapping every frame exchanged over a session connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique envelope ID, used by receivers for de-duplication
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Event type tag
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Opaque structured payload
    #[serde(default)]
    pub payload: Value,
    /// When the envelope was created
    #[serde(default = "Utc::now", with = "iso8601")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Create a new envelope with auto-generated ID and timestamp
    pub fn new(kind: impl Into<EventKind>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Type tag carried by every envelope.
///
/// The six domain kinds plus the presence/error tags sent by the relay and
/// the two kinds the connection manager dispatches locally. Anything else
/// passes through as [`EventKind::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    QuestionAsked,
    ResponseSent,
    AiSuggestion,
    SupportIntervention,
    VoiceRecognition,
    SessionStatus,
    UserJoined,
    UserLeft,
    Error,
    /// Dispatched locally once the transport is open
    ConnectionEstablished,
    /// Dispatched locally once reconnect attempts are exhausted
    ConnectionLost,
    Unknown(String),
}

impl EventKind {
    /// Kinds exchanged between session participants
    pub const DOMAIN: [EventKind; 6] = [
        EventKind::QuestionAsked,
        EventKind::ResponseSent,
        EventKind::AiSuggestion,
        EventKind::SupportIntervention,
        EventKind::VoiceRecognition,
        EventKind::SessionStatus,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::QuestionAsked => "question_asked",
            EventKind::ResponseSent => "response_sent",
            EventKind::AiSuggestion => "ai_suggestion",
            EventKind::SupportIntervention => "support_intervention",
            EventKind::VoiceRecognition => "voice_recognition",
            EventKind::SessionStatus => "session_status",
            EventKind::UserJoined => "user_joined",
            EventKind::UserLeft => "user_left",
            EventKind::Error => "error",
            EventKind::ConnectionEstablished => "connection_established",
            EventKind::ConnectionLost => "connection_lost",
            EventKind::Unknown(tag) => tag,
        }
    }

    /// Whether this kind is produced by the connection itself rather than
    /// received from the wire
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            EventKind::ConnectionEstablished | EventKind::ConnectionLost
        )
    }
}

impl From<&str> for EventKind {
    fn from(tag: &str) -> Self {
        match tag {
            "question_asked" => EventKind::QuestionAsked,
            "response_sent" => EventKind::ResponseSent,
            "ai_suggestion" => EventKind::AiSuggestion,
            "support_intervention" => EventKind::SupportIntervention,
            "voice_recognition" => EventKind::VoiceRecognition,
            "session_status" => EventKind::SessionStatus,
            "user_joined" => EventKind::UserJoined,
            "user_left" => EventKind::UserLeft,
            "error" => EventKind::Error,
            "connection_established" => EventKind::ConnectionEstablished,
            "connection_lost" => EventKind::ConnectionLost,
            other => EventKind::Unknown(other.to_string()),
        }
    }
}

impl From<String> for EventKind {
    fn from(tag: String) -> Self {
        match EventKind::from(tag.as_str()) {
            EventKind::Unknown(_) => EventKind::Unknown(tag),
            known => known,
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Unknown(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ISO-8601 timestamps with millisecond precision and a `Z` suffix, the
/// form browsers produce with `toISOString()`.
pub mod iso8601 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&timestamp.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        DateTime::<Utc>::deserialize(deserializer)
    }
}
