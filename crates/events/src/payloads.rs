//! Payload shapes for the named session events

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CodecError, Result};
use crate::types::{iso8601, Envelope, EventKind};

/// A payload bound to a fixed event kind
pub trait DomainPayload: Serialize + DeserializeOwned {
    fn kind() -> EventKind;

    /// Wrap the payload in a fresh envelope
    fn into_envelope(self) -> Result<Envelope> {
        let payload = serde_json::to_value(&self).map_err(CodecError::Encode)?;
        Ok(Envelope::new(Self::kind(), payload))
    }

    /// Read the payload back out of an envelope of the matching kind
    fn from_envelope(envelope: &Envelope) -> Result<Self> {
        let expected = Self::kind();
        if envelope.kind != expected {
            return Err(CodecError::KindMismatch {
                expected,
                actual: envelope.kind.clone(),
            });
        }
        serde_json::from_value(envelope.payload.clone()).map_err(|source| CodecError::Payload {
            kind: expected,
            source,
        })
    }
}

macro_rules! domain_payload {
    ($ty:ty, $kind:expr) => {
        impl DomainPayload for $ty {
            fn kind() -> EventKind {
                $kind
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionAsked {
    pub question: String,
    pub session_id: String,
    #[serde(default = "Utc::now", with = "iso8601")]
    pub timestamp: DateTime<Utc>,
}

impl QuestionAsked {
    pub fn new(question: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSent {
    pub response: String,
    pub conversation_id: String,
    #[serde(default = "Utc::now", with = "iso8601")]
    pub timestamp: DateTime<Utc>,
}

impl ResponseSent {
    pub fn new(response: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            conversation_id: conversation_id.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiSuggestion {
    pub suggestion: String,
    pub conversation_id: String,
    #[serde(default = "Utc::now", with = "iso8601")]
    pub timestamp: DateTime<Utc>,
}

impl AiSuggestion {
    pub fn new(suggestion: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            suggestion: suggestion.into(),
            conversation_id: conversation_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Support intervention. The intervention's own fields (type, content,
/// conversation_id, ...) are carried alongside the session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportIntervention {
    #[serde(flatten)]
    pub intervention: Map<String, Value>,
    pub session_id: String,
    #[serde(default = "Utc::now", with = "iso8601")]
    pub timestamp: DateTime<Utc>,
}

impl SupportIntervention {
    pub fn new(mut intervention: Map<String, Value>, session_id: impl Into<String>) -> Self {
        // the envelope-level fields win over anything the caller passed in
        intervention.remove("sessionId");
        intervention.remove("timestamp");
        Self {
            intervention,
            session_id: session_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.intervention.get(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceRecognition {
    pub transcript: String,
    pub is_final: bool,
    #[serde(default = "Utc::now", with = "iso8601")]
    pub timestamp: DateTime<Utc>,
}

impl VoiceRecognition {
    pub fn new(transcript: impl Into<String>, is_final: bool) -> Self {
        Self {
            transcript: transcript.into(),
            is_final,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub status: String,
    pub session_id: String,
    #[serde(default = "Utc::now", with = "iso8601")]
    pub timestamp: DateTime<Utc>,
}

impl SessionStatus {
    pub fn new(status: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Dispatched locally when the transport opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEstablished {
    pub session_id: String,
    #[serde(default = "Utc::now", with = "iso8601")]
    pub timestamp: DateTime<Utc>,
}

impl ConnectionEstablished {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Dispatched locally when every reconnect attempt failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionLost {
    pub session_id: String,
    pub attempts: u32,
    #[serde(default = "Utc::now", with = "iso8601")]
    pub timestamp: DateTime<Utc>,
}

impl ConnectionLost {
    pub fn new(session_id: impl Into<String>, attempts: u32) -> Self {
        Self {
            session_id: session_id.into(),
            attempts,
            timestamp: Utc::now(),
        }
    }
}

domain_payload!(QuestionAsked, EventKind::QuestionAsked);
domain_payload!(ResponseSent, EventKind::ResponseSent);
domain_payload!(AiSuggestion, EventKind::AiSuggestion);
domain_payload!(SupportIntervention, EventKind::SupportIntervention);
domain_payload!(VoiceRecognition, EventKind::VoiceRecognition);
domain_payload!(SessionStatus, EventKind::SessionStatus);
domain_payload!(ConnectionEstablished, EventKind::ConnectionEstablished);
domain_payload!(ConnectionLost, EventKind::ConnectionLost);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_question_asked_field_names() {
        let payload = QuestionAsked::new("Tell me about yourself", "session-1");
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["question"], "Tell me about yourself");
        assert_eq!(json["sessionId"], "session-1");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_voice_recognition_field_names() {
        let json = serde_json::to_value(VoiceRecognition::new("I led the", false)).unwrap();
        assert_eq!(json["transcript"], "I led the");
        assert_eq!(json["isFinal"], false);
    }

    #[test]
    fn test_support_intervention_flattens_fields() {
        let mut fields = Map::new();
        fields.insert("type".to_string(), json!("highlight"));
        fields.insert("content".to_string(), json!("mention the migration project"));
        fields.insert("sessionId".to_string(), json!("stale"));

        let payload = SupportIntervention::new(fields, "session-9");
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["type"], "highlight");
        assert_eq!(json["content"], "mention the migration project");
        assert_eq!(json["sessionId"], "session-9");

        let back: SupportIntervention = serde_json::from_value(json).unwrap();
        assert_eq!(back.field("type"), Some(&json!("highlight")));
        assert_eq!(back.session_id, "session-9");
        assert!(back.field("sessionId").is_none());
    }

    #[test]
    fn test_into_envelope_uses_fixed_kind() {
        let envelope = AiSuggestion::new("Use the STAR format", "conv-3")
            .into_envelope()
            .unwrap();

        assert_eq!(envelope.kind, EventKind::AiSuggestion);
        assert_eq!(envelope.payload["conversationId"], "conv-3");
    }

    #[test]
    fn test_from_envelope_rejects_other_kind() {
        let envelope = Envelope::new(EventKind::SessionStatus, json!({}));
        let err = QuestionAsked::from_envelope(&envelope).unwrap_err();
        assert!(matches!(err, CodecError::KindMismatch { .. }));
    }

    #[test]
    fn test_from_envelope_rejects_bad_shape() {
        let envelope = Envelope::new(EventKind::VoiceRecognition, json!({"transcript": 7}));
        let err = VoiceRecognition::from_envelope(&envelope).unwrap_err();
        assert!(matches!(err, CodecError::Payload { .. }));
    }
}
