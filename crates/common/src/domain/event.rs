use crate::domain::user::User;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How user lifecycle events are encoded on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// `{id, enqueuedAt, clientId}`; the user is fetched from the user API
    #[default]
    Reference,
    /// The full user serialized as the message body
    Snapshot,
}

/// Notification that a user changed upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserReference {
    pub id: String,
    #[serde(default)]
    pub enqueued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserEvent {
    Reference(UserReference),
    Snapshot(User),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("event payload has no user id")]
    MissingId,
}

impl UserEvent {
    /// Decode a message body. Failures are permanent: the same bytes never decode later.
    pub fn decode(format: PayloadFormat, payload: &[u8]) -> Result<Self, DecodeError> {
        let event = match format {
            PayloadFormat::Reference => Self::Reference(serde_json::from_slice(payload)?),
            PayloadFormat::Snapshot => Self::Snapshot(serde_json::from_slice(payload)?),
        };

        if event.user_id().trim().is_empty() {
            return Err(DecodeError::MissingId);
        }

        Ok(event)
    }

    pub fn user_id(&self) -> &str {
        match self {
            Self::Reference(reference) => &reference.id,
            Self::Snapshot(user) => &user.id,
        }
    }

    /// Client that originated the change, if the event names one
    pub fn client_id(&self) -> Option<&str> {
        match self {
            Self::Reference(reference) => reference.client_id.as_deref(),
            Self::Snapshot(user) => Some(user.client_id.as_str()),
        }
        .filter(|client_id| !client_id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_reference() {
        let payload = br#"{"id":"u1","enqueuedAt":"2024-03-01T10:00:00Z","clientId":"web"}"#;

        let event = UserEvent::decode(PayloadFormat::Reference, payload).unwrap();

        assert_eq!(event.user_id(), "u1");
        assert_eq!(event.client_id(), Some("web"));
        match event {
            UserEvent::Reference(reference) => assert!(reference.enqueued_at.is_some()),
            UserEvent::Snapshot(_) => panic!("expected reference event"),
        }
    }

    #[test]
    fn test_decode_reference_without_optional_fields() {
        let event = UserEvent::decode(PayloadFormat::Reference, br#"{"id":"u1"}"#).unwrap();

        assert_eq!(event.user_id(), "u1");
        assert_eq!(event.client_id(), None);
    }

    #[test]
    fn test_decode_snapshot() {
        let payload = br#"{"id":"u2","email":"bo@example.com","clientId":"backoffice"}"#;

        let event = UserEvent::decode(PayloadFormat::Snapshot, payload).unwrap();

        assert_eq!(event.user_id(), "u2");
        assert_eq!(event.client_id(), Some("backoffice"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = UserEvent::decode(PayloadFormat::Reference, b"not json");
        assert!(matches!(result, Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_missing_id() {
        let result = UserEvent::decode(PayloadFormat::Snapshot, br#"{"email":"x@example.com"}"#);
        assert!(matches!(result, Err(DecodeError::MissingId)));

        let result = UserEvent::decode(PayloadFormat::Reference, br#"{"id":"  "}"#);
        assert!(matches!(result, Err(DecodeError::MissingId)));
    }
}
