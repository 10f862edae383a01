//! Identity keys: detect the same event delivered twice (snapshot vs live).

use crate::records::{Log, Message, Note};
use serde::Serialize;
use std::fmt;

const TEMP_MESSAGE_ID: &str = "temp";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for IdentityKey {
    fn from(value: &str) -> Self {
        IdentityKey(value.to_string())
    }
}

impl From<String> for IdentityKey {
    fn from(value: String) -> Self {
        IdentityKey(value)
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait Identify {
    fn identity_key(&self) -> IdentityKey;
}

/// Server message id when present, else `(local id | "temp") + time_sent`.
impl Identify for Message {
    fn identity_key(&self) -> IdentityKey {
        if let Some(message_id) = self
            .message_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            return IdentityKey::from(message_id);
        }
        let local = self.id.as_deref().unwrap_or(TEMP_MESSAGE_ID);
        IdentityKey(format!("{}-{}", local, self.time_sent))
    }
}

/// Server log id when present, else `(timestamp, subject)`.
impl Identify for Log {
    fn identity_key(&self) -> IdentityKey {
        if let Some(id) = self.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            return IdentityKey::from(id);
        }
        IdentityKey(format!("{}-{}", self.timestamp, self.subject))
    }
}

/// Notes carry no reliable id on the live channel, so identity is content based.
/// The value is trimmed so whitespace padding does not split one note into two.
impl Identify for Note {
    fn identity_key(&self) -> IdentityKey {
        IdentityKey(format!(
            "{}|{}|{}|{}|{}",
            self.ticket_id,
            self.technician_id,
            self.note_type.as_str(),
            self.value.trim(),
            self.created_at
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{NoteType, RawTimestamp};

    fn message(id: Option<&str>, message_id: Option<&str>, time_sent: &str) -> Message {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "message_id": message_id,
            "ticket_id": 1,
            "message": "hi",
            "time_sent": time_sent,
        }))
        .unwrap()
    }

    #[test]
    fn test_message_prefers_server_id() {
        let a = message(Some("1"), Some("srv-9"), "01-01-2024 10:00:00");
        let b = message(Some("77"), Some("srv-9"), "01-01-2024 10:00:05");
        assert_eq!(a.identity_key(), b.identity_key());
        assert_eq!(a.identity_key().as_str(), "srv-9");
    }

    #[test]
    fn test_message_without_server_id() {
        assert_eq!(
            message(Some("12"), None, "01-01-2024 10:00:00").identity_key().as_str(),
            "12-01-01-2024 10:00:00"
        );
        assert_eq!(
            message(None, Some("  "), "01-01-2024 10:00:00").identity_key().as_str(),
            "temp-01-01-2024 10:00:00"
        );
    }

    #[test]
    fn test_log_key() {
        let mut log = Log {
            id: None,
            ticket_id: 1,
            timestamp: RawTimestamp::Text("2024-01-01T10:00:00Z".to_string()),
            subject: "status".to_string(),
            action: "changed".to_string(),
            by: None,
            log_type: "workflow".to_string(),
            from: None,
            to: None,
            task_id: None,
        };
        assert_eq!(log.identity_key().as_str(), "2024-01-01T10:00:00Z-status");

        log.id = Some("31".to_string());
        assert_eq!(log.identity_key().as_str(), "31");
    }

    #[test]
    fn test_note_key_ignores_padding() {
        let padded = Note {
            ticket_id: 1,
            technician_id: 5,
            note_type: NoteType::Text,
            value: "hello ".to_string(),
            created_at: "2024-01-01 10:00:00".to_string(),
        };
        let trimmed = Note {
            value: "hello".to_string(),
            ..padded.clone()
        };
        assert_eq!(padded.identity_key(), trimmed.identity_key());

        let other_author = Note {
            technician_id: 6,
            ..padded.clone()
        };
        assert_ne!(padded.identity_key(), other_author.identity_key());
    }
}
