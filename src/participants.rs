//! Call participant resolution.
//!
//! Call messages carry raw caller/receiver identifiers: SIP URIs or extensions
//! for technicians, phone numbers for clients. Identifiers are matched against
//! technicians by SIP id first, then against clients by phone digits; anything
//! else is shown with its raw value.

use crate::records::{Client, Message, Technician};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    #[serde(alias = "ANSWERED")]
    Answered,
    #[serde(alias = "NO ANSWER", alias = "no answer", alias = "missed")]
    NoAnswer,
    #[serde(alias = "BUSY")]
    Busy,
    #[serde(alias = "FAILED")]
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

const CALLER_FIELDS: &[&str] = &["caller", "from", "src"];
const RECEIVER_FIELDS: &[&str] = &["receiver", "to", "callee", "dst"];

/// Raw call metadata as stored on a call message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallMetadata {
    pub status: CallStatus,
    pub caller: Option<String>,
    pub receiver: Option<String>,
    pub duration: Option<u64>,
    pub record_url: Option<String>,
}

impl CallMetadata {
    /// Read from `call_metadata`, or from the JSON-encoded message body.
    pub fn from_message(message: &Message) -> Option<Self> {
        let value = match &message.call_metadata {
            Some(Value::String(text)) => serde_json::from_str(text).ok()?,
            Some(value) => value.clone(),
            None => serde_json::from_str(&message.message).ok()?,
        };
        Self::from_value(&value)
    }

    /// Fields are read independently; an unreadable field stays empty
    /// without discarding the others.
    pub fn from_value(value: &Value) -> Option<Self> {
        let fields = value.as_object()?;
        let first_identifier = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| fields.get(*name).and_then(identifier))
        };

        Some(Self {
            status: fields
                .get("status")
                .and_then(|v| CallStatus::deserialize(v).ok())
                .unwrap_or_default(),
            caller: first_identifier(CALLER_FIELDS),
            receiver: first_identifier(RECEIVER_FIELDS),
            duration: fields.get("duration").and_then(seconds),
            record_url: fields
                .get("record_url")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string),
        })
    }
}

/// SIP ids and phones arrive as strings or bare numbers.
fn identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Call duration in seconds; PBX exports often send it as a string.
fn seconds(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f.round() as u64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Participant {
    Technician { id: i64, name: String },
    Client { id: i64, name: String },
    Unknown { raw: String },
}

impl Participant {
    pub fn display_name(&self) -> String {
        match self {
            Participant::Technician { name, .. } | Participant::Client { name, .. } => name.clone(),
            Participant::Unknown { raw } if raw.is_empty() => "Unknown participant".to_string(),
            Participant::Unknown { raw } => format!("Unknown participant ({})", raw),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallParticipants {
    pub status: CallStatus,
    pub caller: Participant,
    pub receiver: Participant,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_url: Option<String>,
}

/// Lookup tables built once per pipeline run.
#[derive(Debug, Default)]
pub struct ParticipantDirectory {
    technicians_by_sip: HashMap<String, (i64, String)>,
    clients_by_phone: HashMap<String, (i64, String)>,
}

impl ParticipantDirectory {
    pub fn new(technicians: &[Technician], clients: &[Client]) -> Self {
        let mut technicians_by_sip = HashMap::new();
        for tech in technicians.iter().filter(|t| !t.is_group) {
            if let Some(key) = tech.sip_id.as_deref().and_then(sip_key) {
                technicians_by_sip
                    .entry(key)
                    .or_insert_with(|| (tech.id, tech.name.clone()));
            }
        }

        let mut clients_by_phone = HashMap::new();
        for client in clients {
            if let Some(key) = client.phone.as_deref().and_then(phone_key) {
                clients_by_phone
                    .entry(key)
                    .or_insert_with(|| (client.id, client.name.clone()));
            }
        }

        Self {
            technicians_by_sip,
            clients_by_phone,
        }
    }

    pub fn resolve(&self, raw: Option<&str>) -> Participant {
        let raw = raw.map(str::trim).unwrap_or("");

        if let Some((id, name)) = sip_key(raw).and_then(|key| self.technicians_by_sip.get(&key)) {
            return Participant::Technician {
                id: *id,
                name: name.clone(),
            };
        }
        if let Some((id, name)) = phone_key(raw).and_then(|key| self.clients_by_phone.get(&key)) {
            return Participant::Client {
                id: *id,
                name: name.clone(),
            };
        }

        Participant::Unknown { raw: raw.to_string() }
    }

    pub fn resolve_call(&self, message: &Message) -> CallParticipants {
        let metadata = CallMetadata::from_message(message).unwrap_or_else(|| {
            debug!(
                "Unreadable call metadata on message {:?}, showing unknown participants",
                message.message_id.as_deref().or(message.id.as_deref())
            );
            CallMetadata::default()
        });

        let caller = self.resolve(metadata.caller.as_deref());
        let receiver = self.resolve(metadata.receiver.as_deref());
        debug!(
            "Call {} -> {} ({:?})",
            caller.display_name(),
            receiver.display_name(),
            metadata.status
        );

        CallParticipants {
            status: metadata.status,
            caller,
            receiver,
            duration: metadata.duration,
            record_url: metadata.record_url,
        }
    }
}

/// `sip:101@pbx.local` → `101`
fn sip_key(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let without_scheme = raw
        .strip_prefix("sip:")
        .or_else(|| raw.strip_prefix("SIP:"))
        .unwrap_or(raw);
    let user = without_scheme.split('@').next().unwrap_or("").trim();
    if user.is_empty() {
        None
    } else {
        Some(user.to_lowercase())
    }
}

/// `+7 (999) 123-45-67` → `79991234567`
fn phone_key(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}
