//! Ticket record types and the derived timeline structures.
//!
//! The three source kinds (`Message`, `Log`, `Note`) mirror what the REST
//! snapshot and the live channel deliver. Everything below `TimelineItem` is
//! derived by the pipeline and rebuilt on every recomputation.

use crate::identity::IdentityKey;
use crate::participants::CallParticipants;
use crate::timestamp::{self, TimestampInput};
use chrono::FixedOffset;
use serde::{Deserialize, Deserializer, Serialize};

pub type TicketId = i64;

/// Accepts ids that arrive as either JSON strings or numbers.
pub(crate) fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

// ============================================================================
// Source records
// ============================================================================

/// Media kind of a chat message. Calls are a message subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    File,
    Email,
    Call,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Local/transport id (may be absent for optimistic sends)
    #[serde(default, deserialize_with = "lenient_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Server-assigned message id
    #[serde(default, deserialize_with = "lenient_id", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub ticket_id: TicketId,
    #[serde(default)]
    pub client_id: Option<i64>,
    #[serde(default)]
    pub sender_id: Option<i64>,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub mtype: MessageType,
    /// Body text, media URL, or JSON-encoded call metadata
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub time_sent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_metadata: Option<serde_json::Value>,
}

/// Timestamp as delivered on the wire: epoch milliseconds or text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Millis(i64),
    Fractional(f64),
    Text(String),
}

impl Default for RawTimestamp {
    fn default() -> Self {
        RawTimestamp::Text(String::new())
    }
}

impl RawTimestamp {
    pub fn as_input(&self) -> TimestampInput<'_> {
        match self {
            RawTimestamp::Millis(ms) => TimestampInput::EpochMillis(*ms),
            RawTimestamp::Fractional(ms) => TimestampInput::EpochFractional(*ms),
            RawTimestamp::Text(text) => TimestampInput::Text(text),
        }
    }
}

impl std::fmt::Display for RawTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawTimestamp::Millis(ms) => write!(f, "{}", ms),
            RawTimestamp::Fractional(ms) => write!(f, "{}", ms),
            RawTimestamp::Text(text) => f.write_str(text),
        }
    }
}

/// A state-change event on the ticket (workflow transition, task creation, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    #[serde(default, deserialize_with = "lenient_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub ticket_id: TicketId,
    #[serde(default)]
    pub timestamp: RawTimestamp,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub action: String,
    #[serde(default, deserialize_with = "lenient_id")]
    pub by: Option<String>,
    #[serde(rename = "type", default)]
    pub log_type: String,
    #[serde(default, deserialize_with = "lenient_id", skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, deserialize_with = "lenient_id", skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, deserialize_with = "lenient_id", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteType {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    File,
    #[serde(other)]
    Other,
}

impl NoteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteType::Text => "text",
            NoteType::Image => "image",
            NoteType::Video => "video",
            NoteType::Audio => "audio",
            NoteType::File => "file",
            NoteType::Other => "other",
        }
    }
}

/// Free-text or media annotation left by a technician
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub ticket_id: TicketId,
    pub technician_id: i64,
    #[serde(rename = "type", default)]
    pub note_type: NoteType,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub created_at: String,
}

// ============================================================================
// Participants
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Technician {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    /// Internal extension the technician is reached on
    #[serde(default, alias = "sip", alias = "extension", deserialize_with = "lenient_id")]
    pub sip_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub phone: Option<String>,
    /// Group-aggregation pseudo-technician (never a call participant)
    #[serde(default)]
    pub is_group: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_id")]
    pub phone: Option<String>,
}

// ============================================================================
// Derived timeline structures
// ============================================================================

/// Record kinds the pipeline can sequence.
pub trait TimelineRecord: Clone {
    fn ticket_id(&self) -> TicketId;
    fn timestamp(&self) -> TimestampInput<'_>;
    fn into_kind(self) -> ItemKind;
}

impl TimelineRecord for Message {
    fn ticket_id(&self) -> TicketId {
        self.ticket_id
    }

    fn timestamp(&self) -> TimestampInput<'_> {
        TimestampInput::Text(&self.time_sent)
    }

    fn into_kind(self) -> ItemKind {
        ItemKind::Message(self)
    }
}

impl TimelineRecord for Log {
    fn ticket_id(&self) -> TicketId {
        self.ticket_id
    }

    fn timestamp(&self) -> TimestampInput<'_> {
        self.timestamp.as_input()
    }

    fn into_kind(self) -> ItemKind {
        ItemKind::Log(self)
    }
}

impl TimelineRecord for Note {
    fn ticket_id(&self) -> TicketId {
        self.ticket_id
    }

    fn timestamp(&self) -> TimestampInput<'_> {
        TimestampInput::Text(&self.created_at)
    }

    fn into_kind(self) -> ItemKind {
        ItemKind::Note(self)
    }
}

/// A live delivery together with the instant it reached the service.
#[derive(Debug, Clone, PartialEq)]
pub struct Received<R> {
    pub record: R,
    /// Epoch ms of arrival; stands in for an unusable record timestamp
    pub received_at: Option<i64>,
}

impl<R> Received<R> {
    pub fn at(record: R, received_at: i64) -> Self {
        Self {
            record,
            received_at: Some(received_at),
        }
    }
}

impl<R> From<R> for Received<R> {
    fn from(record: R) -> Self {
        Self {
            record,
            received_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    Message,
    Log,
    Note,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "itemType", rename_all = "lowercase")]
pub enum ItemKind {
    Message(Message),
    Log(Log),
    Note(Note),
}

impl ItemKind {
    pub fn item_type(&self) -> ItemType {
        match self {
            ItemKind::Message(_) => ItemType::Message,
            ItemKind::Log(_) => ItemType::Log,
            ItemKind::Note(_) => ItemType::Note,
        }
    }
}

/// One record placed on the timeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineItem {
    pub key: IdentityKey,
    #[serde(flatten)]
    pub kind: ItemKind,
    /// Normalized instant, epoch milliseconds
    pub sort_time: i64,
    /// Calendar day of `sort_time`, `DD.MM.YYYY`
    pub date_divider: String,
    pub is_live: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call: Option<CallParticipants>,
}

impl TimelineItem {
    pub fn new(
        key: IdentityKey,
        kind: ItemKind,
        sort_time: i64,
        is_live: bool,
        offset: FixedOffset,
    ) -> Self {
        Self {
            key,
            kind,
            sort_time,
            date_divider: timestamp::day_divider(sort_time, offset),
            is_live,
            call: None,
        }
    }

    pub fn item_type(&self) -> ItemType {
        self.kind.item_type()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogBlock {
    pub items: Vec<TimelineItem>,
    pub start_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogClusterBlock {
    pub logs: Vec<TimelineItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoteBlock {
    pub note: TimelineItem,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Dialog(DialogBlock),
    LogCluster(LogClusterBlock),
    Note(NoteBlock),
}

impl Block {
    /// Items held by the block, in timeline order
    pub fn items(&self) -> &[TimelineItem] {
        match self {
            Block::Dialog(dialog) => &dialog.items,
            Block::LogCluster(cluster) => &cluster.logs,
            Block::Note(note) => std::slice::from_ref(&note.note),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateGroup {
    pub date: String,
    pub blocks: Vec<Block>,
}

impl DateGroup {
    pub fn items(&self) -> impl Iterator<Item = &TimelineItem> {
        self.blocks.iter().flat_map(|block| block.items().iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_accepts_numeric_ids() {
        let msg: Message = serde_json::from_value(serde_json::json!({
            "id": 17,
            "message_id": "srv-1",
            "ticket_id": 4,
            "platform": "whatsapp",
            "mtype": "image",
            "message": "https://cdn/img.png",
            "time_sent": "01-03-2024 10:00:00"
        }))
        .unwrap();
        assert_eq!(msg.id.as_deref(), Some("17"));
        assert_eq!(msg.message_id.as_deref(), Some("srv-1"));
        assert_eq!(msg.mtype, MessageType::Image);
    }

    #[test]
    fn test_unknown_message_type_is_other() {
        let msg: Message = serde_json::from_value(serde_json::json!({
            "ticket_id": 1,
            "mtype": "sticker",
            "time_sent": ""
        }))
        .unwrap();
        assert_eq!(msg.mtype, MessageType::Other);
        assert!(msg.message_id.is_none());
    }

    #[test]
    fn test_log_timestamp_number_or_text() {
        let numeric: Log = serde_json::from_value(serde_json::json!({
            "ticket_id": 1, "timestamp": 1704103200000i64, "subject": "status"
        }))
        .unwrap();
        assert_eq!(numeric.timestamp, RawTimestamp::Millis(1704103200000));

        let text: Log = serde_json::from_value(serde_json::json!({
            "ticket_id": 1,
            "timestamp": "2024-01-01T10:00:00Z",
            "subject": "status",
            "type": "workflow"
        }))
        .unwrap();
        assert_eq!(text.timestamp, RawTimestamp::Text("2024-01-01T10:00:00Z".to_string()));
        assert_eq!(text.log_type, "workflow");
    }

    #[test]
    fn test_timeline_item_serializes_flat() {
        let note = Note {
            ticket_id: 1,
            technician_id: 5,
            note_type: NoteType::Text,
            value: "hello".to_string(),
            created_at: "2024-01-01 10:00:00".to_string(),
        };
        let item = TimelineItem::new(
            IdentityKey::from("k"),
            ItemKind::Note(note),
            1704103200000,
            true,
            FixedOffset::east_opt(0).unwrap(),
        );
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["itemType"], "note");
        assert_eq!(json["isLive"], true);
        assert_eq!(json["dateDivider"], "01.01.2024");
        assert_eq!(json["value"], "hello");
        assert!(json.get("call").is_none());
    }
}
