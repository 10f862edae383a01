//! Chronological sequencer.
//!
//! Concatenates messages, logs, then notes and applies a stable sort on
//! `sort_time`. Equal instants therefore keep kind-then-insertion order.
//! Position is always derived from the item's own timestamp, so a live event
//! carrying an "old" timestamp lands in its chronological slot, not at the end.

use crate::records::TimelineItem;
use tracing::debug;

pub fn sequence(
    messages: Vec<TimelineItem>,
    logs: Vec<TimelineItem>,
    notes: Vec<TimelineItem>,
) -> Vec<TimelineItem> {
    let mut items = Vec::with_capacity(messages.len() + logs.len() + notes.len());
    items.extend(messages);
    items.extend(logs);
    items.extend(notes);

    // sort_by_key is stable
    items.sort_by_key(|item| item.sort_time);

    debug!("Sequenced {} timeline items", items.len());
    items
}
