//! Timeline assembly: the single pure entry point.
//!
//! ```text
//! static + live (×3 kinds)
//!     │  merge_stream     dedupe by identity key, live wins, normalize timestamps
//!     ▼
//!  sequence             stable ascending sort on sort_time
//!     ▼
//!  group_by_day         DD.MM.YYYY buckets ordered by parsed date
//!     ▼
//!  cluster_day          dialog / log cluster / note blocks, call participants
//!     ▼
//!  Vec<DateGroup>
//! ```
//!
//! No I/O and no shared state: the same inputs always produce the same output,
//! so callers simply rerun it whenever any input collection changes.

use crate::cluster::cluster_day;
use crate::grouping::group_by_day;
use crate::merge::merge_stream;
use crate::participants::ParticipantDirectory;
use crate::records::{DateGroup, Log, Message, Note, Received};
use crate::sequence::sequence;
use chrono::{FixedOffset, Offset, Utc};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssembleOptions {
    /// Offset for naive timestamps and day boundaries
    pub utc_offset: FixedOffset,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        Self {
            utc_offset: Utc.fix(),
        }
    }
}

/// Static and live collections of one ticket, already filtered to it.
/// Live records carry their arrival instant as a timestamp fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct TicketStreams<'a> {
    pub static_messages: &'a [Message],
    pub live_messages: &'a [Received<Message>],
    pub static_logs: &'a [Log],
    pub live_logs: &'a [Received<Log>],
    pub static_notes: &'a [Note],
    pub live_notes: &'a [Received<Note>],
}

pub fn assemble(
    streams: &TicketStreams<'_>,
    directory: &ParticipantDirectory,
    options: &AssembleOptions,
) -> Vec<DateGroup> {
    let messages = merge_stream(streams.static_messages, streams.live_messages, options);
    let logs = merge_stream(streams.static_logs, streams.live_logs, options);
    let notes = merge_stream(streams.static_notes, streams.live_notes, options);
    debug!(
        "Merged {} messages, {} logs, {} notes",
        messages.len(),
        logs.len(),
        notes.len()
    );

    let groups: Vec<DateGroup> = group_by_day(sequence(messages, logs, notes))
        .into_iter()
        .map(|day| DateGroup {
            date: day.date,
            blocks: cluster_day(day.items, directory),
        })
        .collect();

    debug!(
        "Assembled {} date groups, {} items",
        groups.len(),
        groups.iter().map(|g| g.items().count()).sum::<usize>()
    );
    groups
}
