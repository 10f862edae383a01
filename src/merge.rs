//! Stream merger: one event kind, static snapshot + live deliveries.
//!
//! Entries are keyed by identity. Static entries go in first, then live ones
//! overwrite in place (a live payload fully replaces the earlier representation).
//! Output order is first-insertion order; chronological order is applied later.

use crate::identity::{Identify, IdentityKey};
use crate::pipeline::AssembleOptions;
use crate::records::{Received, TimelineItem, TimelineRecord};
use crate::timestamp::{self, Fallback};
use std::collections::HashMap;
use tracing::debug;

struct Entry<R> {
    key: IdentityKey,
    record: R,
    is_live: bool,
    received_at: Option<i64>,
}

pub fn merge_stream<R>(
    static_records: &[R],
    live_records: &[Received<R>],
    options: &AssembleOptions,
) -> Vec<TimelineItem>
where
    R: TimelineRecord + Identify,
{
    let total = static_records.len() + live_records.len();
    let mut slots: HashMap<IdentityKey, usize> = HashMap::with_capacity(total);
    let mut entries: Vec<Entry<R>> = Vec::with_capacity(total);

    let statics = static_records.iter().map(|record| (record, false, None));
    let lives = live_records
        .iter()
        .map(|live| (&live.record, true, live.received_at));

    for (record, is_live, received_at) in statics.chain(lives) {
        let key = record.identity_key();
        match slots.get(&key) {
            Some(&slot) => {
                let entry = &mut entries[slot];
                entry.record = record.clone();
                entry.is_live = is_live;
                entry.received_at = received_at;
            }
            None => {
                slots.insert(key.clone(), entries.len());
                entries.push(Entry {
                    key,
                    record: record.clone(),
                    is_live,
                    received_at,
                });
            }
        }
    }

    let duplicates = total - entries.len();
    if duplicates > 0 {
        debug!("Merged {} duplicate deliveries", duplicates);
    }

    entries
        .into_iter()
        .map(|entry| stamp(entry, options))
        .collect()
}

/// Normalize the entry's timestamp and wrap it as a timeline item.
fn stamp<R: TimelineRecord>(entry: Entry<R>, options: &AssembleOptions) -> TimelineItem {
    let sort_time = match timestamp::normalize(entry.record.timestamp(), options.utc_offset) {
        Some(ms) => ms,
        None => {
            // Optimistic local sends carry no usable timestamp yet; place them
            // at their arrival instant
            let fallback = match entry.received_at {
                Some(at) if entry.is_live => Fallback::At(at),
                _ => Fallback::Epoch,
            };
            debug!(
                "Unparseable timestamp for {}, using {:?}",
                entry.key, fallback
            );
            fallback.millis()
        }
    };

    TimelineItem::new(
        entry.key,
        entry.record.into_kind(),
        sort_time,
        entry.is_live,
        options.utc_offset,
    )
}
