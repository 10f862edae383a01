//! Snapshot ingestion - watches the snapshot directory and loads ticket snapshots.
//!
//! Watches:
//! - {snapshot_dir}/{ticket_id}.json (bulk REST snapshot of one ticket)
//!
//! Each (re)load takes a fresh snapshot generation before parsing, so a slow
//! parse that finishes after a newer one is discarded by the cache.

use crate::error::{TimelineError, TimelineResult};
use crate::records::{Client, Log, Message, Note, Technician, TicketId, TimelineRecord};
use crate::tickets::{Snapshot, TicketCache};
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, DebouncedEventKind};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Debounce duration for file changes
const DEBOUNCE_MS: u64 = 100;

/// On-disk snapshot layout. Collections stay raw JSON so each record is
/// decoded on its own.
#[derive(Debug, Deserialize)]
struct SnapshotFile {
    ticket_id: TicketId,
    #[serde(default)]
    messages: Value,
    #[serde(default)]
    logs: Value,
    #[serde(default)]
    notes: Value,
    #[serde(default)]
    technicians: Value,
    #[serde(default)]
    clients: Value,
}

/// `/data/tickets/42.json` -> 42
pub fn ticket_id_from_path(path: &Path) -> Option<TicketId> {
    if path.extension().map_or(true, |e| e != "json") {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// Decode every element of a snapshot collection, skipping the ones that fail.
fn decode_each<T: DeserializeOwned>(collection: Value, kind: &str) -> Vec<T> {
    let values = match collection {
        Value::Array(values) => values,
        Value::Null => return Vec::new(),
        other => {
            warn!("Snapshot {} is not an array: {}", kind, other);
            return Vec::new();
        }
    };

    let mut decoded = Vec::with_capacity(values.len());
    for (index, value) in values.into_iter().enumerate() {
        match serde_json::from_value(value) {
            Ok(record) => decoded.push(record),
            Err(e) => warn!("Skipping malformed {} record #{}: {}", kind, index, e),
        }
    }
    decoded
}

fn keep_ticket<R: TimelineRecord>(records: Vec<R>, ticket_id: TicketId) -> Vec<R> {
    let before = records.len();
    let kept: Vec<R> = records
        .into_iter()
        .filter(|r| r.ticket_id() == ticket_id)
        .collect();
    if kept.len() < before {
        debug!(
            "Filtered {} records not belonging to ticket {}",
            before - kept.len(),
            ticket_id
        );
    }
    kept
}

/// Parse snapshot JSON, keeping only records of the file's ticket.
pub fn parse_snapshot(content: &str) -> TimelineResult<(TicketId, Snapshot)> {
    let file: SnapshotFile = serde_json::from_str(content)?;
    let ticket_id = file.ticket_id;
    let messages: Vec<Message> = decode_each(file.messages, "message");
    let logs: Vec<Log> = decode_each(file.logs, "log");
    let notes: Vec<Note> = decode_each(file.notes, "note");
    let technicians: Vec<Technician> = decode_each(file.technicians, "technician");
    let clients: Vec<Client> = decode_each(file.clients, "client");

    let snapshot = Snapshot {
        messages: keep_ticket(messages, ticket_id),
        logs: keep_ticket(logs, ticket_id),
        notes: keep_ticket(notes, ticket_id),
        technicians,
        clients,
    };
    Ok((ticket_id, snapshot))
}

/// Load one snapshot file into the cache.
/// Returns the ticket id when the snapshot was applied.
pub async fn load_snapshot_file(
    cache: &Arc<TicketCache>,
    path: &Path,
) -> TimelineResult<Option<TicketId>> {
    let ticket_id = ticket_id_from_path(path)
        .ok_or_else(|| TimelineError::InvalidSnapshotName(path.to_path_buf()))?;

    let generation = cache.begin_snapshot(ticket_id);

    let owned = path.to_path_buf();
    let parsed = tokio::task::spawn_blocking(move || -> TimelineResult<(TicketId, Snapshot)> {
        let content = fs::read_to_string(&owned)?;
        parse_snapshot(&content)
    })
    .await
    .map_err(|e| TimelineError::Io(std::io::Error::other(e)))??;

    let (file_ticket, snapshot) = parsed;
    if file_ticket != ticket_id {
        return Err(TimelineError::TicketMismatch {
            expected: ticket_id,
            found: file_ticket,
        });
    }

    if cache.apply_snapshot(ticket_id, generation, snapshot) {
        Ok(Some(ticket_id))
    } else {
        Ok(None)
    }
}

/// Load every snapshot already present in the directory.
pub async fn initial_scan(cache: &Arc<TicketCache>, dir: &Path) -> TimelineResult<usize> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if ticket_id_from_path(&path).is_none() {
            continue;
        }
        match load_snapshot_file(cache, &path).await {
            Ok(Some(_)) => count += 1,
            Ok(None) => {}
            Err(e) => warn!("Skipping snapshot {}: {}", path.display(), e),
        }
    }
    Ok(count)
}

/// Start the snapshot watcher background task
pub async fn start(cache: Arc<TicketCache>, snapshot_dir: PathBuf) {
    info!("Starting snapshot watcher (debounce: {}ms)", DEBOUNCE_MS);

    if let Err(e) = fs::create_dir_all(&snapshot_dir) {
        error!("Failed to create snapshot dir {}: {}", snapshot_dir.display(), e);
        return;
    }

    match initial_scan(&cache, &snapshot_dir).await {
        Ok(count) => info!("Initial scan complete: {} ticket snapshots loaded", count),
        Err(e) => error!("Initial snapshot scan failed: {}", e),
    }

    // Use tokio mpsc channel - blocking_send works from std::thread
    let (tx, mut rx) = tokio::sync::mpsc::channel::<PathBuf>(100);

    let watch_path = snapshot_dir.clone();
    std::thread::spawn(move || {
        let on_events = move |res: Result<Vec<DebouncedEvent>, notify::Error>| match res {
            Ok(events) => {
                debug!("Snapshot watcher received {} events", events.len());
                for event in events {
                    if let DebouncedEventKind::Any = event.kind {
                        if let Err(e) = tx.blocking_send(event.path.clone()) {
                            error!("Failed to send snapshot event: {}", e);
                        }
                    }
                }
            }
            Err(e) => {
                error!("Snapshot watcher error: {:?}", e);
            }
        };
        let mut debouncer = match new_debouncer(Duration::from_millis(DEBOUNCE_MS), on_events) {
            Ok(d) => d,
            Err(e) => {
                error!("Failed to create snapshot watcher: {}", e);
                return;
            }
        };

        if let Err(e) = debouncer.watcher().watch(&watch_path, RecursiveMode::NonRecursive) {
            error!("Failed to watch snapshot directory: {}", e);
            return;
        }

        info!("Watching {} for snapshot changes", watch_path.display());

        // Keep thread alive
        loop {
            std::thread::sleep(Duration::from_secs(60));
        }
    });

    while let Some(path) = rx.recv().await {
        if ticket_id_from_path(&path).is_none() || !path.exists() {
            continue;
        }
        debug!("Reloading snapshot {}", path.display());

        // Each reload runs on its own task; the generation check drops late parses
        let cache = cache.clone();
        tokio::spawn(async move {
            match load_snapshot_file(&cache, &path).await {
                Ok(Some(ticket_id)) => debug!("Reloaded ticket {}", ticket_id),
                Ok(None) => debug!("Superseded reload of {}", path.display()),
                Err(e) => warn!("Error loading snapshot {}: {}", path.display(), e),
            }
        });
    }
    warn!("Snapshot watcher loop exited!");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::AssembleOptions;
    use serde_json::json;

    #[test]
    fn test_ticket_id_from_path() {
        assert_eq!(ticket_id_from_path(Path::new("/data/tickets/42.json")), Some(42));
        assert_eq!(ticket_id_from_path(Path::new("/data/tickets/42.json.tmp")), None);
        assert_eq!(ticket_id_from_path(Path::new("/data/tickets/draft.json")), None);
    }

    #[test]
    fn test_parse_filters_foreign_records() {
        let content = json!({
            "ticket_id": 5,
            "messages": [
                {"message_id": "a", "ticket_id": 5, "time_sent": "01-03-2024 10:00:00"},
                {"message_id": "b", "ticket_id": 6, "time_sent": "01-03-2024 10:00:00"}
            ],
            "notes": [
                {"ticket_id": 6, "technician_id": 1, "value": "elsewhere", "created_at": ""}
            ],
            "technicians": [{"id": 1, "name": "Dana", "sip": "101"}]
        })
        .to_string();

        let (ticket_id, snapshot) = parse_snapshot(&content).unwrap();
        assert_eq!(ticket_id, 5);
        assert_eq!(snapshot.messages.len(), 1);
        assert!(snapshot.notes.is_empty());
        assert!(snapshot.logs.is_empty());
        assert_eq!(snapshot.technicians[0].sip_id.as_deref(), Some("101"));
    }

    #[test]
    fn test_malformed_record_skips_only_itself() {
        let content = json!({
            "ticket_id": 5,
            "messages": [
                {"message_id": "a", "ticket_id": 5, "time_sent": "01-03-2024 10:00:00"},
                {"message_id": "b", "ticket_id": "five"}
            ],
            "notes": [
                {"ticket_id": 5, "technician_id": null, "value": "broken", "created_at": ""},
                {
                    "ticket_id": 5,
                    "technician_id": 2,
                    "value": "kept",
                    "created_at": "2024-03-01 10:01:00"
                }
            ],
            "logs": {"unexpected": "object"},
            "clients": null
        })
        .to_string();

        let (ticket_id, snapshot) = parse_snapshot(&content).unwrap();
        assert_eq!(ticket_id, 5);
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.notes.len(), 1);
        assert_eq!(snapshot.notes[0].value, "kept");
        assert!(snapshot.logs.is_empty());
        assert!(snapshot.clients.is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(parse_snapshot("{not json"), Err(TimelineError::Json(_))));
    }

    #[tokio::test]
    async fn test_initial_scan_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("1.json"),
            json!({
                "ticket_id": 1,
                "logs": [
                    {
                        "id": 3,
                        "ticket_id": 1,
                        "timestamp": "2024-03-01T10:00:00Z",
                        "subject": "opened"
                    }
                ]
            })
            .to_string(),
        )
        .unwrap();
        fs::write(dir.path().join("2.json"), "{broken").unwrap();
        fs::write(dir.path().join("3.json"), json!({"ticket_id": 4}).to_string()).unwrap();
        fs::write(dir.path().join("6.json"), json!({"messages": []}).to_string()).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let cache = TicketCache::new(AssembleOptions::default());
        let loaded = initial_scan(&cache, dir.path()).await.unwrap();

        assert_eq!(loaded, 1);
        let groups = cache.timeline(1).unwrap();
        assert_eq!(groups[0].date, "01.03.2024");

        // Files that failed to load leave no ticket behind
        assert_eq!(cache.ticket_count(), 1);
        assert!(!cache.contains(2));
        assert!(!cache.contains(3));
        assert!(!cache.contains(6));
    }
}
