//! Per-ticket input state shared across the server.
//!
//! Holds the latest static snapshot and the live deliveries accumulated since
//! the ticket was opened. Timelines are never stored: every read reruns the
//! assembly pipeline over the current inputs.

use crate::error::{TimelineError, TimelineResult};
use crate::participants::ParticipantDirectory;
use crate::pipeline::{assemble, AssembleOptions, TicketStreams};
use crate::records::{
    Client, DateGroup, Log, Message, Note, Received, Technician, TicketId, TimelineRecord,
};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Bulk snapshot of one ticket, already filtered to it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub messages: Vec<Message>,
    pub logs: Vec<Log>,
    pub notes: Vec<Note>,
    pub technicians: Vec<Technician>,
    pub clients: Vec<Client>,
}

/// A single push from the live channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LiveEvent {
    Message(Message),
    Log(Log),
    Note(Note),
}

impl LiveEvent {
    pub fn ticket_id(&self) -> TicketId {
        match self {
            LiveEvent::Message(m) => m.ticket_id(),
            LiveEvent::Log(l) => l.ticket_id(),
            LiveEvent::Note(n) => n.ticket_id(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct LiveFeed {
    messages: Vec<Received<Message>>,
    logs: Vec<Received<Log>>,
    notes: Vec<Received<Note>>,
}

impl LiveFeed {
    fn len(&self) -> usize {
        self.messages.len() + self.logs.len() + self.notes.len()
    }
}

#[derive(Debug, Clone, Default)]
struct TicketState {
    snapshot: Snapshot,
    live: LiveFeed,
    has_snapshot: bool,
}

/// Events broadcast when a ticket's inputs change
#[derive(Debug, Clone, PartialEq)]
pub enum TicketEvent {
    SnapshotLoaded { ticket_id: TicketId },
    LiveReceived { ticket_id: TicketId },
    LiveCleared { ticket_id: TicketId },
}

impl TicketEvent {
    pub fn ticket_id(&self) -> TicketId {
        match self {
            TicketEvent::SnapshotLoaded { ticket_id }
            | TicketEvent::LiveReceived { ticket_id }
            | TicketEvent::LiveCleared { ticket_id } => *ticket_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TicketSummary {
    pub ticket_id: TicketId,
    pub messages: usize,
    pub logs: usize,
    pub notes: usize,
    pub live_events: usize,
}

/// A ticket exists once a snapshot was applied or a live record was accepted.
pub struct TicketCache {
    tickets: DashMap<TicketId, TicketState>,
    /// Newest snapshot fetch per ticket; older fetches finishing late are dropped
    generations: DashMap<TicketId, u64>,
    event_tx: broadcast::Sender<TicketEvent>,
    options: AssembleOptions,
}

impl TicketCache {
    pub fn new(options: AssembleOptions) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            tickets: DashMap::new(),
            generations: DashMap::new(),
            event_tx,
            options,
        })
    }

    /// Register a new snapshot fetch, superseding any fetch still in flight.
    pub fn begin_snapshot(&self, ticket_id: TicketId) -> u64 {
        let mut generation = self.generations.entry(ticket_id).or_default();
        *generation += 1;
        *generation
    }

    /// Store a fetched snapshot. Returns false (and drops it) when a newer
    /// fetch was started after `generation`.
    pub fn apply_snapshot(&self, ticket_id: TicketId, generation: u64, snapshot: Snapshot) -> bool {
        {
            // Held until the snapshot is stored so a newer fetch cannot slip in between
            let newest = self.generations.get(&ticket_id);
            let current = newest.as_deref().copied().unwrap_or(0);
            if generation != current {
                debug!(
                    "Dropping stale snapshot for ticket {} (generation {} < {})",
                    ticket_id, generation, current
                );
                return false;
            }
            let mut state = self.tickets.entry(ticket_id).or_default();
            state.snapshot = snapshot;
            state.has_snapshot = true;
        }

        info!("Snapshot loaded for ticket {}", ticket_id);
        let _ = self.event_tx.send(TicketEvent::SnapshotLoaded { ticket_id });
        true
    }

    /// Append one live delivery. Events for another ticket are rejected.
    pub fn push_live(&self, ticket_id: TicketId, event: LiveEvent) -> TimelineResult<()> {
        self.push_live_at(ticket_id, event, Utc::now().timestamp_millis())
    }

    /// `push_live` with an explicit arrival instant (epoch ms).
    pub fn push_live_at(
        &self,
        ticket_id: TicketId,
        event: LiveEvent,
        received_at: i64,
    ) -> TimelineResult<()> {
        let found = event.ticket_id();
        if found != ticket_id {
            return Err(TimelineError::TicketMismatch {
                expected: ticket_id,
                found,
            });
        }

        {
            let mut state = self.tickets.entry(ticket_id).or_default();
            match event {
                LiveEvent::Message(m) => state.live.messages.push(Received::at(m, received_at)),
                LiveEvent::Log(l) => state.live.logs.push(Received::at(l, received_at)),
                LiveEvent::Note(n) => state.live.notes.push(Received::at(n, received_at)),
            }
        }

        let _ = self.event_tx.send(TicketEvent::LiveReceived { ticket_id });
        Ok(())
    }

    /// Drop accumulated live deliveries (ticket closed in the UI).
    pub fn clear_live(&self, ticket_id: TicketId) -> TimelineResult<()> {
        {
            let mut state = self
                .tickets
                .get_mut(&ticket_id)
                .ok_or(TimelineError::UnknownTicket(ticket_id))?;
            state.live = LiveFeed::default();
        }
        let _ = self.event_tx.send(TicketEvent::LiveCleared { ticket_id });
        Ok(())
    }

    /// Assemble the ticket's timeline from its current inputs.
    pub fn timeline(&self, ticket_id: TicketId) -> TimelineResult<Vec<DateGroup>> {
        let state = self
            .tickets
            .get(&ticket_id)
            .ok_or(TimelineError::UnknownTicket(ticket_id))?;

        let directory =
            ParticipantDirectory::new(&state.snapshot.technicians, &state.snapshot.clients);
        let streams = TicketStreams {
            static_messages: &state.snapshot.messages,
            live_messages: &state.live.messages,
            static_logs: &state.snapshot.logs,
            live_logs: &state.live.logs,
            static_notes: &state.snapshot.notes,
            live_notes: &state.live.notes,
        };
        Ok(assemble(&streams, &directory, &self.options))
    }

    pub fn contains(&self, ticket_id: TicketId) -> bool {
        self.tickets.contains_key(&ticket_id)
    }

    pub fn ticket_count(&self) -> usize {
        self.tickets.len()
    }

    pub fn list_tickets(&self) -> Vec<TicketSummary> {
        let mut summaries: Vec<TicketSummary> = self
            .tickets
            .iter()
            .filter(|r| r.has_snapshot || r.live.len() > 0)
            .map(|r| TicketSummary {
                ticket_id: *r.key(),
                messages: r.snapshot.messages.len(),
                logs: r.snapshot.logs.len(),
                notes: r.snapshot.notes.len(),
                live_events: r.live.len(),
            })
            .collect();
        summaries.sort_by_key(|s| s.ticket_id);
        summaries
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TicketEvent> {
        self.event_tx.subscribe()
    }
}
