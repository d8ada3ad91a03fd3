//! ==============================================================================
//! sync.rs - the sensor state synchronizer
//! ==============================================================================
//!
//! purpose:
//!     owns the one canonical SensorCollection and merges the rest snapshot
//!     and the pushed deltas into it. every view reads an Arc snapshot of it;
//!     nobody else mutates it.
//!
//! states:
//!
//! ```text
//!     uninitialized ──begin_load──> loading ──snapshot ok──> ready
//!           ^                          │                       │ (steady state,
//!           └───────snapshot failed────┘                       │  keeps mutating)
//!                                                              └─ re-loads stay ready
//! ```
//!
//! single writer:
//!     every method takes &mut self. the hub task is the only owner, so
//!     snapshot completion, channel deltas and ui commands are applied one at
//!     a time in arrival order. conflicts resolve per sensor, last write wins.
//!
//! loads in flight:
//!     - deltas that arrive before the first snapshot are journaled and
//!       replayed right after it is merged.
//!     - deltas that arrive during a re-load are applied immediately AND
//!       journaled, then re-applied after the merge so an older snapshot
//!       cannot overwrite them.
//!     - a completion carrying an outdated ticket (shutdown happened or a
//!       newer load started) is dropped.
//!
//! merge rule:
//!     snapshot records replace the stored record for their id. ids missing
//!     from a snapshot are kept: only tombstones delete.
//!
//! ==============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;

use crate::domain::{DeltaEvent, SensorCollection, SensorId, SensorRecord};
use crate::error::FetchFailure;
use crate::loader::SnapshotSource;

/// journal bound used when none is configured
pub const DEFAULT_MAX_PENDING_DELTAS: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Uninitialized,
    Loading,
    Ready,
}

/// read-only view handed to listeners and readers
pub type Snapshot = Arc<SensorCollection>;

pub type Listener = Box<dyn FnMut(&Snapshot) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// proof of which load a completion belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct LoadTicket {
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Applied { records: usize, replayed: usize },
    /// the ticket was outdated; nothing changed
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Applied,
    /// valid but changed nothing (same record again, or delete of an unknown id)
    Unchanged,
    /// held until the snapshot arrives
    Buffered,
}

pub struct Synchronizer {
    state: SyncState,
    collection: Snapshot,
    selection: Option<SensorId>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
    generation: u64,
    in_flight: Option<u64>,
    journal: VecDeque<DeltaEvent>,
    max_journal: usize,
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Synchronizer {
    pub fn new() -> Self {
        Self::with_journal_capacity(DEFAULT_MAX_PENDING_DELTAS)
    }

    pub fn with_journal_capacity(max_journal: usize) -> Self {
        Self {
            state: SyncState::Uninitialized,
            collection: Arc::new(SensorCollection::new()),
            selection: None,
            listeners: Vec::new(),
            next_listener: 0,
            generation: 0,
            in_flight: None,
            journal: VecDeque::new(),
            max_journal: max_journal.max(1),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.collection.clone()
    }

    pub fn pending_deltas(&self) -> usize {
        self.journal.len()
    }

    // ==========================================================================
    // snapshot loading
    // ==========================================================================

    /// load once from `source` and merge. a failure leaves the synchronizer
    /// re-initializable; call again to retry.
    pub async fn initialize(
        &mut self,
        source: &dyn SnapshotSource,
    ) -> Result<LoadOutcome, FetchFailure> {
        let ticket = self.begin_load();
        let result = source.load_all().await;
        self.complete_load(ticket, result)
    }

    /// mark a load as started. any earlier in-flight load becomes stale.
    pub fn begin_load(&mut self) -> LoadTicket {
        self.generation += 1;
        self.in_flight = Some(self.generation);
        if self.state == SyncState::Uninitialized {
            self.state = SyncState::Loading;
        }
        tracing::debug!(generation = self.generation, state = ?self.state, "snapshot load started");
        LoadTicket {
            generation: self.generation,
        }
    }

    pub fn complete_load(
        &mut self,
        ticket: LoadTicket,
        result: Result<SensorCollection, FetchFailure>,
    ) -> Result<LoadOutcome, FetchFailure> {
        if self.in_flight != Some(ticket.generation) {
            tracing::debug!(
                generation = ticket.generation,
                current = self.generation,
                "discarding stale snapshot result"
            );
            return Ok(LoadOutcome::Discarded);
        }
        self.in_flight = None;

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                if self.state == SyncState::Loading {
                    // pre-ready deltas stay journaled for the next attempt
                    self.state = SyncState::Uninitialized;
                } else {
                    // already applied live; nothing left to protect
                    self.journal.clear();
                }
                tracing::warn!(error = %e, state = ?self.state, "snapshot load failed");
                return Err(e);
            }
        };

        let records = snapshot.len();
        let replayed = self.journal.len();
        {
            let collection = Arc::make_mut(&mut self.collection);
            for record in Vec::<SensorRecord>::from(snapshot) {
                collection.upsert(record);
            }
        }
        for delta in std::mem::take(&mut self.journal) {
            self.apply_to_collection(delta);
        }

        self.state = SyncState::Ready;
        tracing::info!(records, replayed, total = self.collection.len(), "snapshot merged");
        self.notify();

        Ok(LoadOutcome::Applied { records, replayed })
    }

    // ==========================================================================
    // deltas
    // ==========================================================================

    pub fn apply_delta(&mut self, delta: DeltaEvent) -> DeltaOutcome {
        if self.state != SyncState::Ready {
            self.journal_push(delta);
            return DeltaOutcome::Buffered;
        }

        if self.in_flight.is_some() {
            self.journal_push(delta.clone());
        }

        if self.apply_to_collection(delta) {
            self.notify();
            DeltaOutcome::Applied
        } else {
            DeltaOutcome::Unchanged
        }
    }

    fn journal_push(&mut self, delta: DeltaEvent) {
        if self.journal.len() >= self.max_journal {
            if let Some(dropped) = self.journal.pop_front() {
                tracing::warn!(id = %dropped.id(), capacity = self.max_journal, "delta journal full, dropping oldest");
            }
        }
        self.journal.push_back(delta);
    }

    /// returns whether the collection changed. never notifies.
    fn apply_to_collection(&mut self, delta: DeltaEvent) -> bool {
        match delta {
            DeltaEvent::Upsert(record) => {
                if self.collection.get(&record.id) == Some(&record) {
                    return false;
                }
                Arc::make_mut(&mut self.collection).upsert(record)
            }
            DeltaEvent::Delete(id) => {
                if !self.collection.contains(&id) {
                    return false;
                }
                Arc::make_mut(&mut self.collection).remove(&id);
                if self.selection.as_ref() == Some(&id) {
                    tracing::debug!(%id, "selected sensor deleted, clearing selection");
                    self.selection = None;
                }
                true
            }
        }
    }

    // ==========================================================================
    // listeners
    // ==========================================================================

    /// `listener` runs synchronously after every mutation with the new snapshot
    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&Snapshot) + Send + 'static,
    {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(l, _)| *l != id);
        self.listeners.len() != before
    }

    fn notify(&mut self) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(&self.collection);
        }
    }

    // ==========================================================================
    // selection
    // ==========================================================================

    pub fn set_selection(&mut self, id: Option<SensorId>) {
        self.selection = id;
    }

    pub fn selection(&self) -> Option<&SensorId> {
        self.selection.as_ref()
    }

    pub fn selected_record(&self) -> Option<&SensorRecord> {
        self.selection.as_ref().and_then(|id| self.collection.get(id))
    }

    /// teardown: outstanding loads become stale and listeners are dropped
    pub fn shutdown(&mut self) {
        self.generation += 1;
        self.in_flight = None;
        self.journal.clear();
        self.listeners.clear();
        if self.state == SyncState::Loading {
            self.state = SyncState::Uninitialized;
        }
    }
}
