//! In-memory event store.
//!
//! Keeps event application records in RAM. Useful for tests and for running
//! the supervisor without a database; all data is lost when the process exits.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::watcher::EventStore;

/// Application state of one event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Pending,
    Committed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub chain_id: u64,
    pub block_number: u64,
    pub log_index: u64,
    pub state: EventState,
}

#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<StoredEvent>>,
    deletions: Mutex<HashMap<u64, usize>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event as pending application.
    pub fn insert_pending(&self, chain_id: u64, block_number: u64, log_index: u64) {
        self.events.lock().push(StoredEvent {
            chain_id,
            block_number,
            log_index,
            state: EventState::Pending,
        });
    }

    /// Move a pending event to `state`. Returns `false` if no such event exists.
    pub fn settle(&self, chain_id: u64, block_number: u64, log_index: u64, state: EventState) -> bool {
        let mut events = self.events.lock();
        match events.iter_mut().find(|e| {
            e.chain_id == chain_id && e.block_number == block_number && e.log_index == log_index
        }) {
            Some(event) => {
                event.state = state;
                true
            }
            None => false,
        }
    }

    /// All records for a chain, in insertion order.
    pub fn events_for(&self, chain_id: u64) -> Vec<StoredEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.chain_id == chain_id)
            .cloned()
            .collect()
    }

    /// How many times pending/failed events were purged for a chain.
    pub fn deletion_count(&self, chain_id: u64) -> usize {
        self.deletions.lock().get(&chain_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn delete_pending_and_failed_events(&self, chain_id: u64) -> Result<(), StoreError> {
        self.events
            .lock()
            .retain(|e| e.chain_id != chain_id || e.state == EventState::Committed);
        *self.deletions.lock().entry(chain_id).or_insert(0) += 1;
        Ok(())
    }
}
