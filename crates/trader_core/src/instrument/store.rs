//! Persistence contract for instrument records.
//!
//! One record per symbol, rewritten wholesale on every commit. The durable
//! implementation lives in `trader_infra::store`; [`MemoryStore`] backs
//! unit tests and dry runs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::PersistenceError;

use super::state::InstrumentState;

/// Load/persist capability for instrument records.
pub trait InstrumentStore: Send + Sync {
    /// Load the record for `symbol`; `Ok(None)` when none exists yet.
    fn load(&self, symbol: &str) -> Result<Option<InstrumentState>, PersistenceError>;

    /// Replace the record for `state.symbol`. Must be durable on `Ok`.
    fn persist(&self, state: &InstrumentState) -> Result<(), PersistenceError>;
}

/// In-memory store with a switchable write failure.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, InstrumentState>>,
    writes: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `persist` fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Snapshot of the stored record, bypassing the trait.
    pub fn get(&self, symbol: &str) -> Option<InstrumentState> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(symbol)
            .cloned()
    }
}

impl InstrumentStore for MemoryStore {
    fn load(&self, symbol: &str) -> Result<Option<InstrumentState>, PersistenceError> {
        Ok(self.get(symbol))
    }

    fn persist(&self, state: &InstrumentState) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::new(&state.symbol, "injected write failure"));
        }
        self.records
            .lock()
            .map_err(|_| PersistenceError::new(&state.symbol, "store lock poisoned"))?
            .insert(state.symbol.clone(), state.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
