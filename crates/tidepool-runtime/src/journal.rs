//! Checkpoint journal boundary
//!
//! TigerStyle: Narrow synchronous interface, in-memory implementation for
//! tests.
//!
//! The runtime does not define a storage format. An actor writes whatever
//! bytes it wants from `on_save` and reads them back in `on_replay`; the
//! journal only keys them by service address. A save reply completes when
//! `write_checkpoint` returned, which says nothing about durability.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tidepool_core::error::{Error, Result};
use tracing::instrument;

/// Checkpoint storage for a group of services
pub trait Journal: Send + Sync + fmt::Debug {
    /// Journal name
    fn name(&self) -> &str;

    /// Store the latest checkpoint for `address`
    fn write_checkpoint(&self, address: &str, data: Bytes) -> Result<()>;

    /// Read the latest checkpoint for `address`
    fn read_checkpoint(&self, address: &str) -> Result<Option<Bytes>>;
}

/// Opens journals by name
pub trait JournalProvider: Send + Sync + fmt::Debug {
    /// Open (or create) the journal called `name`
    fn open_journal(&self, name: &str) -> Result<Arc<dyn Journal>>;
}

// =============================================================================
// Memory
// =============================================================================

/// In-memory journal keeping the latest checkpoint per address
///
/// Replay only reads the latest checkpoint, so older ones are dropped on
/// write. [`MemoryJournal::with_history`] keeps every write instead, for
/// tests that inspect the sequence.
#[derive(Debug)]
pub struct MemoryJournal {
    name: String,
    latest: RwLock<HashMap<String, Bytes>>,
    /// Every write per address, oldest first; `None` unless requested
    history: Option<RwLock<HashMap<String, Vec<Bytes>>>>,
    writes: AtomicUsize,
}

impl MemoryJournal {
    /// Create an empty journal
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            latest: RwLock::new(HashMap::new()),
            history: None,
            writes: AtomicUsize::new(0),
        }
    }

    /// Create an empty journal that records every checkpoint written
    pub fn with_history(name: impl Into<String>) -> Self {
        Self {
            history: Some(RwLock::new(HashMap::new())),
            ..Self::new(name)
        }
    }

    /// Every checkpoint written for `address`, oldest first
    ///
    /// Empty unless the journal was built with [`MemoryJournal::with_history`].
    pub fn history(&self, address: &str) -> Vec<Bytes> {
        self.history
            .as_ref()
            .and_then(|history| history.read().get(address).cloned())
            .unwrap_or_default()
    }

    /// Total checkpoints written across all addresses
    pub fn checkpoint_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Addresses holding a checkpoint
    pub fn address_count(&self) -> usize {
        self.latest.read().len()
    }
}

impl Journal for MemoryJournal {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, data), fields(journal = %self.name, data_len = data.len()), level = "debug")]
    fn write_checkpoint(&self, address: &str, data: Bytes) -> Result<()> {
        if let Some(history) = &self.history {
            history
                .write()
                .entry(address.to_string())
                .or_default()
                .push(data.clone());
        }
        self.latest.write().insert(address.to_string(), data);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_checkpoint(&self, address: &str) -> Result<Option<Bytes>> {
        Ok(self.latest.read().get(address).cloned())
    }
}

/// Provider handing out one shared [`MemoryJournal`] per name
#[derive(Debug, Default)]
pub struct MemoryJournalProvider {
    journals: RwLock<HashMap<String, Arc<MemoryJournal>>>,
}

impl MemoryJournalProvider {
    /// Create a provider with no journals
    pub fn new() -> Self {
        Self::default()
    }

    /// The concrete journal called `name`, created on first use
    pub fn journal(&self, name: &str) -> Arc<MemoryJournal> {
        if let Some(journal) = self.journals.read().get(name) {
            return journal.clone();
        }
        self.journals
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryJournal::new(name)))
            .clone()
    }
}

impl JournalProvider for MemoryJournalProvider {
    fn open_journal(&self, name: &str) -> Result<Arc<dyn Journal>> {
        Ok(self.journal(name))
    }
}

// =============================================================================
// Noop
// =============================================================================

/// Journal that stores nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopJournal;

impl Journal for NoopJournal {
    fn name(&self) -> &str {
        "noop"
    }

    fn write_checkpoint(&self, _address: &str, _data: Bytes) -> Result<()> {
        Ok(())
    }

    fn read_checkpoint(&self, _address: &str) -> Result<Option<Bytes>> {
        Ok(None)
    }
}

// =============================================================================
// JSON helpers
// =============================================================================

/// Serialize `value` as JSON and write it as the checkpoint for `address`
pub fn write_json<T: Serialize>(journal: &dyn Journal, address: &str, value: &T) -> Result<()> {
    let data = serde_json::to_vec(value).map_err(|e| Error::SerializationFailed {
        reason: e.to_string(),
    })?;
    journal.write_checkpoint(address, Bytes::from(data))
}

/// Read and deserialize the JSON checkpoint for `address`
pub fn read_json<T: DeserializeOwned>(journal: &dyn Journal, address: &str) -> Result<Option<T>> {
    match journal.read_checkpoint(address)? {
        Some(data) => serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| Error::DeserializationFailed {
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}
