//! Optimistic in-memory transactional store.

use super::{Transaction, TransactionalStore};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Slot = (String, String);

#[derive(Default)]
struct State {
    /// Committed values.
    data: BTreeMap<Slot, Vec<u8>>,
    /// Version of every key ever written, kept after deletes.
    versions: HashMap<Slot, u64>,
    /// Monotonic commit clock.
    clock: u64,
}

impl State {
    fn version(&self, slot: &Slot) -> u64 {
        self.versions.get(slot).copied().unwrap_or(0)
    }
}

struct Shared {
    state: RwLock<State>,
    /// Commits left to fail with an injected transient error.
    injected_failures: Mutex<u32>,
    commits: AtomicU64,
    conflicts: AtomicU64,
}

/// In-memory store with per-key optimistic concurrency control.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(State::default()),
                injected_failures: Mutex::new(0),
                commits: AtomicU64::new(0),
                conflicts: AtomicU64::new(0),
            }),
        }
    }

    /// Start a transaction without boxing it.
    pub fn transaction(&self) -> MemoryTransaction {
        MemoryTransaction {
            shared: Arc::clone(&self.shared),
            reads: HashMap::new(),
            scans: Vec::new(),
            writes: BTreeMap::new(),
        }
    }

    /// Fail the next `count` commits with a transient error.
    pub fn fail_next_commits(&self, count: u32) {
        *self.shared.injected_failures.lock() = count;
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> u64 {
        self.shared.commits.load(Ordering::SeqCst)
    }

    /// Number of commits rejected for conflicts.
    pub fn conflict_count(&self) -> u64 {
        self.shared.conflicts.load(Ordering::SeqCst)
    }

    /// Copy of every committed entry, in key order.
    pub(crate) fn snapshot(&self) -> Vec<(String, String, Vec<u8>)> {
        self.shared
            .state
            .read()
            .data
            .iter()
            .map(|((c, k), v)| (c.clone(), k.clone(), v.clone()))
            .collect()
    }

    /// Replace all contents, e.g. after loading a snapshot from disk.
    pub(crate) fn restore(&self, entries: Vec<(String, String, Vec<u8>)>) {
        let mut state = self.shared.state.write();
        state.data.clear();
        state.versions.clear();
        state.clock += 1;
        let version = state.clock;
        for (collection, key, value) in entries {
            let slot = (collection, key);
            state.versions.insert(slot.clone(), version);
            state.data.insert(slot, value);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(self.transaction()))
    }
}

/// Transaction over a [`MemoryStore`].
///
/// Reads see committed data plus this transaction's own writes. Writes are
/// buffered until commit.
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    /// Version observed for every key read.
    reads: HashMap<Slot, u64>,
    /// Prefix scans with the committed keys they saw.
    scans: Vec<PrefixScan>,
    /// Buffered writes; `None` is a delete.
    writes: BTreeMap<Slot, Option<Vec<u8>>>,
}

struct PrefixScan {
    collection: String,
    prefix: String,
    seen: BTreeSet<String>,
}

impl PrefixScan {
    /// First committed key under the prefix that the scan did not see.
    fn phantom<'a>(&self, state: &'a State) -> Option<&'a str> {
        let start = (self.collection.clone(), self.prefix.clone());
        state
            .data
            .range(start..)
            .map(|((c, k), _)| (c, k))
            .take_while(|(c, k)| *c == &self.collection && k.starts_with(&self.prefix))
            .find(|(_, k)| !self.seen.contains(k.as_str()))
            .map(|(_, k)| k.as_str())
    }
}

impl MemoryTransaction {
    fn slot(collection: &str, key: &str) -> Slot {
        (collection.to_string(), key.to_string())
    }

    fn read_slot(&mut self, slot: &Slot) -> Option<Vec<u8>> {
        if let Some(pending) = self.writes.get(slot) {
            return pending.clone();
        }
        let state = self.shared.state.read();
        self.reads.entry(slot.clone()).or_insert_with(|| state.version(slot));
        state.data.get(slot).cloned()
    }

    fn commit_inner(self) -> Result<()> {
        {
            let mut failures = self.shared.injected_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(CoreError::Transient("injected commit failure".into()));
            }
        }

        let mut state = self.shared.state.write();

        for (slot, seen) in &self.reads {
            if state.version(slot) != *seen {
                self.shared.conflicts.fetch_add(1, Ordering::SeqCst);
                return Err(CoreError::Transient(format!(
                    "write conflict on {}/{}",
                    slot.0, slot.1
                )));
            }
        }

        // Keys inserted under a scanned prefix since the scan.
        for scan in &self.scans {
            if let Some(key) = scan.phantom(&state) {
                self.shared.conflicts.fetch_add(1, Ordering::SeqCst);
                return Err(CoreError::Transient(format!(
                    "write conflict on {}/{}: inserted under scanned prefix",
                    scan.collection, key
                )));
            }
        }

        if !self.writes.is_empty() {
            state.clock += 1;
            let version = state.clock;
            for (slot, value) in self.writes {
                state.versions.insert(slot.clone(), version);
                match value {
                    Some(bytes) => {
                        state.data.insert(slot, bytes);
                    }
                    None => {
                        state.data.remove(&slot);
                    }
                }
            }
        }

        self.shared.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&mut self, collection: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let slot = Self::slot(collection, key);
        Ok(self.read_slot(&slot))
    }

    async fn put(&mut self, collection: &str, key: &str, value: Vec<u8>) -> Result<()> {
        self.writes.insert(Self::slot(collection, key), Some(value));
        Ok(())
    }

    async fn delete(&mut self, collection: &str, key: &str) -> Result<bool> {
        let slot = Self::slot(collection, key);
        let existed = self.read_slot(&slot).is_some();
        self.writes.insert(slot, None);
        Ok(existed)
    }

    async fn scan_prefix(
        &mut self,
        collection: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let mut merged: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        let mut seen = BTreeSet::new();
        {
            let state = self.shared.state.read();
            let start = Self::slot(collection, prefix);
            for ((c, k), v) in state.data.range(start..) {
                if c != collection || !k.starts_with(prefix) {
                    break;
                }
                let slot = (c.clone(), k.clone());
                self.reads.entry(slot.clone()).or_insert_with(|| state.version(&slot));
                seen.insert(k.clone());
                merged.insert(k.clone(), v.clone());
            }
        }
        self.scans.push(PrefixScan {
            collection: collection.to_string(),
            prefix: prefix.to_string(),
            seen,
        });

        for ((c, k), pending) in &self.writes {
            if c != collection || !k.starts_with(prefix) {
                continue;
            }
            match pending {
                Some(v) => {
                    merged.insert(k.clone(), v.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }

        Ok(merged.into_iter().collect())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        (*self).commit_inner()
    }
}
