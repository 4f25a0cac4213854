//! Native memory cache
//!
//! Maps a [`CacheKey`] to a loaded native graph. Guarantees:
//!
//! - **Single flight.** Concurrent `get_or_load` calls for one key share a
//!   single loader invocation; every waiter gets the same entry or the same
//!   error. A failed load leaves nothing behind, so the next call retries.
//! - **Bounded memory.** A load reserves its estimated size from the
//!   [`NativeMemoryBudget`] before running. When the budget is full, unpinned
//!   entries are evicted least recently used first; if that is not enough
//!   the load fails with `CapacityExceeded`.
//! - **Pin safety.** A [`PinnedGraph`] keeps its entry's native memory alive.
//!   Evicting a pinned entry removes it from the map at once (no new pins),
//!   and the memory is freed when the last pin drops.
//!
//! ```text
//!            get_or_load(key)
//!                  │
//!        ┌─────────┴──────────┐
//!     Ready(entry)       Loading(cell) ◀── other callers wait on the cell
//!      pin + hit              │
//!                     reserve ─▶ evict LRU unpinned ─▶ CapacityExceeded
//!                        │
//!                     loader.load ─▶ Ready(entry) + miss
//! ```
//!
//! Lock order is map lock, then entry lock. Native frees happen with neither
//! held.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use knn_core::DocBitSet;
use knn_native::{NativeAddress, NativeError, NativeLibrary};

use crate::budget::{NativeMemoryBudget, Reservation};
use crate::error::{KnnError, Result};
use crate::handle::NativeHandle;

/// Identity of one graph: the index it belongs to and its segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey {
    pub index: String,
    pub segment: String,
}

impl CacheKey {
    pub fn new(index: impl Into<String>, segment: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            segment: segment.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.segment)
    }
}

/// Loads the native graph for a key. Called from any thread.
pub trait GraphLoader: Send + Sync {
    /// Bytes to reserve before loading.
    fn estimated_size(&self, key: &CacheKey) -> Result<u64>;

    fn load(&self, key: &CacheKey) -> Result<NativeHandle>;
}

struct Resident {
    _handle: NativeHandle,
    _reservation: Reservation,
}

struct EntryState {
    pins: usize,
    evicted: bool,
    resident: Option<Resident>,
}

struct CacheEntry {
    key: CacheKey,
    address: NativeAddress,
    library: Arc<dyn NativeLibrary>,
    size_bytes: u64,
    last_access: AtomicU64,
    state: Mutex<EntryState>,
}

impl CacheEntry {
    fn try_pin(&self, tick: u64) -> bool {
        let mut state = self.state.lock();
        if state.evicted {
            return false;
        }
        state.pins += 1;
        self.last_access.store(tick, Ordering::Relaxed);
        true
    }

    fn unpin(&self) {
        let released = {
            let mut state = self.state.lock();
            state.pins -= 1;
            if state.pins == 0 && state.evicted {
                state.resident.take()
            } else {
                None
            }
        };
        if released.is_some() {
            debug!(key = %self.key, "freeing evicted graph after last unpin");
        }
    }

    /// Blocks new pins. Returns the resident memory if it can be freed now.
    fn mark_evicted(&self) -> Option<Resident> {
        let mut state = self.state.lock();
        state.evicted = true;
        if state.pins == 0 {
            state.resident.take()
        } else {
            None
        }
    }

    fn pins(&self) -> usize {
        self.state.lock().pins
    }
}

/// A graph held resident for the lifetime of this guard.
pub struct PinnedGraph {
    entry: Arc<CacheEntry>,
}

impl PinnedGraph {
    pub fn key(&self) -> &CacheKey {
        &self.entry.key
    }

    pub fn address(&self) -> NativeAddress {
        self.entry.address
    }

    pub fn size_bytes(&self) -> u64 {
        self.entry.size_bytes
    }

    /// Approximate search against this graph.
    pub fn query(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&DocBitSet>,
    ) -> Result<Vec<(u32, f32)>> {
        Ok(self
            .entry
            .library
            .query_index(self.entry.address, query, k, filter)?)
    }
}

impl Drop for PinnedGraph {
    fn drop(&mut self) {
        self.entry.unpin();
    }
}

impl fmt::Debug for PinnedGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedGraph")
            .field("key", &self.entry.key)
            .field("address", &self.entry.address)
            .finish()
    }
}

/// Hand-off point between the caller running a load and those waiting on it.
struct LoadCell {
    result: Mutex<Option<Result<Arc<CacheEntry>>>>,
    done: Condvar,
}

impl LoadCell {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<Arc<CacheEntry>> {
        let mut result = self.result.lock();
        loop {
            if let Some(r) = result.as_ref() {
                return r.clone();
            }
            self.done.wait(&mut result);
        }
    }

    fn finish(&self, r: Result<Arc<CacheEntry>>) {
        *self.result.lock() = Some(r);
        self.done.notify_all();
    }
}

enum Slot {
    Ready(Arc<CacheEntry>),
    Loading(Arc<LoadCell>),
}

/// Held by the caller running a load. If the loader unwinds, the guard
/// clears the `Loading` slot and fails the waiters so the key stays usable.
struct LoadGuard<'a> {
    cache: &'a NativeMemoryCache,
    key: &'a CacheKey,
    cell: Arc<LoadCell>,
    finished: bool,
}

impl LoadGuard<'_> {
    fn finish(mut self, loaded: Result<Arc<CacheEntry>>) {
        self.finished = true;
        self.cell.finish(loaded);
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        {
            let mut slots = self.cache.slots.lock();
            if matches!(slots.get(self.key), Some(Slot::Loading(cell)) if Arc::ptr_eq(cell, &self.cell))
            {
                slots.remove(self.key);
            }
        }
        self.cache
            .counters
            .load_failures
            .fetch_add(1, Ordering::Relaxed);
        warn!(key = %self.key, "graph loader panicked");
        self.cell
            .finish(Err(KnnError::NativeOperationFailure(NativeError::Panicked {
                operation: "graph load",
                message: format!("loader for {} panicked", self.key),
            })));
    }
}

enum Claim {
    Owner(Arc<LoadCell>),
    Waiter(Arc<LoadCell>),
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    load_failures: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub eviction_count: u64,
    pub load_failure_count: u64,
    pub graph_count: usize,
    pub committed_bytes: u64,
    pub capacity_bytes: u64,
    pub graphs_per_index: BTreeMap<String, usize>,
}

pub struct NativeMemoryCache {
    budget: Arc<NativeMemoryBudget>,
    slots: Mutex<HashMap<CacheKey, Slot>>,
    clock: AtomicU64,
    counters: Counters,
}

impl NativeMemoryCache {
    pub fn new(budget: Arc<NativeMemoryBudget>) -> Self {
        Self {
            budget,
            slots: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub fn budget(&self) -> &Arc<NativeMemoryBudget> {
        &self.budget
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the graph for `key`, loading it with `loader` on a miss.
    ///
    /// Blocks while another caller loads the same key.
    pub fn get_or_load(&self, key: &CacheKey, loader: &dyn GraphLoader) -> Result<PinnedGraph> {
        loop {
            let claim = {
                let mut slots = self.slots.lock();
                match slots.get(key) {
                    Some(Slot::Ready(entry)) => {
                        if entry.try_pin(self.tick()) {
                            self.counters.hits.fetch_add(1, Ordering::Relaxed);
                            return Ok(PinnedGraph {
                                entry: Arc::clone(entry),
                            });
                        }
                        slots.remove(key);
                        continue;
                    }
                    Some(Slot::Loading(cell)) => Claim::Waiter(Arc::clone(cell)),
                    None => {
                        let cell = Arc::new(LoadCell::new());
                        slots.insert(key.clone(), Slot::Loading(Arc::clone(&cell)));
                        Claim::Owner(cell)
                    }
                }
            };

            match claim {
                Claim::Waiter(cell) => {
                    let entry = cell.wait()?;
                    // Pin under the map lock so eviction never picks it mid-pin.
                    let _slots = self.slots.lock();
                    if entry.try_pin(self.tick()) {
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(PinnedGraph { entry });
                    }
                    // Evicted between load and pin; start over.
                }
                Claim::Owner(cell) => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    let guard = LoadGuard {
                        cache: self,
                        key,
                        cell,
                        finished: false,
                    };
                    let loaded = self.load_entry(key, loader);

                    let pinned = {
                        let mut slots = self.slots.lock();
                        match &loaded {
                            Ok(entry) => {
                                entry.try_pin(self.tick());
                                slots.insert(key.clone(), Slot::Ready(Arc::clone(entry)));
                            }
                            Err(_) => {
                                slots.remove(key);
                            }
                        }
                        loaded.clone().map(|entry| PinnedGraph { entry })
                    };
                    guard.finish(loaded);
                    return pinned;
                }
            }
        }
    }

    fn load_entry(&self, key: &CacheKey, loader: &dyn GraphLoader) -> Result<Arc<CacheEntry>> {
        let attempt = || -> Result<Arc<CacheEntry>> {
            let estimate = loader.estimated_size(key)?;
            let reservation = self.reserve_with_eviction(estimate)?;
            let handle = loader.load(key)?;
            Ok(Arc::new(CacheEntry {
                key: key.clone(),
                address: handle.address(),
                library: Arc::clone(handle.library()),
                size_bytes: reservation.bytes(),
                last_access: AtomicU64::new(self.tick()),
                state: Mutex::new(EntryState {
                    pins: 0,
                    evicted: false,
                    resident: Some(Resident {
                        _handle: handle,
                        _reservation: reservation,
                    }),
                }),
            }))
        };

        match attempt() {
            Ok(entry) => {
                info!(key = %key, bytes = entry.size_bytes, "loaded graph");
                Ok(entry)
            }
            Err(err) => {
                self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, "graph load failed: {err}");
                Err(err)
            }
        }
    }

    /// Reserves `bytes`, evicting unpinned entries oldest first until it fits.
    fn reserve_with_eviction(&self, bytes: u64) -> Result<Reservation> {
        loop {
            let err = match self.budget.try_reserve(bytes) {
                Ok(reservation) => return Ok(reservation),
                Err(err) => err,
            };
            if bytes > self.budget.capacity() {
                return Err(err);
            }

            let freed = {
                let mut slots = self.slots.lock();
                let victim = slots
                    .iter()
                    .filter_map(|(key, slot)| match slot {
                        Slot::Ready(entry) if entry.pins() == 0 => Some((key, entry)),
                        _ => None,
                    })
                    .min_by_key(|(_, entry)| entry.last_access.load(Ordering::Relaxed))
                    .map(|(key, _)| key.clone());
                let Some(victim) = victim else {
                    return Err(err);
                };
                self.remove_locked(&mut slots, &victim)
            };
            drop(freed);
        }
    }

    /// Removes a ready entry from the map and marks it evicted.
    fn remove_locked(
        &self,
        slots: &mut HashMap<CacheKey, Slot>,
        key: &CacheKey,
    ) -> Option<Resident> {
        if !matches!(slots.get(key), Some(Slot::Ready(_))) {
            return None;
        }
        let Some(Slot::Ready(entry)) = slots.remove(key) else {
            return None;
        };
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        let resident = entry.mark_evicted();
        debug!(
            key = %key,
            deferred = resident.is_none(),
            "evicted graph"
        );
        resident
    }

    /// Evicts `key` if resident. Its memory is freed once no query pins it.
    pub fn evict(&self, key: &CacheKey) -> bool {
        let mut slots = self.slots.lock();
        let was_ready = matches!(slots.get(key), Some(Slot::Ready(_)));
        let freed = self.remove_locked(&mut slots, key);
        drop(slots);
        drop(freed);
        was_ready
    }

    /// Evicts every resident graph of the given indices. Returns how many.
    pub fn clear<S: AsRef<str>>(&self, indices: &[S]) -> usize {
        let wanted: HashSet<&str> = indices.iter().map(AsRef::as_ref).collect();
        let mut freed = Vec::new();
        {
            let mut slots = self.slots.lock();
            let keys: Vec<CacheKey> = slots
                .iter()
                .filter(|(key, slot)| {
                    matches!(slot, Slot::Ready(_)) && wanted.contains(key.index.as_str())
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                freed.push(self.remove_locked(&mut slots, key));
            }
        }
        let count = freed.len();
        drop(freed);
        count
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        matches!(self.slots.lock().get(key), Some(Slot::Ready(_)))
    }

    /// Number of resident graphs.
    pub fn total_graph_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn stats(&self) -> CacheStats {
        let mut graphs_per_index = BTreeMap::new();
        let mut graph_count = 0;
        for (key, slot) in self.slots.lock().iter() {
            if let Slot::Ready(_) = slot {
                graph_count += 1;
                *graphs_per_index.entry(key.index.clone()).or_insert(0) += 1;
            }
        }
        CacheStats {
            hit_count: self.counters.hits.load(Ordering::Relaxed),
            miss_count: self.counters.misses.load(Ordering::Relaxed),
            eviction_count: self.counters.evictions.load(Ordering::Relaxed),
            load_failure_count: self.counters.load_failures.load(Ordering::Relaxed),
            graph_count,
            committed_bytes: self.budget.committed(),
            capacity_bytes: self.budget.capacity(),
            graphs_per_index,
        }
    }
}
