use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use knn_engine::{
    CacheKey, GraphLoader, KnnError, NativeHandle, NativeMemoryBudget, NativeMemoryCache, Result,
};
use knn_native::{ArenaLibrary, NativeError, NativeLibrary};

const THREADS: usize = 8;

/// Loads a tiny allocation after a delay, counting invocations. Fails the
/// first `fail_first` calls.
struct SlowLoader {
    arena: Arc<ArenaLibrary>,
    size: u64,
    delay: Duration,
    fail_first: usize,
    calls: AtomicUsize,
}

impl SlowLoader {
    fn new(arena: &Arc<ArenaLibrary>, size: u64) -> Self {
        Self {
            arena: Arc::clone(arena),
            size,
            delay: Duration::from_millis(50),
            fail_first: 0,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl GraphLoader for SlowLoader {
    fn estimated_size(&self, _key: &CacheKey) -> Result<u64> {
        Ok(self.size)
    }

    fn load(&self, key: &CacheKey) -> Result<NativeHandle> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        if call < self.fail_first {
            return Err(KnnError::Io(format!("{key}: disk on fire")));
        }
        let library: Arc<dyn NativeLibrary> = self.arena.clone();
        let address = library.store_vector_data(None, &[vec![1.0, 2.0]])?;
        Ok(NativeHandle::new(library, address, self.size as usize))
    }
}

#[test]
fn concurrent_callers_share_one_load() {
    let arena = Arc::new(ArenaLibrary::new());
    let cache = NativeMemoryCache::new(NativeMemoryBudget::new(1_000));
    let loader = SlowLoader::new(&arena, 100);
    let key = CacheKey::new("idx", "s0");
    let barrier = Barrier::new(THREADS);

    let addresses: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    let pinned = cache.get_or_load(&key, &loader).unwrap();
                    pinned.address()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(loader.calls(), 1);
    assert!(addresses.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(arena.allocation_count(), 1);

    let stats = cache.stats();
    assert_eq!(stats.miss_count, 1);
    assert_eq!(stats.hit_count, (THREADS - 1) as u64);
    assert_eq!(stats.committed_bytes, 100);
}

#[test]
fn failed_load_reaches_every_waiter_and_does_not_poison() {
    let arena = Arc::new(ArenaLibrary::new());
    let cache = NativeMemoryCache::new(NativeMemoryBudget::new(1_000));
    let loader = SlowLoader {
        fail_first: 1,
        delay: Duration::from_millis(100),
        ..SlowLoader::new(&arena, 100)
    };
    let key = CacheKey::new("idx", "s0");
    let barrier = Barrier::new(THREADS);

    let results: Vec<Result<()>> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    cache.get_or_load(&key, &loader).map(drop)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    // Threads that arrived after the failed attempt finished start a new
    // load; everyone that waited on the first one sees its error.
    let failures: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert!(!failures.is_empty());
    assert!(failures
        .iter()
        .all(|e| **e == KnnError::Io("idx/s0: disk on fire".into())));
    assert_eq!(cache.stats().load_failure_count, 1);
    assert_eq!(cache.budget().committed(), if cache.contains(&key) { 100 } else { 0 });

    let pinned = cache.get_or_load(&key, &loader).unwrap();
    assert!(cache.contains(&key));
    assert_eq!(arena.allocation_count(), 1);
    drop(pinned);
}

#[test]
fn distinct_keys_load_in_parallel() {
    let arena = Arc::new(ArenaLibrary::new());
    let cache = NativeMemoryCache::new(NativeMemoryBudget::new(10_000));
    let loader = SlowLoader::new(&arena, 100);

    thread::scope(|s| {
        for i in 0..THREADS {
            let cache = &cache;
            let loader = &loader;
            s.spawn(move || {
                let key = CacheKey::new("idx", format!("s{i}"));
                drop(cache.get_or_load(&key, loader).unwrap());
            });
        }
    });

    assert_eq!(loader.calls(), THREADS);
    assert_eq!(cache.total_graph_count(), THREADS);
    assert_eq!(cache.stats().committed_bytes, (THREADS * 100) as u64);
}

#[test]
fn pinned_graph_survives_eviction_under_pressure() {
    let arena = Arc::new(ArenaLibrary::new());
    let cache = NativeMemoryCache::new(NativeMemoryBudget::new(250));
    let loader = SlowLoader {
        delay: Duration::ZERO,
        ..SlowLoader::new(&arena, 100)
    };

    let held = cache.get_or_load(&CacheKey::new("idx", "held"), &loader).unwrap();
    for i in 0..20 {
        drop(
            cache
                .get_or_load(&CacheKey::new("idx", format!("churn{i}")), &loader)
                .unwrap(),
        );
        assert!(cache.budget().committed() <= cache.budget().capacity());
    }

    assert!(cache.contains(held.key()));
    assert_eq!(cache.total_graph_count(), 2);
    assert_eq!(arena.allocation_count(), 2);
    assert_eq!(cache.stats().eviction_count, 19);
}

#[test]
fn eviction_during_query_defers_free() {
    let arena = Arc::new(ArenaLibrary::new());
    let cache = NativeMemoryCache::new(NativeMemoryBudget::new(100));
    let loader = SlowLoader {
        delay: Duration::ZERO,
        ..SlowLoader::new(&arena, 100)
    };
    let key = CacheKey::new("idx", "s0");

    let pinned = cache.get_or_load(&key, &loader).unwrap();
    let address = pinned.address();
    assert_eq!(cache.clear(&["idx"]), 1);

    // Still resident for the pin holder; the budget is still charged.
    assert_eq!(arena.allocation_count(), 1);
    assert_eq!(cache.budget().committed(), 100);
    assert!(matches!(
        cache.get_or_load(&CacheKey::new("idx", "other"), &loader),
        Err(KnnError::CapacityExceeded { .. })
    ));

    drop(pinned);
    assert_eq!(arena.allocation_count(), 0);
    assert!(arena.free(address).is_err());

    let reloaded = cache.get_or_load(&key, &loader).unwrap();
    assert_ne!(reloaded.address(), address);
}

/// Panics inside its first load, then loads normally.
struct PanicsOnce {
    inner: SlowLoader,
    panicked: AtomicBool,
}

impl GraphLoader for PanicsOnce {
    fn estimated_size(&self, key: &CacheKey) -> Result<u64> {
        self.inner.estimated_size(key)
    }

    fn load(&self, key: &CacheKey) -> Result<NativeHandle> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(50));
            panic!("native loader crashed on {key}");
        }
        self.inner.load(key)
    }
}

fn spawn_load(
    cache: &Arc<NativeMemoryCache>,
    loader: &Arc<PanicsOnce>,
    key: &CacheKey,
) -> crossbeam_channel::Receiver<Result<()>> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let (cache, loader, key) = (Arc::clone(cache), Arc::clone(loader), key.clone());
    thread::spawn(move || {
        let _ = tx.send(cache.get_or_load(&key, &*loader).map(drop));
    });
    rx
}

#[test]
fn panicking_loader_does_not_wedge_its_key() {
    let arena = Arc::new(ArenaLibrary::new());
    let cache = Arc::new(NativeMemoryCache::new(NativeMemoryBudget::new(1_000)));
    let loader = Arc::new(PanicsOnce {
        inner: SlowLoader {
            delay: Duration::ZERO,
            ..SlowLoader::new(&arena, 100)
        },
        panicked: AtomicBool::new(false),
    });
    let key = CacheKey::new("idx", "s0");

    let owner = {
        let (cache, loader, key) = (Arc::clone(&cache), Arc::clone(&loader), key.clone());
        thread::spawn(move || cache.get_or_load(&key, &*loader).map(drop))
    };
    thread::sleep(Duration::from_millis(10));
    // Usually attaches to the doomed load; a late arrival loads afresh.
    let waiter = spawn_load(&cache, &loader, &key);

    assert!(owner.join().is_err());
    let waited = waiter
        .recv_timeout(Duration::from_secs(5))
        .expect("waiter blocked on an abandoned load");
    if let Err(err) = waited {
        assert!(matches!(
            err,
            KnnError::NativeOperationFailure(NativeError::Panicked { .. })
        ));
    }

    let retried = spawn_load(&cache, &loader, &key)
        .recv_timeout(Duration::from_secs(5))
        .expect("retry blocked on an abandoned load");
    assert!(retried.is_ok());
    assert!(cache.contains(&key));
    assert_eq!(cache.stats().load_failure_count, 1);
    assert_eq!(cache.budget().committed(), 100);
    assert_eq!(arena.allocation_count(), 1);
}

#[test]
fn graphs_pinned_by_waiters_stay_resident() {
    let arena = Arc::new(ArenaLibrary::new());
    // Room for one graph: hot and cold keep evicting each other.
    let cache = NativeMemoryCache::new(NativeMemoryBudget::new(100));
    let hot_loader = SlowLoader {
        delay: Duration::from_millis(1),
        ..SlowLoader::new(&arena, 100)
    };
    let cold_loader = SlowLoader {
        delay: Duration::ZERO,
        ..SlowLoader::new(&arena, 100)
    };
    let hot = CacheKey::new("idx", "hot");
    let cold = CacheKey::new("idx", "cold");
    let stop = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            while !stop.load(Ordering::SeqCst) {
                let _ = cache.get_or_load(&cold, &cold_loader);
            }
        });
        let readers: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    for _ in 0..100 {
                        if let Ok(pinned) = cache.get_or_load(&hot, &hot_loader) {
                            assert!(cache.contains(pinned.key()), "pinned graph was evicted");
                        }
                    }
                })
            })
            .collect();
        for reader in readers {
            reader.join().unwrap();
        }
        stop.store(true, Ordering::SeqCst);
    });

    assert!(cache.budget().committed() <= cache.budget().capacity());
}
