//  Copyright 2025 Gencache Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::{
    mem,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::Ordering,
        Arc, Weak,
    },
    thread,
    time::{Duration, Instant},
};

use ahash::RandomState;
use gencache_common::{
    code::{HashBuilder, Key, Value},
    event::{DefaultEventListener, EventListener},
};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use crate::{
    error::{Error, Result},
    metrics::Metrics,
};

/// Configuration for a [`GenerationalStore`].
///
/// At least one of `gen0_limit` and `time_to_live` must be set.
pub struct StoreConfig<L, S = RandomState> {
    /// Upper bound on Gen0 entries. Reaching it triggers a collection before
    /// the next insert, so the total cache size stays below twice the limit.
    pub gen0_limit: Option<usize>,
    /// Enables a periodic collector waking every `time_to_live / 2`. An entry
    /// untouched for one full wake interval is demoted to Gen1; untouched a
    /// second interval, dropped.
    pub time_to_live: Option<Duration>,
    pub hash_builder: S,
    pub event_listener: L,
}

/// Coarse fill state of a store, derived from its generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillState {
    /// Both generations empty.
    Empty,
    /// Exactly one generation holds entries.
    Warming,
    /// Both generations hold entries.
    Full,
}

struct StoreInner<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    gen0: HashMap<K, Option<V>, S>,
    gen1: HashMap<K, Option<V>, S>,

    /// Bumped on every mutation. Lets a read-through load detect writes that
    /// raced its released lock.
    version: u64,
    last_collection: Instant,
}

struct Shared<K, V, L, S>
where
    K: Key,
    V: Value,
    L: EventListener<Key = K, Value = V, HashBuilder = S>,
    S: HashBuilder,
{
    inner: Mutex<StoreInner<K, V, S>>,

    gen0_limit: Option<usize>,
    time_to_live: Option<Duration>,
    hash_builder: S,

    listener: L,
    metrics: Arc<Metrics>,
}

impl<K, V, L, S> Shared<K, V, L, S>
where
    K: Key,
    V: Value,
    L: EventListener<Key = K, Value = V, HashBuilder = S>,
    S: HashBuilder,
{
    /// Swap generations under the lock. The caller delivers the returned
    /// dropped mapping after releasing the lock.
    fn collect_locked(&self, inner: &mut StoreInner<K, V, S>) -> Option<HashMap<K, Option<V>, S>> {
        if inner.gen0.is_empty() && inner.gen1.is_empty() {
            return None;
        }
        let fresh = HashMap::with_hasher(self.hash_builder.clone());
        let outgoing = mem::replace(&mut inner.gen1, mem::replace(&mut inner.gen0, fresh));
        inner.version += 1;
        inner.last_collection = Instant::now();
        self.metrics.collect.fetch_add(1, Ordering::Relaxed);
        (!outgoing.is_empty()).then_some(outgoing)
    }

    /// Size trigger preceding every Gen0 insert.
    fn collect_for_insert(&self, inner: &mut StoreInner<K, V, S>) -> Option<HashMap<K, Option<V>, S>> {
        match self.gen0_limit {
            Some(limit) if inner.gen0.len() >= limit => self.collect_locked(inner),
            _ => None,
        }
    }

    /// Probe both generations, promoting on a Gen1 hit. The promoted key is
    /// pulled out of Gen1 before the size trigger runs, so a collection it
    /// triggers can never drop it.
    #[allow(clippy::type_complexity)]
    fn lookup_locked(
        &self,
        inner: &mut StoreInner<K, V, S>,
        key: &K,
    ) -> (Option<Option<V>>, Option<HashMap<K, Option<V>, S>>) {
        if let Some(value) = inner.gen0.get(key) {
            return (Some(value.clone()), None);
        }
        match inner.gen1.remove(key) {
            Some(value) => {
                let evicted = self.collect_for_insert(inner);
                inner.gen0.insert(key.clone(), value.clone());
                inner.version += 1;
                (Some(value), evicted)
            }
            None => (None, None),
        }
    }

    fn notify_invalidated(&self, key: K) {
        if catch_unwind(AssertUnwindSafe(|| self.listener.on_invalidated(key))).is_err() {
            tracing::warn!("invalidation listener panicked, event dropped");
        }
    }

    fn notify_evicted(&self, entries: HashMap<K, Option<V>, S>) {
        tracing::trace!(dropped = entries.len(), "entries dropped from cache");
        if catch_unwind(AssertUnwindSafe(|| self.listener.on_evicted(entries))).is_err() {
            tracing::warn!("eviction listener panicked, event dropped");
        }
    }
}

/// Result of probing the store on behalf of a read-through load.
pub(crate) struct Probe<V> {
    /// `Some(..)` for an entry in either generation (present or cached
    /// absence), `None` for a key the cache does not know.
    pub(crate) cached: Option<Option<V>>,
    /// Version snapshot taken while the lock was held.
    pub(crate) version: u64,
}

/// Result of probing the store for a whole batch under one lock acquisition.
pub(crate) struct BatchProbe<K, V> {
    /// Aligned to the input keys; `None` marks a cache miss.
    pub(crate) results: Vec<Option<Option<V>>>,
    /// Missed keys with their input indices.
    pub(crate) missed: Vec<(usize, K)>,
    pub(crate) version: u64,
}

/// The two-generation storage primitive.
///
/// Entries are inserted into Gen0. When Gen0 reaches its configured limit (or
/// the periodic collector fires), the old Gen1 is discarded wholesale and
/// Gen0 becomes the new Gen1 by a map swap; no per-entry bookkeeping is kept.
/// A Gen1 hit promotes the entry back into Gen0.
///
/// The store is not read-through by itself; see
/// [`ReadThroughGenerational`](crate::read_through::ReadThroughGenerational).
pub struct GenerationalStore<K, V, L = DefaultEventListener<K, V>, S = RandomState>
where
    K: Key,
    V: Value,
    L: EventListener<Key = K, Value = V, HashBuilder = S>,
    S: HashBuilder,
{
    shared: Arc<Shared<K, V, L, S>>,
    _collector: Option<CollectorHandle>,
}

impl<K, V, L, S> GenerationalStore<K, V, L, S>
where
    K: Key,
    V: Value,
    L: EventListener<Key = K, Value = V, HashBuilder = S>,
    S: HashBuilder,
{
    pub fn new(config: StoreConfig<L, S>) -> Result<Self> {
        if config.gen0_limit.is_none() && config.time_to_live.is_none() {
            return Err(Error::config(
                "at least one of gen0_limit and time_to_live must be set",
            ));
        }
        if let Some(limit) = config.gen0_limit {
            if limit == 0 {
                return Err(Error::config("gen0_limit must be at least 1"));
            }
        }
        if let Some(ttl) = config.time_to_live {
            if ttl.is_zero() {
                return Err(Error::config("time_to_live must be positive"));
            }
        }

        let shared = Arc::new(Shared {
            inner: Mutex::new(StoreInner {
                gen0: HashMap::with_hasher(config.hash_builder.clone()),
                gen1: HashMap::with_hasher(config.hash_builder.clone()),
                version: 0,
                last_collection: Instant::now(),
            }),
            gen0_limit: config.gen0_limit,
            time_to_live: config.time_to_live,
            hash_builder: config.hash_builder,
            listener: config.event_listener,
            metrics: Arc::new(Metrics::default()),
        });

        let collector = shared
            .time_to_live
            .map(|ttl| spawn_collector(Arc::downgrade(&shared), ttl / 2));

        Ok(Self {
            shared,
            _collector: collector,
        })
    }

    /// Look up a key in either generation.
    ///
    /// Returns `None` when the cache does not know the key, `Some(None)` for
    /// a cached absence, `Some(Some(..))` for a cached value. A Gen1 hit
    /// promotes the entry into Gen0.
    pub fn get(&self, key: &K) -> Option<Option<V>> {
        self.probe(key).cached
    }

    /// Upsert a value into Gen0, removing any Gen1 occurrence first.
    pub fn set(&self, key: K, value: V) {
        self.insert(key, Some(value));
    }

    /// Upsert an entry into Gen0. Cached absence is stored like any value.
    pub(crate) fn insert(&self, key: K, value: Option<V>) {
        let shared = &self.shared;
        let evicted = {
            let mut inner = shared.inner.lock();
            inner.gen1.remove(&key);
            let evicted = shared.collect_for_insert(&mut inner);
            inner.gen0.insert(key, value);
            inner.version += 1;
            shared.metrics.insert.fetch_add(1, Ordering::Relaxed);
            evicted
        };
        if let Some(evicted) = evicted {
            shared.notify_evicted(evicted);
        }
    }

    /// Remove a key from either generation.
    ///
    /// Emits `Invalidated` exactly once iff an entry was removed; removing an
    /// unknown key is a no-op without events.
    pub fn invalidate(&self, key: &K) -> bool {
        let shared = &self.shared;
        let removed = {
            let mut inner = shared.inner.lock();
            let removed = inner.gen0.remove(key).is_some() || inner.gen1.remove(key).is_some();
            if removed {
                inner.version += 1;
                shared.metrics.invalidate.fetch_add(1, Ordering::Relaxed);
            }
            removed
        };
        if removed {
            shared.notify_invalidated(key.clone());
        }
        removed
    }

    /// Remove several keys under a single lock acquisition.
    ///
    /// Returns the number of entries removed; one `Invalidated` event fires
    /// per actually-removed key.
    pub fn invalidate_many(&self, keys: &[K]) -> usize {
        let shared = &self.shared;
        let removed = {
            let mut inner = shared.inner.lock();
            let mut removed = Vec::new();
            for key in keys {
                if inner.gen0.remove(key).is_some() || inner.gen1.remove(key).is_some() {
                    removed.push(key.clone());
                }
            }
            if !removed.is_empty() {
                inner.version += 1;
                shared
                    .metrics
                    .invalidate
                    .fetch_add(removed.len() as u64, Ordering::Relaxed);
            }
            removed
        };
        let count = removed.len();
        for key in removed {
            shared.notify_invalidated(key);
        }
        count
    }

    /// Drop everything, emitting a single `Evicted` event with the union of
    /// both generations. No `Invalidated` events fire.
    pub fn clear(&self) {
        let shared = &self.shared;
        let dropped = {
            let mut inner = shared.inner.lock();
            if inner.gen0.is_empty() && inner.gen1.is_empty() {
                return;
            }
            let mut dropped = mem::replace(
                &mut inner.gen1,
                HashMap::with_hasher(shared.hash_builder.clone()),
            );
            let gen0 = mem::replace(
                &mut inner.gen0,
                HashMap::with_hasher(shared.hash_builder.clone()),
            );
            dropped.extend(gen0);
            inner.version += 1;
            dropped
        };
        shared.notify_evicted(dropped);
    }

    /// Run a collection unconditionally.
    pub fn force_collect(&self) {
        let shared = &self.shared;
        let evicted = {
            let mut inner = shared.inner.lock();
            shared.collect_locked(&mut inner)
        };
        if let Some(evicted) = evicted {
            shared.notify_evicted(evicted);
        }
    }

    /// Current entry count across both generations.
    pub fn len(&self) -> usize {
        let inner = self.shared.inner.lock();
        inner.gen0.len() + inner.gen1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry counts of (Gen0, Gen1).
    pub fn generation_sizes(&self) -> (usize, usize) {
        let inner = self.shared.inner.lock();
        (inner.gen0.len(), inner.gen1.len())
    }

    pub fn fill_state(&self) -> FillState {
        match self.generation_sizes() {
            (0, 0) => FillState::Empty,
            (_, 0) | (0, _) => FillState::Warming,
            _ => FillState::Full,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    pub(crate) fn metrics_handle(&self) -> Arc<Metrics> {
        self.shared.metrics.clone()
    }

    /// Probe on behalf of a read-through load, snapshotting the version for
    /// the later [`reconcile_insert`](Self::reconcile_insert).
    pub(crate) fn probe(&self, key: &K) -> Probe<V> {
        let shared = &self.shared;
        let (cached, version, evicted) = {
            let mut inner = shared.inner.lock();
            let (cached, evicted) = shared.lookup_locked(&mut inner, key);
            match cached {
                Some(_) => shared.metrics.hit.fetch_add(1, Ordering::Relaxed),
                None => shared.metrics.miss.fetch_add(1, Ordering::Relaxed),
            };
            (cached, inner.version, evicted)
        };
        if let Some(evicted) = evicted {
            shared.notify_evicted(evicted);
        }
        Probe { cached, version }
    }

    /// Store a loaded result, unless another getter raced the released lock
    /// and already cached the key; the racing entry wins and is returned.
    pub(crate) fn reconcile_insert(&self, key: K, loaded: Option<V>, snapshot: u64) -> Option<V> {
        let shared = &self.shared;
        let (value, evicted) = {
            let mut inner = shared.inner.lock();
            let (adopted, mut evicted) = if inner.version == snapshot {
                (None, None)
            } else {
                shared.lookup_locked(&mut inner, &key)
            };
            let value = match adopted {
                Some(value) => value,
                None => {
                    debug_assert!(evicted.is_none());
                    evicted = shared.collect_for_insert(&mut inner);
                    inner.gen0.insert(key, loaded.clone());
                    inner.version += 1;
                    shared.metrics.insert.fetch_add(1, Ordering::Relaxed);
                    loaded
                }
            };
            (value, evicted)
        };
        if let Some(evicted) = evicted {
            shared.notify_evicted(evicted);
        }
        value
    }

    /// Probe a whole batch under one lock acquisition.
    pub(crate) fn probe_batch(&self, keys: &[K]) -> BatchProbe<K, V> {
        let shared = &self.shared;
        let mut evictions = Vec::new();
        let (results, missed, version) = {
            let mut inner = shared.inner.lock();
            let mut results = Vec::with_capacity(keys.len());
            let mut missed = Vec::new();
            for (index, key) in keys.iter().enumerate() {
                let (cached, evicted) = shared.lookup_locked(&mut inner, key);
                if let Some(evicted) = evicted {
                    evictions.push(evicted);
                }
                match cached {
                    Some(_) => {
                        shared.metrics.hit.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {
                        shared.metrics.miss.fetch_add(1, Ordering::Relaxed);
                        missed.push((index, key.clone()));
                    }
                };
                results.push(cached);
            }
            (results, missed, inner.version)
        };
        for evicted in evictions {
            shared.notify_evicted(evicted);
        }
        BatchProbe {
            results,
            missed,
            version,
        }
    }

    /// Phase 3 of a batch read-through: adopt racing inserts or store loaded
    /// values. Only present values are inserted; absent loads are returned
    /// as-is without creating negative entries.
    pub(crate) fn reconcile_batch(
        &self,
        loaded: Vec<(usize, K, Option<V>)>,
        snapshot: u64,
    ) -> Vec<(usize, Option<V>)> {
        let shared = &self.shared;
        let mut evictions = Vec::new();
        let out = {
            let mut inner = shared.inner.lock();
            let raced = inner.version != snapshot;
            let mut out = Vec::with_capacity(loaded.len());
            for (index, key, value) in loaded {
                if value.is_none() {
                    out.push((index, None));
                    continue;
                }
                if raced {
                    let (cached, evicted) = shared.lookup_locked(&mut inner, &key);
                    if let Some(evicted) = evicted {
                        evictions.push(evicted);
                    }
                    if let Some(cached) = cached {
                        out.push((index, cached));
                        continue;
                    }
                }
                // A duplicate key earlier in the batch may have been demoted
                // by an intra-batch collection already.
                inner.gen1.remove(&key);
                if let Some(evicted) = shared.collect_for_insert(&mut inner) {
                    evictions.push(evicted);
                }
                inner.gen0.insert(key, value.clone());
                inner.version += 1;
                shared.metrics.insert.fetch_add(1, Ordering::Relaxed);
                out.push((index, value));
            }
            out
        };
        for evicted in evictions {
            shared.notify_evicted(evicted);
        }
        out
    }

    #[cfg(test)]
    pub(crate) fn version(&self) -> u64 {
        self.shared.inner.lock().version
    }
}

#[derive(Default)]
struct CollectorStop {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

/// Signals and joins the collector thread when the store is dropped.
struct CollectorHandle {
    stop: Arc<CollectorStop>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Drop for CollectorHandle {
    fn drop(&mut self) {
        *self.stop.stopped.lock() = true;
        self.stop.condvar.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The periodic collector wakes every half time-to-live and collects unless a
/// size-triggered collection already ran within the current interval. It
/// holds only a weak reference, so an abandoned store shuts it down too.
fn spawn_collector<K, V, L, S>(shared: Weak<Shared<K, V, L, S>>, period: Duration) -> CollectorHandle
where
    K: Key,
    V: Value,
    L: EventListener<Key = K, Value = V, HashBuilder = S>,
    S: HashBuilder,
{
    let stop = Arc::new(CollectorStop::default());
    let thread = {
        let stop = stop.clone();
        thread::spawn(move || loop {
            {
                let mut stopped = stop.stopped.lock();
                if !*stopped {
                    stop.condvar.wait_for(&mut stopped, period);
                }
                if *stopped {
                    return;
                }
            }
            let shared = match shared.upgrade() {
                Some(shared) => shared,
                None => return,
            };
            let now = Instant::now();
            let evicted = {
                let mut inner = shared.inner.lock();
                if now.duration_since(inner.last_collection) >= period {
                    shared.collect_locked(&mut inner)
                } else {
                    None
                }
            };
            if let Some(evicted) = evicted {
                shared.notify_evicted(evicted);
            }
        })
    };
    CollectorHandle {
        stop,
        thread: Some(thread),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Invalidated(u64),
        Evicted(Vec<(u64, Option<String>)>),
    }

    #[derive(Default)]
    struct RecordingListener {
        events: StdMutex<Vec<Event>>,
    }

    impl RecordingListener {
        fn take(&self) -> Vec<Event> {
            std::mem::take(&mut self.events.lock().unwrap())
        }
    }

    impl EventListener for RecordingListener {
        type Key = u64;
        type Value = String;
        type HashBuilder = RandomState;

        fn on_invalidated(&self, key: u64) {
            self.events.lock().unwrap().push(Event::Invalidated(key));
        }

        fn on_evicted(&self, entries: HashMap<u64, Option<String>, RandomState>) {
            let mut entries = entries.into_iter().collect::<Vec<_>>();
            entries.sort_by_key(|(key, _)| *key);
            self.events.lock().unwrap().push(Event::Evicted(entries));
        }
    }

    fn store(
        gen0_limit: Option<usize>,
        time_to_live: Option<Duration>,
    ) -> (
        GenerationalStore<u64, String, Arc<RecordingListener>>,
        Arc<RecordingListener>,
    ) {
        let listener = Arc::new(RecordingListener::default());
        let store = GenerationalStore::new(StoreConfig {
            gen0_limit,
            time_to_live,
            hash_builder: RandomState::default(),
            event_listener: listener.clone(),
        })
        .unwrap();
        (store, listener)
    }

    #[test]
    fn test_config_validation() {
        let config = StoreConfig::<DefaultEventListener<u64, String, RandomState>> {
            gen0_limit: None,
            time_to_live: None,
            hash_builder: RandomState::default(),
            event_listener: DefaultEventListener::default(),
        };
        assert!(matches!(
            GenerationalStore::new(config),
            Err(Error::Config(_))
        ));

        let config = StoreConfig::<DefaultEventListener<u64, String, RandomState>> {
            gen0_limit: Some(0),
            time_to_live: None,
            hash_builder: RandomState::default(),
            event_listener: DefaultEventListener::default(),
        };
        assert!(matches!(
            GenerationalStore::new(config),
            Err(Error::Config(_))
        ));

        let config = StoreConfig::<DefaultEventListener<u64, String, RandomState>> {
            gen0_limit: None,
            time_to_live: Some(Duration::ZERO),
            hash_builder: RandomState::default(),
            event_listener: DefaultEventListener::default(),
        };
        assert!(matches!(
            GenerationalStore::new(config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_set_get_roundtrip() {
        let (store, _) = store(Some(10), None);

        store.set(1, "a".to_string());
        assert_eq!(store.get(&1), Some(Some("a".to_string())));
        assert_eq!(store.get(&2), None);

        store.set(1, "b".to_string());
        assert_eq!(store.get(&1), Some(Some("b".to_string())));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_size_triggered_collection() {
        let (store, listener) = store(Some(3), None);

        for key in 1..=3 {
            store.set(key, key.to_string());
        }
        assert_eq!(store.generation_sizes(), (3, 0));
        assert!(listener.take().is_empty());

        // The fourth insert swaps generations; the previous Gen1 was empty,
        // so no eviction event fires yet.
        store.set(4, "4".to_string());
        assert_eq!(store.generation_sizes(), (1, 3));
        assert!(listener.take().is_empty());

        for key in 5..=6 {
            store.set(key, key.to_string());
        }
        store.set(7, "7".to_string());
        assert_eq!(store.generation_sizes(), (1, 3));
        assert_eq!(
            listener.take(),
            vec![Event::Evicted(vec![
                (1, Some("1".to_string())),
                (2, Some("2".to_string())),
                (3, Some("3".to_string())),
            ])]
        );
        for key in 1..=3 {
            assert_eq!(store.get(&key), None);
        }
    }

    #[test]
    fn test_promotion_moves_entry_to_gen0() {
        let (store, _) = store(Some(3), None);

        for key in 1..=4 {
            store.set(key, key.to_string());
        }
        assert_eq!(store.generation_sizes(), (1, 3));

        // 2 lives in Gen1; reading it moves it back into Gen0.
        assert_eq!(store.get(&2), Some(Some("2".to_string())));
        assert_eq!(store.generation_sizes(), (2, 2));

        // A collection now only drops what was left in Gen1.
        store.force_collect();
        assert_eq!(store.get(&2), Some(Some("2".to_string())));
        assert_eq!(store.get(&1), None);
        assert_eq!(store.get(&3), None);
    }

    #[test]
    fn test_force_collect_twice_empties_store() {
        let (store, _) = store(Some(10), None);

        for key in 1..=5 {
            store.set(key, key.to_string());
        }
        store.force_collect();
        assert_eq!(store.generation_sizes(), (0, 5));
        assert_eq!(store.len(), 5);

        store.force_collect();
        assert!(store.is_empty());

        // Collecting an empty store is a no-op.
        let version = store.version();
        store.force_collect();
        assert_eq!(store.version(), version);
    }

    #[test]
    fn test_invalidate_emits_once() {
        let (store, listener) = store(Some(10), None);

        store.set(1, "1".to_string());
        store.force_collect();
        assert!(store.invalidate(&1));
        assert_eq!(store.len(), 0);
        assert_eq!(listener.take(), vec![Event::Invalidated(1)]);

        // Invalidating an unknown key is silent.
        assert!(!store.invalidate(&1));
        assert!(listener.take().is_empty());
    }

    #[test]
    fn test_invalidate_many() {
        let (store, listener) = store(Some(10), None);

        for key in 1..=4 {
            store.set(key, key.to_string());
        }
        store.force_collect();
        store.set(4, "4".to_string());

        assert_eq!(store.invalidate_many(&[1, 3, 4, 9]), 3);
        assert_eq!(store.len(), 1);
        assert_eq!(
            listener.take(),
            vec![
                Event::Invalidated(1),
                Event::Invalidated(3),
                Event::Invalidated(4),
            ]
        );
    }

    #[test]
    fn test_clear_emits_union() {
        let (store, listener) = store(Some(10), None);

        store.set(1, "a".to_string());
        store.force_collect();
        store.set(2, "b".to_string());

        store.clear();
        assert_eq!(store.len(), 0);
        assert_eq!(
            listener.take(),
            vec![Event::Evicted(vec![
                (1, Some("a".to_string())),
                (2, Some("b".to_string())),
            ])]
        );

        // Clearing an empty store emits nothing.
        store.clear();
        assert!(listener.take().is_empty());
    }

    #[test]
    fn test_negative_entries_are_stored() {
        let (store, listener) = store(Some(10), None);

        store.insert(1, None);
        assert_eq!(store.get(&1), Some(None));
        assert_eq!(store.len(), 1);

        store.clear();
        assert_eq!(listener.take(), vec![Event::Evicted(vec![(1, None)])]);
    }

    #[test]
    fn test_reconcile_insert_respects_racing_writer() {
        let (store, _) = store(Some(10), None);

        let probe = store.probe(&1);
        assert!(probe.cached.is_none());

        // Another writer slips in while the "load" runs unlocked.
        store.set(1, "racing".to_string());

        let value = store.reconcile_insert(1, Some("loaded".to_string()), probe.version);
        assert_eq!(value, Some("racing".to_string()));
        assert_eq!(store.get(&1), Some(Some("racing".to_string())));
    }

    #[test]
    fn test_reconcile_insert_without_race() {
        let (store, _) = store(Some(10), None);

        let probe = store.probe(&1);
        let value = store.reconcile_insert(1, Some("loaded".to_string()), probe.version);
        assert_eq!(value, Some("loaded".to_string()));
        assert_eq!(store.get(&1), Some(Some("loaded".to_string())));

        // An unrelated mutation moves the version, but the key itself is
        // still unclaimed, so the loaded value is inserted.
        let probe = store.probe(&2);
        store.set(3, "3".to_string());
        let value = store.reconcile_insert(2, None, probe.version);
        assert_eq!(value, None);
        assert_eq!(store.get(&2), Some(None));
    }

    #[test]
    fn test_batch_probe_and_reconcile() {
        let (store, _) = store(Some(10), None);

        store.set(2, "2".to_string());

        let probe = store.probe_batch(&[1, 2, 3]);
        assert_eq!(probe.results.len(), 3);
        assert!(probe.results[0].is_none());
        assert_eq!(probe.results[1], Some(Some("2".to_string())));
        assert_eq!(
            probe.missed.iter().map(|(index, _)| *index).collect::<Vec<_>>(),
            vec![0, 2]
        );

        // 1 loads a value, 3 is absent at the source; only 1 is cached.
        let out = store.reconcile_batch(
            vec![(0, 1, Some("1".to_string())), (2, 3, None)],
            probe.version,
        );
        assert_eq!(out, vec![(0, Some("1".to_string())), (2, None)]);
        assert_eq!(store.get(&1), Some(Some("1".to_string())));
        assert_eq!(store.get(&3), None);
    }

    #[test]
    fn test_listener_panic_is_swallowed() {
        struct PanickingListener;

        impl EventListener for PanickingListener {
            type Key = u64;
            type Value = String;
            type HashBuilder = RandomState;

            fn on_invalidated(&self, _: u64) {
                panic!("listener bug");
            }

            fn on_evicted(&self, _: HashMap<u64, Option<String>, RandomState>) {
                panic!("listener bug");
            }
        }

        let store = GenerationalStore::new(StoreConfig {
            gen0_limit: Some(2),
            time_to_live: None,
            hash_builder: RandomState::default(),
            event_listener: PanickingListener,
        })
        .unwrap();

        for key in 1..=5 {
            store.set(key, key.to_string());
        }
        assert!(store.invalidate(&5));
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_fill_state_transitions() {
        let (store, _) = store(Some(10), None);
        assert_eq!(store.fill_state(), FillState::Empty);

        store.set(1, "1".to_string());
        assert_eq!(store.fill_state(), FillState::Warming);

        store.force_collect();
        store.set(2, "2".to_string());
        assert_eq!(store.fill_state(), FillState::Full);

        store.clear();
        assert_eq!(store.fill_state(), FillState::Empty);
    }

    #[test]
    fn test_periodic_collection() {
        let (store, _) = store(None, Some(Duration::from_millis(200)));

        store.set(1, "1".to_string());
        // Entries survive at least one full wake interval.
        thread::sleep(Duration::from_millis(40));
        assert_eq!(store.get(&1), Some(Some("1".to_string())));

        // Two untouched intervals later the entry is gone.
        thread::sleep(Duration::from_millis(600));
        assert_eq!(store.get(&1), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_periodic_collection_keeps_touched_entries() {
        let (store, _) = store(None, Some(Duration::from_millis(200)));

        store.set(1, "1".to_string());
        // Touching the entry every ~half interval keeps promoting it back
        // into Gen0, so it survives arbitrarily long.
        for _ in 0..8 {
            thread::sleep(Duration::from_millis(30));
            assert_eq!(store.get(&1), Some(Some("1".to_string())));
        }
    }
}
