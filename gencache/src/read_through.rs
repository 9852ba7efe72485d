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

use std::sync::{Arc, Weak};

use ahash::RandomState;
use gencache_common::{code::HashBuilder, event::EventListener};
use itertools::Itertools;

use crate::{
    error::Result,
    metrics::Metrics,
    singleflight::SingleFlight,
    source::{DataSource, InvalidationListener},
    store::{BatchProbe, FillState, GenerationalStore, StoreConfig},
};

/// A generational store that loads misses from a [`DataSource`].
///
/// Loads run with the store lock released and are routed through a
/// [`SingleFlight`] coordinator, so concurrent getters of one key share a
/// single source call. Both present and absent results are cached: a key the
/// source does not know is remembered as absent until it is collected or
/// invalidated, and the source is not asked again in between.
///
/// Source failures are returned to the caller and cache nothing.
pub struct ReadThroughGenerational<D, L, S = RandomState>
where
    D: DataSource,
    L: EventListener<Key = D::Key, Value = D::Value, HashBuilder = S>,
    S: HashBuilder,
{
    store: GenerationalStore<D::Key, D::Value, L, S>,
    flight: SingleFlight<D>,
}

impl<D, L, S> ReadThroughGenerational<D, L, S>
where
    D: DataSource,
    L: EventListener<Key = D::Key, Value = D::Value, HashBuilder = S>,
    S: HashBuilder,
{
    pub fn new(config: StoreConfig<L, S>, source: Arc<D>) -> Result<Self> {
        let store = GenerationalStore::new(config)?;
        let flight = SingleFlight::with_metrics(source, store.metrics_handle());
        Ok(Self { store, flight })
    }

    /// Create the cache and register it for source-side invalidations.
    pub fn open(config: StoreConfig<L, S>, source: Arc<D>) -> Result<Arc<Self>> {
        let cache = Arc::new(Self::new(config, source)?);
        cache.subscribe_invalidations();
        Ok(cache)
    }

    /// Forward source-side invalidations into this cache.
    ///
    /// The source holds only a weak reference, so subscribing does not keep
    /// the cache alive.
    pub fn subscribe_invalidations(self: &Arc<Self>) {
        self.flight.source().subscribe(Arc::new(WeakSubscriber {
            cache: Arc::downgrade(self),
        }));
    }

    /// Get a value, loading it from the source on a miss.
    ///
    /// Returns `None` for a key the source reports as absent. Blocks the
    /// calling thread during the load; use [`get_async`](Self::get_async)
    /// from within an async runtime.
    pub fn get(&self, key: &D::Key) -> Result<Option<D::Value>> {
        let probe = self.store.probe(key);
        if let Some(cached) = probe.cached {
            return Ok(cached);
        }
        let loaded = self.flight.load(key)?;
        Ok(self.store.reconcile_insert(key.clone(), loaded, probe.version))
    }

    /// Asynchronous variant of [`get`](Self::get).
    pub async fn get_async(&self, key: &D::Key) -> Result<Option<D::Value>> {
        let probe = self.store.probe(key);
        if let Some(cached) = probe.cached {
            return Ok(cached);
        }
        let loaded = self.flight.load_async(key).await?;
        Ok(self.store.reconcile_insert(key.clone(), loaded, probe.version))
    }

    /// Get a batch of values, loading all misses with one source call.
    ///
    /// The output is aligned to the input. Present results are cached; a key
    /// that loads as absent (or whose overlapping flight fails) yields `None`
    /// without creating a cache entry.
    pub fn get_batch(&self, keys: &[D::Key]) -> Result<Vec<Option<D::Value>>> {
        let probe = self.store.probe_batch(keys);
        if probe.missed.is_empty() {
            return Ok(assemble(probe.results));
        }
        let missed_keys = probe
            .missed
            .iter()
            .map(|(_, key)| key.clone())
            .collect_vec();
        let loaded = self.flight.load_batch(&missed_keys)?;
        Ok(self.finish_batch(probe, loaded))
    }

    /// Asynchronous variant of [`get_batch`](Self::get_batch).
    pub async fn get_batch_async(&self, keys: &[D::Key]) -> Result<Vec<Option<D::Value>>> {
        let probe = self.store.probe_batch(keys);
        if probe.missed.is_empty() {
            return Ok(assemble(probe.results));
        }
        let missed_keys = probe
            .missed
            .iter()
            .map(|(_, key)| key.clone())
            .collect_vec();
        let loaded = self.flight.load_batch_async(&missed_keys).await?;
        Ok(self.finish_batch(probe, loaded))
    }

    /// Thin facade over [`get`](Self::get) returning the value type's
    /// default for absent keys.
    pub fn get_or_default(&self, key: &D::Key) -> Result<D::Value>
    where
        D::Value: Default,
    {
        Ok(self.get(key)?.unwrap_or_default())
    }

    /// Thin facade over [`get_async`](Self::get_async) returning the value
    /// type's default for absent keys.
    pub async fn get_or_default_async(&self, key: &D::Key) -> Result<D::Value>
    where
        D::Value: Default,
    {
        Ok(self.get_async(key).await?.unwrap_or_default())
    }

    pub fn invalidate(&self, key: &D::Key) -> bool {
        self.store.invalidate(key)
    }

    pub fn invalidate_many(&self, keys: &[D::Key]) -> usize {
        self.store.invalidate_many(keys)
    }

    pub fn clear(&self) {
        self.store.clear()
    }

    pub fn force_collect(&self) {
        self.store.force_collect()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn fill_state(&self) -> FillState {
        self.store.fill_state()
    }

    pub fn metrics(&self) -> &Metrics {
        self.store.metrics()
    }

    /// The underlying store, for inspection.
    pub fn store(&self) -> &GenerationalStore<D::Key, D::Value, L, S> {
        &self.store
    }

    /// Reconcile loaded batch results into the store and assemble the output
    /// in input order.
    fn finish_batch(
        &self,
        probe: BatchProbe<D::Key, D::Value>,
        loaded: Vec<Option<D::Value>>,
    ) -> Vec<Option<D::Value>> {
        debug_assert_eq!(loaded.len(), probe.missed.len());
        let reconciled = self.store.reconcile_batch(
            probe
                .missed
                .into_iter()
                .zip(loaded)
                .map(|((index, key), value)| (index, key, value))
                .collect_vec(),
            probe.version,
        );
        let mut results = probe.results;
        for (index, value) in reconciled {
            results[index] = Some(value);
        }
        assemble(results)
    }
}

/// Collapse per-slot cache results: an unfilled slot means the key loaded as
/// absent (or failed while waited on) and reads as `None`.
fn assemble<V>(results: Vec<Option<Option<V>>>) -> Vec<Option<V>> {
    results.into_iter().map(Option::flatten).collect()
}

/// Forwards source invalidations to the cache without keeping it alive.
struct WeakSubscriber<D, L, S>
where
    D: DataSource,
    L: EventListener<Key = D::Key, Value = D::Value, HashBuilder = S>,
    S: HashBuilder,
{
    cache: Weak<ReadThroughGenerational<D, L, S>>,
}

impl<D, L, S> InvalidationListener<D::Key> for WeakSubscriber<D, L, S>
where
    D: DataSource,
    L: EventListener<Key = D::Key, Value = D::Value, HashBuilder = S>,
    S: HashBuilder,
{
    fn on_invalidate(&self, key: D::Key) {
        if let Some(cache) = self.cache.upgrade() {
            cache.invalidate(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Barrier, Mutex as StdMutex,
        },
        thread,
        time::Duration,
    };

    use gencache_common::event::DefaultEventListener;
    use hashbrown::HashMap;

    use super::*;
    use crate::error::Error;

    type TestListener = DefaultEventListener<u64, String, RandomState>;

    struct MapSource {
        data: StdMutex<HashMap<u64, String>>,
        hits: AtomicUsize,
        fail: StdMutex<bool>,
        listeners: StdMutex<Vec<Arc<dyn InvalidationListener<u64>>>>,
    }

    impl MapSource {
        fn new(entries: &[(u64, &str)]) -> Arc<Self> {
            Arc::new(Self {
                data: StdMutex::new(
                    entries
                        .iter()
                        .map(|(key, value)| (*key, value.to_string()))
                        .collect(),
                ),
                hits: AtomicUsize::new(0),
                fail: StdMutex::new(false),
                listeners: StdMutex::new(Vec::new()),
            })
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }

        fn push_invalidate(&self, key: u64) {
            for listener in self.listeners.lock().unwrap().iter() {
                listener.on_invalidate(key);
            }
        }
    }

    impl DataSource for MapSource {
        type Key = u64;
        type Value = String;

        fn load(&self, key: &u64) -> Result<Option<String>> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if *self.fail.lock().unwrap() {
                return Err(Error::source(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "source down",
                )));
            }
            Ok(self.data.lock().unwrap().get(key).cloned())
        }

        fn subscribe(&self, listener: Arc<dyn InvalidationListener<u64>>) {
            self.listeners.lock().unwrap().push(listener);
        }
    }

    fn cache(
        source: &Arc<MapSource>,
        gen0_limit: usize,
    ) -> ReadThroughGenerational<MapSource, TestListener> {
        ReadThroughGenerational::new(
            StoreConfig {
                gen0_limit: Some(gen0_limit),
                time_to_live: None,
                hash_builder: RandomState::default(),
                event_listener: TestListener::default(),
            },
            source.clone(),
        )
        .unwrap()
    }

    #[test]
    fn test_load_on_miss_then_hit() {
        let source = MapSource::new(&[(1, "one")]);
        let cache = cache(&source, 10);

        assert_eq!(cache.get(&1).unwrap(), Some("one".to_string()));
        assert_eq!(cache.get(&1).unwrap(), Some("one".to_string()));
        assert_eq!(source.hits(), 1);
    }

    #[test]
    fn test_negative_caching() {
        let source = MapSource::new(&[]);
        let cache = cache(&source, 10);

        assert_eq!(cache.get(&42).unwrap(), None);
        assert_eq!(cache.get(&42).unwrap(), None);
        assert_eq!(source.hits(), 1);
        assert_eq!(cache.len(), 1);

        // Invalidation forgets the absence; the next get asks the source.
        assert!(cache.invalidate(&42));
        assert_eq!(cache.get(&42).unwrap(), None);
        assert_eq!(source.hits(), 2);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let source = MapSource::new(&[(1, "one")]);
        let cache = cache(&source, 10);

        *source.fail.lock().unwrap() = true;
        assert!(cache.get(&1).is_err());
        assert_eq!(cache.len(), 0);

        *source.fail.lock().unwrap() = false;
        assert_eq!(cache.get(&1).unwrap(), Some("one".to_string()));
        assert_eq!(source.hits(), 2);
    }

    #[test]
    fn test_generational_eviction_through_read_through() {
        let source = MapSource::new(&[
            (1, "1"),
            (2, "2"),
            (3, "3"),
            (4, "4"),
            (5, "5"),
            (6, "6"),
            (7, "7"),
        ]);
        let cache = cache(&source, 3);

        for key in 1..=4 {
            cache.get(&key).unwrap();
        }
        assert_eq!(cache.store().generation_sizes(), (1, 3));

        for key in 5..=7 {
            cache.get(&key).unwrap();
        }
        assert_eq!(cache.store().generation_sizes(), (1, 3));

        // Keys 1..=3 fell out of the cache and reload from the source.
        assert_eq!(source.hits(), 7);
        cache.get(&1).unwrap();
        assert_eq!(source.hits(), 8);
    }

    #[test]
    fn test_get_batch_alignment_and_caching() {
        let source = MapSource::new(&[(1, "one"), (3, "three")]);
        let cache = cache(&source, 10);

        // 2 is absent; its slot is None and nothing is cached for it.
        let results = cache.get_batch(&[1, 2, 3, 1]).unwrap();
        assert_eq!(
            results,
            vec![
                Some("one".to_string()),
                None,
                Some("three".to_string()),
                Some("one".to_string()),
            ]
        );
        assert_eq!(cache.len(), 2);
        assert_eq!(source.hits(), 3);

        // The absent key is asked again, the cached keys are not.
        let results = cache.get_batch(&[1, 2, 3]).unwrap();
        assert_eq!(
            results,
            vec![Some("one".to_string()), None, Some("three".to_string())]
        );
        assert_eq!(source.hits(), 4);
    }

    #[test]
    fn test_get_batch_all_cached_skips_source() {
        let source = MapSource::new(&[(1, "one"), (2, "two")]);
        let cache = cache(&source, 10);

        cache.get(&1).unwrap();
        cache.get(&2).unwrap();
        assert_eq!(source.hits(), 2);

        let results = cache.get_batch(&[2, 1]).unwrap();
        assert_eq!(
            results,
            vec![Some("two".to_string()), Some("one".to_string())]
        );
        assert_eq!(source.hits(), 2);
    }

    #[test]
    fn test_get_or_default() {
        let source = MapSource::new(&[(1, "one")]);
        let cache = cache(&source, 10);

        assert_eq!(cache.get_or_default(&1).unwrap(), "one".to_string());
        assert_eq!(cache.get_or_default(&9).unwrap(), String::new());
    }

    #[test]
    fn test_concurrent_getters_share_one_load() {
        const THREADS: usize = 8;

        struct SlowSource {
            hits: AtomicUsize,
        }

        impl DataSource for SlowSource {
            type Key = u64;
            type Value = String;

            fn load(&self, key: &u64) -> Result<Option<String>> {
                self.hits.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(100));
                Ok(Some(format!("value-{key}")))
            }
        }

        let source = Arc::new(SlowSource {
            hits: AtomicUsize::new(0),
        });
        let cache = ReadThroughGenerational::<_, DefaultEventListener<u64, String, RandomState>>::new(
            StoreConfig {
                gen0_limit: Some(10),
                time_to_live: None,
                hash_builder: RandomState::default(),
                event_listener: DefaultEventListener::default(),
            },
            source.clone(),
        )
        .unwrap();

        let barrier = Barrier::new(THREADS);
        thread::scope(|scope| {
            let handles = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        cache.get(&7)
                    })
                })
                .collect::<Vec<_>>();
            for handle in handles {
                assert_eq!(
                    handle.join().unwrap().unwrap(),
                    Some("value-7".to_string())
                );
            }
        });

        assert_eq!(source.hits.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_source_invalidation_propagates() {
        let source = MapSource::new(&[(1, "one")]);
        let cache = ReadThroughGenerational::open(
            StoreConfig {
                gen0_limit: Some(10),
                time_to_live: None,
                hash_builder: RandomState::default(),
                event_listener: TestListener::default(),
            },
            source.clone(),
        )
        .unwrap();

        cache.get(&1).unwrap();
        assert_eq!(cache.len(), 1);

        source.data.lock().unwrap().insert(1, "uno".to_string());
        source.push_invalidate(1);
        assert_eq!(cache.len(), 0);

        assert_eq!(cache.get(&1).unwrap(), Some("uno".to_string()));
        assert_eq!(source.hits(), 2);
    }

    #[test]
    fn test_dropped_cache_ignores_source_invalidations() {
        let source = MapSource::new(&[(1, "one")]);
        {
            let cache = ReadThroughGenerational::open(
                StoreConfig {
                    gen0_limit: Some(10),
                    time_to_live: None,
                    hash_builder: RandomState::default(),
                    event_listener: TestListener::default(),
                },
                source.clone(),
            )
            .unwrap();
            cache.get(&1).unwrap();
        }

        // The subscriber holds only a weak reference; signalling after drop
        // is a no-op.
        source.push_invalidate(1);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_get_async_paths() {
        let source = MapSource::new(&[(1, "one")]);
        let cache = cache(&source, 10);

        assert_eq!(cache.get_async(&1).await.unwrap(), Some("one".to_string()));
        assert_eq!(cache.get_async(&1).await.unwrap(), Some("one".to_string()));
        assert_eq!(cache.get_or_default_async(&9).await.unwrap(), String::new());

        let results = cache.get_batch_async(&[1, 9]).await.unwrap();
        assert_eq!(results, vec![Some("one".to_string()), None]);
        assert_eq!(source.hits(), 3);
    }
}
