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
    sync::{Arc, Weak},
    thread,
    time::Duration,
};

use ahash::RandomState;
use futures::future::try_join_all;
use gencache_common::{
    code::HashBuilder,
    event::{DefaultEventListener, EventListener},
};
use itertools::Itertools;

use crate::{
    error::{Error, Result},
    metrics::Metrics,
    read_through::ReadThroughGenerational,
    source::{DataSource, InvalidationListener},
    store::StoreConfig,
};

/// N independent read-through caches selected by a hash of the key.
///
/// Partitioning trades a little capacity granularity for lock scalability:
/// each partition owns its own mutex, generations, and single-flight table,
/// so operations on keys in different partitions never contend. Partition
/// selection is deterministic for equal keys across the process lifetime.
pub struct PartitionedCache<D, L, S = RandomState>
where
    D: DataSource,
    L: EventListener<Key = D::Key, Value = D::Value, HashBuilder = S>,
    S: HashBuilder,
{
    partitions: Vec<ReadThroughGenerational<D, Arc<L>, S>>,
    source: Arc<D>,
    hash_builder: S,
    /// `Some(n - 1)` when the partition count is a power of two.
    mask: Option<u64>,
}

impl<D, L, S> PartitionedCache<D, L, S>
where
    D: DataSource,
    L: EventListener<Key = D::Key, Value = D::Value, HashBuilder = S>,
    S: HashBuilder,
{
    fn partition_index(&self, key: &D::Key) -> usize {
        let hash = self.hash_builder.hash_one(key);
        match self.mask {
            Some(mask) => (hash & mask) as usize,
            None => (hash % self.partitions.len() as u64) as usize,
        }
    }

    fn partition(&self, key: &D::Key) -> &ReadThroughGenerational<D, Arc<L>, S> {
        &self.partitions[self.partition_index(key)]
    }

    /// Group input keys by owning partition, remembering input positions.
    fn group_keys(&self, keys: &[D::Key]) -> Vec<Vec<usize>> {
        let mut groups: Vec<Vec<usize>> = vec![Vec::new(); self.partitions.len()];
        for (index, key) in keys.iter().enumerate() {
            groups[self.partition_index(key)].push(index);
        }
        groups
    }

    pub fn get(&self, key: &D::Key) -> Result<Option<D::Value>> {
        self.partition(key).get(key)
    }

    pub async fn get_async(&self, key: &D::Key) -> Result<Option<D::Value>> {
        self.partition(key).get_async(key).await
    }

    /// Get a batch of values; each partition sees one sub-batch.
    ///
    /// The output is aligned to the input.
    pub fn get_batch(&self, keys: &[D::Key]) -> Result<Vec<Option<D::Value>>> {
        let groups = self.group_keys(keys);
        let mut results = vec![None; keys.len()];
        for (partition, indices) in self.partitions.iter().zip(&groups) {
            if indices.is_empty() {
                continue;
            }
            let partition_keys = indices.iter().map(|&index| keys[index].clone()).collect_vec();
            let loaded = partition.get_batch(&partition_keys)?;
            for (&index, value) in indices.iter().zip(loaded) {
                results[index] = value;
            }
        }
        Ok(results)
    }

    /// Asynchronous variant of [`get_batch`](Self::get_batch); the per
    /// partition sub-batches run concurrently.
    pub async fn get_batch_async(&self, keys: &[D::Key]) -> Result<Vec<Option<D::Value>>> {
        let groups = self.group_keys(keys);
        let batches = self
            .partitions
            .iter()
            .zip(&groups)
            .filter(|(_, indices)| !indices.is_empty())
            .map(|(partition, indices)| {
                let partition_keys = indices.iter().map(|&index| keys[index].clone()).collect_vec();
                (partition, indices, partition_keys)
            })
            .collect_vec();

        let loaded = try_join_all(
            batches
                .iter()
                .map(|(partition, _, partition_keys)| partition.get_batch_async(partition_keys)),
        )
        .await?;

        let mut results = vec![None; keys.len()];
        for ((_, indices, _), values) in batches.iter().zip(loaded) {
            for (&index, value) in indices.iter().zip(values) {
                results[index] = value;
            }
        }
        Ok(results)
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
        self.partition(key).invalidate(key)
    }

    /// Invalidate several keys, acquiring each partition's lock once.
    pub fn invalidate_many(&self, keys: &[D::Key]) -> usize {
        let groups = self.group_keys(keys);
        self.partitions
            .iter()
            .zip(groups)
            .map(|(partition, indices)| {
                if indices.is_empty() {
                    return 0;
                }
                let partition_keys = indices.iter().map(|&index| keys[index].clone()).collect_vec();
                partition.invalidate_many(&partition_keys)
            })
            .sum()
    }

    pub fn clear(&self) {
        for partition in &self.partitions {
            partition.clear();
        }
    }

    pub fn force_collect(&self) {
        for partition in &self.partitions {
            partition.force_collect();
        }
    }

    /// Current entry count summed over all partitions.
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|partition| partition.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.iter().all(|partition| partition.is_empty())
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Counters summed over all partitions.
    pub fn metrics(&self) -> Metrics {
        let mut total = Metrics::default();
        for partition in &self.partitions {
            total.add(partition.metrics());
        }
        total
    }

    fn subscribe_invalidations(self: &Arc<Self>) {
        self.source.subscribe(Arc::new(PartitionSubscriber {
            cache: Arc::downgrade(self),
        }));
    }
}

/// Routes source invalidations to the owning partition without keeping the
/// cache alive.
struct PartitionSubscriber<D, L, S>
where
    D: DataSource,
    L: EventListener<Key = D::Key, Value = D::Value, HashBuilder = S>,
    S: HashBuilder,
{
    cache: Weak<PartitionedCache<D, L, S>>,
}

impl<D, L, S> InvalidationListener<D::Key> for PartitionSubscriber<D, L, S>
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

/// Builder for a [`PartitionedCache`].
pub struct CacheBuilder<D, L, S = RandomState>
where
    D: DataSource,
{
    source: Arc<D>,
    gen0_limit: Option<usize>,
    time_to_live: Option<Duration>,
    partitions: usize,
    hash_builder: S,
    event_listener: L,
}

impl<D> CacheBuilder<D, DefaultEventListener<D::Key, D::Value, RandomState>, RandomState>
where
    D: DataSource,
{
    /// Start building a cache over `source`.
    ///
    /// Defaults: one partition per hardware thread, no gen0 limit, no time
    /// to live. At least one of the two limits must be set before `build`.
    pub fn new(source: Arc<D>) -> Self {
        let partitions = thread::available_parallelism()
            .map(|parallelism| parallelism.get())
            .unwrap_or(1);
        Self {
            source,
            gen0_limit: None,
            time_to_live: None,
            partitions,
            hash_builder: RandomState::default(),
            event_listener: DefaultEventListener::default(),
        }
    }
}

impl<D, L, S> CacheBuilder<D, L, S>
where
    D: DataSource,
{
    /// Bound Gen0 of the whole cache; each partition gets an equal share.
    pub fn with_gen0_limit(mut self, gen0_limit: usize) -> Self {
        self.gen0_limit = Some(gen0_limit);
        self
    }

    /// Enable periodic collection with the given entry time-to-live.
    pub fn with_time_to_live(mut self, time_to_live: Duration) -> Self {
        self.time_to_live = Some(time_to_live);
        self
    }

    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_hash_builder<S2>(self, hash_builder: S2) -> CacheBuilder<D, L, S2> {
        CacheBuilder {
            source: self.source,
            gen0_limit: self.gen0_limit,
            time_to_live: self.time_to_live,
            partitions: self.partitions,
            hash_builder,
            event_listener: self.event_listener,
        }
    }

    pub fn with_event_listener<L2>(self, event_listener: L2) -> CacheBuilder<D, L2, S> {
        CacheBuilder {
            source: self.source,
            gen0_limit: self.gen0_limit,
            time_to_live: self.time_to_live,
            partitions: self.partitions,
            hash_builder: self.hash_builder,
            event_listener,
        }
    }

    /// Build the cache and register it for source-side invalidations.
    pub fn build(self) -> Result<Arc<PartitionedCache<D, L, S>>>
    where
        L: EventListener<Key = D::Key, Value = D::Value, HashBuilder = S>,
        S: HashBuilder,
    {
        if self.partitions == 0 {
            return Err(Error::config("partitions must be at least 1"));
        }
        if let Some(limit) = self.gen0_limit {
            if limit == 0 {
                return Err(Error::config("gen0_limit must be at least 1"));
            }
        }

        let listener = Arc::new(self.event_listener);
        let per_partition_limit = self
            .gen0_limit
            .map(|limit| (limit / self.partitions).max(1));

        let partitions = (0..self.partitions)
            .map(|_| {
                ReadThroughGenerational::new(
                    StoreConfig {
                        gen0_limit: per_partition_limit,
                        time_to_live: self.time_to_live,
                        hash_builder: self.hash_builder.clone(),
                        event_listener: listener.clone(),
                    },
                    self.source.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let mask = self
            .partitions
            .is_power_of_two()
            .then(|| self.partitions as u64 - 1);

        let cache = Arc::new(PartitionedCache {
            partitions,
            source: self.source,
            hash_builder: self.hash_builder,
            mask,
        });
        cache.subscribe_invalidations();
        Ok(cache)
    }
}
