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

use std::sync::{atomic::Ordering, Arc};

use hashbrown::{hash_map::Entry as HashMapEntry, HashMap};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{
    error::{Error, Result},
    metrics::Metrics,
    source::DataSource,
};

type LoadResult<V> = Result<Option<V>>;

/// A load in flight. Lives in the pending table only until its producer
/// publishes an outcome.
struct Flight<V> {
    waiters: Vec<oneshot::Sender<LoadResult<V>>>,
}

struct FlightTable<D>
where
    D: DataSource,
{
    source: Arc<D>,
    pending: Mutex<HashMap<D::Key, Flight<D::Value>>>,
    metrics: Arc<Metrics>,
}

/// Coordinator that keeps at most one outstanding source load per key.
///
/// Concurrent getters of the same key share the single in-flight result;
/// getters of distinct keys proceed in parallel. The synchronous and
/// asynchronous paths join the same pending table, so they de-duplicate
/// against each other as well.
pub struct SingleFlight<D>
where
    D: DataSource,
{
    table: Arc<FlightTable<D>>,
}

impl<D> Clone for SingleFlight<D>
where
    D: DataSource,
{
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
        }
    }
}

enum Join<D>
where
    D: DataSource,
{
    /// The caller claimed the load; it must publish an outcome through the
    /// guard. The receiver is the claimant's own subscription.
    Lead(ClaimGuard<D>, oneshot::Receiver<LoadResult<D::Value>>),
    /// Another load is in flight; wait on the broadcast.
    Wait(oneshot::Receiver<LoadResult<D::Value>>),
}

impl<D> SingleFlight<D>
where
    D: DataSource,
{
    pub fn new(source: Arc<D>) -> Self {
        Self::with_metrics(source, Arc::new(Metrics::default()))
    }

    pub(crate) fn with_metrics(source: Arc<D>, metrics: Arc<Metrics>) -> Self {
        Self {
            table: Arc::new(FlightTable {
                source,
                pending: Mutex::new(HashMap::new()),
                metrics,
            }),
        }
    }

    pub fn source(&self) -> &Arc<D> {
        &self.table.source
    }

    /// Load a key, sharing any load already in flight.
    ///
    /// Blocks the calling thread while waiting; use
    /// [`load_async`](Self::load_async) from within an async runtime.
    pub fn load(&self, key: &D::Key) -> Result<Option<D::Value>> {
        match self.join(key) {
            Join::Wait(rx) => match rx.blocking_recv() {
                Ok(result) => result,
                Err(_) => Err(Error::Interrupted),
            },
            Join::Lead(mut guard, _rx) => {
                let result = self.table.source.load(key);
                guard.publish_all(result.clone());
                result
            }
        }
    }

    /// Asynchronous variant of [`load`](Self::load).
    ///
    /// A claimed load is spawned onto the runtime, so cancelling a waiting
    /// caller never cancels the producer; remaining waiters are still served.
    pub async fn load_async(&self, key: &D::Key) -> Result<Option<D::Value>> {
        let rx = match self.join(key) {
            Join::Wait(rx) => rx,
            Join::Lead(guard, rx) => {
                let table = self.table.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    let mut guard = guard;
                    let result = table.source.load_async(&key).await;
                    guard.publish_all(result);
                });
                rx
            }
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Interrupted),
        }
    }

    /// Load a batch of keys with a single source call for the keys this
    /// caller claims; keys already in flight (elsewhere or earlier in the
    /// same input) are joined instead of re-requested.
    ///
    /// The output is aligned to the input. A slot waited on from another
    /// flight that fails resolves to `None`; a failure of this caller's own
    /// source call is returned as the error.
    pub fn load_batch(&self, keys: &[D::Key]) -> Result<Vec<Option<D::Value>>> {
        let (receivers, claimed, mut guard) = self.claim_batch(keys);
        if !claimed.is_empty() {
            tracing::trace!(claimed = claimed.len(), total = keys.len(), "batch load");
            match self.table.source.load_batch(&claimed) {
                Ok(values) if values.len() == claimed.len() => guard.publish_each(values),
                Ok(values) => {
                    let err = Error::MisalignedBatch {
                        expected: claimed.len(),
                        got: values.len(),
                    };
                    guard.publish_all(Err(err.clone()));
                    return Err(err);
                }
                Err(err) => {
                    guard.publish_all(Err(err.clone()));
                    return Err(err);
                }
            }
        }
        let mut results = Vec::with_capacity(receivers.len());
        for (rx, own) in receivers {
            match rx.blocking_recv() {
                Ok(Ok(value)) => results.push(value),
                Ok(Err(err)) if own => return Err(err),
                Err(_) if own => return Err(Error::Interrupted),
                Ok(Err(_)) | Err(_) => results.push(None),
            }
        }
        Ok(results)
    }

    /// Asynchronous variant of [`load_batch`](Self::load_batch).
    pub async fn load_batch_async(&self, keys: &[D::Key]) -> Result<Vec<Option<D::Value>>> {
        let (receivers, claimed, guard) = self.claim_batch(keys);
        if claimed.is_empty() {
            drop(guard);
        } else {
            let table = self.table.clone();
            tokio::spawn(async move {
                let mut guard = guard;
                match table.source.load_batch_async(&claimed).await {
                    Ok(values) if values.len() == claimed.len() => guard.publish_each(values),
                    Ok(values) => guard.publish_all(Err(Error::MisalignedBatch {
                        expected: claimed.len(),
                        got: values.len(),
                    })),
                    Err(err) => guard.publish_all(Err(err)),
                }
            });
        }
        let mut results = Vec::with_capacity(receivers.len());
        for (rx, own) in receivers {
            match rx.await {
                Ok(Ok(value)) => results.push(value),
                Ok(Err(err)) if own => return Err(err),
                Err(_) if own => return Err(Error::Interrupted),
                Ok(Err(_)) | Err(_) => results.push(None),
            }
        }
        Ok(results)
    }

    fn join(&self, key: &D::Key) -> Join<D> {
        let mut pending = self.table.pending.lock();
        match pending.entry(key.clone()) {
            HashMapEntry::Occupied(mut o) => {
                let (tx, rx) = oneshot::channel();
                o.get_mut().waiters.push(tx);
                self.table.metrics.queue.fetch_add(1, Ordering::Relaxed);
                Join::Wait(rx)
            }
            HashMapEntry::Vacant(v) => {
                let (tx, rx) = oneshot::channel();
                v.insert(Flight { waiters: vec![tx] });
                self.table.metrics.fetch.fetch_add(1, Ordering::Relaxed);
                Join::Lead(ClaimGuard::new(self.table.clone(), vec![key.clone()]), rx)
            }
        }
    }

    /// Classify every key under one lock acquisition. Every slot gets a
    /// receiver; claimed keys are additionally returned for the source call.
    #[allow(clippy::type_complexity)]
    fn claim_batch(
        &self,
        keys: &[D::Key],
    ) -> (
        Vec<(oneshot::Receiver<LoadResult<D::Value>>, bool)>,
        Vec<D::Key>,
        ClaimGuard<D>,
    ) {
        let mut receivers = Vec::with_capacity(keys.len());
        let mut claimed = Vec::new();
        {
            let mut pending = self.table.pending.lock();
            for key in keys {
                match pending.entry(key.clone()) {
                    HashMapEntry::Occupied(mut o) => {
                        let (tx, rx) = oneshot::channel();
                        o.get_mut().waiters.push(tx);
                        self.table.metrics.queue.fetch_add(1, Ordering::Relaxed);
                        receivers.push((rx, false));
                    }
                    HashMapEntry::Vacant(v) => {
                        let (tx, rx) = oneshot::channel();
                        v.insert(Flight { waiters: vec![tx] });
                        self.table.metrics.fetch.fetch_add(1, Ordering::Relaxed);
                        claimed.push(key.clone());
                        receivers.push((rx, true));
                    }
                }
            }
        }
        let guard = ClaimGuard::new(self.table.clone(), claimed.clone());
        (receivers, claimed, guard)
    }
}

/// Removes the claimed flights and broadcasts an outcome exactly once, even
/// when the producer panics or is dropped mid-load. Waiters of a dead flight
/// observe [`Error::Interrupted`] instead of hanging on a stale entry.
struct ClaimGuard<D>
where
    D: DataSource,
{
    table: Arc<FlightTable<D>>,
    keys: Vec<D::Key>,
    done: bool,
}

impl<D> ClaimGuard<D>
where
    D: DataSource,
{
    fn new(table: Arc<FlightTable<D>>, keys: Vec<D::Key>) -> Self {
        Self {
            table,
            keys,
            done: false,
        }
    }

    /// Broadcast one result to every waiter of every claimed key.
    fn publish_all(&mut self, result: LoadResult<D::Value>) {
        self.resolve(|_| result.clone());
    }

    /// Broadcast per-key values, aligned to the claimed keys.
    fn publish_each(&mut self, values: Vec<Option<D::Value>>) {
        debug_assert_eq!(values.len(), self.keys.len());
        self.resolve(|index| Ok(values[index].clone()));
    }

    fn resolve<F>(&mut self, result: F)
    where
        F: Fn(usize) -> LoadResult<D::Value>,
    {
        if self.done {
            return;
        }
        self.done = true;
        let flights = {
            let mut pending = self.table.pending.lock();
            self.keys
                .iter()
                .map(|key| pending.remove(key))
                .collect::<Vec<_>>()
        };
        for (index, flight) in flights.into_iter().enumerate() {
            let Some(flight) = flight else { continue };
            for tx in flight.waiters {
                let _ = tx.send(result(index));
            }
        }
    }
}

impl<D> Drop for ClaimGuard<D>
where
    D: DataSource,
{
    fn drop(&mut self) {
        if !self.done {
            tracing::debug!("in-flight load dropped before publishing, interrupting waiters");
            self.resolve(|_| Err(Error::Interrupted));
        }
    }
}
