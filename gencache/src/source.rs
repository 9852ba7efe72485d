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

use std::sync::Arc;

use futures::future::BoxFuture;
use gencache_common::code::{Key, Value};

use crate::error::Result;

/// Listener for invalidations pushed by a data source.
pub trait InvalidationListener<K>: Send + Sync + 'static {
    /// Called when the source reports that any cached value for `key` is
    /// stale.
    fn on_invalidate(&self, key: K);
}

/// The backing source a read-through cache loads from on a miss.
///
/// `Ok(None)` means the key is known to be absent; the cache remembers the
/// absence (negative caching), so sources must reserve `Err` for real
/// failures.
///
/// The batch methods must return output aligned to the input in length and
/// order. The asynchronous methods default to bridging the synchronous
/// path; sources backed by async IO should override them.
pub trait DataSource: Send + Sync + 'static {
    /// Associated key type.
    type Key: Key;
    /// Associated value type.
    type Value: Value;

    /// Look up a single key.
    fn load(&self, key: &Self::Key) -> Result<Option<Self::Value>>;

    /// Look up a batch of keys.
    fn load_batch(&self, keys: &[Self::Key]) -> Result<Vec<Option<Self::Value>>> {
        keys.iter().map(|key| self.load(key)).collect()
    }

    /// Asynchronous variant of [`DataSource::load`].
    fn load_async(&self, key: &Self::Key) -> BoxFuture<'_, Result<Option<Self::Value>>> {
        Box::pin(futures::future::ready(self.load(key)))
    }

    /// Asynchronous variant of [`DataSource::load_batch`].
    fn load_batch_async(&self, keys: &[Self::Key]) -> BoxFuture<'_, Result<Vec<Option<Self::Value>>>> {
        Box::pin(futures::future::ready(self.load_batch(keys)))
    }

    /// Register a listener for source-side invalidations.
    ///
    /// The default implementation never signals.
    fn subscribe(&self, _listener: Arc<dyn InvalidationListener<Self::Key>>) {}
}
