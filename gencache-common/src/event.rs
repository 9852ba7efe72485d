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

use std::{marker::PhantomData, sync::Arc};

use hashbrown::{hash_map::DefaultHashBuilder, HashMap};

use crate::code::{HashBuilder, Key, Value};

/// Trait for the customized event listener.
///
/// Events are delivered after the store lock is released and are best-effort:
/// a panicking listener is caught and the event dropped.
pub trait EventListener: Send + Sync + 'static {
    /// Associated key type.
    type Key;
    /// Associated value type.
    type Value;
    /// Associated hash builder type.
    type HashBuilder;

    /// Called when an entry is removed by an explicit invalidation.
    ///
    /// Fires exactly once per removed entry; never fires for entries lost to
    /// a collection.
    #[allow(unused_variables)]
    fn on_invalidated(&self, key: Self::Key)
    where
        Self::Key: Key,
    {
    }

    /// Called when a collection or a clear drops entries from the cache.
    ///
    /// The map carries every dropped entry, cached absences included. It is
    /// the dropped generation itself, handed over without copying.
    #[allow(unused_variables)]
    fn on_evicted(&self, entries: HashMap<Self::Key, Option<Self::Value>, Self::HashBuilder>)
    where
        Self::Key: Key,
        Self::Value: Value,
        Self::HashBuilder: HashBuilder,
    {
    }
}

/// The default listener that ignores all events.
pub struct DefaultEventListener<K, V, S = DefaultHashBuilder>(PhantomData<(K, V, S)>);

impl<K, V, S> Default for DefaultEventListener<K, V, S> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<K, V, S> EventListener for DefaultEventListener<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    type Key = K;
    type Value = V;
    type HashBuilder = S;
}

/// A shared listener can be cloned into several stores (one per partition).
impl<L> EventListener for Arc<L>
where
    L: EventListener,
{
    type Key = L::Key;
    type Value = L::Value;
    type HashBuilder = L::HashBuilder;

    fn on_invalidated(&self, key: Self::Key)
    where
        Self::Key: Key,
    {
        self.as_ref().on_invalidated(key)
    }

    fn on_evicted(&self, entries: HashMap<Self::Key, Option<Self::Value>, Self::HashBuilder>)
    where
        Self::Key: Key,
        Self::Value: Value,
        Self::HashBuilder: HashBuilder,
    {
        self.as_ref().on_evicted(entries)
    }
}
