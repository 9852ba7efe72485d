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

use std::sync::atomic::{AtomicU64, Ordering};

/// Cache runtime counters.
///
/// All counters are updated with relaxed ordering; they are advisory and
/// never participate in any decision the cache makes.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Lookups answered from either generation.
    pub hit: AtomicU64,
    /// Lookups that found no entry in either generation.
    pub miss: AtomicU64,
    /// Entries inserted into Gen0 (sets, loads, promotions excluded).
    pub insert: AtomicU64,
    /// Entries removed by explicit invalidation.
    pub invalidate: AtomicU64,
    /// Generation swaps (size-triggered, time-triggered, and forced).
    pub collect: AtomicU64,
    /// Keys claimed for a source load.
    pub fetch: AtomicU64,
    /// Getters that queued on an in-flight load instead of issuing their own.
    pub queue: AtomicU64,
}

impl Metrics {
    /// Fold another counter set into this one.
    pub fn add(&mut self, other: &Metrics) {
        *self.hit.get_mut() += other.hit.load(Ordering::Relaxed);
        *self.miss.get_mut() += other.miss.load(Ordering::Relaxed);
        *self.insert.get_mut() += other.insert.load(Ordering::Relaxed);
        *self.invalidate.get_mut() += other.invalidate.load(Ordering::Relaxed);
        *self.collect.get_mut() += other.collect.load(Ordering::Relaxed);
        *self.fetch.get_mut() += other.fetch.load(Ordering::Relaxed);
        *self.queue.get_mut() += other.queue.load(Ordering::Relaxed);
    }
}
