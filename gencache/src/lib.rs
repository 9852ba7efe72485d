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

//! A two-generation, read-through, hash-partitioned in-process cache.
//!
//! Entries live in one of two hash maps: a young Gen0 that takes all inserts
//! and promotions, and an old Gen1 holding the previous Gen0. A collection
//! discards Gen1 wholesale and demotes Gen0 by a map swap, so eviction is
//! coarse but costs no per-entry bookkeeping. On top of the store sit a
//! read-through layer with first-class negative caching, a single-flight
//! coordinator that de-duplicates concurrent loads of one key, and a
//! hash-partitioned wrapper that scales the whole stack across cores.
//!
//! ```
//! use std::sync::Arc;
//!
//! use gencache::prelude::*;
//!
//! struct Squares;
//!
//! impl DataSource for Squares {
//!     type Key = u64;
//!     type Value = u64;
//!
//!     fn load(&self, key: &u64) -> Result<Option<u64>> {
//!         Ok(Some(key * key))
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let cache = CacheBuilder::new(Arc::new(Squares))
//!     .with_gen0_limit(1024)
//!     .build()?;
//! assert_eq!(cache.get(&12)?, Some(144));
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod metrics;
pub mod partitioned;
pub mod read_through;
pub mod singleflight;
pub mod source;
pub mod store;

pub mod prelude;
pub use prelude::*;
