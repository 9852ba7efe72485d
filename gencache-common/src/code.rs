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

use std::hash::{BuildHasher, Hash};

/// Key trait for the cache.
///
/// Keys are cloned on insertion into the pending-load table and when events
/// carry them out of the cache, so cheaply cloneable keys are preferred.
pub trait Key: Send + Sync + 'static + Hash + Eq + Clone {}

/// Value trait for the cache.
///
/// Values are handed out by clone; wrap large payloads in `Arc`.
pub trait Value: Send + Sync + 'static + Clone {}

impl<T: Send + Sync + 'static + Hash + Eq + Clone> Key for T {}
impl<T: Send + Sync + 'static + Clone> Value for T {}

/// Hash builder trait.
pub trait HashBuilder: BuildHasher + Clone + Send + Sync + 'static {}

impl<T: BuildHasher + Clone + Send + Sync + 'static> HashBuilder for T {}
