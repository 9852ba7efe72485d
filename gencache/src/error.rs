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

/// Result type over [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by cache construction and read-through loads.
///
/// The error is cheaply cloneable so that a single-flight producer can
/// broadcast its outcome to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Invalid cache configuration. Reported at construction only.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The backing data source failed. Nothing is cached for the key, not
    /// even a negative entry.
    #[error("data source error: {0}")]
    Source(#[source] Arc<dyn std::error::Error + Send + Sync>),
    /// The source returned a batch whose length does not match the request.
    #[error("data source returned {got} results for {expected} keys")]
    MisalignedBatch {
        /// Number of keys requested.
        expected: usize,
        /// Number of results returned.
        got: usize,
    },
    /// An in-flight load died before publishing a result.
    #[error("load interrupted before a result was published")]
    Interrupted,
}

impl Error {
    /// Wrap an arbitrary data source failure.
    pub fn source<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Source(Arc::new(err))
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }
}
