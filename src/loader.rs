//! Pluggable policy sources.
//!
//! A [`Loader`] resolves the bucket parameters for a key — typically from a
//! configuration or policy store, possibly per-tier. The cache layer
//! guarantees at most one in-flight load per key; loaders only need to be
//! safe for concurrent calls with *distinct* keys.

use async_trait::async_trait;

use crate::bucket::BucketConfig;
use crate::error::BoxError;

/// Resolves current bucket policy for a key.
///
/// May be arbitrarily expensive. The cache decides when to call it: once on
/// first touch of a key, and again on each background refresh.
#[async_trait]
pub trait Loader<K>: Send + Sync {
    /// Produce the limits currently configured for `key`.
    async fn load(&self, key: &K) -> Result<BucketConfig, BoxError>;
}

/// Loader that hands every key the same limits.
#[derive(Debug, Clone, Copy)]
pub struct StaticLoader {
    config: BucketConfig,
}

impl StaticLoader {
    /// Create a loader serving `config` for all keys.
    pub fn new(config: BucketConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl<K: Sync> Loader<K> for StaticLoader {
    async fn load(&self, _key: &K) -> Result<BucketConfig, BoxError> {
        Ok(self.config)
    }
}

// Loaders are commonly shared between the gate and the code that manages
// policy; delegating through `Arc` keeps both sides on one instance.
#[async_trait]
impl<K, T> Loader<K> for std::sync::Arc<T>
where
    K: Sync,
    T: Loader<K> + ?Sized,
{
    async fn load(&self, key: &K) -> Result<BucketConfig, BoxError> {
        (**self).load(key).await
    }
}
