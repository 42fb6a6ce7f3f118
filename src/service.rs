//! Public admission-control facade.

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::error::AdmissionError;
use crate::loader::Loader;
use crate::store::{BucketStore, StoreConfig, StoreConfigError};

/// Default staleness threshold for background policy refresh.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
/// Default inactivity window before a principal's bucket is evicted.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(600);

/// Per-principal admission control: one question, `add(key, amount)` — may
/// this principal spend `amount` units right now?
///
/// Composes a [`Loader`] with a keyed bucket cache. Handles share the same
/// underlying store via `Arc`, so clones observe and affect the same
/// accumulated consumption.
pub struct Floodgate<K, L> {
    store: Arc<BucketStore<K, L>>,
}

impl<K, L> Clone for Floodgate<K, L> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone() }
    }
}

impl<K, L> fmt::Debug for Floodgate<K, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Floodgate").field("store", &self.store).finish()
    }
}

impl<K, L> Floodgate<K, L>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    L: Loader<K> + 'static,
{
    /// Start building a gate over `loader`.
    pub fn builder(loader: L) -> FloodgateBuilder<K, L> {
        FloodgateBuilder {
            loader,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            idle_ttl: DEFAULT_IDLE_TTL,
            load_timeout: None,
            clock: Arc::new(MonotonicClock::default()),
            _key: PhantomData,
        }
    }

    /// Try to reserve `amount` units for `key`.
    ///
    /// `Ok(false)` is the ordinary over-limit outcome, not an error. No
    /// bucket reference is retained across calls.
    ///
    /// # Errors
    /// [`AdmissionError::InvalidAmount`] for a negative `amount`;
    /// [`AdmissionError::Load`] / [`AdmissionError::LoadTimeout`] when the
    /// policy for a first-touched key cannot be resolved.
    pub async fn add(&self, key: &K, amount: i64) -> Result<bool, AdmissionError> {
        self.store.add(key, amount).await
    }

    /// Current level for `key`, or `None` if no bucket is resident.
    pub fn level(&self, key: &K) -> Option<i64> {
        self.store.level(key)
    }

    /// Number of principals currently tracked.
    pub fn tracked(&self) -> usize {
        self.store.len()
    }
}

/// Builder for [`Floodgate`], validating the cache tuning on `build`.
pub struct FloodgateBuilder<K, L> {
    loader: L,
    refresh_interval: Duration,
    idle_ttl: Duration,
    load_timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
    _key: PhantomData<fn(K)>,
}

impl<K, L> fmt::Debug for FloodgateBuilder<K, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FloodgateBuilder")
            .field("refresh_interval", &self.refresh_interval)
            .field("idle_ttl", &self.idle_ttl)
            .field("load_timeout", &self.load_timeout)
            .finish_non_exhaustive()
    }
}

impl<K, L> FloodgateBuilder<K, L>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    L: Loader<K> + 'static,
{
    /// How long a cached policy may serve before being re-read in the
    /// background. Typically much shorter than the idle TTL.
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// How long an untouched principal stays resident before its bucket is
    /// dropped (and its consumption forgotten).
    pub fn idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl;
        self
    }

    /// Deadline applied to every loader call, first touch and refresh alike.
    pub fn load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = Some(timeout);
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the gate, validating the tuning.
    ///
    /// # Errors
    /// Returns [`StoreConfigError`] for a zero interval/TTL, a refresh
    /// interval exceeding the idle TTL, or a zero load timeout.
    pub fn build(self) -> Result<Floodgate<K, L>, StoreConfigError> {
        let config = StoreConfig::new(self.refresh_interval, self.idle_ttl, self.load_timeout)?;
        Ok(Floodgate { store: Arc::new(BucketStore::new(self.loader, config, self.clock)) })
    }
}
