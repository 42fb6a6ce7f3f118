//! Lazily-decayed leaky-bucket meter.
//!
//! A [`LeakyBucket`] fills by `amount` on every granted [`add`](LeakyBucket::add)
//! and drains at a fixed whole-unit rate per elapsed second. Decay is applied
//! only when the bucket is observed — there is no background timer — so an
//! idle bucket costs nothing.

use std::sync::{Arc, Mutex};

use crate::clock::{Clock, MonotonicClock};
use crate::error::AdmissionError;

/// Validated bucket parameters: burst capacity and leak rate.
///
/// Both values are fixed for the lifetime of a bucket; changing either means
/// building a new bucket. Equality on this type is what the policy cache uses
/// to decide whether a refreshed policy is "the same" as the cached one.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfig {
    capacity: i64,
    rate: i64,
}

/// Errors produced when validating bucket parameters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BucketConfigError {
    /// Capacity must be > 0.
    #[error("capacity must be > 0 (got {provided})")]
    InvalidCapacity {
        /// Value provided by caller.
        provided: i64,
    },
    /// Leak rate must be > 0.
    #[error("rate must be > 0 (got {provided})")]
    InvalidRate {
        /// Value provided by caller.
        provided: i64,
    },
}

impl BucketConfig {
    /// Create a config with validation.
    pub fn new(capacity: i64, rate: i64) -> Result<Self, BucketConfigError> {
        if capacity <= 0 {
            return Err(BucketConfigError::InvalidCapacity { provided: capacity });
        }
        if rate <= 0 {
            return Err(BucketConfigError::InvalidRate { provided: rate });
        }
        Ok(Self { capacity, rate })
    }

    /// Maximum level the bucket may reach.
    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    /// Units drained per elapsed second.
    pub fn rate(&self) -> i64 {
        self.rate
    }
}

#[derive(Debug)]
struct BucketState {
    level: i64,
    /// Clock millis of the last decay application. Advanced by whole seconds
    /// only, so the sub-second remainder carries over to the next observation.
    last_update: u64,
}

/// A single-key leaky-bucket meter.
///
/// All observations serialize through the instance's own lock; concurrent
/// callers for the same key see a total order of decay-then-mutate steps.
/// Buckets for different keys share nothing.
#[derive(Debug)]
pub struct LeakyBucket {
    config: BucketConfig,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl LeakyBucket {
    /// Create an empty bucket on the default monotonic clock.
    pub fn new(config: BucketConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    /// Create an empty bucket on an explicit clock.
    pub fn with_clock(config: BucketConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self { config, state: Mutex::new(BucketState { level: 0, last_update: now }), clock }
    }

    /// Try to reserve `amount` units.
    ///
    /// Applies decay first, then grants iff the decayed level plus `amount`
    /// stays within capacity. On grant the level rises by `amount` and `true`
    /// is returned; otherwise state is left unchanged and `false` is returned.
    ///
    /// # Errors
    /// Returns [`AdmissionError::InvalidAmount`] for a negative `amount`; the
    /// bucket never clamps on the caller's behalf.
    #[allow(clippy::should_implement_trait)]
    pub fn add(&self, amount: i64) -> Result<bool, AdmissionError> {
        if amount < 0 {
            return Err(AdmissionError::InvalidAmount { provided: amount });
        }
        let mut state = self.state.lock().expect("bucket state poisoned");
        self.decay(&mut state);
        if state.level.saturating_add(amount) <= self.config.capacity {
            state.level += amount;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Current level after decay.
    ///
    /// The decayed state is persisted, so this read mutates `last_update` —
    /// intentional laziness, the same step `add` performs.
    pub fn level(&self) -> i64 {
        let mut state = self.state.lock().expect("bucket state poisoned");
        self.decay(&mut state);
        state.level
    }

    /// Parameters this bucket was built with.
    pub fn config(&self) -> BucketConfig {
        self.config
    }

    /// Maximum level the bucket may reach.
    pub fn capacity(&self) -> i64 {
        self.config.capacity
    }

    /// Units drained per elapsed second.
    pub fn rate(&self) -> i64 {
        self.config.rate
    }

    /// Drain `rate` units per whole elapsed second and advance `last_update`
    /// by exactly those seconds. Repeated calls with no time passage are
    /// no-ops, and the sub-second remainder never drifts.
    fn decay(&self, state: &mut BucketState) {
        let now = self.clock.now_millis();
        let elapsed_secs = now.saturating_sub(state.last_update) / 1000;
        if elapsed_secs == 0 {
            return;
        }
        state.last_update += elapsed_secs * 1000;
        let leaked = self.config.rate.saturating_mul(i64::try_from(elapsed_secs).unwrap_or(i64::MAX));
        state.level = state.level.saturating_sub(leaked).max(0);
    }
}
