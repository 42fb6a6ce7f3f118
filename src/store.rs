//! Keyed, refresh-ahead bucket cache.
//!
//! One bucket per key, created on first touch via the [`Loader`] and kept
//! resident while the key stays active. Policy is re-read in the background
//! after [`refresh_interval`](StoreConfig::refresh_interval) — without ever
//! resetting a principal's accumulated consumption unless the policy actually
//! changed — and entries idle past [`idle_ttl`](StoreConfig::idle_ttl) are
//! dropped entirely, so the next touch is a full reload from an empty bucket.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::bucket::{BucketConfig, LeakyBucket};
use crate::clock::Clock;
use crate::error::AdmissionError;
use crate::loader::Loader;

/// Validated cache tuning: how often policy is re-read and how long an
/// untouched entry stays resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    refresh_interval: Duration,
    idle_ttl: Duration,
    load_timeout: Option<Duration>,
}

/// Errors produced when validating cache tuning.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreConfigError {
    /// Refresh interval must be > 0.
    #[error("refresh_interval must be > 0")]
    InvalidRefreshInterval,
    /// Idle TTL must be > 0.
    #[error("idle_ttl must be > 0")]
    InvalidIdleTtl,
    /// An entry must live long enough to be refreshed at least once.
    #[error("refresh_interval ({refresh_interval:?}) must not exceed idle_ttl ({idle_ttl:?})")]
    RefreshExceedsIdle {
        /// Configured refresh interval.
        refresh_interval: Duration,
        /// Configured idle TTL.
        idle_ttl: Duration,
    },
    /// Load timeout must be > 0 when set.
    #[error("load_timeout must be > 0 when set")]
    InvalidLoadTimeout,
}

impl StoreConfig {
    /// Create a config with validation.
    pub fn new(
        refresh_interval: Duration,
        idle_ttl: Duration,
        load_timeout: Option<Duration>,
    ) -> Result<Self, StoreConfigError> {
        if refresh_interval.is_zero() {
            return Err(StoreConfigError::InvalidRefreshInterval);
        }
        if idle_ttl.is_zero() {
            return Err(StoreConfigError::InvalidIdleTtl);
        }
        if refresh_interval > idle_ttl {
            return Err(StoreConfigError::RefreshExceedsIdle { refresh_interval, idle_ttl });
        }
        if load_timeout.is_some_and(|limit| limit.is_zero()) {
            return Err(StoreConfigError::InvalidLoadTimeout);
        }
        Ok(Self { refresh_interval, idle_ttl, load_timeout })
    }

    /// Staleness threshold after which policy is re-read in the background.
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Inactivity window after which an entry is evicted outright.
    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }

    /// Optional deadline applied to every loader call.
    pub fn load_timeout(&self) -> Option<Duration> {
        self.load_timeout
    }
}

/// A resident cache entry.
///
/// `loaded_at` tracks when this slot was last (re)populated from the loader —
/// independent of the bucket's own decay clock. A refresh that finds the
/// policy unchanged advances `loaded_at` only; the bucket object (and with it
/// the accumulated level) stays put.
#[derive(Debug)]
struct Entry {
    bucket: ArcSwap<LeakyBucket>,
    loaded_at: AtomicU64,
    last_access: AtomicU64,
    refreshing: AtomicBool,
}

impl Entry {
    fn new(bucket: LeakyBucket, now: u64) -> Self {
        Self {
            bucket: ArcSwap::from_pointee(bucket),
            loaded_at: AtomicU64::new(now),
            last_access: AtomicU64::new(now),
            refreshing: AtomicBool::new(false),
        }
    }
}

/// Map slot. The cell coalesces concurrent first touches: one loader call,
/// one entry shared by all waiters. A slot whose init failed stays empty and
/// is retried on the next touch.
#[derive(Debug)]
struct Slot {
    cell: OnceCell<Arc<Entry>>,
    created_at: u64,
}

impl Slot {
    fn new(now: u64) -> Self {
        Self { cell: OnceCell::new(), created_at: now }
    }
}

/// Keyed bucket cache with background policy refresh and idle eviction.
pub struct BucketStore<K, L> {
    slots: Mutex<HashMap<K, Arc<Slot>>>,
    loader: Arc<L>,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    last_sweep: AtomicU64,
}

impl<K, L> fmt::Debug for BucketStore<K, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketStore").field("config", &self.config).finish_non_exhaustive()
    }
}

impl<K, L> BucketStore<K, L>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    L: Loader<K> + 'static,
{
    /// Create a store over `loader` with the given tuning and clock.
    pub fn new(loader: L, config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self {
            slots: Mutex::new(HashMap::new()),
            loader: Arc::new(loader),
            config,
            clock,
            last_sweep: AtomicU64::new(now),
        }
    }

    /// Try to reserve `amount` units against the bucket for `key`.
    ///
    /// Resolves the entry (loading policy on first touch), delegates to the
    /// bucket, then schedules a background refresh if the entry has gone
    /// stale. The refresh never blocks this call or alters its result.
    ///
    /// # Errors
    /// [`AdmissionError::InvalidAmount`] for a negative `amount`;
    /// [`AdmissionError::Load`] / [`AdmissionError::LoadTimeout`] when a
    /// first-touch load fails — background refresh failures are logged and
    /// never surface here.
    pub async fn add(&self, key: &K, amount: i64) -> Result<bool, AdmissionError> {
        let now = self.clock.now_millis();
        self.maybe_sweep(now);
        let slot = self.slot_for(key, now);
        let entry = slot.cell.get_or_try_init(|| self.first_touch(key)).await?.clone();
        entry.last_access.store(now, Ordering::Release);
        let admitted = entry.bucket.load().add(amount)?;
        if !admitted {
            debug!(key = ?key, amount, "admission denied");
        }
        self.maybe_refresh(key, &entry, now);
        Ok(admitted)
    }

    /// Current level for `key`, or `None` if no bucket is resident.
    ///
    /// An observation: decay is applied and persisted. Never loads policy.
    pub fn level(&self, key: &K) -> Option<i64> {
        let entry = {
            let slots = self.slots.lock().expect("bucket store map poisoned");
            slots.get(key).and_then(|slot| slot.cell.get().cloned())
        };
        entry.map(|entry| entry.bucket.load().level())
    }

    /// Number of keys currently tracked (including in-flight first touches).
    pub fn len(&self) -> usize {
        self.slots.lock().expect("bucket store map poisoned").len()
    }

    /// True when no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn first_touch(&self, key: &K) -> Result<Arc<Entry>, AdmissionError> {
        let config = self.load_policy(key).await?;
        let now = self.clock.now_millis();
        debug!(key = ?key, capacity = config.capacity(), rate = config.rate(), "loaded bucket policy");
        let bucket = LeakyBucket::with_clock(config, self.clock.clone());
        Ok(Arc::new(Entry::new(bucket, now)))
    }

    async fn load_policy(&self, key: &K) -> Result<BucketConfig, AdmissionError> {
        match self.config.load_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.loader.load(key)).await {
                Ok(result) => result.map_err(AdmissionError::load),
                Err(_) => Err(AdmissionError::LoadTimeout { limit }),
            },
            None => self.loader.load(key).await.map_err(AdmissionError::load),
        }
    }

    /// Resolve the slot for `key`, treating an entry idle past the TTL as
    /// absent: it is dropped here, before initialization, so the touch that
    /// found it expired becomes a genuine first touch.
    fn slot_for(&self, key: &K, now: u64) -> Arc<Slot> {
        let idle_millis = duration_millis(self.config.idle_ttl);
        let mut slots = self.slots.lock().expect("bucket store map poisoned");
        if let Some(slot) = slots.get(key) {
            let expired = slot.cell.get().is_some_and(|entry| {
                now.saturating_sub(entry.last_access.load(Ordering::Acquire)) >= idle_millis
            });
            if !expired {
                return slot.clone();
            }
            debug!(key = ?key, "evicting idle bucket");
        }
        let slot = Arc::new(Slot::new(now));
        slots.insert(key.clone(), slot.clone());
        slot
    }

    /// Schedule a background policy refresh when the entry has gone stale.
    /// At most one refresh per entry is in flight at a time.
    fn maybe_refresh(&self, key: &K, entry: &Arc<Entry>, now: u64) {
        let refresh_millis = duration_millis(self.config.refresh_interval);
        if now.saturating_sub(entry.loaded_at.load(Ordering::Acquire)) < refresh_millis {
            return;
        }
        if entry.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }
        let loader = self.loader.clone();
        let clock = self.clock.clone();
        let load_timeout = self.config.load_timeout;
        let key = key.clone();
        let entry = entry.clone();
        tokio::spawn(async move {
            refresh_entry(loader, clock, load_timeout, key, entry).await;
        });
    }

    /// Opportunistic full sweep, at most once per idle TTL: reclaims entries
    /// for keys that were abandoned entirely (the per-key check in
    /// [`slot_for`] only fires when the same key comes back).
    fn maybe_sweep(&self, now: u64) {
        let idle_millis = duration_millis(self.config.idle_ttl);
        let last = self.last_sweep.load(Ordering::Acquire);
        if now.saturating_sub(last) < idle_millis {
            return;
        }
        if self
            .last_sweep
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let mut slots = self.slots.lock().expect("bucket store map poisoned");
        let before = slots.len();
        slots.retain(|_, slot| match slot.cell.get() {
            Some(entry) => {
                now.saturating_sub(entry.last_access.load(Ordering::Acquire)) < idle_millis
            }
            // Slots that never initialized (failed loads) age out by creation time.
            None => now.saturating_sub(slot.created_at) < idle_millis,
        });
        let evicted = before - slots.len();
        if evicted > 0 {
            debug!(evicted, tracked = slots.len(), "swept idle buckets");
        }
    }
}

/// Apply one background refresh to `entry`.
///
/// Unchanged policy keeps the existing bucket object — re-reading the same
/// limits must never reset a principal's accumulated consumption — and only
/// advances `loaded_at`. A changed policy swaps in a fresh bucket at level 0.
/// A failed or timed-out load leaves the entry exactly as it was.
async fn refresh_entry<K, L>(
    loader: Arc<L>,
    clock: Arc<dyn Clock>,
    load_timeout: Option<Duration>,
    key: K,
    entry: Arc<Entry>,
) where
    K: fmt::Debug + Send + Sync,
    L: Loader<K>,
{
    let loaded = match load_timeout {
        Some(limit) => match tokio::time::timeout(limit, loader.load(&key)).await {
            Ok(result) => result,
            Err(_) => Err(format!("refresh timed out after {:?}", limit).into()),
        },
        None => loader.load(&key).await,
    };
    match loaded {
        Ok(candidate) => {
            let now = clock.now_millis();
            let unchanged = candidate == entry.bucket.load().config();
            if unchanged {
                debug!(key = ?key, "policy unchanged on refresh");
            } else {
                info!(
                    key = ?key,
                    capacity = candidate.capacity(),
                    rate = candidate.rate(),
                    "policy changed; replacing bucket"
                );
                entry.bucket.store(Arc::new(LeakyBucket::with_clock(candidate, clock)));
            }
            entry.loaded_at.store(now, Ordering::Release);
        }
        Err(err) => {
            warn!(key = ?key, error = %err, "background policy refresh failed; keeping cached bucket");
        }
    }
    entry.refreshing.store(false, Ordering::Release);
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::loader::StaticLoader;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(AtomicU64::new(0)) }
        }

        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    #[derive(Debug)]
    struct FlakyLoader {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl FlakyLoader {
        fn new() -> Self {
            Self { calls: AtomicUsize::new(0), fail: AtomicBool::new(false) }
        }
    }

    #[async_trait]
    impl<K: Sync> Loader<K> for FlakyLoader {
        async fn load(&self, _key: &K) -> Result<BucketConfig, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err("policy backend unavailable".into());
            }
            Ok(BucketConfig::new(100, 1).unwrap())
        }
    }

    fn tuning(refresh_secs: u64, idle_secs: u64) -> StoreConfig {
        StoreConfig::new(
            Duration::from_secs(refresh_secs),
            Duration::from_secs(idle_secs),
            None,
        )
        .unwrap()
    }

    #[test]
    fn rejects_invalid_tuning() {
        assert_eq!(
            StoreConfig::new(Duration::ZERO, Duration::from_secs(1), None),
            Err(StoreConfigError::InvalidRefreshInterval)
        );
        assert_eq!(
            StoreConfig::new(Duration::from_secs(1), Duration::ZERO, None),
            Err(StoreConfigError::InvalidIdleTtl)
        );
        assert!(matches!(
            StoreConfig::new(Duration::from_secs(10), Duration::from_secs(5), None),
            Err(StoreConfigError::RefreshExceedsIdle { .. })
        ));
        assert_eq!(
            StoreConfig::new(Duration::from_secs(1), Duration::from_secs(5), Some(Duration::ZERO)),
            Err(StoreConfigError::InvalidLoadTimeout)
        );
    }

    #[tokio::test]
    async fn failed_first_touch_is_retried_on_next_add() {
        let clock = ManualClock::new();
        let loader = FlakyLoader::new();
        loader.fail.store(true, Ordering::SeqCst);
        let store = BucketStore::new(loader, tuning(60, 600), Arc::new(clock.clone()));

        let err = store.add(&"alice", 1).await.unwrap_err();
        assert!(err.is_load());
        assert!(store.level(&"alice").is_none());

        store.loader.fail.store(false, Ordering::SeqCst);
        assert!(store.add(&"alice", 1).await.unwrap());
        assert_eq!(store.loader.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.level(&"alice"), Some(1));
    }

    #[tokio::test]
    async fn sweep_reclaims_abandoned_keys() {
        let clock = ManualClock::new();
        let config = BucketConfig::new(10, 1).unwrap();
        let store =
            BucketStore::new(StaticLoader::new(config), tuning(60, 600), Arc::new(clock.clone()));

        assert!(store.add(&"alice", 1).await.unwrap());
        assert!(store.add(&"bob", 1).await.unwrap());
        assert_eq!(store.len(), 2);

        // Both idle out; the next touch of any key sweeps the rest.
        clock.advance(601_000);
        assert!(store.add(&"alice", 1).await.unwrap());
        assert_eq!(store.len(), 1);
        assert!(store.level(&"bob").is_none());
    }

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_refresh_warns_and_preserves_entry() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let clock = ManualClock::new();
        let store = BucketStore::new(FlakyLoader::new(), tuning(10, 600), Arc::new(clock.clone()));

        assert!(store.add(&"alice", 50).await.unwrap());
        store.loader.fail.store(true, Ordering::SeqCst);

        clock.advance(10_000);
        assert!(store.add(&"alice", 0).await.unwrap());
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while store.loader.calls.load(Ordering::SeqCst) < 2 {
            assert!(std::time::Instant::now() < deadline, "refresh never ran");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        // Ten seconds of decay drained ten units; the failed refresh touched
        // nothing else.
        assert_eq!(store.level(&"alice"), Some(40));

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(
            logs.contains("background policy refresh failed"),
            "warning should be emitted when a refresh fails"
        );
    }

    #[tokio::test]
    async fn idle_entry_is_replaced_before_reuse() {
        let clock = ManualClock::new();
        let config = BucketConfig::new(10, 1).unwrap();
        let store =
            BucketStore::new(StaticLoader::new(config), tuning(60, 600), Arc::new(clock.clone()));

        assert!(store.add(&"alice", 7).await.unwrap());
        clock.advance(600_000);
        // Idle TTL elapsed: this touch starts over from an empty bucket even
        // though ten minutes of decay would also have drained the old one.
        assert!(store.add(&"alice", 1).await.unwrap());
        assert_eq!(store.level(&"alice"), Some(1));
        assert_eq!(store.len(), 1);
    }
}
