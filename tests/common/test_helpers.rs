//! Shared fixtures for integration tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use floodgate::{BoxError, BucketConfig, Clock, Loader};

/// Clock advanced explicitly by the test.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { now: Arc::new(AtomicU64::new(0)) }
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Loader that counts invocations and serves whatever config it is told to.
#[derive(Debug)]
pub struct RecordingLoader {
    config: Mutex<BucketConfig>,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    fail: AtomicBool,
}

impl RecordingLoader {
    pub fn new(config: BucketConfig) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(config),
            calls: AtomicUsize::new(0),
            delay: Mutex::new(None),
            fail: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_config(&self, config: BucketConfig) {
        *self.config.lock().unwrap() = config;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl<K: Sync> Loader<K> for RecordingLoader {
    async fn load(&self, _key: &K) -> Result<BucketConfig, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err("policy backend unavailable".into());
        }
        Ok(*self.config.lock().unwrap())
    }
}

/// Poll `cond` until it holds, panicking after two seconds of real time.
/// Background refreshes complete on their own schedule; tests observe them
/// rather than assume an ordering.
pub async fn eventually(mut cond: impl FnMut() -> bool, label: &str) {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(std::time::Instant::now() < deadline, "timed out waiting for {}", label);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
