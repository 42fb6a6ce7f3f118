#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Floodgate
//!
//! Per-principal admission control for async Rust: a lazily-decayed
//! leaky-bucket meter behind a keyed, refresh-ahead policy cache.
//!
//! ## The model
//!
//! Every principal (user, API key, client IP) gets its own [`LeakyBucket`]:
//! a counter that fills by the cost of each admitted operation and drains at
//! a fixed rate per second. Operations are admitted while the counter stays
//! within capacity. Decay is computed lazily at observation time — an idle
//! principal costs nothing.
//!
//! Buckets live in a keyed cache fed by a pluggable [`Loader`], so per-tier
//! limits can come from a configuration or policy store. The cache re-reads
//! policy in the background after a staleness interval — **without resetting
//! a principal's accumulated consumption unless the limits actually
//! changed** — and evicts principals that have gone idle.
//!
//! ## Quick start
//!
//! ```rust
//! use floodgate::{BucketConfig, Floodgate, StaticLoader};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Every principal gets a 10-unit burst draining 2 units per second.
//!     let loader = StaticLoader::new(BucketConfig::new(10, 2)?);
//!     let gate = Floodgate::builder(loader).build()?;
//!
//!     if gate.add(&"alice", 1).await? {
//!         // admitted: handle the request
//!     } else {
//!         // over limit: respond 429
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Metering a tower service
//!
//! [`AdmissionLayer`] wraps any `tower::Service`, scoping buckets by a key
//! extracted from each request and charging a typed per-operation cost. It
//! fails closed: when policy cannot be loaded, requests are denied rather
//! than let through unmetered.
//!
//! ## What this crate is not
//!
//! Limiting is per-process and in-memory: no cross-instance coordination, no
//! persistence across restarts, and decay is deliberately second-granular.

pub mod bucket;
pub mod clock;
pub mod error;
pub mod loader;
pub mod middleware;
pub mod prelude;
pub mod service;
pub mod store;

// Re-exports
pub use bucket::{BucketConfig, BucketConfigError, LeakyBucket};
pub use clock::{Clock, MonotonicClock};
pub use error::{AdmissionError, BoxError};
pub use loader::{Loader, StaticLoader};
pub use middleware::{AdmissionLayer, AdmissionService, GateError, OperationPolicy};
pub use service::{Floodgate, FloodgateBuilder, DEFAULT_IDLE_TTL, DEFAULT_REFRESH_INTERVAL};
pub use store::{BucketStore, StoreConfig, StoreConfigError};
