//! Convenient re-exports for common Floodgate types.
pub use crate::{
    bucket::{BucketConfig, BucketConfigError, LeakyBucket},
    clock::{Clock, MonotonicClock},
    error::{AdmissionError, BoxError},
    loader::{Loader, StaticLoader},
    middleware::{AdmissionLayer, GateError, OperationPolicy},
    service::{Floodgate, FloodgateBuilder},
    store::{BucketStore, StoreConfig, StoreConfigError},
};
