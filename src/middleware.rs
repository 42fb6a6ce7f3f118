//! Tower middleware enforcing admission control per request.
//!
//! [`AdmissionLayer`] wraps a service with a [`Floodgate`]: each request is
//! resolved to a principal key, charged the operation's configured cost, and
//! forwarded only if the gate admits it. The layer fails closed — if policy
//! cannot be loaded there is no admission decision, so the request is denied
//! rather than let through unmetered.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tower_layer::Layer;
use tower_service::Service;
use tracing::warn;

use crate::error::AdmissionError;
use crate::loader::Loader;
use crate::service::Floodgate;

/// Typed per-operation cost, resolved once at startup.
///
/// Each protected operation carries its own policy; there is no per-request
/// parsing of cost metadata. A negative configured cost is a configuration
/// error and is clamped to zero here — the gate itself never clamps.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationPolicy {
    default_cost: i64,
}

impl OperationPolicy {
    /// Create a policy charging `default_cost` units per request.
    pub fn new(default_cost: i64) -> Self {
        if default_cost < 0 {
            warn!(provided = default_cost, "negative operation cost clamped to 0");
            return Self { default_cost: 0 };
        }
        Self { default_cost }
    }

    /// Units charged per request.
    pub fn default_cost(&self) -> i64 {
        self.default_cost
    }
}

impl Default for OperationPolicy {
    /// One unit per request.
    fn default() -> Self {
        Self { default_cost: 1 }
    }
}

/// Error type produced by [`AdmissionService`].
#[derive(Debug, Clone)]
pub enum GateError<E> {
    /// The principal exceeded its limits. The layer above conventionally maps
    /// this to HTTP 429.
    Denied {
        /// Units the denied request would have cost.
        cost: i64,
    },
    /// Policy could not be resolved; the request was denied rather than let
    /// through unmetered.
    Load(AdmissionError),
    /// The wrapped service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied { cost } => write!(f, "rate limit exceeded (cost {})", cost),
            Self::Load(err) => write!(f, "admission unavailable: {}", err),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GateError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Denied { .. } => None,
            Self::Load(err) => Some(err),
            Self::Inner(e) => Some(e),
        }
    }
}

impl<E> GateError<E> {
    /// Check if the request was denied for being over limit.
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }

    /// Check if the denial came from a policy load failure.
    pub fn is_load(&self) -> bool {
        matches!(self, Self::Load(_))
    }

    /// Get the inner error if the wrapped service failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// A layer that meters requests through a shared [`Floodgate`].
pub struct AdmissionLayer<K, L, F> {
    gate: Floodgate<K, L>,
    policy: OperationPolicy,
    key_fn: Arc<F>,
}

impl<K, L, F> AdmissionLayer<K, L, F> {
    /// Create a layer charging `policy` per request, scoping buckets by the
    /// key `key_fn` extracts from each request.
    pub fn new(gate: Floodgate<K, L>, policy: OperationPolicy, key_fn: F) -> Self {
        Self { gate, policy, key_fn: Arc::new(key_fn) }
    }
}

impl<K, L, F> Clone for AdmissionLayer<K, L, F> {
    fn clone(&self) -> Self {
        Self { gate: self.gate.clone(), policy: self.policy, key_fn: self.key_fn.clone() }
    }
}

impl<K, L, F> fmt::Debug for AdmissionLayer<K, L, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionLayer").field("policy", &self.policy).finish_non_exhaustive()
    }
}

impl<S, K, L, F> Layer<S> for AdmissionLayer<K, L, F> {
    type Service = AdmissionService<S, K, L, F>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            gate: self.gate.clone(),
            policy: self.policy,
            key_fn: self.key_fn.clone(),
        }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
pub struct AdmissionService<S, K, L, F> {
    inner: S,
    gate: Floodgate<K, L>,
    policy: OperationPolicy,
    key_fn: Arc<F>,
}

impl<S: Clone, K, L, F> Clone for AdmissionService<S, K, L, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            gate: self.gate.clone(),
            policy: self.policy,
            key_fn: self.key_fn.clone(),
        }
    }
}

impl<S, K, L, F> fmt::Debug for AdmissionService<S, K, L, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionService").field("policy", &self.policy).finish_non_exhaustive()
    }
}

impl<S, K, L, F, Req> Service<Req> for AdmissionService<S, K, L, F>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    L: Loader<K> + 'static,
    F: Fn(&Req) -> K,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = GateError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GateError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let gate = self.gate.clone();
        let mut inner = self.inner.clone();
        let cost = self.policy.default_cost();
        let key = (self.key_fn)(&req);

        Box::pin(async move {
            // A zero-cost operation needs no admission decision.
            if cost == 0 {
                return inner.call(req).await.map_err(GateError::Inner);
            }
            match gate.add(&key, cost).await {
                Ok(true) => inner.call(req).await.map_err(GateError::Inner),
                Ok(false) => Err(GateError::Denied { cost }),
                Err(err) => Err(GateError::Load(err)),
            }
        })
    }
}
