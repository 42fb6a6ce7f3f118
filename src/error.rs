//! Error types for admission control.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Boxed error produced by policy loaders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Unified error type for admission decisions.
///
/// A denied request is *not* an error — `add` returns `Ok(false)` for that.
/// These variants cover the two genuine failure modes: a caller bug (negative
/// amount) and an unreachable or broken policy backend.
#[derive(Debug, Clone)]
pub enum AdmissionError {
    /// A negative amount was passed to a meter. Indicates a caller bug, not a
    /// runtime condition; never retried.
    InvalidAmount {
        /// Value provided by caller.
        provided: i64,
    },
    /// The policy backend failed while resolving limits for a key.
    Load {
        /// Underlying loader failure.
        source: Arc<dyn std::error::Error + Send + Sync>,
    },
    /// The policy load did not complete within the configured deadline.
    LoadTimeout {
        /// Deadline that was exceeded.
        limit: Duration,
    },
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAmount { provided } => {
                write!(f, "amount must be >= 0 (got {})", provided)
            }
            Self::Load { source } => write!(f, "failed to load bucket policy: {}", source),
            Self::LoadTimeout { limit } => {
                write!(f, "bucket policy load timed out after {:?}", limit)
            }
        }
    }
}

impl std::error::Error for AdmissionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Load { source } => {
                let cause: &(dyn std::error::Error + 'static) = source.as_ref();
                Some(cause)
            }
            _ => None,
        }
    }
}

impl AdmissionError {
    /// Wrap a loader failure.
    pub fn load(source: impl Into<BoxError>) -> Self {
        Self::Load { source: Arc::from(source.into()) }
    }

    /// Check if this error is a caller-side negative amount.
    pub fn is_invalid_amount(&self) -> bool {
        matches!(self, Self::InvalidAmount { .. })
    }

    /// Check if this error came from the policy backend.
    pub fn is_load(&self) -> bool {
        matches!(self, Self::Load { .. })
    }

    /// Check if this error is a policy load deadline.
    pub fn is_load_timeout(&self) -> bool {
        matches!(self, Self::LoadTimeout { .. })
    }
}
