//! Error taxonomy for the DNC lookup core.
//!
//! One crate-wide error enum keyed to the behavior callers need: which
//! failures are worth retrying, which are a config problem, and which are
//! just a miss. The KVS boundary has its own small error type in `kv`;
//! cache code downgrades those to misses on read paths.

/// Errors produced by cache, provider, and manager operations.
#[derive(Debug, thiserror::Error)]
pub enum DncError {
    /// Missing cache key or unknown entity. Not an error to callers of the
    /// manager, only to internal paths.
    #[error("not found: {0}")]
    NotFound(String),

    /// Rejected at the boundary: bad phone format, bad range, empty input.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// 401 from a registry or a failed token acquisition.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Local token bucket saturation or an upstream 429.
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Transport failure or cancelled/timed-out request.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Malformed payload from a registry.
    #[error("invalid response from provider: {0}")]
    InvalidResponse(String),

    /// Upstream 5xx or an open circuit.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Missing or invalid configuration keys.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Every provider in the requested type order failed; carries the last
    /// underlying error.
    #[error("all providers failed: {last}")]
    AllProvidersFailed { last: Box<DncError> },

    /// Cache serialization, KVS transport, or other internal faults.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DncError {
    /// Whether a caller may reasonably retry the operation after backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            DncError::RateLimitExceeded(_)
            | DncError::ConnectionFailed(_)
            | DncError::ProviderUnavailable(_) => true,
            DncError::AllProvidersFailed { last } => last.is_retryable(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DncError::NotFound(_))
    }

    /// Wrap this error as the terminal failure of a full failover pass.
    pub fn into_all_providers_failed(self) -> DncError {
        DncError::AllProvidersFailed { last: Box::new(self) }
    }
}

impl From<reqwest::Error> for DncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DncError::ConnectionFailed(format!("request timed out: {err}"))
        } else if err.is_decode() {
            DncError::InvalidResponse(err.to_string())
        } else {
            DncError::ConnectionFailed(err.to_string())
        }
    }
}

/// Result type used throughout the crate.
pub type DncResult<T> = Result<T, DncError>;
