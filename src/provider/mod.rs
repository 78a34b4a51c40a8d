//! Provider clients: the uniform contract every registry client exposes,
//! plus the shared per-client runtime (circuit breaker, token bucket,
//! metrics, connection state) they are all built on.

pub mod circuit;
pub mod config;
pub mod federal;
pub mod http;
pub mod internal;
pub mod manager;
pub mod metrics;
pub mod ratelimit;
pub mod state;
pub mod wireless;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use federal::{FederalConfig, FederalProvider};
pub use internal::InternalProvider;
pub use manager::{
    LoadBalanceStrategy, ManagerBatchOutcome, ProviderManager, ProviderManagerConfig,
};
pub use metrics::{ClientMetrics, ClientMetricsSnapshot};
pub use ratelimit::TokenBucket;
pub use state::{StateProvider, StateProviderConfig};
pub use wireless::{WirelessConfig, WirelessProvider};

use crate::error::{DncError, DncResult};
use crate::model::{DncCheckResult, ProviderHealth, QuotaStatus, RateLimitInfo, SyncResult};
use crate::phone::PhoneNumber;

/// The four registry families a client can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Federal,
    Wireless,
    State,
    Internal,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Federal => "federal",
            Self::Wireless => "wireless",
            Self::State => "state",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = DncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "federal" => Ok(Self::Federal),
            "wireless" => Ok(Self::Wireless),
            "state" => Ok(Self::State),
            "internal" => Ok(Self::Internal),
            other => Err(DncError::InvalidRequest(format!(
                "unknown provider type {other:?}"
            ))),
        }
    }
}

/// Batch result carrying whatever succeeded before a failing chunk.
#[derive(Debug, Default)]
pub struct BatchCheckOutcome {
    pub results: Vec<DncCheckResult>,
    /// Set when a chunk failed; the results above are the accumulated
    /// successes up to that chunk.
    pub error: Option<DncError>,
}

impl BatchCheckOutcome {
    pub fn ok(results: Vec<DncCheckResult>) -> Self {
        Self { results, error: None }
    }
}

/// Capability set shared by every registry client. The provider manager
/// owns only this abstraction.
#[async_trait]
pub trait DncProvider: Send + Sync {
    fn provider_type(&self) -> ProviderType;
    fn provider_name(&self) -> &str;

    /// Probe the registry's health endpoint and report client state.
    async fn health_check(&self) -> DncResult<ProviderHealth>;

    /// Look up one number against this registry.
    async fn check_number(&self, phone: &PhoneNumber) -> DncResult<DncCheckResult>;

    /// Look up many numbers, chunked by the provider's batch size. A chunk
    /// failure aborts the remaining chunks; accumulated successes are
    /// returned alongside the error.
    async fn batch_check_numbers(&self, phones: &[PhoneNumber]) -> BatchCheckOutcome;

    /// Pull registry changes since a checkpoint time.
    async fn get_incremental_updates(&self, since: DateTime<Utc>) -> DncResult<SyncResult>;

    /// Full snapshot; by default an incremental pull since the epoch.
    async fn get_full_snapshot(&self) -> DncResult<SyncResult> {
        self.get_incremental_updates(DateTime::UNIX_EPOCH).await
    }

    /// Acquire an authenticated session with the registry.
    async fn connect(&self) -> DncResult<()>;
    async fn disconnect(&self) -> DncResult<()>;
    /// Connected, with an unexpired token where the auth scheme has one.
    async fn is_connected(&self) -> bool;

    /// Check a config map for the provider's required keys without
    /// applying it.
    fn validate_config(&self, config: &HashMap<String, String>) -> DncResult<()>;
    /// Apply a config map. Secret changes rotate the session.
    async fn set_config(&self, config: HashMap<String, String>) -> DncResult<()>;

    fn rate_limit(&self) -> RateLimitInfo;
    async fn quota_status(&self) -> DncResult<QuotaStatus>;

    fn circuit_state(&self) -> CircuitState;
    fn circuit_snapshot(&self) -> CircuitSnapshot;
    fn force_circuit_open(&self);
    fn force_circuit_close(&self);

    fn metrics(&self) -> ClientMetricsSnapshot;
}

/// Connection/auth state shared across provider implementations.
#[derive(Debug, Default, Clone)]
pub(crate) struct ConnState {
    pub connected: bool,
    pub session_token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
}

/// Runtime every provider client embeds: circuit breaker, token bucket,
/// metrics aggregate, and connection state, with one admit path in front
/// of every outbound call.
pub(crate) struct ClientCore {
    name: String,
    circuit: CircuitBreaker,
    bucket: Mutex<Arc<TokenBucket>>,
    metrics: ClientMetrics,
    admit_deadline: Duration,
    pub(crate) conn: RwLock<ConnState>,
}

impl ClientCore {
    pub(crate) fn new(
        name: impl Into<String>,
        circuit_config: CircuitBreakerConfig,
        rps: u32,
        admit_deadline: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            circuit: CircuitBreaker::new(circuit_config),
            bucket: Mutex::new(Arc::new(TokenBucket::new(rps))),
            metrics: ClientMetrics::new(),
            admit_deadline,
            conn: RwLock::new(ConnState::default()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    pub(crate) fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    pub(crate) fn bucket(&self) -> Arc<TokenBucket> {
        self.bucket.lock().unwrap().clone()
    }

    /// Swap the token bucket after a rate-limit config change.
    pub(crate) fn set_rate(&self, rps: u32) {
        *self.bucket.lock().unwrap() = Arc::new(TokenBucket::new(rps));
    }

    /// Gate one outbound call: circuit first (no token is burned on an
    /// open circuit), then the bucket, bounded by the admit deadline.
    pub(crate) async fn admit(&self) -> DncResult<()> {
        self.circuit.try_acquire(&self.name)?;
        self.bucket().acquire(self.admit_deadline).await
    }

    /// Record the outcome of an admitted call on circuit and metrics.
    pub(crate) fn observe(&self, started: Instant, success: bool) {
        let elapsed = started.elapsed();
        if success {
            self.circuit.record_success();
            self.metrics.record_success(elapsed);
        } else {
            if self.circuit.record_failure(&self.name) {
                self.metrics.record_circuit_open();
            }
            self.metrics.record_error(elapsed);
        }
    }

    pub(crate) async fn mark_connected(&self, connected: bool) {
        let mut conn = self.conn.write().await;
        conn.connected = connected;
        if !connected {
            conn.session_token = None;
            conn.token_expiry = None;
        }
    }

    pub(crate) async fn is_connected_plain(&self) -> bool {
        self.conn.read().await.connected
    }

    /// Connected with an unexpired token (OAuth-style providers).
    pub(crate) async fn is_connected_with_token(&self) -> bool {
        let conn = self.conn.read().await;
        conn.connected
            && conn.session_token.is_some()
            && conn.token_expiry.is_some_and(|at| Utc::now() < at)
    }
}
