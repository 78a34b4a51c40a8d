//! Shared test fixtures: a scripted provider that stands in for a
//! registry client without any network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use dce_dnc::error::{DncError, DncResult};
use dce_dnc::model::{
    DncCheckResult, ProviderHealth, QuotaStatus, RateLimitInfo, SyncResult,
};
use dce_dnc::phone::PhoneNumber;
use dce_dnc::provider::{
    BatchCheckOutcome, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState,
    ClientMetrics, ClientMetricsSnapshot, DncProvider, ProviderType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Every number is on the list.
    Blocked,
    /// Every number is clear.
    Clear,
    /// Upstream answers 503.
    Unavailable,
}

pub struct MockProvider {
    name: String,
    provider_type: ProviderType,
    behavior: Mutex<MockBehavior>,
    circuit: CircuitBreaker,
    metrics: ClientMetrics,
    healthy: AtomicBool,
    /// Calls that actually reached the fake upstream (admitted past the
    /// circuit). Lets tests assert "zero network traffic".
    pub upstream_calls: AtomicU64,
}

impl MockProvider {
    pub fn new(
        name: &str,
        provider_type: ProviderType,
        behavior: MockBehavior,
        circuit_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            name: name.to_string(),
            provider_type,
            behavior: Mutex::new(behavior),
            circuit: CircuitBreaker::new(circuit_config),
            metrics: ClientMetrics::new(),
            healthy: AtomicBool::new(true),
            upstream_calls: AtomicU64::new(0),
        }
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn upstream_calls(&self) -> u64 {
        self.upstream_calls.load(Ordering::Relaxed)
    }

    fn respond(&self, phone: &PhoneNumber) -> DncResult<DncCheckResult> {
        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            MockBehavior::Unavailable => {
                self.circuit.record_failure(&self.name);
                Err(DncError::ProviderUnavailable(format!(
                    "{} returned HTTP 503",
                    self.name
                )))
            }
            blocked_or_clear => {
                self.circuit.record_success();
                Ok(DncCheckResult {
                    phone_number: phone.as_e164().to_string(),
                    is_blocked: blocked_or_clear == MockBehavior::Blocked,
                    list_source: format!("mock-{}", self.provider_type),
                    reasons: vec![],
                    confidence: 1.0,
                    last_updated: Utc::now(),
                    ttl_secs: 3600,
                    registration_date: None,
                })
            }
        }
    }
}

#[async_trait]
impl DncProvider for MockProvider {
    fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> DncResult<ProviderHealth> {
        let healthy = self.healthy.load(Ordering::Relaxed);
        Ok(ProviderHealth {
            healthy,
            authenticated: healthy,
            connective: healthy,
            rate_limit_ok: true,
            response_time_ms: 1,
            status_code: Some(if healthy { 200 } else { 503 }),
            metadata: HashMap::new(),
            checked_at: Utc::now(),
        })
    }

    async fn check_number(&self, phone: &PhoneNumber) -> DncResult<DncCheckResult> {
        self.circuit.try_acquire(&self.name)?;
        self.upstream_calls.fetch_add(1, Ordering::Relaxed);
        self.respond(phone)
    }

    async fn batch_check_numbers(&self, phones: &[PhoneNumber]) -> BatchCheckOutcome {
        let mut results = Vec::with_capacity(phones.len());
        for phone in phones {
            match self.check_number(phone).await {
                Ok(result) => results.push(result),
                Err(error) => {
                    return BatchCheckOutcome {
                        results,
                        error: Some(error),
                    }
                }
            }
        }
        BatchCheckOutcome::ok(results)
    }

    async fn get_incremental_updates(&self, _since: DateTime<Utc>) -> DncResult<SyncResult> {
        Ok(SyncResult::default())
    }

    async fn connect(&self) -> DncResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> DncResult<()> {
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        true
    }

    fn validate_config(&self, _config: &HashMap<String, String>) -> DncResult<()> {
        Ok(())
    }

    async fn set_config(&self, _config: HashMap<String, String>) -> DncResult<()> {
        Ok(())
    }

    fn rate_limit(&self) -> RateLimitInfo {
        RateLimitInfo {
            requests_per_second: 100,
            burst: 200,
        }
    }

    async fn quota_status(&self) -> DncResult<QuotaStatus> {
        Ok(QuotaStatus::default())
    }

    fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    fn circuit_snapshot(&self) -> CircuitSnapshot {
        self.circuit.snapshot()
    }

    fn force_circuit_open(&self) {
        self.circuit.force_open();
    }

    fn force_circuit_close(&self) {
        self.circuit.force_close();
    }

    fn metrics(&self) -> ClientMetricsSnapshot {
        self.metrics.snapshot()
    }
}

pub fn phone(raw: &str) -> PhoneNumber {
    PhoneNumber::normalize(raw).unwrap()
}
