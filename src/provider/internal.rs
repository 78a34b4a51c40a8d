//! Internal suppression-list provider.
//!
//! Serves the organization's own do-not-contact list straight from the
//! KVS — no HTTP, no external registry. Registered under the `internal`
//! type so the default failover order terminates at a local authority
//! even when every remote registry is down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{DncError, DncResult};
use crate::kv::KvStore;
use crate::model::{
    DncCheckResult, DncEntry, ProviderHealth, QuotaStatus, RateLimitInfo, SyncResult,
};
use crate::phone::PhoneNumber;

use super::{
    BatchCheckOutcome, CircuitBreakerConfig, CircuitSnapshot, CircuitState, ClientCore,
    ClientMetricsSnapshot, DncProvider, ProviderType,
};

const LIST_SOURCE: &str = "Internal";
const KEY_PREFIX: &str = "dce:dnc:internal:";
const RESULT_TTL_SECS: u64 = 24 * 3600;

fn entry_key(phone: &PhoneNumber) -> String {
    format!("{KEY_PREFIX}{}", phone.digits())
}

/// KVS-backed internal list client.
pub struct InternalProvider {
    core: ClientCore,
    store: Arc<dyn KvStore>,
}

impl InternalProvider {
    pub fn new(name: impl Into<String>, store: Arc<dyn KvStore>) -> Self {
        // Local store lookups are cheap; the generous bucket exists so the
        // shared admit path still applies backpressure under abuse.
        let core = ClientCore::new(
            name,
            CircuitBreakerConfig::default(),
            1000,
            Duration::from_secs(5),
        );
        Self { core, store }
    }

    /// Add a number to the internal suppression list.
    pub async fn add_entry(&self, entry: &DncEntry) -> DncResult<()> {
        let phone = PhoneNumber::normalize(&entry.phone_number)?;
        let bytes = serde_json::to_vec(entry).map_err(|e| DncError::Internal(e.into()))?;
        self.store
            .set(&entry_key(&phone), &bytes, None)
            .await
            .map_err(|e| DncError::Internal(e.into()))
    }

    /// Remove a number from the internal suppression list.
    pub async fn remove_entry(&self, phone: &PhoneNumber) -> DncResult<bool> {
        self.store
            .delete(&entry_key(phone))
            .await
            .map_err(|e| DncError::Internal(e.into()))
    }

    async fn lookup(&self, phone: &PhoneNumber) -> DncResult<DncCheckResult> {
        self.core.admit().await?;
        let started = Instant::now();
        let raw = match self.store.get(&entry_key(phone)).await {
            Ok(raw) => raw,
            Err(err) => {
                self.core.observe(started, false);
                return Err(DncError::Internal(err.into()));
            }
        };
        self.core.observe(started, true);

        let entry: Option<DncEntry> = raw
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()
            .map_err(|e| DncError::InvalidResponse(e.to_string()))?;

        Ok(DncCheckResult {
            phone_number: phone.as_e164().to_string(),
            is_blocked: entry.is_some(),
            list_source: LIST_SOURCE.to_string(),
            reasons: entry
                .as_ref()
                .map(|e| vec![e.suppress_reason.clone()])
                .unwrap_or_default(),
            confidence: 1.0,
            last_updated: Utc::now(),
            ttl_secs: RESULT_TTL_SECS,
            registration_date: entry.and_then(|e| e.registration_date),
        })
    }
}

#[async_trait]
impl DncProvider for InternalProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Internal
    }

    fn provider_name(&self) -> &str {
        self.core.name()
    }

    async fn health_check(&self) -> DncResult<ProviderHealth> {
        let started = Instant::now();
        let healthy = self.store.ping().await.is_ok();
        let mut metadata = HashMap::new();
        metadata.insert("provider_type".to_string(), "internal".to_string());
        Ok(ProviderHealth {
            healthy,
            authenticated: true,
            connective: healthy,
            rate_limit_ok: self.core.bucket().try_peek(),
            response_time_ms: started.elapsed().as_millis() as u64,
            status_code: None,
            metadata,
            checked_at: Utc::now(),
        })
    }

    async fn check_number(&self, phone: &PhoneNumber) -> DncResult<DncCheckResult> {
        self.lookup(phone).await
    }

    async fn batch_check_numbers(&self, phones: &[PhoneNumber]) -> BatchCheckOutcome {
        let mut results = Vec::with_capacity(phones.len());
        for phone in phones {
            match self.lookup(phone).await {
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

    async fn get_incremental_updates(&self, since: DateTime<Utc>) -> DncResult<SyncResult> {
        let started = Instant::now();
        let keys = self
            .store
            .scan(&format!("{KEY_PREFIX}*"), 100)
            .await
            .map_err(|e| DncError::Internal(e.into()))?;

        let mut result = SyncResult::default();
        for key in keys {
            let Some(bytes) = self
                .store
                .get(&key)
                .await
                .map_err(|e| DncError::Internal(e.into()))?
            else {
                continue;
            };
            let Ok(entry) = serde_json::from_slice::<DncEntry>(&bytes) else {
                continue;
            };
            // The internal list has no change feed; filter by known
            // registration time instead.
            if entry.registration_date.is_some_and(|at| at < since) {
                continue;
            }
            result.added += 1;
            result.entries.push(entry);
        }

        let elapsed = started.elapsed();
        result.duration_ms = elapsed.as_millis() as u64;
        result.records_per_second = if elapsed.as_secs_f64() > 0.0 {
            result.added as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        Ok(result)
    }

    async fn connect(&self) -> DncResult<()> {
        self.store
            .ping()
            .await
            .map_err(|e| DncError::ConnectionFailed(e.to_string()))?;
        self.core.mark_connected(true).await;
        Ok(())
    }

    async fn disconnect(&self) -> DncResult<()> {
        self.core.mark_connected(false).await;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.core.is_connected_plain().await
    }

    fn validate_config(&self, _config: &HashMap<String, String>) -> DncResult<()> {
        // The internal provider is configured by construction (it shares
        // the process's KVS handle).
        Ok(())
    }

    async fn set_config(&self, _config: HashMap<String, String>) -> DncResult<()> {
        Ok(())
    }

    fn rate_limit(&self) -> RateLimitInfo {
        self.core.bucket().info()
    }

    async fn quota_status(&self) -> DncResult<QuotaStatus> {
        Ok(QuotaStatus {
            used: self.core.metrics().snapshot().requests,
            limit: None,
            resets_at: None,
        })
    }

    fn circuit_state(&self) -> CircuitState {
        self.core.circuit().state()
    }

    fn circuit_snapshot(&self) -> CircuitSnapshot {
        self.core.circuit().snapshot()
    }

    fn force_circuit_open(&self) {
        self.core.circuit().force_open();
    }

    fn force_circuit_close(&self) {
        self.core.circuit().force_close();
    }

    fn metrics(&self) -> ClientMetricsSnapshot {
        self.core.metrics().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn entry(phone: &str) -> DncEntry {
        DncEntry {
            phone_number: phone.to_string(),
            list_source: LIST_SOURCE.to_string(),
            suppress_reason: "customer opt-out".to_string(),
            registration_date: Some(Utc::now()),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_add_check_remove() {
        let store = Arc::new(MemoryStore::new());
        let provider = InternalProvider::new("internal-primary", store);
        let phone = PhoneNumber::normalize("+14155551234").unwrap();

        let clear = provider.check_number(&phone).await.unwrap();
        assert!(!clear.is_blocked);

        provider.add_entry(&entry("+14155551234")).await.unwrap();
        let blocked = provider.check_number(&phone).await.unwrap();
        assert!(blocked.is_blocked);
        assert_eq!(blocked.list_source, "Internal");
        assert_eq!(blocked.confidence, 1.0);
        assert_eq!(blocked.reasons, vec!["customer opt-out"]);

        assert!(provider.remove_entry(&phone).await.unwrap());
        let clear = provider.check_number(&phone).await.unwrap();
        assert!(!clear.is_blocked);
    }

    #[tokio::test]
    async fn test_snapshot_lists_entries() {
        let store = Arc::new(MemoryStore::new());
        let provider = InternalProvider::new("internal-primary", store);
        provider.add_entry(&entry("+14155551234")).await.unwrap();
        provider.add_entry(&entry("+12125559876")).await.unwrap();

        let snapshot = provider.get_full_snapshot().await.unwrap();
        assert_eq!(snapshot.added, 2);
        assert_eq!(snapshot.entries.len(), 2);
    }
}
