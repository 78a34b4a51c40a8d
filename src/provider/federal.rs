//! Federal (FTC) registry client.
//!
//! Static API-key bearer auth; key rotation happens through `set_config`.
//! Federal answers are authoritative, so results carry confidence 1.0.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{DncError, DncResult};
use crate::model::{
    DncCheckResult, DncEntry, ProviderHealth, QuotaStatus, RateLimitInfo, SyncResult,
};
use crate::phone::PhoneNumber;

use super::config::{base_url, one_of, parse_secs, parse_u32, require};
use super::http::{build_client, classify_status, parse_flexible_date};
use super::{
    BatchCheckOutcome, CircuitBreakerConfig, CircuitSnapshot, CircuitState, ClientCore,
    ClientMetricsSnapshot, DncProvider, ProviderType,
};

const LIST_SOURCE: &str = "Federal";
const RESULT_TTL_SECS: u64 = 24 * 3600;

/// Parsed federal provider configuration.
#[derive(Debug, Clone)]
pub struct FederalConfig {
    pub api_key: String,
    pub api_secret: Option<String>,
    pub base_url: String,
    pub format: String,
    pub version: Option<String>,
    pub rate_limit_rps: u32,
    pub batch_size: usize,
    pub sync_limit: usize,
    pub request_timeout: Duration,
}

impl FederalConfig {
    pub fn from_map(config: &HashMap<String, String>) -> DncResult<Self> {
        Ok(Self {
            api_key: require(config, "api_key")?.to_string(),
            api_secret: config.get("api_secret").cloned().filter(|s| !s.is_empty()),
            base_url: base_url(config, "base_url")?,
            format: one_of(config, "format", &["json", "xml", "csv"], "json")?.to_string(),
            version: config.get("version").cloned().filter(|s| !s.is_empty()),
            rate_limit_rps: parse_u32(config, "rate_limit_rps", 10)?,
            batch_size: parse_u32(config, "batch_size", 100)?.clamp(25, 100) as usize,
            sync_limit: parse_u32(config, "sync_limit", 1000)? as usize,
            request_timeout: parse_secs(config, "request_timeout_secs", Duration::from_secs(30))?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct FederalCheckResponse {
    #[serde(default)]
    number: Option<String>,
    #[serde(default)]
    is_registered: bool,
    #[serde(default)]
    registration_date: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FederalBatchResponse {
    #[serde(default)]
    results: Vec<FederalCheckResponse>,
}

#[derive(Debug, Deserialize)]
struct FederalUpdateRecord {
    phone_number: String,
    #[serde(default)]
    action: String,
    #[serde(default)]
    registration_date: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FederalUpdatesResponse {
    #[serde(default)]
    updates: Vec<FederalUpdateRecord>,
    #[serde(default)]
    checkpoint: Option<String>,
    #[serde(default)]
    next_sync_after: Option<String>,
}

/// FTC registry client.
pub struct FederalProvider {
    core: ClientCore,
    http: Mutex<reqwest::Client>,
    config: RwLock<FederalConfig>,
}

impl FederalProvider {
    pub fn new(name: impl Into<String>, config: FederalConfig) -> DncResult<Self> {
        let http = build_client(config.request_timeout)?;
        let core = ClientCore::new(
            name,
            CircuitBreakerConfig::default(),
            config.rate_limit_rps,
            config.request_timeout,
        );
        Ok(Self {
            core,
            http: Mutex::new(http),
            config: RwLock::new(config),
        })
    }

    pub fn from_map(name: impl Into<String>, map: &HashMap<String, String>) -> DncResult<Self> {
        Self::new(name, FederalConfig::from_map(map)?)
    }

    fn http(&self) -> reqwest::Client {
        self.http.lock().unwrap().clone()
    }

    fn to_result(&self, phone: &PhoneNumber, resp: FederalCheckResponse) -> DncCheckResult {
        let mut reasons = Vec::new();
        if let Some(reason) = resp.reason {
            reasons.push(reason);
        } else if resp.is_registered {
            reasons.push("registered on the federal do-not-call list".to_string());
        }
        DncCheckResult {
            phone_number: resp
                .number
                .unwrap_or_else(|| phone.as_e164().to_string()),
            is_blocked: resp.is_registered,
            list_source: LIST_SOURCE.to_string(),
            reasons,
            confidence: 1.0,
            last_updated: Utc::now(),
            ttl_secs: RESULT_TTL_SECS,
            registration_date: resp
                .registration_date
                .as_deref()
                .and_then(parse_flexible_date),
        }
    }

    /// Issue one admitted request and classify the response, recording the
    /// outcome on circuit and metrics.
    async fn execute(&self, request: reqwest::RequestBuilder) -> DncResult<reqwest::Response> {
        self.core.admit().await?;
        let started = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                self.core.observe(started, false);
                return Err(err.into());
            }
        };
        if !response.status().is_success() {
            self.core.observe(started, false);
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(self.core.name(), status, &body));
        }
        self.core.observe(started, true);
        Ok(response)
    }

    async fn batch_chunk(
        &self,
        chunk: &[PhoneNumber],
        config: &FederalConfig,
    ) -> DncResult<Vec<DncCheckResult>> {
        let numbers: Vec<&str> = chunk.iter().map(PhoneNumber::as_e164).collect();
        let response = self
            .execute(
                self.http()
                    .post(format!("{}/v1/batch-check", config.base_url))
                    .bearer_auth(&config.api_key)
                    .json(&serde_json::json!({ "numbers": numbers, "format": "json" })),
            )
            .await?;

        let parsed: FederalBatchResponse = response
            .json()
            .await
            .map_err(|e| DncError::InvalidResponse(e.to_string()))?;

        Ok(parsed
            .results
            .into_iter()
            .zip(chunk)
            .map(|(item, phone)| self.to_result(phone, item))
            .collect())
    }
}

#[async_trait]
impl DncProvider for FederalProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Federal
    }

    fn provider_name(&self) -> &str {
        self.core.name()
    }

    async fn health_check(&self) -> DncResult<ProviderHealth> {
        let config = self.config.read().await.clone();
        let started = Instant::now();
        let probe = self
            .http()
            .get(format!("{}/v1/health", config.base_url))
            .bearer_auth(&config.api_key)
            .send()
            .await;
        let elapsed = started.elapsed().as_millis() as u64;

        let mut metadata = HashMap::new();
        metadata.insert("provider_type".to_string(), "federal".to_string());
        if let Some(version) = &config.version {
            metadata.insert("version".to_string(), version.clone());
        }

        match probe {
            Ok(response) => {
                let healthy = response.status().is_success();
                if healthy {
                    self.core.observe(started, true);
                } else {
                    self.core.observe(started, false);
                }
                Ok(ProviderHealth {
                    healthy,
                    authenticated: response.status().as_u16() != 401,
                    connective: true,
                    rate_limit_ok: self.core.bucket().try_peek(),
                    response_time_ms: elapsed,
                    status_code: Some(response.status().as_u16()),
                    metadata,
                    checked_at: Utc::now(),
                })
            }
            Err(err) => {
                self.core.observe(started, false);
                debug!(provider = self.core.name(), %err, "health probe failed");
                Ok(ProviderHealth {
                    healthy: false,
                    authenticated: false,
                    connective: false,
                    rate_limit_ok: self.core.bucket().try_peek(),
                    response_time_ms: elapsed,
                    status_code: None,
                    metadata,
                    checked_at: Utc::now(),
                })
            }
        }
    }

    async fn check_number(&self, phone: &PhoneNumber) -> DncResult<DncCheckResult> {
        let config = self.config.read().await.clone();
        let response = self
            .execute(
                self.http()
                    .get(format!("{}/v1/check", config.base_url))
                    .query(&[
                        ("number", phone.as_e164()),
                        ("format", config.format.as_str()),
                        ("metadata", "true"),
                    ])
                    .bearer_auth(&config.api_key),
            )
            .await?;

        let parsed: FederalCheckResponse = response
            .json()
            .await
            .map_err(|e| DncError::InvalidResponse(e.to_string()))?;
        Ok(self.to_result(phone, parsed))
    }

    async fn batch_check_numbers(&self, phones: &[PhoneNumber]) -> BatchCheckOutcome {
        let config = self.config.read().await.clone();
        let mut results = Vec::with_capacity(phones.len());
        for chunk in phones.chunks(config.batch_size.max(1)) {
            match self.batch_chunk(chunk, &config).await {
                Ok(mut chunk_results) => results.append(&mut chunk_results),
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
        let config = self.config.read().await.clone();
        let started = Instant::now();
        let response = self
            .execute(
                self.http()
                    .get(format!("{}/v1/updates", config.base_url))
                    .query(&[
                        ("since", since.to_rfc3339().as_str()),
                        ("format", "json"),
                        ("limit", config.sync_limit.to_string().as_str()),
                    ])
                    .bearer_auth(&config.api_key),
            )
            .await?;

        let parsed: FederalUpdatesResponse = response
            .json()
            .await
            .map_err(|e| DncError::InvalidResponse(e.to_string()))?;

        let mut result = SyncResult {
            checkpoint: parsed.checkpoint,
            next_sync_after: parsed
                .next_sync_after
                .as_deref()
                .and_then(parse_flexible_date),
            ..SyncResult::default()
        };
        for record in parsed.updates {
            match record.action.as_str() {
                "deleted" => result.deleted += 1,
                action => {
                    if action == "updated" {
                        result.updated += 1;
                    } else {
                        result.added += 1;
                    }
                    result.entries.push(DncEntry {
                        phone_number: record.phone_number,
                        list_source: LIST_SOURCE.to_string(),
                        suppress_reason: record
                            .reason
                            .unwrap_or_else(|| "federal registration".to_string()),
                        registration_date: record
                            .registration_date
                            .as_deref()
                            .and_then(parse_flexible_date),
                        expires_at: None,
                    });
                }
            }
        }

        let elapsed = started.elapsed();
        result.duration_ms = elapsed.as_millis() as u64;
        let total = result.added + result.updated + result.deleted;
        result.records_per_second = if elapsed.as_secs_f64() > 0.0 {
            total as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        Ok(result)
    }

    async fn connect(&self) -> DncResult<()> {
        let health = self.health_check().await?;
        if !health.healthy {
            return Err(DncError::ConnectionFailed(format!(
                "federal provider {} failed its connect probe",
                self.core.name()
            )));
        }
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

    fn validate_config(&self, config: &HashMap<String, String>) -> DncResult<()> {
        FederalConfig::from_map(config).map(|_| ())
    }

    async fn set_config(&self, map: HashMap<String, String>) -> DncResult<()> {
        let next = FederalConfig::from_map(&map)?;
        let mut current = self.config.write().await;

        if next.request_timeout != current.request_timeout {
            *self.http.lock().unwrap() = build_client(next.request_timeout)?;
        }
        if next.rate_limit_rps != current.rate_limit_rps {
            self.core.set_rate(next.rate_limit_rps);
        }
        let secrets_rotated =
            next.api_key != current.api_key || next.api_secret != current.api_secret;

        *current = next;
        drop(current);

        if secrets_rotated {
            self.core.mark_connected(false).await;
        }
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

    fn config_map() -> HashMap<String, String> {
        [
            ("api_key", "test-key"),
            ("base_url", "https://dnc.example.gov"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_config_defaults() {
        let config = FederalConfig::from_map(&config_map()).unwrap();
        assert_eq!(config.format, "json");
        assert_eq!(config.rate_limit_rps, 10);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_requires_key_and_url() {
        let mut map = config_map();
        map.remove("api_key");
        assert!(FederalConfig::from_map(&map).is_err());

        let mut map = config_map();
        map.insert("base_url".to_string(), "nonsense".to_string());
        assert!(FederalConfig::from_map(&map).is_err());
    }

    #[test]
    fn test_batch_size_clamped() {
        let mut map = config_map();
        map.insert("batch_size".to_string(), "500".to_string());
        assert_eq!(FederalConfig::from_map(&map).unwrap().batch_size, 100);
        map.insert("batch_size".to_string(), "5".to_string());
        assert_eq!(FederalConfig::from_map(&map).unwrap().batch_size, 25);
    }
}
