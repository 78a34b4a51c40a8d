//! Wireless (CTIA) registry client.
//!
//! OAuth client-credentials lifecycle: every call goes out with a token
//! that is still valid for at least five minutes; a 401 invalidates the
//! token and earns exactly one refresh-and-retry. Wireless block data lags
//! ports slightly, so results carry confidence 0.95.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{DncError, DncResult};
use crate::model::{
    DncCheckResult, DncEntry, ProviderHealth, QuotaStatus, RateLimitInfo, SyncResult,
};
use crate::phone::PhoneNumber;

use super::config::{base_url, optional, parse_secs, parse_u32, require};
use super::http::{build_client, classify_status, parse_flexible_date};
use super::{
    BatchCheckOutcome, CircuitBreakerConfig, CircuitSnapshot, CircuitState, ClientCore,
    ClientMetricsSnapshot, DncProvider, ProviderType,
};

const LIST_SOURCE: &str = "Wireless";
const RESULT_TTL_SECS: u64 = 12 * 3600;
/// A token within this margin of expiry is treated as already expired.
const TOKEN_EXPIRY_MARGIN: i64 = 5 * 60;

#[derive(Debug, Clone)]
pub struct WirelessConfig {
    pub client_id: String,
    pub client_secret: String,
    pub base_url: String,
    pub token_endpoint: String,
    pub scope: String,
    pub rate_limit_rps: u32,
    pub batch_size: usize,
    pub sync_limit: usize,
    pub request_timeout: Duration,
}

impl WirelessConfig {
    pub fn from_map(config: &HashMap<String, String>) -> DncResult<Self> {
        let base = base_url(config, "base_url")?;
        Ok(Self {
            client_id: require(config, "client_id")?.to_string(),
            client_secret: require(config, "client_secret")?.to_string(),
            token_endpoint: optional(config, "token_endpoint")
                .map(str::to_string)
                .unwrap_or_else(|| format!("{base}/oauth/token")),
            scope: optional(config, "scope").unwrap_or("dnc.read").to_string(),
            base_url: base,
            rate_limit_rps: parse_u32(config, "rate_limit_rps", 10)?,
            batch_size: parse_u32(config, "batch_size", 50)?.clamp(25, 100) as usize,
            sync_limit: parse_u32(config, "sync_limit", 1000)? as usize,
            request_timeout: parse_secs(config, "request_timeout_secs", Duration::from_secs(30))?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct WirelessCheckResponse {
    #[serde(default)]
    msisdn: Option<String>,
    #[serde(default)]
    is_listed: bool,
    #[serde(default)]
    carrier: Option<String>,
    #[serde(default)]
    listing_date: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WirelessBatchResponse {
    #[serde(default)]
    results: Vec<WirelessCheckResponse>,
}

#[derive(Debug, Deserialize)]
struct WirelessUpdateRecord {
    msisdn: String,
    #[serde(default)]
    action: String,
    #[serde(default)]
    listing_date: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WirelessUpdatesResponse {
    #[serde(default)]
    updates: Vec<WirelessUpdateRecord>,
    #[serde(default)]
    checkpoint: Option<String>,
}

/// CTIA wireless registry client.
pub struct WirelessProvider {
    core: ClientCore,
    http: Mutex<reqwest::Client>,
    config: RwLock<WirelessConfig>,
}

impl WirelessProvider {
    pub fn new(name: impl Into<String>, config: WirelessConfig) -> DncResult<Self> {
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
        Self::new(name, WirelessConfig::from_map(map)?)
    }

    fn http(&self) -> reqwest::Client {
        self.http.lock().unwrap().clone()
    }

    /// Hand back a token valid for at least the expiry margin, refreshing
    /// if needed.
    async fn ensure_valid_token(&self) -> DncResult<String> {
        {
            let conn = self.core.conn.read().await;
            if let (Some(token), Some(expiry)) = (&conn.session_token, conn.token_expiry) {
                if Utc::now() < expiry - ChronoDuration::seconds(TOKEN_EXPIRY_MARGIN) {
                    return Ok(token.clone());
                }
            }
        }
        self.refresh_token().await
    }

    /// `grant_type=client_credentials` with HTTP Basic client auth.
    async fn refresh_token(&self) -> DncResult<String> {
        let config = self.config.read().await.clone();
        debug!(provider = self.core.name(), "refreshing wireless token");

        let response = self
            .http()
            .post(&config.token_endpoint)
            .basic_auth(&config.client_id, Some(&config.client_secret))
            .form(&[
                ("grant_type", "client_credentials"),
                ("scope", config.scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| DncError::ConnectionFailed(format!("token endpoint: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DncError::AuthenticationFailed(format!(
                "token endpoint returned HTTP {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| DncError::AuthenticationFailed(format!("bad token response: {e}")))?;

        let mut conn = self.core.conn.write().await;
        conn.session_token = Some(token.access_token.clone());
        conn.token_expiry = Some(Utc::now() + ChronoDuration::seconds(token.expires_in.max(0)));
        conn.connected = true;
        Ok(token.access_token)
    }

    async fn invalidate_token(&self) {
        let mut conn = self.core.conn.write().await;
        conn.session_token = None;
        conn.token_expiry = None;
    }

    /// Admit, attach a valid token, send, classify. A 401 invalidates the
    /// token and retries exactly once with a fresh one.
    async fn execute<F>(&self, build: F) -> DncResult<reqwest::Response>
    where
        F: Fn(reqwest::Client, String) -> reqwest::RequestBuilder,
    {
        self.core.admit().await?;
        let mut refreshed = false;
        loop {
            let token = self.ensure_valid_token().await?;
            let started = Instant::now();
            let response = match build(self.http(), token).send().await {
                Ok(response) => response,
                Err(err) => {
                    self.core.observe(started, false);
                    return Err(err.into());
                }
            };

            if response.status() == StatusCode::UNAUTHORIZED && !refreshed {
                warn!(
                    provider = self.core.name(),
                    "401 from wireless registry; rotating token"
                );
                self.core.observe(started, false);
                self.invalidate_token().await;
                refreshed = true;
                continue;
            }
            if !response.status().is_success() {
                self.core.observe(started, false);
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(classify_status(self.core.name(), status, &body));
            }
            self.core.observe(started, true);
            return Ok(response);
        }
    }

    fn to_result(&self, phone: &PhoneNumber, resp: WirelessCheckResponse) -> DncCheckResult {
        let mut reasons = Vec::new();
        if let Some(reason) = resp.reason {
            reasons.push(reason);
        } else if resp.is_listed {
            reasons.push("listed on the wireless do-not-call registry".to_string());
        }
        if let Some(carrier) = resp.carrier {
            reasons.push(format!("carrier: {carrier}"));
        }
        DncCheckResult {
            phone_number: resp
                .msisdn
                .map(|m| format!("+{m}"))
                .unwrap_or_else(|| phone.as_e164().to_string()),
            is_blocked: resp.is_listed,
            list_source: LIST_SOURCE.to_string(),
            reasons,
            confidence: 0.95,
            last_updated: Utc::now(),
            ttl_secs: RESULT_TTL_SECS,
            registration_date: resp.listing_date.as_deref().and_then(parse_flexible_date),
        }
    }

    async fn batch_chunk(
        &self,
        chunk: &[PhoneNumber],
        config: &WirelessConfig,
    ) -> DncResult<Vec<DncCheckResult>> {
        let msisdns: Vec<&str> = chunk.iter().map(PhoneNumber::digits).collect();
        let body = serde_json::json!({ "msisdns": msisdns });
        let url = format!("{}/v2/wireless-batch-check", config.base_url);
        let response = self
            .execute(|client, token| client.post(&url).bearer_auth(token).json(&body))
            .await?;

        let parsed: WirelessBatchResponse = response
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
impl DncProvider for WirelessProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Wireless
    }

    fn provider_name(&self) -> &str {
        self.core.name()
    }

    async fn health_check(&self) -> DncResult<ProviderHealth> {
        let config = self.config.read().await.clone();
        let mut metadata = HashMap::new();
        metadata.insert("provider_type".to_string(), "wireless".to_string());

        let authenticated = match self.ensure_valid_token().await {
            Ok(_) => true,
            Err(err) => {
                debug!(provider = self.core.name(), %err, "token unavailable");
                false
            }
        };
        if !authenticated {
            let mut health = ProviderHealth::unhealthy("token acquisition failed");
            health.metadata.extend(metadata);
            health.rate_limit_ok = self.core.bucket().try_peek();
            return Ok(health);
        }

        let token = self.ensure_valid_token().await?;
        let started = Instant::now();
        let probe = self
            .http()
            .get(format!("{}/v2/health", config.base_url))
            .bearer_auth(&token)
            .send()
            .await;
        let elapsed = started.elapsed().as_millis() as u64;

        match probe {
            Ok(response) => {
                let healthy = response.status().is_success();
                self.core.observe(started, healthy);
                Ok(ProviderHealth {
                    healthy,
                    authenticated,
                    connective: true,
                    rate_limit_ok: self.core.bucket().try_peek(),
                    response_time_ms: elapsed,
                    status_code: Some(response.status().as_u16()),
                    metadata,
                    checked_at: Utc::now(),
                })
            }
            Err(_) => {
                self.core.observe(started, false);
                Ok(ProviderHealth {
                    healthy: false,
                    authenticated,
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
        let url = format!("{}/v2/wireless-check", config.base_url);
        let response = self
            .execute(|client, token| {
                client
                    .get(&url)
                    .query(&[
                        ("msisdn", phone.digits()),
                        ("include_carrier", "true"),
                        ("include_short_code", "true"),
                    ])
                    .bearer_auth(token)
            })
            .await?;

        let parsed: WirelessCheckResponse = response
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
        let url = format!("{}/v2/wireless-updates", config.base_url);
        let since_param = since.to_rfc3339();
        let limit_param = config.sync_limit.to_string();
        let response = self
            .execute(|client, token| {
                client
                    .get(&url)
                    .query(&[
                        ("since", since_param.as_str()),
                        ("limit", limit_param.as_str()),
                    ])
                    .bearer_auth(token)
            })
            .await?;

        let parsed: WirelessUpdatesResponse = response
            .json()
            .await
            .map_err(|e| DncError::InvalidResponse(e.to_string()))?;

        let mut result = SyncResult {
            checkpoint: parsed.checkpoint,
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
                        phone_number: format!("+{}", record.msisdn),
                        list_source: LIST_SOURCE.to_string(),
                        suppress_reason: record
                            .reason
                            .unwrap_or_else(|| "wireless listing".to_string()),
                        registration_date: record
                            .listing_date
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
        self.refresh_token().await?;
        Ok(())
    }

    async fn disconnect(&self) -> DncResult<()> {
        self.core.mark_connected(false).await;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.core.is_connected_with_token().await
    }

    fn validate_config(&self, config: &HashMap<String, String>) -> DncResult<()> {
        WirelessConfig::from_map(config).map(|_| ())
    }

    async fn set_config(&self, map: HashMap<String, String>) -> DncResult<()> {
        let next = WirelessConfig::from_map(&map)?;
        let mut current = self.config.write().await;

        if next.request_timeout != current.request_timeout {
            *self.http.lock().unwrap() = build_client(next.request_timeout)?;
        }
        if next.rate_limit_rps != current.rate_limit_rps {
            self.core.set_rate(next.rate_limit_rps);
        }
        let secrets_rotated = next.client_id != current.client_id
            || next.client_secret != current.client_secret
            || next.token_endpoint != current.token_endpoint;

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
            ("client_id", "dce"),
            ("client_secret", "secret"),
            ("base_url", "https://wireless.example.org"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_config_defaults() {
        let config = WirelessConfig::from_map(&config_map()).unwrap();
        assert_eq!(
            config.token_endpoint,
            "https://wireless.example.org/oauth/token"
        );
        assert_eq!(config.scope, "dnc.read");
        assert_eq!(config.batch_size, 50);
    }

    #[test]
    fn test_config_requires_client_credentials() {
        let mut map = config_map();
        map.remove("client_secret");
        assert!(WirelessConfig::from_map(&map).is_err());
    }
}
