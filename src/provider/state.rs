//! Per-state registry client.
//!
//! One client fronts many state registries: a lookup derives the state
//! from the number's area code and queries that state's endpoint; numbers
//! whose derived state is not configured fall back to the first three
//! configured states. A positive from any state wins immediately. State
//! registries are generally but not always authoritative, so results
//! carry confidence 0.9 and a `State-XX` source tag.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{DncError, DncResult};
use crate::model::{
    DncCheckResult, DncEntry, ProviderHealth, QuotaStatus, RateLimitInfo, SyncResult,
};
use crate::phone::PhoneNumber;

use super::config::{optional, parse_secs, parse_u32, require};
use super::http::{build_client, classify_status, parse_flexible_date};
use super::{
    BatchCheckOutcome, CircuitBreakerConfig, CircuitSnapshot, CircuitState, ClientCore,
    ClientMetricsSnapshot, DncProvider, ProviderType,
};

const RESULT_TTL_SECS: u64 = 6 * 3600;
/// How many configured states a number with an unmapped area code fans
/// out to.
const FALLBACK_STATES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAuthType {
    Bearer,
    Basic,
    QueryParam,
}

impl FromStr for StateAuthType {
    type Err = DncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bearer" => Ok(Self::Bearer),
            "basic" => Ok(Self::Basic),
            "query_param" => Ok(Self::QueryParam),
            other => Err(DncError::Configuration(format!(
                "auth_type must be bearer, basic, or query_param, got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateEndpoints {
    pub check: String,
    pub batch: String,
    pub sync: String,
    pub health: String,
    pub register: Option<String>,
    pub unregister: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StateEndpointConfig {
    pub base_url: String,
    pub auth_type: StateAuthType,
    pub api_key: String,
    pub endpoints: StateEndpoints,
}

#[derive(Debug, Clone)]
pub struct StateProviderConfig {
    pub supported_states: Vec<String>,
    pub states: HashMap<String, StateEndpointConfig>,
    pub format: String,
    pub rate_limit_rps: u32,
    pub batch_size: usize,
    pub request_timeout: Duration,
}

impl StateProviderConfig {
    /// Parse the flat config map. State-specific keys are namespaced
    /// `state.<XX>.<key>`, e.g. `state.CA.base_url`.
    pub fn from_map(config: &HashMap<String, String>) -> DncResult<Self> {
        let supported_states: Vec<String> = require(config, "supported_states")?
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if supported_states.is_empty() {
            return Err(DncError::Configuration(
                "supported_states must list at least one state".into(),
            ));
        }
        for state in &supported_states {
            if state.len() != 2 || !state.chars().all(|c| c.is_ascii_uppercase()) {
                return Err(DncError::Configuration(format!(
                    "{state:?} is not a 2-letter state code"
                )));
            }
        }

        let mut states = HashMap::new();
        for state in &supported_states {
            let prefix = format!("state.{state}");
            let raw_base = require(config, &format!("{prefix}.base_url"))?;
            url::Url::parse(raw_base).map_err(|e| {
                DncError::Configuration(format!("{prefix}.base_url is not a URL: {e}"))
            })?;
            let endpoint = |leaf: &str, default: &str| {
                optional(config, &format!("{prefix}.endpoint.{leaf}"))
                    .unwrap_or(default)
                    .to_string()
            };
            states.insert(
                state.clone(),
                StateEndpointConfig {
                    base_url: raw_base.trim_end_matches('/').to_string(),
                    auth_type: optional(config, &format!("{prefix}.auth_type"))
                        .unwrap_or("bearer")
                        .parse()?,
                    api_key: require(config, &format!("{prefix}.api_key"))?.to_string(),
                    endpoints: StateEndpoints {
                        check: endpoint("check", "/check"),
                        batch: endpoint("batch", "/batch"),
                        sync: endpoint("sync", "/sync"),
                        health: endpoint("health", "/health"),
                        register: optional(config, &format!("{prefix}.endpoint.register"))
                            .map(str::to_string),
                        unregister: optional(config, &format!("{prefix}.endpoint.unregister"))
                            .map(str::to_string),
                    },
                },
            );
        }

        Ok(Self {
            supported_states,
            states,
            format: config
                .get("format")
                .cloned()
                .unwrap_or_else(|| "json".to_string()),
            rate_limit_rps: parse_u32(config, "rate_limit_rps", 5)?,
            batch_size: parse_u32(config, "batch_size", 25)?.clamp(25, 100) as usize,
            request_timeout: parse_secs(config, "request_timeout_secs", Duration::from_secs(30))?,
        })
    }

    /// States to query for a number: the area-code state when configured,
    /// otherwise the first few configured states.
    pub fn candidate_states(&self, phone: &PhoneNumber) -> Vec<String> {
        if let Some(derived) = phone.state() {
            if self.supported_states.iter().any(|s| s == derived) {
                return vec![derived.to_string()];
            }
        }
        self.supported_states
            .iter()
            .take(FALLBACK_STATES)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct StateCheckResponse {
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    is_listed: bool,
    #[serde(default)]
    registration_date: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StateBatchResponse {
    #[serde(default)]
    results: Vec<StateCheckResponse>,
}

#[derive(Debug, Deserialize)]
struct StateUpdateRecord {
    phone_number: String,
    #[serde(default)]
    action: String,
    #[serde(default)]
    registration_date: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StateUpdatesResponse {
    #[serde(default)]
    updates: Vec<StateUpdateRecord>,
    #[serde(default)]
    checkpoint: Option<String>,
}

/// Multi-state registry client.
pub struct StateProvider {
    core: ClientCore,
    http: Mutex<reqwest::Client>,
    config: RwLock<StateProviderConfig>,
}

fn source_tag(state: &str) -> String {
    format!("State-{state}")
}

impl StateProvider {
    pub fn new(name: impl Into<String>, config: StateProviderConfig) -> DncResult<Self> {
        let http = build_client(config.request_timeout)?;
        let core = ClientCore::new(
            name,
            CircuitBreakerConfig::for_state_provider(),
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
        Self::new(name, StateProviderConfig::from_map(map)?)
    }

    fn http(&self) -> reqwest::Client {
        self.http.lock().unwrap().clone()
    }

    fn apply_auth(
        builder: reqwest::RequestBuilder,
        state: &StateEndpointConfig,
    ) -> reqwest::RequestBuilder {
        match state.auth_type {
            StateAuthType::Bearer => builder.bearer_auth(&state.api_key),
            StateAuthType::Basic => match state.api_key.split_once(':') {
                Some((user, pass)) => builder.basic_auth(user, Some(pass)),
                None => builder.basic_auth(&state.api_key, None::<&str>),
            },
            StateAuthType::QueryParam => builder.query(&[("api_key", state.api_key.as_str())]),
        }
    }

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

    fn to_result(
        &self,
        phone: &PhoneNumber,
        state: &str,
        resp: StateCheckResponse,
    ) -> DncCheckResult {
        let mut reasons = Vec::new();
        if let Some(reason) = resp.reason {
            reasons.push(reason);
        } else if resp.is_listed {
            reasons.push(format!("registered on the {state} do-not-call list"));
        }
        DncCheckResult {
            phone_number: resp.phone.unwrap_or_else(|| phone.as_e164().to_string()),
            is_blocked: resp.is_listed,
            list_source: source_tag(state),
            reasons,
            confidence: 0.9,
            last_updated: Utc::now(),
            ttl_secs: RESULT_TTL_SECS,
            registration_date: resp
                .registration_date
                .as_deref()
                .and_then(parse_flexible_date),
        }
    }

    async fn check_one_state(
        &self,
        phone: &PhoneNumber,
        state: &str,
        config: &StateProviderConfig,
    ) -> DncResult<DncCheckResult> {
        let endpoint = config.states.get(state).ok_or_else(|| {
            DncError::Configuration(format!("state {state} has no endpoint config"))
        })?;
        let url = format!("{}{}", endpoint.base_url, endpoint.endpoints.check);
        let builder = self.http().get(&url).query(&[
            ("phone", phone.as_e164()),
            ("format", config.format.as_str()),
        ]);
        let response = self.execute(Self::apply_auth(builder, endpoint)).await?;

        let parsed: StateCheckResponse = response
            .json()
            .await
            .map_err(|e| DncError::InvalidResponse(e.to_string()))?;
        Ok(self.to_result(phone, state, parsed))
    }

    async fn batch_one_state(
        &self,
        state: &str,
        phones: &[PhoneNumber],
        config: &StateProviderConfig,
    ) -> DncResult<Vec<DncCheckResult>> {
        let endpoint = config.states.get(state).ok_or_else(|| {
            DncError::Configuration(format!("state {state} has no endpoint config"))
        })?;
        let url = format!("{}{}", endpoint.base_url, endpoint.endpoints.batch);

        let mut results = Vec::with_capacity(phones.len());
        for chunk in phones.chunks(config.batch_size.max(1)) {
            let numbers: Vec<&str> = chunk.iter().map(PhoneNumber::as_e164).collect();
            let body = serde_json::json!({ "numbers": numbers, "format": config.format });
            let builder = self.http().post(&url).json(&body);
            let response = self.execute(Self::apply_auth(builder, endpoint)).await?;

            let parsed: StateBatchResponse = response
                .json()
                .await
                .map_err(|e| DncError::InvalidResponse(e.to_string()))?;
            results.extend(
                parsed
                    .results
                    .into_iter()
                    .zip(chunk)
                    .map(|(item, phone)| self.to_result(phone, state, item)),
            );
        }
        Ok(results)
    }

    /// Add a number to a state's registry, where the state exposes a
    /// register endpoint.
    pub async fn register_number(&self, state: &str, phone: &PhoneNumber) -> DncResult<()> {
        let config = self.config.read().await.clone();
        let endpoint = config.states.get(state).ok_or_else(|| {
            DncError::Configuration(format!("state {state} has no endpoint config"))
        })?;
        let path = endpoint.endpoints.register.as_deref().ok_or_else(|| {
            DncError::Configuration(format!("state {state} has no register endpoint"))
        })?;
        let url = format!("{}{path}", endpoint.base_url);
        let body = serde_json::json!({ "phone": phone.as_e164() });
        let builder = self.http().post(&url).json(&body);
        self.execute(Self::apply_auth(builder, endpoint)).await?;
        Ok(())
    }

    /// Remove a number from a state's registry, where supported.
    pub async fn unregister_number(&self, state: &str, phone: &PhoneNumber) -> DncResult<()> {
        let config = self.config.read().await.clone();
        let endpoint = config.states.get(state).ok_or_else(|| {
            DncError::Configuration(format!("state {state} has no endpoint config"))
        })?;
        let path = endpoint.endpoints.unregister.as_deref().ok_or_else(|| {
            DncError::Configuration(format!("state {state} has no unregister endpoint"))
        })?;
        let url = format!("{}{path}", endpoint.base_url);
        let body = serde_json::json!({ "phone": phone.as_e164() });
        let builder = self.http().delete(&url).json(&body);
        self.execute(Self::apply_auth(builder, endpoint)).await?;
        Ok(())
    }
}

#[async_trait]
impl DncProvider for StateProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::State
    }

    fn provider_name(&self) -> &str {
        self.core.name()
    }

    async fn health_check(&self) -> DncResult<ProviderHealth> {
        let config = self.config.read().await.clone();
        let started = Instant::now();
        let mut metadata = HashMap::new();
        metadata.insert("provider_type".to_string(), "state".to_string());

        let mut any_healthy = false;
        for (state, endpoint) in &config.states {
            let url = format!("{}{}", endpoint.base_url, endpoint.endpoints.health);
            let builder = Self::apply_auth(self.http().get(&url), endpoint);
            let status = match builder.send().await {
                Ok(response) if response.status().is_success() => {
                    any_healthy = true;
                    "healthy".to_string()
                }
                Ok(response) => format!("http {}", response.status().as_u16()),
                Err(err) => {
                    debug!(state, %err, "state health probe failed");
                    "unreachable".to_string()
                }
            };
            metadata.insert(format!("state.{state}"), status);
        }
        self.core.observe(started, any_healthy);

        Ok(ProviderHealth {
            healthy: any_healthy,
            authenticated: any_healthy,
            connective: any_healthy,
            rate_limit_ok: self.core.bucket().try_peek(),
            response_time_ms: started.elapsed().as_millis() as u64,
            status_code: None,
            metadata,
            checked_at: Utc::now(),
        })
    }

    async fn check_number(&self, phone: &PhoneNumber) -> DncResult<DncCheckResult> {
        let config = self.config.read().await.clone();
        let candidates = config.candidate_states(phone);

        let mut first_negative: Option<DncCheckResult> = None;
        let mut last_error: Option<DncError> = None;
        for state in &candidates {
            match self.check_one_state(phone, state, &config).await {
                Ok(result) if result.is_blocked => return Ok(result),
                Ok(result) => {
                    if first_negative.is_none() {
                        first_negative = Some(result);
                    }
                }
                Err(err) => {
                    warn!(state, %err, "state check failed");
                    last_error = Some(err);
                }
            }
        }

        match (first_negative, last_error) {
            (Some(result), _) => Ok(result),
            (None, Some(err)) => Err(err),
            (None, None) => Err(DncError::Configuration(
                "no candidate states configured".into(),
            )),
        }
    }

    async fn batch_check_numbers(&self, phones: &[PhoneNumber]) -> BatchCheckOutcome {
        let config = self.config.read().await.clone();

        // Group by the primary candidate state before fanning out.
        let mut by_state: HashMap<String, Vec<PhoneNumber>> = HashMap::new();
        for phone in phones {
            let state = config
                .candidate_states(phone)
                .into_iter()
                .next()
                .unwrap_or_else(|| config.supported_states[0].clone());
            by_state.entry(state).or_default().push(phone.clone());
        }

        let mut results = Vec::with_capacity(phones.len());
        for (state, group) in by_state {
            match self.batch_one_state(&state, &group, &config).await {
                Ok(mut group_results) => results.append(&mut group_results),
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
        let since_param = since.to_rfc3339();

        let mut merged = SyncResult::default();
        for state in &config.supported_states {
            let Some(endpoint) = config.states.get(state) else {
                continue;
            };
            let url = format!("{}{}", endpoint.base_url, endpoint.endpoints.sync);
            let builder = self.http().get(&url).query(&[
                ("since", since_param.as_str()),
                ("format", config.format.as_str()),
            ]);
            let response = self.execute(Self::apply_auth(builder, endpoint)).await?;
            let parsed: StateUpdatesResponse = response
                .json()
                .await
                .map_err(|e| DncError::InvalidResponse(e.to_string()))?;

            for record in parsed.updates {
                match record.action.as_str() {
                    "deleted" => merged.deleted += 1,
                    action => {
                        if action == "updated" {
                            merged.updated += 1;
                        } else {
                            merged.added += 1;
                        }
                        merged.entries.push(DncEntry {
                            phone_number: record.phone_number,
                            list_source: source_tag(state),
                            suppress_reason: record
                                .reason
                                .unwrap_or_else(|| format!("{state} registration")),
                            registration_date: record
                                .registration_date
                                .as_deref()
                                .and_then(parse_flexible_date),
                            expires_at: None,
                        });
                    }
                }
            }
            if parsed.checkpoint.is_some() {
                merged.checkpoint = parsed.checkpoint;
            }
        }

        let elapsed = started.elapsed();
        merged.duration_ms = elapsed.as_millis() as u64;
        let total = merged.added + merged.updated + merged.deleted;
        merged.records_per_second = if elapsed.as_secs_f64() > 0.0 {
            total as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        Ok(merged)
    }

    async fn connect(&self) -> DncResult<()> {
        let health = self.health_check().await?;
        if !health.healthy {
            return Err(DncError::ConnectionFailed(format!(
                "state provider {} reached no state endpoints",
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
        StateProviderConfig::from_map(config).map(|_| ())
    }

    async fn set_config(&self, map: HashMap<String, String>) -> DncResult<()> {
        let next = StateProviderConfig::from_map(&map)?;
        let mut current = self.config.write().await;

        if next.request_timeout != current.request_timeout {
            *self.http.lock().unwrap() = build_client(next.request_timeout)?;
        }
        if next.rate_limit_rps != current.rate_limit_rps {
            self.core.set_rate(next.rate_limit_rps);
        }
        let secrets_rotated = next
            .states
            .iter()
            .any(|(state, cfg)| {
                current
                    .states
                    .get(state)
                    .is_none_or(|old| old.api_key != cfg.api_key)
            });

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
            ("supported_states", "CA,TX,NY"),
            ("state.CA.base_url", "https://dnc.ca.example.gov"),
            ("state.CA.api_key", "ca-key"),
            ("state.TX.base_url", "https://dnc.tx.example.gov"),
            ("state.TX.api_key", "tx-key"),
            ("state.TX.auth_type", "query_param"),
            ("state.NY.base_url", "https://dnc.ny.example.gov"),
            ("state.NY.api_key", "user:pass"),
            ("state.NY.auth_type", "basic"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_config_parses_per_state_endpoints() {
        let config = StateProviderConfig::from_map(&config_map()).unwrap();
        assert_eq!(config.supported_states, vec!["CA", "TX", "NY"]);
        assert_eq!(config.states["CA"].auth_type, StateAuthType::Bearer);
        assert_eq!(config.states["TX"].auth_type, StateAuthType::QueryParam);
        assert_eq!(config.states["NY"].auth_type, StateAuthType::Basic);
        assert_eq!(config.states["CA"].endpoints.check, "/check");
    }

    #[test]
    fn test_config_rejects_missing_state_block() {
        let mut map = config_map();
        map.remove("state.TX.base_url");
        assert!(StateProviderConfig::from_map(&map).is_err());
    }

    #[test]
    fn test_area_code_routes_to_configured_state() {
        let config = StateProviderConfig::from_map(&config_map()).unwrap();
        // 415 → CA, which is configured
        let phone = PhoneNumber::normalize("+14155551234").unwrap();
        assert_eq!(config.candidate_states(&phone), vec!["CA"]);
        // 512 → TX
        let phone = PhoneNumber::normalize("+15125551234").unwrap();
        assert_eq!(config.candidate_states(&phone), vec!["TX"]);
    }

    #[test]
    fn test_unsupported_state_falls_back_to_first_three() {
        let config = StateProviderConfig::from_map(&config_map()).unwrap();
        // 907 → AK, not configured → first three configured states
        let phone = PhoneNumber::normalize("+19075551234").unwrap();
        assert_eq!(config.candidate_states(&phone), vec!["CA", "TX", "NY"]);
    }
}
