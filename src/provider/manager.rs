//! Provider manager: registry, selection, health monitoring, batch
//! fan-out, and failover across provider types.
//!
//! Locking discipline: the registry, the health map, and the metrics
//! aggregate sit behind separate locks, and no path takes two exclusive
//! locks at once. Round-robin cursors are atomics inside the pool so
//! selection only ever needs the shared registry lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::DncCache;
use crate::error::{DncError, DncResult};
use crate::model::{DncCheckResult, ProviderHealth};
use crate::phone::PhoneNumber;

use super::http::build_client;
use super::{DncProvider, ProviderType};

/// How the manager picks among healthy providers of one type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    RoundRobin,
    Random,
    Priority,
    LeastLatency,
    Weighted,
}

/// Provider discovery endpoint settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub endpoint: String,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ProviderManagerConfig {
    /// Type order tried when the caller does not name types.
    pub default_type_order: Vec<ProviderType>,
    pub strategy: LoadBalanceStrategy,
    /// Per-type provider name ordering for the priority strategy.
    pub provider_priorities: HashMap<ProviderType, Vec<String>>,
    /// Per-provider weights for the weighted strategy (default 1).
    pub provider_weights: HashMap<String, u32>,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    /// Consecutive failures before a provider is marked unhealthy.
    pub unhealthy_threshold: u32,
    /// Consecutive successes before an unhealthy provider is restored.
    pub healthy_threshold: u32,
    pub metrics_rollup_interval: Duration,
    pub discovery: Option<DiscoveryConfig>,
}

impl Default for ProviderManagerConfig {
    fn default() -> Self {
        Self {
            default_type_order: vec![
                ProviderType::Federal,
                ProviderType::State,
                ProviderType::Internal,
            ],
            strategy: LoadBalanceStrategy::RoundRobin,
            provider_priorities: HashMap::new(),
            provider_weights: HashMap::new(),
            health_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(10),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            metrics_rollup_interval: Duration::from_secs(30),
            discovery: None,
        }
    }
}

/// A provider described by the discovery endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveredProvider {
    pub provider_type: ProviderType,
    pub name: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

/// Builds a concrete client from a discovery record.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, discovered: &DiscoveredProvider) -> DncResult<Arc<dyn DncProvider>>;
}

struct TypePool {
    providers: Vec<Arc<dyn DncProvider>>,
    cursor: AtomicUsize,
    last_used: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl TypePool {
    fn new() -> Self {
        Self {
            providers: Vec::new(),
            cursor: AtomicUsize::new(0),
            last_used: Mutex::new(HashMap::new()),
        }
    }

    /// The primary is the first registered provider of the type.
    fn primary(&self) -> Option<&Arc<dyn DncProvider>> {
        self.providers.first()
    }
}

#[derive(Debug, Clone)]
struct HealthRecord {
    healthy: bool,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last: Option<ProviderHealth>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            // Optimistic until the first probe says otherwise.
            healthy: true,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last: None,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ManagerMetrics {
    pub checks: u64,
    pub cache_hits: u64,
    pub provider_calls: u64,
    pub failovers: u64,
    pub errors: u64,
    pub batch_checks: u64,
}

/// Outcome of a manager-level batch: partial results plus per-provider
/// error summary.
#[derive(Debug, Default)]
pub struct ManagerBatchOutcome {
    pub results: Vec<DncCheckResult>,
    pub errors: Vec<(String, DncError)>,
}

pub struct ProviderManager {
    config: ProviderManagerConfig,
    registry: Arc<RwLock<HashMap<ProviderType, TypePool>>>,
    health: Arc<RwLock<HashMap<String, HealthRecord>>>,
    metrics: Arc<Mutex<ManagerMetrics>>,
    cache: Option<Arc<DncCache>>,
    monitoring: AtomicBool,
    stop: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ProviderManager {
    pub fn new(config: ProviderManagerConfig) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            config,
            registry: Arc::new(RwLock::new(HashMap::new())),
            health: Arc::new(RwLock::new(HashMap::new())),
            metrics: Arc::new(Mutex::new(ManagerMetrics::default())),
            cache: None,
            monitoring: AtomicBool::new(false),
            stop,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Attach the lookup cache consulted before any provider call.
    pub fn with_cache(mut self, cache: Arc<DncCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn metrics(&self) -> ManagerMetrics {
        self.metrics.lock().unwrap().clone()
    }

    // ── Registry ───────────────────────────────────────────────

    pub async fn register_provider(&self, provider: Arc<dyn DncProvider>) -> DncResult<()> {
        let name = provider.provider_name().to_string();
        let provider_type = provider.provider_type();
        {
            let mut registry = self.registry.write().await;
            let pool = registry.entry(provider_type).or_insert_with(TypePool::new);
            if pool.providers.iter().any(|p| p.provider_name() == name) {
                return Err(DncError::InvalidRequest(format!(
                    "provider {name:?} is already registered"
                )));
            }
            pool.providers.push(Arc::clone(&provider));
        }
        self.health
            .write()
            .await
            .insert(name.clone(), HealthRecord::default());

        info!(provider = %name, provider_type = %provider_type, "provider registered");
        if self.monitoring.load(Ordering::Relaxed) {
            self.spawn_health_checker(provider);
        }
        Ok(())
    }

    pub async fn unregister_provider(&self, name: &str) -> DncResult<()> {
        let mut found = false;
        {
            let mut registry = self.registry.write().await;
            for pool in registry.values_mut() {
                let before = pool.providers.len();
                pool.providers.retain(|p| p.provider_name() != name);
                found |= pool.providers.len() < before;
            }
        }
        if !found {
            return Err(DncError::NotFound(format!(
                "provider {name:?} is not registered"
            )));
        }
        // Its health checker notices the missing record and exits.
        self.health.write().await.remove(name);
        info!(provider = name, "provider unregistered");
        Ok(())
    }

    pub async fn provider_names(&self, provider_type: ProviderType) -> Vec<String> {
        let registry = self.registry.read().await;
        registry
            .get(&provider_type)
            .map(|pool| {
                pool.providers
                    .iter()
                    .map(|p| p.provider_name().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First-registered provider of a type.
    pub async fn primary_provider(
        &self,
        provider_type: ProviderType,
    ) -> Option<Arc<dyn DncProvider>> {
        let registry = self.registry.read().await;
        registry
            .get(&provider_type)
            .and_then(|pool| pool.primary().cloned())
    }

    pub async fn health_snapshot(&self) -> HashMap<String, bool> {
        self.health
            .read()
            .await
            .iter()
            .map(|(name, record)| (name.clone(), record.healthy))
            .collect()
    }

    // ── Selection ──────────────────────────────────────────────

    /// Pick one provider of a type per the configured strategy. Healthy
    /// providers are preferred; an all-unhealthy pool falls back to every
    /// registered provider so circuits surface the errors.
    pub async fn select_provider(
        &self,
        provider_type: ProviderType,
    ) -> Option<Arc<dyn DncProvider>> {
        let health = {
            let map = self.health.read().await;
            map.iter()
                .map(|(name, record)| (name.clone(), record.healthy))
                .collect::<HashMap<_, _>>()
        };

        let registry = self.registry.read().await;
        let pool = registry.get(&provider_type)?;
        if pool.providers.is_empty() {
            return None;
        }

        let healthy: Vec<&Arc<dyn DncProvider>> = pool
            .providers
            .iter()
            .filter(|p| health.get(p.provider_name()).copied().unwrap_or(true))
            .collect();
        let candidates: Vec<&Arc<dyn DncProvider>> = if healthy.is_empty() {
            pool.providers.iter().collect()
        } else {
            healthy
        };
        let chosen: Arc<dyn DncProvider> = match self.config.strategy {
            LoadBalanceStrategy::RoundRobin => {
                let index = pool.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                Arc::clone(candidates[index])
            }
            LoadBalanceStrategy::Random => {
                let index = rand::thread_rng().gen_range(0..candidates.len());
                Arc::clone(candidates[index])
            }
            LoadBalanceStrategy::Priority => {
                let priorities = self
                    .config
                    .provider_priorities
                    .get(&provider_type)
                    .cloned()
                    .unwrap_or_default();
                Arc::clone(
                    candidates
                        .iter()
                        .min_by_key(|p| {
                            priorities
                                .iter()
                                .position(|n| n == p.provider_name())
                                .unwrap_or(usize::MAX)
                        })
                        .expect("candidates not empty"),
                )
            }
            LoadBalanceStrategy::LeastLatency => Arc::clone(
                candidates
                    .iter()
                    .min_by(|a, b| {
                        a.metrics()
                            .avg_response_ms
                            .total_cmp(&b.metrics().avg_response_ms)
                    })
                    .expect("candidates not empty"),
            ),
            LoadBalanceStrategy::Weighted => {
                let weights: Vec<u64> = candidates
                    .iter()
                    .map(|p| {
                        u64::from(
                            self.config
                                .provider_weights
                                .get(p.provider_name())
                                .copied()
                                .unwrap_or(1)
                                .max(1),
                        )
                    })
                    .collect();
                let total: u64 = weights.iter().sum();
                let mut draw = rand::thread_rng().gen_range(0..total);
                let mut index = 0;
                for (i, weight) in weights.iter().enumerate() {
                    if draw < *weight {
                        index = i;
                        break;
                    }
                    draw -= weight;
                }
                Arc::clone(candidates[index])
            }
        };

        pool.last_used
            .lock()
            .unwrap()
            .insert(chosen.provider_name().to_string(), Utc::now());
        Some(chosen)
    }

    // ── Lookup paths ───────────────────────────────────────────

    /// The canonical lookup: cache first, then one provider per type in
    /// order until a success; the result is written back to the cache.
    pub async fn check_number(
        &self,
        phone: &PhoneNumber,
        types: Option<&[ProviderType]>,
    ) -> DncResult<DncCheckResult> {
        let order: Vec<ProviderType> = match types {
            Some(types) if !types.is_empty() => types.to_vec(),
            Some(_) => {
                return Err(DncError::InvalidRequest(
                    "empty provider type list".into(),
                ))
            }
            None => self.config.default_type_order.clone(),
        };
        self.metrics.lock().unwrap().checks += 1;

        let scope = Self::cache_scope(phone, &order);
        if let Some(cache) = &self.cache {
            match cache.get_scoped_check(&scope).await {
                Ok(Some(result)) => {
                    self.metrics.lock().unwrap().cache_hits += 1;
                    return Ok(result);
                }
                Ok(None) => {}
                // A broken cache never fails a lookup.
                Err(err) => debug!(%err, "cache lookup failed; falling through"),
            }
        }

        let mut last_error: Option<DncError> = None;
        let mut attempted = false;
        for provider_type in &order {
            let Some(provider) = self.select_provider(*provider_type).await else {
                continue;
            };
            if provider.circuit_state() == super::CircuitState::Open {
                debug!(
                    provider = provider.provider_name(),
                    "skipping provider with open circuit"
                );
                self.metrics.lock().unwrap().failovers += 1;
                last_error = Some(DncError::ProviderUnavailable(format!(
                    "circuit open for provider {}",
                    provider.provider_name()
                )));
                continue;
            }

            if attempted {
                self.metrics.lock().unwrap().failovers += 1;
            }
            attempted = true;

            // Provider-scoped cache-aside: a decision this client produced
            // recently is reused without a network call, and lives under
            // the provider's key scope so provider invalidation reaches it.
            if let Some(cache) = &self.cache {
                if let Ok(Some(result)) = cache
                    .get_provider_check(provider.provider_name(), phone)
                    .await
                {
                    self.metrics.lock().unwrap().cache_hits += 1;
                    return Ok(result);
                }
            }
            self.metrics.lock().unwrap().provider_calls += 1;

            match provider.check_number(phone).await {
                Ok(result) => {
                    if let Some(cache) = &self.cache {
                        if let Err(err) = cache
                            .set_provider_check(provider.provider_name(), &result)
                            .await
                        {
                            debug!(%err, "provider-scoped cache write failed");
                        }
                        if let Err(err) = cache.set_scoped_check(&scope, &result).await {
                            debug!(%err, "cache write-back failed");
                        }
                    }
                    return Ok(result);
                }
                Err(err) => {
                    warn!(
                        provider = provider.provider_name(),
                        provider_type = %provider_type,
                        %err,
                        "provider check failed; trying next type"
                    );
                    self.metrics.lock().unwrap().errors += 1;
                    last_error = Some(err);
                }
            }
        }

        let last = last_error.unwrap_or_else(|| {
            DncError::ProviderUnavailable("no providers registered for requested types".into())
        });
        Err(last.into_all_providers_failed())
    }

    /// Batch lookup: each phone is routed through normal selection for the
    /// first applicable type, phones are grouped per selected provider,
    /// and groups fan out concurrently. Failed groups land in the error
    /// summary; their phones are absent from the results.
    pub async fn batch_check_numbers(
        &self,
        phones: &[PhoneNumber],
        types: Option<&[ProviderType]>,
    ) -> ManagerBatchOutcome {
        let order: Vec<ProviderType> = match types {
            Some(types) if !types.is_empty() => types.to_vec(),
            _ => self.config.default_type_order.clone(),
        };
        self.metrics.lock().unwrap().batch_checks += 1;

        let mut groups: HashMap<String, (Arc<dyn DncProvider>, Vec<PhoneNumber>)> = HashMap::new();
        let mut outcome = ManagerBatchOutcome::default();
        for phone in phones {
            let mut selected = None;
            for provider_type in &order {
                if let Some(provider) = self.select_provider(*provider_type).await {
                    if provider.circuit_state() == super::CircuitState::Open {
                        continue;
                    }
                    selected = Some(provider);
                    break;
                }
            }
            match selected {
                Some(provider) => {
                    groups
                        .entry(provider.provider_name().to_string())
                        .or_insert_with(|| (provider, Vec::new()))
                        .1
                        .push(phone.clone());
                }
                None => outcome.errors.push((
                    phone.as_e164().to_string(),
                    DncError::ProviderUnavailable("no provider available".into()),
                )),
            }
        }

        let tasks: Vec<_> = groups
            .into_values()
            .map(|(provider, group)| {
                tokio::spawn(async move {
                    let name = provider.provider_name().to_string();
                    let result = provider.batch_check_numbers(&group).await;
                    (name, result)
                })
            })
            .collect();

        for joined in futures::future::join_all(tasks).await {
            match joined {
                Ok((name, batch)) => {
                    outcome.results.extend(batch.results);
                    if let Some(error) = batch.error {
                        warn!(provider = %name, %error, "batch group failed");
                        outcome.errors.push((name, error));
                    }
                }
                Err(err) => {
                    outcome.errors.push((
                        "unknown".to_string(),
                        DncError::Internal(anyhow::anyhow!("batch task panicked: {err}")),
                    ));
                }
            }
        }
        outcome
    }

    fn cache_scope(phone: &PhoneNumber, order: &[ProviderType]) -> String {
        let mut scope = format!("dnc:{}", phone.as_e164());
        for provider_type in order {
            scope.push(':');
            scope.push_str(provider_type.as_str());
        }
        scope
    }

    // ── Background workers ─────────────────────────────────────

    /// Start per-provider health checkers (and the metrics rollup and
    /// discovery workers when configured).
    pub async fn start(&self) {
        if self.monitoring.swap(true, Ordering::Relaxed) {
            return;
        }
        let providers: Vec<Arc<dyn DncProvider>> = {
            let registry = self.registry.read().await;
            registry
                .values()
                .flat_map(|pool| pool.providers.iter().cloned())
                .collect()
        };
        for provider in providers {
            self.spawn_health_checker(provider);
        }
        self.spawn_metrics_rollup();
        if self.config.discovery.is_some() {
            warn!("provider discovery configured but no factory attached; call start_discovery");
        }
    }

    fn spawn_health_checker(&self, provider: Arc<dyn DncProvider>) {
        let health = Arc::clone(&self.health);
        let interval = self.config.health_interval;
        let timeout = self.config.health_timeout;
        let unhealthy_threshold = self.config.unhealthy_threshold;
        let healthy_threshold = self.config.healthy_threshold;
        let mut stopped = self.stop.subscribe();

        let handle = tokio::spawn(async move {
            let name = provider.provider_name().to_string();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let probe = tokio::time::timeout(timeout, provider.health_check()).await;
                        let report = match probe {
                            Ok(Ok(report)) => Some(report),
                            Ok(Err(err)) => {
                                debug!(provider = %name, %err, "health check errored");
                                None
                            }
                            Err(_) => {
                                debug!(provider = %name, "health check timed out");
                                None
                            }
                        };
                        let succeeded = report.as_ref().is_some_and(|r| r.healthy);

                        let mut map = health.write().await;
                        let Some(record) = map.get_mut(&name) else {
                            // Unregistered while we probed.
                            break;
                        };
                        if succeeded {
                            record.consecutive_successes += 1;
                            record.consecutive_failures = 0;
                            if !record.healthy
                                && record.consecutive_successes >= healthy_threshold
                            {
                                info!(provider = %name, "provider restored to healthy");
                                record.healthy = true;
                            }
                        } else {
                            record.consecutive_failures += 1;
                            record.consecutive_successes = 0;
                            if record.healthy
                                && record.consecutive_failures >= unhealthy_threshold
                            {
                                warn!(provider = %name, "provider marked unhealthy");
                                record.healthy = false;
                            }
                        }
                        record.last = report;
                    }
                    _ = stopped.changed() => break,
                }
            }
        });
        self.workers.lock().unwrap().push(handle);
    }

    fn spawn_metrics_rollup(&self) {
        let metrics = Arc::clone(&self.metrics);
        let registry = Arc::clone(&self.registry);
        let interval = self.config.metrics_rollup_interval;
        let mut stopped = self.stop.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = metrics.lock().unwrap().clone();
                        let provider_requests: u64 = {
                            let registry = registry.read().await;
                            registry
                                .values()
                                .flat_map(|pool| pool.providers.iter())
                                .map(|p| p.metrics().requests)
                                .sum()
                        };
                        info!(
                            checks = snapshot.checks,
                            cache_hits = snapshot.cache_hits,
                            failovers = snapshot.failovers,
                            errors = snapshot.errors,
                            provider_requests,
                            "dnc manager metrics rollup"
                        );
                    }
                    _ = stopped.changed() => break,
                }
            }
        });
        self.workers.lock().unwrap().push(handle);
    }

    /// Start the discovery refresher with a factory that can build clients
    /// from discovery records.
    pub fn start_discovery(self: &Arc<Self>, factory: Arc<dyn ProviderFactory>) -> DncResult<()> {
        let Some(discovery) = self.config.discovery.clone() else {
            return Err(DncError::Configuration(
                "no discovery endpoint configured".into(),
            ));
        };
        let manager = Arc::clone(self);
        let client = build_client(Duration::from_secs(10))?;
        let mut stopped = self.stop.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(discovery.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match Self::discover(&client, &discovery.endpoint).await {
                            Ok(discovered) => {
                                for record in discovered {
                                    let already_registered = manager
                                        .provider_names(record.provider_type)
                                        .await
                                        .contains(&record.name);
                                    if already_registered {
                                        continue;
                                    }
                                    match factory.build(&record) {
                                        Ok(provider) => {
                                            if let Err(err) =
                                                manager.register_provider(provider).await
                                            {
                                                warn!(%err, "discovered provider not registered");
                                            }
                                        }
                                        Err(err) => {
                                            warn!(name = %record.name, %err, "factory rejected discovered provider");
                                        }
                                    }
                                }
                            }
                            Err(err) => debug!(%err, "provider discovery poll failed"),
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
        });
        self.workers.lock().unwrap().push(handle);
        Ok(())
    }

    async fn discover(
        client: &reqwest::Client,
        endpoint: &str,
    ) -> DncResult<Vec<DiscoveredProvider>> {
        let response = client.get(endpoint).send().await?;
        if !response.status().is_success() {
            return Err(DncError::ProviderUnavailable(format!(
                "discovery endpoint returned HTTP {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| DncError::InvalidResponse(e.to_string()))
    }

    /// Stop every worker and wait for them, bounded by `deadline`.
    pub async fn shutdown(&self, deadline: Duration) {
        let _ = self.stop.send(true);
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().unwrap());
        let join_all = async {
            for handle in workers {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(deadline, join_all).await.is_err() {
            warn!("provider manager workers did not stop within {deadline:?}");
        }
        self.monitoring.store(false, Ordering::Relaxed);
    }
}
