//! Read-through cache for DNC entries and check results.
//!
//! Keys are MD5 digests of the normalized number under the `dce:dnc:`
//! prefix (the digest is a fixed-length key suffix, nothing more). A bloom
//! filter short-circuits reads for numbers that were never written, bulk
//! paths ride pipelines, and invalidation is scoped per provider or list
//! source. Cache failures never fail an enclosing lookup: read errors
//! surface as `internal-error` and the provider manager treats them as a
//! miss.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::bloom::BloomFilter;
use crate::compress::{decode, Compressor, IdentityCompressor};
use crate::error::{DncError, DncResult};
use crate::kv::{KvError, KvStore, PipelineOp};
use crate::model::{CacheWriteSource, CachedDncEntry, DncCheckResult, DncEntry};
use crate::phone::PhoneNumber;

const KEY_PREFIX: &str = "dce:dnc:";
const WARMING_LOCK_KEY: &str = "dce:dnc:warming:warming_lock";

/// Tuning for the DNC lookup cache. Defaults match production policy.
#[derive(Debug, Clone)]
pub struct DncCacheConfig {
    /// TTL for cached entries.
    pub entry_ttl: Duration,
    /// TTL for cached positive check results (capped by the result's own TTL).
    pub check_ttl: Duration,
    /// TTL for cached negative check results.
    pub negative_check_ttl: Duration,
    /// TTL for provider-scoped keys.
    pub provider_ttl: Duration,
    /// TTL for persisted bloom-filter stats.
    pub bloom_ttl: Duration,
    /// TTL for persisted cache stats.
    pub stats_ttl: Duration,
    /// TTL on the distributed warming lock.
    pub warming_lock_ttl: Duration,
    /// Probability of extending a key's TTL on read.
    pub sliding_expiration_rate: f64,
    /// Serialized size above which the compression hook runs.
    pub compression_threshold: usize,
    /// Entries per pipeline in bulk writes.
    pub pipeline_batch_size: usize,
    /// Phones per load/write round during warming.
    pub warming_batch_size: usize,
    /// Pause between warming batches.
    pub warming_pause: Duration,
    /// SCAN batch hint and delete chunk size for invalidation.
    pub invalidation_batch: usize,
    /// Whether the bloom filter guards the negative path.
    pub bloom_enabled: bool,
}

impl Default for DncCacheConfig {
    fn default() -> Self {
        Self {
            entry_ttl: Duration::from_secs(24 * 3600),
            check_ttl: Duration::from_secs(6 * 3600),
            negative_check_ttl: Duration::from_secs(30 * 60),
            provider_ttl: Duration::from_secs(2 * 3600),
            bloom_ttl: Duration::from_secs(12 * 3600),
            stats_ttl: Duration::from_secs(5 * 60),
            warming_lock_ttl: Duration::from_secs(10 * 60),
            sliding_expiration_rate: 0.10,
            compression_threshold: 1024,
            pipeline_batch_size: 100,
            warming_batch_size: 1000,
            warming_pause: Duration::from_millis(10),
            invalidation_batch: 1000,
            bloom_enabled: true,
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    bloom_filter_hits: AtomicU64,
    pipeline_operations: AtomicU64,
    compressed_writes: AtomicU64,
    sliding_extensions: AtomicU64,
}

/// Point-in-time snapshot of the cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct DncCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub bloom_filter_hits: u64,
    pub pipeline_operations: u64,
    pub compressed_writes: u64,
    pub sliding_extensions: u64,
    pub bloom_estimated_items: Option<usize>,
}

/// Outcome of a bulk read: decoded hits plus the phones that missed.
#[derive(Debug)]
pub struct BulkGetOutcome {
    pub found: Vec<DncEntry>,
    pub missing: Vec<PhoneNumber>,
}

/// Outcome of a warming run.
#[derive(Debug, Clone, Serialize)]
pub struct WarmingReport {
    pub batches: usize,
    pub entries_written: usize,
}

/// The DNC lookup cache (see module docs).
pub struct DncCache {
    store: Arc<dyn KvStore>,
    bloom: Option<Arc<BloomFilter>>,
    compressor: Arc<dyn Compressor>,
    config: DncCacheConfig,
    counters: Arc<Counters>,
}

fn kv_internal(err: KvError) -> DncError {
    DncError::Internal(err.into())
}

fn digest(input: &str) -> String {
    format!("{:x}", md5::compute(input))
}

fn entry_key(phone: &PhoneNumber) -> String {
    format!("{KEY_PREFIX}entry:{}", digest(phone.as_e164()))
}

fn check_key(scope: &str) -> String {
    format!("{KEY_PREFIX}check:{}", digest(scope))
}

fn source_index_key(source: &str, phone_digest: &str) -> String {
    format!("{KEY_PREFIX}source:{source}:{phone_digest}")
}

fn provider_check_key(provider_id: &str, phone: &PhoneNumber) -> String {
    format!(
        "{KEY_PREFIX}provider:{provider_id}:check:{}",
        digest(phone.as_e164())
    )
}

/// Run the compression hook when the serialized value crosses the
/// threshold. The counter records the crossing, not bytes saved.
fn encode_value(
    bytes: Vec<u8>,
    threshold: usize,
    compressor: &dyn Compressor,
    counters: &Counters,
) -> DncResult<Vec<u8>> {
    if bytes.len() > threshold {
        counters.compressed_writes.fetch_add(1, Ordering::Relaxed);
        compressor.compress(&bytes)
    } else {
        Ok(bytes)
    }
}

impl DncCache {
    pub fn new(store: Arc<dyn KvStore>, config: DncCacheConfig) -> Self {
        let bloom = config
            .bloom_enabled
            .then(|| Arc::new(BloomFilter::default()));
        Self {
            store,
            bloom,
            compressor: Arc::new(IdentityCompressor),
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Replace the identity compression hook.
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn stats(&self) -> DncCacheStats {
        DncCacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            bloom_filter_hits: self.counters.bloom_filter_hits.load(Ordering::Relaxed),
            pipeline_operations: self.counters.pipeline_operations.load(Ordering::Relaxed),
            compressed_writes: self.counters.compressed_writes.load(Ordering::Relaxed),
            sliding_extensions: self.counters.sliding_extensions.load(Ordering::Relaxed),
            bloom_estimated_items: self.bloom.as_ref().map(|b| b.estimated_item_count()),
        }
    }

    /// Persist the counter snapshot for external observers.
    pub async fn persist_stats(&self) -> DncResult<()> {
        let stats = self.stats();
        let bytes = serde_json::to_vec(&stats).map_err(|e| DncError::Internal(e.into()))?;
        self.store
            .set(
                &format!("{KEY_PREFIX}stats"),
                &bytes,
                Some(self.config.stats_ttl),
            )
            .await
            .map_err(kv_internal)?;

        if let Some(bloom) = &self.bloom {
            let bloom_stats = serde_json::json!({
                "estimated_items": bloom.estimated_item_count(),
                "size_bits": bloom.size_bits(),
            });
            self.store
                .set(
                    &format!("{KEY_PREFIX}bloom:stats"),
                    bloom_stats.to_string().as_bytes(),
                    Some(self.config.bloom_ttl),
                )
                .await
                .map_err(kv_internal)?;
        }
        Ok(())
    }

    // ── Entry paths ────────────────────────────────────────────

    /// Single-entry read. `Ok(None)` is a miss; `Err` means the cache
    /// itself failed and the caller should fall through to a provider.
    pub async fn get_entry(&self, phone: &PhoneNumber) -> DncResult<Option<DncEntry>> {
        if let Some(bloom) = &self.bloom {
            if !bloom.contains(phone.as_e164()) {
                self.counters.bloom_filter_hits.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        }

        let key = entry_key(phone);
        let raw = match self.store.get(&key).await {
            Ok(raw) => raw,
            Err(err) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(kv_internal(err));
            }
        };
        let Some(raw) = raw else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let cached: CachedDncEntry = match decode(&raw).and_then(|bytes| {
            serde_json::from_slice(&bytes).map_err(|e| DncError::Internal(e.into()))
        }) {
            Ok(cached) => cached,
            Err(err) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        self.maybe_extend_ttl(&key);
        self.spawn_telemetry_refresh(key, cached.clone());

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(cached.entry))
    }

    /// Write-through. Failures are fatal to the write.
    pub async fn set_entry(&self, entry: &DncEntry, source: CacheWriteSource) -> DncResult<()> {
        let phone_digest = digest(&entry.phone_number);
        let key = format!("{KEY_PREFIX}entry:{phone_digest}");
        let wrapped = CachedDncEntry::new(entry.clone(), source);
        let bytes = serde_json::to_vec(&wrapped).map_err(|e| DncError::Internal(e.into()))?;
        let bytes = encode_value(
            bytes,
            self.config.compression_threshold,
            self.compressor.as_ref(),
            &self.counters,
        )?;

        self.store
            .set(&key, &bytes, Some(self.config.entry_ttl))
            .await
            .map_err(kv_internal)?;

        // Index key that makes source-scoped invalidation reachable.
        self.store
            .set(
                &source_index_key(&entry.list_source, &phone_digest),
                phone_digest.as_bytes(),
                Some(self.config.entry_ttl),
            )
            .await
            .map_err(kv_internal)?;

        if let Some(bloom) = &self.bloom {
            bloom.add(&entry.phone_number);
        }
        Ok(())
    }

    /// Bulk read in one pipeline round trip.
    pub async fn bulk_get_entries(&self, phones: &[PhoneNumber]) -> DncResult<BulkGetOutcome> {
        if phones.is_empty() {
            return Ok(BulkGetOutcome { found: Vec::new(), missing: Vec::new() });
        }

        let ops: Vec<PipelineOp> = phones
            .iter()
            .map(|p| PipelineOp::Get { key: entry_key(p) })
            .collect();
        self.counters.pipeline_operations.fetch_add(1, Ordering::Relaxed);

        let replies = match self.store.pipeline(ops).await {
            Ok(replies) => replies,
            Err(err) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(kv_internal(err));
            }
        };

        let mut found = Vec::new();
        let mut missing = Vec::new();
        for (phone, reply) in phones.iter().zip(replies) {
            match reply.into_bytes() {
                None => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    missing.push(phone.clone());
                }
                Some(raw) => match decode(&raw).and_then(|bytes| {
                    serde_json::from_slice::<CachedDncEntry>(&bytes)
                        .map_err(|e| DncError::Internal(e.into()))
                }) {
                    Ok(cached) => {
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                        self.spawn_telemetry_refresh(entry_key(phone), cached.clone());
                        found.push(cached.entry);
                    }
                    Err(_) => {
                        self.counters.errors.fetch_add(1, Ordering::Relaxed);
                        missing.push(phone.clone());
                    }
                },
            }
        }
        Ok(BulkGetOutcome { found, missing })
    }

    /// Bulk write in pipeline batches. A failed batch aborts the rest and
    /// surfaces; returns how many entries were written.
    pub async fn bulk_set_entries(
        &self,
        entries: &[DncEntry],
        source: CacheWriteSource,
    ) -> DncResult<usize> {
        let mut written = 0;
        for batch in entries.chunks(self.config.pipeline_batch_size.max(1)) {
            let mut ops = Vec::with_capacity(batch.len() * 2);
            for entry in batch {
                let phone_digest = digest(&entry.phone_number);
                let wrapped = CachedDncEntry::new(entry.clone(), source);
                let bytes =
                    serde_json::to_vec(&wrapped).map_err(|e| DncError::Internal(e.into()))?;
                let bytes = encode_value(
                    bytes,
                    self.config.compression_threshold,
                    self.compressor.as_ref(),
                    &self.counters,
                )?;
                ops.push(PipelineOp::Set {
                    key: format!("{KEY_PREFIX}entry:{phone_digest}"),
                    value: bytes,
                    ttl: Some(self.config.entry_ttl),
                });
                ops.push(PipelineOp::Set {
                    key: source_index_key(&entry.list_source, &phone_digest),
                    value: phone_digest.into_bytes(),
                    ttl: Some(self.config.entry_ttl),
                });
            }

            self.counters.pipeline_operations.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = self.store.pipeline(ops).await {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(kv_internal(err));
            }

            if let Some(bloom) = &self.bloom {
                for entry in batch {
                    bloom.add(&entry.phone_number);
                }
            }
            written += batch.len();
        }
        Ok(written)
    }

    // ── Check-result paths ─────────────────────────────────────

    pub async fn get_check_result(&self, phone: &PhoneNumber) -> DncResult<Option<DncCheckResult>> {
        if let Some(bloom) = &self.bloom {
            if !bloom.contains(phone.as_e164()) {
                self.counters.bloom_filter_hits.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        }
        self.read_check(&check_key(phone.as_e164())).await
    }

    pub async fn set_check_result(&self, result: &DncCheckResult) -> DncResult<()> {
        self.write_check(&check_key(&result.phone_number), result, None)
            .await?;
        if let Some(bloom) = &self.bloom {
            bloom.add(&result.phone_number);
        }
        Ok(())
    }

    /// Provider-scoped check caching (cache-aside inside a client). Keys
    /// live under `provider:<id>:*` so provider invalidation reaches them.
    pub async fn get_provider_check(
        &self,
        provider_id: &str,
        phone: &PhoneNumber,
    ) -> DncResult<Option<DncCheckResult>> {
        self.read_check(&provider_check_key(provider_id, phone)).await
    }

    pub async fn set_provider_check(
        &self,
        provider_id: &str,
        result: &DncCheckResult,
    ) -> DncResult<()> {
        let phone = PhoneNumber::normalize(&result.phone_number)?;
        self.write_check(
            &provider_check_key(provider_id, &phone),
            result,
            Some(self.config.provider_ttl),
        )
        .await
    }

    /// Check caching under a caller-composed scope (the manager's
    /// `dnc:<phone>:<types...>` composite key).
    pub async fn get_scoped_check(&self, scope: &str) -> DncResult<Option<DncCheckResult>> {
        self.read_check(&check_key(scope)).await
    }

    pub async fn set_scoped_check(&self, scope: &str, result: &DncCheckResult) -> DncResult<()> {
        self.write_check(&check_key(scope), result, None).await
    }

    async fn read_check(&self, key: &str) -> DncResult<Option<DncCheckResult>> {
        let raw = match self.store.get(key).await {
            Ok(raw) => raw,
            Err(err) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(kv_internal(err));
            }
        };
        let Some(raw) = raw else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let result: DncCheckResult = match decode(&raw).and_then(|bytes| {
            serde_json::from_slice(&bytes).map_err(|e| DncError::Internal(e.into()))
        }) {
            Ok(result) => result,
            Err(err) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        // The result carries its own expiry, independent of store TTL.
        if result.is_expired() {
            let store = Arc::clone(&self.store);
            let key = key.to_string();
            tokio::spawn(async move {
                if let Err(err) = store.delete(&key).await {
                    debug!(%key, %err, "stale check-result eviction failed");
                }
            });
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        self.maybe_extend_ttl(key);
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(result))
    }

    async fn write_check(
        &self,
        key: &str,
        result: &DncCheckResult,
        ttl_override: Option<Duration>,
    ) -> DncResult<()> {
        let base_ttl = ttl_override.unwrap_or(if result.is_blocked {
            self.config.check_ttl
        } else {
            self.config.negative_check_ttl
        });
        // Store TTL never outlives the result's own validity.
        let ttl = base_ttl.min(Duration::from_secs(result.ttl_secs.max(1)));

        let bytes = serde_json::to_vec(result).map_err(|e| DncError::Internal(e.into()))?;
        let bytes = encode_value(
            bytes,
            self.config.compression_threshold,
            self.compressor.as_ref(),
            &self.counters,
        )?;
        self.store
            .set(key, &bytes, Some(ttl))
            .await
            .map_err(kv_internal)
    }

    // ── Invalidation ───────────────────────────────────────────

    /// Delete every key scoped to one provider. Returns how many keys
    /// were removed.
    pub async fn invalidate_provider(&self, provider_id: &str) -> DncResult<u64> {
        let pattern = format!("{KEY_PREFIX}provider:{provider_id}:*");
        let keys = self
            .store
            .scan(&pattern, self.config.invalidation_batch)
            .await
            .map_err(kv_internal)?;
        let removed = self.delete_chunked(&keys).await?;
        debug!(provider_id, removed, "provider cache invalidated");
        Ok(removed)
    }

    /// Delete every entry written from one list source. When the sweep is
    /// large the bloom filter is reset and rebuilt lazily by later writes.
    pub async fn invalidate_source(&self, list_source: &str) -> DncResult<u64> {
        let pattern = format!("{KEY_PREFIX}source:{list_source}:*");
        let index_keys = self
            .store
            .scan(&pattern, self.config.invalidation_batch)
            .await
            .map_err(kv_internal)?;

        // Each index key names the digest of the entry it was written with.
        let mut doomed = Vec::with_capacity(index_keys.len() * 2);
        for index_key in &index_keys {
            if let Some(phone_digest) = index_key.rsplit(':').next() {
                doomed.push(format!("{KEY_PREFIX}entry:{phone_digest}"));
            }
            doomed.push(index_key.clone());
        }
        let removed = self.delete_chunked(&doomed).await?;

        if index_keys.len() > self.config.invalidation_batch {
            if let Some(bloom) = &self.bloom {
                warn!(
                    list_source,
                    keys = index_keys.len(),
                    "large source invalidation: resetting bloom filter"
                );
                bloom.reset();
            }
        }
        Ok(removed)
    }

    async fn delete_chunked(&self, keys: &[String]) -> DncResult<u64> {
        let mut removed = 0u64;
        for chunk in keys.chunks(self.config.invalidation_batch.max(1)) {
            let ops = chunk
                .iter()
                .map(|k| PipelineOp::Delete { key: k.clone() })
                .collect();
            self.counters.pipeline_operations.fetch_add(1, Ordering::Relaxed);
            let replies = self.store.pipeline(ops).await.map_err(kv_internal)?;
            removed += replies
                .iter()
                .filter_map(|r| r.as_int())
                .sum::<i64>() as u64;
        }
        Ok(removed)
    }

    // ── Warming ────────────────────────────────────────────────

    /// Warm the cache from an authoritative loader under a distributed
    /// lock. Exactly one warming run proceeds at a time; contenders fail
    /// fast with a retryable error and issue no writes.
    pub async fn warm_cache<F, Fut>(
        &self,
        phones: &[PhoneNumber],
        load: F,
    ) -> DncResult<WarmingReport>
    where
        F: Fn(Vec<PhoneNumber>) -> Fut,
        Fut: Future<Output = DncResult<Vec<DncEntry>>>,
    {
        let claimed = self
            .store
            .set_nx(WARMING_LOCK_KEY, b"1", self.config.warming_lock_ttl)
            .await
            .map_err(kv_internal)?;
        if !claimed {
            return Err(DncError::RateLimitExceeded(
                "cache warming already in progress".into(),
            ));
        }

        let result = self.warm_locked(phones, load).await;

        // Best-effort release; the TTL bounds a crashed holder anyway.
        if let Err(err) = self.store.delete(WARMING_LOCK_KEY).await {
            warn!(%err, "failed to release warming lock");
        }
        result
    }

    async fn warm_locked<F, Fut>(&self, phones: &[PhoneNumber], load: F) -> DncResult<WarmingReport>
    where
        F: Fn(Vec<PhoneNumber>) -> Fut,
        Fut: Future<Output = DncResult<Vec<DncEntry>>>,
    {
        let mut report = WarmingReport { batches: 0, entries_written: 0 };
        for batch in phones.chunks(self.config.warming_batch_size.max(1)) {
            let entries = load(batch.to_vec()).await?;
            report.entries_written += self
                .bulk_set_entries(&entries, CacheWriteSource::Warming)
                .await?;
            report.batches += 1;
            tokio::time::sleep(self.config.warming_pause).await;
        }
        debug!(
            batches = report.batches,
            entries = report.entries_written,
            "cache warming complete"
        );
        Ok(report)
    }

    // ── Async maintenance ──────────────────────────────────────

    /// Sliding expiration: with the configured probability, extend the
    /// key's TTL off the read path.
    fn maybe_extend_ttl(&self, key: &str) {
        if rand::thread_rng().gen::<f64>() >= self.config.sliding_expiration_rate {
            return;
        }
        self.counters.sliding_extensions.fetch_add(1, Ordering::Relaxed);
        let store = Arc::clone(&self.store);
        let key = key.to_string();
        let ttl = self.config.entry_ttl;
        tokio::spawn(async move {
            if let Err(err) = store.expire(&key, ttl).await {
                debug!(%key, %err, "sliding TTL extension failed");
            }
        });
    }

    /// Fire-and-forget access-telemetry refresh. Rewrites the wrapper with
    /// bumped counters under the key's remaining TTL; failures only log.
    fn spawn_telemetry_refresh(&self, key: String, mut cached: CachedDncEntry) {
        let store = Arc::clone(&self.store);
        let compressor = Arc::clone(&self.compressor);
        let counters = Arc::clone(&self.counters);
        let threshold = self.config.compression_threshold;
        tokio::spawn(async move {
            cached.touch();
            let refresh = async {
                let remaining = store.ttl(&key).await.map_err(kv_internal)?;
                let bytes =
                    serde_json::to_vec(&cached).map_err(|e| DncError::Internal(e.into()))?;
                let bytes = encode_value(bytes, threshold, compressor.as_ref(), &counters)?;
                store.set(&key, &bytes, remaining).await.map_err(kv_internal)
            };
            if let Err(err) = refresh.await {
                debug!(%key, %err, "access telemetry refresh failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_scheme() {
        let phone = PhoneNumber::normalize("+14155551234").unwrap();
        let key = entry_key(&phone);
        assert!(key.starts_with("dce:dnc:entry:"));
        // md5 hex digest is fixed-length
        assert_eq!(key.len(), "dce:dnc:entry:".len() + 32);

        let check = check_key(phone.as_e164());
        assert!(check.starts_with("dce:dnc:check:"));

        let scoped = provider_check_key("ftc-primary", &phone);
        assert!(scoped.starts_with("dce:dnc:provider:ftc-primary:check:"));
    }

    #[test]
    fn test_encode_value_threshold() {
        let counters = Counters::default();
        let small = encode_value(vec![0u8; 10], 1024, &IdentityCompressor, &counters).unwrap();
        assert_eq!(small.len(), 10);
        assert_eq!(counters.compressed_writes.load(Ordering::Relaxed), 0);

        let large = encode_value(vec![0u8; 2048], 1024, &IdentityCompressor, &counters).unwrap();
        assert_eq!(large.len(), 2048);
        // counts "would have compressed" even under the identity hook
        assert_eq!(counters.compressed_writes.load(Ordering::Relaxed), 1);
    }
}
