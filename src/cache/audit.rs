//! Append-only audit event cache.
//!
//! Stores event bodies, hash-chain fragments, the monotonic sequence
//! counter, and a gap log, all in the KVS under the `audit:` prefix. The
//! store is the only source of ordering — this cache holds no in-process
//! lock beyond its counters. Every TTL gets additive jitter so a burst of
//! writes does not expire as a thundering herd.
//!
//! Durability is the point of this cache, so write failures surface to the
//! caller; only the LRU bookkeeping is best-effort.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::{DncError, DncResult};
use crate::kv::{KvError, KvStore, PipelineOp};
use crate::model::AuditEvent;

const PREFIX: &str = "audit:";
const SEQ_KEY: &str = "audit:seq:current";
const LATEST_HASH_KEY: &str = "audit:latest:chain:hash";
const LATEST_SEQ_KEY: &str = "audit:latest:chain:seq";
const GAP_KEY: &str = "audit:gap:detected";
const LRU_KEY: &str = "audit:event:lru";

#[derive(Debug, Clone)]
pub struct AuditCacheConfig {
    pub event_ttl: Duration,
    pub hash_ttl: Duration,
    pub latest_ttl: Duration,
    pub sequence_ttl: Duration,
    pub batch_ttl: Duration,
    pub stats_ttl: Duration,
    /// Additive jitter drawn uniformly from `[0, ttl_jitter]` per write.
    pub ttl_jitter: Duration,
    /// Bound on the LRU tracking set.
    pub lru_size: usize,
    /// Cap on multi-key reads and batch writes.
    pub max_batch: usize,
}

impl Default for AuditCacheConfig {
    fn default() -> Self {
        Self {
            event_ttl: Duration::from_secs(3600),
            hash_ttl: Duration::from_secs(24 * 3600),
            latest_ttl: Duration::from_secs(5 * 60),
            sequence_ttl: Duration::from_secs(3600),
            batch_ttl: Duration::from_secs(10 * 60),
            stats_ttl: Duration::from_secs(5 * 60),
            ttl_jitter: Duration::from_secs(30),
            lru_size: 10_000,
            max_batch: 100,
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    events_written: AtomicU64,
    lru_evictions: AtomicU64,
    gaps_tracked: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub events_written: u64,
    pub lru_evictions: u64,
    pub gaps_tracked: u64,
}

/// Cache core for the immutable audit log.
pub struct AuditCache {
    store: Arc<dyn KvStore>,
    config: AuditCacheConfig,
    counters: Counters,
}

fn kv_internal(err: KvError) -> DncError {
    DncError::Internal(err.into())
}

fn event_key(id: &Uuid) -> String {
    format!("{PREFIX}event:{id}")
}

fn hash_key(seq: i64) -> String {
    format!("{PREFIX}hash:{seq}")
}

impl AuditCache {
    pub fn new(store: Arc<dyn KvStore>, config: AuditCacheConfig) -> Self {
        Self {
            store,
            config,
            counters: Counters::default(),
        }
    }

    fn jittered(&self, ttl: Duration) -> Duration {
        let jitter = self.config.ttl_jitter.as_secs();
        if jitter == 0 {
            return ttl;
        }
        ttl + Duration::from_secs(rand::thread_rng().gen_range(0..=jitter))
    }

    pub fn stats(&self) -> AuditCacheStats {
        AuditCacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            events_written: self.counters.events_written.load(Ordering::Relaxed),
            lru_evictions: self.counters.lru_evictions.load(Ordering::Relaxed),
            gaps_tracked: self.counters.gaps_tracked.load(Ordering::Relaxed),
        }
    }

    /// Persist the counter snapshot for external observers.
    pub async fn persist_stats(&self) -> DncResult<()> {
        let bytes =
            serde_json::to_vec(&self.stats()).map_err(|e| DncError::Internal(e.into()))?;
        self.store
            .set(
                &format!("{PREFIX}stats"),
                &bytes,
                Some(self.jittered(self.config.stats_ttl)),
            )
            .await
            .map_err(kv_internal)
    }

    // ── Event bodies ───────────────────────────────────────────

    /// Store one event and track it in the LRU set. The event write is
    /// authoritative; LRU bookkeeping is best-effort and never rolls the
    /// write back.
    pub async fn set_event(&self, event: &AuditEvent) -> DncResult<()> {
        let bytes = serde_json::to_vec(event).map_err(|e| DncError::Internal(e.into()))?;
        self.store
            .set(&event_key(&event.id), &bytes, Some(self.jittered(self.config.event_ttl)))
            .await
            .map_err(|err| {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                kv_internal(err)
            })?;
        self.counters.events_written.fetch_add(1, Ordering::Relaxed);

        self.track_lru(&[event.id]).await;
        Ok(())
    }

    pub async fn get_event(&self, id: &Uuid) -> DncResult<Option<AuditEvent>> {
        let raw = self.store.get(&event_key(id)).await.map_err(|err| {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            kv_internal(err)
        })?;
        let Some(raw) = raw else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        let event: AuditEvent = serde_json::from_slice(&raw).map_err(|err| {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            DncError::Internal(err.into())
        })?;
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(event))
    }

    /// Multi-event write in one pipeline. Input beyond `max_batch` is
    /// dropped by truncation — callers chunk. Returns how many were
    /// written.
    pub async fn set_events(&self, events: &[AuditEvent]) -> DncResult<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        if events.len() > self.config.max_batch {
            warn!(
                submitted = events.len(),
                max = self.config.max_batch,
                "audit batch truncated"
            );
        }
        let batch = &events[..events.len().min(self.config.max_batch)];

        let now = Utc::now().timestamp() as f64;
        let mut ops = Vec::with_capacity(batch.len() * 2 + 2);
        for event in batch {
            let bytes = serde_json::to_vec(event).map_err(|e| DncError::Internal(e.into()))?;
            ops.push(PipelineOp::Set {
                key: event_key(&event.id),
                value: bytes,
                ttl: Some(self.jittered(self.config.event_ttl)),
            });
            ops.push(PipelineOp::ZAdd {
                key: LRU_KEY.to_string(),
                score: now,
                member: event.id.to_string(),
            });
        }
        // Batch manifest for observability of in-flight bulk writes.
        let manifest: Vec<String> = batch.iter().map(|e| e.id.to_string()).collect();
        ops.push(PipelineOp::Set {
            key: format!("{PREFIX}batch:{}", Uuid::new_v4()),
            value: serde_json::to_vec(&manifest).map_err(|e| DncError::Internal(e.into()))?,
            ttl: Some(self.jittered(self.config.batch_ttl)),
        });
        ops.push(PipelineOp::ZRemRangeByRank {
            key: LRU_KEY.to_string(),
            start: 0,
            stop: -(self.config.lru_size as isize) - 1,
        });

        let replies = self.store.pipeline(ops).await.map_err(|err| {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            kv_internal(err)
        })?;
        if let Some(evicted) = replies.last().and_then(|r| r.as_int()) {
            self.counters
                .lru_evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }
        self.counters
            .events_written
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(batch.len())
    }

    /// Number of event ids currently tracked in the LRU set.
    pub async fn lru_len(&self) -> DncResult<u64> {
        self.store.zcard(LRU_KEY).await.map_err(kv_internal)
    }

    async fn track_lru(&self, ids: &[Uuid]) {
        let now = Utc::now().timestamp() as f64;
        let mut ops: Vec<PipelineOp> = ids
            .iter()
            .map(|id| PipelineOp::ZAdd {
                key: LRU_KEY.to_string(),
                score: now,
                member: id.to_string(),
            })
            .collect();
        ops.push(PipelineOp::ZRemRangeByRank {
            key: LRU_KEY.to_string(),
            start: 0,
            stop: -(self.config.lru_size as isize) - 1,
        });

        match self.store.pipeline(ops).await {
            Ok(replies) => {
                if let Some(evicted) = replies.last().and_then(|r| r.as_int()) {
                    self.counters
                        .lru_evictions
                        .fetch_add(evicted as u64, Ordering::Relaxed);
                }
            }
            Err(err) => warn!(%err, "audit LRU tracking failed"),
        }
    }

    // ── Sequence generation ────────────────────────────────────

    /// Atomically assign the next sequence number. The increment is the
    /// single linearization point: concurrent callers get distinct,
    /// strictly increasing values.
    pub async fn increment_sequence(&self) -> DncResult<i64> {
        let value = self.store.incr(SEQ_KEY).await.map_err(kv_internal)?;
        if value == 1 {
            // First touch created the key; give it its expiry.
            if let Err(err) = self
                .store
                .expire(SEQ_KEY, self.jittered(self.config.sequence_ttl))
                .await
            {
                warn!(%err, "failed to set sequence TTL");
            }
        }
        Ok(value)
    }

    /// Current counter value; `0` when no sequence has been assigned yet.
    pub async fn current_sequence(&self) -> DncResult<i64> {
        let raw = self.store.get(SEQ_KEY).await.map_err(kv_internal)?;
        Ok(raw
            .and_then(|b| String::from_utf8(b).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0))
    }

    /// Reset the counter. The persisted event log is untouched.
    pub async fn reset_sequence(&self) -> DncResult<()> {
        self.store.delete(SEQ_KEY).await.map_err(kv_internal)?;
        Ok(())
    }

    // ── Hash chain ─────────────────────────────────────────────

    pub async fn set_hash(&self, seq: i64, hash: &str) -> DncResult<()> {
        if hash.is_empty() {
            return Err(DncError::InvalidRequest("empty chain hash".into()));
        }
        self.store
            .set(
                &hash_key(seq),
                hash.as_bytes(),
                Some(self.jittered(self.config.hash_ttl)),
            )
            .await
            .map_err(kv_internal)
    }

    /// Fetch a hash-chain window in one multi-get. The range is clamped to
    /// `max_batch` elements; an oversized range is never an error by
    /// itself. Returns the present `(seq, hash)` fragments.
    pub async fn get_hash_chain(&self, from: i64, to: i64) -> DncResult<Vec<(i64, String)>> {
        if from > to {
            return Err(DncError::InvalidRequest(format!(
                "hash chain range {from}..{to} is inverted"
            )));
        }
        let span = (to - from + 1).min(self.config.max_batch as i64);
        let seqs: Vec<i64> = (from..from + span).collect();
        let keys: Vec<String> = seqs.iter().map(|s| hash_key(*s)).collect();

        let values = self.store.mget(&keys).await.map_err(kv_internal)?;
        Ok(seqs
            .into_iter()
            .zip(values)
            .filter_map(|(seq, value)| {
                value
                    .and_then(|b| String::from_utf8(b).ok())
                    .map(|hash| (seq, hash))
            })
            .collect())
    }

    /// Record the chain head. Hash and sequence land in one pipeline so a
    /// reader never observes a torn head.
    pub async fn set_latest_hash(&self, hash: &str, seq: i64) -> DncResult<()> {
        if hash.is_empty() {
            return Err(DncError::InvalidRequest("empty chain hash".into()));
        }
        let ttl = self.jittered(self.config.latest_ttl);
        self.store
            .pipeline(vec![
                PipelineOp::Set {
                    key: LATEST_HASH_KEY.to_string(),
                    value: hash.as_bytes().to_vec(),
                    ttl: Some(ttl),
                },
                PipelineOp::Set {
                    key: LATEST_SEQ_KEY.to_string(),
                    value: seq.to_string().into_bytes(),
                    ttl: Some(ttl),
                },
            ])
            .await
            .map_err(kv_internal)?;
        Ok(())
    }

    /// Read the chain head. Partial presence (one key expired before the
    /// other) counts as a full miss.
    pub async fn latest_hash(&self) -> DncResult<Option<(String, i64)>> {
        let values = self
            .store
            .mget(&[LATEST_HASH_KEY.to_string(), LATEST_SEQ_KEY.to_string()])
            .await
            .map_err(kv_internal)?;

        let mut iter = values.into_iter();
        let hash = iter.next().flatten().and_then(|b| String::from_utf8(b).ok());
        let seq = iter
            .next()
            .flatten()
            .and_then(|b| String::from_utf8(b).ok())
            .and_then(|s| s.parse::<i64>().ok());

        match (hash, seq) {
            (Some(hash), Some(seq)) => Ok(Some((hash, seq))),
            _ => Ok(None),
        }
    }

    // ── Gap tracking ───────────────────────────────────────────

    /// Record a detected sequence gap. Informational only — nothing here
    /// verifies or repairs the chain.
    pub async fn track_sequence_gap(&self, start: i64, end: i64) -> DncResult<()> {
        if start > end {
            return Err(DncError::InvalidRequest(format!(
                "gap range {start}..{end} is inverted"
            )));
        }
        let member = format!("{start}-{end}");
        self.store
            .zadd(GAP_KEY, Utc::now().timestamp() as f64, &member)
            .await
            .map_err(kv_internal)?;
        self.counters.gaps_tracked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Most recently detected gaps, newest first.
    pub async fn sequence_gaps(&self, limit: usize) -> DncResult<Vec<(i64, i64)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let members = self
            .store
            .zrevrange(GAP_KEY, 0, limit as isize - 1)
            .await
            .map_err(kv_internal)?;
        Ok(members
            .iter()
            .filter_map(|m| {
                let (start, end) = m.split_once('-')?;
                Some((start.parse().ok()?, end.parse().ok()?))
            })
            .collect())
    }
}
