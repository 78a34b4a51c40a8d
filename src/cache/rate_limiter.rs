//! Sliding-window rate limiter over a KVS sorted set.
//!
//! Each limited identity gets one sorted set of request timestamps. A
//! decision is one pipeline: drop everything older than the window, add
//! this request, count, refresh the key TTL. Counting happens after the
//! add, so the just-added member is included in the measurement — a
//! request is admitted when at most `limit - 1` prior requests sit in the
//! window. On rejection a compensating remove takes the member back out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::error::{DncError, DncResult};
use crate::kv::{KvError, KvStore, PipelineOp};

const KEY_PREFIX: &str = "dce:ratelimit:";

pub struct SlidingWindowRateLimiter {
    store: Arc<dyn KvStore>,
    // Disambiguates members created in the same millisecond.
    nonce: AtomicU64,
}

fn kv_internal(err: KvError) -> DncError {
    DncError::Internal(err.into())
}

pub(crate) fn limiter_key(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}

impl SlidingWindowRateLimiter {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            nonce: AtomicU64::new(0),
        }
    }

    /// Admit or reject one request for `id`. Returns whether the request
    /// is within `limit` per `window`.
    pub async fn check(&self, id: &str, limit: u64, window: Duration) -> DncResult<bool> {
        let key = limiter_key(id);
        let now_ms = Utc::now().timestamp_millis();
        let cutoff = (now_ms - window.as_millis() as i64) as f64;
        let member = format!("{now_ms}-{}", self.nonce.fetch_add(1, Ordering::Relaxed));

        let replies = self
            .store
            .pipeline(vec![
                PipelineOp::ZRemRangeByScore {
                    key: key.clone(),
                    min: f64::NEG_INFINITY,
                    max: cutoff,
                },
                PipelineOp::ZAdd {
                    key: key.clone(),
                    score: now_ms as f64,
                    member: member.clone(),
                },
                PipelineOp::ZCard { key: key.clone() },
                PipelineOp::Expire {
                    key: key.clone(),
                    ttl: window,
                },
            ])
            .await
            .map_err(kv_internal)?;

        let count = replies
            .get(2)
            .and_then(|r| r.as_int())
            .ok_or_else(|| DncError::Internal(anyhow::anyhow!("rate limiter pipeline reply")))?;

        if count as u64 > limit {
            // Over limit: take our own member back out so a rejected
            // request does not consume budget.
            if let Err(err) = self.store.zrem(&key, &member).await {
                debug!(%key, %err, "compensating zrem failed");
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// Clear all recorded requests for `id`.
    pub async fn reset(&self, id: &str) -> DncResult<()> {
        self.store
            .delete(&limiter_key(id))
            .await
            .map_err(kv_internal)?;
        Ok(())
    }

    /// Requests currently recorded in the window for `id`.
    pub async fn usage(&self, id: &str) -> DncResult<u64> {
        self.store.zcard(&limiter_key(id)).await.map_err(kv_internal)
    }
}
