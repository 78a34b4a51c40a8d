//! Cache manager: composes the KVS handle with its peer services and runs
//! the background cleanup worker.
//!
//! The worker reaps two classes of debris each tick: sessions whose
//! logical expiry has passed, and rate-limit keys that somehow lost their
//! TTL (an anomaly — every limiter decision refreshes it). Each tick is
//! bounded by a 30-second deadline; the worker stops on signal and is
//! joined on shutdown.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{DncError, DncResult};
use crate::kv::{KvError, KvStore};

use super::rate_limiter::SlidingWindowRateLimiter;
use super::session::SessionStore;

const HEALTH_PROBE_KEY: &str = "dce:health:probe";
const HEALTH_LIMITER_ID: &str = "health-probe";
const CLEANUP_TICK_DEADLINE: Duration = Duration::from_secs(30);

fn kv_internal(err: KvError) -> DncError {
    DncError::Internal(err.into())
}

/// Result of a manager health round trip.
#[derive(Debug, Clone, Serialize)]
pub struct CacheManagerHealth {
    pub store_ok: bool,
    pub rate_limiter_ok: bool,
    pub round_trip_ms: u64,
}

impl CacheManagerHealth {
    pub fn healthy(&self) -> bool {
        self.store_ok && self.rate_limiter_ok
    }
}

/// Store-level statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheManagerStats {
    pub memory_info: String,
    pub stats_info: String,
    pub dbsize: u64,
}

/// Handle to the background cleanup worker.
pub struct CleanupHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CleanupHandle {
    /// Signal the worker and wait for it, bounded by `deadline`.
    pub async fn shutdown(self, deadline: Duration) {
        let _ = self.stop.send(true);
        if tokio::time::timeout(deadline, self.handle).await.is_err() {
            warn!("cleanup worker did not stop within {deadline:?}");
        }
    }
}

pub struct CacheManager {
    store: Arc<dyn KvStore>,
    rate_limiter: Arc<SlidingWindowRateLimiter>,
    sessions: Arc<SessionStore>,
}

impl CacheManager {
    pub fn new(store: Arc<dyn KvStore>, session_ttl: Duration) -> Self {
        Self {
            rate_limiter: Arc::new(SlidingWindowRateLimiter::new(Arc::clone(&store))),
            sessions: Arc::new(SessionStore::new(Arc::clone(&store), session_ttl)),
            store,
        }
    }

    pub fn rate_limiter(&self) -> &SlidingWindowRateLimiter {
        &self.rate_limiter
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Round-trip probe through the store and the rate limiter.
    pub async fn health_check(&self) -> DncResult<CacheManagerHealth> {
        let started = std::time::Instant::now();

        let store_ok = async {
            self.store
                .set(HEALTH_PROBE_KEY, b"ok", Some(Duration::from_secs(10)))
                .await?;
            let read = self.store.get(HEALTH_PROBE_KEY).await?;
            self.store.delete(HEALTH_PROBE_KEY).await?;
            Ok::<bool, KvError>(read.as_deref() == Some(b"ok".as_slice()))
        }
        .await
        .unwrap_or(false);

        let rate_limiter_ok = match self
            .rate_limiter
            .check(HEALTH_LIMITER_ID, 10, Duration::from_secs(1))
            .await
        {
            Ok(admitted) => {
                let _ = self.rate_limiter.reset(HEALTH_LIMITER_ID).await;
                admitted
            }
            Err(_) => false,
        };

        Ok(CacheManagerHealth {
            store_ok,
            rate_limiter_ok,
            round_trip_ms: started.elapsed().as_millis() as u64,
        })
    }

    pub async fn stats(&self) -> DncResult<CacheManagerStats> {
        Ok(CacheManagerStats {
            memory_info: self.store.info("memory").await.map_err(kv_internal)?,
            stats_info: self.store.info("stats").await.map_err(kv_internal)?,
            dbsize: self.store.dbsize().await.map_err(kv_internal)?,
        })
    }

    /// One cleanup pass: reap logically-expired sessions and rate-limit
    /// keys missing a TTL. Returns how many keys were removed.
    pub async fn cleanup_pass(&self) -> DncResult<u64> {
        let mut removed = 0u64;

        for key in self.sessions.expired_session_keys().await? {
            if self.store.delete(&key).await.map_err(kv_internal)? {
                removed += 1;
            }
        }

        // A limiter key without a TTL would accumulate forever.
        let limiter_keys = self
            .store
            .scan("dce:ratelimit:*", 100)
            .await
            .map_err(kv_internal)?;
        for key in limiter_keys {
            if self.store.ttl(&key).await.map_err(kv_internal)?.is_none()
                && self.store.delete(&key).await.map_err(kv_internal)?
            {
                debug!(%key, "removed rate-limit key with no TTL");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Spawn the periodic cleanup worker.
    pub fn start_background_cleanup(self: &Arc<Self>, interval: Duration) -> CleanupHandle {
        let (stop, mut stopped) = watch::channel(false);
        let manager = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(?interval, "cache cleanup worker started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match tokio::time::timeout(CLEANUP_TICK_DEADLINE, manager.cleanup_pass()).await {
                            Ok(Ok(removed)) if removed > 0 => {
                                debug!(removed, "cleanup pass removed keys");
                            }
                            Ok(Ok(_)) => {}
                            Ok(Err(err)) => warn!(%err, "cleanup pass failed"),
                            Err(_) => warn!("cleanup pass exceeded {CLEANUP_TICK_DEADLINE:?}"),
                        }
                    }
                    _ = stopped.changed() => {
                        info!("cache cleanup worker stopping");
                        break;
                    }
                }
            }
        });

        CleanupHandle { stop, handle }
    }
}
