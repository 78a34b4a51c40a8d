//! Cache manager scenarios: health round trip, peer services, and the
//! background cleanup worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dce_dnc::cache::{CacheManager, SlidingWindowRateLimiter};
use dce_dnc::kv::{KvStore, MemoryStore};

fn manager_on(store: Arc<MemoryStore>) -> Arc<CacheManager> {
    Arc::new(CacheManager::new(
        store as Arc<dyn KvStore>,
        Duration::from_secs(60),
    ))
}

#[tokio::test]
async fn test_health_check_round_trip() {
    let store = Arc::new(MemoryStore::new());
    let manager = manager_on(Arc::clone(&store));

    let health = manager.health_check().await.unwrap();
    assert!(health.store_ok);
    assert!(health.rate_limiter_ok);
    assert!(health.healthy());

    // the probe cleans up after itself
    assert!(!store.exists("dce:health:probe").await.unwrap());
}

#[tokio::test]
async fn test_stats_reports_dbsize() {
    let store = Arc::new(MemoryStore::new());
    store.set("a", b"1", None).await.unwrap();
    store.set("b", b"2", None).await.unwrap();

    let manager = manager_on(Arc::clone(&store));
    let stats = manager.stats().await.unwrap();
    assert_eq!(stats.dbsize, 2);
    assert!(stats.memory_info.contains("memory"));
}

#[tokio::test]
async fn test_sliding_window_rate_limiter() {
    let store = Arc::new(MemoryStore::new());
    let limiter = SlidingWindowRateLimiter::new(store as Arc<dyn KvStore>);

    for _ in 0..3 {
        assert!(limiter.check("caller", 3, Duration::from_secs(10)).await.unwrap());
    }
    // fourth request in the window is rejected and compensated away
    assert!(!limiter.check("caller", 3, Duration::from_secs(10)).await.unwrap());
    assert_eq!(limiter.usage("caller").await.unwrap(), 3);

    limiter.reset("caller").await.unwrap();
    assert!(limiter.check("caller", 3, Duration::from_secs(10)).await.unwrap());
}

#[tokio::test]
async fn test_rate_limit_window_slides() {
    let store = Arc::new(MemoryStore::new());
    let limiter = SlidingWindowRateLimiter::new(store as Arc<dyn KvStore>);
    let window = Duration::from_millis(80);

    assert!(limiter.check("caller", 1, window).await.unwrap());
    assert!(!limiter.check("caller", 1, window).await.unwrap());

    tokio::time::sleep(Duration::from_millis(120)).await;
    // the old timestamp aged out of the window
    assert!(limiter.check("caller", 1, window).await.unwrap());
}

#[tokio::test]
async fn test_cleanup_removes_expired_sessions_and_orphan_limiter_keys() {
    let store = Arc::new(MemoryStore::new());
    let manager = manager_on(Arc::clone(&store));

    // a live session (fresh expiry stamp)
    manager
        .sessions()
        .put("live", HashMap::new())
        .await
        .unwrap();
    // a malformed session hash with no expiry stamp: reaped
    store
        .hset_all("dce:session:broken", &[("user".to_string(), "x".to_string())])
        .await
        .unwrap();
    // a rate-limit key that lost its TTL: anomaly, reaped
    store.zadd("dce:ratelimit:orphan", 1.0, "m").await.unwrap();
    // a rate-limit key with a TTL: kept
    store.zadd("dce:ratelimit:active", 1.0, "m").await.unwrap();
    store
        .expire("dce:ratelimit:active", Duration::from_secs(60))
        .await
        .unwrap();

    let removed = manager.cleanup_pass().await.unwrap();
    assert_eq!(removed, 2);

    assert!(store.exists("dce:session:live").await.unwrap());
    assert!(!store.exists("dce:session:broken").await.unwrap());
    assert!(!store.exists("dce:ratelimit:orphan").await.unwrap());
    assert!(store.exists("dce:ratelimit:active").await.unwrap());
}

#[tokio::test]
async fn test_background_cleanup_worker_runs_and_stops() {
    let store = Arc::new(MemoryStore::new());
    let manager = manager_on(Arc::clone(&store));

    store.zadd("dce:ratelimit:orphan", 1.0, "m").await.unwrap();

    let handle = manager.start_background_cleanup(Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!store.exists("dce:ratelimit:orphan").await.unwrap());

    handle.shutdown(Duration::from_secs(1)).await;
}
