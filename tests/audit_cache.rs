//! End-to-end audit cache scenarios against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use dce_dnc::cache::{AuditCache, AuditCacheConfig};
use dce_dnc::error::DncError;
use dce_dnc::kv::MemoryStore;
use dce_dnc::model::AuditEvent;

fn cache_with(config: AuditCacheConfig) -> AuditCache {
    AuditCache::new(Arc::new(MemoryStore::new()), config)
}

fn cache() -> AuditCache {
    cache_with(AuditCacheConfig::default())
}

fn event(seq: i64, hash: &str) -> AuditEvent {
    AuditEvent {
        id: Uuid::new_v4(),
        sequence_num: seq,
        event_hash: hash.to_string(),
        body: serde_json::json!({ "action": "dnc_check", "seq": seq }),
    }
}

#[tokio::test]
async fn test_cache_hit_after_write() {
    let cache = cache();
    let e1 = event(1, "h1");

    cache.set_event(&e1).await.unwrap();
    let loaded = cache.get_event(&e1.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, e1.id);
    assert_eq!(loaded.sequence_num, 1);
    assert_eq!(loaded.event_hash, "h1");
    assert_eq!(loaded.body, e1.body);

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 0);
}

#[tokio::test]
async fn test_cache_miss() {
    let cache = cache();
    let loaded = cache.get_event(&Uuid::new_v4()).await.unwrap();
    assert!(loaded.is_none());

    let stats = cache.stats();
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn test_sequence_gaps_most_recent_first() {
    let cache = cache();
    cache.track_sequence_gap(10, 15).await.unwrap();
    cache.track_sequence_gap(20, 22).await.unwrap();

    let gaps = cache.sequence_gaps(10).await.unwrap();
    assert_eq!(gaps, vec![(20, 22), (10, 15)]);
}

#[tokio::test]
async fn test_gap_range_validation() {
    let cache = cache();
    let err = cache.track_sequence_gap(22, 20).await.unwrap_err();
    assert!(matches!(err, DncError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_concurrent_sequence_increments_are_distinct() {
    let cache = Arc::new(cache());

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let cache = Arc::clone(&cache);
        tasks.push(tokio::spawn(async move {
            cache.increment_sequence().await.unwrap()
        }));
    }
    let mut values = Vec::new();
    for task in tasks {
        values.push(task.await.unwrap());
    }

    values.sort_unstable();
    assert_eq!(values, (1..=10).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_sequence_reset_does_not_touch_events() {
    let cache = cache();
    let e1 = event(1, "h1");
    cache.set_event(&e1).await.unwrap();

    assert_eq!(cache.increment_sequence().await.unwrap(), 1);
    assert_eq!(cache.increment_sequence().await.unwrap(), 2);
    assert_eq!(cache.current_sequence().await.unwrap(), 2);

    cache.reset_sequence().await.unwrap();
    assert_eq!(cache.current_sequence().await.unwrap(), 0);
    // the persisted log survives the counter reset
    assert!(cache.get_event(&e1.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_lru_bounded_after_inserts() {
    let config = AuditCacheConfig {
        lru_size: 5,
        ..AuditCacheConfig::default()
    };
    let cache = cache_with(config);

    for seq in 0..8 {
        cache.set_event(&event(seq, "h")).await.unwrap();
    }
    assert_eq!(cache.lru_len().await.unwrap(), 5);
}

#[tokio::test]
async fn test_hash_chain_round_trip_and_clamp() {
    let config = AuditCacheConfig {
        max_batch: 10,
        ..AuditCacheConfig::default()
    };
    let cache = cache_with(config);

    for seq in 1..=20 {
        cache.set_hash(seq, &format!("hash-{seq}")).await.unwrap();
    }

    // oversized range clamps to max_batch, never errors on size alone
    let chain = cache.get_hash_chain(1, 100).await.unwrap();
    assert_eq!(chain.len(), 10);
    assert_eq!(chain[0], (1, "hash-1".to_string()));
    assert_eq!(chain[9], (10, "hash-10".to_string()));

    // inverted range is an invalid request
    let err = cache.get_hash_chain(10, 5).await.unwrap_err();
    assert!(matches!(err, DncError::InvalidRequest(_)));

    // gaps inside the range are simply absent
    let sparse = cache.get_hash_chain(18, 25).await.unwrap();
    assert_eq!(sparse.len(), 3);
}

#[tokio::test]
async fn test_latest_hash_is_all_or_nothing() {
    let store = Arc::new(MemoryStore::new());
    let cache = AuditCache::new(Arc::clone(&store) as Arc<dyn dce_dnc::kv::KvStore>, AuditCacheConfig::default());

    assert!(cache.latest_hash().await.unwrap().is_none());

    cache.set_latest_hash("head", 42).await.unwrap();
    assert_eq!(
        cache.latest_hash().await.unwrap(),
        Some(("head".to_string(), 42))
    );

    // one half expiring makes the pair a full miss
    use dce_dnc::kv::KvStore;
    store.delete("audit:latest:chain:seq").await.unwrap();
    assert!(cache.latest_hash().await.unwrap().is_none());
}

#[tokio::test]
async fn test_empty_latest_hash_rejected() {
    let cache = cache();
    let err = cache.set_latest_hash("", 1).await.unwrap_err();
    assert!(matches!(err, DncError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_batch_write_truncates_at_max_batch() {
    let config = AuditCacheConfig {
        max_batch: 3,
        ..AuditCacheConfig::default()
    };
    let cache = cache_with(config);

    let events: Vec<AuditEvent> = (0..5).map(|seq| event(seq, "h")).collect();
    let written = cache.set_events(&events).await.unwrap();
    assert_eq!(written, 3);

    // the first three exist, the truncated tail does not
    for e in &events[..3] {
        assert!(cache.get_event(&e.id).await.unwrap().is_some());
    }
    for e in &events[3..] {
        assert!(cache.get_event(&e.id).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_event_ttl_expires() {
    let config = AuditCacheConfig {
        event_ttl: Duration::from_millis(30),
        ttl_jitter: Duration::ZERO,
        ..AuditCacheConfig::default()
    };
    let cache = cache_with(config);
    let e1 = event(1, "h1");
    cache.set_event(&e1).await.unwrap();
    assert!(cache.get_event(&e1.id).await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(cache.get_event(&e1.id).await.unwrap().is_none());
}
