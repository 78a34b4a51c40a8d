//! Provider manager scenarios: failover, selection, health transitions,
//! circuit short-circuiting, and batch fan-out — all against scripted
//! providers, no network.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{phone, MockBehavior, MockProvider};

use dce_dnc::cache::{DncCache, DncCacheConfig};
use dce_dnc::error::DncError;
use dce_dnc::kv::{KvStore, MemoryStore};
use dce_dnc::provider::{
    CircuitBreakerConfig, CircuitState, DncProvider, LoadBalanceStrategy, ProviderManager,
    ProviderManagerConfig, ProviderType,
};

fn mock(name: &str, ptype: ProviderType, behavior: MockBehavior) -> Arc<MockProvider> {
    Arc::new(MockProvider::new(
        name,
        ptype,
        behavior,
        CircuitBreakerConfig::default(),
    ))
}

#[tokio::test]
async fn test_first_successful_type_wins() {
    let manager = ProviderManager::new(ProviderManagerConfig::default());
    let federal = mock("ftc-1", ProviderType::Federal, MockBehavior::Blocked);
    let state = mock("state-1", ProviderType::State, MockBehavior::Clear);
    manager.register_provider(federal.clone()).await.unwrap();
    manager.register_provider(state.clone()).await.unwrap();

    let result = manager.check_number(&phone("+14155551234"), None).await.unwrap();
    assert!(result.is_blocked);
    assert_eq!(result.list_source, "mock-federal");
    assert_eq!(federal.upstream_calls(), 1);
    assert_eq!(state.upstream_calls(), 0);
}

#[tokio::test]
async fn test_failover_to_next_type() {
    let manager = ProviderManager::new(ProviderManagerConfig::default());
    let federal = mock("ftc-1", ProviderType::Federal, MockBehavior::Unavailable);
    let state = mock("state-1", ProviderType::State, MockBehavior::Blocked);
    manager.register_provider(federal.clone()).await.unwrap();
    manager.register_provider(state.clone()).await.unwrap();

    let result = manager.check_number(&phone("+14155551234"), None).await.unwrap();
    assert_eq!(result.list_source, "mock-state");
    assert_eq!(federal.upstream_calls(), 1);
    assert_eq!(state.upstream_calls(), 1);
    assert!(manager.metrics().failovers >= 1);
}

#[tokio::test]
async fn test_all_providers_failed_carries_last_error() {
    let manager = ProviderManager::new(ProviderManagerConfig::default());
    manager
        .register_provider(mock("ftc-1", ProviderType::Federal, MockBehavior::Unavailable))
        .await
        .unwrap();
    manager
        .register_provider(mock("state-1", ProviderType::State, MockBehavior::Unavailable))
        .await
        .unwrap();

    let err = manager
        .check_number(&phone("+14155551234"), None)
        .await
        .unwrap_err();
    match &err {
        DncError::AllProvidersFailed { last } => {
            assert!(matches!(**last, DncError::ProviderUnavailable(_)));
        }
        other => panic!("expected all-providers-failed, got {other:?}"),
    }
    // the underlying 503 is retryable, so the aggregate is too
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_empty_type_list_rejected() {
    let manager = ProviderManager::new(ProviderManagerConfig::default());
    let err = manager
        .check_number(&phone("+14155551234"), Some(&[]))
        .await
        .unwrap_err();
    assert!(matches!(err, DncError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_circuit_opens_and_blocks_without_upstream_traffic() {
    // failure_threshold 3: five induced 503s → calls 4+ never reach the
    // fake upstream
    let provider = Arc::new(MockProvider::new(
        "ftc-1",
        ProviderType::Federal,
        MockBehavior::Unavailable,
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 5,
        },
    ));

    let p = phone("+14155551234");
    for _ in 0..5 {
        let err = provider.check_number(&p).await.unwrap_err();
        assert!(matches!(err, DncError::ProviderUnavailable(_)));
    }

    assert_eq!(provider.circuit_state(), CircuitState::Open);
    assert_eq!(provider.upstream_calls(), 3);
}

#[tokio::test]
async fn test_manager_skips_open_circuit() {
    let manager = ProviderManager::new(ProviderManagerConfig::default());
    let federal = mock("ftc-1", ProviderType::Federal, MockBehavior::Blocked);
    let state = mock("state-1", ProviderType::State, MockBehavior::Clear);
    manager.register_provider(federal.clone()).await.unwrap();
    manager.register_provider(state.clone()).await.unwrap();

    federal.force_circuit_open();
    let result = manager.check_number(&phone("+14155551234"), None).await.unwrap();
    assert_eq!(result.list_source, "mock-state");
    assert_eq!(federal.upstream_calls(), 0);
}

#[tokio::test]
async fn test_round_robin_rotates_within_type() {
    let manager = ProviderManager::new(ProviderManagerConfig::default());
    manager
        .register_provider(mock("ftc-1", ProviderType::Federal, MockBehavior::Clear))
        .await
        .unwrap();
    manager
        .register_provider(mock("ftc-2", ProviderType::Federal, MockBehavior::Clear))
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..4 {
        let provider = manager.select_provider(ProviderType::Federal).await.unwrap();
        seen.push(provider.provider_name().to_string());
    }
    assert_eq!(seen, vec!["ftc-1", "ftc-2", "ftc-1", "ftc-2"]);
}

#[tokio::test]
async fn test_priority_strategy_prefers_configured_order() {
    let mut config = ProviderManagerConfig {
        strategy: LoadBalanceStrategy::Priority,
        ..ProviderManagerConfig::default()
    };
    config
        .provider_priorities
        .insert(ProviderType::Federal, vec!["ftc-2".to_string(), "ftc-1".to_string()]);
    let manager = ProviderManager::new(config);
    manager
        .register_provider(mock("ftc-1", ProviderType::Federal, MockBehavior::Clear))
        .await
        .unwrap();
    manager
        .register_provider(mock("ftc-2", ProviderType::Federal, MockBehavior::Clear))
        .await
        .unwrap();

    for _ in 0..3 {
        let provider = manager.select_provider(ProviderType::Federal).await.unwrap();
        assert_eq!(provider.provider_name(), "ftc-2");
    }
}

#[tokio::test]
async fn test_unhealthy_provider_skipped_until_recovery() {
    let config = ProviderManagerConfig {
        health_interval: Duration::from_millis(20),
        health_timeout: Duration::from_millis(200),
        unhealthy_threshold: 1,
        healthy_threshold: 1,
        ..ProviderManagerConfig::default()
    };
    let manager = ProviderManager::new(config);
    let a = mock("ftc-a", ProviderType::Federal, MockBehavior::Clear);
    let b = mock("ftc-b", ProviderType::Federal, MockBehavior::Clear);
    manager.register_provider(a.clone()).await.unwrap();
    manager.register_provider(b.clone()).await.unwrap();

    a.set_healthy(false);
    manager.start().await;
    tokio::time::sleep(Duration::from_millis(80)).await;

    let health = manager.health_snapshot().await;
    assert_eq!(health.get("ftc-a"), Some(&false));
    assert_eq!(health.get("ftc-b"), Some(&true));

    // round-robin over healthy providers only: always b
    for _ in 0..4 {
        let provider = manager.select_provider(ProviderType::Federal).await.unwrap();
        assert_eq!(provider.provider_name(), "ftc-b");
    }

    // a recovers and rejoins the rotation
    a.set_healthy(true);
    tokio::time::sleep(Duration::from_millis(80)).await;
    let health = manager.health_snapshot().await;
    assert_eq!(health.get("ftc-a"), Some(&true));

    let mut seen_a = false;
    for _ in 0..4 {
        let provider = manager.select_provider(ProviderType::Federal).await.unwrap();
        seen_a |= provider.provider_name() == "ftc-a";
    }
    assert!(seen_a);

    manager.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_cache_short_circuits_second_lookup() {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(DncCache::new(
        store as Arc<dyn KvStore>,
        DncCacheConfig {
            sliding_expiration_rate: 0.0,
            ..DncCacheConfig::default()
        },
    ));
    let manager = ProviderManager::new(ProviderManagerConfig::default()).with_cache(cache);
    let federal = mock("ftc-1", ProviderType::Federal, MockBehavior::Blocked);
    manager.register_provider(federal.clone()).await.unwrap();

    let p = phone("+14155551234");
    let first = manager.check_number(&p, None).await.unwrap();
    assert!(first.is_blocked);
    assert_eq!(federal.upstream_calls(), 1);

    let second = manager.check_number(&p, None).await.unwrap();
    assert!(second.is_blocked);
    // served from cache, no second provider call
    assert_eq!(federal.upstream_calls(), 1);
    assert_eq!(manager.metrics().cache_hits, 1);
}

#[tokio::test]
async fn test_batch_fans_out_per_provider() {
    let manager = ProviderManager::new(ProviderManagerConfig::default());
    let federal = mock("ftc-1", ProviderType::Federal, MockBehavior::Clear);
    manager.register_provider(federal.clone()).await.unwrap();

    let phones: Vec<_> = (0..6).map(|i| phone(&format!("+1415555{i:04}"))).collect();
    let outcome = manager.batch_check_numbers(&phones, None).await;
    assert_eq!(outcome.results.len(), 6);
    assert!(outcome.errors.is_empty());
    assert_eq!(federal.upstream_calls(), 6);
}

#[tokio::test]
async fn test_batch_reports_partial_failure() {
    let manager = ProviderManager::new(ProviderManagerConfig::default());
    let federal = mock("ftc-1", ProviderType::Federal, MockBehavior::Unavailable);
    manager.register_provider(federal.clone()).await.unwrap();

    let phones: Vec<_> = (0..3).map(|i| phone(&format!("+1415555{i:04}"))).collect();
    let outcome = manager.batch_check_numbers(&phones, None).await;
    assert!(outcome.results.is_empty());
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].0, "ftc-1");
}

#[tokio::test]
async fn test_unregister_removes_provider() {
    let manager = ProviderManager::new(ProviderManagerConfig::default());
    manager
        .register_provider(mock("ftc-1", ProviderType::Federal, MockBehavior::Clear))
        .await
        .unwrap();
    assert_eq!(
        manager.provider_names(ProviderType::Federal).await,
        vec!["ftc-1"]
    );

    manager.unregister_provider("ftc-1").await.unwrap();
    assert!(manager.provider_names(ProviderType::Federal).await.is_empty());
    assert!(manager.select_provider(ProviderType::Federal).await.is_none());

    let err = manager.unregister_provider("ftc-1").await.unwrap_err();
    assert!(matches!(err, DncError::NotFound(_)));
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let manager = ProviderManager::new(ProviderManagerConfig::default());
    manager
        .register_provider(mock("ftc-1", ProviderType::Federal, MockBehavior::Clear))
        .await
        .unwrap();
    let err = manager
        .register_provider(mock("ftc-1", ProviderType::Federal, MockBehavior::Clear))
        .await
        .unwrap_err();
    assert!(matches!(err, DncError::InvalidRequest(_)));
}
