//! # dce-dnc
//!
//! Core of the Do-Not-Call compliance lookup subsystem: answers *is this
//! phone number suppressed from contact?* at high request rate by
//! orchestrating a pool of registry clients (federal, wireless, per-state,
//! internal) behind an aggressive Redis-keyed cache layer.
//!
//! The canonical lookup path runs caller → [`ProviderManager`] →
//! [`DncCache`] → on miss, one provider per type in failover order →
//! write-back → return. A separate [`AuditCache`] core records the
//! append-only audit trail (hash chain, monotonic sequence, gap log).
//!
//! ```no_run
//! use std::sync::Arc;
//! use dce_dnc::cache::{DncCache, DncCacheConfig};
//! use dce_dnc::kv::RedisStore;
//! use dce_dnc::phone::PhoneNumber;
//! use dce_dnc::provider::{ProviderManager, ProviderManagerConfig};
//!
//! # async fn run() -> dce_dnc::DncResult<()> {
//! let store = Arc::new(RedisStore::connect("redis://127.0.0.1/0").await
//!     .map_err(|e| dce_dnc::DncError::Internal(e.into()))?);
//! let cache = Arc::new(DncCache::new(store, DncCacheConfig::default()));
//! let manager = ProviderManager::new(ProviderManagerConfig::default())
//!     .with_cache(cache);
//! // register providers, then:
//! let phone = PhoneNumber::normalize("+1 415 555 1234")?;
//! let decision = manager.check_number(&phone, None).await?;
//! println!("blocked: {}", decision.is_blocked);
//! # Ok(())
//! # }
//! ```

pub mod bloom;
pub mod cache;
pub mod compress;
pub mod error;
pub mod kv;
pub mod model;
pub mod phone;
pub mod provider;

pub use bloom::BloomFilter;
pub use cache::{AuditCache, AuditCacheConfig, CacheManager, DncCache, DncCacheConfig};
pub use error::{DncError, DncResult};
pub use model::{AuditEvent, DncCheckResult, DncEntry, SyncResult};
pub use phone::PhoneNumber;
pub use provider::{DncProvider, ProviderManager, ProviderManagerConfig, ProviderType};
