//! Per-session state in KVS hash maps.
//!
//! One hash per session under `dce:session:<id>`, with both a key TTL and
//! an `expires_at` field so the cleanup worker can find sessions whose
//! logical expiry has passed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::error::{DncError, DncResult};
use crate::kv::{KvError, KvStore};

const KEY_PREFIX: &str = "dce:session:";
const EXPIRES_AT_FIELD: &str = "expires_at";

pub struct SessionStore {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

fn kv_internal(err: KvError) -> DncError {
    DncError::Internal(err.into())
}

fn session_key(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}

impl SessionStore {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn put(&self, id: &str, fields: HashMap<String, String>) -> DncResult<()> {
        let key = session_key(id);
        let expires_at = Utc::now().timestamp() + self.ttl.as_secs() as i64;

        let mut pairs: Vec<(String, String)> = fields.into_iter().collect();
        pairs.push((EXPIRES_AT_FIELD.to_string(), expires_at.to_string()));

        self.store.hset_all(&key, &pairs).await.map_err(kv_internal)?;
        self.store.expire(&key, self.ttl).await.map_err(kv_internal)?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> DncResult<Option<HashMap<String, String>>> {
        let fields = self
            .store
            .hget_all(&session_key(id))
            .await
            .map_err(kv_internal)?;
        Ok((!fields.is_empty()).then_some(fields))
    }

    pub async fn delete(&self, id: &str) -> DncResult<bool> {
        self.store.delete(&session_key(id)).await.map_err(kv_internal)
    }

    /// Slide the session's expiry forward.
    pub async fn touch(&self, id: &str) -> DncResult<bool> {
        let key = session_key(id);
        let expires_at = Utc::now().timestamp() + self.ttl.as_secs() as i64;
        let exists = self.store.expire(&key, self.ttl).await.map_err(kv_internal)?;
        if exists {
            self.store
                .hset_all(
                    &key,
                    &[(EXPIRES_AT_FIELD.to_string(), expires_at.to_string())],
                )
                .await
                .map_err(kv_internal)?;
        }
        Ok(exists)
    }

    /// Session keys whose logical `expires_at` has passed. Used by the
    /// cache manager's cleanup worker.
    pub async fn expired_session_keys(&self) -> DncResult<Vec<String>> {
        let keys = self
            .store
            .scan(&format!("{KEY_PREFIX}*"), 100)
            .await
            .map_err(kv_internal)?;

        let now = Utc::now().timestamp();
        let mut expired = Vec::new();
        for key in keys {
            let stamp = self
                .store
                .hget(&key, EXPIRES_AT_FIELD)
                .await
                .map_err(kv_internal)?;
            let logically_expired = match stamp.and_then(|s| s.parse::<i64>().ok()) {
                Some(at) => at <= now,
                // A session hash with no expiry stamp is malformed; reap it.
                None => true,
            };
            if logically_expired {
                expired.push(key);
            }
        }
        Ok(expired)
    }
}
