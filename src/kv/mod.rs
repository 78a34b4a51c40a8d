//! Key-value store abstraction.
//!
//! The cache layer talks to an opaque remote store through this trait:
//! string keys, opaque byte values, TTLs, atomic counters, sorted sets,
//! hashes, scan, and pipelined batches. Missing keys are `Ok(None)` /
//! empty collections, never errors; everything else is a transport error.
//!
//! Two implementations ship: [`RedisStore`] for production and
//! [`MemoryStore`] for tests and local development.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Errors at the store boundary.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv transport error: {0}")]
    Transport(String),

    #[error("unexpected reply from store: {0}")]
    UnexpectedReply(String),
}

impl From<::redis::RedisError> for KvError {
    fn from(err: ::redis::RedisError) -> Self {
        KvError::Transport(err.to_string())
    }
}

pub type KvResult<T> = Result<T, KvError>;

/// One operation enqueued into a pipeline. Ops execute in enqueue order;
/// replies are positional.
#[derive(Debug, Clone)]
pub enum PipelineOp {
    Get { key: String },
    Set { key: String, value: Vec<u8>, ttl: Option<Duration> },
    Delete { key: String },
    Incr { key: String },
    Expire { key: String, ttl: Duration },
    ZAdd { key: String, score: f64, member: String },
    ZCard { key: String },
    ZRemRangeByRank { key: String, start: isize, stop: isize },
    ZRemRangeByScore { key: String, min: f64, max: f64 },
}

/// Positional reply for one pipeline op.
#[derive(Debug, Clone)]
pub enum PipelineReply {
    /// Reply to `Get`.
    Bytes(Option<Vec<u8>>),
    /// Reply to counting ops (`Incr`, `Delete`, `ZCard`, `ZRemRange*`).
    Int(i64),
    /// Reply to ops with no interesting payload (`Set`, `Expire`, `ZAdd`).
    Done,
}

impl PipelineReply {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PipelineReply::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            PipelineReply::Bytes(b) => b,
            _ => None,
        }
    }
}

/// Uniform contract over the remote store.
///
/// All operations are cancel-safe: dropping the returned future abandons
/// the round trip. Callers with hard deadlines wrap calls in
/// `tokio::time::timeout`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> KvResult<()>;
    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> KvResult<bool>;
    async fn exists(&self, key: &str) -> KvResult<bool>;
    /// Atomic set-if-absent; returns whether this caller claimed the key.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> KvResult<bool>;
    /// Atomic increment; creates the key at 0 first touch.
    async fn incr(&self, key: &str) -> KvResult<i64>;
    /// Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool>;
    /// Remaining TTL, `None` when the key is absent or has no expiry.
    async fn ttl(&self, key: &str) -> KvResult<Option<Duration>>;
    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<Vec<u8>>>>;

    // Sorted sets
    async fn zadd(&self, key: &str, score: f64, member: &str) -> KvResult<()>;
    async fn zrem(&self, key: &str, member: &str) -> KvResult<bool>;
    async fn zcard(&self, key: &str) -> KvResult<u64>;
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>>;
    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>>;
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> KvResult<Vec<String>>;
    async fn zrem_range_by_rank(&self, key: &str, start: isize, stop: isize) -> KvResult<u64>;
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> KvResult<u64>;

    // Sets
    async fn sadd(&self, key: &str, member: &str) -> KvResult<bool>;
    async fn srem(&self, key: &str, member: &str) -> KvResult<bool>;
    async fn smembers(&self, key: &str) -> KvResult<Vec<String>>;

    // Hashes
    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> KvResult<()>;
    async fn hget_all(&self, key: &str) -> KvResult<HashMap<String, String>>;
    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>>;

    /// All keys matching a glob pattern, fetched via cursor iteration with
    /// the given per-round batch hint.
    async fn scan(&self, pattern: &str, batch: usize) -> KvResult<Vec<String>>;

    /// Execute a batch of ops in one round trip, preserving enqueue order.
    async fn pipeline(&self, ops: Vec<PipelineOp>) -> KvResult<Vec<PipelineReply>>;

    async fn info(&self, section: &str) -> KvResult<String>;
    async fn dbsize(&self) -> KvResult<u64>;
    async fn ping(&self) -> KvResult<()>;
}
