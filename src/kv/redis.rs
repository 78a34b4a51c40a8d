//! Redis-backed [`KvStore`] implementation.
//!
//! Runs over a [`redis::aio::ConnectionManager`], which multiplexes one
//! reconnecting connection and is cheap to clone per call. SCAN is issued
//! as explicit cursor commands so the batch hint reaches the server, and
//! pipelines are translated op-for-op to keep the positional reply
//! contract.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{KvError, KvResult, KvStore, PipelineOp, PipelineReply};

/// Production store over a Redis deployment.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect to `redis://host:port/db`.
    pub async fn connect(url: &str) -> KvResult<Self> {
        let client = redis::Client::open(url).map_err(KvError::from)?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(KvError::from)?;
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    // Redis rejects EX 0; round sub-second TTLs up to one second.
    ttl.as_secs().max(1)
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        let mut conn = self.conn();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> KvResult<()> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl_secs(ttl)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        let mut conn = self.conn();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> KvResult<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn incr(&self, key: &str) -> KvResult<i64> {
        let mut conn = self.conn();
        let value: i64 = conn.incr(key, 1).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        let mut conn = self.conn();
        let set: bool = conn.expire(key, ttl_secs(ttl) as i64).await?;
        Ok(set)
    }

    async fn ttl(&self, key: &str) -> KvResult<Option<Duration>> {
        let mut conn = self.conn();
        let remaining: i64 = conn.ttl(key).await?;
        // -2 = no key, -1 = no expiry.
        Ok((remaining >= 0).then(|| Duration::from_secs(remaining as u64)))
    }

    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        let values: Vec<Option<Vec<u8>>> = cmd.query_async(&mut conn).await?;
        Ok(values)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> KvResult<()> {
        let mut conn = self.conn();
        let _: i64 = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> KvResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> KvResult<u64> {
        let mut conn = self.conn();
        let count: u64 = conn.zcard(key).await?;
        Ok(count)
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = conn.zrange(key, start, stop).await?;
        Ok(members)
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = conn.zrevrange(key, start, stop).await?;
        Ok(members)
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> KvResult<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = conn.zrangebyscore(key, min, max).await?;
        Ok(members)
    }

    async fn zrem_range_by_rank(&self, key: &str, start: isize, stop: isize) -> KvResult<u64> {
        let mut conn = self.conn();
        let removed: u64 = conn.zremrangebyrank(key, start, stop).await?;
        Ok(removed)
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> KvResult<u64> {
        let mut conn = self.conn();
        let removed: u64 = conn.zrembyscore(key, min, max).await?;
        Ok(removed)
    }

    async fn sadd(&self, key: &str, member: &str) -> KvResult<bool> {
        let mut conn = self.conn();
        let added: i64 = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> KvResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> KvResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> KvResult<HashMap<String, String>> {
        let mut conn = self.conn();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn scan(&self, pattern: &str, batch: usize) -> KvResult<Vec<String>> {
        let mut conn = self.conn();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, chunk): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(batch)
                .query_async(&mut conn)
                .await?;
            keys.extend(chunk);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn pipeline(&self, ops: Vec<PipelineOp>) -> KvResult<Vec<PipelineReply>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for op in &ops {
            match op {
                PipelineOp::Get { key } => {
                    pipe.get(key);
                }
                PipelineOp::Set { key, value, ttl } => match ttl {
                    Some(ttl) => {
                        pipe.set_ex(key, value.as_slice(), ttl_secs(*ttl));
                    }
                    None => {
                        pipe.set(key, value.as_slice());
                    }
                },
                PipelineOp::Delete { key } => {
                    pipe.del(key);
                }
                PipelineOp::Incr { key } => {
                    pipe.incr(key, 1);
                }
                PipelineOp::Expire { key, ttl } => {
                    pipe.expire(key, ttl_secs(*ttl) as i64);
                }
                PipelineOp::ZAdd { key, score, member } => {
                    pipe.zadd(key, member, *score);
                }
                PipelineOp::ZCard { key } => {
                    pipe.zcard(key);
                }
                PipelineOp::ZRemRangeByRank { key, start, stop } => {
                    pipe.zremrangebyrank(key, *start, *stop);
                }
                PipelineOp::ZRemRangeByScore { key, min, max } => {
                    pipe.zrembyscore(key, *min, *max);
                }
            }
        }

        let mut conn = self.conn();
        let values: Vec<redis::Value> = pipe.query_async(&mut conn).await?;
        if values.len() != ops.len() {
            return Err(KvError::UnexpectedReply(format!(
                "pipeline returned {} replies for {} ops",
                values.len(),
                ops.len()
            )));
        }

        ops.iter()
            .zip(values)
            .map(|(op, value)| parse_reply(op, value))
            .collect()
    }

    async fn info(&self, section: &str) -> KvResult<String> {
        let mut conn = self.conn();
        let info: String = redis::cmd("INFO")
            .arg(section)
            .query_async(&mut conn)
            .await?;
        Ok(info)
    }

    async fn dbsize(&self) -> KvResult<u64> {
        let mut conn = self.conn();
        let size: u64 = redis::cmd("DBSIZE").query_async(&mut conn).await?;
        Ok(size)
    }

    async fn ping(&self) -> KvResult<()> {
        let mut conn = self.conn();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(KvError::UnexpectedReply(format!("PING returned {reply:?}")))
        }
    }
}

fn parse_reply(op: &PipelineOp, value: redis::Value) -> KvResult<PipelineReply> {
    match op {
        PipelineOp::Get { .. } => {
            let bytes: Option<Vec<u8>> = redis::from_redis_value(&value)
                .map_err(|e| KvError::UnexpectedReply(e.to_string()))?;
            Ok(PipelineReply::Bytes(bytes))
        }
        PipelineOp::Delete { .. }
        | PipelineOp::Incr { .. }
        | PipelineOp::ZCard { .. }
        | PipelineOp::ZRemRangeByRank { .. }
        | PipelineOp::ZRemRangeByScore { .. } => {
            let n: i64 = redis::from_redis_value(&value)
                .map_err(|e| KvError::UnexpectedReply(e.to_string()))?;
            Ok(PipelineReply::Int(n))
        }
        PipelineOp::Set { .. } | PipelineOp::Expire { .. } | PipelineOp::ZAdd { .. } => {
            Ok(PipelineReply::Done)
        }
    }
}
