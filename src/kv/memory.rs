//! In-process [`KvStore`] implementation.
//!
//! Backs the test suite and local development with the same semantics as
//! the Redis store: lazy TTL expiry, typed values (a sorted-set key cannot
//! be read as bytes), ordered pipelines, and atomic set-if-absent. One
//! mutex over the keyspace; a pipeline holds it for the whole batch, which
//! gives the strongest version of the ordering the contract asks for.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{KvError, KvResult, KvStore, PipelineOp, PipelineReply};

enum Stored {
    Bytes(Vec<u8>),
    SortedSet(Vec<(f64, String)>),
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
}

struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

/// In-memory store for tests and local development.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
    commands: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of store commands issued so far (a pipeline counts once).
    /// Lets tests assert that a path produced no round trip.
    pub fn command_count(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    fn record(&self) {
        self.commands.fetch_add(1, Ordering::Relaxed);
    }
}

fn expired(entry: &Entry) -> bool {
    entry.expires_at.is_some_and(|at| at <= Instant::now())
}

fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    if map.get(key).is_some_and(expired) {
        map.remove(key);
    }
    map.get_mut(key)
}

fn wrong_type() -> KvError {
    KvError::UnexpectedReply("WRONGTYPE operation against a key holding the wrong kind of value".into())
}

/// Glob matching as SCAN supports it: `*` (any run) and `?` (any one char).
fn glob_match(pattern: &str, key: &str) -> bool {
    fn inner(p: &[u8], k: &[u8]) -> bool {
        match (p.first(), k.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], k) || (!k.is_empty() && inner(p, &k[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &k[1..]),
            (Some(a), Some(b)) if a == b => inner(&p[1..], &k[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), key.as_bytes())
}

/// Resolve Redis-style inclusive rank bounds against a collection length.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    start = start.max(0);
    stop = stop.min(len - 1);
    if start > stop || len == 0 {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

// Keyspace operations shared by the direct methods and the pipeline path.
// All take the locked map so a pipeline can apply its batch atomically.

fn do_get(map: &mut HashMap<String, Entry>, key: &str) -> KvResult<Option<Vec<u8>>> {
    match live(map, key) {
        None => Ok(None),
        Some(entry) => match &entry.value {
            Stored::Bytes(b) => Ok(Some(b.clone())),
            _ => Err(wrong_type()),
        },
    }
}

fn do_set(map: &mut HashMap<String, Entry>, key: &str, value: &[u8], ttl: Option<Duration>) {
    map.insert(
        key.to_string(),
        Entry {
            value: Stored::Bytes(value.to_vec()),
            expires_at: ttl.map(|t| Instant::now() + t),
        },
    );
}

fn do_delete(map: &mut HashMap<String, Entry>, key: &str) -> bool {
    let was_live = live(map, key).is_some();
    map.remove(key);
    was_live
}

fn do_incr(map: &mut HashMap<String, Entry>, key: &str) -> KvResult<i64> {
    let next = match live(map, key) {
        None => 1,
        Some(entry) => match &entry.value {
            Stored::Bytes(b) => {
                let current: i64 = std::str::from_utf8(b)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        KvError::UnexpectedReply("value is not an integer".into())
                    })?;
                current + 1
            }
            _ => return Err(wrong_type()),
        },
    };
    let expires_at = live(map, key).and_then(|e| e.expires_at);
    map.insert(
        key.to_string(),
        Entry {
            value: Stored::Bytes(next.to_string().into_bytes()),
            expires_at,
        },
    );
    Ok(next)
}

fn do_expire(map: &mut HashMap<String, Entry>, key: &str, ttl: Duration) -> bool {
    match live(map, key) {
        Some(entry) => {
            entry.expires_at = Some(Instant::now() + ttl);
            true
        }
        None => false,
    }
}

fn sorted_set<'a>(
    map: &'a mut HashMap<String, Entry>,
    key: &str,
) -> KvResult<&'a mut Vec<(f64, String)>> {
    if live(map, key).is_none() {
        map.insert(
            key.to_string(),
            Entry {
                value: Stored::SortedSet(Vec::new()),
                expires_at: None,
            },
        );
    }
    match &mut map.get_mut(key).unwrap().value {
        Stored::SortedSet(set) => Ok(set),
        _ => Err(wrong_type()),
    }
}

fn do_zadd(map: &mut HashMap<String, Entry>, key: &str, score: f64, member: &str) -> KvResult<()> {
    let set = sorted_set(map, key)?;
    set.retain(|(_, m)| m != member);
    let pos = set
        .binary_search_by(|(s, m)| {
            s.partial_cmp(&score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| m.as_str().cmp(member))
        })
        .unwrap_or_else(|p| p);
    set.insert(pos, (score, member.to_string()));
    Ok(())
}

fn do_zcard(map: &mut HashMap<String, Entry>, key: &str) -> KvResult<u64> {
    match live(map, key) {
        None => Ok(0),
        Some(entry) => match &entry.value {
            Stored::SortedSet(set) => Ok(set.len() as u64),
            _ => Err(wrong_type()),
        },
    }
}

fn do_zrem_range_by_rank(
    map: &mut HashMap<String, Entry>,
    key: &str,
    start: isize,
    stop: isize,
) -> KvResult<u64> {
    match live(map, key) {
        None => Ok(0),
        Some(entry) => match &mut entry.value {
            Stored::SortedSet(set) => match resolve_range(set.len(), start, stop) {
                None => Ok(0),
                Some((lo, hi)) => {
                    let removed = hi - lo + 1;
                    set.drain(lo..=hi);
                    Ok(removed as u64)
                }
            },
            _ => Err(wrong_type()),
        },
    }
}

fn do_zrem_range_by_score(
    map: &mut HashMap<String, Entry>,
    key: &str,
    min: f64,
    max: f64,
) -> KvResult<u64> {
    match live(map, key) {
        None => Ok(0),
        Some(entry) => match &mut entry.value {
            Stored::SortedSet(set) => {
                let before = set.len();
                set.retain(|(s, _)| *s < min || *s > max);
                Ok((before - set.len()) as u64)
            }
            _ => Err(wrong_type()),
        },
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        self.record();
        do_get(&mut self.data.lock().unwrap(), key)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> KvResult<()> {
        self.record();
        do_set(&mut self.data.lock().unwrap(), key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<bool> {
        self.record();
        Ok(do_delete(&mut self.data.lock().unwrap(), key))
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        self.record();
        Ok(live(&mut self.data.lock().unwrap(), key).is_some())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> KvResult<bool> {
        self.record();
        let mut map = self.data.lock().unwrap();
        if live(&mut map, key).is_some() {
            return Ok(false);
        }
        do_set(&mut map, key, value, Some(ttl));
        Ok(true)
    }

    async fn incr(&self, key: &str) -> KvResult<i64> {
        self.record();
        do_incr(&mut self.data.lock().unwrap(), key)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        self.record();
        Ok(do_expire(&mut self.data.lock().unwrap(), key, ttl))
    }

    async fn ttl(&self, key: &str) -> KvResult<Option<Duration>> {
        self.record();
        let mut map = self.data.lock().unwrap();
        Ok(live(&mut map, key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<Vec<u8>>>> {
        self.record();
        let mut map = self.data.lock().unwrap();
        keys.iter().map(|k| do_get(&mut map, k)).collect()
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> KvResult<()> {
        self.record();
        do_zadd(&mut self.data.lock().unwrap(), key, score, member)
    }

    async fn zrem(&self, key: &str, member: &str) -> KvResult<bool> {
        self.record();
        let mut map = self.data.lock().unwrap();
        match live(&mut map, key) {
            None => Ok(false),
            Some(entry) => match &mut entry.value {
                Stored::SortedSet(set) => {
                    let before = set.len();
                    set.retain(|(_, m)| m != member);
                    Ok(set.len() < before)
                }
                _ => Err(wrong_type()),
            },
        }
    }

    async fn zcard(&self, key: &str) -> KvResult<u64> {
        self.record();
        do_zcard(&mut self.data.lock().unwrap(), key)
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>> {
        self.record();
        let mut map = self.data.lock().unwrap();
        match live(&mut map, key) {
            None => Ok(Vec::new()),
            Some(entry) => match &entry.value {
                Stored::SortedSet(set) => Ok(match resolve_range(set.len(), start, stop) {
                    None => Vec::new(),
                    Some((lo, hi)) => set[lo..=hi].iter().map(|(_, m)| m.clone()).collect(),
                }),
                _ => Err(wrong_type()),
            },
        }
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>> {
        self.record();
        let mut map = self.data.lock().unwrap();
        match live(&mut map, key) {
            None => Ok(Vec::new()),
            Some(entry) => match &entry.value {
                Stored::SortedSet(set) => {
                    let reversed: Vec<&String> = set.iter().rev().map(|(_, m)| m).collect();
                    Ok(match resolve_range(reversed.len(), start, stop) {
                        None => Vec::new(),
                        Some((lo, hi)) => reversed[lo..=hi].iter().map(|m| (*m).clone()).collect(),
                    })
                }
                _ => Err(wrong_type()),
            },
        }
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> KvResult<Vec<String>> {
        self.record();
        let mut map = self.data.lock().unwrap();
        match live(&mut map, key) {
            None => Ok(Vec::new()),
            Some(entry) => match &entry.value {
                Stored::SortedSet(set) => Ok(set
                    .iter()
                    .filter(|(s, _)| *s >= min && *s <= max)
                    .map(|(_, m)| m.clone())
                    .collect()),
                _ => Err(wrong_type()),
            },
        }
    }

    async fn zrem_range_by_rank(&self, key: &str, start: isize, stop: isize) -> KvResult<u64> {
        self.record();
        do_zrem_range_by_rank(&mut self.data.lock().unwrap(), key, start, stop)
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> KvResult<u64> {
        self.record();
        do_zrem_range_by_score(&mut self.data.lock().unwrap(), key, min, max)
    }

    async fn sadd(&self, key: &str, member: &str) -> KvResult<bool> {
        self.record();
        let mut map = self.data.lock().unwrap();
        if live(&mut map, key).is_none() {
            map.insert(
                key.to_string(),
                Entry {
                    value: Stored::Set(HashSet::new()),
                    expires_at: None,
                },
            );
        }
        match &mut map.get_mut(key).unwrap().value {
            Stored::Set(set) => Ok(set.insert(member.to_string())),
            _ => Err(wrong_type()),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> KvResult<bool> {
        self.record();
        let mut map = self.data.lock().unwrap();
        match live(&mut map, key) {
            None => Ok(false),
            Some(entry) => match &mut entry.value {
                Stored::Set(set) => Ok(set.remove(member)),
                _ => Err(wrong_type()),
            },
        }
    }

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
        self.record();
        let mut map = self.data.lock().unwrap();
        match live(&mut map, key) {
            None => Ok(Vec::new()),
            Some(entry) => match &entry.value {
                Stored::Set(set) => Ok(set.iter().cloned().collect()),
                _ => Err(wrong_type()),
            },
        }
    }

    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> KvResult<()> {
        self.record();
        let mut map = self.data.lock().unwrap();
        if live(&mut map, key).is_none() {
            map.insert(
                key.to_string(),
                Entry {
                    value: Stored::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        match &mut map.get_mut(key).unwrap().value {
            Stored::Hash(hash) => {
                for (field, value) in fields {
                    hash.insert(field.clone(), value.clone());
                }
                Ok(())
            }
            _ => Err(wrong_type()),
        }
    }

    async fn hget_all(&self, key: &str) -> KvResult<HashMap<String, String>> {
        self.record();
        let mut map = self.data.lock().unwrap();
        match live(&mut map, key) {
            None => Ok(HashMap::new()),
            Some(entry) => match &entry.value {
                Stored::Hash(hash) => Ok(hash.clone()),
                _ => Err(wrong_type()),
            },
        }
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        self.record();
        let mut map = self.data.lock().unwrap();
        match live(&mut map, key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                Stored::Hash(hash) => Ok(hash.get(field).cloned()),
                _ => Err(wrong_type()),
            },
        }
    }

    async fn scan(&self, pattern: &str, _batch: usize) -> KvResult<Vec<String>> {
        self.record();
        let mut map = self.data.lock().unwrap();
        map.retain(|_, entry| !expired(entry));
        Ok(map
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn pipeline(&self, ops: Vec<PipelineOp>) -> KvResult<Vec<PipelineReply>> {
        self.record();
        let mut map = self.data.lock().unwrap();
        let mut replies = Vec::with_capacity(ops.len());
        for op in ops {
            let reply = match op {
                PipelineOp::Get { key } => PipelineReply::Bytes(do_get(&mut map, &key)?),
                PipelineOp::Set { key, value, ttl } => {
                    do_set(&mut map, &key, &value, ttl);
                    PipelineReply::Done
                }
                PipelineOp::Delete { key } => {
                    PipelineReply::Int(do_delete(&mut map, &key) as i64)
                }
                PipelineOp::Incr { key } => PipelineReply::Int(do_incr(&mut map, &key)?),
                PipelineOp::Expire { key, ttl } => {
                    do_expire(&mut map, &key, ttl);
                    PipelineReply::Done
                }
                PipelineOp::ZAdd { key, score, member } => {
                    do_zadd(&mut map, &key, score, &member)?;
                    PipelineReply::Done
                }
                PipelineOp::ZCard { key } => PipelineReply::Int(do_zcard(&mut map, &key)? as i64),
                PipelineOp::ZRemRangeByRank { key, start, stop } => {
                    PipelineReply::Int(do_zrem_range_by_rank(&mut map, &key, start, stop)? as i64)
                }
                PipelineOp::ZRemRangeByScore { key, min, max } => {
                    PipelineReply::Int(do_zrem_range_by_score(&mut map, &key, min, max)? as i64)
                }
            };
            replies.push(reply);
        }
        Ok(replies)
    }

    async fn info(&self, section: &str) -> KvResult<String> {
        self.record();
        let map = self.data.lock().unwrap();
        Ok(format!(
            "# {section}\r\nkeys:{}\r\nbackend:memory\r\n",
            map.len()
        ))
    }

    async fn dbsize(&self) -> KvResult<u64> {
        self.record();
        let mut map = self.data.lock().unwrap();
        map.retain(|_, entry| !expired(entry));
        Ok(map.len() as u64)
    }

    async fn ping(&self) -> KvResult<()> {
        self.record();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::new();
        store.set("k", b"v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("k", b"v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(store.exists("k").await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_nx_claims_once() {
        let store = MemoryStore::new();
        assert!(store
            .set_nx("lock", b"a", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .set_nx("lock", b"b", Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(store.get("lock").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn test_incr_is_sequential() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("seq").await.unwrap(), 1);
        assert_eq!(store.incr("seq").await.unwrap(), 2);
        assert_eq!(store.incr("seq").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_sorted_set_ordering_and_trim() {
        let store = MemoryStore::new();
        store.zadd("lru", 3.0, "c").await.unwrap();
        store.zadd("lru", 1.0, "a").await.unwrap();
        store.zadd("lru", 2.0, "b").await.unwrap();

        assert_eq!(store.zrange("lru", 0, -1).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(store.zrevrange("lru", 0, 0).await.unwrap(), vec!["c"]);

        // Keep the most recent 2: trim ranks 0..=-(2+1).
        let removed = store.zrem_range_by_rank("lru", 0, -3).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.zrange("lru", 0, -1).await.unwrap(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_pipeline_order_and_replies() {
        let store = MemoryStore::new();
        let replies = store
            .pipeline(vec![
                PipelineOp::Set {
                    key: "a".into(),
                    value: b"1".to_vec(),
                    ttl: None,
                },
                PipelineOp::Get { key: "a".into() },
                PipelineOp::Incr { key: "n".into() },
                PipelineOp::Delete { key: "a".into() },
            ])
            .await
            .unwrap();

        assert_eq!(replies.len(), 4);
        assert_eq!(replies[1].clone().into_bytes(), Some(b"1".to_vec()));
        assert_eq!(replies[2].as_int(), Some(1));
        assert_eq!(replies[3].as_int(), Some(1));
    }

    #[tokio::test]
    async fn test_scan_glob() {
        let store = MemoryStore::new();
        store.set("dce:dnc:entry:aa", b"1", None).await.unwrap();
        store.set("dce:dnc:entry:ab", b"1", None).await.unwrap();
        store.set("dce:dnc:check:aa", b"1", None).await.unwrap();

        let mut keys = store.scan("dce:dnc:entry:*", 100).await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["dce:dnc:entry:aa", "dce:dnc:entry:ab"]);
    }

    #[tokio::test]
    async fn test_wrong_type_errors() {
        let store = MemoryStore::new();
        store.set("k", b"v", None).await.unwrap();
        assert!(store.zadd("k", 1.0, "m").await.is_err());
        assert!(store.hget("k", "f").await.is_err());
    }
}
