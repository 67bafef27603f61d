//! Typed operations over a remote sorted-set + hash store, modeled on
//! Redis. `zpop_max` is the one operation that MUST be atomic end to end
//! (spec §4.A, §9 "Atomic pop"); every other operation here is a point
//! operation with no cross-key transaction requirement.

use crate::error::StoreError;
use crate::model::{Member, ProxyRecord};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Fields of a proxy hash record, as read from / written to the store.
/// Kept separate from `ProxyRecord` so the store trait never has to know
/// about `model::Anonymity`'s validation rules.
#[derive(Debug, Clone)]
pub struct ProxyFields {
    pub ip: String,
    pub port: String,
    pub anonymity: i64,
    pub rtt: i64,
    pub validated_at: i64,
}

impl From<&ProxyRecord> for ProxyFields {
    fn from(r: &ProxyRecord) -> Self {
        ProxyFields {
            ip: r.ip.clone(),
            port: r.port.clone(),
            anonymity: r.anonymity as i64,
            rtt: r.rtt_ms as i64,
            validated_at: r.validated_at,
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn hash_set(&self, key: &str, record: &ProxyFields) -> Result<(), StoreError>;
    async fn hash_get(&self, key: &str) -> Result<Option<ProxyFields>, StoreError>;
    async fn keys_matching(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn zadd(&self, set: &str, member: &str, score: i64) -> Result<(), StoreError>;
    async fn zadd_incr(&self, set: &str, member: &str, delta: i64) -> Result<i64, StoreError>;
    async fn zrem(&self, set: &str, member: &str) -> Result<(), StoreError>;
    async fn zrange_with_scores(&self, set: &str) -> Result<Vec<Member>, StoreError>;

    /// Atomically read-and-remove the highest-scoring member. Two
    /// concurrent callers MUST never observe the same member; a
    /// `range`+`remove` implementation would violate this (spec §9).
    async fn zpop_max(&self, set: &str) -> Result<Option<Member>, StoreError>;
}

/// Lua script run server-side so the read and the removal of the
/// highest-scoring member happen as one atomic step, matching
/// `original_source/redis.go`'s `zpopScript`.
const ZPOP_MAX_SCRIPT: &str = r#"
local r = redis.call('ZREVRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if r[1] ~= nil then
    redis.call('ZREM', KEYS[1], r[1])
end
return r
"#;

pub struct RedisStore {
    conn: ConnectionManager,
    zpop_max_script: redis::Script,
}

impl RedisStore {
    pub async fn connect(address: &str, password: &str) -> Result<Self, StoreError> {
        let url = if password.is_empty() {
            format!("redis://{address}")
        } else {
            format!("redis://:{password}@{address}")
        };
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(RedisStore {
            conn,
            zpop_max_script: redis::Script::new(ZPOP_MAX_SCRIPT),
        })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn hash_set(&self, key: &str, record: &ProxyFields) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(
                key,
                &[
                    ("ip", record.ip.clone()),
                    ("port", record.port.clone()),
                    ("anonymity", record.anonymity.to_string()),
                    ("rtt", record.rtt.to_string()),
                    ("validated_at", record.validated_at.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str) -> Result<Option<ProxyFields>, StoreError> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        if map.is_empty() {
            return Ok(None);
        }
        let parse = |field: &str| -> Result<i64, StoreError> {
            map.get(field)
                .ok_or_else(|| StoreError::new(format!("missing field {field} in {key}")))?
                .parse::<i64>()
                .map_err(|e| StoreError::new(e.to_string()))
        };
        Ok(Some(ProxyFields {
            ip: map
                .get("ip")
                .ok_or_else(|| StoreError::new(format!("missing field ip in {key}")))?
                .clone(),
            port: map
                .get("port")
                .ok_or_else(|| StoreError::new(format!("missing field port in {key}")))?
                .clone(),
            anonymity: parse("anonymity")?,
            rtt: parse("rtt")?,
            validated_at: parse("validated_at")?,
        }))
    }

    async fn keys_matching(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn zadd(&self, set: &str, member: &str, score: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(set, member, score).await?;
        Ok(())
    }

    async fn zadd_incr(&self, set: &str, member: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let new_score: i64 = conn.zincr(set, member, delta).await?;
        Ok(new_score)
    }

    async fn zrem(&self, set: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.zrem(set, member).await?;
        Ok(())
    }

    async fn zrange_with_scores(&self, set: &str) -> Result<Vec<Member>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<(String, i64)> = conn.zrange_withscores(set, 0, -1).await?;
        Ok(raw
            .into_iter()
            .map(|(member, score)| Member::new(member, score))
            .collect())
    }

    async fn zpop_max(&self, set: &str) -> Result<Option<Member>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = self
            .zpop_max_script
            .key(set)
            .invoke_async(&mut conn)
            .await?;
        if raw.len() < 2 {
            return Ok(None);
        }
        let score: i64 = raw[1]
            .parse()
            .map_err(|_| StoreError::new(format!("non-numeric score returned for {set}")))?;
        Ok(Some(Member::new(raw[0].clone(), score)))
    }
}

/// In-memory store used by tests. Guarded by a single mutex: this crate's
/// tests never need more concurrency than that to exercise the exclusivity
/// and idempotence properties in spec §8.
#[derive(Default)]
struct FakeStoreState {
    hashes: HashMap<String, ProxyFields>,
    sorted_sets: HashMap<String, Vec<Member>>,
}

pub struct FakeStore {
    state: Arc<Mutex<FakeStoreState>>,
}

impl Default for FakeStore {
    fn default() -> Self {
        FakeStore {
            state: Arc::new(Mutex::new(FakeStoreState::default())),
        }
    }
}

impl Clone for FakeStore {
    fn clone(&self) -> Self {
        FakeStore {
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn hash_set(&self, key: &str, record: &ProxyFields) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.hashes.insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn hash_get(&self, key: &str) -> Result<Option<ProxyFields>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.hashes.get(key).cloned())
    }

    async fn keys_matching(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .hashes
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.hashes.remove(key);
        Ok(())
    }

    async fn zadd(&self, set: &str, member: &str, score: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let entries = state.sorted_sets.entry(set.to_string()).or_default();
        if let Some(existing) = entries.iter_mut().find(|m| m.member == member) {
            existing.score = score;
        } else {
            entries.push(Member::new(member, score));
        }
        Ok(())
    }

    async fn zadd_incr(&self, set: &str, member: &str, delta: i64) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        let entries = state.sorted_sets.entry(set.to_string()).or_default();
        if let Some(existing) = entries.iter_mut().find(|m| m.member == member) {
            existing.score += delta;
            Ok(existing.score)
        } else {
            entries.push(Member::new(member, delta));
            Ok(delta)
        }
    }

    async fn zrem(&self, set: &str, member: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(entries) = state.sorted_sets.get_mut(set) {
            entries.retain(|m| m.member != member);
        }
        Ok(())
    }

    async fn zrange_with_scores(&self, set: &str) -> Result<Vec<Member>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.sorted_sets.get(set).cloned().unwrap_or_default())
    }

    async fn zpop_max(&self, set: &str) -> Result<Option<Member>, StoreError> {
        let mut state = self.state.lock().await;
        let entries = state.sorted_sets.entry(set.to_string()).or_default();
        let max_index = entries
            .iter()
            .enumerate()
            .max_by_key(|(_, m)| m.score)
            .map(|(i, _)| i);
        Ok(max_index.map(|i| entries.remove(i)))
    }
}
