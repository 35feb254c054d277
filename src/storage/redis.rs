//! Redis fast tier.
//!
//! Key layout (every key carries the configured prefix):
//!
//! ```text
//! {prefix}counters:{id}   HASH   views, clicks, organic_clicks, carts, orders, boost_score,
//!                                baseline (present once durable history is folded in),
//!                                generation (bumped on every write)
//! {prefix}viewers:{id}    HLL    unique viewer ids (PFADD / PFCOUNT)
//! {prefix}cache:{id}      STRING serialized stats response, SET EX
//! {prefix}dirty           ZSET   product id -> first-dirtied epoch ms
//! {prefix}rank:{index}    ZSET   product id -> score
//! {prefix}lock:{name}     STRING lease token, SET NX PX
//! ```
//!
//! An increment is one `MULTI/EXEC`: the field increments, the rolling
//! `EXPIRE`, `ZADD NX` on the dirty set and the cache `DEL` land together.
//! Claims use `ZPOPMIN`, which is atomic across instances. Re-seeding after
//! an eviction and the generation-checked cache write are Lua scripts, so
//! each is one atomic step against concurrent increments.
//!
//! Idempotent reads and overwrites go through the query retry preset.
//! Increments and claims run once: replaying them after a lost reply would
//! double-count or drop ids.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, Client, Cmd, FromRedisValue, Pipeline, Script};

use super::traits::{CounterStore, LeaseLock, LockToken, RankIndex, RankIndexStore, StatsCache, StorageError};
use crate::counters::{now_millis, CounterDeltas, CounterState, DirtyEntry, Metric, ProductCounterSet};
use crate::resilience::retry::{retry, RetryConfig};

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

// KEYS[1] counters hash. ARGV[1] ttl secs, ARGV[2..] durable field/value pairs.
const SEED_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[1], 'baseline') == 0 then
    for i = 2, #ARGV, 2 do
        if ARGV[i] == 'boost_score' then
            redis.call('HINCRBYFLOAT', KEYS[1], ARGV[i], ARGV[i + 1])
        else
            redis.call('HINCRBY', KEYS[1], ARGV[i], ARGV[i + 1])
        end
    end
    redis.call('HSET', KEYS[1], 'baseline', 1)
    redis.call('HINCRBY', KEYS[1], 'generation', 1)
end
redis.call('EXPIRE', KEYS[1], ARGV[1])
return redis.call('HGETALL', KEYS[1])
"#;

// KEYS[1] counters hash, KEYS[2] cache key. ARGV[1] generation, ARGV[2] payload, ARGV[3] ttl secs.
const CACHE_PUT_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'generation') or '0'
if current == ARGV[1] then
    redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[3])
    return 1
end
return 0
"#;

const BASELINE_FIELD: &str = "baseline";
const GENERATION_FIELD: &str = "generation";

fn backend(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub struct RedisFastTier {
    connection: ConnectionManager,
    /// Namespace for every key (e.g., "stats:" -> "stats:counters:p1")
    prefix: String,
    counter_ttl: Duration,
    seed_script: Script,
    cache_put_script: Script,
}

impl RedisFastTier {
    /// Connect with startup-mode retry (fails fast on bad config).
    pub async fn new(connection_string: &str, prefix: &str, counter_ttl: Duration) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(backend)?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(backend)?;

        Ok(Self {
            connection,
            prefix: prefix.to_string(),
            counter_ttl,
            seed_script: Script::new(SEED_SCRIPT),
            cache_put_script: Script::new(CACHE_PUT_SCRIPT),
        })
    }

    /// Get the configured prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Clone of the connection manager, for tests and tooling.
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn counters_key(&self, product_id: &str) -> String {
        self.prefixed_key(&format!("counters:{}", product_id))
    }

    fn viewers_key(&self, product_id: &str) -> String {
        self.prefixed_key(&format!("viewers:{}", product_id))
    }

    fn cache_key(&self, product_id: &str) -> String {
        self.prefixed_key(&format!("cache:{}", product_id))
    }

    fn dirty_key(&self) -> String {
        self.prefixed_key("dirty")
    }

    fn index_key(&self, index: RankIndex) -> String {
        self.prefixed_key(index.key_name())
    }

    fn lock_key(&self, name: &str) -> String {
        self.prefixed_key(&format!("lock:{}", name))
    }

    fn ttl_secs(&self) -> i64 {
        self.counter_ttl.as_secs().max(1) as i64
    }

    /// Single command with query retry.
    async fn query<T: FromRedisValue + Send>(&self, op: &str, command: Cmd) -> Result<T, StorageError> {
        let conn = self.connection.clone();
        retry(op, &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let command = command.clone();
            async move {
                let value: T = command.query_async(&mut conn).await?;
                Ok(value)
            }
        })
        .await
        .map_err(|e: redis::RedisError| backend(e))
    }

    /// Lua script with query retry. Only for idempotent scripts.
    async fn eval<T: FromRedisValue + Send>(
        &self,
        op: &str,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<T, StorageError> {
        let conn = self.connection.clone();
        retry(op, &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let mut invocation = script.prepare_invoke();
            for key in keys {
                invocation.key(key);
            }
            for arg in args {
                invocation.arg(arg);
            }
            async move {
                let value: T = invocation.invoke_async(&mut conn).await?;
                Ok(value)
            }
        })
        .await
        .map_err(|e: redis::RedisError| backend(e))
    }

    /// Pipeline with query retry. Only for idempotent pipelines.
    async fn run_pipeline(&self, op: &str, pipeline: Pipeline) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        retry(op, &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let pipeline = pipeline.clone();
            async move {
                pipeline.query_async::<()>(&mut conn).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| backend(e))
    }

    /// Pipeline executed exactly once.
    async fn run_pipeline_once(&self, pipeline: Pipeline) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        pipeline.query_async::<()>(&mut conn).await.map_err(backend)
    }

    /// Queue one product's increment into `pipeline`.
    fn push_increment(&self, pipeline: &mut Pipeline, product_id: &str, deltas: &CounterDeltas, now_ms: i64) {
        let counters_key = self.counters_key(product_id);
        let ttl = self.ttl_secs();

        for (metric, amount) in deltas.integer_deltas() {
            if amount > 0 {
                pipeline.cmd("HINCRBY").arg(&counters_key).arg(metric.field()).arg(amount).ignore();
            }
        }
        if deltas.boost_score != 0.0 {
            pipeline
                .cmd("HINCRBYFLOAT")
                .arg(&counters_key)
                .arg(Metric::BoostScore.field())
                .arg(deltas.boost_score)
                .ignore();
        }
        pipeline.cmd("HINCRBY").arg(&counters_key).arg(GENERATION_FIELD).arg(1).ignore();
        pipeline.cmd("EXPIRE").arg(&counters_key).arg(ttl).ignore();

        if let Some(viewer) = &deltas.unique_viewer {
            let viewers_key = self.viewers_key(product_id);
            pipeline.cmd("PFADD").arg(&viewers_key).arg(viewer).ignore();
            pipeline.cmd("EXPIRE").arg(&viewers_key).arg(ttl).ignore();
        }

        pipeline.cmd("ZADD").arg(self.dirty_key()).arg("NX").arg(now_ms).arg(product_id).ignore();
        pipeline.cmd("DEL").arg(self.cache_key(product_id)).ignore();
    }

    fn parse_state(fields: HashMap<String, String>) -> Option<CounterState> {
        if fields.is_empty() {
            return None;
        }
        let counters = ProductCounterSet::from_fields(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let generation = fields
            .get(GENERATION_FIELD)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Some(CounterState::new(counters, fields.contains_key(BASELINE_FIELD), generation))
    }
}

#[async_trait]
impl CounterStore for RedisFastTier {
    async fn init_counters(&self, product_id: &str) -> Result<(), StorageError> {
        let key = self.counters_key(product_id);
        let mut pipeline = pipe();
        pipeline.atomic();
        for metric in Metric::ALL {
            pipeline.cmd("HSETNX").arg(&key).arg(metric.field()).arg(0).ignore();
        }
        pipeline.cmd("EXPIRE").arg(&key).arg(self.ttl_secs()).ignore();
        self.run_pipeline("redis_init_counters", pipeline).await
    }

    async fn increment(&self, product_id: &str, deltas: &CounterDeltas) -> Result<(), StorageError> {
        let mut pipeline = pipe();
        pipeline.atomic();
        self.push_increment(&mut pipeline, product_id, deltas, now_millis());
        self.run_pipeline_once(pipeline).await
    }

    async fn batch_increment(&self, items: &[(String, CounterDeltas)]) -> Result<(), StorageError> {
        if items.is_empty() {
            return Ok(());
        }
        let now_ms = now_millis();
        let mut pipeline = pipe();
        pipeline.atomic();
        for (product_id, deltas) in items {
            self.push_increment(&mut pipeline, product_id, deltas, now_ms);
        }
        self.run_pipeline_once(pipeline).await
    }

    async fn read_state(&self, product_id: &str) -> Result<Option<CounterState>, StorageError> {
        let mut command = cmd("HGETALL");
        command.arg(self.counters_key(product_id));
        let fields: HashMap<String, String> = self.query("redis_read_counters", command).await?;
        Ok(Self::parse_state(fields))
    }

    async fn read_state_batch(&self, product_ids: &[String]) -> Result<Vec<Option<CounterState>>, StorageError> {
        if product_ids.is_empty() {
            return Ok(vec![]);
        }
        let keys: Vec<String> = product_ids.iter().map(|id| self.counters_key(id)).collect();
        let conn = self.connection.clone();

        let rows: Vec<HashMap<String, String>> = retry("redis_read_state_batch", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let keys = keys.clone();
            async move {
                let mut pipeline = pipe();
                for key in &keys {
                    pipeline.cmd("HGETALL").arg(key);
                }
                let rows: Vec<HashMap<String, String>> = pipeline.query_async(&mut conn).await?;
                Ok(rows)
            }
        })
        .await
        .map_err(|e: redis::RedisError| backend(e))?;

        Ok(rows.into_iter().map(Self::parse_state).collect())
    }

    async fn seed_counters(&self, product_id: &str, durable: &ProductCounterSet) -> Result<CounterState, StorageError> {
        let mut args = vec![self.ttl_secs().to_string()];
        for (field, value) in durable.to_fields() {
            args.push(field.to_string());
            args.push(value);
        }
        let fields: HashMap<String, String> = self
            .eval("redis_seed_counters", &self.seed_script, &[self.counters_key(product_id)], &args)
            .await?;
        Self::parse_state(fields).ok_or_else(|| StorageError::Backend("seed script returned an empty hash".into()))
    }

    async fn reset(&self, product_id: &str) -> Result<(), StorageError> {
        let key = self.counters_key(product_id);
        let mut pipeline = pipe();
        pipeline.atomic();
        let hset = pipeline.cmd("HSET").arg(&key);
        for (field, value) in ProductCounterSet::default().to_fields() {
            hset.arg(field).arg(value);
        }
        hset.arg(BASELINE_FIELD).arg(1);
        hset.ignore();
        pipeline.cmd("HINCRBY").arg(&key).arg(GENERATION_FIELD).arg(1).ignore();
        pipeline.cmd("EXPIRE").arg(&key).arg(self.ttl_secs()).ignore();
        pipeline.cmd("DEL").arg(self.viewers_key(product_id)).ignore();
        pipeline.cmd("DEL").arg(self.cache_key(product_id)).ignore();
        self.run_pipeline("redis_reset", pipeline).await
    }

    async fn remove(&self, product_id: &str) -> Result<(), StorageError> {
        let mut pipeline = pipe();
        pipeline.atomic();
        pipeline
            .cmd("DEL")
            .arg(self.counters_key(product_id))
            .arg(self.viewers_key(product_id))
            .arg(self.cache_key(product_id))
            .ignore();
        pipeline.cmd("ZREM").arg(self.dirty_key()).arg(product_id).ignore();
        self.run_pipeline("redis_remove", pipeline).await
    }

    async fn refresh_ttl(&self, product_ids: &[String]) -> Result<(), StorageError> {
        if product_ids.is_empty() {
            return Ok(());
        }
        let ttl = self.ttl_secs();
        let mut pipeline = pipe();
        for id in product_ids {
            pipeline.cmd("EXPIRE").arg(self.counters_key(id)).arg(ttl).ignore();
            pipeline.cmd("EXPIRE").arg(self.viewers_key(id)).arg(ttl).ignore();
        }
        self.run_pipeline("redis_refresh_ttl", pipeline).await
    }

    async fn mark_dirty(&self, entries: &[DirtyEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        // LT adds new members and only lowers existing scores, so the
        // earliest first-dirtied time wins.
        let mut command = cmd("ZADD");
        command.arg(self.dirty_key()).arg("LT");
        for entry in entries {
            command.arg(entry.first_dirtied_ms).arg(&entry.product_id);
        }
        let _: i64 = self.query("redis_mark_dirty", command).await?;
        Ok(())
    }

    async fn claim_dirty(&self, max: usize) -> Result<Vec<DirtyEntry>, StorageError> {
        if max == 0 {
            return Ok(vec![]);
        }
        let mut conn = self.connection.clone();
        let popped: Vec<(String, f64)> = cmd("ZPOPMIN")
            .arg(self.dirty_key())
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        Ok(popped
            .into_iter()
            .map(|(id, score)| DirtyEntry::new(id, score as i64))
            .collect())
    }

    async fn dirty_len(&self) -> Result<usize, StorageError> {
        let mut command = cmd("ZCARD");
        command.arg(self.dirty_key());
        self.query("redis_dirty_len", command).await
    }

    async fn is_dirty(&self, product_id: &str) -> Result<bool, StorageError> {
        let mut command = cmd("ZSCORE");
        command.arg(self.dirty_key()).arg(product_id);
        let score: Option<f64> = self.query("redis_is_dirty", command).await?;
        Ok(score.is_some())
    }

    async fn unique_viewers(&self, product_id: &str) -> Result<u64, StorageError> {
        let mut command = cmd("PFCOUNT");
        command.arg(self.viewers_key(product_id));
        self.query("redis_unique_viewers", command).await
    }
}

#[async_trait]
impl StatsCache for RedisFastTier {
    async fn get_cached_stats(&self, product_id: &str) -> Result<Option<String>, StorageError> {
        let mut command = cmd("GET");
        command.arg(self.cache_key(product_id));
        self.query("redis_cache_get", command).await
    }

    async fn put_cached_stats(
        &self,
        product_id: &str,
        payload: &str,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool, StorageError> {
        let keys = [self.counters_key(product_id), self.cache_key(product_id)];
        let args = [
            generation.to_string(),
            payload.to_string(),
            ttl.as_secs().max(1).to_string(),
        ];
        let stored: i64 = self.eval("redis_cache_put", &self.cache_put_script, &keys, &args).await?;
        Ok(stored == 1)
    }

    async fn invalidate_cached_stats(&self, product_id: &str) -> Result<(), StorageError> {
        let mut command = cmd("DEL");
        command.arg(self.cache_key(product_id));
        let _: i64 = self.query("redis_cache_invalidate", command).await?;
        Ok(())
    }
}

#[async_trait]
impl RankIndexStore for RedisFastTier {
    async fn upsert(&self, index: RankIndex, product_id: &str, score: f64) -> Result<(), StorageError> {
        let mut command = cmd("ZADD");
        command.arg(self.index_key(index)).arg(score).arg(product_id);
        let _: i64 = self.query("redis_rank_upsert", command).await?;
        Ok(())
    }

    async fn remove(&self, index: RankIndex, product_id: &str) -> Result<(), StorageError> {
        let mut command = cmd("ZREM");
        command.arg(self.index_key(index)).arg(product_id);
        let _: i64 = self.query("redis_rank_remove", command).await?;
        Ok(())
    }

    async fn remove_everywhere(&self, product_id: &str) -> Result<(), StorageError> {
        let mut pipeline = pipe();
        pipeline.atomic();
        for index in RankIndex::ALL {
            pipeline.cmd("ZREM").arg(self.index_key(index)).arg(product_id).ignore();
        }
        self.run_pipeline("redis_rank_remove_all", pipeline).await
    }

    async fn range(&self, index: RankIndex, offset: usize, limit: usize) -> Result<Vec<(String, f64)>, StorageError> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let mut command = cmd("ZREVRANGE");
        command
            .arg(self.index_key(index))
            .arg(offset)
            .arg(offset + limit - 1)
            .arg("WITHSCORES");
        self.query("redis_rank_range", command).await
    }

    async fn rank(&self, index: RankIndex, product_id: &str) -> Result<Option<usize>, StorageError> {
        let mut command = cmd("ZREVRANK");
        command.arg(self.index_key(index)).arg(product_id);
        self.query("redis_rank_of", command).await
    }

    async fn score(&self, index: RankIndex, product_id: &str) -> Result<Option<f64>, StorageError> {
        let mut command = cmd("ZSCORE");
        command.arg(self.index_key(index)).arg(product_id);
        self.query("redis_rank_score", command).await
    }

    async fn prune_at_or_below(&self, index: RankIndex, max_score: f64) -> Result<usize, StorageError> {
        let mut command = cmd("ZREMRANGEBYSCORE");
        command.arg(self.index_key(index)).arg("-inf").arg(max_score);
        self.query("redis_rank_prune", command).await
    }

    async fn len(&self, index: RankIndex) -> Result<usize, StorageError> {
        let mut command = cmd("ZCARD");
        command.arg(self.index_key(index));
        self.query("redis_rank_len", command).await
    }
}

#[async_trait]
impl LeaseLock for RedisFastTier {
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>, StorageError> {
        let token = uuid::Uuid::new_v4().to_string();
        let mut conn = self.connection.clone();
        let reply: Option<String> = cmd("SET")
            .arg(self.lock_key(name))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        Ok(reply.map(|_| LockToken {
            name: name.to_string(),
            token,
        }))
    }

    async fn release(&self, token: &LockToken) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let script = Script::new(RELEASE_SCRIPT);
        let removed: i64 = script
            .key(self.lock_key(&token.name))
            .arg(&token.token)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(removed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state_empty_hash_is_evicted() {
        assert!(RedisFastTier::parse_state(HashMap::new()).is_none());
    }

    #[test]
    fn test_parse_state_partial_hash() {
        let mut fields = HashMap::new();
        fields.insert("views".to_string(), "42".to_string());
        fields.insert("boost_score".to_string(), "1.5".to_string());
        fields.insert("generation".to_string(), "7".to_string());

        let state = RedisFastTier::parse_state(fields).unwrap();
        assert_eq!(state.counters.views, 42);
        assert_eq!(state.counters.carts, 0);
        assert_eq!(state.counters.boost_score, 1.5);
        assert_eq!(state.generation, 7);
        assert!(!state.baseline);
    }

    #[test]
    fn test_parse_state_baselined_floors_boost() {
        let mut fields = HashMap::new();
        fields.insert("views".to_string(), "3".to_string());
        fields.insert("boost_score".to_string(), "-2".to_string());
        fields.insert("baseline".to_string(), "1".to_string());

        let state = RedisFastTier::parse_state(fields).unwrap();
        assert!(state.baseline);
        assert_eq!(state.counters.boost_score, 0.0);
        assert_eq!(state.generation, 0);
    }
}
