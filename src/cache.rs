//! # Counter store
//!
//! RAM-resident side of the tally: per-option vote counts, per-poll voter
//! sets, and per-identity rate windows. The durable poll records only catch
//! up at reconciliation time, so between runs this store is the freshest
//! view of every count.
//!
//! ## Keys
//!
//! - `poll:{pollId}:option:{optionId}` -> 32-bit **votes** int, absent means 0
//! - `poll:{pollId}:voters` -> set of identities, 7 day TTL refreshed on insert
//! - `ratelimit:vote:{identity}` -> sorted set of admission timestamps (ms)
//!
//! ## Atomicity
//!
//! Two multi-step operations must not interleave between concurrent request
//! handlers:
//!
//! - `register_voter` is a conditional set-insert. Its boolean result is the
//!   only thing that decides whether the caller may increment, so the insert
//!   and the membership test are one operation (SADD return value), not a
//!   read followed by a write.
//! - `rate_window` prunes, counts, and conditionally records one admission.
//!   Against Redis this runs as a Lua script; the in-memory store does the
//!   same work under a single lock.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use redis::{
    AsyncCommands, Client, Script,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("counter store unreachable: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Outcome of one atomic rate-window update. `count` is the number of
/// admissions already inside the window, taken before this request was
/// recorded. `oldest_ms` is only meaningful when the request was denied.
pub struct WindowOutcome {
    pub admitted: bool,
    pub count: i64,
    pub oldest_ms: i64,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increments and returns the post-increment count.
    async fn increment(&self, poll_id: &str, option_id: &str) -> Result<i64, CacheError>;

    /// Bulk read of current counts, in the order of `option_ids`. Options
    /// with no entry report 0.
    async fn counts(
        &self,
        poll_id: &str,
        option_ids: &[String],
    ) -> Result<Vec<(String, i64)>, CacheError>;

    async fn has_voted(&self, poll_id: &str, identity: &str) -> Result<bool, CacheError>;

    /// Conditional insert into the poll's voter set. Returns `true` when the
    /// identity was newly recorded, `false` when it had already voted. The
    /// set's TTL is reset on every call.
    async fn register_voter(
        &self,
        poll_id: &str,
        identity: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    /// Prune entries older than `now_ms - window_ms`, count the survivors,
    /// and record a new admission only if the count is under `limit`.
    async fn rate_window(
        &self,
        identity: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
    ) -> Result<WindowOutcome, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}

fn counter_key(poll_id: &str, option_id: &str) -> String {
    format!("poll:{poll_id}:option:{option_id}")
}

fn voters_key(poll_id: &str) -> String {
    format!("poll:{poll_id}:voters")
}

fn window_key(identity: &str) -> String {
    format!("ratelimit:vote:{identity}")
}

fn window_key_ttl_secs(window_ms: i64) -> i64 {
    window_ms / 1000 + if window_ms % 1000 > 0 { 1 } else { 0 } + 10
}

// ---------------------------------------------------------------------------
// Redis

const RATE_WINDOW_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, ARGV[1] - ARGV[2])
local count = redis.call('ZCARD', KEYS[1])
if count >= tonumber(ARGV[3]) then
  local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
  if oldest[2] then
    return {0, count, tonumber(oldest[2])}
  end
  return {0, count, tonumber(ARGV[1])}
end
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[5])
redis.call('EXPIRE', KEYS[1], ARGV[4])
return {1, count, 0}
"#;

pub struct RedisCounterStore {
    manager: ConnectionManager,
    rate_script: Script,
    window_seq: std::sync::atomic::AtomicU64,
}

impl RedisCounterStore {
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(1)
            .set_connection_timeout(Duration::from_millis(500))
            .set_response_timeout(Duration::from_secs(2));

        let client = Client::open(redis_url)?;
        let manager = client.get_connection_manager_with_config(config).await?;

        Ok(Self {
            manager,
            rate_script: Script::new(RATE_WINDOW_SCRIPT),
            window_seq: std::sync::atomic::AtomicU64::new(0),
        })
    }

    fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, poll_id: &str, option_id: &str) -> Result<i64, CacheError> {
        let mut con = self.connection();
        let count: i64 = con.incr(counter_key(poll_id, option_id), 1).await?;
        Ok(count)
    }

    async fn counts(
        &self,
        poll_id: &str,
        option_ids: &[String],
    ) -> Result<Vec<(String, i64)>, CacheError> {
        let keys: Vec<String> = option_ids
            .iter()
            .map(|id| counter_key(poll_id, id))
            .collect();

        let mut con = self.connection();
        let values: Vec<Option<i64>> = con.mget(&keys).await?;

        Ok(option_ids
            .iter()
            .zip(values)
            .map(|(id, count)| (id.clone(), count.unwrap_or(0)))
            .collect())
    }

    async fn has_voted(&self, poll_id: &str, identity: &str) -> Result<bool, CacheError> {
        let mut con = self.connection();
        let member: bool = con.sismember(voters_key(poll_id), identity).await?;
        Ok(member)
    }

    async fn register_voter(
        &self,
        poll_id: &str,
        identity: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let key = voters_key(poll_id);
        let mut con = self.connection();

        let (added, _): (i64, i64) = redis::pipe()
            .atomic()
            .sadd(&key, identity)
            .expire(&key, ttl.as_secs() as i64)
            .query_async(&mut con)
            .await?;

        Ok(added == 1)
    }

    async fn rate_window(
        &self,
        identity: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
    ) -> Result<WindowOutcome, CacheError> {
        let seq = self
            .window_seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let member = format!("{now_ms}-{}-{seq}", std::process::id());

        let mut con = self.connection();
        let (admitted, count, oldest_ms): (i64, i64, i64) = self
            .rate_script
            .key(window_key(identity))
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(window_key_ttl_secs(window_ms))
            .arg(member)
            .invoke_async(&mut con)
            .await?;

        Ok(WindowOutcome {
            admitted: admitted == 1,
            count,
            oldest_ms,
        })
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut con = self.connection();
        let _: String = redis::cmd("PING").query_async(&mut con).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-process

/// Single-worker stand-in for the shared store. Every operation holds one
/// lock for its whole span, which gives the same atomicity contract the
/// Redis implementation gets from pipelines and scripts.
#[derive(Default)]
pub struct MemoryCounterStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    counters: HashMap<String, i64>,
    voters: HashMap<String, VoterSet>,
    windows: HashMap<String, Vec<i64>>,
}

struct VoterSet {
    members: HashSet<String>,
    expires_at: Instant,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.inner.lock().expect("counter store lock poisoned")
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, poll_id: &str, option_id: &str) -> Result<i64, CacheError> {
        let mut state = self.lock();
        let count = state
            .counters
            .entry(counter_key(poll_id, option_id))
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn counts(
        &self,
        poll_id: &str,
        option_ids: &[String],
    ) -> Result<Vec<(String, i64)>, CacheError> {
        let state = self.lock();
        Ok(option_ids
            .iter()
            .map(|id| {
                let count = state
                    .counters
                    .get(&counter_key(poll_id, id))
                    .copied()
                    .unwrap_or(0);
                (id.clone(), count)
            })
            .collect())
    }

    async fn has_voted(&self, poll_id: &str, identity: &str) -> Result<bool, CacheError> {
        let state = self.lock();
        Ok(state
            .voters
            .get(&voters_key(poll_id))
            .is_some_and(|set| set.expires_at > Instant::now() && set.members.contains(identity)))
    }

    async fn register_voter(
        &self,
        poll_id: &str,
        identity: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut state = self.lock();
        let set = state
            .voters
            .entry(voters_key(poll_id))
            .or_insert_with(|| VoterSet {
                members: HashSet::new(),
                expires_at: Instant::now() + ttl,
            });

        if set.expires_at <= Instant::now() {
            set.members.clear();
        }

        let added = set.members.insert(identity.to_string());
        set.expires_at = Instant::now() + ttl;
        Ok(added)
    }

    async fn rate_window(
        &self,
        identity: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
    ) -> Result<WindowOutcome, CacheError> {
        let mut state = self.lock();
        let entries = state.windows.entry(window_key(identity)).or_default();

        entries.retain(|&ts| ts > now_ms - window_ms);
        let count = entries.len() as i64;

        if count >= i64::from(limit) {
            let oldest_ms = entries.iter().copied().min().unwrap_or(now_ms);
            return Ok(WindowOutcome {
                admitted: false,
                count,
                oldest_ms,
            });
        }

        entries.push(now_ms);
        Ok(WindowOutcome {
            admitted: true,
            count,
            oldest_ms: 0,
        })
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn missing_options_count_as_zero() {
        let store = MemoryCounterStore::new();
        store.increment("p1", "A").await.unwrap();
        store.increment("p1", "A").await.unwrap();

        let counts = store
            .counts("p1", &["A".to_string(), "B".to_string()])
            .await
            .unwrap();
        assert_eq!(counts, vec![("A".to_string(), 2), ("B".to_string(), 0)]);
    }

    #[tokio::test]
    async fn counters_are_scoped_per_poll() {
        let store = MemoryCounterStore::new();
        store.increment("p1", "A").await.unwrap();

        let counts = store.counts("p2", &["A".to_string()]).await.unwrap();
        assert_eq!(counts[0].1, 0);
    }

    #[tokio::test]
    async fn concurrent_increments_are_all_counted() {
        let store = Arc::new(MemoryCounterStore::new());

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.increment("p1", "A").await.unwrap() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let counts = store.counts("p1", &["A".to_string()]).await.unwrap();
        assert_eq!(counts[0].1, 64);
    }

    #[tokio::test]
    async fn register_voter_admits_exactly_once_under_races() {
        let store = Arc::new(MemoryCounterStore::new());
        let ttl = Duration::from_secs(600);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.register_voter("p1", "voter-x", ttl).await.unwrap() })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert!(store.has_voted("p1", "voter-x").await.unwrap());
        assert!(!store.has_voted("p2", "voter-x").await.unwrap());
    }

    #[tokio::test]
    async fn expired_voter_set_admits_again() {
        let store = MemoryCounterStore::new();
        assert!(
            store
                .register_voter("p1", "voter-x", Duration::from_millis(10))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!store.has_voted("p1", "voter-x").await.unwrap());
        assert!(
            store
                .register_voter("p1", "voter-x", Duration::from_secs(60))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn rate_window_counts_before_recording() {
        let store = MemoryCounterStore::new();
        let now = 1_000_000;

        for i in 0..3 {
            let out = store.rate_window("id", now + i, 60_000, 3).await.unwrap();
            assert!(out.admitted);
            assert_eq!(out.count, i);
        }

        let out = store.rate_window("id", now + 3, 60_000, 3).await.unwrap();
        assert!(!out.admitted);
        assert_eq!(out.count, 3);
        assert_eq!(out.oldest_ms, now);
    }

    #[tokio::test]
    async fn rate_window_prunes_old_entries() {
        let store = MemoryCounterStore::new();

        for _ in 0..2 {
            assert!(store.rate_window("id", 1_000, 1_000, 2).await.unwrap().admitted);
        }
        assert!(!store.rate_window("id", 1_500, 1_000, 2).await.unwrap().admitted);

        // both entries fall out of the window at t > 2000
        let out = store.rate_window("id", 2_100, 1_000, 2).await.unwrap();
        assert!(out.admitted);
        assert_eq!(out.count, 0);
    }

    #[tokio::test]
    async fn denied_requests_are_not_recorded() {
        let store = MemoryCounterStore::new();

        assert!(store.rate_window("id", 1_000, 10_000, 1).await.unwrap().admitted);
        for t in [2_000, 3_000, 4_000] {
            assert!(!store.rate_window("id", t, 10_000, 1).await.unwrap().admitted);
        }

        // the only recorded entry is the admitted one at t=1000, so the
        // window opens again right after it expires
        assert!(store.rate_window("id", 11_100, 10_000, 1).await.unwrap().admitted);
    }
}
