//! # Reconciliation
//!
//! Copies cache-resident counts into the durable poll records on a fixed
//! period, so a restart or cold cache never loses history and consumers
//! that only read durable storage see eventually fresh data.
//!
//! Every run: fetch the active polls, sync each one in parallel under its
//! own timeout, overwrite the option counts and `total_votes`, stamp
//! `last_synced_at`. One poll's failure never aborts the batch and nothing
//! here ever reaches a vote-casting client; failures are logged, counted,
//! and retried on the next scheduled run.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::{task::JoinHandle, time::{interval, sleep, timeout}};
use tracing::{debug, error, info};

use crate::{
    cache::CounterStore, error::AppError, models::Poll, state::AppState, store::Database,
};

const POLL_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Run/volume counters for the reconciler, owned by the spawned job and
/// read through [`SyncStats::snapshot`] by the health surface.
#[derive(Default)]
pub struct SyncStats {
    last_run: Mutex<Option<DateTime<Utc>>>,
    total_syncs: AtomicU64,
    total_polls_synced: AtomicU64,
    total_votes_synced: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub last_run: Option<DateTime<Utc>>,
    pub total_syncs: u64,
    pub total_polls_synced: u64,
    pub total_votes_synced: u64,
    pub errors: u64,
    /// Seconds since the last completed run, when there has been one.
    pub uptime: Option<i64>,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_run(&self, polls_synced: u64, votes_synced: u64) {
        *self.last_run.lock().expect("stats lock poisoned") = Some(Utc::now());
        self.total_syncs.fetch_add(1, Ordering::Relaxed);
        self.total_polls_synced.fetch_add(polls_synced, Ordering::Relaxed);
        self.total_votes_synced.fetch_add(votes_synced, Ordering::Relaxed);
    }

    fn record_batch_failure(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        let last_run = *self.last_run.lock().expect("stats lock poisoned");
        SyncSnapshot {
            last_run,
            total_syncs: self.total_syncs.load(Ordering::Relaxed),
            total_polls_synced: self.total_polls_synced.load(Ordering::Relaxed),
            total_votes_synced: self.total_votes_synced.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            uptime: last_run.map(|at| (Utc::now() - at).num_seconds()),
        }
    }
}

pub struct SyncOutcome {
    pub poll_id: String,
    pub total_votes: i64,
    pub synced: bool,
}

/// Reconciles one poll: cache snapshot in, durable counts out.
pub async fn sync_poll(db: &Database, cache: &dyn CounterStore, poll: &Poll) -> SyncOutcome {
    let result = timeout(POLL_SYNC_TIMEOUT, write_counts(db, cache, poll)).await;

    match result {
        Ok(Ok(total_votes)) => SyncOutcome {
            poll_id: poll.id.clone(),
            total_votes,
            synced: true,
        },
        Ok(Err(e)) => {
            error!("Sync error for poll {}: {e}", poll.id);
            SyncOutcome {
                poll_id: poll.id.clone(),
                total_votes: 0,
                synced: false,
            }
        }
        Err(_) => {
            error!("Sync timed out for poll {}", poll.id);
            SyncOutcome {
                poll_id: poll.id.clone(),
                total_votes: 0,
                synced: false,
            }
        }
    }
}

async fn write_counts(
    db: &Database,
    cache: &dyn CounterStore,
    poll: &Poll,
) -> Result<i64, AppError> {
    let counts = cache.counts(&poll.id, &poll.option_ids()).await?;
    let total_votes = counts.iter().map(|(_, votes)| votes).sum();

    db.save_counts(&poll.id, &counts, total_votes, Utc::now()).await?;
    Ok(total_votes)
}

/// One reconciliation pass over every active poll. Polls sync in parallel;
/// a stalled or failing poll costs its own slot only.
pub async fn sync_all_polls(state: &AppState) -> Vec<SyncOutcome> {
    let started = Instant::now();

    let polls = match state.db.find_active().await {
        Ok(polls) => polls,
        Err(e) => {
            error!("Sync run failed to list active polls: {e}");
            state.sync_stats.record_batch_failure();
            return Vec::new();
        }
    };

    if polls.is_empty() {
        debug!("No active polls to sync");
        return Vec::new();
    }

    let outcomes = join_all(
        polls
            .iter()
            .map(|poll| sync_poll(&state.db, state.cache.as_ref(), poll)),
    )
    .await;

    let synced = outcomes.iter().filter(|o| o.synced).count();
    let votes: i64 = outcomes
        .iter()
        .filter(|o| o.synced)
        .map(|o| o.total_votes)
        .sum();

    state.sync_stats.record_run(synced as u64, votes.max(0) as u64);
    info!(
        "Sync complete: {synced}/{} polls synced, {votes} total votes ({:?})",
        outcomes.len(),
        started.elapsed()
    );

    outcomes
}

/// Starts the periodic job: one delayed initial run so dependencies can
/// warm up, then a fixed-period loop.
pub fn spawn(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep(state.config.sync_initial_delay()).await;
        info!("Running initial sync...");
        sync_all_polls(&state).await;

        let mut ticker = interval(state.config.sync_interval());
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            sync_all_polls(&state).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        cache::{CacheError, MemoryCounterStore, WindowOutcome},
        config::Config,
        models::{PollSettings, PollStatus},
        voting::cast_vote,
    };

    async fn test_state() -> Arc<AppState> {
        AppState::with_config(Config {
            port: 0,
            client_url: "http://localhost:5173".to_string(),
            redis_url: None,
            database_url: "sqlite::memory:".to_string(),
            rate_limit_max_requests: 100,
            rate_limit_window_ms: 60_000,
            sync_interval_secs: 30,
            sync_initial_delay_secs: 5,
            voter_ttl_secs: 604_800,
        })
        .await
    }

    async fn seed_poll(state: &AppState, title: &str) -> Poll {
        let poll = Poll::new(
            title.to_string(),
            vec!["Yes".to_string(), "No".to_string()],
            PollSettings::default(),
            "anonymous".to_string(),
        );
        state.db.create_poll(&poll).await.unwrap();
        poll
    }

    #[tokio::test]
    async fn burst_then_sync_matches_cache_counts() {
        let state = test_state().await;
        let poll = seed_poll(&state, "Sync round trip title").await;

        for i in 0..5 {
            cast_vote(&state, &poll.id, "A", &format!("voter-a-{i}")).await.unwrap();
        }
        for i in 0..3 {
            cast_vote(&state, &poll.id, "B", &format!("voter-b-{i}")).await.unwrap();
        }

        let outcomes = sync_all_polls(&state).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].synced);
        assert_eq!(outcomes[0].total_votes, 8);

        let durable = state.db.get_poll(&poll.id).await.unwrap().unwrap();
        assert_eq!(durable.options[0].votes, 5);
        assert_eq!(durable.options[1].votes, 3);
        assert_eq!(durable.total_votes, 8);
        assert!(durable.last_synced_at.is_some());

        let stats = state.sync_stats.snapshot();
        assert_eq!(stats.total_syncs, 1);
        assert_eq!(stats.total_polls_synced, 1);
        assert_eq!(stats.total_votes_synced, 8);
        assert_eq!(stats.errors, 0);
        assert!(stats.last_run.is_some());
    }

    #[tokio::test]
    async fn draft_and_closed_polls_are_left_alone() {
        let state = test_state().await;

        let mut draft = Poll::new(
            "Draft poll title".to_string(),
            vec!["Yes".to_string(), "No".to_string()],
            PollSettings::default(),
            "anonymous".to_string(),
        );
        draft.status = PollStatus::Draft;
        state.db.create_poll(&draft).await.unwrap();

        let mut closed = Poll::new(
            "Closed poll title".to_string(),
            vec!["Yes".to_string(), "No".to_string()],
            PollSettings::default(),
            "anonymous".to_string(),
        );
        closed.status = PollStatus::Closed;
        state.db.create_poll(&closed).await.unwrap();

        let outcomes = sync_all_polls(&state).await;
        assert!(outcomes.is_empty());
        assert_eq!(state.sync_stats.snapshot().total_syncs, 0);
    }

    /// Counter store that fails count reads for one poisoned poll.
    struct FlakyStore {
        inner: MemoryCounterStore,
        poisoned_poll: String,
    }

    fn unreachable_error() -> CacheError {
        CacheError::Redis(redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "simulated outage",
        )))
    }

    #[async_trait]
    impl CounterStore for FlakyStore {
        async fn increment(&self, poll_id: &str, option_id: &str) -> Result<i64, CacheError> {
            self.inner.increment(poll_id, option_id).await
        }

        async fn counts(
            &self,
            poll_id: &str,
            option_ids: &[String],
        ) -> Result<Vec<(String, i64)>, CacheError> {
            if poll_id == self.poisoned_poll {
                return Err(unreachable_error());
            }
            self.inner.counts(poll_id, option_ids).await
        }

        async fn has_voted(&self, poll_id: &str, identity: &str) -> Result<bool, CacheError> {
            self.inner.has_voted(poll_id, identity).await
        }

        async fn register_voter(
            &self,
            poll_id: &str,
            identity: &str,
            ttl: Duration,
        ) -> Result<bool, CacheError> {
            self.inner.register_voter(poll_id, identity, ttl).await
        }

        async fn rate_window(
            &self,
            identity: &str,
            now_ms: i64,
            window_ms: i64,
            limit: u32,
        ) -> Result<WindowOutcome, CacheError> {
            self.inner.rate_window(identity, now_ms, window_ms, limit).await
        }

        async fn ping(&self) -> Result<(), CacheError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn one_failing_poll_does_not_abort_the_batch() {
        let state = test_state().await;
        let healthy = seed_poll(&state, "Healthy poll title").await;
        let poisoned = seed_poll(&state, "Poisoned poll title").await;

        cast_vote(&state, &healthy.id, "A", "voter-x").await.unwrap();

        let state = AppState::for_tests(
            state,
            Arc::new(FlakyStore {
                inner: MemoryCounterStore::new(),
                poisoned_poll: poisoned.id.clone(),
            }),
        );
        // rebuild the healthy poll's cache count in the replacement store
        state.cache.register_voter(&healthy.id, "voter-x", Duration::from_secs(60)).await.unwrap();
        state.cache.increment(&healthy.id, "A").await.unwrap();

        let outcomes = sync_all_polls(&state).await;
        assert_eq!(outcomes.len(), 2);

        let healthy_outcome = outcomes.iter().find(|o| o.poll_id == healthy.id).unwrap();
        let poisoned_outcome = outcomes.iter().find(|o| o.poll_id == poisoned.id).unwrap();
        assert!(healthy_outcome.synced);
        assert!(!poisoned_outcome.synced);

        let durable = state.db.get_poll(&healthy.id).await.unwrap().unwrap();
        assert_eq!(durable.options[0].votes, 1);
        assert_eq!(durable.total_votes, 1);

        let stats = state.sync_stats.snapshot();
        assert_eq!(stats.total_syncs, 1);
        assert_eq!(stats.total_polls_synced, 1);
    }

    #[tokio::test]
    async fn repeated_reads_without_votes_are_stable() {
        let state = test_state().await;
        let poll = seed_poll(&state, "Stable snapshot title").await;
        cast_vote(&state, &poll.id, "A", "voter-x").await.unwrap();

        let first = crate::voting::load_results(state.cache.as_ref(), &poll).await.unwrap();
        for _ in 0..3 {
            let next = crate::voting::load_results(state.cache.as_ref(), &poll).await.unwrap();
            assert_eq!(next.1, first.1);
            let votes: Vec<i64> = next.0.iter().map(|r| r.votes).collect();
            let first_votes: Vec<i64> = first.0.iter().map(|r| r.votes).collect();
            assert_eq!(votes, first_votes);
        }
    }
}
