//! The vote-cast pipeline: admission has already happened at the route
//! layer; this module owns everything between "request admitted" and
//! "snapshot broadcast".

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::{
    cache::{CacheError, CounterStore},
    error::AppError,
    models::{Poll, is_valid_poll_id},
    realtime::{LastVote, OptionResult, ResultsUpdate},
    state::AppState,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteReceipt {
    pub voted_for: String,
    pub results: Vec<OptionResult>,
    pub total_votes: i64,
}

/// Runs one vote-cast attempt to a terminal state. The poll record is read
/// fresh from durable storage on every call so votes are never served
/// against stale or closed polls.
pub async fn cast_vote(
    state: &AppState,
    poll_id: &str,
    option_id: &str,
    identity: &str,
) -> Result<VoteReceipt, AppError> {
    if !is_valid_poll_id(poll_id) {
        return Err(AppError::Validation("Invalid poll ID format".to_string()));
    }

    let poll = state.db.get_poll(poll_id).await?.ok_or(AppError::NotFound)?;

    if !poll.is_active() {
        return Err(AppError::PollInactive);
    }

    if !poll.has_option(option_id) {
        return Err(AppError::InvalidOption(option_id.to_string()));
    }

    if state.cache.has_voted(poll_id, identity).await? {
        return Err(AppError::DuplicateVote);
    }

    // the conditional insert is the authoritative duplicate gate; the probe
    // above only spares obvious repeats a set mutation
    let first_vote = state
        .cache
        .register_voter(poll_id, identity, state.config.voter_ttl())
        .await?;
    if !first_vote {
        return Err(AppError::DuplicateVote);
    }

    // an error past this point is surfaced as a server error: the voter
    // record exists, so a client retry would land on the duplicate gate
    state.cache.increment(poll_id, option_id).await?;

    let (results, total_votes) = load_results(state.cache.as_ref(), &poll).await?;

    let update = ResultsUpdate {
        poll_id: poll.id.clone(),
        results: results.clone(),
        total_votes,
        last_vote: LastVote {
            option_id: option_id.to_string(),
            timestamp: Utc::now(),
        },
    };
    let delivered = state.hub.publish(&poll.id, update);
    debug!("Broadcast update for poll {} to {delivered} subscribers", poll.id);

    Ok(VoteReceipt {
        voted_for: option_id.to_string(),
        results,
        total_votes,
    })
}

/// Current snapshot for a poll, ordered like the poll's options. Options
/// with no cache entry report 0.
pub async fn load_results(
    cache: &dyn CounterStore,
    poll: &Poll,
) -> Result<(Vec<OptionResult>, i64), CacheError> {
    let counts = cache.counts(&poll.id, &poll.option_ids()).await?;

    let results: Vec<OptionResult> = poll
        .options
        .iter()
        .zip(counts)
        .map(|(option, (_, votes))| OptionResult {
            id: option.id.clone(),
            text: option.text.clone(),
            votes,
        })
        .collect();

    let total_votes = results.iter().map(|r| r.votes).sum();
    Ok((results, total_votes))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::{
        config::Config,
        models::{Poll, PollSettings, PollStatus},
        state::AppState,
    };

    async fn test_state() -> Arc<AppState> {
        AppState::with_config(Config {
            port: 0,
            client_url: "http://localhost:5173".to_string(),
            redis_url: None,
            database_url: "sqlite::memory:".to_string(),
            rate_limit_max_requests: 10,
            rate_limit_window_ms: 60_000,
            sync_interval_secs: 30,
            sync_initial_delay_secs: 5,
            voter_ttl_secs: 604_800,
        })
        .await
    }

    async fn seed_poll(state: &AppState) -> Poll {
        let poll = Poll::new(
            "Best dining court on campus".to_string(),
            vec!["Earhart".to_string(), "Wiley".to_string()],
            PollSettings::default(),
            "anonymous".to_string(),
        );
        state.db.create_poll(&poll).await.unwrap();
        poll
    }

    #[tokio::test]
    async fn first_vote_counts_and_duplicates_conflict() {
        let state = test_state().await;
        let poll = seed_poll(&state).await;

        let receipt = cast_vote(&state, &poll.id, "A", "voter-x").await.unwrap();
        assert_eq!(receipt.voted_for, "A");
        assert_eq!(receipt.total_votes, 1);
        assert_eq!(receipt.results[0].votes, 1);
        assert_eq!(receipt.results[1].votes, 0);

        let err = cast_vote(&state, &poll.id, "B", "voter-x").await.unwrap_err();
        assert!(matches!(err, AppError::DuplicateVote));

        // the rejected attempt must not have counted anywhere
        let (_, total) = load_results(state.cache.as_ref(), &poll).await.unwrap();
        assert_eq!(total, 1);

        let receipt = cast_vote(&state, &poll.id, "B", "voter-y").await.unwrap();
        assert_eq!(receipt.results[0].votes, 1);
        assert_eq!(receipt.results[1].votes, 1);
        assert_eq!(receipt.total_votes, 2);
    }

    #[tokio::test]
    async fn concurrent_duplicate_attempts_admit_exactly_one() {
        let state = test_state().await;
        let poll = seed_poll(&state).await;

        let attempts: Vec<_> = (0..12)
            .map(|_| {
                let state = Arc::clone(&state);
                let poll_id = poll.id.clone();
                tokio::spawn(async move { cast_vote(&state, &poll_id, "A", "voter-x").await })
            })
            .collect();

        let mut successes = 0;
        for attempt in attempts {
            if attempt.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);

        let (_, total) = load_results(state.cache.as_ref(), &poll).await.unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn distinct_identities_all_count() {
        let state = test_state().await;
        let poll = seed_poll(&state).await;

        let attempts: Vec<_> = (0..20)
            .map(|i| {
                let state = Arc::clone(&state);
                let poll_id = poll.id.clone();
                tokio::spawn(async move {
                    cast_vote(&state, &poll_id, "A", &format!("voter-{i}")).await
                })
            })
            .collect();
        for attempt in attempts {
            attempt.await.unwrap().unwrap();
        }

        let (results, total) = load_results(state.cache.as_ref(), &poll).await.unwrap();
        assert_eq!(results[0].votes, 20);
        assert_eq!(total, 20);
    }

    #[tokio::test]
    async fn rejects_bad_ids_and_unknown_polls() {
        let state = test_state().await;

        let err = cast_vote(&state, "not-hex", "A", "voter-x").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = cast_vote(&state, "0123456789abcdef01234567", "A", "voter-x")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound));
    }

    #[tokio::test]
    async fn rejects_inactive_and_expired_polls() {
        let state = test_state().await;

        let mut closed = Poll::new(
            "Closed poll title".to_string(),
            vec!["Yes".to_string(), "No".to_string()],
            PollSettings::default(),
            "anonymous".to_string(),
        );
        closed.status = PollStatus::Closed;
        state.db.create_poll(&closed).await.unwrap();

        let err = cast_vote(&state, &closed.id, "A", "voter-x").await.unwrap_err();
        assert!(matches!(err, AppError::PollInactive));

        let mut expired = Poll::new(
            "Expired poll title".to_string(),
            vec!["Yes".to_string(), "No".to_string()],
            PollSettings {
                expires_at: Some(Utc::now() - chrono::Duration::minutes(5)),
                ..PollSettings::default()
            },
            "anonymous".to_string(),
        );
        expired.status = PollStatus::Active;
        state.db.create_poll(&expired).await.unwrap();

        let err = cast_vote(&state, &expired.id, "A", "voter-x").await.unwrap_err();
        assert!(matches!(err, AppError::PollInactive));
    }

    #[tokio::test]
    async fn rejects_unknown_options_without_counting() {
        let state = test_state().await;
        let poll = seed_poll(&state).await;

        let err = cast_vote(&state, &poll.id, "Z", "voter-x").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidOption(_)));

        // the identity is still free to vote for a real option
        cast_vote(&state, &poll.id, "A", "voter-x").await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_snapshot_reflects_the_vote_and_sums() {
        let state = test_state().await;
        let poll = seed_poll(&state).await;
        let mut updates = state.hub.subscribe(&poll.id);

        cast_vote(&state, &poll.id, "B", "voter-x").await.unwrap();

        let update = updates.recv().await.unwrap();
        assert_eq!(update.poll_id, poll.id);
        assert_eq!(update.last_vote.option_id, "B");
        assert_eq!(
            update.total_votes,
            update.results.iter().map(|r| r.votes).sum::<i64>()
        );
        // the snapshot is taken at or after this vote's own increment
        assert_eq!(update.results[1].votes, 1);
    }
}
