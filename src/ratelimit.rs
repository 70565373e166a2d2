//! Sliding-window admission control for the vote endpoint, keyed by client
//! identity rather than by poll. The window update itself is a single atomic
//! operation in the counter store; this module derives the identity, does
//! the retry math, and shapes the response metadata.

use std::net::SocketAddr;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, Utc};

use crate::cache::{CacheError, CounterStore};

/// Identity used for rate limiting and duplicate-vote suppression: first
/// forwarded client address, then the peer socket address, then "unknown".
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match forwarded {
        Some(addr) => addr.to_string(),
        None => match peer {
            Some(addr) => addr.ip().to_string(),
            None => "unknown".to_string(),
        },
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Admission {
    Granted {
        limit: u32,
        remaining: u32,
        reset_at: DateTime<Utc>,
    },
    Denied {
        limit: u32,
        retry_after: u64,
        reset_at: DateTime<Utc>,
    },
}

pub async fn check(
    store: &dyn CounterStore,
    identity: &str,
    limit: u32,
    window_ms: u64,
) -> Result<Admission, CacheError> {
    check_at(store, identity, limit, window_ms, Utc::now().timestamp_millis()).await
}

pub async fn check_at(
    store: &dyn CounterStore,
    identity: &str,
    limit: u32,
    window_ms: u64,
    now_ms: i64,
) -> Result<Admission, CacheError> {
    let window = window_ms as i64;
    let outcome = store.rate_window(identity, now_ms, window, limit).await?;

    if outcome.admitted {
        let remaining = i64::from(limit) - outcome.count - 1;
        Ok(Admission::Granted {
            limit,
            remaining: remaining.max(0) as u32,
            reset_at: from_millis(now_ms + window),
        })
    } else {
        let retry_after_raw = outcome.oldest_ms + window - now_ms;
        let retry_after = {
            let q = retry_after_raw / 1000;
            if retry_after_raw % 1000 > 0 { q + 1 } else { q }
        }
        .max(1);
        Ok(Admission::Denied {
            limit,
            retry_after: retry_after as u64,
            reset_at: from_millis(outcome.oldest_ms + window),
        })
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

pub fn insert_rate_headers(
    headers: &mut HeaderMap,
    limit: u32,
    remaining: u32,
    reset_at: DateTime<Utc>,
) {
    headers.insert(HeaderName::from_static("x-ratelimit-limit"), HeaderValue::from(limit));
    headers.insert(
        HeaderName::from_static("x-ratelimit-remaining"),
        HeaderValue::from(remaining),
    );
    if let Ok(value) = HeaderValue::from_str(&reset_at.to_rfc3339()) {
        headers.insert(HeaderName::from_static("x-ratelimit-reset"), value);
    }
}
