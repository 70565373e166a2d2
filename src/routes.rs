use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json,
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::{
    error::AppError,
    models::{
        MAX_OPTION_TEXT_LEN, MAX_OPTIONS, MAX_TITLE_LEN, MIN_OPTIONS, MIN_TITLE_LEN, Poll,
        PollSettings, is_valid_poll_id,
    },
    ratelimit::{self, Admission, client_identity, insert_rate_headers},
    state::AppState,
    voting::{cast_vote, load_results},
};

#[derive(Deserialize)]
pub struct CreatePollRequest {
    pub title: Option<String>,
    pub options: Option<Vec<OptionInput>>,
    pub settings: Option<PollSettings>,
}

/// Options arrive either as bare strings or as `{"text": ...}` objects.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum OptionInput {
    Text(String),
    Object { text: String },
}

impl OptionInput {
    fn into_text(self) -> String {
        match self {
            OptionInput::Text(text) | OptionInput::Object { text } => text,
        }
    }
}

#[derive(Deserialize)]
pub struct VoteRequest {
    #[serde(rename = "optionId")]
    pub option_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ListParams {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

pub async fn create_poll_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreatePollRequest>,
) -> Result<Response, AppError> {
    let (Some(title), Some(options)) = (body.title, body.options) else {
        return Err(AppError::Validation(
            "Title and options array are required".to_string(),
        ));
    };

    let title = title.trim().to_string();
    if title.chars().count() < MIN_TITLE_LEN {
        return Err(AppError::Validation(format!(
            "Title must be at least {MIN_TITLE_LEN} characters"
        )));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(AppError::Validation(format!(
            "Title must be less than {MAX_TITLE_LEN} characters"
        )));
    }

    if options.len() < MIN_OPTIONS || options.len() > MAX_OPTIONS {
        return Err(AppError::Validation(format!(
            "Poll must have between {MIN_OPTIONS} and {MAX_OPTIONS} options"
        )));
    }

    let mut texts = Vec::with_capacity(options.len());
    for option in options {
        let text = option.into_text().trim().to_string();
        if text.is_empty() {
            return Err(AppError::Validation("Option text is required".to_string()));
        }
        if text.chars().count() > MAX_OPTION_TEXT_LEN {
            return Err(AppError::Validation(format!(
                "Option text must be less than {MAX_OPTION_TEXT_LEN} characters"
            )));
        }
        texts.push(text);
    }

    let created_by = headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();

    let poll = Poll::new(title, texts, body.settings.unwrap_or_default(), created_by);
    state.db.create_poll(&poll).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "poll": {
                "id": poll.id,
                "title": poll.title,
                "options": poll.options,
                "status": poll.status,
                "createdAt": poll.created_at,
            },
        })),
    )
        .into_response())
}

pub async fn get_poll_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let poll = load_poll(&state, &id).await?;

    Ok(Json(json!({
        "success": true,
        "poll": {
            "id": poll.id,
            "title": poll.title,
            "options": poll.options,
            "status": poll.status,
            "settings": poll.settings,
            "createdAt": poll.created_at,
            "updatedAt": poll.updated_at,
        },
    }))
    .into_response())
}

pub async fn list_polls_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Response, AppError> {
    let page = params.page.unwrap_or(1).max(1);
    let limit = params.limit.unwrap_or(20).max(1);

    let (polls, total) = state.db.list_active(page, limit).await?;
    let pages = (total + i64::from(limit) - 1) / i64::from(limit);

    Ok(Json(json!({
        "success": true,
        "polls": polls,
        "pagination": {
            "page": page,
            "limit": limit,
            "total": total,
            "pages": pages,
        },
    }))
    .into_response())
}

/// Live results computed from the counter cache, not the durable record.
pub async fn results_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let poll = load_poll(&state, &id).await?;
    let (results, total_votes) = load_results(state.cache.as_ref(), &poll).await?;

    Ok(Json(json!({
        "success": true,
        "poll": {
            "id": poll.id,
            "title": poll.title,
            "status": poll.status,
            "createdAt": poll.created_at,
        },
        "results": results,
        "totalVotes": total_votes,
    }))
    .into_response())
}

pub async fn vote_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<VoteRequest>,
) -> Result<Response, AppError> {
    let identity = client_identity(&headers, Some(peer));

    // admission control fails open when the counter store is unreachable
    let admission = match ratelimit::check(
        state.cache.as_ref(),
        &identity,
        state.config.rate_limit_max_requests,
        state.config.rate_limit_window_ms,
    )
    .await
    {
        Ok(Admission::Denied {
            limit,
            retry_after,
            reset_at,
        }) => {
            return Err(AppError::RateLimited {
                limit,
                retry_after,
                reset_at,
            });
        }
        Ok(granted @ Admission::Granted { .. }) => Some(granted),
        Err(e) => {
            warn!("Rate limiter unavailable, admitting request: {e}");
            None
        }
    };

    let Some(option_id) = body.option_id else {
        return Err(AppError::Validation("Option ID is required".to_string()));
    };

    let receipt = cast_vote(&state, &id, &option_id, &identity).await?;

    let mut response = Json(json!({
        "success": true,
        "message": "Vote recorded successfully",
        "votedFor": receipt.voted_for,
        "results": receipt.results,
        "totalVotes": receipt.total_votes,
    }))
    .into_response();

    if let Some(Admission::Granted {
        limit,
        remaining,
        reset_at,
    }) = admission
    {
        insert_rate_headers(response.headers_mut(), limit, remaining, reset_at);
    }

    Ok(response)
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.cache.ping().await {
        Ok(()) => {
            let stats = state.sync_stats.snapshot();
            let sync_service = if stats.last_run.is_some() { "active" } else { "pending" };

            Json(json!({
                "status": "ok",
                "timestamp": Utc::now(),
                "services": {
                    "cache": "connected",
                    "database": "connected",
                    "websocket": "active",
                    "sync": sync_service,
                },
                "sync": stats,
            }))
            .into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "error",
                "message": e.to_string(),
            })),
        )
            .into_response(),
    }
}

async fn load_poll(state: &AppState, id: &str) -> Result<Poll, AppError> {
    if !is_valid_poll_id(id) {
        return Err(AppError::Validation("Invalid poll ID format".to_string()));
    }
    state.db.get_poll(id).await?.ok_or(AppError::NotFound)
}
