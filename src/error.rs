use axum::{
    Json,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::{cache::CacheError, ratelimit::insert_rate_headers};

/// One variant per terminal state of the vote-cast pipeline, so every branch
/// maps to a single constructible value.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("Poll not found")]
    NotFound,

    #[error("This poll has been closed or expired")]
    PollInactive,

    #[error("Option '{0}' does not exist in this poll")]
    InvalidOption(String),

    #[error("You have already voted on this poll")]
    DuplicateVote,

    #[error("Rate limit exceeded, retry in {retry_after} seconds")]
    RateLimited {
        limit: u32,
        retry_after: u64,
        reset_at: DateTime<Utc>,
    },

    // an increment that fails after the voter record is in cannot be
    // retried by the client, so it must surface as a server error
    #[error("Failed to record vote")]
    Cache(#[from] CacheError),

    #[error("Internal server error")]
    Database(#[from] sqlx::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::PollInactive | AppError::InvalidOption(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::DuplicateVote => StatusCode::CONFLICT,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Cache(_) | AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "Invalid request",
            AppError::NotFound => "Poll not found",
            AppError::PollInactive => "Poll is not active",
            AppError::InvalidOption(_) => "Invalid option",
            AppError::DuplicateVote => "Already voted",
            AppError::RateLimited { .. } => "Too many requests",
            AppError::Cache(_) => "Failed to record vote",
            AppError::Database(_) => "Internal server error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if matches!(self, AppError::Cache(_) | AppError::Database(_)) {
            error!("request failed: {self:?}");
        }

        let status = self.status();
        let mut body = json!({
            "error": self.label(),
            "message": self.to_string(),
        });

        if let AppError::RateLimited { limit, retry_after, reset_at } = &self {
            body["retryAfter"] = json!(retry_after);
            body["limit"] = json!(limit);
            body["remaining"] = json!(0);
            body["resetAt"] = json!(reset_at.to_rfc3339());
        }

        let mut response = (status, Json(body)).into_response();

        if let AppError::RateLimited { limit, retry_after, reset_at } = self {
            insert_rate_headers(response.headers_mut(), limit, 0, reset_at);
            response
                .headers_mut()
                .insert("retry-after", HeaderValue::from(retry_after));
        }

        response
    }
}
