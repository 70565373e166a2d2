//! Durable poll records. Request handlers read poll metadata here and the
//! reconciler writes vote fields here; nothing else touches the vote columns,
//! so there is a single writer per durable field.

use chrono::{DateTime, Utc};
use sqlx::{
    Row,
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
};
use std::str::FromStr;

use crate::models::{Poll, PollOption, PollSettings, PollStatus};

pub struct Database {
    pool: SqlitePool,
}

#[derive(Debug, serde::Serialize)]
pub struct PollSummary {
    pub id: String,
    pub title: String,
    #[serde(rename = "optionCount")]
    pub option_count: i64,
    pub status: PollStatus,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl Database {
    pub async fn connect(db_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);

        // a pooled in-memory sqlite gets a fresh database per connection
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS polls (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                created_by TEXT NOT NULL DEFAULT 'anonymous',
                allow_multiple_votes BOOLEAN NOT NULL DEFAULT FALSE,
                require_auth BOOLEAN NOT NULL DEFAULT FALSE,
                expires_at TEXT,
                total_votes INTEGER NOT NULL DEFAULT 0,
                last_synced_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS poll_options (
                id TEXT NOT NULL,
                poll_id TEXT NOT NULL,
                text TEXT NOT NULL,
                votes INTEGER NOT NULL DEFAULT 0,
                position INTEGER NOT NULL,
                PRIMARY KEY (poll_id, id),
                FOREIGN KEY (poll_id) REFERENCES polls(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn create_poll(&self, poll: &Poll) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO polls (id, title, status, created_by, allow_multiple_votes,
                               require_auth, expires_at, total_votes, last_synced_at,
                               created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, NULL, ?, ?)
            "#,
        )
        .bind(&poll.id)
        .bind(&poll.title)
        .bind(poll.status.as_str())
        .bind(&poll.created_by)
        .bind(poll.settings.allow_multiple_votes)
        .bind(poll.settings.require_auth)
        .bind(poll.settings.expires_at.map(|dt| dt.to_rfc3339()))
        .bind(poll.created_at.to_rfc3339())
        .bind(poll.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for (position, option) in poll.options.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO poll_options (id, poll_id, text, votes, position)
                VALUES (?, ?, ?, 0, ?)
                "#,
            )
            .bind(&option.id)
            .bind(&poll.id)
            .bind(&option.text)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await
    }

    pub async fn get_poll(&self, poll_id: &str) -> Result<Option<Poll>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT id, title, status, created_by, allow_multiple_votes, require_auth,
                   expires_at, total_votes, last_synced_at, created_at, updated_at
            FROM polls
            WHERE id = ?
            "#,
        )
        .bind(poll_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let options = self.get_options(poll_id).await?;
        Ok(Some(poll_from_row(&row, options)?))
    }

    async fn get_options(&self, poll_id: &str) -> Result<Vec<PollOption>, sqlx::Error> {
        let options = sqlx::query(
            r#"
            SELECT id, text, votes
            FROM poll_options
            WHERE poll_id = ?
            ORDER BY position
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| PollOption {
            id: row.get("id"),
            text: row.get("text"),
            votes: row.get("votes"),
        })
        .collect();

        Ok(options)
    }

    /// Every poll with active status, with options, for the reconciler.
    /// Expiry is deliberately not filtered here: an expired poll keeps its
    /// active status until closed, and its final counts still need to land
    /// in durable storage.
    pub async fn find_active(&self) -> Result<Vec<Poll>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, status, created_by, allow_multiple_votes, require_auth,
                   expires_at, total_votes, last_synced_at, created_at, updated_at
            FROM polls
            WHERE status = 'active'
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut polls = Vec::with_capacity(rows.len());
        for row in rows {
            let poll_id: String = row.get("id");
            let options = self.get_options(&poll_id).await?;
            polls.push(poll_from_row(&row, options)?);
        }

        Ok(polls)
    }

    pub async fn list_active(
        &self,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<PollSummary>, i64), sqlx::Error> {
        let page = page.max(1);
        let offset = i64::from(page - 1) * i64::from(limit);

        let now = Utc::now().to_rfc3339();
        let rows = sqlx::query(
            r#"
            SELECT id, title, status, created_at,
                   (SELECT COUNT(*) FROM poll_options o WHERE o.poll_id = polls.id) AS option_count
            FROM polls
            WHERE status = 'active' AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY created_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(&now)
        .bind(i64::from(limit))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            summaries.push(PollSummary {
                id: row.get("id"),
                title: row.get("title"),
                option_count: row.get("option_count"),
                status: parse_status(row.get("status"))?,
                created_at: parse_ts(row.get("created_at"))?,
            });
        }

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM polls WHERE status = 'active' AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        Ok((summaries, total))
    }

    /// Overwrites the durable counts with a cache snapshot, atomically with
    /// the matching `total_votes` so the sum invariant holds at every
    /// observation of the durable record.
    pub async fn save_counts(
        &self,
        poll_id: &str,
        counts: &[(String, i64)],
        total_votes: i64,
        synced_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        for (option_id, votes) in counts {
            sqlx::query(
                r#"
                UPDATE poll_options
                SET votes = ?
                WHERE poll_id = ? AND id = ?
                "#,
            )
            .bind(votes)
            .bind(poll_id)
            .bind(option_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE polls
            SET total_votes = ?, last_synced_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(total_votes)
        .bind(synced_at.to_rfc3339())
        .bind(synced_at.to_rfc3339())
        .bind(poll_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await
    }
}

fn poll_from_row(row: &sqlx::sqlite::SqliteRow, options: Vec<PollOption>) -> Result<Poll, sqlx::Error> {
    let expires_at: Option<String> = row.get("expires_at");
    let last_synced_at: Option<String> = row.get("last_synced_at");

    Ok(Poll {
        id: row.get("id"),
        title: row.get("title"),
        options,
        status: parse_status(row.get("status"))?,
        settings: PollSettings {
            allow_multiple_votes: row.get("allow_multiple_votes"),
            require_auth: row.get("require_auth"),
            expires_at: expires_at.as_deref().map(parse_ts).transpose()?,
        },
        created_by: row.get("created_by"),
        total_votes: row.get("total_votes"),
        last_synced_at: last_synced_at.as_deref().map(parse_ts).transpose()?,
        created_at: parse_ts(row.get("created_at"))?,
        updated_at: parse_ts(row.get("updated_at"))?,
    })
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn parse_status(raw: String) -> Result<PollStatus, sqlx::Error> {
    PollStatus::parse(&raw).ok_or_else(|| {
        sqlx::Error::Decode(format!("unknown poll status: {raw}").into())
    })
}
