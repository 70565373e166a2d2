use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MIN_OPTIONS: usize = 2;
pub const MAX_OPTIONS: usize = 10;
pub const MIN_TITLE_LEN: usize = 5;
pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_OPTION_TEXT_LEN: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poll {
    pub id: String,
    pub title: String,
    pub options: Vec<PollOption>,
    pub status: PollStatus,
    pub settings: PollSettings,
    #[serde(rename = "createdBy")]
    pub created_by: String,
    /// Authoritative only after a reconciliation run.
    #[serde(rename = "totalVotes")]
    pub total_votes: i64,
    #[serde(rename = "lastSyncedAt")]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollOption {
    /// Single letter, stable per poll, assigned at creation.
    pub id: String,
    pub text: String,
    pub votes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollStatus {
    Active,
    Closed,
    Draft,
}

impl PollStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollStatus::Active => "active",
            PollStatus::Closed => "closed",
            PollStatus::Draft => "draft",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(PollStatus::Active),
            "closed" => Some(PollStatus::Closed),
            "draft" => Some(PollStatus::Draft),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollSettings {
    pub allow_multiple_votes: bool,
    pub require_auth: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Poll {
    pub fn new(
        title: String,
        options: Vec<String>,
        settings: PollSettings,
        created_by: String,
    ) -> Self {
        let now = Utc::now();

        let options = options
            .into_iter()
            .enumerate()
            .map(|(index, text)| PollOption {
                id: char::from(b'A' + index as u8).to_string(),
                text,
                votes: 0,
            })
            .collect();

        Self {
            id: new_poll_id(),
            title,
            options,
            status: PollStatus::Active,
            settings,
            created_by,
            total_votes: 0,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        if self.status != PollStatus::Active {
            return false;
        }

        match self.settings.expires_at {
            Some(expires_at) => expires_at > Utc::now(),
            None => true,
        }
    }

    pub fn option_ids(&self) -> Vec<String> {
        self.options.iter().map(|opt| opt.id.clone()).collect()
    }

    pub fn has_option(&self, option_id: &str) -> bool {
        self.options.iter().any(|opt| opt.id == option_id)
    }
}

/// 24 hex characters, matching the durable id format accepted on the wire.
pub fn new_poll_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(24);
    id
}

pub fn is_valid_poll_id(id: &str) -> bool {
    id.len() == 24 && id.bytes().all(|b| b.is_ascii_hexdigit())
}
