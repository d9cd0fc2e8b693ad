use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message as recorded in the local store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_name: String,
    pub sender_email: Option<String>,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Local ingestion time, diagnostic only.
    pub fetched_at: DateTime<Utc>,
}

/// A message as returned by the upstream chat service, before ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub id: String,
    pub sender_name: String,
    pub sender_email: Option<String>,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// How a message reached the store. Only polled messages advance the fetch lower bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Poll,
    Sent,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Poll => "poll",
            Origin::Sent => "sent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub id: String,
    pub display_name: Option<String>,
    pub space_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollMode {
    #[default]
    Idle,
    Active,
}

impl PollMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollMode::Idle => "idle",
            PollMode::Active => "active",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(PollMode::Idle),
            "active" => Some(PollMode::Active),
            _ => None,
        }
    }
}

impl std::fmt::Display for PollMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted poll bookkeeping. A single row in the `poll_state` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollState {
    pub mode: PollMode,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// Most recent background failure, kept for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollFailure {
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub authenticated: bool,
    pub space_id: String,
    pub poll_mode: PollMode,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub message_count: i64,
    pub unread_count: i64,
    pub read_marker: Option<DateTime<Utc>>,
    pub last_error: Option<PollFailure>,
}
