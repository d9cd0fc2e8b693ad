use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad caller input: empty text, malformed timestamp, missing fields.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    ChatApi(#[from] ChatApiError),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Short machine-readable kind, used in HTTP bodies and status records.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Storage(_) => "storage",
            Error::ChatApi(e) => e.kind.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatApiErrorKind {
    AuthExpired,
    RateLimited,
    Network,
    Unknown,
}

impl ChatApiErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatApiErrorKind::AuthExpired => "auth_expired",
            ChatApiErrorKind::RateLimited => "rate_limited",
            ChatApiErrorKind::Network => "network",
            ChatApiErrorKind::Unknown => "unknown",
        }
    }
}

/// Failure talking to the upstream chat service.
#[derive(Debug, Clone, Error)]
#[error("chat api error ({}): {message}", kind.as_str())]
pub struct ChatApiError {
    pub kind: ChatApiErrorKind,
    pub message: String,
}

impl ChatApiError {
    pub fn new(kind: ChatApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn auth_expired(message: impl Into<String>) -> Self {
        Self::new(ChatApiErrorKind::AuthExpired, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ChatApiErrorKind::Network, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ChatApiErrorKind::Unknown, message)
    }

    /// Maps an upstream HTTP status to an error kind.
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => ChatApiErrorKind::AuthExpired,
            429 => ChatApiErrorKind::RateLimited,
            _ => ChatApiErrorKind::Unknown,
        };
        Self::new(kind, format!("HTTP {}: {}", status, body.trim()))
    }
}
