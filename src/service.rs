use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::chat::ChatClient;
use crate::db::{MessageQuery, MessageStore};
use crate::error::{ChatApiError, ChatApiErrorKind, Error, Result};
use crate::models::{Message, Origin, PollMode, Status};
use crate::sync::PollHandle;

/// Read/write façade used by the request layer.
///
/// Every operation except [`QueryService::status`] counts as activity and keeps
/// the poll engine in active mode.
#[derive(Clone)]
pub struct QueryService {
    store: MessageStore,
    client: Arc<dyn ChatClient>,
    poll: PollHandle,
    space_id: String,
    send_timeout: Duration,
    status_counts_as_activity: bool,
}

impl QueryService {
    pub fn new(
        store: MessageStore,
        client: Arc<dyn ChatClient>,
        poll: PollHandle,
        space_id: String,
    ) -> Self {
        Self {
            store,
            client,
            poll,
            space_id,
            send_timeout: Duration::from_secs(15),
            status_counts_as_activity: false,
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_status_counts_as_activity(mut self, enabled: bool) -> Self {
        self.status_counts_as_activity = enabled;
        self
    }

    /// Counts a call as activity without doing anything else, for requests
    /// rejected before they reach an operation.
    pub fn record_activity(&self) {
        self.poll.signal();
    }

    pub async fn get_messages(&self, query: &MessageQuery) -> Result<Vec<Message>> {
        self.poll.signal();
        self.store.query(query).await
    }

    /// Unread messages. Does not move the read marker.
    pub async fn get_unread(&self) -> Result<Vec<Message>> {
        self.poll.signal();
        self.store.unread().await
    }

    /// Exact unread total; [`QueryService::get_unread`] caps its list.
    pub async fn unread_count(&self) -> Result<i64> {
        self.store.unread_count().await
    }

    pub async fn mark_read(&self, at: Option<DateTime<Utc>>) -> Result<DateTime<Utc>> {
        self.poll.signal();
        self.store.mark_read(at).await
    }

    /// Sends `text` upstream and records the result locally so it shows up in
    /// queries before the next poll.
    pub async fn send(&self, text: &str) -> Result<Message> {
        self.poll.signal();
        if text.trim().is_empty() {
            return Err(Error::validation("text must not be empty"));
        }

        let sent = tokio::time::timeout(self.send_timeout, self.client.send_message(text))
            .await
            .map_err(|_| ChatApiError::network("send_message timed out"))?
            .inspect_err(|e| warn!(error = %e, "send failed"))?;

        if self.store.insert_if_new(&sent, Origin::Sent).await? {
            info!(id = %sent.id, "sent message recorded");
        }
        self.store
            .get_message(&sent.id)
            .await?
            .ok_or_else(|| Error::Storage(sqlx::Error::RowNotFound))
    }

    pub fn boost(&self) -> PollMode {
        self.poll.signal();
        self.poll.mode()
    }

    pub async fn status(&self) -> Result<Status> {
        if self.status_counts_as_activity {
            self.poll.signal();
        }
        let poll = self.poll.snapshot();
        let persisted = self.store.load_poll_state().await?;
        let last_error = self.poll.last_error();
        let auth_failing = last_error
            .as_ref()
            .is_some_and(|e| e.kind == ChatApiErrorKind::AuthExpired.as_str());

        Ok(Status {
            authenticated: !auth_failing && self.client.is_authenticated().await,
            space_id: self.space_id.clone(),
            poll_mode: poll.mode,
            last_poll_at: poll.last_poll_at.or(persisted.last_poll_at),
            last_activity_at: poll.last_activity_at,
            message_count: self.store.message_count().await?,
            unread_count: self.store.unread_count().await?,
            read_marker: self.store.read_marker().await?,
            last_error,
        })
    }
}
