//! Adaptive polling.
//!
//! ```text
//!   IDLE  --(query or boost)-->  ACTIVE
//!   (idle interval)              (active interval)
//!    ^                              |
//!    +----(decay timeout, no activity)
//! ```
//!
//! [`PollHandle`] is the single owned poll-state object shared by the engine
//! and the query façade. [`PollEngine`] is the background loop; it is the only
//! writer of polled messages and of the persisted poll-state record.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::chat::ChatClient;
use crate::config::PollConfig;
use crate::db::{self, MessageStore};
use crate::error::{ChatApiError, Error, Result};
use crate::models::{Origin, PollFailure, PollMode, PollState};

/// Timing parameters for the engine.
#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    pub active_interval: Duration,
    /// `None` never polls while idle.
    pub idle_interval: Option<Duration>,
    pub decay_timeout: Duration,
    /// How often the loop re-checks for decay, independent of the poll cadence.
    pub decay_check: Duration,
    pub page_size: u32,
    pub fetch_timeout: Duration,
}

impl From<&PollConfig> for Cadence {
    fn from(config: &PollConfig) -> Self {
        Self {
            active_interval: config.active_interval(),
            idle_interval: config.idle_interval(),
            decay_timeout: config.decay_timeout(),
            decay_check: config.decay_check(),
            page_size: config.page_size(),
            fetch_timeout: config.read_timeout(),
        }
    }
}

impl Cadence {
    fn interval(&self, mode: PollMode) -> Option<Duration> {
        match mode {
            PollMode::Active => Some(self.active_interval),
            PollMode::Idle => self.idle_interval,
        }
    }
}

#[derive(Debug)]
struct PollInner {
    mode: PollMode,
    last_activity: Option<Instant>,
    last_activity_at: Option<DateTime<Utc>>,
    last_poll_at: Option<DateTime<Utc>>,
    last_error: Option<PollFailure>,
}

/// Shared poll state. Cheap to clone; all clones see the same state.
#[derive(Debug, Clone)]
pub struct PollHandle {
    inner: Arc<Mutex<PollInner>>,
    wake: Arc<Notify>,
}

impl PollHandle {
    /// Builds the handle from persisted state. Always starts IDLE; timestamps carry over.
    pub fn restore(persisted: &PollState) -> Self {
        if persisted.mode == PollMode::Active {
            info!("previous run ended while active, resuming idle");
        }
        Self {
            inner: Arc::new(Mutex::new(PollInner {
                mode: PollMode::Idle,
                last_activity: None,
                last_activity_at: persisted.last_activity_at,
                last_poll_at: persisted.last_poll_at,
                last_error: None,
            })),
            wake: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PollInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records caller activity and forces ACTIVE mode. Wakes the engine so a
    /// switch out of IDLE takes effect without waiting out the idle interval.
    pub fn signal(&self) {
        {
            let mut inner = self.lock();
            inner.last_activity = Some(Instant::now());
            inner.last_activity_at = Some(db::now());
            if inner.mode != PollMode::Active {
                info!("polling boosted to active");
                inner.mode = PollMode::Active;
            }
        }
        self.wake.notify_one();
    }

    pub fn mode(&self) -> PollMode {
        self.lock().mode
    }

    pub fn last_error(&self) -> Option<PollFailure> {
        self.lock().last_error.clone()
    }

    pub fn snapshot(&self) -> PollState {
        let inner = self.lock();
        PollState {
            mode: inner.mode,
            last_poll_at: inner.last_poll_at,
            last_activity_at: inner.last_activity_at,
        }
    }

    /// ACTIVE -> IDLE once `timeout` has passed without activity. Returns whether it fired.
    fn decay(&self, now: Instant, timeout: Duration) -> bool {
        let mut inner = self.lock();
        if inner.mode != PollMode::Active {
            return false;
        }
        let idle_for = inner
            .last_activity
            .map(|t| now.saturating_duration_since(t));
        match idle_for {
            Some(elapsed) if elapsed <= timeout => false,
            _ => {
                info!(
                    idle_secs = idle_for.map(|d| d.as_secs()),
                    "no activity, decaying to idle"
                );
                inner.mode = PollMode::Idle;
                true
            }
        }
    }

    fn record_success(&self, at: DateTime<Utc>) {
        let mut inner = self.lock();
        inner.last_poll_at = Some(at);
        if let Some(prev) = inner.last_error.take() {
            info!(
                failures = prev.consecutive_failures,
                "poll cycle recovered"
            );
        }
    }

    fn record_failure(&self, kind: &str, message: String) {
        let mut inner = self.lock();
        let consecutive_failures = inner
            .last_error
            .as_ref()
            .map_or(1, |prev| prev.consecutive_failures + 1);
        inner.last_error = Some(PollFailure {
            kind: kind.to_string(),
            message,
            at: db::now(),
            consecutive_failures,
        });
    }
}

/// Background loop that fetches from the chat service into the store.
#[derive(Clone)]
pub struct PollEngine {
    store: MessageStore,
    client: Arc<dyn ChatClient>,
    handle: PollHandle,
    cadence: Cadence,
}

impl PollEngine {
    pub fn new(
        store: MessageStore,
        client: Arc<dyn ChatClient>,
        handle: PollHandle,
        cadence: Cadence,
    ) -> Self {
        Self {
            store,
            client,
            handle,
            cadence,
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Runs until `shutdown` flips to true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            mode = %self.handle.mode(),
            active_secs = self.cadence.active_interval.as_secs_f64(),
            idle_secs = self.cadence.idle_interval.map(|d| d.as_secs_f64()),
            decay_secs = self.cadence.decay_timeout.as_secs_f64(),
            "poll engine started"
        );

        let mut last_cycle: Option<Instant> = None;
        let mut persisted: Option<PollState> = None;

        while !*shutdown.borrow() {
            let now = Instant::now();
            self.handle.decay(now, self.cadence.decay_timeout);
            self.persist_mode(&mut persisted).await;

            let due = match (last_cycle, self.cadence.interval(self.handle.mode())) {
                (_, None) => None,
                (None, Some(_)) => Some(now),
                (Some(last), Some(interval)) => Some(last + interval),
            };

            if due.is_some_and(|d| d <= now) {
                last_cycle = Some(now);
                self.run_cycle().await;
                continue;
            }

            let wake_at = match due {
                Some(d) => d.min(now + self.cadence.decay_check),
                None => now + self.cadence.decay_check,
            };
            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = self.handle.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.persist_mode(&mut persisted).await;
        info!("poll engine stopped");
    }

    /// Runs one cycle on its own task so a panic costs only this cycle.
    async fn run_cycle(&self) {
        let engine = self.clone();
        match tokio::spawn(async move { engine.poll_cycle().await }).await {
            Ok(Ok((inserted, at))) => {
                if inserted > 0 {
                    info!(inserted, "fetched new messages");
                } else {
                    debug!("poll cycle found nothing new");
                }
                self.handle.record_success(at);
            }
            Ok(Err(e)) => {
                warn!(error = %e, kind = e.kind(), "poll cycle failed");
                self.handle.record_failure(e.kind(), e.to_string());
            }
            Err(e) => {
                error!(error = %e, "poll cycle aborted");
                self.handle.record_failure("internal", e.to_string());
            }
        }
    }

    /// One fetch-and-ingest pass. Returns the number of new rows and the poll time.
    pub async fn poll_cycle(&self) -> Result<(usize, DateTime<Utc>)> {
        let since = self.store.latest_polled_at().await?.unwrap_or_default();
        let fetched = tokio::time::timeout(
            self.cadence.fetch_timeout,
            self.client.list_messages(since, self.cadence.page_size),
        )
        .await
        .map_err(|_| ChatApiError::network("list_messages timed out"))??;

        let mut inserted = 0;
        for msg in &fetched {
            match self.store.insert_if_new(msg, Origin::Poll).await {
                Ok(true) => inserted += 1,
                Ok(false) => {}
                Err(Error::Validation(reason)) => {
                    warn!(id = %msg.id, %reason, "skipping malformed message");
                }
                Err(e) => return Err(e),
            }
        }

        let at = db::now();
        self.store.record_poll(at).await?;
        Ok((inserted, at))
    }

    async fn persist_mode(&self, persisted: &mut Option<PollState>) {
        let current = self.handle.snapshot();
        let unchanged = persisted.as_ref().is_some_and(|p| {
            p.mode == current.mode && p.last_activity_at == current.last_activity_at
        });
        if unchanged {
            return;
        }
        match self
            .store
            .save_poll_mode(current.mode, current.last_activity_at)
            .await
        {
            Ok(()) => *persisted = Some(current),
            Err(e) => warn!(error = %e, "failed to persist poll state"),
        }
    }
}
