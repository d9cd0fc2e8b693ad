use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "settings.toml";
const MAX_ACTIVE_INTERVAL_SECS: u64 = 60;
const MAX_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub space_id: String,
    pub database_url: String,
    pub listen_port: u16,
    pub credentials_path: String,
    /// Whether `status` calls keep polling active. Off so health checks don't pin ACTIVE.
    pub status_counts_as_activity: bool,
    pub poll: PollConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub active_interval_secs: u64,
    /// 0 disables polling while idle.
    pub idle_interval_secs: u64,
    pub decay_timeout_secs: u64,
    pub decay_check_secs: u64,
    pub page_size: u32,
    pub read_timeout_secs: u64,
    pub send_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            space_id: String::new(),
            database_url: "sqlite://chat_sidecar.db?mode=rwc".to_string(),
            listen_port: 3100,
            credentials_path: "credentials.json".to_string(),
            status_counts_as_activity: false,
            poll: PollConfig::default(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            active_interval_secs: 30,
            idle_interval_secs: 4 * 60 * 60,
            decay_timeout_secs: 10 * 60,
            decay_check_secs: 15,
            page_size: 100,
            read_timeout_secs: 10,
            send_timeout_secs: 15,
        }
    }
}

impl PollConfig {
    pub fn active_interval(&self) -> Duration {
        Duration::from_secs(self.active_interval_secs.clamp(1, MAX_ACTIVE_INTERVAL_SECS))
    }

    pub fn idle_interval(&self) -> Option<Duration> {
        match self.idle_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn decay_timeout(&self) -> Duration {
        Duration::from_secs(self.decay_timeout_secs)
    }

    pub fn decay_check(&self) -> Duration {
        Duration::from_secs(self.decay_check_secs.max(1))
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

impl Config {
    /// Loads `settings.toml` (or `$SIDECAR_CONFIG`), then applies environment overrides.
    /// A missing file falls back to defaults; a malformed one is an error.
    pub fn load() -> anyhow::Result<Self> {
        use anyhow::Context;
        use std::fs;

        let path =
            std::env::var("SIDECAR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = match fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file {}", path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        use anyhow::Context;

        if let Some(space) = lookup("GOOGLE_CHAT_SPACE_ID") {
            self.space_id = space;
        }
        if let Some(path) = lookup("DB_PATH") {
            self.database_url = sqlite_url(&path);
        }
        if let Some(path) = lookup("GOOGLE_CREDENTIALS_PATH") {
            self.credentials_path = path;
        }
        if let Some(port) = lookup("SIDECAR_PORT") {
            self.listen_port = port.parse().context("SIDECAR_PORT must be a port number")?;
        }
        if let Some(secs) = lookup("POLL_ACTIVE_INTERVAL") {
            self.poll.active_interval_secs = secs
                .parse()
                .context("POLL_ACTIVE_INTERVAL must be a number of seconds")?;
        }
        if let Some(secs) = lookup("POLL_IDLE_INTERVAL") {
            self.poll.idle_interval_secs = secs
                .parse()
                .context("POLL_IDLE_INTERVAL must be a number of seconds")?;
        }
        if let Some(secs) = lookup("POLL_DECAY_TIMEOUT") {
            self.poll.decay_timeout_secs = secs
                .parse()
                .context("POLL_DECAY_TIMEOUT must be a number of seconds")?;
        }
        Ok(())
    }
}

/// Accepts `sqlite:` URLs as-is and turns plain paths into a read-write-create URL.
fn sqlite_url(input: &str) -> String {
    if input.starts_with("sqlite:") {
        input.to_string()
    } else {
        format!("sqlite://{}?mode=rwc", input)
    }
}
