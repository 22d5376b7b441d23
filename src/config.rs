use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_bind")]
    pub bind: String,
    /// Interval between liveness ping sweeps. A connection that misses
    /// one full interval without answering is terminated.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Connection attempts allowed per source address per window.
    #[serde(default = "default_rate_limit_max_attempts")]
    pub rate_limit_max_attempts: u32,
    #[serde(default = "default_rate_limit_window_ms")]
    pub rate_limit_window_ms: u64,
    /// Bounded outbound queue per connection; frames to a full queue
    /// for a slow consumer are dropped rather than buffered unbounded.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
            ping_interval_ms: default_ping_interval_ms(),
            rate_limit_max_attempts: default_rate_limit_max_attempts(),
            rate_limit_window_ms: default_rate_limit_window_ms(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Device record store path. `.json` selects the JSON backend;
    /// `.db`/`.sqlite`/`.sqlite3` selects SQLite (requires the
    /// `sqlite-store` feature).
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            toml::from_str::<Config>(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_cli_overrides(&mut self, bind: Option<&str>, store_path: Option<&Path>) {
        if let Some(bind) = bind {
            self.server.bind = bind.to_owned();
        }
        if let Some(path) = store_path {
            self.store.path = path.to_owned();
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("MIZAN_DISPLAY_BIND") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.server.bind = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("MIZAN_DISPLAY_PING_INTERVAL_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.server.ping_interval_ms = n.max(100);
            }
        }
        if let Ok(v) = env::var("MIZAN_DISPLAY_RATE_LIMIT_MAX_ATTEMPTS") {
            if let Ok(n) = v.parse::<u32>() {
                self.server.rate_limit_max_attempts = n.max(1);
            }
        }
        if let Ok(v) = env::var("MIZAN_DISPLAY_RATE_LIMIT_WINDOW_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.server.rate_limit_window_ms = n.max(1_000);
            }
        }
        if let Ok(v) = env::var("MIZAN_DISPLAY_OUTBOUND_QUEUE_CAPACITY") {
            if let Ok(n) = v.parse::<usize>() {
                self.server.outbound_queue_capacity = n.max(8);
            }
        }
        if let Ok(v) = env::var("MIZAN_DISPLAY_STORE_PATH") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.store.path = PathBuf::from(trimmed);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.server.bind.trim().is_empty() {
            anyhow::bail!("server.bind must not be empty");
        }
        if self.server.ping_interval_ms == 0 {
            anyhow::bail!("server.ping_interval_ms must be > 0");
        }
        if self.server.rate_limit_max_attempts == 0 {
            anyhow::bail!("server.rate_limit_max_attempts must be > 0");
        }
        if self.server.rate_limit_window_ms == 0 {
            anyhow::bail!("server.rate_limit_window_ms must be > 0");
        }
        if self.server.outbound_queue_capacity == 0 {
            anyhow::bail!("server.outbound_queue_capacity must be > 0");
        }
        if self.store.path.as_os_str().is_empty() {
            anyhow::bail!("store.path must not be empty");
        }
        Ok(())
    }
}

fn default_server_bind() -> String {
    "127.0.0.1:18793".to_owned()
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

fn default_rate_limit_max_attempts() -> u32 {
    10
}

fn default_rate_limit_window_ms() -> u64 {
    60_000
}

fn default_outbound_queue_capacity() -> usize {
    64
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".mizan-display/devices.json")
}
