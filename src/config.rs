use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Exponential reconnect schedule: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Settings of the push connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub token: Option<String>,
    pub accept_invalid_certs: bool,
    pub backoff: Backoff,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Capacity of the broadcast fan-out; slow subscribers beyond it observe a lag.
    pub feed_capacity: usize,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            accept_invalid_certs: false,
            backoff: Backoff::default(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            feed_capacity: 256,
        }
    }
}

/// Settings of the REST collaborator.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub accept_invalid_certs: bool,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    pub poll_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub interval: Duration,
    /// How long to keep showing "starting" after a scan was launched but not yet listed.
    pub start_grace: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            start_grace: Duration::from_secs(45),
        }
    }
}

/// Top-level configuration. Every field has a default so partial JSON files work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub api_url: String,
    pub ws_url: String,
    pub token: Option<String>,
    pub accept_invalid_certs: bool,
    pub request_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub session_poll_interval_ms: u64,
    pub running_poll_interval_ms: u64,
    pub start_grace_ms: u64,
    pub push_buffer: usize,
    pub cache_dir: PathBuf,
    pub cache_ttl_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8000/api".to_string(),
            ws_url: "ws://127.0.0.1:8000/ws".to_string(),
            token: None,
            accept_invalid_certs: false,
            request_timeout_ms: 15_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 10_000,
            session_poll_interval_ms: 3_000,
            running_poll_interval_ms: 15_000,
            start_grace_ms: 45_000,
            push_buffer: 256,
            cache_dir: PathBuf::from(".scanwatch-cache"),
            cache_ttl_secs: 300,
        }
    }
}

impl WatchConfig {
    /// Load from `path`, else `$SCANWATCH_CONFIG`, else defaults; then apply env overrides.
    /// A missing file is not an error, a malformed one is.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os("SCANWATCH_CONFIG").map(PathBuf::from));

        let file_cfg: Option<WatchConfig> = match path {
            Some(p) => fs::read_to_string(&p)
                .ok()
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .with_context(|| format!("failed to parse config file {}", p.display()))?,
            None => None,
        };

        let mut cfg = file_cfg.unwrap_or_default();
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var("SCANWATCH_API_URL") {
            self.api_url = v;
        }
        if let Ok(v) = env::var("SCANWATCH_WS_URL") {
            self.ws_url = v;
        }
        if let Ok(v) = env::var("SCANWATCH_TOKEN") {
            self.token = Some(v).filter(|t| !t.is_empty());
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.reconnect_base_ms),
            Duration::from_millis(self.reconnect_max_ms),
        )
    }

    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            url: self.ws_url.clone(),
            token: self.token.clone(),
            accept_invalid_certs: self.accept_invalid_certs,
            backoff: self.backoff(),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            feed_capacity: self.push_buffer.max(1),
        }
    }

    pub fn api(&self) -> ApiConfig {
        ApiConfig {
            base_url: self.api_url.clone(),
            token: self.token.clone(),
            accept_invalid_certs: self.accept_invalid_certs,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn tracker(&self) -> TrackerConfig {
        TrackerConfig {
            poll_interval: Duration::from_millis(self.session_poll_interval_ms),
        }
    }

    pub fn poller(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(self.running_poll_interval_ms),
            start_grace: Duration::from_millis(self.start_grace_ms),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}
