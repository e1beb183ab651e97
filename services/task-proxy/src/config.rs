//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Only `[proxy]` is required; the other sections fall back to defaults
//! that match the upstream task API's documented behavior.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatch::TaskKind;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub weights: UsageWeights,
}

/// HTTP listener and upstream settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_admin_listen_addr")]
    pub admin_listen_addr: SocketAddr,
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Key database location
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Synchronous status polling
#[derive(Debug, Deserialize)]
pub struct PollConfig {
    /// Delay between status queries while a task is running
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    /// Upper bound on cumulative delay for one synchronous query; 0 disables
    #[serde(default = "default_poll_max_wait")]
    pub max_wait_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            max_wait_secs: default_poll_max_wait(),
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_wait(&self) -> Option<Duration> {
        (self.max_wait_secs > 0).then(|| Duration::from_secs(self.max_wait_secs))
    }
}

/// Background pool refresh
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// Seconds between store rescans; 0 disables the background task
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval(),
        }
    }
}

/// Usage weight charged to a key per successful submission
#[derive(Debug, Clone, Deserialize)]
pub struct UsageWeights {
    #[serde(default = "default_text_weight")]
    pub text_to_model: u64,
    #[serde(default = "default_image_weight")]
    pub image_to_model: u64,
}

impl Default for UsageWeights {
    fn default() -> Self {
        Self {
            text_to_model: default_text_weight(),
            image_to_model: default_image_weight(),
        }
    }
}

impl UsageWeights {
    pub fn for_kind(&self, kind: TaskKind) -> u64 {
        match kind {
            TaskKind::TextToModel => self.text_to_model,
            TaskKind::ImageToModel => self.image_to_model,
        }
    }
}

fn default_admin_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_upstream_url() -> String {
    "https://api.tripo3d.ai/v2/openapi".to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_database_path() -> PathBuf {
    PathBuf::from("keys.db")
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_poll_max_wait() -> u64 {
    600
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_text_weight() -> u64 {
    20
}

fn default_image_weight() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// `UPSTREAM_URL` overrides `proxy.upstream_url`.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| common::Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(url) = std::env::var("UPSTREAM_URL") {
            config.proxy.upstream_url = url;
        }
        config.proxy.upstream_url = config.proxy.upstream_url.trim_end_matches('/').to_string();

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.proxy.upstream_url.starts_with("http://")
            && !self.proxy.upstream_url.starts_with("https://")
        {
            return Err(common::Error::invalid(
                "proxy.upstream_url",
                format!(
                    "must start with http:// or https://, got: {}",
                    self.proxy.upstream_url
                ),
            ));
        }
        if self.proxy.timeout_secs == 0 {
            return Err(common::Error::invalid(
                "proxy.timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.proxy.max_connections == 0 {
            return Err(common::Error::invalid(
                "proxy.max_connections",
                "must be greater than 0",
            ));
        }
        if self.proxy.listen_addr == self.proxy.admin_listen_addr {
            return Err(common::Error::invalid(
                "proxy.admin_listen_addr",
                "must differ from proxy.listen_addr",
            ));
        }
        if self.poll.interval_ms == 0 {
            return Err(common::Error::invalid(
                "poll.interval_ms",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("task-proxy.toml")
    }
}
