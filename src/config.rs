//! Engine configuration
//!
//! Defaults, optionally overlaid by a TOML file, then by `FUNDRAISING_*`
//! environment variables (call `dotenv()` first to pick up a `.env`).

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::bootstrap::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fundraising controller the other contracts are resolved from
    pub controller: String,
    /// Network name used for the metadata fallback table (`main`, `rinkeby`, ...)
    pub network: String,
    pub retry: RetryPolicy,
    /// SQLite snapshot database; snapshots stay in memory when unset
    pub snapshot_db: Option<PathBuf>,
    pub snapshot_key: String,
    /// Capacity of the state-change broadcast channel
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            controller: String::new(),
            network: "main".to_string(),
            retry: RetryPolicy::default(),
            snapshot_db: None,
            snapshot_key: "fundraising".to_string(),
            channel_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        Ok(config)
    }

    /// Defaults overlaid with `FUNDRAISING_*` variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("FUNDRAISING_CONTROLLER") {
            self.controller = v;
        }
        if let Some(v) = lookup("FUNDRAISING_NETWORK") {
            self.network = v;
        }
        if let Some(v) = lookup("FUNDRAISING_RETRY_INITIAL_MS") {
            self.retry.initial_delay_ms = v.parse().unwrap_or(self.retry.initial_delay_ms);
        }
        if let Some(v) = lookup("FUNDRAISING_RETRY_FACTOR") {
            self.retry.factor = v.parse().unwrap_or(self.retry.factor);
        }
        if let Some(v) = lookup("FUNDRAISING_RETRY_MAX_MS") {
            self.retry.max_delay_ms = v.parse().ok().or(self.retry.max_delay_ms);
        }
        if let Some(v) = lookup("FUNDRAISING_SNAPSHOT_DB") {
            self.snapshot_db = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FUNDRAISING_SNAPSHOT_KEY") {
            self.snapshot_key = v;
        }
        if let Some(v) = lookup("FUNDRAISING_CHANNEL_CAPACITY") {
            self.channel_capacity = v.parse().unwrap_or(self.channel_capacity);
        }
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.controller.trim().is_empty() {
            bail!("controller address is not configured (FUNDRAISING_CONTROLLER)");
        }
        if self.retry.factor == 0 {
            bail!("retry factor must be at least 1");
        }
        if self.channel_capacity == 0 {
            bail!("channel capacity must be positive");
        }
        Ok(())
    }
}
