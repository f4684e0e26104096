//! Gallerybot configuration management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main Gallerybot configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GalleryBotConfig {
    /// Artifact storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Departure attribution configuration
    #[serde(default)]
    pub attribution: AttributionConfig,

    /// Discord REST configuration (None = offline mode)
    #[serde(default)]
    pub discord: Option<DiscordConfig>,
}

impl GalleryBotConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the core cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.storage.capacity == 0 {
            return Err(Error::Config("storage.capacity must be at least 1".to_string()));
        }
        if self.attribution.lookback_window_secs == 0 {
            return Err(Error::Config(
                "attribution.lookback_window_secs must be at least 1".to_string(),
            ));
        }
        if self.attribution.max_total_wait_ms == 0 {
            return Err(Error::Config(
                "attribution.max_total_wait_ms must be at least 1".to_string(),
            ));
        }
        if let Some(discord) = &self.discord {
            if discord.bot_token_ref.is_empty() {
                return Err(Error::Config("discord.bot_token_ref is empty".to_string()));
            }
        }
        Ok(())
    }
}

/// Artifact storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for per-user artifact folders
    pub base_dir: PathBuf,

    /// Maximum artifacts kept per user
    pub capacity: usize,

    /// Lifetime of an unconfirmed eviction, in seconds
    pub pending_ttl_secs: u64,

    /// How often expired evictions are swept, in seconds
    pub sweep_interval_secs: u64,

    /// Base directory for published CPU designs
    pub cpuinfo_dir: PathBuf,
}

impl StorageConfig {
    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_data_dir().join("artifacts"),
            capacity: 10,
            pending_ttl_secs: 300,
            sweep_interval_secs: 30,
            cpuinfo_dir: default_data_dir().join("cpuinfo"),
        }
    }
}

/// Departure attribution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    /// Max distance between a removal signal and a qualifying audit entry
    pub lookback_window_secs: u64,

    /// Retries after the first empty query
    pub max_retries: u32,

    /// Backoff before each retry; the last value repeats if retries outnumber it
    pub backoff_ms: Vec<u64>,

    /// Upper bound on one whole poll, queries and backoff sleeps included
    pub max_total_wait_ms: u64,

    /// Timeout for a single audit query
    pub query_timeout_ms: u64,

    /// Max audit entries requested per query
    pub query_limit: usize,
}

impl AttributionConfig {
    pub fn lookback_window(&self) -> Duration {
        Duration::from_secs(self.lookback_window_secs)
    }

    pub fn max_total_wait(&self) -> Duration {
        Duration::from_millis(self.max_total_wait_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Backoff before retry number `retry` (1-based)
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let idx = (retry.saturating_sub(1) as usize).min(self.backoff_ms.len().saturating_sub(1));
        Duration::from_millis(self.backoff_ms.get(idx).copied().unwrap_or(0))
    }
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            lookback_window_secs: 15,
            max_retries: 3,
            backoff_ms: vec![1000, 2000, 4000],
            max_total_wait_ms: 10_000,
            query_timeout_ms: 3000,
            query_limit: 50,
        }
    }
}

/// Discord REST configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// Environment variable holding the bot token
    pub bot_token_ref: String,

    /// REST API base URL
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Allowed guild IDs (empty = all allowed)
    #[serde(default)]
    pub allowed_guilds: Vec<u64>,

    /// Channel that receives departure notices
    #[serde(default)]
    pub notify_channel_id: Option<u64>,
}

impl DiscordConfig {
    /// Check if a guild is allowed
    pub fn is_guild_allowed(&self, guild_id: u64) -> bool {
        self.allowed_guilds.is_empty() || self.allowed_guilds.contains(&guild_id)
    }
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

/// Default data directory (~/.gallerybot)
pub fn default_data_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gallerybot")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GalleryBotConfig::default();
        assert_eq!(config.storage.capacity, 10);
        assert_eq!(config.attribution.lookback_window_secs, 15);
        assert_eq!(config.attribution.max_retries, 3);
        assert!(config.discord.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_schedule() {
        let config = AttributionConfig::default();
        assert_eq!(config.backoff_for(1), Duration::from_secs(1));
        assert_eq!(config.backoff_for(2), Duration::from_secs(2));
        assert_eq!(config.backoff_for(3), Duration::from_secs(4));
        // Past the end of the schedule the last step repeats
        assert_eq!(config.backoff_for(7), Duration::from_secs(4));

        let empty = AttributionConfig {
            backoff_ms: vec![],
            ..AttributionConfig::default()
        };
        assert_eq!(empty.backoff_for(1), Duration::ZERO);
    }

    #[test]
    fn test_partial_toml() {
        let config: GalleryBotConfig = toml::from_str(
            r#"
            [storage]
            capacity = 3

            [discord]
            bot_token_ref = "GALLERYBOT_TOKEN"
            allowed_guilds = [42]
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.capacity, 3);
        assert_eq!(config.storage.pending_ttl_secs, 300);
        assert_eq!(config.attribution.backoff_ms, vec![1000, 2000, 4000]);

        let discord = config.discord.unwrap();
        assert_eq!(discord.api_base, "https://discord.com/api/v10");
        assert!(discord.is_guild_allowed(42));
        assert!(!discord.is_guild_allowed(7));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = GalleryBotConfig::default();
        config.storage.capacity = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_wait_budget() {
        let mut config = GalleryBotConfig::default();
        config.attribution.max_total_wait_ms = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[attribution]\nlookback_window_secs = 30\n").unwrap();

        let config = GalleryBotConfig::load(&path).unwrap();
        assert_eq!(config.attribution.lookback_window_secs, 30);

        std::fs::write(&path, "[attribution]\nlookback_window_secs = 0\n").unwrap();
        assert!(GalleryBotConfig::load(&path).is_err());
    }
}
