use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chrono::{FixedOffset, Offset, Utc};
use serde::Deserialize;

use crate::governor::QuotaPolicy;
use crate::snapshot::DEFAULT_EVENT_CAP;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            model: default_model(),
            timeout_secs: default_timeout_secs(),
            temperature: default_temperature(),
        }
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct AggregationConfig {
    #[serde(default = "default_event_cap")]
    pub event_cap: usize,
    /// Minutes east of UTC used to cut calendar days.
    #[serde(default)]
    pub day_offset_minutes: i32,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            event_cap: default_event_cap(),
            day_offset_minutes: 0,
        }
    }
}

fn default_event_cap() -> usize {
    DEFAULT_EVENT_CAP
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuotaConfig {
    #[serde(default = "default_limit_per_day")]
    pub limit_per_day: u32,
    #[serde(default = "default_reuse_window_days")]
    pub reuse_window_days: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limit_per_day: default_limit_per_day(),
            reuse_window_days: default_reuse_window_days(),
        }
    }
}

fn default_limit_per_day() -> u32 {
    7
}
fn default_reuse_window_days() -> i64 {
    7
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_latest_ttl_secs")]
    pub latest_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            latest_ttl_secs: default_latest_ttl_secs(),
        }
    }
}

fn default_latest_ttl_secs() -> u64 {
    60
}

impl AppConfig {
    /// Read `path` if it exists, then apply environment overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Self::parse(&content)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(content).context("Invalid config file")?;
        config.day_offset()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL").filter(|value| !value.is_empty()) {
            self.database.url = Some(url);
        }
        if let Some(key) = lookup("INSIGHT_API_KEY").filter(|value| !value.is_empty()) {
            self.provider.api_key = key;
        }
    }

    pub fn database_url(&self) -> anyhow::Result<&str> {
        self.database
            .url
            .as_deref()
            .context("DATABASE_URL must be set (environment or [database] url)")
    }

    pub fn day_offset(&self) -> anyhow::Result<FixedOffset> {
        if self.aggregation.day_offset_minutes == 0 {
            return Ok(Utc.fix());
        }
        FixedOffset::east_opt(self.aggregation.day_offset_minutes * 60).with_context(|| {
            format!(
                "day_offset_minutes {} is out of range",
                self.aggregation.day_offset_minutes
            )
        })
    }

    pub fn quota_policy(&self) -> anyhow::Result<QuotaPolicy> {
        Ok(QuotaPolicy {
            limit_per_day: self.quota.limit_per_day,
            reuse_window_days: self.quota.reuse_window_days,
            day_offset: self.day_offset()?,
        })
    }

    pub fn latest_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.latest_ttl_secs)
    }
}
