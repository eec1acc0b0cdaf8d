use crate::registry::SUPPORTED_LANGUAGES;
use crate::types::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Translation backends the gateway knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Google,
    DeepL,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Google => "google",
            ProviderKind::DeepL => "deepl",
        }
    }
}

/// What happens to already-queued items when their subscription is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalPolicy {
    Deliver,
    Discard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_feed_size_mb: usize,
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "feed-relay/0.1".to_string(),
            timeout_seconds: 30,
            max_feed_size_mb: 10,
            max_redirects: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub provider_order: Vec<ProviderKind>,
    pub min_interval_minutes: u32,
    pub max_queue_depth: usize,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub failure_disable_threshold: u32,

    pub default_language: String,
    pub default_interval_minutes: u32,
    pub default_feeds: Vec<String>,
    pub initial_backfill_items: usize,

    pub dedup_retention_days: u32,
    pub dedup_purge_interval_minutes: u32,

    pub sends_per_minute: u32,
    pub send_burst: u32,
    pub max_send_attempts: u32,
    pub send_retry_base_ms: u64,
    pub send_retry_cap_ms: u64,
    pub removal_policy: RemovalPolicy,

    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_base_ms: u64,
    pub breaker_cooldown_cap_ms: u64,

    /// Wall-clock length of one poll-interval minute.
    pub poll_unit_ms: u64,

    pub fetch: FetchConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            provider_order: vec![ProviderKind::Google, ProviderKind::DeepL],
            min_interval_minutes: 5,
            max_queue_depth: 200,
            backoff_base_ms: 30_000,
            backoff_cap_ms: 3_600_000,
            failure_disable_threshold: 10,
            default_language: "zh".to_string(),
            default_interval_minutes: 60,
            default_feeds: Vec::new(),
            initial_backfill_items: 3,
            dedup_retention_days: 30,
            dedup_purge_interval_minutes: 60,
            // Discord allows roughly five messages per five seconds per channel
            sends_per_minute: 60,
            send_burst: 5,
            max_send_attempts: 5,
            send_retry_base_ms: 1_000,
            send_retry_cap_ms: 60_000,
            removal_policy: RemovalPolicy::Deliver,
            breaker_failure_threshold: 3,
            breaker_cooldown_base_ms: 60_000,
            breaker_cooldown_cap_ms: 1_800_000,
            poll_unit_ms: 60_000,
            fetch: FetchConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load from a TOML file, falling back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                let config: RelayConfig = toml::from_str(&raw)?;
                info!("Loaded relay configuration from {}", path.display());
                config
            }
            None => {
                info!("No configuration file given, using defaults");
                RelayConfig::default()
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_interval_minutes == 0 {
            return Err(RelayError::Config("min_interval_minutes must be greater than 0".into()));
        }
        if self.default_interval_minutes < self.min_interval_minutes {
            return Err(RelayError::Config(format!(
                "default_interval_minutes ({}) is below min_interval_minutes ({})",
                self.default_interval_minutes, self.min_interval_minutes
            )));
        }
        if self.max_queue_depth == 0 {
            return Err(RelayError::Config("max_queue_depth must be greater than 0".into()));
        }
        if self.sends_per_minute == 0 || self.send_burst == 0 {
            return Err(RelayError::Config("sends_per_minute and send_burst must be greater than 0".into()));
        }
        if self.max_send_attempts == 0 {
            return Err(RelayError::Config("max_send_attempts must be greater than 0".into()));
        }
        if self.failure_disable_threshold == 0 || self.breaker_failure_threshold == 0 {
            return Err(RelayError::Config("failure thresholds must be greater than 0".into()));
        }
        if self.poll_unit_ms == 0 {
            return Err(RelayError::Config("poll_unit_ms must be greater than 0".into()));
        }
        if self.dedup_retention_days == 0 {
            return Err(RelayError::Config("dedup_retention_days must be greater than 0".into()));
        }
        if !SUPPORTED_LANGUAGES.contains(&self.default_language.to_lowercase().as_str()) {
            return Err(RelayError::Config(format!(
                "default_language '{}' is not supported",
                self.default_language
            )));
        }
        for (name, base, cap) in [
            ("backoff", self.backoff_base_ms, self.backoff_cap_ms),
            ("send_retry", self.send_retry_base_ms, self.send_retry_cap_ms),
            ("breaker_cooldown", self.breaker_cooldown_base_ms, self.breaker_cooldown_cap_ms),
        ] {
            if base == 0 || cap < base {
                return Err(RelayError::Config(format!(
                    "{name}: base must be positive and cap ({cap}ms) not below base ({base}ms)"
                )));
            }
        }
        if self.provider_order.is_empty() {
            warn!("provider_order is empty; items will be delivered untranslated");
        }
        Ok(())
    }

    pub fn poll_unit(&self) -> Duration {
        Duration::from_millis(self.poll_unit_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn dedup_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.dedup_retention_days))
    }

    pub fn dedup_purge_interval(&self) -> Duration {
        self.poll_unit() * self.dedup_purge_interval_minutes.max(1)
    }
}

/// Secrets read from the environment (and `.env`), never from the config file.
#[derive(Clone, Default)]
pub struct Credentials {
    pub google_api_key: Option<String>,
    pub deepl_api_key: Option<String>,
    pub discord_token: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!("No .env file loaded: {}", e);
        }

        let read = |name: &str| env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            google_api_key: read("GOOGLE_TRANSLATE_API_KEY"),
            deepl_api_key: read("DEEPL_API_KEY"),
            discord_token: read("DISCORD_TOKEN"),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mask = |v: &Option<String>| if v.is_some() { "***" } else { "<unset>" };
        f.debug_struct("Credentials")
            .field("google_api_key", &mask(&self.google_api_key))
            .field("deepl_api_key", &mask(&self.deepl_api_key))
            .field("discord_token", &mask(&self.discord_token))
            .finish()
    }
}
