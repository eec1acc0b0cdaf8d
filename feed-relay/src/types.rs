use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use interfaces::defs::{
    DestinationId, FeedItem, FetchError, FetchFeed, FormattedMessage, RelayEvent, SendError, SendMessage,
};

/// Identifies one polling pair and, with per-pair dedup, one dedup scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub destination_id: DestinationId,
    pub feed_url: String,
}

impl SubscriptionKey {
    /// Surrounding whitespace in the URL is not part of the key.
    pub fn new(destination_id: impl Into<DestinationId>, feed_url: impl Into<String>) -> Self {
        let feed_url: String = feed_url.into();
        let feed_url = if feed_url.trim().len() == feed_url.len() {
            feed_url
        } else {
            feed_url.trim().to_string()
        };
        Self {
            destination_id: destination_id.into(),
            feed_url,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}", self.destination_id, self.feed_url)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub destination_id: DestinationId,
    pub feed_url: String,
    pub target_language: String,
    pub poll_interval_minutes: u32,
    pub enabled: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.destination_id.clone(), self.feed_url.clone())
    }

    /// Poll interval in wall-clock time, given the length of one minute.
    pub fn poll_interval(&self, unit: Duration) -> Duration {
        unit * self.poll_interval_minutes.max(1)
    }

    /// Time left until the next poll is due, zero when overdue or never polled.
    pub fn due_in(&self, unit: Duration, now: DateTime<Utc>) -> Duration {
        let Some(last) = self.last_polled_at else {
            return Duration::ZERO;
        };
        let elapsed = now.signed_duration_since(last).to_std().unwrap_or(Duration::ZERO);
        self.poll_interval(unit).saturating_sub(elapsed)
    }
}

/// A feed item with its translation for one target language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatedItem {
    pub item: FeedItem,
    pub translated_title: String,
    pub translated_body: String,
    pub language: String,
    pub provider_used: Option<String>,
    /// Set when every provider failed and the original text is carried instead.
    pub translation_failed: bool,
}

impl TranslatedItem {
    /// Carry the original text through untranslated.
    pub fn untranslated(item: FeedItem, language: &str) -> Self {
        Self {
            translated_title: item.title.clone(),
            translated_body: item.body.clone(),
            item,
            language: language.to_string(),
            provider_used: None,
            translation_failed: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub destination_id: DestinationId,
    pub item: TranslatedItem,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{destination_id} is already subscribed to {feed_url}")]
    DuplicateSubscription { destination_id: DestinationId, feed_url: String },

    #[error("{destination_id} has no subscription to {feed_url}")]
    UnknownSubscription { destination_id: DestinationId, feed_url: String },

    #[error("poll interval of {minutes} minutes is below the minimum of {min} minutes")]
    InvalidInterval { minutes: u32, min: u32 },

    #[error("not a usable feed URL: {0}")]
    UnknownFeed(String),

    #[error("unsupported language code: {0}")]
    InvalidLanguage(String),

    #[error("registry storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslationError {
    #[error("provider rate limited: {0}")]
    RateLimited(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("unsupported target language: {0}")]
    UnsupportedLanguage(String),
}

impl TranslationError {
    /// RateLimited and Unavailable move on to the next provider.
    pub fn triggers_fallback(&self) -> bool {
        matches!(self, TranslationError::RateLimited(_) | TranslationError::Unavailable(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("destination {0} is disabled")]
    DestinationDisabled(DestinationId),

    #[error("outbox storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("outbox payload error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("General error: {0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
