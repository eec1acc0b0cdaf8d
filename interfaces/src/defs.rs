use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Stable identifier of a chat channel that receives relayed items.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationId(String);

impl DestinationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DestinationId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for DestinationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for DestinationId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// One entry of a fetched feed document.
///
/// `item_id` is the dedup fingerprint: the source-provided guid when the
/// feed has one, otherwise a content hash over title and link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub feed_url: String,
    pub item_id: String,
    pub title: String,
    pub body: String,
    pub published_at: Option<DateTime<Utc>>,
    pub source_link: String,
    pub image_url: Option<String>,
}

/// Platform-neutral message handed to the send capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormattedMessage {
    pub title: String,
    pub link: String,
    pub summary: String,
    pub source: String,
    pub published: String,
    pub image_url: Option<String>,
    pub untranslated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("feed unreachable: {0}")]
    Unreachable(String),

    #[error("malformed feed document: {0}")]
    Malformed(String),

    #[error("feed fetch timed out")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("rate limited by chat platform")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient send failure: {0}")]
    Transient(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("destination gone: {0}")]
    Gone(String),
}

impl SendError {
    /// Permanent errors mean the destination can no longer receive messages.
    pub fn is_permanent(&self) -> bool {
        matches!(self, SendError::PermissionDenied(_) | SendError::Gone(_))
    }
}

/// Capability: fetch and parse the document behind a feed URL.
///
/// Implementations must not retry; retry policy belongs to the scheduler.
#[async_trait]
pub trait FetchFeed: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<FeedItem>, FetchError>;
}

/// Capability: deliver one message to a chat destination.
#[async_trait]
pub trait SendMessage: Send + Sync {
    async fn send(&self, destination: &DestinationId, message: &FormattedMessage) -> Result<(), SendError>;
}

/// Notifications the core raises for the command surface.
///
/// Delivering these to a human is the command surface's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayEvent {
    /// A subscription hit the consecutive fetch failure threshold.
    SubscriptionDisabled {
        destination_id: DestinationId,
        feed_url: String,
        consecutive_failures: u32,
        last_error: String,
    },
    /// The platform refused the destination permanently; all of its
    /// subscriptions were disabled and its queue discarded.
    DestinationDisabled {
        destination_id: DestinationId,
        reason: String,
        discarded: usize,
    },
    /// Queue overflow evicted the oldest pending items.
    ItemsDropped {
        destination_id: DestinationId,
        dropped: usize,
        total_dropped: u64,
    },
    /// An item exhausted its send attempts on transient errors.
    DeliveryAbandoned {
        destination_id: DestinationId,
        feed_url: String,
        item_id: String,
        error: String,
    },
}

impl RelayEvent {
    pub fn destination_id(&self) -> &DestinationId {
        match self {
            RelayEvent::SubscriptionDisabled { destination_id, .. }
            | RelayEvent::DestinationDisabled { destination_id, .. }
            | RelayEvent::ItemsDropped { destination_id, .. }
            | RelayEvent::DeliveryAbandoned { destination_id, .. } => destination_id,
        }
    }
}
