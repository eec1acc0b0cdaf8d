use crate::config::RelayConfig;
use crate::db::{from_millis, now_millis, Database};
use crate::types::{DestinationId, RegistryError, Subscription, SubscriptionKey};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};
use url::Url;

/// Target languages both translation backends accept.
pub const SUPPORTED_LANGUAGES: &[&str] = &[
    "bg", "cs", "da", "de", "el", "en", "es", "et", "fi", "fr", "hu", "it", "ja", "lt", "lv", "nl", "pl", "pt",
    "ro", "ru", "sk", "sl", "sv", "zh",
];

type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Durable destination -> subscriptions mapping.
///
/// Every mutation is a single keyed statement, so concurrent poll tasks
/// touching different pairs never serialise on each other.
pub struct SubscriptionRegistry {
    db: SqlitePool,
    min_interval_minutes: u32,
    default_interval_minutes: u32,
    default_language: String,
}

impl SubscriptionRegistry {
    pub fn new(db: &Database, config: &RelayConfig) -> Self {
        Self {
            db: db.pool().clone(),
            min_interval_minutes: config.min_interval_minutes,
            default_interval_minutes: config.default_interval_minutes,
            default_language: config.default_language.to_lowercase(),
        }
    }

    /// Create the destination row if missing and return its target language.
    pub async fn ensure_destination(&self, destination_id: &DestinationId) -> RegistryResult<String> {
        sqlx::query(
            r#"
            INSERT INTO destinations (destination_id, target_language, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(destination_id) DO NOTHING
            "#,
        )
        .bind(destination_id.as_str())
        .bind(&self.default_language)
        .bind(now_millis())
        .execute(&self.db)
        .await?;

        let language: String = sqlx::query_scalar("SELECT target_language FROM destinations WHERE destination_id = ?1")
            .bind(destination_id.as_str())
            .fetch_one(&self.db)
            .await?;

        Ok(language)
    }

    pub async fn add_subscription(&self, destination_id: &DestinationId, feed_url: &str) -> RegistryResult<Subscription> {
        let feed_url = validate_feed_url(feed_url)?;
        let key = SubscriptionKey::new(destination_id.clone(), feed_url.clone());

        if let Some(existing) = self.get(&key).await? {
            if existing.enabled {
                return Err(RegistryError::DuplicateSubscription {
                    destination_id: destination_id.clone(),
                    feed_url,
                });
            }

            // Re-adding a disabled subscription is how an owner revives it.
            sqlx::query(
                r#"
                UPDATE subscriptions
                SET enabled = 1, consecutive_failures = 0, last_error = NULL, updated_at = ?1
                WHERE destination_id = ?2 AND feed_url = ?3
                "#,
            )
            .bind(now_millis())
            .bind(destination_id.as_str())
            .bind(&feed_url)
            .execute(&self.db)
            .await?;

            info!(destination = %destination_id, feed = %feed_url, "Re-enabled subscription");
            return self.require(&key).await;
        }

        let language = self.ensure_destination(destination_id).await?;
        let now = now_millis();

        let inserted = sqlx::query(
            r#"
            INSERT INTO subscriptions
                (destination_id, feed_url, target_language, poll_interval_minutes, enabled, consecutive_failures, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 1, 0, ?5, ?5)
            ON CONFLICT(destination_id, feed_url) DO NOTHING
            "#,
        )
        .bind(destination_id.as_str())
        .bind(&feed_url)
        .bind(&language)
        .bind(i64::from(self.default_interval_minutes))
        .bind(now)
        .execute(&self.db)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(RegistryError::DuplicateSubscription {
                destination_id: destination_id.clone(),
                feed_url,
            });
        }

        info!(destination = %destination_id, feed = %feed_url, "Added subscription");
        self.require(&key).await
    }

    pub async fn remove_subscription(&self, destination_id: &DestinationId, feed_url: &str) -> RegistryResult<()> {
        let feed_url = normalize_feed_url(feed_url);
        let removed = sqlx::query("DELETE FROM subscriptions WHERE destination_id = ?1 AND feed_url = ?2")
            .bind(destination_id.as_str())
            .bind(feed_url)
            .execute(&self.db)
            .await?
            .rows_affected();

        if removed == 0 {
            return Err(RegistryError::UnknownSubscription {
                destination_id: destination_id.clone(),
                feed_url: feed_url.to_string(),
            });
        }

        info!(destination = %destination_id, feed = %feed_url, "Removed subscription");
        Ok(())
    }

    /// Set the destination's language; applies to every existing subscription
    /// and to subscriptions added later. Returns the number updated.
    pub async fn set_target_language(&self, destination_id: &DestinationId, language: &str) -> RegistryResult<u64> {
        let language = language.trim().to_lowercase();
        if !SUPPORTED_LANGUAGES.contains(&language.as_str()) {
            return Err(RegistryError::InvalidLanguage(language));
        }

        let mut tx = self.db.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO destinations (destination_id, target_language, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(destination_id) DO UPDATE SET target_language = excluded.target_language
            "#,
        )
        .bind(destination_id.as_str())
        .bind(&language)
        .bind(now_millis())
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query("UPDATE subscriptions SET target_language = ?1, updated_at = ?2 WHERE destination_id = ?3")
            .bind(&language)
            .bind(now_millis())
            .bind(destination_id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        info!(destination = %destination_id, language = %language, updated, "Changed target language");
        Ok(updated)
    }

    pub async fn set_poll_interval(&self, destination_id: &DestinationId, feed_url: &str, minutes: u32) -> RegistryResult<()> {
        if minutes == 0 || minutes < self.min_interval_minutes {
            return Err(RegistryError::InvalidInterval {
                minutes,
                min: self.min_interval_minutes,
            });
        }

        let feed_url = normalize_feed_url(feed_url);
        let updated = sqlx::query(
            "UPDATE subscriptions SET poll_interval_minutes = ?1, updated_at = ?2 WHERE destination_id = ?3 AND feed_url = ?4",
        )
        .bind(i64::from(minutes))
        .bind(now_millis())
        .bind(destination_id.as_str())
        .bind(feed_url)
        .execute(&self.db)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(RegistryError::UnknownSubscription {
                destination_id: destination_id.clone(),
                feed_url: feed_url.to_string(),
            });
        }

        debug!(destination = %destination_id, feed = %feed_url, minutes, "Changed poll interval");
        Ok(())
    }

    pub async fn list_subscriptions(&self, destination_id: &DestinationId) -> RegistryResult<Vec<Subscription>> {
        let rows = sqlx::query("SELECT * FROM subscriptions WHERE destination_id = ?1 ORDER BY created_at, feed_url")
            .bind(destination_id.as_str())
            .fetch_all(&self.db)
            .await?;

        rows.iter().map(subscription_from_row).collect()
    }

    pub async fn list_enabled(&self) -> RegistryResult<Vec<Subscription>> {
        let rows = sqlx::query("SELECT * FROM subscriptions WHERE enabled = 1 ORDER BY destination_id, created_at")
            .fetch_all(&self.db)
            .await?;

        rows.iter().map(subscription_from_row).collect()
    }

    pub async fn get(&self, key: &SubscriptionKey) -> RegistryResult<Option<Subscription>> {
        let row = sqlx::query("SELECT * FROM subscriptions WHERE destination_id = ?1 AND feed_url = ?2")
            .bind(key.destination_id.as_str())
            .bind(&key.feed_url)
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn require(&self, key: &SubscriptionKey) -> RegistryResult<Subscription> {
        self.get(key).await?.ok_or_else(|| RegistryError::UnknownSubscription {
            destination_id: key.destination_id.clone(),
            feed_url: key.feed_url.clone(),
        })
    }

    pub async fn record_poll_success(&self, key: &SubscriptionKey) -> RegistryResult<()> {
        let now = now_millis();
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET consecutive_failures = 0, last_error = NULL, last_polled_at = ?1, updated_at = ?1
            WHERE destination_id = ?2 AND feed_url = ?3
            "#,
        )
        .bind(now)
        .bind(key.destination_id.as_str())
        .bind(&key.feed_url)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Count one more consecutive failure and return the new count.
    pub async fn record_poll_failure(&self, key: &SubscriptionKey, error: &str) -> RegistryResult<u32> {
        let failures: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE subscriptions
            SET consecutive_failures = consecutive_failures + 1, last_error = ?1, updated_at = ?2
            WHERE destination_id = ?3 AND feed_url = ?4
            RETURNING consecutive_failures
            "#,
        )
        .bind(error)
        .bind(now_millis())
        .bind(key.destination_id.as_str())
        .bind(&key.feed_url)
        .fetch_optional(&self.db)
        .await?;

        Ok(failures.unwrap_or(0).max(0) as u32)
    }

    /// Returns false when the subscription was already disabled or is gone.
    pub async fn disable_subscription(&self, key: &SubscriptionKey) -> RegistryResult<bool> {
        let updated = sqlx::query(
            "UPDATE subscriptions SET enabled = 0, updated_at = ?1 WHERE destination_id = ?2 AND feed_url = ?3 AND enabled = 1",
        )
        .bind(now_millis())
        .bind(key.destination_id.as_str())
        .bind(&key.feed_url)
        .execute(&self.db)
        .await?
        .rows_affected();

        if updated > 0 {
            warn!(destination = %key.destination_id, feed = %key.feed_url, "Disabled subscription");
        }
        Ok(updated > 0)
    }

    pub async fn disable_destination(&self, destination_id: &DestinationId) -> RegistryResult<u64> {
        let updated = sqlx::query("UPDATE subscriptions SET enabled = 0, updated_at = ?1 WHERE destination_id = ?2 AND enabled = 1")
            .bind(now_millis())
            .bind(destination_id.as_str())
            .execute(&self.db)
            .await?
            .rows_affected();

        warn!(destination = %destination_id, updated, "Disabled all subscriptions of destination");
        Ok(updated)
    }
}

/// Only absolute http(s) URLs with a host are accepted.
/// The form a feed URL is stored and looked up in.
pub fn normalize_feed_url(feed_url: &str) -> &str {
    feed_url.trim()
}

pub fn validate_feed_url(feed_url: &str) -> std::result::Result<String, RegistryError> {
    let trimmed = normalize_feed_url(feed_url);
    let parsed = Url::parse(trimmed).map_err(|_| RegistryError::UnknownFeed(trimmed.to_string()))?;

    if !matches!(parsed.scheme(), "http" | "https") || parsed.host().is_none() {
        return Err(RegistryError::UnknownFeed(trimmed.to_string()));
    }

    Ok(trimmed.to_string())
}

fn subscription_from_row(row: &SqliteRow) -> RegistryResult<Subscription> {
    let destination_id: String = row.try_get("destination_id")?;
    let poll_interval_minutes: i64 = row.try_get("poll_interval_minutes")?;
    let consecutive_failures: i64 = row.try_get("consecutive_failures")?;
    let last_polled_at: Option<i64> = row.try_get("last_polled_at")?;
    let created_at: i64 = row.try_get("created_at")?;

    Ok(Subscription {
        destination_id: DestinationId::new(destination_id),
        feed_url: row.try_get("feed_url")?,
        target_language: row.try_get("target_language")?,
        poll_interval_minutes: poll_interval_minutes.clamp(1, i64::from(u32::MAX)) as u32,
        enabled: row.try_get::<bool, _>("enabled")?,
        consecutive_failures: consecutive_failures.max(0) as u32,
        last_error: row.try_get("last_error")?,
        last_polled_at: last_polled_at.map(from_millis),
        created_at: from_millis(created_at),
    })
}
