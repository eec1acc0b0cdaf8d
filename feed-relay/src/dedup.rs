use crate::db::{now_millis, to_millis, Database};
use crate::types::{FeedItem, Result, SubscriptionKey};
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::HashSet;
use tracing::{debug, info};

/// Derive the dedup fingerprint of a feed entry.
///
/// A source-provided guid wins; entries without one are identified by a
/// hash of title and link so a resent or reordered entry still matches.
pub fn fingerprint(source_id: Option<&str>, title: &str, link: &str) -> String {
    match source_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => format!("id:{}", id),
        None => {
            let mut hasher = Sha256::new();
            hasher.update(title.trim().as_bytes());
            hasher.update([0u8]);
            hasher.update(link.trim().as_bytes());
            format!("sha256:{}", hex::encode(hasher.finalize()))
        }
    }
}

/// Durable seen-set, scoped per (destination, feed).
///
/// Rows are append-only; `mark_seen` on an existing fingerprint is a no-op,
/// so concurrent poll cycles never conflict.
#[derive(Clone)]
pub struct DedupStore {
    db: SqlitePool,
}

impl DedupStore {
    pub fn new(db: &Database) -> Self {
        Self { db: db.pool().clone() }
    }

    pub async fn has_seen(&self, scope: &SubscriptionKey, fingerprint: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM seen_items WHERE destination_id = ?1 AND feed_url = ?2 AND fingerprint = ?3",
        )
        .bind(scope.destination_id.as_str())
        .bind(&scope.feed_url)
        .bind(fingerprint)
        .fetch_optional(&self.db)
        .await?;

        Ok(found.is_some())
    }

    /// Returns true when the fingerprint was not yet recorded.
    pub async fn mark_seen(&self, scope: &SubscriptionKey, fingerprint: &str) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO seen_items (destination_id, feed_url, fingerprint, first_seen_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(destination_id, feed_url, fingerprint) DO NOTHING
            "#,
        )
        .bind(scope.destination_id.as_str())
        .bind(&scope.feed_url)
        .bind(fingerprint)
        .bind(now_millis())
        .execute(&self.db)
        .await?
        .rows_affected();

        Ok(inserted > 0)
    }

    /// Keep the items whose fingerprint is not in the store, preserving
    /// order. Repeats within the batch are collapsed to their first entry.
    pub async fn filter_unseen(&self, scope: &SubscriptionKey, items: Vec<FeedItem>) -> Result<Vec<FeedItem>> {
        let total = items.len();
        let mut batch = HashSet::new();
        let mut unseen = Vec::new();

        for item in items {
            if !batch.insert(item.item_id.clone()) {
                continue;
            }
            if !self.has_seen(scope, &item.item_id).await? {
                unseen.push(item);
            }
        }

        debug!(
            destination = %scope.destination_id,
            feed = %scope.feed_url,
            "{} of {} fetched items are new",
            unseen.len(),
            total
        );
        Ok(unseen)
    }

    pub async fn seen_count(&self, scope: &SubscriptionKey) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM seen_items WHERE destination_id = ?1 AND feed_url = ?2")
            .bind(scope.destination_id.as_str())
            .bind(&scope.feed_url)
            .fetch_one(&self.db)
            .await?;

        Ok(count.max(0) as u64)
    }

    /// Evict fingerprints first seen before `now - retention`.
    pub async fn purge_older_than(&self, retention: chrono::Duration) -> Result<u64> {
        let cutoff = to_millis(Utc::now() - retention);
        let purged = sqlx::query("DELETE FROM seen_items WHERE first_seen_at < ?1")
            .bind(cutoff)
            .execute(&self.db)
            .await?
            .rows_affected();

        if purged > 0 {
            info!("Purged {} expired fingerprints", purged);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_id_takes_precedence() {
        assert_eq!(
            fingerprint(Some("urn:uuid:42"), "Title", "https://a.example/1"),
            "id:urn:uuid:42"
        );
        assert_eq!(
            fingerprint(Some("urn:uuid:42"), "Other title", "https://a.example/2"),
            fingerprint(Some("urn:uuid:42"), "Title", "https://a.example/1")
        );
    }

    #[test]
    fn content_hash_is_stable_and_distinguishes_items() {
        let a = fingerprint(None, "Title", "https://a.example/1");
        assert!(a.starts_with("sha256:"));
        assert_eq!(a, fingerprint(Some("  "), " Title ", "https://a.example/1"));
        assert_ne!(a, fingerprint(None, "Title", "https://a.example/2"));
        // The separator keeps "ab"+"c" apart from "a"+"bc".
        assert_ne!(fingerprint(None, "ab", "c"), fingerprint(None, "a", "bc"));
    }
}
