use crate::config::RelayConfig;
use crate::db::{now_millis, Database};
use crate::dedup::fingerprint;
use crate::types::{FeedItem, TranslatedItem, TranslationError};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A translation backend.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Short stable name, recorded as `provider_used`.
    fn name(&self) -> &str;

    async fn translate(&self, text: &str, target_language: &str) -> Result<String, TranslationError>;
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub cooldown_base: Duration,
    pub cooldown_cap: Duration,
}

impl BreakerPolicy {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            failure_threshold: config.breaker_failure_threshold.max(1),
            cooldown_base: Duration::from_millis(config.breaker_cooldown_base_ms),
            cooldown_cap: Duration::from_millis(config.breaker_cooldown_cap_ms),
        }
    }

    /// Cooldown after the `trips`-th consecutive trip, doubling from the base.
    pub fn cooldown(&self, trips: u32) -> Duration {
        let factor = 1u32 << trips.saturating_sub(1).min(20);
        self.cooldown_base.saturating_mul(factor).min(self.cooldown_cap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed { failures: u32 },
    Open { until: Instant, trips: u32 },
    /// One trial call is in flight.
    HalfOpen { trips: u32, trial_started: Instant },
}

/// Per-provider failure tracker shared by all concurrent translation calls.
///
/// Trips open after `failure_threshold` consecutive failures. Once the
/// cooldown elapses a single trial call is let through: success closes the
/// breaker, failure reopens it with a doubled cooldown.
#[derive(Debug)]
pub struct CircuitBreaker {
    policy: BreakerPolicy,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        *self.lock()
    }

    /// Whether a call may go to the provider now.
    pub fn try_acquire(&self, now: Instant) -> bool {
        let mut state = self.lock();
        match *state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { until, trips } => {
                if now >= until {
                    *state = BreakerState::HalfOpen { trips, trial_started: now };
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen { trips, trial_started } => {
                // A trial call that never reported back is given up on after one cooldown.
                if now.saturating_duration_since(trial_started) >= self.policy.cooldown(trips) {
                    *state = BreakerState::HalfOpen { trips, trial_started: now };
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Closes the breaker unless it is open; results of calls admitted
    /// before the trip are ignored until the next half-open call reports.
    pub fn record_success(&self) {
        let mut state = self.lock();
        match *state {
            BreakerState::Open { .. } => {}
            BreakerState::HalfOpen { .. } => {
                debug!("Circuit closed");
                *state = BreakerState::Closed { failures: 0 };
            }
            BreakerState::Closed { .. } => *state = BreakerState::Closed { failures: 0 },
        }
    }

    /// Returns true when this failure opened the breaker.
    pub fn record_failure(&self, now: Instant) -> bool {
        let mut state = self.lock();
        let (next, tripped) = match *state {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.policy.failure_threshold {
                    (
                        BreakerState::Open {
                            until: now + self.policy.cooldown(1),
                            trips: 1,
                        },
                        true,
                    )
                } else {
                    (BreakerState::Closed { failures }, false)
                }
            }
            BreakerState::HalfOpen { trips, .. } => {
                let trips = trips.saturating_add(1);
                (
                    BreakerState::Open {
                        until: now + self.policy.cooldown(trips),
                        trips,
                    },
                    true,
                )
            }
            open @ BreakerState::Open { .. } => (open, false),
        };
        *state = next;
        tripped
    }
}

/// Durable translations keyed by (content fingerprint, language).
#[derive(Clone)]
pub struct TranslationCache {
    db: SqlitePool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedTranslation {
    pub title: String,
    pub body: String,
    pub provider: String,
}

impl TranslationCache {
    pub fn new(db: &Database) -> Self {
        Self { db: db.pool().clone() }
    }

    pub async fn get(&self, key: &str, language: &str) -> Result<Option<CachedTranslation>, sqlx::Error> {
        let row = sqlx::query("SELECT title, body, provider FROM translation_cache WHERE fingerprint = ?1 AND language = ?2")
            .bind(key)
            .bind(language)
            .fetch_optional(&self.db)
            .await?;

        row.map(|row| {
            Ok(CachedTranslation {
                title: row.try_get("title")?,
                body: row.try_get("body")?,
                provider: row.try_get("provider")?,
            })
        })
        .transpose()
    }

    pub async fn put(&self, key: &str, language: &str, translation: &CachedTranslation) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO translation_cache (fingerprint, language, title, body, provider, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(fingerprint, language) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(language)
        .bind(&translation.title)
        .bind(&translation.body)
        .bind(&translation.provider)
        .bind(now_millis())
        .execute(&self.db)
        .await?;

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub text: String,
    pub provider: String,
}

struct ProviderSlot {
    translator: Arc<dyn Translator>,
    breaker: CircuitBreaker,
}

/// Ordered provider fallback with one circuit breaker per provider.
pub struct TranslationGateway {
    providers: Vec<ProviderSlot>,
    cache: Option<TranslationCache>,
}

impl TranslationGateway {
    pub fn new(providers: Vec<Arc<dyn Translator>>, policy: BreakerPolicy) -> Self {
        let providers = providers
            .into_iter()
            .map(|translator| ProviderSlot {
                translator,
                breaker: CircuitBreaker::new(policy),
            })
            .collect::<Vec<_>>();

        info!(
            "Translation gateway with providers: [{}]",
            providers.iter().map(|p| p.translator.name()).collect::<Vec<_>>().join(", ")
        );
        Self { providers, cache: None }
    }

    pub fn with_cache(mut self, cache: TranslationCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.translator.name().to_string()).collect()
    }

    pub fn breaker_state(&self, provider: &str) -> Option<BreakerState> {
        self.providers
            .iter()
            .find(|p| p.translator.name() == provider)
            .map(|p| p.breaker.state())
    }

    /// Try each provider in order, skipping open breakers.
    ///
    /// RateLimited and Unavailable fall through to the next provider;
    /// UnsupportedLanguage ends the attempt for this text.
    pub async fn translate(&self, text: &str, target_language: &str) -> Result<Translation, TranslationError> {
        let mut last_error = None;

        for slot in &self.providers {
            let name = slot.translator.name();
            if !slot.breaker.try_acquire(Instant::now()) {
                debug!(provider = name, "Skipping provider with open circuit");
                last_error = Some(TranslationError::Unavailable(format!("{} circuit open", name)));
                continue;
            }

            match slot.translator.translate(text, target_language).await {
                Ok(translated) => {
                    slot.breaker.record_success();
                    return Ok(Translation {
                        text: translated,
                        provider: name.to_string(),
                    });
                }
                Err(e) if e.triggers_fallback() => {
                    if slot.breaker.record_failure(Instant::now()) {
                        warn!(provider = name, "Circuit opened after error: {}", e);
                    } else {
                        warn!(provider = name, "Translation failed, trying next provider: {}", e);
                    }
                    last_error = Some(e);
                }
                Err(e) => {
                    // The provider answered; only the request was unusable.
                    slot.breaker.record_success();
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TranslationError::Unavailable("no translation providers configured".into())))
    }

    /// Translate title and body of an item. Never fails: when no provider
    /// can serve it the item is carried untranslated and flagged.
    pub async fn translate_item(&self, item: FeedItem, target_language: &str) -> TranslatedItem {
        let key = cache_key(&item);

        if let Some(cache) = &self.cache {
            match cache.get(&key, target_language).await {
                Ok(Some(hit)) => {
                    debug!(item = %item.item_id, language = target_language, "Translation cache hit");
                    return TranslatedItem {
                        item,
                        translated_title: hit.title,
                        translated_body: hit.body,
                        language: target_language.to_string(),
                        provider_used: Some(hit.provider),
                        translation_failed: false,
                    };
                }
                Ok(None) => {}
                Err(e) => warn!("Translation cache lookup failed: {}", e),
            }
        }

        let title = match self.translate(&item.title, target_language).await {
            Ok(title) => title,
            Err(e) => {
                warn!(item = %item.item_id, language = target_language, "Delivering untranslated: {}", e);
                return TranslatedItem::untranslated(item, target_language);
            }
        };

        let body = if item.body.trim().is_empty() {
            None
        } else {
            match self.translate(&item.body, target_language).await {
                Ok(body) => Some(body),
                Err(e) => {
                    warn!(item = %item.item_id, language = target_language, "Delivering untranslated: {}", e);
                    return TranslatedItem::untranslated(item, target_language);
                }
            }
        };

        let provider = match &body {
            Some(body) if body.provider != title.provider => format!("{}+{}", title.provider, body.provider),
            _ => title.provider.clone(),
        };
        let translated = CachedTranslation {
            title: title.text,
            body: body.map(|b| b.text).unwrap_or_default(),
            provider,
        };

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(&key, target_language, &translated).await {
                warn!("Failed to cache translation: {}", e);
            }
        }

        TranslatedItem {
            item,
            translated_title: translated.title,
            translated_body: translated.body,
            language: target_language.to_string(),
            provider_used: Some(translated.provider),
            translation_failed: false,
        }
    }
}

/// Keyed on content rather than guid so feeds reusing short guids never
/// share a cached translation.
fn cache_key(item: &FeedItem) -> String {
    fingerprint(None, &item.title, &item.source_link)
}
