use crate::config::RelayConfig;
use crate::dedup::DedupStore;
use crate::dispatcher::DeliveryDispatcher;
use crate::events::EventSink;
use crate::parser::oldest_first;
use crate::registry::SubscriptionRegistry;
use crate::translation::TranslationGateway;
use crate::types::{
    DeliveryError, FetchError, FetchFeed, RegistryError, RelayError, RelayEvent, Subscription, SubscriptionKey,
};
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of one (destination, feed) polling pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Idle,
    Polling,
    Delivering,
    Backoff,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Storage(#[from] RelayError),
}

/// What one poll cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub fetched: usize,
    pub unseen: usize,
    pub enqueued: usize,
    /// Older items marked seen without delivery on a first poll.
    pub backfill_skipped: usize,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_unit: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub failure_disable_threshold: u32,
    pub initial_backfill_items: usize,
}

impl SchedulerSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            poll_unit: config.poll_unit(),
            backoff_base: config.backoff_base(),
            backoff_cap: config.backoff_cap(),
            failure_disable_threshold: config.failure_disable_threshold.max(1),
            initial_backfill_items: config.initial_backfill_items,
        }
    }
}

/// Delay before the next poll after the `failures`-th consecutive failure.
pub fn backoff_delay(base: Duration, cap: Duration, failures: u32) -> Duration {
    let factor = 1u32 << failures.saturating_sub(1).min(20);
    base.saturating_mul(factor).min(cap)
}

/// Everything a poll cycle touches.
pub struct PollContext {
    pub registry: Arc<SubscriptionRegistry>,
    pub dedup: DedupStore,
    pub fetcher: Arc<dyn FetchFeed>,
    pub gateway: Arc<TranslationGateway>,
    pub dispatcher: DeliveryDispatcher,
    pub events: EventSink,
    pub settings: SchedulerSettings,
}

impl PollContext {
    /// Fetch, filter, translate and enqueue. Items are marked seen one by
    /// one, each only after its enqueue returned.
    async fn poll(
        &self,
        subscription: &Subscription,
        cancel: &CancellationToken,
        state: &watch::Sender<PairState>,
    ) -> Result<PollReport, PollError> {
        let key = subscription.key();
        let items = self.fetcher.fetch(&subscription.feed_url).await?;
        let mut report = PollReport {
            fetched: items.len(),
            ..PollReport::default()
        };

        let first_poll = self.dedup.seen_count(&key).await? == 0;
        let mut unseen = self.dedup.filter_unseen(&key, oldest_first(items)).await?;
        report.unseen = unseen.len();

        if first_poll && unseen.len() > self.settings.initial_backfill_items {
            let keep_from = unseen.len() - self.settings.initial_backfill_items;
            let recent = unseen.split_off(keep_from);
            for old in &unseen {
                self.dedup.mark_seen(&key, &old.item_id).await?;
            }
            report.backfill_skipped = unseen.len();
            info!(
                destination = %key.destination_id,
                feed = %key.feed_url,
                skipped = report.backfill_skipped,
                "First poll, delivering only the most recent items"
            );
            unseen = recent;
        }

        if unseen.is_empty() {
            return Ok(report);
        }

        state.send_replace(PairState::Delivering);
        for item in unseen {
            // Removal is honoured between items, never mid-request.
            if cancel.is_cancelled() {
                debug!(destination = %key.destination_id, feed = %key.feed_url, "Pair cancelled, stopping delivery");
                break;
            }

            let fingerprint = item.item_id.clone();
            let translated = self.gateway.translate_item(item, &subscription.target_language).await;
            // Left unseen so a later subscription to the feed picks it up again.
            if cancel.is_cancelled() {
                debug!(destination = %key.destination_id, feed = %key.feed_url, "Pair cancelled during translation, dropping item");
                break;
            }
            self.dispatcher.enqueue(&key.destination_id, translated).await?;
            self.dedup.mark_seen(&key, &fingerprint).await?;
            report.enqueued += 1;
        }

        Ok(report)
    }
}

struct PairHandle {
    generation: u64,
    cancel: CancellationToken,
    state: watch::Receiver<PairState>,
    task: JoinHandle<()>,
}

impl PairHandle {
    fn is_running(&self) -> bool {
        !self.task.is_finished() && *self.state.borrow() != PairState::Stopped
    }
}

type PairMap = Arc<Mutex<HashMap<SubscriptionKey, PairHandle>>>;

/// One independent task per (destination, feed) pair.
///
/// A pair sleeps on its own timer, so a slow or failing feed only ever
/// delays itself. Registry edits are picked up when the pair next wakes.
pub struct Scheduler {
    ctx: Arc<PollContext>,
    pairs: PairMap,
    next_generation: std::sync::atomic::AtomicU64,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(ctx: PollContext, shutdown: CancellationToken) -> Self {
        Self {
            ctx: Arc::new(ctx),
            pairs: Arc::new(Mutex::new(HashMap::new())),
            next_generation: std::sync::atomic::AtomicU64::new(1),
            shutdown,
        }
    }

    /// Spawn a pair for every enabled subscription.
    pub async fn start(&self) -> Result<usize, RegistryError> {
        let subscriptions = self.ctx.registry.list_enabled().await?;
        let mut started = 0;
        for subscription in subscriptions {
            if self.ensure_pair(subscription.key()).await {
                started += 1;
            }
        }
        info!("Scheduler started {} polling pairs", started);
        Ok(started)
    }

    /// Start the pair unless it is already running. Returns true when spawned.
    pub async fn ensure_pair(&self, key: SubscriptionKey) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }

        let mut pairs = self.pairs.lock().await;
        if let Some(existing) = pairs.get(&key) {
            if existing.is_running() {
                return false;
            }
        }
        if let Some(stale) = pairs.remove(&key) {
            stale.cancel.cancel();
        }

        let generation = self.next_generation.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        let (state_tx, state_rx) = watch::channel(PairState::Idle);

        let task = tokio::spawn(run_pair(
            self.ctx.clone(),
            self.pairs.clone(),
            key.clone(),
            generation,
            cancel.clone(),
            state_tx,
        ));

        debug!(destination = %key.destination_id, feed = %key.feed_url, generation, "Spawned polling pair");
        pairs.insert(
            key,
            PairHandle {
                generation,
                cancel,
                state: state_rx,
                task,
            },
        );
        true
    }

    /// Stop a pair at its next idle point. An in-flight fetch completes.
    ///
    /// Returns once the pair is out of its delivery loop, so nothing it
    /// enqueues can land after the caller moves on.
    pub async fn cancel_pair(&self, key: &SubscriptionKey) -> bool {
        let Some(handle) = self.pairs.lock().await.remove(key) else {
            return false;
        };

        handle.cancel.cancel();
        let mut state = handle.state;
        // A closed channel means the task already ended.
        let _ = state.wait_for(|s| *s != PairState::Delivering).await;
        debug!(destination = %key.destination_id, feed = %key.feed_url, "Cancelled polling pair");
        true
    }

    pub async fn pair_state(&self, key: &SubscriptionKey) -> Option<PairState> {
        self.pairs.lock().await.get(key).map(|handle| *handle.state.borrow())
    }

    pub async fn active_pairs(&self) -> Vec<SubscriptionKey> {
        let pairs = self.pairs.lock().await;
        let mut keys: Vec<_> = pairs
            .iter()
            .filter(|(_, handle)| handle.is_running())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Run one cycle for a subscription outside its timer.
    pub async fn poll_once(&self, key: &SubscriptionKey) -> Result<PollReport, PollError> {
        let subscription = self.ctx.registry.get(key).await?.ok_or_else(|| RegistryError::UnknownSubscription {
            destination_id: key.destination_id.clone(),
            feed_url: key.feed_url.clone(),
        })?;

        let (state_tx, _state_rx) = watch::channel(PairState::Polling);
        match self.ctx.poll(&subscription, &CancellationToken::new(), &state_tx).await {
            Ok(report) => {
                self.ctx.registry.record_poll_success(key).await?;
                Ok(report)
            }
            Err(PollError::Fetch(e)) => {
                self.ctx.registry.record_poll_failure(key, &e.to_string()).await?;
                Err(PollError::Fetch(e))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.pairs.lock().await.drain().map(|(_, h)| h.task).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("Polling pair ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }
}

async fn run_pair(
    ctx: Arc<PollContext>,
    pairs: PairMap,
    key: SubscriptionKey,
    generation: u64,
    cancel: CancellationToken,
    state: watch::Sender<PairState>,
) {
    let settings = &ctx.settings;
    let mut delay = match ctx.registry.get(&key).await {
        Ok(Some(subscription)) => subscription.due_in(settings.poll_unit, Utc::now()),
        Ok(None) => Duration::ZERO,
        Err(e) => {
            error!(destination = %key.destination_id, feed = %key.feed_url, "Failed to read subscription: {}", e);
            settings.backoff_base
        }
    };
    let mut waiting_state = PairState::Idle;

    loop {
        state.send_replace(waiting_state);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break,
        }

        let subscription = match ctx.registry.get(&key).await {
            Ok(Some(subscription)) if subscription.enabled => subscription,
            Ok(_) => {
                if retire(&ctx, &pairs, &key, generation).await {
                    break;
                }
                // Re-enabled while we were looking.
                delay = Duration::ZERO;
                waiting_state = PairState::Idle;
                continue;
            }
            Err(e) => {
                error!(destination = %key.destination_id, feed = %key.feed_url, "Failed to read subscription: {}", e);
                delay = settings.backoff_base;
                waiting_state = PairState::Backoff;
                continue;
            }
        };

        state.send_replace(PairState::Polling);
        debug!(destination = %key.destination_id, feed = %key.feed_url, "Polling");

        match ctx.poll(&subscription, &cancel, &state).await {
            Ok(report) => {
                if let Err(e) = ctx.registry.record_poll_success(&key).await {
                    error!(destination = %key.destination_id, feed = %key.feed_url, "Failed to record poll: {}", e);
                }
                if report.enqueued > 0 || report.backfill_skipped > 0 {
                    info!(
                        destination = %key.destination_id,
                        feed = %key.feed_url,
                        fetched = report.fetched,
                        enqueued = report.enqueued,
                        skipped = report.backfill_skipped,
                        "Poll complete"
                    );
                }

                // The interval in force now governs the next timer.
                delay = match ctx.registry.get(&key).await {
                    Ok(Some(latest)) => latest.poll_interval(settings.poll_unit),
                    _ => subscription.poll_interval(settings.poll_unit),
                };
                waiting_state = PairState::Idle;
            }
            Err(PollError::Fetch(e)) => {
                let failures = match ctx.registry.record_poll_failure(&key, &e.to_string()).await {
                    Ok(failures) => failures,
                    Err(err) => {
                        error!(destination = %key.destination_id, feed = %key.feed_url, "Failed to record failure: {}", err);
                        subscription.consecutive_failures.saturating_add(1)
                    }
                };

                if failures >= settings.failure_disable_threshold {
                    disable_after_failures(&ctx, &key, failures, &e).await;
                    if retire(&ctx, &pairs, &key, generation).await {
                        break;
                    }
                }

                delay = backoff_delay(settings.backoff_base, settings.backoff_cap, failures);
                waiting_state = PairState::Backoff;
                warn!(
                    destination = %key.destination_id,
                    feed = %key.feed_url,
                    failures,
                    "Fetch failed ({}), next attempt in {:?}",
                    e,
                    delay
                );
            }
            Err(PollError::Delivery(DeliveryError::DestinationDisabled(_))) => {
                warn!(destination = %key.destination_id, feed = %key.feed_url, "Destination disabled, stopping pair");
                if retire(&ctx, &pairs, &key, generation).await {
                    break;
                }
                delay = Duration::ZERO;
                waiting_state = PairState::Idle;
            }
            Err(e) => {
                // Local storage trouble is not the feed's fault; retry without counting.
                error!(destination = %key.destination_id, feed = %key.feed_url, "Poll cycle failed: {}", e);
                delay = settings.backoff_base;
                waiting_state = PairState::Backoff;
            }
        }
    }

    state.send_replace(PairState::Stopped);
    debug!(destination = %key.destination_id, feed = %key.feed_url, "Polling pair stopped");
}

async fn disable_after_failures(ctx: &PollContext, key: &SubscriptionKey, failures: u32, last_error: &FetchError) {
    match ctx.registry.disable_subscription(key).await {
        Ok(true) => {
            warn!(
                destination = %key.destination_id,
                feed = %key.feed_url,
                failures,
                "Disabling subscription after repeated fetch failures"
            );
            ctx.events.emit(RelayEvent::SubscriptionDisabled {
                destination_id: key.destination_id.clone(),
                feed_url: key.feed_url.clone(),
                consecutive_failures: failures,
                last_error: last_error.to_string(),
            });
        }
        Ok(false) => {}
        Err(e) => error!(destination = %key.destination_id, feed = %key.feed_url, "Failed to disable subscription: {}", e),
    }
}

/// Leave the pair map if the subscription is really gone or disabled.
///
/// The check runs under the map lock so a concurrent `ensure_pair` either
/// sees this pair still registered or finds the slot free.
async fn retire(ctx: &PollContext, pairs: &PairMap, key: &SubscriptionKey, generation: u64) -> bool {
    let mut pairs = pairs.lock().await;

    match ctx.registry.get(key).await {
        Ok(Some(subscription)) if subscription.enabled => return false,
        Ok(_) => {}
        Err(e) => warn!(destination = %key.destination_id, feed = %key.feed_url, "Retiring pair after read error: {}", e),
    }

    if pairs.get(key).map(|h| h.generation) == Some(generation) {
        pairs.remove(key);
    }
    true
}
