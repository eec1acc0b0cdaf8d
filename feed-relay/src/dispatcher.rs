use crate::config::RelayConfig;
use crate::db::{from_millis, to_millis, Database};
use crate::events::EventSink;
use crate::registry::SubscriptionRegistry;
use crate::render::render;
use crate::types::{DeliveryError, DeliveryTask, DestinationId, RelayEvent, SendError, SendMessage, TranslatedItem};
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use chrono::Utc;
use futures::future::join_all;
use governor::{Quota, RateLimiter};
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type DirectLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

type DeliveryResult<T> = std::result::Result<T, DeliveryError>;

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub max_queue_depth: usize,
    pub sends_per_minute: u32,
    pub send_burst: u32,
    pub max_send_attempts: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
}

impl DispatcherSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            max_queue_depth: config.max_queue_depth.max(1),
            sends_per_minute: config.sends_per_minute,
            send_burst: config.send_burst,
            max_send_attempts: config.max_send_attempts.max(1),
            retry_base: Duration::from_millis(config.send_retry_base_ms),
            retry_cap: Duration::from_millis(config.send_retry_cap_ms),
        }
    }

    fn quota(&self) -> Quota {
        let rate = NonZeroU32::new(self.sends_per_minute).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(self.send_burst).unwrap_or(NonZeroU32::MIN);
        Quota::per_minute(rate).allow_burst(burst)
    }

    fn retry_backoff(&self) -> ExponentialBackoff<backoff::SystemClock> {
        ExponentialBackoff {
            current_interval: self.retry_base,
            initial_interval: self.retry_base,
            max_interval: self.retry_cap,
            multiplier: 2.0,
            randomization_factor: 0.1,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

struct QueuedTask {
    outbox_id: i64,
    task: DeliveryTask,
}

#[derive(Default)]
struct LaneState {
    pending: VecDeque<QueuedTask>,
    disabled: bool,
    total_dropped: u64,
}

/// One destination's queue, token bucket and wakeup signal.
struct Lane {
    destination_id: DestinationId,
    state: Mutex<LaneState>,
    notify: Notify,
    limiter: DirectLimiter,
}

impl Lane {
    fn lock(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

enum Outcome {
    Delivered,
    Abandoned,
    DestinationDisabled,
    Interrupted,
}

struct Inner {
    db: SqlitePool,
    sender: Arc<dyn SendMessage>,
    registry: Arc<SubscriptionRegistry>,
    events: EventSink,
    settings: DispatcherSettings,
    lanes: Mutex<HashMap<DestinationId, Arc<Lane>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// Per-destination ordered delivery with a token-bucket limit.
///
/// Each destination has a single worker draining its queue front to back,
/// so items of one feed leave in the order they were enqueued. Every task
/// is written to the outbox before it becomes visible to the worker and
/// removed once sent or dropped.
#[derive(Clone)]
pub struct DeliveryDispatcher {
    inner: Arc<Inner>,
}

impl DeliveryDispatcher {
    pub fn new(
        db: &Database,
        sender: Arc<dyn SendMessage>,
        registry: Arc<SubscriptionRegistry>,
        events: EventSink,
        settings: DispatcherSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db: db.pool().clone(),
                sender,
                registry,
                events,
                settings,
                lanes: Mutex::new(HashMap::new()),
                workers: Mutex::new(Vec::new()),
                shutdown,
            }),
        }
    }

    /// Queue a translated item for delivery. Returns once the task is durable.
    pub async fn enqueue(&self, destination_id: &DestinationId, item: TranslatedItem) -> DeliveryResult<()> {
        let lane = self.lane(destination_id);
        if lane.lock().disabled {
            return Err(DeliveryError::DestinationDisabled(destination_id.clone()));
        }

        let task = DeliveryTask {
            destination_id: destination_id.clone(),
            item,
            enqueued_at: Utc::now(),
        };
        let outbox_id = self.inner.persist(&task).await?;

        let accepted = {
            let mut state = lane.lock();
            if state.disabled {
                None
            } else {
                debug!(
                    destination = %destination_id,
                    item = %task.item.item.item_id,
                    depth = state.pending.len() + 1,
                    "Enqueued delivery"
                );
                state.pending.push_back(QueuedTask { outbox_id, task });
                let dropped = self.inner.trim_overflow(&mut state);
                Some((dropped, state.total_dropped))
            }
        };

        // Disabled while the row was being written.
        let Some((dropped, total_dropped)) = accepted else {
            self.inner.delete_outbox(&[outbox_id]).await?;
            return Err(DeliveryError::DestinationDisabled(destination_id.clone()));
        };

        lane.notify.notify_one();
        self.inner.report_dropped(destination_id, dropped, total_dropped).await;
        Ok(())
    }

    /// Reload tasks left in the outbox by a previous run. Returns how many
    /// were queued.
    pub async fn restore(&self) -> DeliveryResult<usize> {
        let rows = sqlx::query("SELECT id, destination_id, payload FROM delivery_outbox ORDER BY id")
            .fetch_all(&self.inner.db)
            .await?;

        let mut restored = 0;
        let mut unreadable = Vec::new();
        let mut touched: HashMap<DestinationId, Arc<Lane>> = HashMap::new();

        for row in rows {
            let outbox_id: i64 = row.try_get("id")?;
            let payload: String = row.try_get("payload")?;
            let task: DeliveryTask = match serde_json::from_str(&payload) {
                Ok(task) => task,
                Err(e) => {
                    warn!(outbox_id, "Discarding unreadable outbox entry: {}", e);
                    unreadable.push(outbox_id);
                    continue;
                }
            };

            let lane = touched
                .entry(task.destination_id.clone())
                .or_insert_with(|| self.lane(&task.destination_id))
                .clone();
            lane.lock().pending.push_back(QueuedTask { outbox_id, task });
            restored += 1;
        }

        self.inner.delete_outbox(&unreadable).await?;

        for (destination_id, lane) in touched {
            let (dropped, total_dropped) = {
                let mut state = lane.lock();
                let dropped = self.inner.trim_overflow(&mut state);
                (dropped, state.total_dropped)
            };
            lane.notify.notify_one();
            self.inner.report_dropped(&destination_id, dropped, total_dropped).await;
        }

        if restored > 0 {
            info!("Restored {} pending deliveries from outbox", restored);
        }
        Ok(restored)
    }

    /// Drop the queued, not yet in-flight tasks of one feed.
    pub async fn discard_feed(&self, destination_id: &DestinationId, feed_url: &str) -> DeliveryResult<usize> {
        let Some(lane) = self.existing_lane(destination_id) else {
            return Ok(0);
        };

        let removed: Vec<i64> = {
            let mut state = lane.lock();
            let mut removed = Vec::new();
            state.pending.retain(|queued| {
                let keep = queued.task.item.item.feed_url != feed_url;
                if !keep {
                    removed.push(queued.outbox_id);
                }
                keep
            });
            removed
        };

        self.inner.delete_outbox(&removed).await?;
        if !removed.is_empty() {
            info!(destination = %destination_id, feed = %feed_url, "Discarded {} queued deliveries", removed.len());
        }
        Ok(removed.len())
    }

    /// Accept items for a destination again after it was disabled.
    pub fn reactivate(&self, destination_id: &DestinationId) {
        if let Some(lane) = self.existing_lane(destination_id) {
            let mut state = lane.lock();
            if state.disabled {
                state.disabled = false;
                info!(destination = %destination_id, "Destination reactivated");
            }
        }
    }

    pub fn queue_depth(&self, destination_id: &DestinationId) -> usize {
        self.existing_lane(destination_id)
            .map(|lane| lane.lock().pending.len())
            .unwrap_or(0)
    }

    pub fn is_disabled(&self, destination_id: &DestinationId) -> bool {
        self.existing_lane(destination_id)
            .map(|lane| lane.lock().disabled)
            .unwrap_or(false)
    }

    pub fn total_dropped(&self, destination_id: &DestinationId) -> u64 {
        self.existing_lane(destination_id)
            .map(|lane| lane.lock().total_dropped)
            .unwrap_or(0)
    }

    /// Stop all workers after their current send. Unsent tasks stay in the outbox.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let workers = std::mem::take(&mut *self.inner.lock_workers());
        for result in join_all(workers).await {
            if let Err(e) = result {
                error!("Delivery worker ended abnormally: {}", e);
            }
        }
        info!("Delivery dispatcher stopped");
    }

    fn existing_lane(&self, destination_id: &DestinationId) -> Option<Arc<Lane>> {
        self.inner.lock_lanes().get(destination_id).cloned()
    }

    fn lane(&self, destination_id: &DestinationId) -> Arc<Lane> {
        let mut lanes = self.inner.lock_lanes();
        if let Some(lane) = lanes.get(destination_id) {
            return lane.clone();
        }

        let lane = Arc::new(Lane {
            destination_id: destination_id.clone(),
            state: Mutex::new(LaneState::default()),
            notify: Notify::new(),
            limiter: RateLimiter::direct(self.inner.settings.quota()),
        });
        lanes.insert(destination_id.clone(), lane.clone());

        let worker = tokio::spawn(Inner::run_lane(self.inner.clone(), lane.clone()));
        self.inner.lock_workers().push(worker);
        debug!(destination = %destination_id, "Started delivery worker");
        lane
    }
}

impl Inner {
    fn lock_lanes(&self) -> MutexGuard<'_, HashMap<DestinationId, Arc<Lane>>> {
        self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn persist(&self, task: &DeliveryTask) -> DeliveryResult<i64> {
        let payload = serde_json::to_string(task)?;
        let id = sqlx::query(
            r#"
            INSERT INTO delivery_outbox (destination_id, feed_url, item_id, payload, enqueued_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(task.destination_id.as_str())
        .bind(&task.item.item.feed_url)
        .bind(&task.item.item.item_id)
        .bind(payload)
        .bind(to_millis(task.enqueued_at))
        .execute(&self.db)
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    async fn delete_outbox(&self, ids: &[i64]) -> DeliveryResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.db.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM delivery_outbox WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Evict the oldest pending tasks beyond the configured depth.
    fn trim_overflow(&self, state: &mut LaneState) -> Vec<i64> {
        let excess = state.pending.len().saturating_sub(self.settings.max_queue_depth);
        let dropped: Vec<i64> = state.pending.drain(..excess).map(|q| q.outbox_id).collect();
        state.total_dropped += dropped.len() as u64;
        dropped
    }

    async fn report_dropped(&self, destination_id: &DestinationId, dropped: Vec<i64>, total_dropped: u64) {
        if dropped.is_empty() {
            return;
        }
        warn!(
            destination = %destination_id,
            dropped = dropped.len(),
            total_dropped,
            "Delivery queue full, dropped oldest items"
        );
        if let Err(e) = self.delete_outbox(&dropped).await {
            error!(destination = %destination_id, "Failed to clear dropped outbox rows: {}", e);
        }
        self.events.emit(RelayEvent::ItemsDropped {
            destination_id: destination_id.clone(),
            dropped: dropped.len(),
            total_dropped,
        });
    }

    async fn run_lane(self: Arc<Self>, lane: Arc<Lane>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let next = lane.lock().pending.pop_front();
            let Some(queued) = next else {
                tokio::select! {
                    _ = lane.notify.notified() => {}
                    _ = self.shutdown.cancelled() => {}
                }
                continue;
            };

            let outbox_id = queued.outbox_id;
            match self.deliver(&lane, queued).await {
                Outcome::Delivered | Outcome::Abandoned => {
                    if let Err(e) = self.delete_outbox(&[outbox_id]).await {
                        error!(destination = %lane.destination_id, "Failed to clear outbox row: {}", e);
                    }
                }
                Outcome::DestinationDisabled => {}
                // The outbox row stays behind and is restored on the next start.
                Outcome::Interrupted => break,
            }
        }
        debug!(destination = %lane.destination_id, "Delivery worker stopped");
    }

    async fn deliver(&self, lane: &Lane, queued: QueuedTask) -> Outcome {
        let destination_id = &lane.destination_id;
        let item = &queued.task.item.item;
        let message = render(&queued.task.item);
        let mut backoff = self.settings.retry_backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;

            tokio::select! {
                _ = lane.limiter.until_ready() => {}
                _ = self.shutdown.cancelled() => return Outcome::Interrupted,
            }

            if lane.lock().disabled {
                return Outcome::Abandoned;
            }

            let error = match self.sender.send(destination_id, &message).await {
                Ok(()) => {
                    info!(
                        destination = %destination_id,
                        feed = %item.feed_url,
                        item = %item.item_id,
                        attempt,
                        "Delivered item"
                    );
                    return Outcome::Delivered;
                }
                Err(e) => e,
            };

            if error.is_permanent() {
                self.disable_destination(lane, &error).await;
                return Outcome::DestinationDisabled;
            }

            if attempt >= self.settings.max_send_attempts {
                warn!(
                    destination = %destination_id,
                    item = %item.item_id,
                    attempts = attempt,
                    "Giving up on delivery: {}",
                    error
                );
                self.events.emit(RelayEvent::DeliveryAbandoned {
                    destination_id: destination_id.clone(),
                    feed_url: item.feed_url.clone(),
                    item_id: item.item_id.clone(),
                    error: error.to_string(),
                });
                return Outcome::Abandoned;
            }

            let computed = backoff.next_backoff().unwrap_or(self.settings.retry_cap);
            let delay = match &error {
                SendError::RateLimited { retry_after: Some(after) } => *after,
                _ => computed,
            };
            debug!(
                destination = %destination_id,
                item = %item.item_id,
                attempt,
                "Send failed ({}), retrying in {:?}",
                error,
                delay
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => return Outcome::Interrupted,
            }
        }
    }

    /// Disable a destination after a permanent send error. Emits exactly one
    /// event no matter how many items were queued.
    async fn disable_destination(&self, lane: &Lane, error: &SendError) {
        let destination_id = &lane.destination_id;
        let discarded = {
            let mut state = lane.lock();
            if state.disabled {
                return;
            }
            state.disabled = true;
            let pending = state.pending.len();
            state.pending.clear();
            // Counting the item whose send failed.
            pending + 1
        };

        error!(destination = %destination_id, discarded, "Destination refused delivery permanently: {}", error);

        if let Err(e) = sqlx::query("DELETE FROM delivery_outbox WHERE destination_id = ?1")
            .bind(destination_id.as_str())
            .execute(&self.db)
            .await
        {
            error!(destination = %destination_id, "Failed to clear outbox: {}", e);
        }

        if let Err(e) = self.registry.disable_destination(destination_id).await {
            error!(destination = %destination_id, "Failed to disable subscriptions: {}", e);
        }

        self.events.emit(RelayEvent::DestinationDisabled {
            destination_id: destination_id.clone(),
            reason: error.to_string(),
            discarded,
        });
    }
}

/// Pending outbox rows for one destination, oldest first. Used for
/// inspection by the CLI.
pub async fn pending_outbox(db: &Database, destination_id: &DestinationId) -> DeliveryResult<Vec<(String, String, chrono::DateTime<Utc>)>> {
    let rows = sqlx::query("SELECT feed_url, item_id, enqueued_at FROM delivery_outbox WHERE destination_id = ?1 ORDER BY id")
        .bind(destination_id.as_str())
        .fetch_all(db.pool())
        .await?;

    rows.iter()
        .map(|row| {
            let enqueued_at: i64 = row.try_get("enqueued_at")?;
            Ok((row.try_get("feed_url")?, row.try_get("item_id")?, from_millis(enqueued_at)))
        })
        .collect()
}
