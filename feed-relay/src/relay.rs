use crate::config::{RelayConfig, RemovalPolicy};
use crate::db::Database;
use crate::dedup::DedupStore;
use crate::dispatcher::{DeliveryDispatcher, DispatcherSettings};
use crate::events::{EventSink, EventStream};
use crate::fetcher::HttpFetcher;
use crate::registry::SubscriptionRegistry;
use crate::scheduler::{PairState, PollContext, PollError, PollReport, Scheduler, SchedulerSettings};
use crate::translation::{BreakerPolicy, TranslationCache, TranslationGateway, Translator};
use crate::types::{
    DestinationId, FetchFeed, RegistryError, RelayError, RelayEvent, Result, SendMessage, Subscription, SubscriptionKey,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Assembles a [`FeedRelay`] from its capabilities.
pub struct FeedRelayBuilder {
    config: RelayConfig,
    database_url: String,
    fetcher: Option<Arc<dyn FetchFeed>>,
    sender: Option<Arc<dyn SendMessage>>,
    translators: Vec<Arc<dyn Translator>>,
}

impl FeedRelayBuilder {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            database_url: "sqlite::memory:".to_string(),
            fetcher: None,
            sender: None,
            translators: Vec::new(),
        }
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Defaults to [`HttpFetcher`] when not set.
    pub fn fetcher(mut self, fetcher: Arc<dyn FetchFeed>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn sender(mut self, sender: Arc<dyn SendMessage>) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Append a provider; providers are tried in the order added.
    pub fn translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translators.push(translator);
        self
    }

    pub fn translators(mut self, translators: Vec<Arc<dyn Translator>>) -> Self {
        self.translators.extend(translators);
        self
    }

    pub async fn build(self) -> Result<FeedRelay> {
        self.config.validate()?;

        let sender = self
            .sender
            .ok_or_else(|| RelayError::Config("no send capability configured".into()))?;
        let fetcher: Arc<dyn FetchFeed> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(self.config.fetch.clone())?),
        };

        let db = Database::connect(&self.database_url).await?;
        let registry = Arc::new(SubscriptionRegistry::new(&db, &self.config));
        let dedup = DedupStore::new(&db);
        let gateway = Arc::new(
            TranslationGateway::new(self.translators, BreakerPolicy::from_config(&self.config))
                .with_cache(TranslationCache::new(&db)),
        );

        let shutdown = CancellationToken::new();
        let (events, stream) = EventSink::channel();

        let dispatcher = DeliveryDispatcher::new(
            &db,
            sender,
            registry.clone(),
            events.clone(),
            DispatcherSettings::from_config(&self.config),
            shutdown.child_token(),
        );

        let scheduler = Scheduler::new(
            PollContext {
                registry: registry.clone(),
                dedup: dedup.clone(),
                fetcher,
                gateway,
                dispatcher: dispatcher.clone(),
                events,
                settings: SchedulerSettings::from_config(&self.config),
            },
            shutdown.child_token(),
        );

        Ok(FeedRelay {
            config: self.config,
            db,
            registry,
            dedup,
            dispatcher,
            scheduler,
            events: Mutex::new(stream),
            shutdown,
            started: AtomicBool::new(false),
            purge_task: std::sync::Mutex::new(None),
        })
    }
}

/// The relay core: registry commands on one side, running pipeline on the other.
pub struct FeedRelay {
    config: RelayConfig,
    db: Database,
    registry: Arc<SubscriptionRegistry>,
    dedup: DedupStore,
    dispatcher: DeliveryDispatcher,
    scheduler: Scheduler,
    events: Mutex<EventStream>,
    shutdown: CancellationToken,
    started: AtomicBool,
    purge_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl FeedRelay {
    pub fn builder(config: RelayConfig) -> FeedRelayBuilder {
        FeedRelayBuilder::new(config)
    }

    /// Restore pending deliveries, then start every enabled polling pair and
    /// the fingerprint retention task.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let restored = self.dispatcher.restore().await?;
        let pairs = self.scheduler.start().await?;

        let dedup = self.dedup.clone();
        let retention = self.config.dedup_retention();
        let every = self.config.dedup_purge_interval();
        let cancel = self.shutdown.child_token();
        let purge = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = dedup.purge_older_than(retention).await {
                            error!("Fingerprint purge failed: {}", e);
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
        *self.purge_task.lock().unwrap_or_else(|p| p.into_inner()) = Some(purge);

        info!(restored, pairs, "Feed relay started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("Shutting down feed relay");
        self.shutdown.cancel();
        self.scheduler.shutdown().await;
        self.dispatcher.shutdown().await;

        let purge = self.purge_task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(purge) = purge {
            if let Err(e) = purge.await {
                warn!("Purge task ended abnormally: {}", e);
            }
        }
        self.db.close().await;
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    /// Create a destination with the default language and subscribe it to
    /// the configured default feeds. Returns the subscriptions created.
    pub async fn register_destination(&self, destination_id: &DestinationId) -> Result<Vec<Subscription>> {
        self.registry.ensure_destination(destination_id).await?;

        let mut added = Vec::new();
        for feed_url in &self.config.default_feeds {
            match self.add_subscription(destination_id, feed_url).await {
                Ok(subscription) => added.push(subscription),
                Err(RelayError::Registry(RegistryError::DuplicateSubscription { .. })) => {}
                Err(e) => warn!(destination = %destination_id, feed = %feed_url, "Skipping default feed: {}", e),
            }
        }

        info!(destination = %destination_id, added = added.len(), "Registered destination");
        Ok(added)
    }

    pub async fn add_subscription(&self, destination_id: &DestinationId, feed_url: &str) -> Result<Subscription> {
        let subscription = self.registry.add_subscription(destination_id, feed_url).await?;
        self.dispatcher.reactivate(destination_id);
        if self.is_started() {
            self.scheduler.ensure_pair(subscription.key()).await;
        }
        Ok(subscription)
    }

    /// Stop polling the feed for this destination. Items already queued are
    /// delivered or discarded per `removal_policy`.
    pub async fn remove_subscription(&self, destination_id: &DestinationId, feed_url: &str) -> Result<()> {
        let key = SubscriptionKey::new(destination_id.clone(), feed_url);
        self.registry.remove_subscription(destination_id, &key.feed_url).await?;
        self.scheduler.cancel_pair(&key).await;

        if self.config.removal_policy == RemovalPolicy::Discard {
            let discarded = self.dispatcher.discard_feed(destination_id, &key.feed_url).await?;
            debug!(destination = %destination_id, feed = %key.feed_url, discarded, "Removal discarded queued items");
        }
        Ok(())
    }

    pub async fn set_target_language(&self, destination_id: &DestinationId, language: &str) -> Result<u64> {
        Ok(self.registry.set_target_language(destination_id, language).await?)
    }

    /// Takes effect when the pair next becomes idle.
    pub async fn set_poll_interval(&self, destination_id: &DestinationId, feed_url: &str, minutes: u32) -> Result<()> {
        Ok(self.registry.set_poll_interval(destination_id, feed_url, minutes).await?)
    }

    pub async fn list_subscriptions(&self, destination_id: &DestinationId) -> Result<Vec<Subscription>> {
        Ok(self.registry.list_subscriptions(destination_id).await?)
    }

    /// Wait for the next notification for the command surface.
    pub async fn next_event(&self) -> Option<RelayEvent> {
        self.events.lock().await.recv().await
    }

    pub async fn try_next_event(&self) -> Option<RelayEvent> {
        self.events.lock().await.try_recv().ok()
    }

    /// Run one poll cycle right away, outside the pair's timer.
    pub async fn poll_now(&self, destination_id: &DestinationId, feed_url: &str) -> std::result::Result<PollReport, PollError> {
        self.scheduler
            .poll_once(&SubscriptionKey::new(destination_id.clone(), feed_url))
            .await
    }

    pub async fn pair_state(&self, destination_id: &DestinationId, feed_url: &str) -> Option<PairState> {
        self.scheduler
            .pair_state(&SubscriptionKey::new(destination_id.clone(), feed_url))
            .await
    }

    pub async fn active_pairs(&self) -> Vec<SubscriptionKey> {
        self.scheduler.active_pairs().await
    }

    pub fn queue_depth(&self, destination_id: &DestinationId) -> usize {
        self.dispatcher.queue_depth(destination_id)
    }

    pub fn is_destination_disabled(&self, destination_id: &DestinationId) -> bool {
        self.dispatcher.is_disabled(destination_id)
    }

    pub async fn purge_expired_fingerprints(&self) -> Result<u64> {
        self.dedup.purge_older_than(self.config.dedup_retention()).await
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn dedup(&self) -> &DedupStore {
        &self.dedup
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}
