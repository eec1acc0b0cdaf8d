mod common;

use common::{init_tracing, item, test_config, wait_until, RecordingSender, ScriptedFetcher, ScriptedTranslator};
use feed_relay::translation::Translator;
use feed_relay::{
    DestinationId, FeedRelay, FetchError, RelayConfig, RelayEvent, RemovalPolicy, SendError, SubscriptionKey,
    TranslationError,
};
use std::sync::Arc;
use std::time::Duration;

const FEED: &str = "https://www.ft.com/rss/home";
const SLOW_FEED: &str = "https://slow.example.com/rss";
const WAIT: Duration = Duration::from_secs(5);

struct Running {
    relay: FeedRelay,
    fetcher: Arc<ScriptedFetcher>,
    sender: Arc<RecordingSender>,
}

async fn build(config: RelayConfig, database_url: &str, translators: Vec<Arc<dyn Translator>>) -> Running {
    init_tracing();
    let fetcher = Arc::new(ScriptedFetcher::new());
    let sender = Arc::new(RecordingSender::new());
    let relay = FeedRelay::builder(config)
        .database_url(database_url)
        .fetcher(fetcher.clone())
        .sender(sender.clone())
        .translators(translators)
        .build()
        .await
        .unwrap();
    Running { relay, fetcher, sender }
}

async fn relay(config: RelayConfig) -> Running {
    build(config, "sqlite::memory:", Vec::new()).await
}

async fn next_event(relay: &FeedRelay) -> RelayEvent {
    tokio::time::timeout(WAIT, relay.next_event())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_new_items_are_delivered_oldest_first_and_only_once() {
    let r = relay(test_config()).await;
    let dest = DestinationId::from("chan");

    // Feeds list newest first.
    r.fetcher
        .set_items(FEED, vec![item(FEED, "C", 3), item(FEED, "A", 1), item(FEED, "B", 2)]);
    r.relay.add_subscription(&dest, FEED).await.unwrap();
    r.relay.start().await.unwrap();

    assert!(wait_until(WAIT, || async { r.sender.total_delivered() == 3 }).await);
    assert_eq!(r.sender.titles_for(&dest), vec!["A", "B", "C"]);

    // Several more polls of the same document deliver nothing new.
    let polls = r.fetcher.calls(FEED);
    assert!(wait_until(WAIT, || async { r.fetcher.calls(FEED) >= polls + 3 }).await);
    assert_eq!(r.sender.total_delivered(), 3);

    r.fetcher.set_items(
        FEED,
        vec![item(FEED, "D", 4), item(FEED, "C", 3), item(FEED, "A", 1), item(FEED, "B", 2)],
    );
    assert!(wait_until(WAIT, || async { r.sender.total_delivered() == 4 }).await);
    assert_eq!(r.sender.titles_for(&dest), vec!["A", "B", "C", "D"]);

    r.relay.shutdown().await;
}

#[tokio::test]
async fn test_slow_feed_does_not_delay_other_subscriptions() {
    let r = relay(test_config()).await;
    let dest = DestinationId::from("chan");

    r.fetcher.set_items(SLOW_FEED, vec![item(SLOW_FEED, "slow", 1)]);
    r.fetcher.set_delay(SLOW_FEED, Duration::from_secs(3));
    r.fetcher.set_items(FEED, vec![item(FEED, "fast", 1)]);

    r.relay.add_subscription(&dest, SLOW_FEED).await.unwrap();
    r.relay.add_subscription(&dest, FEED).await.unwrap();
    r.relay.start().await.unwrap();

    assert!(wait_until(Duration::from_secs(1), || async { r.sender.total_delivered() == 1 }).await);
    assert_eq!(r.sender.titles_for(&dest), vec!["fast"]);
    assert_eq!(r.fetcher.completed(SLOW_FEED), 0);

    r.relay.shutdown().await;
}

#[tokio::test]
async fn test_repeated_fetch_failures_disable_subscription() {
    let r = relay(test_config()).await;
    let dest = DestinationId::from("chan");

    r.fetcher.set_failure(FEED, Some(FetchError::Unreachable("connection refused".into())));
    r.relay.add_subscription(&dest, FEED).await.unwrap();
    r.relay.start().await.unwrap();

    match next_event(&r.relay).await {
        RelayEvent::SubscriptionDisabled {
            destination_id,
            feed_url,
            consecutive_failures,
            last_error,
        } => {
            assert_eq!(destination_id, dest);
            assert_eq!(feed_url, FEED);
            assert_eq!(consecutive_failures, 3);
            assert!(last_error.contains("connection refused"));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let subscriptions = r.relay.list_subscriptions(&dest).await.unwrap();
    assert!(!subscriptions[0].enabled);
    assert_eq!(subscriptions[0].consecutive_failures, 3);

    assert!(wait_until(WAIT, || async { r.relay.active_pairs().await.is_empty() }).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(r.fetcher.calls(FEED), 3);

    r.relay.shutdown().await;
}

#[tokio::test]
async fn test_failure_count_resets_after_success() {
    let config = RelayConfig {
        failure_disable_threshold: 50,
        ..test_config()
    };
    let r = relay(config).await;
    let dest = DestinationId::from("chan");

    r.fetcher.set_failure(FEED, Some(FetchError::Timeout));
    r.relay.add_subscription(&dest, FEED).await.unwrap();
    r.relay.start().await.unwrap();

    let key = SubscriptionKey::new(dest.clone(), FEED);
    assert!(
        wait_until(WAIT, || async {
            r.relay.registry().get(&key).await.unwrap().unwrap().consecutive_failures >= 2
        })
        .await
    );
    r.fetcher.set_failure(FEED, None);

    assert!(
        wait_until(WAIT, || async {
            let subscription = r.relay.registry().get(&key).await.unwrap().unwrap();
            subscription.consecutive_failures == 0 && subscription.enabled
        })
        .await
    );
    assert!(r.relay.try_next_event().await.is_none());

    r.relay.shutdown().await;
}

#[tokio::test]
async fn test_interval_change_applies_after_current_cycle() {
    let r = relay(test_config()).await;
    let dest = DestinationId::from("chan");

    r.fetcher.set_items(FEED, vec![item(FEED, "A", 1)]);
    r.relay.add_subscription(&dest, FEED).await.unwrap();
    r.relay.start().await.unwrap();
    assert!(wait_until(WAIT, || async { r.fetcher.calls(FEED) >= 2 }).await);

    // 100 "minutes" of 50ms each.
    r.relay.set_poll_interval(&dest, FEED, 100).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let settled = r.fetcher.calls(FEED);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(r.fetcher.calls(FEED), settled);

    r.relay.shutdown().await;
}

#[tokio::test]
async fn test_first_poll_only_backfills_recent_items() {
    let config = RelayConfig {
        initial_backfill_items: 2,
        ..test_config()
    };
    let r = relay(config).await;
    let dest = DestinationId::from("chan");

    r.fetcher.set_items(FEED, (1..=5).rev().map(|m| item(FEED, &format!("n{}", m), m)).collect());
    r.relay.add_subscription(&dest, FEED).await.unwrap();

    let report = r.relay.poll_now(&dest, FEED).await.unwrap();
    assert_eq!(report.fetched, 5);
    assert_eq!(report.backfill_skipped, 3);
    assert_eq!(report.enqueued, 2);

    assert!(wait_until(WAIT, || async { r.sender.total_delivered() == 2 }).await);
    assert_eq!(r.sender.titles_for(&dest), vec!["n4", "n5"]);

    // Later polls are not limited.
    r.fetcher.set_items(
        FEED,
        (1..=8).rev().map(|m| item(FEED, &format!("n{}", m), m)).collect(),
    );
    let report = r.relay.poll_now(&dest, FEED).await.unwrap();
    assert_eq!(report.enqueued, 3);
    assert_eq!(report.backfill_skipped, 0);
    assert!(wait_until(WAIT, || async { r.sender.total_delivered() == 5 }).await);
    assert_eq!(r.sender.titles_for(&dest), vec!["n4", "n5", "n6", "n7", "n8"]);

    r.relay.shutdown().await;
}

#[tokio::test]
async fn test_removed_subscription_stops_polling() {
    let r = relay(test_config()).await;
    let dest = DestinationId::from("chan");

    r.fetcher.set_items(FEED, vec![item(FEED, "A", 1)]);
    r.relay.add_subscription(&dest, FEED).await.unwrap();
    r.relay.start().await.unwrap();
    assert!(wait_until(WAIT, || async { r.fetcher.calls(FEED) >= 1 }).await);
    assert_eq!(r.relay.active_pairs().await, vec![SubscriptionKey::new(dest.clone(), FEED)]);

    r.relay.remove_subscription(&dest, FEED).await.unwrap();
    assert!(r.relay.pair_state(&dest, FEED).await.is_none());
    assert!(r.relay.active_pairs().await.is_empty());

    // At most the fetch already in flight completes.
    let at_removal = r.fetcher.calls(FEED);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(r.fetcher.calls(FEED) <= at_removal + 1);
    assert!(r.relay.list_subscriptions(&dest).await.unwrap().is_empty());

    // Subscribing again starts a fresh pair.
    r.relay.add_subscription(&dest, FEED).await.unwrap();
    assert!(wait_until(WAIT, || async { r.relay.active_pairs().await.len() == 1 }).await);

    r.relay.shutdown().await;
}

#[tokio::test]
async fn test_discarding_removal_wins_over_translation_in_flight() {
    let slow = Arc::new(ScriptedTranslator::new("google"));
    slow.set_delay(Duration::from_millis(300));
    let config = RelayConfig {
        removal_policy: RemovalPolicy::Discard,
        ..test_config()
    };
    let r = build(config, "sqlite::memory:", vec![slow.clone() as Arc<dyn Translator>]).await;
    let dest = DestinationId::from("chan");

    r.fetcher.set_items(FEED, vec![item(FEED, "A", 1)]);
    r.relay.add_subscription(&dest, FEED).await.unwrap();
    r.relay.start().await.unwrap();
    assert!(wait_until(WAIT, || async { slow.calls() >= 1 }).await);

    r.relay.remove_subscription(&dest, FEED).await.unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert_eq!(r.sender.total_delivered(), 0);
    assert_eq!(r.relay.queue_depth(&dest), 0);
    // Not marked seen: subscribing again would deliver it.
    assert!(!r
        .relay
        .dedup()
        .has_seen(&SubscriptionKey::new(dest.clone(), FEED), "id:A")
        .await
        .unwrap());

    r.relay.shutdown().await;
}

#[tokio::test]
async fn test_register_destination_subscribes_default_feeds() {
    let config = RelayConfig {
        default_feeds: vec![FEED.to_string(), SLOW_FEED.to_string()],
        ..test_config()
    };
    let r = relay(config).await;
    let dest = DestinationId::from("new-channel");

    let added = r.relay.register_destination(&dest).await.unwrap();
    assert_eq!(added.len(), 2);
    assert!(added.iter().all(|s| s.target_language == "zh"));

    // Registering twice is harmless.
    assert!(r.relay.register_destination(&dest).await.unwrap().is_empty());
    assert_eq!(r.relay.list_subscriptions(&dest).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_restart_does_not_redeliver() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("relay.db").display());
    let dest = DestinationId::from("chan");
    let first_items = vec![item(FEED, "B", 2), item(FEED, "A", 1)];

    let first = build(test_config(), &url, Vec::new()).await;
    first.fetcher.set_items(FEED, first_items.clone());
    first.relay.add_subscription(&dest, FEED).await.unwrap();
    first.relay.start().await.unwrap();
    assert!(wait_until(WAIT, || async { first.sender.total_delivered() == 2 }).await);
    first.relay.shutdown().await;

    let second = build(test_config(), &url, Vec::new()).await;
    let mut items = vec![item(FEED, "C", 3)];
    items.extend(first_items);
    second.fetcher.set_items(FEED, items);
    second.relay.start().await.unwrap();

    assert!(wait_until(WAIT, || async { second.sender.total_delivered() == 1 }).await);
    assert!(wait_until(WAIT, || async { second.fetcher.calls(FEED) >= 3 }).await);
    assert_eq!(second.sender.titles_for(&dest), vec!["C"]);

    second.relay.shutdown().await;
}

#[tokio::test]
async fn test_translation_falls_back_and_flags_untranslated() {
    let broken = Arc::new(ScriptedTranslator::failing(
        "google",
        TranslationError::Unavailable("HTTP 500".into()),
    ));
    let working = Arc::new(ScriptedTranslator::new("deepl"));
    let r = build(
        test_config(),
        "sqlite::memory:",
        vec![broken.clone() as Arc<dyn Translator>, working.clone()],
    )
    .await;

    let translated = DestinationId::from("translated");
    let german = DestinationId::from("german");
    r.fetcher.set_items(FEED, vec![item(FEED, "A", 1)]);
    r.relay.add_subscription(&translated, FEED).await.unwrap();
    r.relay.set_target_language(&german, "de").await.unwrap();
    r.relay.add_subscription(&german, FEED).await.unwrap();
    r.relay.start().await.unwrap();

    assert!(wait_until(WAIT, || async { r.sender.total_delivered() == 2 }).await);
    let message = &r.sender.delivered_to(&translated)[0];
    assert_eq!(message.title, "[zh] A");
    assert_eq!(message.summary, "[zh] Body of A");
    assert!(!message.untranslated);
    assert_eq!(r.sender.titles_for(&german), vec!["[de] A"]);
    r.relay.shutdown().await;

    // Every provider down: the item still goes out, in its original language.
    let r = build(
        test_config(),
        "sqlite::memory:",
        vec![Arc::new(ScriptedTranslator::failing(
            "google",
            TranslationError::RateLimited("429".into()),
        )) as Arc<dyn Translator>],
    )
    .await;
    r.fetcher.set_items(FEED, vec![item(FEED, "A", 1)]);
    r.relay.add_subscription(&translated, FEED).await.unwrap();
    r.relay.start().await.unwrap();

    assert!(wait_until(WAIT, || async { r.sender.total_delivered() == 1 }).await);
    let message = &r.sender.delivered_to(&translated)[0];
    assert_eq!(message.title, "A");
    assert!(message.untranslated);
    r.relay.shutdown().await;
}

#[tokio::test]
async fn test_refused_destination_stops_its_pairs() {
    let r = relay(test_config()).await;
    let dest = DestinationId::from("deleted-channel");

    r.sender.fail_always(&dest, SendError::Gone("Unknown Channel".into()));
    r.fetcher.set_items(FEED, vec![item(FEED, "B", 2), item(FEED, "A", 1)]);
    r.fetcher.set_items(SLOW_FEED, vec![item(SLOW_FEED, "S", 1)]);
    r.relay.add_subscription(&dest, FEED).await.unwrap();
    r.relay.add_subscription(&dest, SLOW_FEED).await.unwrap();
    r.relay.start().await.unwrap();

    match next_event(&r.relay).await {
        RelayEvent::DestinationDisabled { destination_id, .. } => assert_eq!(destination_id, dest),
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(r.relay.is_destination_disabled(&dest));

    assert!(wait_until(WAIT, || async { r.relay.active_pairs().await.is_empty() }).await);
    assert!(r
        .relay
        .list_subscriptions(&dest)
        .await
        .unwrap()
        .iter()
        .all(|s| !s.enabled));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(r.relay.try_next_event().await.is_none());

    r.relay.shutdown().await;
}
