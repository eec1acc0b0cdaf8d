#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use feed_relay::translation::Translator;
use feed_relay::{
    DestinationId, FeedItem, FetchError, FetchFeed, FormattedMessage, RelayConfig, SendError, SendMessage,
    TranslationError,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Fast timings: one interval minute is 50ms.
pub fn test_config() -> RelayConfig {
    RelayConfig {
        min_interval_minutes: 1,
        default_interval_minutes: 1,
        poll_unit_ms: 50,
        backoff_base_ms: 20,
        backoff_cap_ms: 200,
        failure_disable_threshold: 3,
        initial_backfill_items: 10,
        sends_per_minute: 600_000,
        send_burst: 100,
        max_send_attempts: 3,
        send_retry_base_ms: 5,
        send_retry_cap_ms: 50,
        breaker_failure_threshold: 2,
        breaker_cooldown_base_ms: 100,
        breaker_cooldown_cap_ms: 1_000,
        ..RelayConfig::default()
    }
}

pub fn published(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, minute, 0).unwrap()
}

pub fn item(feed_url: &str, id: &str, minute: u32) -> FeedItem {
    FeedItem {
        feed_url: feed_url.to_string(),
        item_id: format!("id:{}", id),
        title: id.to_string(),
        body: format!("Body of {}", id),
        published_at: Some(published(minute)),
        source_link: format!("https://news.example.com/{}", id),
        image_url: None,
    }
}

pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Default, Clone)]
struct FeedScript {
    items: Vec<FeedItem>,
    failure: Option<FetchError>,
    delay: Duration,
}

/// Fetch capability serving scripted documents.
#[derive(Default)]
pub struct ScriptedFetcher {
    feeds: Mutex<HashMap<String, FeedScript>>,
    calls: Mutex<HashMap<String, usize>>,
    completed: Mutex<HashMap<String, usize>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_items(&self, url: &str, items: Vec<FeedItem>) {
        self.feeds.lock().unwrap().entry(url.to_string()).or_default().items = items;
    }

    pub fn set_failure(&self, url: &str, failure: Option<FetchError>) {
        self.feeds.lock().unwrap().entry(url.to_string()).or_default().failure = failure;
    }

    pub fn set_delay(&self, url: &str, delay: Duration) {
        self.feeds.lock().unwrap().entry(url.to_string()).or_default().delay = delay;
    }

    /// Fetches started for a URL.
    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    /// Fetches that returned for a URL.
    pub fn completed(&self, url: &str) -> usize {
        self.completed.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl FetchFeed for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<FeedItem>, FetchError> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let script = self.feeds.lock().unwrap().get(url).cloned();

        let result = match script {
            None => Err(FetchError::Unreachable(format!("no such feed: {}", url))),
            Some(script) => {
                if !script.delay.is_zero() {
                    tokio::time::sleep(script.delay).await;
                }
                match script.failure {
                    Some(failure) => Err(failure),
                    None => Ok(script.items),
                }
            }
        };

        *self.completed.lock().unwrap().entry(url.to_string()).or_default() += 1;
        result
    }
}

/// Send capability recording every delivered message.
#[derive(Default)]
pub struct RecordingSender {
    delivered: Mutex<Vec<(DestinationId, FormattedMessage)>>,
    next_errors: Mutex<HashMap<DestinationId, VecDeque<SendError>>>,
    always: Mutex<HashMap<DestinationId, SendError>>,
    attempts: AtomicUsize,
    delay: Mutex<Duration>,
    held: AtomicBool,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, destination: &DestinationId, error: SendError) {
        self.next_errors
            .lock()
            .unwrap()
            .entry(destination.clone())
            .or_default()
            .push_back(error);
    }

    pub fn fail_always(&self, destination: &DestinationId, error: SendError) {
        self.always.lock().unwrap().insert(destination.clone(), error);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Block sends until released.
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered_to(&self, destination: &DestinationId) -> Vec<FormattedMessage> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _)| d == destination)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn titles_for(&self, destination: &DestinationId) -> Vec<String> {
        self.delivered_to(destination).into_iter().map(|m| m.title).collect()
    }

    pub fn total_delivered(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

#[async_trait]
impl SendMessage for RecordingSender {
    async fn send(&self, destination: &DestinationId, message: &FormattedMessage) -> Result<(), SendError> {
        while self.held.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.always.lock().unwrap().get(destination).cloned() {
            return Err(error);
        }
        let scripted = self
            .next_errors
            .lock()
            .unwrap()
            .get_mut(destination)
            .and_then(|q| q.pop_front());
        if let Some(error) = scripted {
            return Err(error);
        }

        self.delivered
            .lock()
            .unwrap()
            .push((destination.clone(), message.clone()));
        Ok(())
    }
}

/// Translator that prefixes the language code, or fails as scripted.
pub struct ScriptedTranslator {
    name: String,
    failure: Mutex<Option<TranslationError>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl ScriptedTranslator {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            failure: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &str, error: TranslationError) -> Self {
        let translator = Self::new(name);
        translator.set_failure(Some(error));
        translator
    }

    pub fn set_failure(&self, failure: Option<TranslationError>) {
        *self.failure.lock().unwrap() = failure;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Translator for ScriptedTranslator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn translate(&self, text: &str, target_language: &str) -> Result<String, TranslationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(format!("[{}] {}", target_language, text))
    }
}

/// Answer exactly one HTTP request on a local port. Resolves to the raw
/// request text.
pub async fn serve_once(status: u16, headers: &[(&str, &str)], body: &str) -> (String, JoinHandle<String>) {
    let (base_url, handle) = serve_sequence(vec![response(status, headers, body)]).await;
    let handle = tokio::spawn(async move { handle.await.unwrap().remove(0) });
    (base_url, handle)
}

pub fn response(status: u16, headers: &[(&str, &str)], body: &str) -> String {
    let mut response = format!(
        "HTTP/1.1 {} Scripted\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        body.len()
    );
    for (name, value) in headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str("\r\n");
    response.push_str(body);
    response
}

/// Answer one connection per scripted response, in order. Resolves to the
/// raw requests received.
pub async fn serve_sequence(responses: Vec<String>) -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let mut requests = Vec::new();
        for response in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];

            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }

            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            requests.push(String::from_utf8_lossy(&request).to_string());
        }
        requests
    });

    (format!("http://{}", addr), handle)
}

fn request_complete(raw: &[u8]) -> bool {
    let text = String::from_utf8_lossy(raw);
    let Some(header_end) = text.find("\r\n\r\n") else {
        return false;
    };
    let content_length = text[..header_end]
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    raw.len() >= header_end + 4 + content_length
}
