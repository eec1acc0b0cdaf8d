use crate::config::FetchConfig;
use crate::parser::parse_feed;
use crate::types::{FeedItem, FetchError, FetchFeed, RelayError, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Client, Response, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
struct Validators {
    etag: Option<String>,
    last_modified: Option<String>,
}

impl Validators {
    fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Last document parsed for a URL, replayed when the origin answers 304.
#[derive(Debug, Clone)]
struct CachedFeed {
    validators: Validators,
    items: Vec<FeedItem>,
}

/// Fetch capability over HTTP.
///
/// Remembers `ETag`/`Last-Modified` per URL together with the items parsed
/// from that response. A 304 replays those items, so every subscriber of the
/// URL sees the full document and its own dedup store does the filtering.
/// Never retries; the scheduler owns retry policy.
pub struct HttpFetcher {
    client: Client,
    config: FetchConfig,
    cache: Arc<RwLock<HashMap<String, CachedFeed>>>,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(RelayError::Http)?;

        Ok(Self {
            client,
            config,
            cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn max_bytes(&self) -> u64 {
        self.config.max_feed_size_mb as u64 * 1024 * 1024
    }

    async fn fetch_with_conditional_headers(&self, url: &str) -> std::result::Result<Response, FetchError> {
        let cached = self
            .cache
            .read()
            .await
            .get(url)
            .map(|feed| feed.validators.clone())
            .unwrap_or_default();
        self.send(url, &cached).await
    }

    async fn send(&self, url: &str, validators: &Validators) -> std::result::Result<Response, FetchError> {
        let mut request = self.client.get(url);

        if let Some(etag) = &validators.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &validators.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        request.send().await.map_err(classify)
    }

    async fn cached_items(&self, url: &str) -> Option<Vec<FeedItem>> {
        self.cache.read().await.get(url).map(|feed| feed.items.clone())
    }

    /// Stored only once the body parsed, so a broken document is refetched in full.
    async fn remember(&self, url: &str, validators: Validators, items: &[FeedItem]) {
        let mut cache = self.cache.write().await;
        if validators.is_empty() {
            cache.remove(url);
        } else {
            cache.insert(
                url.to_string(),
                CachedFeed {
                    validators,
                    items: items.to_vec(),
                },
            );
        }
    }
}

#[async_trait]
impl FetchFeed for HttpFetcher {
    async fn fetch(&self, url: &str) -> std::result::Result<Vec<FeedItem>, FetchError> {
        let start_time = Instant::now();
        debug!("Fetching feed: {}", url);

        let mut response = self.fetch_with_conditional_headers(url).await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            if let Some(items) = self.cached_items(url).await {
                debug!("Feed not modified: {} ({} cached items)", url, items.len());
                return Ok(items);
            }
            // Cache entry dropped between request and answer.
            debug!("Feed not modified but nothing cached, refetching: {}", url);
            response = self.send(url, &Validators::default()).await?;
        }
        let status = response.status();

        if !status.is_success() {
            warn!("Feed {} answered HTTP {}", url, status);
            return Err(FetchError::Unreachable(format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            )));
        }

        if let Some(content_length) = response.content_length() {
            if content_length > self.max_bytes() {
                return Err(FetchError::Malformed(format!(
                    "feed too large: {} bytes (limit {}MB)",
                    content_length, self.config.max_feed_size_mb
                )));
            }
        }

        let validators = validators_of(&response);
        let body = response.bytes().await.map_err(classify)?;
        if body.len() as u64 > self.max_bytes() {
            return Err(FetchError::Malformed(format!(
                "feed too large: {} bytes (limit {}MB)",
                body.len(),
                self.config.max_feed_size_mb
            )));
        }

        let items = parse_feed(url, &body)?;
        self.remember(url, validators, &items).await;

        info!(
            "Fetched feed: {} ({} bytes, {} items, {}ms)",
            url,
            body.len(),
            items.len(),
            start_time.elapsed().as_millis()
        );
        Ok(items)
    }
}

fn validators_of(response: &Response) -> Validators {
    let header = |name: HeaderName| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    Validators {
        etag: header(ETAG),
        last_modified: header(LAST_MODIFIED),
    }
}

fn classify(error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout
    } else if error.is_decode() || error.is_body() {
        FetchError::Malformed(error.to_string())
    } else {
        FetchError::Unreachable(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_default_config() {
        let fetcher = HttpFetcher::new(FetchConfig::default()).unwrap();
        assert_eq!(fetcher.max_bytes(), 10 * 1024 * 1024);
    }

    #[tokio::test]
    async fn unreachable_host_is_a_typed_error() {
        let fetcher = HttpFetcher::new(FetchConfig {
            timeout_seconds: 2,
            ..FetchConfig::default()
        })
        .unwrap();

        // Port 9 on loopback refuses connections.
        let result = fetcher.fetch("http://127.0.0.1:9/feed.xml").await;
        assert!(matches!(result, Err(FetchError::Unreachable(_)) | Err(FetchError::Timeout)));
    }
}
