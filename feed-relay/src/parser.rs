use crate::dedup::fingerprint;
use crate::types::{FeedItem, FetchError};
use feed_rs::parser;
use scraper::{Html, Selector};
use std::collections::HashSet;
use tracing::debug;

/// Parse a raw feed document into items in document order.
///
/// Entries without a link are skipped; an entry's id falls back to a
/// content hash when the document carries none.
pub fn parse_feed(feed_url: &str, content: &[u8]) -> Result<Vec<FeedItem>, FetchError> {
    debug!("Parsing feed content ({} bytes) from {}", content.len(), feed_url);

    let feed = parser::parse(content).map_err(|e| FetchError::Malformed(format!("{}: {}", feed_url, e)))?;

    let mut seen_ids = HashSet::new();
    let mut items = Vec::with_capacity(feed.entries.len());

    for entry in feed.entries {
        let Some(link) = entry.links.first().map(|l| l.href.trim().to_string()) else {
            debug!("Skipping entry without link in {}", feed_url);
            continue;
        };

        let title = entry
            .title
            .map(|t| t.content.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Untitled".to_string());

        let raw_body = entry
            .summary
            .map(|s| s.content)
            .or_else(|| entry.content.and_then(|c| c.body))
            .unwrap_or_default();
        let (body, mut image_url) = clean_html(&raw_body);

        if image_url.is_none() {
            image_url = entry.media.iter().find_map(|media| {
                media
                    .thumbnails
                    .first()
                    .map(|t| t.image.uri.clone())
                    .or_else(|| media.content.iter().find_map(|c| c.url.as_ref().map(|u| u.to_string())))
            });
        }

        let item_id = fingerprint(Some(entry.id.as_str()), &title, &link);
        if !seen_ids.insert(item_id.clone()) {
            debug!("Skipping repeated entry {} in {}", item_id, feed_url);
            continue;
        }

        items.push(FeedItem {
            feed_url: feed_url.to_string(),
            item_id,
            title,
            body,
            published_at: entry.published.or(entry.updated),
            source_link: link,
            image_url,
        });
    }

    debug!("Parsed {} items from {}", items.len(), feed_url);
    Ok(items)
}

/// Strip markup from an HTML summary and pick its first image.
/// Plain-text input is returned unchanged.
pub fn clean_html(raw: &str) -> (String, Option<String>) {
    let trimmed = raw.trim();
    if !trimmed.starts_with('<') {
        return (trimmed.to_string(), None);
    }

    let fragment = Html::parse_fragment(trimmed);
    let text = fragment
        .root_element()
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let image = Selector::parse("img[src]").ok().and_then(|selector| {
        fragment
            .select(&selector)
            .filter_map(|img| img.value().attr("src"))
            .map(str::trim)
            .find(|src| !src.is_empty())
            .map(str::to_string)
    });

    (text, image)
}

/// Reorder a feed's items oldest first.
///
/// Sorting by publication time only when every item has one; otherwise the
/// document is assumed to list newest first and is reversed.
pub fn oldest_first(mut items: Vec<FeedItem>) -> Vec<FeedItem> {
    if !items.is_empty() && items.iter().all(|i| i.published_at.is_some()) {
        items.sort_by_key(|i| i.published_at);
    } else {
        items.reverse();
    }
    items
}
