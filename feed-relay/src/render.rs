use crate::types::{FormattedMessage, TranslatedItem};
use url::Url;

/// Chat platforms cap a single embed field at this many characters.
pub const MAX_SUMMARY_CHARS: usize = 1024;

const ELLIPSIS: &str = "...";

/// (domain, Chinese name, English name)
const PUBLISHERS: &[(&str, &str, &str)] = &[
    ("wsj.com", "华尔街日报", "The Wall Street Journal"),
    ("a.dj.com", "华尔街日报", "The Wall Street Journal"),
    ("foreignaffairs.com", "外交事务", "Foreign Affairs"),
    ("ft.com", "金融时报", "Financial Times"),
    ("reuters.com", "路透社", "Reuters"),
    ("reutersagency.com", "路透社", "Reuters"),
    ("theatlantic.com", "大西洋月刊", "The Atlantic"),
    ("economist.com", "经济学人", "The Economist"),
    ("nytimes.com", "纽约时报", "The New York Times"),
    ("bloomberg.com", "彭博社", "Bloomberg"),
    ("theconversation.com", "对话", "The Conversation"),
    ("nautil.us", "鹦鹉螺", "Nautilus"),
    ("longreads.com", "长读", "Longreads"),
    ("eff.org", "电子前哨基金会", "Electronic Frontier Foundation"),
    ("cloudflare.com", "Cloudflare 博客", "The Cloudflare Blog"),
];

/// Build the platform-neutral message for a translated item.
pub fn render(translated: &TranslatedItem) -> FormattedMessage {
    let item = &translated.item;
    FormattedMessage {
        title: translated.translated_title.clone(),
        link: item.source_link.clone(),
        summary: truncate(&translated.translated_body, MAX_SUMMARY_CHARS),
        source: source_name(&item.source_link, &translated.language),
        published: item
            .published_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "No date".to_string()),
        image_url: item.image_url.clone(),
        untranslated: translated.translation_failed,
    }
}

/// Human publisher name for a link, localised for Chinese destinations,
/// falling back to the bare host.
pub fn source_name(link: &str, language: &str) -> String {
    let Some(host) = Url::parse(link).ok().and_then(|u| u.host_str().map(str::to_lowercase)) else {
        return "Unknown source".to_string();
    };

    let known = PUBLISHERS
        .iter()
        .find(|(domain, _, _)| host == *domain || host.ends_with(&format!(".{}", domain)));

    match known {
        Some((_, zh, _)) if language.starts_with("zh") => zh.to_string(),
        Some((_, _, en)) => en.to_string(),
        None => host.strip_prefix("www.").unwrap_or(&host).to_string(),
    }
}

/// Cut to at most `max` characters, marking the cut with an ellipsis.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(ELLIPSIS.len());
    let mut cut: String = text.chars().take(keep).collect();
    cut.push_str(ELLIPSIS);
    cut
}
