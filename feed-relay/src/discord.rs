use crate::types::{DestinationId, FormattedMessage, SendError, SendMessage};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const API_BASE: &str = "https://discord.com/api/v10";
const EMBED_COLOR: u32 = 0x2F80ED;
const UNTRANSLATED_NOTE: &str = "Translation unavailable, showing original text";

/// Send capability posting embeds to Discord channels.
pub struct DiscordSender {
    client: Client,
    token: String,
    api_base: String,
}

#[derive(Debug, Serialize)]
struct CreateMessage {
    embeds: Vec<Embed>,
}

#[derive(Debug, Serialize)]
struct Embed {
    description: String,
    color: u32,
    fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<EmbedImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<EmbedFooter>,
}

#[derive(Debug, Serialize)]
struct EmbedField {
    name: &'static str,
    value: String,
    inline: bool,
}

#[derive(Debug, Serialize)]
struct EmbedImage {
    url: String,
}

#[derive(Debug, Serialize)]
struct EmbedFooter {
    text: &'static str,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    retry_after: f64,
}

impl DiscordSender {
    pub fn new(token: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            token: token.into(),
            api_base: API_BASE.to_string(),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }
}

fn build_embed(message: &FormattedMessage) -> Embed {
    let mut description = format!("[{}]({})", message.title, message.link);
    if !message.summary.is_empty() {
        description.push_str("\n\n");
        description.push_str(&message.summary);
    }

    Embed {
        description,
        color: EMBED_COLOR,
        fields: vec![
            EmbedField {
                name: "Source",
                value: message.source.clone(),
                inline: true,
            },
            EmbedField {
                name: "Published",
                value: message.published.clone(),
                inline: true,
            },
        ],
        image: message.image_url.clone().map(|url| EmbedImage { url }),
        footer: message.untranslated.then_some(EmbedFooter { text: UNTRANSLATED_NOTE }),
    }
}

#[async_trait]
impl SendMessage for DiscordSender {
    async fn send(&self, destination: &DestinationId, message: &FormattedMessage) -> Result<(), SendError> {
        let url = format!("{}/channels/{}/messages", self.api_base, destination);
        let body = CreateMessage {
            embeds: vec![build_embed(message)],
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bot {}", self.token))
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(destination = %destination, "Discord accepted message");
            return Ok(());
        }

        let header_retry = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok());
        let text = response.text().await.unwrap_or_default();

        let error = classify_status(status, &text, header_retry);
        warn!(destination = %destination, status = status.as_u16(), "Discord rejected message: {}", error);
        Err(error)
    }
}

fn classify_status(status: StatusCode, body: &str, header_retry: Option<f64>) -> SendError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let seconds = serde_json::from_str::<RateLimitBody>(body)
                .ok()
                .map(|b| b.retry_after)
                .or(header_retry);
            SendError::RateLimited {
                retry_after: seconds
                    .filter(|s| s.is_finite() && *s >= 0.0)
                    .map(Duration::from_secs_f64),
            }
        }
        StatusCode::FORBIDDEN => SendError::PermissionDenied(format!("HTTP 403: {}", body)),
        StatusCode::NOT_FOUND => SendError::Gone(format!("HTTP 404: {}", body)),
        // A bad token or a malformed embed is not the channel's fault.
        _ => SendError::Transient(format!("HTTP {}: {}", status.as_u16(), body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(untranslated: bool) -> FormattedMessage {
        FormattedMessage {
            title: "标题".into(),
            link: "https://www.ft.com/content/1".into(),
            summary: "摘要".into(),
            source: "金融时报".into(),
            published: "2024-01-01 00:00:00 UTC".into(),
            image_url: Some("https://img.example.com/1.jpg".into()),
            untranslated,
        }
    }

    #[test]
    fn embed_links_title_and_carries_fields() {
        let embed = serde_json::to_value(build_embed(&message(false))).unwrap();
        assert_eq!(embed["description"], "[标题](https://www.ft.com/content/1)\n\n摘要");
        assert_eq!(embed["fields"][0]["value"], "金融时报");
        assert_eq!(embed["fields"][1]["name"], "Published");
        assert_eq!(embed["image"]["url"], "https://img.example.com/1.jpg");
        assert!(embed.get("footer").is_none());
    }

    #[test]
    fn untranslated_messages_get_a_footer() {
        let embed = serde_json::to_value(build_embed(&message(true))).unwrap();
        assert_eq!(embed["footer"]["text"], UNTRANSLATED_NOTE);
    }

    #[test]
    fn maps_statuses_to_send_errors() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, r#"{"retry_after": 1.5, "global": false}"#, None),
            SendError::RateLimited {
                retry_after: Some(Duration::from_millis(1500))
            }
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "", Some(2.0)),
            SendError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "Missing Access", None),
            SendError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "Unknown Channel", None),
            SendError::Gone(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "", None),
            SendError::Transient(_)
        ));
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "", None).is_permanent());
    }
}
