use super::{http_client, transport_error};
use crate::translation::Translator;
use crate::types::TranslationError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

const ENDPOINT: &str = "https://translation.googleapis.com/language/translate/v2";

/// Google Cloud Translation v2. Language codes are sent lowercase.
pub struct GoogleTranslator {
    client: Client,
    api_key: String,
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    target: String,
    format: &'static str,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    data: TranslateData,
}

#[derive(Debug, Deserialize)]
struct TranslateData {
    translations: Vec<TranslatedText>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslatedText {
    translated_text: String,
}

impl GoogleTranslator {
    pub fn new(api_key: String) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: http_client()?,
            api_key,
            endpoint: ENDPOINT.to_string(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl Translator for GoogleTranslator {
    fn name(&self) -> &str {
        "google"
    }

    async fn translate(&self, text: &str, target_language: &str) -> Result<String, TranslationError> {
        let request = TranslateRequest {
            q: text,
            target: target_language.to_lowercase(),
            format: "text",
        };

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error("google", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, target_language));
        }

        let parsed: TranslateResponse = response.json().await.map_err(|e| transport_error("google", e))?;
        let translated = parsed
            .data
            .translations
            .into_iter()
            .next()
            .map(|t| t.translated_text)
            .ok_or_else(|| TranslationError::Unavailable("google: empty translation list".into()))?;

        debug!("google translated {} chars into {}", text.len(), target_language);
        Ok(translated)
    }
}

fn classify_status(status: StatusCode, body: &str, target_language: &str) -> TranslationError {
    let detail = format!("google: HTTP {}", status.as_u16());
    let lowered = body.to_lowercase();

    match status.as_u16() {
        429 => TranslationError::RateLimited(detail),
        // Quota exhaustion is reported as 403 with a rate-limit reason.
        403 if lowered.contains("ratelimitexceeded") || lowered.contains("quota") => {
            TranslationError::RateLimited(detail)
        }
        400 if lowered.contains("language") || lowered.contains("target") => {
            TranslationError::UnsupportedLanguage(target_language.to_string())
        }
        _ => TranslationError::Unavailable(detail),
    }
}
