use super::{http_client, transport_error};
use crate::translation::Translator;
use crate::types::TranslationError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

const FREE_ENDPOINT: &str = "https://api-free.deepl.com/v2/translate";
const PRO_ENDPOINT: &str = "https://api.deepl.com/v2/translate";

/// DeepL v2. Language codes are sent uppercase; free-tier keys end in `:fx`.
pub struct DeepLTranslator {
    client: Client,
    api_key: String,
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    text: [&'a str; 1],
    target_lang: String,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    translations: Vec<TranslatedText>,
}

#[derive(Debug, Deserialize)]
struct TranslatedText {
    text: String,
}

impl DeepLTranslator {
    pub fn new(api_key: String) -> Result<Self, reqwest::Error> {
        let endpoint = if api_key.ends_with(":fx") { FREE_ENDPOINT } else { PRO_ENDPOINT };
        Ok(Self {
            client: http_client()?,
            api_key,
            endpoint: endpoint.to_string(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

/// DeepL rejects the bare `EN` and `PT` targets.
fn target_code(language: &str) -> String {
    match language.to_uppercase().as_str() {
        "EN" => "EN-US".to_string(),
        "PT" => "PT-PT".to_string(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Translator for DeepLTranslator {
    fn name(&self) -> &str {
        "deepl"
    }

    async fn translate(&self, text: &str, target_language: &str) -> Result<String, TranslationError> {
        let request = TranslateRequest {
            text: [text],
            target_lang: target_code(target_language),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("DeepL-Auth-Key {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error("deepl", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, target_language));
        }

        let parsed: TranslateResponse = response.json().await.map_err(|e| transport_error("deepl", e))?;
        let translated = parsed
            .translations
            .into_iter()
            .next()
            .map(|t| t.text)
            .ok_or_else(|| TranslationError::Unavailable("deepl: empty translation list".into()))?;

        debug!("deepl translated {} chars into {}", text.len(), target_language);
        Ok(translated)
    }
}

fn classify_status(status: StatusCode, body: &str, target_language: &str) -> TranslationError {
    let detail = format!("deepl: HTTP {}", status.as_u16());

    match status.as_u16() {
        // 456: character quota exceeded
        429 | 456 => TranslationError::RateLimited(detail),
        400 if body.to_lowercase().contains("target_lang") => {
            TranslationError::UnsupportedLanguage(target_language.to_string())
        }
        _ => TranslationError::Unavailable(detail),
    }
}
