//! Concrete translation backends.

pub mod deepl;
pub mod google;

use crate::config::{Credentials, ProviderKind};
use crate::translation::Translator;
use crate::types::TranslationError;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub use deepl::DeepLTranslator;
pub use google::GoogleTranslator;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Build providers in the configured order. A provider whose credential
/// is missing is left out with a warning.
pub fn build_providers(order: &[ProviderKind], credentials: &Credentials) -> Vec<Arc<dyn Translator>> {
    let mut providers: Vec<Arc<dyn Translator>> = Vec::new();

    for kind in order {
        let built: Option<Result<Arc<dyn Translator>, reqwest::Error>> = match kind {
            ProviderKind::Google => credentials
                .google_api_key
                .as_ref()
                .map(|key| GoogleTranslator::new(key.clone()).map(|t| Arc::new(t) as Arc<dyn Translator>)),
            ProviderKind::DeepL => credentials
                .deepl_api_key
                .as_ref()
                .map(|key| DeepLTranslator::new(key.clone()).map(|t| Arc::new(t) as Arc<dyn Translator>)),
        };

        match built {
            Some(Ok(provider)) => providers.push(provider),
            Some(Err(e)) => warn!(provider = kind.as_str(), "Failed to build translation client: {}", e),
            None => warn!(provider = kind.as_str(), "No API key configured, provider disabled"),
        }
    }

    providers
}

pub(crate) fn http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()
}

/// Transport failures never carry a usable answer; treat them as an outage.
pub(crate) fn transport_error(provider: &str, error: reqwest::Error) -> TranslationError {
    TranslationError::Unavailable(format!("{}: {}", provider, error))
}
