//! Text translation: backend trait, HTTP client and per-segment dispatcher.

pub mod dispatcher;
pub mod http;

use async_trait::async_trait;
use serde::Serialize;

pub use dispatcher::{TranslationDispatcher, TranslationOutcome};
pub use http::HttpTranslator;

/// One stateless translation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranslationRequest {
    pub text: String,
    pub source_language: String,
    pub target_language: String,
}

/// Translation backend.
///
/// Implementations return the translated text, or an error when the
/// backend refuses, fails or returns nothing usable.
#[async_trait]
pub trait Translator: Send + Sync {
    fn name(&self) -> &str;

    async fn translate(&self, request: &TranslationRequest) -> anyhow::Result<String>;
}
