//! JSON-over-HTTP translation backend.
//!
//! `POST {url}` with `{text, sourceLanguage, targetLanguage, model?}`;
//! the reply is `{translatedText}` or `{translatedText: "", error}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{TranslationRequest, Translator};
use crate::config::TranslationConfig;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TranslateBody<'a> {
    text: &'a str,
    source_language: &'a str,
    target_language: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslateResponse {
    #[serde(default)]
    translated_text: String,
    #[serde(default)]
    error: Option<String>,
}

/// Translation backend reached over HTTP.
pub struct HttpTranslator {
    url: String,
    model: Option<String>,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpTranslator {
    pub fn new(url: impl Into<String>, model: Option<String>, api_key: Option<String>) -> Self {
        Self::with_timeout(url, model, api_key, Duration::from_secs(30))
    }

    pub fn with_timeout(
        url: impl Into<String>,
        model: Option<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            url: url.into(),
            model: model.filter(|m| !m.trim().is_empty()),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    pub fn from_config(config: &TranslationConfig) -> Self {
        Self::with_timeout(
            config.url.clone(),
            config.model.clone(),
            config.api_key.clone(),
            Duration::from_millis(config.timeout_ms),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    fn name(&self) -> &str {
        "http"
    }

    async fn translate(&self, request: &TranslationRequest) -> anyhow::Result<String> {
        let body = TranslateBody {
            text: &request.text,
            source_language: &request.source_language,
            target_language: &request.target_language,
            model: self.model.as_deref(),
        };

        let mut req = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            let detail: String = detail.chars().take(200).collect();
            anyhow::bail!("translation backend returned {status}: {detail}");
        }

        let parsed: TranslateResponse = resp.json().await?;
        if let Some(error) = parsed.error.filter(|e| !e.trim().is_empty()) {
            anyhow::bail!("translation backend error: {error}");
        }
        let translated = parsed.translated_text.trim();
        if translated.is_empty() {
            anyhow::bail!("translation backend returned empty text");
        }
        Ok(translated.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(text: &str) -> TranslationRequest {
        TranslationRequest {
            text: text.into(),
            source_language: "en".into(),
            target_language: "es".into(),
        }
    }

    #[tokio::test]
    async fn posts_camel_case_body_and_reads_translation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/translate"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_json(json!({
                "text": "Hello",
                "sourceLanguage": "en",
                "targetLanguage": "es",
                "model": "gpt-4o-mini"
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"translatedText": " Hola "})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let translator = HttpTranslator::new(
            format!("{}/translate", server.uri()),
            Some("gpt-4o-mini".into()),
            Some("sk-test".into()),
        );
        assert_eq!(translator.translate(&request("Hello")).await.unwrap(), "Hola");
    }

    #[tokio::test]
    async fn omits_model_and_auth_when_unset() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!({
                "text": "Hi",
                "sourceLanguage": "en",
                "targetLanguage": "es"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"translatedText": "Hola"})))
            .mount(&server)
            .await;

        let translator = HttpTranslator::new(server.uri(), Some("  ".into()), None);
        assert!(translator.model().is_none());
        assert_eq!(translator.translate(&request("Hi")).await.unwrap(), "Hola");
    }

    #[tokio::test]
    async fn error_field_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"translatedText": "", "error": "quota exceeded"})),
            )
            .mount(&server)
            .await;

        let translator = HttpTranslator::new(server.uri(), None, None);
        let err = translator.translate(&request("x")).await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn empty_translation_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"translatedText": "   "})))
            .mount(&server)
            .await;

        let translator = HttpTranslator::new(server.uri(), None, None);
        assert!(translator.translate(&request("x")).await.is_err());
    }

    #[tokio::test]
    async fn http_status_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let translator = HttpTranslator::new(server.uri(), None, None);
        let err = translator.translate(&request("x")).await.unwrap_err();
        assert!(err.to_string().contains("502"));
    }
}
