//! Runtime configuration.
//!
//! Sources, lowest precedence first: built-in defaults, the TOML file
//! (`~/.config/moa/voice-translate.toml` unless `--config` names another),
//! then `MOA_*` environment variables.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::voice::backoff::ReconnectPolicy;
use crate::voice::segmenter::SegmenterConfig;
use crate::voice::tts::TtsOptions;

/// Full configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub stt: SttConfig,
    pub tts: TtsConfig,
    pub translation: TranslationConfig,
    pub segmenter: SegmenterConfig,
    pub languages: LanguageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SttConfig {
    /// `ws://` or `wss://` endpoint of the streaming recognizer.
    pub url: String,
    pub reconnect: ReconnectPolicy,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws/transcribe".into(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TtsConfig {
    /// `ws://` or `wss://` endpoint of the synthesizer.
    pub url: String,
    /// Speak translations from session start.
    pub enabled: bool,
    pub voice_switch_timeout_ms: u64,
    pub synthesis_timeout_ms: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        let options = TtsOptions::default();
        Self {
            url: "ws://localhost:8001/ws/tts".into(),
            enabled: false,
            voice_switch_timeout_ms: options.voice_switch_timeout_ms,
            synthesis_timeout_ms: options.synthesis_timeout_ms,
        }
    }
}

impl TtsConfig {
    pub fn options(&self) -> TtsOptions {
        TtsOptions {
            voice_switch_timeout_ms: self.voice_switch_timeout_ms,
            synthesis_timeout_ms: self.synthesis_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranslationConfig {
    /// HTTP endpoint accepting `{text, sourceLanguage, targetLanguage}`.
    pub url: String,
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Per-segment deadline.
    pub timeout_ms: u64,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3000/api/translate".into(),
            model: None,
            api_key: None,
            timeout_ms: 15_000,
        }
    }
}

impl TranslationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LanguageConfig {
    pub source: String,
    pub target: String,
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            source: "en".into(),
            target: "es".into(),
        }
    }
}

// ── Loading ────────────────────────────────────────────────────────

impl Config {
    /// `~/.config/moa/voice-translate.toml`.
    pub fn default_path() -> Option<PathBuf> {
        directories::UserDirs::new().map(|u| {
            u.home_dir()
                .join(".config")
                .join("moa")
                .join("voice-translate.toml")
        })
    }

    /// Parse a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {e}", path.display()))
    }

    /// Load the effective configuration.
    ///
    /// An explicit `path` must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => {
                    tracing::debug!(path = %path.display(), "Loading config file");
                    Self::from_file(&path)?
                }
                None => Self::default(),
            },
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `MOA_*` overrides from `lookup` (normally the process env).
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("MOA_STT_URL") {
            self.stt.url = url;
        }
        if let Some(url) = get("MOA_TTS_URL") {
            self.tts.url = url;
        }
        if let Some(url) = get("MOA_TRANSLATION_URL") {
            self.translation.url = url;
        }
        if let Some(model) = get("MOA_TRANSLATION_MODEL") {
            self.translation.model = Some(model);
        }
        if let Some(key) = get("MOA_TRANSLATION_API_KEY") {
            self.translation.api_key = Some(key);
        }
        if let Some(raw) = get("MOA_SEGMENT_IDLE_TIMEOUT_MS") {
            match raw.trim().parse() {
                Ok(ms) => self.segmenter.idle_timeout_ms = ms,
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid MOA_SEGMENT_IDLE_TIMEOUT_MS"),
            }
        }
        if let Some(raw) = get("MOA_SEGMENT_MAX_WORDS") {
            match raw.trim().parse() {
                Ok(n) => self.segmenter.max_words = n,
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid MOA_SEGMENT_MAX_WORDS"),
            }
        }
        if let Some(lang) = get("MOA_SOURCE_LANG") {
            self.languages.source = lang;
        }
        if let Some(lang) = get("MOA_TARGET_LANG") {
            self.languages.target = lang;
        }
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, url) in [("stt.url", &self.stt.url), ("tts.url", &self.tts.url)] {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                anyhow::bail!("{name} must be a ws:// or wss:// URL, got {url:?}");
            }
        }
        let t = &self.translation.url;
        if !(t.starts_with("http://") || t.starts_with("https://")) {
            anyhow::bail!("translation.url must be an http(s) URL, got {t:?}");
        }
        if self.segmenter.idle_timeout_ms == 0 {
            anyhow::bail!("segmenter.idle_timeout_ms must be greater than 0");
        }
        if self.segmenter.max_words == 0 {
            anyhow::bail!("segmenter.max_words must be greater than 0");
        }
        if self.segmenter.sentence_terminators.is_empty() {
            anyhow::bail!("segmenter.sentence_terminators must not be empty");
        }
        if self.translation.timeout_ms == 0 {
            anyhow::bail!("translation.timeout_ms must be greater than 0");
        }
        if self.tts.voice_switch_timeout_ms == 0 {
            anyhow::bail!("tts.voice_switch_timeout_ms must be greater than 0");
        }
        if self.languages.source.trim().is_empty() || self.languages.target.trim().is_empty() {
            anyhow::bail!("languages.source and languages.target must be set");
        }
        Ok(())
    }

    /// TOML rendering with the API key left out.
    pub fn to_toml_redacted(&self) -> anyhow::Result<String> {
        let mut shown = self.clone();
        shown.translation.api_key = None;
        toml::to_string_pretty(&shown).context("Failed to render config")
    }
}
