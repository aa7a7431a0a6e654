//! Language codes and the fixed language → TTS voice / locale tables.

use serde::{Deserialize, Serialize};

/// Voice used when a language has no dedicated TTS voice.
pub const DEFAULT_VOICE: &str = "af_heart";

/// Synthesis locale used when a language has no dedicated locale.
pub const DEFAULT_LOCALE: &str = "en-us";

// ── Language codes ───────────────────────────────────────────────

/// ISO 639-1 language codes understood by the translation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LanguageCode {
    // East Asia
    Ko, // Korean
    Ja, // Japanese
    Zh, // Chinese (Simplified)

    // South / Southeast Asia
    Hi, // Hindi
    Vi, // Vietnamese
    Th, // Thai

    // Europe
    En, // English
    Es, // Spanish
    Fr, // French
    De, // German
    It, // Italian
    Pt, // Portuguese
    Nl, // Dutch
    Pl, // Polish
    Ru, // Russian
    Uk, // Ukrainian
    Tr, // Turkish

    // Middle East
    Ar, // Arabic
}

impl LanguageCode {
    /// ISO 639-1 code string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ko => "ko",
            Self::Ja => "ja",
            Self::Zh => "zh",
            Self::Hi => "hi",
            Self::Vi => "vi",
            Self::Th => "th",
            Self::En => "en",
            Self::Es => "es",
            Self::Fr => "fr",
            Self::De => "de",
            Self::It => "it",
            Self::Pt => "pt",
            Self::Nl => "nl",
            Self::Pl => "pl",
            Self::Ru => "ru",
            Self::Uk => "uk",
            Self::Tr => "tr",
            Self::Ar => "ar",
        }
    }

    /// Human-readable language name.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Ko => "Korean",
            Self::Ja => "Japanese",
            Self::Zh => "Chinese (Simplified)",
            Self::Hi => "Hindi",
            Self::Vi => "Vietnamese",
            Self::Th => "Thai",
            Self::En => "English",
            Self::Es => "Spanish",
            Self::Fr => "French",
            Self::De => "German",
            Self::It => "Italian",
            Self::Pt => "Portuguese",
            Self::Nl => "Dutch",
            Self::Pl => "Polish",
            Self::Ru => "Russian",
            Self::Uk => "Ukrainian",
            Self::Tr => "Turkish",
            Self::Ar => "Arabic",
        }
    }

    /// Parse from a code string (case-insensitive). Region suffixes such as
    /// `en-US` or `pt_BR` resolve to their base language.
    pub fn from_str_code(code: &str) -> Option<Self> {
        let lower = code.trim().to_lowercase();
        let base = lower.split(['-', '_']).next().unwrap_or_default();
        match base {
            "ko" => Some(Self::Ko),
            "ja" => Some(Self::Ja),
            "zh" => Some(Self::Zh),
            "hi" => Some(Self::Hi),
            "vi" => Some(Self::Vi),
            "th" => Some(Self::Th),
            "en" => Some(Self::En),
            "es" => Some(Self::Es),
            "fr" => Some(Self::Fr),
            "de" => Some(Self::De),
            "it" => Some(Self::It),
            "pt" => Some(Self::Pt),
            "nl" => Some(Self::Nl),
            "pl" => Some(Self::Pl),
            "ru" => Some(Self::Ru),
            "uk" => Some(Self::Uk),
            "tr" => Some(Self::Tr),
            "ar" => Some(Self::Ar),
            _ => None,
        }
    }

    /// Dedicated TTS voice, if the synthesis server ships one.
    pub fn tts_voice(self) -> Option<&'static str> {
        match self {
            Self::En => Some("af_heart"),
            Self::Es => Some("ef_dora"),
            Self::Fr => Some("ff_siwis"),
            Self::It => Some("if_sara"),
            Self::Pt => Some("pf_dora"),
            Self::Ja => Some("jf_alpha"),
            Self::Zh => Some("zf_xiaobei"),
            Self::Hi => Some("hf_alpha"),
            _ => None,
        }
    }

    /// Dedicated synthesis locale, if the synthesis server supports one.
    pub fn tts_locale(self) -> Option<&'static str> {
        match self {
            Self::En => Some("en-us"),
            Self::Es => Some("es"),
            Self::Fr => Some("fr-fr"),
            Self::It => Some("it"),
            Self::Pt => Some("pt-br"),
            Self::Ja => Some("ja"),
            Self::Zh => Some("cmn"),
            Self::Hi => Some("hi"),
            _ => None,
        }
    }
}

impl std::fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Voice resolution tables ──────────────────────────────────────

/// Language → voice. Total: unmapped or unknown codes get [`DEFAULT_VOICE`].
pub fn voice_for_language(code: &str) -> &'static str {
    LanguageCode::from_str_code(code)
        .and_then(LanguageCode::tts_voice)
        .unwrap_or(DEFAULT_VOICE)
}

/// Language → synthesis locale. Total: unmapped codes get [`DEFAULT_LOCALE`].
pub fn locale_for_language(code: &str) -> &'static str {
    LanguageCode::from_str_code(code)
        .and_then(LanguageCode::tts_locale)
        .unwrap_or(DEFAULT_LOCALE)
}
