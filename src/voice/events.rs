//! WebSocket message schema for the STT and TTS services.
//!
//! ## Protocol
//!
//! ```text
//! mic ─▸ f32 PCM (binary) ─▸ STT server ─▸ word / final / error (JSON text)
//! translated text ─▸ synthesize (JSON) ─▸ TTS server ─▸ audio_chunk (base64 WAV)
//! ```
//!
//! Outbound messages are serde-tagged enums. Inbound frames are parsed
//! through `serde_json::Value` so that optional and unknown fields never
//! break decoding; a frame that is not JSON, or lacks a required field, is
//! reported as a [`ParseError`] for the caller to log and drop.

use serde::Serialize;
use serde_json::Value;

// ── Parse errors ───────────────────────────────────────────────────

/// Why an inbound frame could not be decoded.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("message has no `{0}` discriminant")]
    MissingDiscriminant(&'static str),
    #[error("`{kind}` message is missing field `{field}`")]
    MissingField { kind: String, field: &'static str },
}

fn parse_object(text: &str) -> Result<Value, ParseError> {
    serde_json::from_str::<Value>(text).map_err(|e| ParseError::InvalidJson(e.to_string()))
}

fn str_field(value: &Value, kind: &str, field: &'static str) -> Result<String, ParseError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ParseError::MissingField {
            kind: kind.to_string(),
            field,
        })
}

fn opt_str(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(str::to_string)
}

// ── STT: client → server ───────────────────────────────────────────

/// Control frames sent to the STT server. Audio goes as binary frames.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SttControl {
    /// Ask the server to finish the utterance and end the stream.
    Stop,
    /// Switch the recognition language.
    #[serde(rename = "setlanguage")]
    SetLanguage { lang: String },
}

// ── STT: server → client ───────────────────────────────────────────

/// Transcription events sent by the STT server.
#[derive(Debug, Clone, PartialEq)]
pub enum SttServerMessage {
    /// One recognised word with timing (seconds from stream start).
    Word {
        word: String,
        start_time: f64,
        end_time: Option<f64>,
    },
    /// The server closed an utterance.
    Final { text: String },
    /// Server-side error.
    Error { message: String },
    /// Optional second-pass enhancement progress (`whisper_processing`,
    /// `whisper_complete`). Not needed by this client.
    Enhancement { kind: String },
    /// Any other `type` value.
    Unknown { kind: String },
}

/// Parse one STT text frame.
pub fn parse_stt_message(text: &str) -> Result<SttServerMessage, ParseError> {
    let value = parse_object(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingDiscriminant("type"))?;

    let msg = match kind {
        "word" => SttServerMessage::Word {
            word: str_field(&value, kind, "word")?,
            start_time: value
                .get("start_time")
                .and_then(Value::as_f64)
                .ok_or_else(|| ParseError::MissingField {
                    kind: kind.to_string(),
                    field: "start_time",
                })?,
            end_time: value.get("end_time").and_then(Value::as_f64),
        },
        "final" => SttServerMessage::Final {
            text: str_field(&value, kind, "text")?,
        },
        "error" => SttServerMessage::Error {
            message: opt_str(&value, "message").unwrap_or_else(|| "Unknown STT error".into()),
        },
        "whisper_processing" | "whisper_complete" => SttServerMessage::Enhancement {
            kind: kind.to_string(),
        },
        other => SttServerMessage::Unknown {
            kind: other.to_string(),
        },
    };
    Ok(msg)
}

// ── TTS: client → server ───────────────────────────────────────────

/// Commands sent to the TTS server.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum TtsCommand {
    ListVoices,
    SetVoice {
        voice: String,
    },
    SetLanguage {
        language: String,
    },
    Synthesize {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
}

// ── TTS: server → client ───────────────────────────────────────────

/// Responses sent by the TTS server.
#[derive(Debug, Clone, PartialEq)]
pub enum TtsServerMessage {
    /// Current voice plus every voice the server can switch to.
    Voices { voice: String, voices: Vec<String> },
    VoiceChanged { voice: String },
    LanguageChanged { language: Option<String> },
    SynthesisStarted,
    /// One base64-encoded WAV chunk of the current synthesis.
    AudioChunk {
        chunk: String,
        index: Option<u64>,
        total: Option<u64>,
        sample_rate: Option<u32>,
    },
    SynthesisCompleted,
    Error { message: String },
    Unknown { kind: String },
}

/// Parse one TTS text frame.
pub fn parse_tts_message(text: &str) -> Result<TtsServerMessage, ParseError> {
    let value = parse_object(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingDiscriminant("type"))?;

    let msg = match kind {
        "voices" => TtsServerMessage::Voices {
            voice: opt_str(&value, "voice").unwrap_or_default(),
            voices: value
                .get("voices")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        },
        "voice_changed" => TtsServerMessage::VoiceChanged {
            voice: str_field(&value, kind, "voice")?,
        },
        "language_changed" => TtsServerMessage::LanguageChanged {
            language: opt_str(&value, "language"),
        },
        "synthesis_started" => TtsServerMessage::SynthesisStarted,
        "audio_chunk" => TtsServerMessage::AudioChunk {
            chunk: str_field(&value, kind, "chunk")?,
            index: value.get("index").and_then(Value::as_u64),
            total: value.get("total").and_then(Value::as_u64),
            sample_rate: value
                .get("sample_rate")
                .and_then(Value::as_u64)
                .and_then(|r| u32::try_from(r).ok()),
        },
        "synthesis_completed" => TtsServerMessage::SynthesisCompleted,
        "error" => TtsServerMessage::Error {
            message: opt_str(&value, "message")
                .or_else(|| opt_str(&value, "error"))
                .unwrap_or_else(|| "Unknown TTS error".into()),
        },
        other => TtsServerMessage::Unknown {
            kind: other.to_string(),
        },
    };
    Ok(msg)
}

// ── Tests ──────────────────────────────────────────────────────────
