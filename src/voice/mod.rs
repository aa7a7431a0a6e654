//! Voice pipeline for real-time translation.
//!
//! Captured audio streams to a speech-to-text WebSocket, recognised words
//! are cut into segments, each segment is translated independently, and
//! translations can be spoken through a text-to-speech WebSocket.
//!
//! ## Design
//! - Explicit reconnect state machine with exponential backoff (`backoff`)
//! - Typed wire messages for both sockets (`events`)
//! - Segmenter driven by explicit time, so heuristics test without sleeping
//! - Strict single-in-flight TTS request queue plus a gapless playback queue
//! - One router task owns segmentation; everything else talks over channels

pub mod backoff;
pub mod capture;
pub mod events;
pub mod language;
pub mod playback;
pub mod resample;
pub mod segmenter;
pub mod segments;
pub mod session;
pub mod stt;
pub mod tts;

pub use backoff::{ConnectionState, ReconnectPolicy, Reconnector};
pub use capture::{AudioFrame, AudioSource, StdinPcmSource, WavFileSource};
pub use language::{locale_for_language, voice_for_language, LanguageCode};
pub use playback::{AudioBuffer, AudioSink, PacedSink, PlaybackQueue, WavFileSink};
pub use resample::{resample_linear, STT_SAMPLE_RATE};
pub use segmenter::{Segmenter, SegmenterConfig};
pub use segments::{Segment, SegmentHistory, SegmentId};
pub use session::{AppContext, SessionEvent, SessionOrchestrator, SessionStatus};
pub use stt::{SttEvent, SttSession};
pub use tts::{TtsError, TtsOptions, TtsSession};
