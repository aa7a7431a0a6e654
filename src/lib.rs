//! Real-time voice translation client.
//!
//! Streams microphone audio to a speech-to-text service, segments the
//! recognised words, translates each segment and optionally speaks the
//! result through a text-to-speech service.

pub mod config;
pub mod translate;
pub mod voice;

pub use config::Config;
