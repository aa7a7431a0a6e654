//! Word-stream segmentation for translation.
//!
//! Words from the STT session accumulate in a pending transcript buffer
//! until one of the flush triggers fires:
//!
//! 1. **Sentence end**: the trimmed buffer ends in a terminal punctuation
//!    mark (`. ! ?` and their full-width forms by default).
//! 2. **Length cap**: the buffer reaches `max_words` words.
//! 3. **Idle**: no new word arrives within `idle_timeout_ms` of the last one.
//! 4. **Final**: the STT server closed an utterance. This always flushes and
//!    takes precedence over the local heuristics.
//!
//! The engine never sleeps. It exposes the idle deadline and the owner
//! (the session router) waits on it and calls [`Segmenter::poll_idle`].
//! Every flush clears the buffer and disarms the deadline; an empty buffer
//! never produces a segment.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use super::segments::{Segment, SegmentId};

// ── Configuration ──────────────────────────────────────────────────

/// Configuration for the segmentation heuristics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Milliseconds without a new word before the buffer is flushed.
    pub idle_timeout_ms: u64,
    /// Word count that forces a flush.
    pub max_words: usize,
    /// Characters that end a sentence.
    pub sentence_terminators: Vec<char>,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 2_000,
            max_words: 20,
            sentence_terminators: vec!['.', '!', '?', '。', '！', '？'],
        }
    }
}

impl SegmenterConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// What caused a flush (for logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    SentenceEnd,
    MaxWords,
    Idle,
    Final,
    Manual,
}

// ── Segmenter ──────────────────────────────────────────────────────

/// State machine over the pending transcript buffer.
pub struct Segmenter {
    config: SegmenterConfig,
    buffer: String,
    word_count: usize,
    idle_deadline: Option<Instant>,
    /// Whether any word arrived since the last final event.
    words_since_final: bool,
    next_id: u64,
    last_reason: Option<FlushReason>,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        // Ids start at the creation wall-clock so they stay unique across
        // segmenter instances in one process.
        let seed = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Self {
            config,
            buffer: String::new(),
            word_count: 0,
            idle_deadline: None,
            words_since_final: false,
            next_id: seed,
            last_reason: None,
        }
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Words accumulated since the last flush.
    pub fn pending_text(&self) -> &str {
        &self.buffer
    }

    pub fn idle_deadline(&self) -> Option<Instant> {
        self.idle_deadline
    }

    pub fn last_flush_reason(&self) -> Option<FlushReason> {
        self.last_reason
    }

    /// Append one recognised word. Flushes immediately on a sentence end or
    /// when the word cap is reached; otherwise (re)arms the idle deadline.
    pub fn push_word(&mut self, word: &str, now: Instant) -> Option<Segment> {
        let word = word.trim();
        if word.is_empty() {
            return None;
        }
        self.words_since_final = true;

        if !self.buffer.is_empty() {
            self.buffer.push(' ');
        }
        self.buffer.push_str(word);
        self.word_count += word.split_whitespace().count();

        if self.ends_sentence() {
            return self.flush_with(FlushReason::SentenceEnd);
        }
        if self.word_count >= self.config.max_words {
            return self.flush_with(FlushReason::MaxWords);
        }

        self.idle_deadline = Some(now + self.config.idle_timeout());
        None
    }

    /// Handle an STT final event.
    ///
    /// When words streamed in since the previous final, they already carry
    /// the utterance and the buffer is flushed as-is. When the server sent
    /// no words at all, the final's own text becomes the segment.
    pub fn push_final(&mut self, text: &str) -> Option<Segment> {
        if !self.words_since_final {
            let text = text.trim();
            if !text.is_empty() {
                if !self.buffer.is_empty() {
                    self.buffer.push(' ');
                }
                self.buffer.push_str(text);
            }
        }
        self.words_since_final = false;
        self.flush_with(FlushReason::Final)
    }

    /// Flush if the idle deadline has passed.
    pub fn poll_idle(&mut self, now: Instant) -> Option<Segment> {
        match self.idle_deadline {
            Some(deadline) if now >= deadline => self.flush_with(FlushReason::Idle),
            _ => None,
        }
    }

    /// Flush whatever is pending.
    pub fn flush(&mut self) -> Option<Segment> {
        self.flush_with(FlushReason::Manual)
    }

    /// Disarm the idle deadline without flushing.
    pub fn cancel_idle(&mut self) {
        self.idle_deadline = None;
    }

    /// Drop pending text and disarm the idle deadline.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.word_count = 0;
        self.idle_deadline = None;
        self.words_since_final = false;
        self.last_reason = None;
    }

    // ── Internal helpers ──────────────────────────────────────────

    fn ends_sentence(&self) -> bool {
        self.buffer
            .trim_end()
            .chars()
            .last()
            .is_some_and(|c| self.config.sentence_terminators.contains(&c))
    }

    fn flush_with(&mut self, reason: FlushReason) -> Option<Segment> {
        self.idle_deadline = None;
        let text = self.buffer.trim().to_string();
        self.buffer.clear();
        self.word_count = 0;
        if text.is_empty() {
            return None;
        }

        let id = SegmentId(self.next_id);
        self.next_id += 1;
        self.last_reason = Some(reason);
        tracing::debug!(segment_id = %id, reason = ?reason, text = %text, "Segment flushed");
        Some(Segment::new(id, text))
    }
}

// ── Tests ──────────────────────────────────────────────────────────
