//! Translatable segments and their ordered history.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Creation-time-derived segment identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SegmentId(pub u64);

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unit of finalized source text paired with its eventual translation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub id: SegmentId,
    pub original_text: String,
    /// Empty until the translation resolves (and forever, if it fails).
    pub translated_text: String,
    pub created_at: DateTime<Utc>,
}

impl Segment {
    pub fn new(id: SegmentId, original_text: impl Into<String>) -> Self {
        Self {
            id,
            original_text: original_text.into(),
            translated_text: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_translated(&self) -> bool {
        !self.translated_text.is_empty()
    }
}

/// Insertion-ordered segment collection.
///
/// Translations land by id, so a late result for an early segment updates
/// it in place; nothing is ever re-sorted.
#[derive(Debug, Default)]
pub struct SegmentHistory {
    segments: Mutex<Vec<Segment>>,
}

impl SegmentHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, segment: Segment) {
        self.segments.lock().push(segment);
    }

    /// Record the translation for `id`. Returns `false` when the segment is
    /// gone (history cleared meanwhile) or was already translated.
    pub fn set_translation(&self, id: SegmentId, translated: &str) -> bool {
        let mut segments = self.segments.lock();
        match segments.iter_mut().find(|s| s.id == id) {
            Some(segment) if segment.translated_text.is_empty() => {
                segment.translated_text = translated.to_string();
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: SegmentId) -> Option<Segment> {
        self.segments.lock().iter().find(|s| s.id == id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Segment> {
        self.segments.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.segments.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.lock().is_empty()
    }

    /// Empty the whole collection.
    pub fn clear(&self) {
        self.segments.lock().clear();
    }
}
