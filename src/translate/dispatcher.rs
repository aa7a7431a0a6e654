//! Per-segment translation dispatch.
//!
//! Every segment gets its own translation task; results resolve in any
//! order and land in the [`SegmentHistory`] by id. A pending set keeps a
//! segment from being translated twice while its first call is in flight.
//! Failures leave the segment untranslated and never block other segments.

use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{TranslationRequest, Translator};
use crate::voice::segments::{Segment, SegmentHistory, SegmentId};

/// Result of one dispatched translation.
#[derive(Debug, Clone, PartialEq)]
pub enum TranslationOutcome {
    Translated {
        id: SegmentId,
        original: String,
        translated: String,
        target_language: String,
    },
    Failed {
        id: SegmentId,
        error: String,
    },
}

impl TranslationOutcome {
    pub fn id(&self) -> SegmentId {
        match self {
            Self::Translated { id, .. } | Self::Failed { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone)]
struct LanguagePair {
    source: String,
    target: String,
}

struct DispatcherInner {
    translator: Arc<dyn Translator>,
    history: Arc<SegmentHistory>,
    pending: Mutex<HashSet<SegmentId>>,
    languages: RwLock<LanguagePair>,
    timeout: Duration,
    outcomes: mpsc::UnboundedSender<TranslationOutcome>,
}

/// Fires one asynchronous translation per segment.
#[derive(Clone)]
pub struct TranslationDispatcher {
    inner: Arc<DispatcherInner>,
}

impl TranslationDispatcher {
    pub fn new(
        translator: Arc<dyn Translator>,
        history: Arc<SegmentHistory>,
        source: impl Into<String>,
        target: impl Into<String>,
        timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<TranslationOutcome>) {
        let (outcomes, outcome_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(DispatcherInner {
            translator,
            history,
            pending: Mutex::new(HashSet::new()),
            languages: RwLock::new(LanguagePair {
                source: source.into(),
                target: target.into(),
            }),
            timeout,
            outcomes,
        });
        (Self { inner }, outcome_rx)
    }

    /// Change the pair used by later dispatches.
    pub fn set_languages(&self, source: &str, target: &str) {
        let mut pair = self.inner.languages.write();
        pair.source = source.to_string();
        pair.target = target.to_string();
        tracing::info!(source, target, "Translation languages updated");
    }

    /// `(source, target)`.
    pub fn languages(&self) -> (String, String) {
        let pair = self.inner.languages.read();
        (pair.source.clone(), pair.target.clone())
    }

    pub fn in_flight(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Start translating `segment`. Returns `false` (and does nothing) when
    /// that segment is already in flight.
    pub fn dispatch(&self, segment: &Segment) -> bool {
        let id = segment.id;
        if !self.inner.pending.lock().insert(id) {
            tracing::debug!(segment_id = %id, "Translation already in flight, skipping");
            return false;
        }

        let request = {
            let pair = self.inner.languages.read();
            TranslationRequest {
                text: segment.original_text.clone(),
                source_language: pair.source.clone(),
                target_language: pair.target.clone(),
            }
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = inner.run(id, request).await;
            inner.pending.lock().remove(&id);
            let _ = inner.outcomes.send(outcome);
        });
        true
    }
}

impl DispatcherInner {
    async fn run(&self, id: SegmentId, request: TranslationRequest) -> TranslationOutcome {
        let started = std::time::Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.translator.translate(&request)).await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "translation timed out after {}ms",
                self.timeout.as_millis()
            )),
        };

        match result {
            Ok(translated) => {
                if !self.history.set_translation(id, &translated) {
                    tracing::debug!(segment_id = %id, "Segment gone or already translated, dropping result");
                    return TranslationOutcome::Failed {
                        id,
                        error: "segment no longer in history".into(),
                    };
                }
                tracing::info!(
                    segment_id = %id,
                    translator = self.translator.name(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Segment translated"
                );
                TranslationOutcome::Translated {
                    id,
                    original: request.text,
                    translated,
                    target_language: request.target_language,
                }
            }
            Err(e) => {
                tracing::warn!(segment_id = %id, error = %e, "Translation failed");
                TranslationOutcome::Failed {
                    id,
                    error: e.to_string(),
                }
            }
        }
    }
}
