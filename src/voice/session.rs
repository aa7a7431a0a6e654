//! Voice translation session orchestrator.
//!
//! Ties together:
//! - an [`AudioSource`] for captured microphone audio
//! - [`SttSession`] for streaming recognition
//! - [`Segmenter`] for deciding when words become a translatable segment
//! - [`TranslationDispatcher`] for per-segment translation
//! - [`TtsSession`] for speaking translations (optional, toggled at runtime)
//!
//! ## Architecture
//!
//! ```text
//! AudioSource ─▸ frames ─▸ audio forwarder ─▸ resample 24kHz ─▸ SttSession
//!                                                                  │
//!                           word / final / error / state ◂─────────┘
//!                                      │
//!                                   router ─▸ Segmenter ─▸ SegmentHistory
//!                                      │                      │
//!                                      │            TranslationDispatcher
//!                                      │                      │
//!                                      ◂──── outcomes ◂───────┘
//!                                      │
//!                                      └─▸ TtsSession.speak (only if enabled + connected)
//! ```
//!
//! The session runs as a set of background tasks:
//! 1. **Audio forwarder** (per `start`): resamples captured frames and sends
//!    them to the STT socket.
//! 2. **Router** (per orchestrator): exclusively owns the segmenter; waits on
//!    STT events, translation outcomes, the idle deadline and control
//!    commands.
//! 3. **TTS state relay**: republishes TTS connection state as events.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::backoff::ConnectionState;
use super::capture::{AudioFrame, AudioSource};
use super::playback::AudioSink;
use super::resample::to_stt_rate;
use super::segmenter::Segmenter;
use super::segments::{Segment, SegmentHistory, SegmentId};
use super::stt::{SttEvent, SttSession};
use super::tts::TtsSession;
use crate::config::Config;
use crate::translate::{TranslationDispatcher, TranslationOutcome, Translator};

// ── Context & events ───────────────────────────────────────────────

/// Everything a session needs, built once at startup.
pub struct AppContext {
    pub config: Config,
    pub translator: Arc<dyn Translator>,
    pub audio_source: Arc<dyn AudioSource>,
    pub audio_sink: Arc<dyn AudioSink>,
}

/// Events published to UI/CLI subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SegmentCreated { segment: Segment },
    SegmentTranslated { id: SegmentId, translated: String },
    SegmentFailed { id: SegmentId, error: String },
    SpeechFailed { id: SegmentId, error: String },
    SttState { state: ConnectionState },
    SttError { message: String },
    TtsState { state: ConnectionState },
    /// The audio source ran dry.
    CaptureEnded,
}

/// Point-in-time snapshot for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub running: bool,
    pub stt: ConnectionState,
    pub tts: ConnectionState,
    pub tts_enabled: bool,
    pub segments: usize,
    pub translations_in_flight: usize,
    pub source_language: String,
    pub target_language: String,
}

enum Control {
    Reset,
    CancelIdle,
    Shutdown,
}

#[derive(Default)]
struct RunState {
    running: bool,
    forwarder: Option<JoinHandle<()>>,
}

// ── Orchestrator ───────────────────────────────────────────────────

/// Owns the STT and TTS sessions, the segment history and the router.
pub struct SessionOrchestrator {
    ctx: Arc<AppContext>,
    stt: SttSession,
    tts: TtsSession,
    history: Arc<SegmentHistory>,
    dispatcher: TranslationDispatcher,
    events: broadcast::Sender<SessionEvent>,
    tts_enabled: Arc<AtomicBool>,
    control: mpsc::UnboundedSender<Control>,
    run: tokio::sync::Mutex<RunState>,
    tts_toggle: tokio::sync::Mutex<()>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionOrchestrator {
    /// Build the sessions and spawn the router. Nothing connects until
    /// [`start`](Self::start).
    pub fn new(ctx: AppContext) -> Self {
        let ctx = Arc::new(ctx);
        let config = &ctx.config;

        let (stt, stt_rx) = SttSession::new(config.stt.url.clone(), config.stt.reconnect);
        let tts = TtsSession::new(
            config.tts.url.clone(),
            config.tts.options(),
            Arc::clone(&ctx.audio_sink),
        );
        let history = Arc::new(SegmentHistory::new());
        let (dispatcher, outcome_rx) = TranslationDispatcher::new(
            Arc::clone(&ctx.translator),
            Arc::clone(&history),
            config.languages.source.clone(),
            config.languages.target.clone(),
            config.translation.timeout(),
        );
        let (events, _) = broadcast::channel(256);
        let (control, control_rx) = mpsc::unbounded_channel();
        let tts_enabled = Arc::new(AtomicBool::new(false));

        let router = Router {
            segmenter: Segmenter::new(config.segmenter.clone()),
            stt_rx,
            outcome_rx,
            control_rx,
            history: Arc::clone(&history),
            dispatcher: dispatcher.clone(),
            tts: tts.clone(),
            tts_enabled: Arc::clone(&tts_enabled),
            events: events.clone(),
        };
        let router_task = tokio::spawn(router.run());
        let relay_task = tokio::spawn(Self::tts_state_relay(tts.clone(), events.clone()));

        Self {
            ctx,
            stt,
            tts,
            history,
            dispatcher,
            events,
            tts_enabled,
            control,
            run: tokio::sync::Mutex::new(RunState::default()),
            tts_toggle: tokio::sync::Mutex::new(()),
            background: Mutex::new(vec![router_task, relay_task]),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn history(&self) -> Vec<Segment> {
        self.history.snapshot()
    }

    /// One segment by id, if it is still in the history.
    pub fn segment(&self, id: SegmentId) -> Option<Segment> {
        self.history.get(id)
    }

    pub fn stt(&self) -> &SttSession {
        &self.stt
    }

    pub fn tts(&self) -> &TtsSession {
        &self.tts
    }

    pub fn is_tts_enabled(&self) -> bool {
        self.tts_enabled.load(Ordering::SeqCst)
    }

    /// Reset history, connect STT and begin capture. No-op while running.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut run = self.run.lock().await;
        if run.running {
            return Ok(());
        }

        self.history.clear();
        let _ = self.control.send(Control::Reset);

        let (source, target) = self.dispatcher.languages();
        tracing::info!(
            stt = %self.stt.url(),
            source = %source,
            target = %target,
            capture = self.ctx.audio_source.name(),
            "Starting voice translation session"
        );

        self.stt.set_language(&source);
        self.stt.connect().await?;

        let (frames_tx, frames_rx) = mpsc::channel::<AudioFrame>(256);
        if let Err(e) = self.ctx.audio_source.start(frames_tx).await {
            self.stt.disconnect();
            return Err(e.context("Failed to start audio capture"));
        }
        run.forwarder = Some(tokio::spawn(Self::audio_forwarder(
            frames_rx,
            self.stt.clone(),
            self.events.clone(),
        )));
        run.running = true;
        drop(run);

        if self.ctx.config.tts.enabled && !self.is_tts_enabled() {
            if let Err(e) = self.set_tts_enabled(true).await {
                tracing::warn!(error = %e, "TTS unavailable, continuing without speech");
            }
        }
        Ok(())
    }

    /// Halt capture, ask STT to finish and cancel any pending idle flush.
    /// A final arriving after this still produces a segment.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        if !run.running {
            return;
        }
        self.ctx.audio_source.stop().await;
        if let Some(forwarder) = run.forwarder.take() {
            forwarder.abort();
        }
        if !self.stt.stop() {
            // Not connected: make sure no reconnect timer survives.
            self.stt.disconnect();
        }
        let _ = self.control.send(Control::CancelIdle);
        run.running = false;
        tracing::info!(segments = self.history.len(), "Voice translation session stopped");
    }

    /// Flip speech output. Returns the new setting.
    pub async fn toggle_tts(&self) -> anyhow::Result<bool> {
        let enable = !self.is_tts_enabled();
        self.set_tts_enabled(enable).await?;
        Ok(enable)
    }

    /// Enabling connects the TTS session (first time or after a failure);
    /// disabling disconnects it and discards queued and playing audio.
    pub async fn set_tts_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        let _guard = self.tts_toggle.lock().await;
        if enabled {
            self.tts.connect().await?;
            self.tts_enabled.store(true, Ordering::SeqCst);
            tracing::info!(url = %self.ctx.config.tts.url, "TTS enabled");
        } else {
            self.tts_enabled.store(false, Ordering::SeqCst);
            self.tts.disconnect();
            tracing::info!("TTS disabled");
        }
        Ok(())
    }

    /// Change the language pair for later segments and the recognizer.
    pub fn set_languages(&self, source: &str, target: &str) {
        self.dispatcher.set_languages(source, target);
        self.stt.set_language(source);
    }

    /// Empty the segment history.
    pub fn clear_history(&self) {
        self.history.clear();
    }

    pub async fn status(&self) -> SessionStatus {
        let running = self.run.lock().await.running;
        let (source_language, target_language) = self.dispatcher.languages();
        SessionStatus {
            running,
            stt: self.stt.state(),
            tts: self.tts.state(),
            tts_enabled: self.is_tts_enabled(),
            segments: self.history.len(),
            translations_in_flight: self.dispatcher.in_flight(),
            source_language,
            target_language,
        }
    }

    /// Stop everything and close both sockets.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.tts_enabled.store(false, Ordering::SeqCst);
        self.tts.disconnect();
        self.stt.disconnect();
        let _ = self.control.send(Control::Shutdown);
        if let Err(e) = self.ctx.audio_sink.finish().await {
            tracing::warn!(error = %e, "Audio sink failed to finish");
        }
    }

    // ── Internal: audio forwarder ─────────────────────────────────

    /// Resamples captured frames to the STT rate and sends them.
    async fn audio_forwarder(
        mut frames: mpsc::Receiver<AudioFrame>,
        stt: SttSession,
        events: broadcast::Sender<SessionEvent>,
    ) {
        let mut dropped: u64 = 0;
        while let Some(frame) = frames.recv().await {
            let samples = to_stt_rate(&frame.samples, frame.sample_rate);
            if !stt.send_audio_frame(&samples) {
                dropped += 1;
            }
        }
        tracing::info!(dropped_frames = dropped, "Audio capture ended");
        let _ = events.send(SessionEvent::CaptureEnded);
    }

    // ── Internal: TTS state relay ─────────────────────────────────

    async fn tts_state_relay(tts: TtsSession, events: broadcast::Sender<SessionEvent>) {
        let mut rx = tts.subscribe_state();
        drop(tts);
        while rx.changed().await.is_ok() {
            let state = *rx.borrow_and_update();
            let _ = events.send(SessionEvent::TtsState { state });
        }
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        for task in self.background.get_mut().drain(..) {
            task.abort();
        }
        if let Some(forwarder) = self.run.get_mut().forwarder.take() {
            forwarder.abort();
        }
        self.tts.disconnect();
        self.stt.disconnect();
    }
}

// ── Router ─────────────────────────────────────────────────────────

struct Router {
    segmenter: Segmenter,
    stt_rx: mpsc::UnboundedReceiver<SttEvent>,
    outcome_rx: mpsc::UnboundedReceiver<TranslationOutcome>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    history: Arc<SegmentHistory>,
    dispatcher: TranslationDispatcher,
    tts: TtsSession,
    tts_enabled: Arc<AtomicBool>,
    events: broadcast::Sender<SessionEvent>,
}

async fn idle(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Router {
    async fn run(mut self) {
        loop {
            let deadline = self.segmenter.idle_deadline();
            tokio::select! {
                Some(event) = self.stt_rx.recv() => self.on_stt_event(event),
                Some(outcome) = self.outcome_rx.recv() => self.on_outcome(outcome),
                () = idle(deadline) => {
                    if let Some(segment) = self.segmenter.poll_idle(Instant::now()) {
                        self.on_segment(segment);
                    }
                }
                control = self.control_rx.recv() => match control {
                    Some(Control::Reset) => self.segmenter.reset(),
                    Some(Control::CancelIdle) => self.segmenter.cancel_idle(),
                    Some(Control::Shutdown) | None => break,
                },
            }
        }
        tracing::debug!("Session router stopped");
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn on_stt_event(&mut self, event: SttEvent) {
        match event {
            SttEvent::Word { word, .. } => {
                if let Some(segment) = self.segmenter.push_word(&word, Instant::now()) {
                    self.on_segment(segment);
                }
            }
            SttEvent::Final { text } => {
                if let Some(segment) = self.segmenter.push_final(&text) {
                    self.on_segment(segment);
                }
            }
            SttEvent::Error { message } => self.emit(SessionEvent::SttError { message }),
            SttEvent::StateChanged(state) => self.emit(SessionEvent::SttState { state }),
        }
    }

    fn on_segment(&mut self, segment: Segment) {
        tracing::info!(
            segment_id = %segment.id,
            reason = ?self.segmenter.last_flush_reason(),
            text = %segment.original_text,
            "Segment created"
        );
        self.history.push(segment.clone());
        self.dispatcher.dispatch(&segment);
        self.emit(SessionEvent::SegmentCreated { segment });
    }

    fn on_outcome(&mut self, outcome: TranslationOutcome) {
        match outcome {
            TranslationOutcome::Translated {
                id,
                original,
                translated,
                target_language,
            } => {
                tracing::info!(
                    segment_id = %id,
                    original = %original,
                    translated = %translated,
                    target = %target_language,
                    "Segment translated"
                );
                self.emit(SessionEvent::SegmentTranslated {
                    id,
                    translated: translated.clone(),
                });
                self.speak(id, &translated, &target_language);
            }
            TranslationOutcome::Failed { id, error } => {
                self.emit(SessionEvent::SegmentFailed { id, error });
            }
        }
    }

    /// Decided here, at the moment of speaking, not at dispatch.
    fn speak(&self, id: SegmentId, text: &str, language: &str) {
        if !self.tts_enabled.load(Ordering::SeqCst) || !self.tts.is_connected() {
            return;
        }
        match self.tts.enqueue_speak(text, Some(language)) {
            Ok(pending) => {
                let events = self.events.clone();
                tokio::spawn(async move {
                    if let Err(e) = pending.wait().await {
                        tracing::warn!(segment_id = %id, error = %e, "Speech failed");
                        let _ = events.send(SessionEvent::SpeechFailed {
                            id,
                            error: e.to_string(),
                        });
                    }
                });
            }
            Err(e) => {
                tracing::debug!(segment_id = %id, error = %e, "TTS not ready, skipping speech");
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::TranslationRequest;
    use crate::voice::playback::{encode_wav_bytes, AudioBuffer};
    use async_trait::async_trait;
    use base64::Engine;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    // ── Fakes ─────────────────────────────────────────────────────

    struct FakeTranslator {
        delay: Duration,
    }

    #[async_trait]
    impl Translator for FakeTranslator {
        fn name(&self) -> &str {
            "fake"
        }

        async fn translate(&self, request: &TranslationRequest) -> anyhow::Result<String> {
            tokio::time::sleep(self.delay).await;
            Ok(format!("[{}] {}", request.target_language, request.text))
        }
    }

    /// Emits the given frames once, then ends.
    struct ScriptedSource {
        frames: Vec<AudioFrame>,
        task: Mutex<Option<JoinHandle<()>>>,
    }

    impl ScriptedSource {
        fn new(frames: Vec<AudioFrame>) -> Self {
            Self {
                frames,
                task: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl AudioSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn start(&self, tx: mpsc::Sender<AudioFrame>) -> anyhow::Result<()> {
            let frames = self.frames.clone();
            *self.task.lock() = Some(tokio::spawn(async move {
                for frame in frames {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }));
            Ok(())
        }

        async fn stop(&self) {
            if let Some(task) = self.task.lock().take() {
                task.abort();
            }
        }
    }

    struct NullSink;

    #[async_trait]
    impl AudioSink for NullSink {
        fn name(&self) -> &str {
            "null"
        }

        async fn play(&self, _buffer: &AudioBuffer) -> anyhow::Result<()> {
            Ok(())
        }
    }

    // ── Fake servers ──────────────────────────────────────────────

    /// STT server: forwards everything it receives; sends `script` frames
    /// after the first audio frame arrives.
    async fn spawn_stt_server(
        script: Vec<Value>,
    ) -> (String, mpsc::UnboundedReceiver<WsMessage>, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let mut script = Some(script);
            while let Some(Ok(msg)) = ws.next().await {
                let is_audio = matches!(msg, WsMessage::Binary(_));
                let is_stop = msg == WsMessage::Text(r#"{"type":"stop"}"#.into());
                let _ = seen_tx.send(msg);
                if is_audio {
                    if let Some(frames) = script.take() {
                        for frame in frames {
                            ws.send(WsMessage::Text(frame.to_string().into()))
                                .await
                                .unwrap();
                        }
                    }
                }
                if is_stop {
                    let _ = ws.close(None).await;
                    break;
                }
            }
        });
        (url, seen_rx, handle)
    }

    /// TTS server: answers list_voices and synthesize, forwards commands.
    async fn spawn_tts_server() -> (String, mpsc::UnboundedReceiver<Value>, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let wav = encode_wav_bytes(&AudioBuffer::mono(vec![0.0; 240], 24_000)).unwrap();
            let chunk = base64::engine::general_purpose::STANDARD.encode(wav);
            while let Some(Ok(msg)) = ws.next().await {
                let WsMessage::Text(text) = msg else { continue };
                let cmd: Value = serde_json::from_str(text.as_str()).unwrap();
                let _ = seen_tx.send(cmd.clone());
                let replies = match cmd["command"].as_str() {
                    Some("list_voices") => vec![json!({
                        "type": "voices", "voice": "af_heart", "voices": ["af_heart", "ef_dora"]
                    })],
                    Some("set_voice") => {
                        vec![json!({"type": "voice_changed", "voice": cmd["voice"]})]
                    }
                    Some("synthesize") => vec![
                        json!({"type": "synthesis_started"}),
                        json!({"type": "audio_chunk", "chunk": chunk, "index": 0, "total": 1}),
                        json!({"type": "synthesis_completed"}),
                    ],
                    _ => vec![],
                };
                for reply in replies {
                    ws.send(WsMessage::Text(reply.to_string().into()))
                        .await
                        .unwrap();
                }
            }
        });
        (url, seen_rx, handle)
    }

    fn one_frame_at_48k() -> Vec<AudioFrame> {
        vec![AudioFrame {
            samples: vec![0.1; 960],
            sample_rate: 48_000,
        }]
    }

    fn context(stt_url: &str, tts_url: &str, translate_delay: Duration) -> AppContext {
        let mut config = Config::default();
        config.stt.url = stt_url.to_string();
        config.tts.url = tts_url.to_string();
        config.tts.voice_switch_timeout_ms = 500;
        AppContext {
            config,
            translator: Arc::new(FakeTranslator {
                delay: translate_delay,
            }),
            audio_source: Arc::new(ScriptedSource::new(one_frame_at_48k())),
            audio_sink: Arc::new(NullSink),
        }
    }

    async fn next_matching(
        rx: &mut broadcast::Receiver<SessionEvent>,
        mut pred: impl FnMut(&SessionEvent) -> bool,
    ) -> SessionEvent {
        loop {
            let event = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for session event")
                .expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    fn word(w: &str) -> Value {
        json!({"type": "word", "word": w, "start_time": 0.0})
    }

    // ── Tests ─────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn router_flushes_a_lone_word_after_the_idle_timeout() {
        let (stt_tx, stt_rx) = mpsc::unbounded_channel();
        let (_control_tx, control_rx) = mpsc::unbounded_channel();
        let history = Arc::new(SegmentHistory::new());
        let (dispatcher, outcome_rx) = TranslationDispatcher::new(
            Arc::new(FakeTranslator {
                delay: Duration::ZERO,
            }),
            Arc::clone(&history),
            "en",
            "es",
            Duration::from_secs(5),
        );
        let (events, mut rx) = broadcast::channel(16);
        let router = Router {
            segmenter: Segmenter::new(crate::voice::segmenter::SegmenterConfig {
                idle_timeout_ms: 2_000,
                ..Default::default()
            }),
            stt_rx,
            outcome_rx,
            control_rx,
            history: Arc::clone(&history),
            dispatcher,
            tts: TtsSession::new("ws://127.0.0.1:9", Default::default(), Arc::new(NullSink)),
            tts_enabled: Arc::new(AtomicBool::new(false)),
            events,
        };
        let task = tokio::spawn(router.run());

        stt_tx
            .send(SttEvent::Word {
                word: "Hello".into(),
                start_time: 0.0,
                end_time: None,
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert!(history.is_empty(), "flushed before the idle timeout");

        tokio::time::sleep(Duration::from_millis(200)).await;
        let segments = history.snapshot();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].original_text, "Hello");

        let created = next_matching(&mut rx, |e| {
            matches!(e, SessionEvent::SegmentCreated { .. })
        })
        .await;
        let SessionEvent::SegmentCreated { segment } = created else {
            unreachable!()
        };
        assert_eq!(segment.id, segments[0].id);
        let translated = next_matching(&mut rx, |e| {
            matches!(e, SessionEvent::SegmentTranslated { .. })
        })
        .await;
        assert_eq!(
            translated,
            SessionEvent::SegmentTranslated {
                id: segment.id,
                translated: "[es] Hello".into()
            }
        );

        task.abort();
    }

    #[tokio::test]
    async fn words_become_translated_segments() {
        let (stt_url, mut stt_seen, stt_server) =
            spawn_stt_server(vec![word("Hello"), word("world.")]).await;
        let orchestrator =
            SessionOrchestrator::new(context(&stt_url, "ws://127.0.0.1:9", Duration::ZERO));
        let mut events = orchestrator.subscribe();

        orchestrator.start().await.unwrap();

        let created = next_matching(&mut events, |e| {
            matches!(e, SessionEvent::SegmentCreated { .. })
        })
        .await;
        let SessionEvent::SegmentCreated { segment } = created else {
            unreachable!()
        };
        assert_eq!(segment.original_text, "Hello world.");

        let translated = next_matching(&mut events, |e| {
            matches!(e, SessionEvent::SegmentTranslated { .. })
        })
        .await;
        assert_eq!(
            translated,
            SessionEvent::SegmentTranslated {
                id: segment.id,
                translated: "[es] Hello world.".into()
            }
        );
        assert_eq!(orchestrator.history()[0].translated_text, "[es] Hello world.");
        assert_eq!(
            orchestrator.segment(segment.id).unwrap().translated_text,
            "[es] Hello world."
        );

        // Language first, then 960 samples at 48kHz resampled to 480 at 24kHz.
        let first = stt_seen.recv().await.unwrap();
        assert_eq!(
            first,
            WsMessage::Text(r#"{"type":"setlanguage","lang":"en"}"#.into())
        );
        match stt_seen.recv().await.unwrap() {
            WsMessage::Binary(data) => assert_eq!(data.len(), 480 * 4),
            other => panic!("expected audio, got {other:?}"),
        }

        orchestrator.shutdown().await;
        stt_server.abort();
    }

    #[tokio::test]
    async fn translations_are_spoken_when_tts_is_enabled() {
        let (stt_url, _stt_seen, stt_server) =
            spawn_stt_server(vec![json!({"type": "final", "text": "Good morning"})]).await;
        let (tts_url, mut tts_seen, tts_server) = spawn_tts_server().await;
        let orchestrator =
            SessionOrchestrator::new(context(&stt_url, &tts_url, Duration::ZERO));
        let mut events = orchestrator.subscribe();

        assert!(orchestrator.toggle_tts().await.unwrap());
        assert_eq!(tts_seen.recv().await.unwrap()["command"], "list_voices");
        orchestrator.start().await.unwrap();

        next_matching(&mut events, |e| {
            matches!(e, SessionEvent::SegmentTranslated { .. })
        })
        .await;

        // "es" maps to ef_dora, which the server offers.
        let switch = timeout(Duration::from_secs(5), tts_seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(switch, json!({"command": "set_voice", "voice": "ef_dora"}));
        let synth = timeout(Duration::from_secs(5), tts_seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            synth,
            json!({"command": "synthesize", "text": "[es] Good morning", "language": "es"})
        );

        orchestrator.shutdown().await;
        stt_server.abort();
        tts_server.abort();
    }

    #[tokio::test]
    async fn translation_resolving_after_tts_disabled_is_not_spoken() {
        let (stt_url, _stt_seen, stt_server) =
            spawn_stt_server(vec![json!({"type": "final", "text": "Too late"})]).await;
        let (tts_url, mut tts_seen, tts_server) = spawn_tts_server().await;
        let orchestrator = SessionOrchestrator::new(context(
            &stt_url,
            &tts_url,
            Duration::from_millis(300),
        ));
        let mut events = orchestrator.subscribe();

        orchestrator.set_tts_enabled(true).await.unwrap();
        orchestrator.start().await.unwrap();
        next_matching(&mut events, |e| {
            matches!(e, SessionEvent::SegmentCreated { .. })
        })
        .await;

        // Disable while the translation is still in flight.
        assert!(!orchestrator.toggle_tts().await.unwrap());
        next_matching(&mut events, |e| {
            matches!(e, SessionEvent::SegmentTranslated { .. })
        })
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let commands: Vec<Value> = std::iter::from_fn(|| tts_seen.try_recv().ok()).collect();
        assert!(
            commands.iter().all(|c| c["command"] != "synthesize"),
            "unexpected synthesis: {commands:?}"
        );
        assert_eq!(orchestrator.tts().state(), ConnectionState::Disconnected);

        orchestrator.shutdown().await;
        stt_server.abort();
        tts_server.abort();
    }

    #[tokio::test]
    async fn stop_sends_stop_and_cancels_idle_flush() {
        let (stt_url, mut stt_seen, stt_server) = spawn_stt_server(vec![word("pending")]).await;
        let orchestrator =
            SessionOrchestrator::new(context(&stt_url, "ws://127.0.0.1:9", Duration::ZERO));
        let mut events = orchestrator.subscribe();

        orchestrator.start().await.unwrap();
        // Wait until the scripted word has been delivered.
        loop {
            if matches!(stt_seen.recv().await, Some(WsMessage::Binary(_))) {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        orchestrator.stop().await;

        loop {
            let msg = timeout(Duration::from_secs(5), stt_seen.recv())
                .await
                .unwrap()
                .unwrap();
            if msg == WsMessage::Text(r#"{"type":"stop"}"#.into()) {
                break;
            }
        }
        next_matching(&mut events, |e| {
            *e == SessionEvent::SttState {
                state: ConnectionState::Disconnected,
            }
        })
        .await;

        let status = orchestrator.status().await;
        assert!(!status.running);
        assert_eq!(status.stt, ConnectionState::Disconnected);
        // The idle flush was cancelled, so the lone word never became a segment.
        assert_eq!(status.segments, 0);

        orchestrator.shutdown().await;
        stt_server.abort();
    }

    #[tokio::test]
    async fn failed_stt_connect_fails_start() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let orchestrator =
            SessionOrchestrator::new(context(&url, "ws://127.0.0.1:9", Duration::ZERO));
        assert!(orchestrator.start().await.is_err());
        let status = orchestrator.status().await;
        assert!(!status.running);
        assert_eq!(status.stt, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn set_languages_and_clear_history() {
        let (stt_url, mut stt_seen, stt_server) =
            spawn_stt_server(vec![word("Uno."), word("Dos.")]).await;
        let orchestrator =
            SessionOrchestrator::new(context(&stt_url, "ws://127.0.0.1:9", Duration::ZERO));
        let mut events = orchestrator.subscribe();

        orchestrator.start().await.unwrap();
        for _ in 0..2 {
            next_matching(&mut events, |e| {
                matches!(e, SessionEvent::SegmentTranslated { .. })
            })
            .await;
        }
        assert_eq!(orchestrator.status().await.segments, 2);

        orchestrator.clear_history();
        assert!(orchestrator.history().is_empty());

        orchestrator.set_languages("es", "ja");
        let status = orchestrator.status().await;
        assert_eq!(
            (status.source_language.as_str(), status.target_language.as_str()),
            ("es", "ja")
        );
        loop {
            let msg = timeout(Duration::from_secs(5), stt_seen.recv())
                .await
                .unwrap()
                .unwrap();
            if msg == WsMessage::Text(r#"{"type":"setlanguage","lang":"es"}"#.into()) {
                break;
            }
        }

        orchestrator.shutdown().await;
        stt_server.abort();
    }
}
