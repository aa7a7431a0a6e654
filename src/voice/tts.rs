//! Text-to-speech WebSocket session.
//!
//! ## Protocol Overview
//!
//! 1. **Connect**: open the socket and immediately send `list_voices`; the
//!    `voices` reply arrives asynchronously and fills the voice selection
//! 2. **Requests**: `set_voice`, `set_language` and `synthesize` go through a
//!    single job queue. Exactly one request is in flight at a time and the
//!    next is not sent until the current one reaches a terminal reply
//!    (`voice_changed` / `language_changed` / `synthesis_completed` / `error`)
//! 3. **Audio**: every `audio_chunk` is decoded on arrival and appended to
//!    the [`PlaybackQueue`], independent of the request queue
//!
//! The protocol carries no request id. The in-flight request is identified
//! by position: the server must answer requests in the order they are sent,
//! one full response cycle each. Nothing here can verify that.

use anyhow::Context;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::backoff::ConnectionState;
use super::events::{parse_tts_message, TtsCommand, TtsServerMessage};
use super::language::{locale_for_language, voice_for_language, DEFAULT_VOICE};
use super::playback::{decode_wav_chunk, AudioSink, PlaybackQueue};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

// ── Errors & options ───────────────────────────────────────────────

/// Failure of a single TTS request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TtsError {
    #[error("TTS session is not connected")]
    NotConnected,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("TTS server error: {0}")]
    Server(String),
    #[error("TTS connection closed before the request completed")]
    Disconnected,
    #[error("failed to send TTS command: {0}")]
    Send(String),
}

/// Request timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsOptions {
    /// How long to wait for `voice_changed` / `language_changed`.
    pub voice_switch_timeout_ms: u64,
    /// How long one synthesis may take from `synthesize` to completion.
    pub synthesis_timeout_ms: u64,
}

impl Default for TtsOptions {
    fn default() -> Self {
        Self {
            voice_switch_timeout_ms: 5_000,
            synthesis_timeout_ms: 60_000,
        }
    }
}

// ── Internal state ─────────────────────────────────────────────────

type Reply = oneshot::Sender<Result<(), TtsError>>;

enum Job {
    Speak {
        text: String,
        language: Option<String>,
        done: Reply,
    },
    SetVoice {
        voice: String,
        done: Reply,
    },
    SetLanguage {
        language: String,
        done: Reply,
    },
}

/// Terminal reply the in-flight request is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    VoiceChanged,
    LanguageChanged,
    SynthesisCompleted,
}

impl Awaiting {
    fn label(self) -> &'static str {
        match self {
            Self::VoiceChanged => "voice_changed",
            Self::LanguageChanged => "language_changed",
            Self::SynthesisCompleted => "synthesis_completed",
        }
    }
}

struct InFlight {
    awaiting: Awaiting,
    done: Reply,
}

struct TtsInner {
    state: ConnectionState,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    jobs: Option<mpsc::UnboundedSender<Job>>,
    in_flight: Option<InFlight>,
    reader: Option<JoinHandle<()>>,
    processor: Option<JoinHandle<()>>,
    playback: Option<Arc<PlaybackQueue>>,
    current_voice: String,
    available_voices: BTreeSet<String>,
    current_language: Option<String>,
}

struct TtsShared {
    url: String,
    options: TtsOptions,
    sink: Arc<dyn AudioSink>,
    inner: Mutex<TtsInner>,
    state_tx: watch::Sender<ConnectionState>,
}

/// A queued TTS request.
#[must_use = "the request stays queued, but its result is lost unless awaited"]
pub struct PendingSpeech {
    rx: oneshot::Receiver<Result<(), TtsError>>,
}

impl PendingSpeech {
    /// Resolve when the request reaches a terminal reply.
    pub async fn wait(self) -> Result<(), TtsError> {
        // A dropped reply means the queue was torn down.
        self.rx.await.unwrap_or(Err(TtsError::Disconnected))
    }
}

/// Handle to one TTS WebSocket session. Cheap to clone.
#[derive(Clone)]
pub struct TtsSession {
    shared: Arc<TtsShared>,
}

impl TtsSession {
    pub fn new(url: impl Into<String>, options: TtsOptions, sink: Arc<dyn AudioSink>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(TtsShared {
                url: url.into(),
                options,
                sink,
                inner: Mutex::new(TtsInner {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    outbound: None,
                    jobs: None,
                    in_flight: None,
                    reader: None,
                    processor: None,
                    playback: None,
                    current_voice: DEFAULT_VOICE.to_string(),
                    available_voices: BTreeSet::new(),
                    current_language: None,
                }),
                state_tx,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch connection state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Voice confirmed by the server.
    pub fn current_voice(&self) -> String {
        self.shared.inner.lock().current_voice.clone()
    }

    pub fn available_voices(&self) -> Vec<String> {
        self.shared.inner.lock().available_voices.iter().cloned().collect()
    }

    pub fn current_language(&self) -> Option<String> {
        self.shared.inner.lock().current_language.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.shared
            .inner
            .lock()
            .playback
            .as_ref()
            .is_some_and(|p| p.is_playing() || p.pending() > 0)
    }

    /// Resolve once all decoded audio has finished playing.
    pub async fn wait_playback_idle(&self) {
        let playback = self.shared.inner.lock().playback.clone();
        if let Some(playback) = playback {
            playback.wait_idle().await;
        }
    }

    /// Open the socket and request the voice list. Resolves once the socket
    /// is open; the voice list arrives later. No-op while already active.
    pub async fn connect(&self) -> anyhow::Result<()> {
        let generation = {
            let mut inner = self.shared.inner.lock();
            if matches!(
                inner.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                return Ok(());
            }
            inner.generation += 1;
            self.shared.set_state(&mut inner, ConnectionState::Connecting);
            inner.generation
        };

        tracing::info!(url = %self.shared.url, "Connecting to TTS service");

        let ws_stream = match tokio_tungstenite::connect_async(self.shared.url.as_str())
            .await
            .with_context(|| format!("Failed to connect to TTS service at {}", self.shared.url))
        {
            Ok((ws_stream, _response)) => ws_stream,
            Err(e) => {
                let mut inner = self.shared.inner.lock();
                if inner.generation == generation {
                    self.shared.set_state(&mut inner, ConnectionState::Failed);
                }
                tracing::warn!(error = %e, "TTS connect failed");
                return Err(e);
            }
        };

        let (ws_sender, ws_receiver) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<WsMessage>();
        let (job_tx, job_rx) = mpsc::unbounded_channel::<Job>();

        let mut inner = self.shared.inner.lock();
        if inner.generation != generation {
            tracing::debug!("TTS socket opened after teardown, dropping it");
            return Ok(());
        }

        match serde_json::to_string(&TtsCommand::ListVoices) {
            Ok(json) => {
                let _ = out_tx.send(WsMessage::Text(json.into()));
            }
            Err(e) => tracing::error!(error = %e, "Failed to serialize list_voices"),
        }

        if let Some(old) = inner.playback.take() {
            old.shutdown();
        }
        inner.playback = Some(Arc::new(PlaybackQueue::spawn(Arc::clone(&self.shared.sink))));
        inner.outbound = Some(out_tx);
        inner.jobs = Some(job_tx);
        tokio::spawn(TtsShared::writer_loop(ws_sender, out_rx));
        inner.reader = Some(tokio::spawn(TtsShared::reader_loop(
            Arc::clone(&self.shared),
            ws_receiver,
            generation,
        )));
        inner.processor = Some(tokio::spawn(TtsShared::processor_loop(
            Arc::clone(&self.shared),
            job_rx,
            generation,
        )));
        self.shared.set_state(&mut inner, ConnectionState::Connected);
        tracing::info!(url = %self.shared.url, sink = self.shared.sink.name(), "TTS session connected");
        Ok(())
    }

    /// Switch voice directly. Waits for `voice_changed`; fails with
    /// [`TtsError::Timeout`] if the server stays silent.
    pub async fn set_voice(&self, voice: &str) -> Result<(), TtsError> {
        self.submit(|done| Job::SetVoice {
            voice: voice.to_string(),
            done,
        })
        .await
    }

    /// Switch the synthesis locale. Waits for `language_changed`.
    pub async fn set_language(&self, language: &str) -> Result<(), TtsError> {
        self.submit(|done| Job::SetLanguage {
            language: language.to_string(),
            done,
        })
        .await
    }

    /// Queue `text` for synthesis. Resolves when this item's synthesis
    /// completes (audio may still be playing).
    ///
    /// With a language code, the mapped voice is selected first when the
    /// server offers it; otherwise the current voice is used.
    pub async fn speak(&self, text: &str, language: Option<&str>) -> Result<(), TtsError> {
        self.enqueue_speak(text, language)?.wait().await
    }

    /// Queue `text` now and return a handle to await its completion later.
    /// Queue position is fixed at call time.
    pub fn enqueue_speak(
        &self,
        text: &str,
        language: Option<&str>,
    ) -> Result<PendingSpeech, TtsError> {
        let text = text.trim();
        if text.is_empty() {
            let (done, rx) = oneshot::channel();
            let _ = done.send(Ok(()));
            return Ok(PendingSpeech { rx });
        }
        self.enqueue(|done| Job::Speak {
            text: text.to_string(),
            language: language.map(str::to_string),
            done,
        })
    }

    async fn submit(&self, make: impl FnOnce(Reply) -> Job) -> Result<(), TtsError> {
        self.enqueue(make)?.wait().await
    }

    fn enqueue(&self, make: impl FnOnce(Reply) -> Job) -> Result<PendingSpeech, TtsError> {
        let (done, rx) = oneshot::channel();
        let inner = self.shared.inner.lock();
        if inner.state != ConnectionState::Connected {
            return Err(TtsError::NotConnected);
        }
        let Some(jobs) = inner.jobs.as_ref() else {
            return Err(TtsError::NotConnected);
        };
        jobs.send(make(done)).map_err(|_| TtsError::NotConnected)?;
        Ok(PendingSpeech { rx })
    }

    /// Close the socket, reject queued requests and discard queued or
    /// playing audio. Safe in any state.
    pub fn disconnect(&self) {
        let mut inner = self.shared.inner.lock();
        inner.generation += 1;
        TtsShared::teardown(&mut inner);
        if let Some(playback) = inner.playback.take() {
            playback.shutdown();
        }
        if inner.state != ConnectionState::Disconnected {
            tracing::info!(previous = %inner.state, "TTS session disconnected");
            self.shared
                .set_state(&mut inner, ConnectionState::Disconnected);
        }
    }
}

// ── Internal: socket & queue tasks ─────────────────────────────────

impl TtsShared {
    fn set_state(&self, inner: &mut TtsInner, state: ConnectionState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Drop the socket and reject every outstanding request.
    fn teardown(inner: &mut TtsInner) {
        if let Some(reader) = inner.reader.take() {
            reader.abort();
        }
        // Aborting the processor drops its queue; each queued reply sender
        // goes with it and the waiting caller sees `Disconnected`.
        if let Some(processor) = inner.processor.take() {
            processor.abort();
        }
        inner.jobs = None;
        inner.outbound = None;
        if let Some(in_flight) = inner.in_flight.take() {
            let _ = in_flight.done.send(Err(TtsError::Disconnected));
        }
    }

    async fn writer_loop(
        mut ws_sender: SplitSink<WsStream, WsMessage>,
        mut rx: mpsc::UnboundedReceiver<WsMessage>,
    ) {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                tracing::warn!(error = %e, "TTS WebSocket send failed, closing writer");
                break;
            }
        }
        let _ = ws_sender.close().await;
    }

    async fn processor_loop(
        shared: Arc<Self>,
        mut jobs: mpsc::UnboundedReceiver<Job>,
        generation: u64,
    ) {
        let switch_timeout = Duration::from_millis(shared.options.voice_switch_timeout_ms);
        let synth_timeout = Duration::from_millis(shared.options.synthesis_timeout_ms);

        while let Some(job) = jobs.recv().await {
            match job {
                Job::SetVoice { voice, done } => {
                    let result = shared
                        .request(
                            generation,
                            TtsCommand::SetVoice { voice },
                            Awaiting::VoiceChanged,
                            switch_timeout,
                        )
                        .await;
                    let _ = done.send(result);
                }
                Job::SetLanguage { language, done } => {
                    let result = shared
                        .request(
                            generation,
                            TtsCommand::SetLanguage { language },
                            Awaiting::LanguageChanged,
                            switch_timeout,
                        )
                        .await;
                    let _ = done.send(result);
                }
                Job::Speak {
                    text,
                    language,
                    done,
                } => {
                    if let Some(code) = language.as_deref() {
                        if let Err(TtsError::Disconnected) =
                            shared.select_voice_for(generation, code, switch_timeout).await
                        {
                            let _ = done.send(Err(TtsError::Disconnected));
                            continue;
                        }
                    }
                    let locale = language
                        .as_deref()
                        .map(|code| locale_for_language(code).to_string());
                    tracing::debug!(chars = text.len(), locale = ?locale, "Synthesizing");
                    let result = shared
                        .request(
                            generation,
                            TtsCommand::Synthesize {
                                text,
                                language: locale,
                            },
                            Awaiting::SynthesisCompleted,
                            synth_timeout,
                        )
                        .await;
                    let _ = done.send(result);
                }
            }
        }
    }

    /// Switch to the voice mapped for `code` when it differs from the
    /// current one and the server offers it. A failed switch is logged and
    /// synthesis goes ahead with the current voice.
    async fn select_voice_for(
        &self,
        generation: u64,
        code: &str,
        timeout: Duration,
    ) -> Result<(), TtsError> {
        let wanted = voice_for_language(code);
        {
            let inner = self.inner.lock();
            if inner.current_voice == wanted {
                return Ok(());
            }
            if !inner.available_voices.contains(wanted) {
                tracing::debug!(
                    language = %code,
                    voice = wanted,
                    current = %inner.current_voice,
                    "Voice not offered by server, keeping current voice"
                );
                return Ok(());
            }
        }
        match self
            .request(
                generation,
                TtsCommand::SetVoice {
                    voice: wanted.to_string(),
                },
                Awaiting::VoiceChanged,
                timeout,
            )
            .await
        {
            Err(TtsError::Disconnected) => Err(TtsError::Disconnected),
            Err(e) => {
                tracing::warn!(voice = wanted, error = %e, "Voice switch failed, using current voice");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Send one command and wait for its terminal reply.
    async fn request(
        &self,
        generation: u64,
        command: TtsCommand,
        awaiting: Awaiting,
        timeout: Duration,
    ) -> Result<(), TtsError> {
        let json = serde_json::to_string(&command).map_err(|e| TtsError::Send(e.to_string()))?;
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return Err(TtsError::Disconnected);
            }
            let Some(outbound) = inner.outbound.as_ref() else {
                return Err(TtsError::Disconnected);
            };
            if outbound.send(WsMessage::Text(json.into())).is_err() {
                return Err(TtsError::Disconnected);
            }
            inner.in_flight = Some(InFlight { awaiting, done: tx });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TtsError::Disconnected),
            Err(_) => {
                let mut inner = self.inner.lock();
                if inner.generation == generation
                    && inner
                        .in_flight
                        .as_ref()
                        .is_some_and(|f| f.awaiting == awaiting)
                {
                    inner.in_flight = None;
                }
                tracing::warn!(awaiting = awaiting.label(), "TTS request timed out");
                Err(TtsError::Timeout(awaiting.label()))
            }
        }
    }

    async fn reader_loop(
        shared: Arc<Self>,
        mut ws_receiver: SplitStream<WsStream>,
        generation: u64,
    ) {
        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(WsMessage::Text(text)) => shared.handle_text(text.as_str(), generation),
                Ok(WsMessage::Close(frame)) => {
                    tracing::info!(close_frame = ?frame, "TTS service closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "TTS WebSocket error");
                    break;
                }
            }
        }

        let mut inner = shared.inner.lock();
        if inner.generation != generation {
            return;
        }
        inner.generation += 1;
        inner.reader = None;
        Self::teardown(&mut inner);
        shared.set_state(&mut inner, ConnectionState::Failed);
        tracing::warn!("TTS connection lost, queued requests rejected");
    }

    fn resolve(&self, inner: &mut TtsInner, reply: TtsServerMessage) {
        let result = match &reply {
            TtsServerMessage::Error { message } => Err(TtsError::Server(message.clone())),
            _ => Ok(()),
        };
        let matches = match (&reply, inner.in_flight.as_ref().map(|f| f.awaiting)) {
            (TtsServerMessage::Error { .. }, Some(_)) => true,
            (TtsServerMessage::VoiceChanged { .. }, Some(Awaiting::VoiceChanged)) => true,
            (TtsServerMessage::LanguageChanged { .. }, Some(Awaiting::LanguageChanged)) => true,
            (TtsServerMessage::SynthesisCompleted, Some(Awaiting::SynthesisCompleted)) => true,
            _ => false,
        };
        if matches {
            if let Some(in_flight) = inner.in_flight.take() {
                let _ = in_flight.done.send(result);
            }
        } else if let TtsServerMessage::Error { message } = reply {
            tracing::warn!(error = %message, "TTS error with no request in flight");
        }
    }

    fn handle_text(&self, text: &str, generation: u64) {
        let msg = match parse_tts_message(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed TTS frame");
                return;
            }
        };

        // Decode outside the lock; chunks still land in arrival order since
        // this runs on the single reader task.
        if let TtsServerMessage::AudioChunk {
            chunk,
            index,
            total,
            sample_rate,
        } = &msg
        {
            let buffer = match decode_wav_chunk(chunk) {
                Ok(buffer) => buffer,
                Err(e) => {
                    tracing::warn!(index = ?index, error = %e, "Dropping undecodable audio chunk");
                    return;
                }
            };
            if sample_rate.is_some_and(|r| r != buffer.sample_rate) {
                tracing::debug!(
                    declared = ?sample_rate,
                    actual = buffer.sample_rate,
                    "Audio chunk rate differs from header"
                );
            }
            let playback = {
                let inner = self.inner.lock();
                if inner.generation != generation {
                    return;
                }
                inner.playback.clone()
            };
            tracing::trace!(index = ?index, total = ?total, samples = buffer.samples.len(), "Audio chunk");
            if let Some(playback) = playback {
                playback.enqueue(buffer);
            }
            return;
        }

        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        match msg {
            TtsServerMessage::Voices { voice, voices } => {
                tracing::info!(voice = %voice, count = voices.len(), "TTS voices available");
                if !voice.is_empty() {
                    inner.current_voice = voice;
                }
                inner.available_voices = voices.into_iter().collect();
            }
            TtsServerMessage::VoiceChanged { ref voice } => {
                tracing::info!(voice = %voice, "TTS voice changed");
                inner.current_voice = voice.clone();
                self.resolve(&mut inner, msg);
            }
            TtsServerMessage::LanguageChanged { ref language } => {
                tracing::debug!(language = ?language, "TTS language changed");
                if language.is_some() {
                    inner.current_language = language.clone();
                }
                self.resolve(&mut inner, msg);
            }
            TtsServerMessage::SynthesisStarted => {
                tracing::debug!("Synthesis started");
            }
            TtsServerMessage::SynthesisCompleted | TtsServerMessage::Error { .. } => {
                self.resolve(&mut inner, msg);
            }
            TtsServerMessage::Unknown { kind } => {
                tracing::debug!(kind = %kind, "Ignoring unknown TTS event");
            }
            TtsServerMessage::AudioChunk { .. } => {}
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::playback::{encode_wav_bytes, AudioBuffer};
    use base64::Engine;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    type ServerWs = WebSocketStream<TcpStream>;

    #[derive(Default)]
    struct CountingSink {
        played: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl AudioSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }

        async fn play(&self, _buffer: &AudioBuffer) -> anyhow::Result<()> {
            self.played.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn bind() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> ServerWs {
        let (tcp, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(tcp).await.unwrap()
    }

    async fn recv_json(ws: &mut ServerWs) -> Value {
        loop {
            let msg = timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for client")
                .expect("client went away")
                .unwrap();
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn send_json(ws: &mut ServerWs, value: Value) {
        ws.send(WsMessage::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    fn wav_chunk() -> String {
        let wav = encode_wav_bytes(&AudioBuffer::mono(vec![0.1; 240], 24_000)).unwrap();
        base64::engine::general_purpose::STANDARD.encode(wav)
    }

    async fn answer_synthesis(ws: &mut ServerWs) {
        send_json(ws, json!({"type": "synthesis_started"})).await;
        send_json(
            ws,
            json!({"type": "audio_chunk", "chunk": wav_chunk(), "index": 0, "total": 1, "sample_rate": 24000}),
        )
        .await;
        send_json(ws, json!({"type": "synthesis_completed"})).await;
    }

    /// Answers list_voices, set_voice (when `confirm_voice`) and synthesize;
    /// forwards every command it sees.
    fn spawn_auto_server(
        listener: TcpListener,
        voices: Vec<&'static str>,
        confirm_voice: bool,
    ) -> (JoinHandle<()>, mpsc::UnboundedReceiver<Value>) {
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            loop {
                let cmd = recv_json(&mut ws).await;
                let _ = seen_tx.send(cmd.clone());
                match cmd["command"].as_str() {
                    Some("list_voices") => {
                        send_json(
                            &mut ws,
                            json!({"type": "voices", "voice": "af_heart", "voices": voices}),
                        )
                        .await;
                    }
                    Some("set_voice") if confirm_voice => {
                        send_json(
                            &mut ws,
                            json!({"type": "voice_changed", "voice": cmd["voice"]}),
                        )
                        .await;
                    }
                    Some("synthesize") => answer_synthesis(&mut ws).await,
                    _ => {}
                }
            }
        });
        (handle, seen_rx)
    }

    fn session(url: String, sink: Arc<dyn AudioSink>) -> TtsSession {
        TtsSession::new(
            url,
            TtsOptions {
                voice_switch_timeout_ms: 200,
                synthesis_timeout_ms: 5_000,
            },
            sink,
        )
    }

    async fn wait_for_voices(tts: &TtsSession) {
        for _ in 0..100 {
            if !tts.available_voices().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("voice list never arrived");
    }

    #[tokio::test]
    async fn requests_fail_fast_when_not_connected() {
        let tts = session("ws://127.0.0.1:9".into(), Arc::new(CountingSink::default()));
        assert_eq!(tts.speak("hi", None).await, Err(TtsError::NotConnected));
        assert_eq!(tts.set_voice("af_heart").await, Err(TtsError::NotConnected));
        tts.disconnect();
        assert!(!tts.is_connected());
    }

    #[tokio::test]
    async fn three_speaks_are_sent_one_at_a_time_in_order() {
        let (listener, url) = bind().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            assert_eq!(recv_json(&mut ws).await["command"], "list_voices");
            let mut texts = Vec::new();
            for _ in 0..3 {
                let cmd = recv_json(&mut ws).await;
                assert_eq!(cmd["command"], "synthesize");
                texts.push(cmd["text"].as_str().unwrap().to_string());
                // Nothing else may arrive while this request is open.
                assert!(
                    timeout(Duration::from_millis(100), ws.next()).await.is_err(),
                    "second synthesize sent before the first completed"
                );
                answer_synthesis(&mut ws).await;
            }
            texts
        });

        let sink = Arc::new(CountingSink::default());
        let tts = session(url, sink.clone());
        tts.connect().await.unwrap();
        assert!(tts.is_connected());

        let (a, b, c) = tokio::join!(
            tts.speak("one", None),
            tts.speak("two", None),
            tts.speak("three", None)
        );
        assert_eq!((a, b, c), (Ok(()), Ok(()), Ok(())));
        assert_eq!(server.await.unwrap(), vec!["one", "two", "three"]);

        tts.wait_playback_idle().await;
        assert_eq!(sink.played.load(Ordering::SeqCst), 3);
        tts.disconnect();
    }

    #[tokio::test]
    async fn set_voice_timeout_does_not_block_speak() {
        let (listener, url) = bind().await;
        let (server, mut seen) = spawn_auto_server(listener, vec!["af_heart", "ef_dora"], false);

        let tts = session(url, Arc::new(CountingSink::default()));
        tts.connect().await.unwrap();

        assert_eq!(
            tts.set_voice("ef_dora").await,
            Err(TtsError::Timeout("voice_changed"))
        );
        // Never confirmed, so never applied.
        assert_eq!(tts.current_voice(), "af_heart");
        assert_eq!(tts.speak("still works", None).await, Ok(()));

        let commands: Vec<String> = std::iter::from_fn(|| seen.try_recv().ok())
            .map(|v| v["command"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(commands, vec!["list_voices", "set_voice", "synthesize"]);

        tts.disconnect();
        server.abort();
    }

    #[tokio::test]
    async fn speak_switches_to_the_mapped_voice_when_offered() {
        let (listener, url) = bind().await;
        let (server, mut seen) = spawn_auto_server(listener, vec!["af_heart", "ef_dora"], true);

        let tts = session(url, Arc::new(CountingSink::default()));
        tts.connect().await.unwrap();
        wait_for_voices(&tts).await;

        tts.speak("hola", Some("es")).await.unwrap();
        assert_eq!(tts.current_voice(), "ef_dora");

        let commands: Vec<Value> = std::iter::from_fn(|| seen.try_recv().ok()).collect();
        assert_eq!(commands[1], json!({"command": "set_voice", "voice": "ef_dora"}));
        assert_eq!(
            commands[2],
            json!({"command": "synthesize", "text": "hola", "language": "es"})
        );

        // Same language again: no second switch.
        tts.speak("otra vez", Some("es")).await.unwrap();
        assert_eq!(seen.recv().await.unwrap()["command"], "synthesize");

        tts.disconnect();
        server.abort();
    }

    #[tokio::test]
    async fn speak_keeps_current_voice_when_mapped_voice_is_missing() {
        let (listener, url) = bind().await;
        let (server, mut seen) = spawn_auto_server(listener, vec!["af_heart"], true);

        let tts = session(url, Arc::new(CountingSink::default()));
        tts.connect().await.unwrap();
        wait_for_voices(&tts).await;

        tts.speak("bonjour", Some("fr")).await.unwrap();
        assert_eq!(tts.current_voice(), "af_heart");

        let commands: Vec<Value> = std::iter::from_fn(|| seen.try_recv().ok()).collect();
        assert_eq!(commands.len(), 2);
        assert_eq!(
            commands[1],
            json!({"command": "synthesize", "text": "bonjour", "language": "fr-fr"})
        );

        tts.disconnect();
        server.abort();
    }

    #[tokio::test]
    async fn server_error_rejects_only_that_request() {
        let (listener, url) = bind().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            recv_json(&mut ws).await;
            recv_json(&mut ws).await;
            send_json(&mut ws, json!({"type": "error", "message": "model overloaded"})).await;
            recv_json(&mut ws).await;
            // A corrupt chunk is dropped and the request still completes.
            send_json(&mut ws, json!({"type": "audio_chunk", "chunk": "%%%"})).await;
            send_json(&mut ws, json!({"type": "synthesis_completed"})).await;
            let _ = ws.next().await;
        });

        let sink = Arc::new(CountingSink::default());
        let tts = session(url, sink.clone());
        tts.connect().await.unwrap();

        assert_eq!(
            tts.speak("first", None).await,
            Err(TtsError::Server("model overloaded".into()))
        );
        assert_eq!(tts.speak("second", None).await, Ok(()));
        assert_eq!(sink.played.load(Ordering::SeqCst), 0);

        tts.disconnect();
        server.abort();
    }

    #[tokio::test]
    async fn dropped_socket_rejects_queued_requests() {
        let (listener, url) = bind().await;
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            recv_json(&mut ws).await;
            recv_json(&mut ws).await;
            // Hang up mid-synthesis.
            drop(ws);
        });

        let tts = session(url, Arc::new(CountingSink::default()));
        tts.connect().await.unwrap();
        let mut state = tts.subscribe_state();

        let (a, b) = tokio::join!(tts.speak("one", None), tts.speak("two", None));
        assert_eq!(a, Err(TtsError::Disconnected));
        assert_eq!(b, Err(TtsError::Disconnected));

        timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Failed),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(tts.speak("three", None).await, Err(TtsError::NotConnected));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_rejects_in_flight_request() {
        let (listener, url) = bind().await;
        let (server, _seen) = spawn_auto_server(listener, vec!["af_heart", "ef_dora"], false);

        let tts = session(url, Arc::new(CountingSink::default()));
        tts.connect().await.unwrap();

        let pending = {
            let tts = tts.clone();
            tokio::spawn(async move { tts.set_voice("ef_dora").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        tts.disconnect();

        assert_eq!(pending.await.unwrap(), Err(TtsError::Disconnected));
        assert_eq!(tts.state(), ConnectionState::Disconnected);
        server.abort();
    }

    #[tokio::test]
    async fn voice_changed_after_disconnect_is_ignored() {
        let (listener, url) = bind().await;
        let (seen_tx, seen_rx) = oneshot::channel::<()>();
        let (go_tx, go_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            assert_eq!(recv_json(&mut ws).await["command"], "list_voices");
            send_json(
                &mut ws,
                json!({"type": "voices", "voice": "af_heart", "voices": ["af_heart", "ef_dora"]}),
            )
            .await;
            assert_eq!(recv_json(&mut ws).await["command"], "set_voice");
            let _ = seen_tx.send(());
            let _ = go_rx.await;
            // The client may already have closed the socket.
            let _ = ws
                .send(WsMessage::Text(
                    json!({"type": "voice_changed", "voice": "ef_dora"})
                        .to_string()
                        .into(),
                ))
                .await;
        });

        let tts = session(url, Arc::new(CountingSink::default()));
        tts.connect().await.unwrap();
        wait_for_voices(&tts).await;
        let old_generation = tts.shared.inner.lock().generation;

        let pending = {
            let tts = tts.clone();
            tokio::spawn(async move { tts.set_voice("ef_dora").await })
        };
        timeout(Duration::from_secs(5), seen_rx).await.unwrap().unwrap();
        tts.disconnect();
        let _ = go_tx.send(());
        tokio::time::sleep(Duration::from_millis(100)).await;

        // A reply from the torn-down socket must not touch voice state.
        tts.shared.handle_text(
            r#"{"type":"voice_changed","voice":"ef_dora"}"#,
            old_generation,
        );

        assert_eq!(pending.await.unwrap(), Err(TtsError::Disconnected));
        assert_eq!(tts.current_voice(), "af_heart");
        assert_eq!(tts.state(), ConnectionState::Disconnected);
        server.await.unwrap();
    }
}
