//! Streaming speech-to-text WebSocket session.
//!
//! ## Protocol Overview
//!
//! 1. **Connect**: open one WebSocket to the STT endpoint; re-send the
//!    recognition language if one was set before the socket opened
//! 2. **Stream**: send mono f32 little-endian PCM at 24kHz as binary frames,
//!    receive `word` / `final` / `error` JSON text frames
//! 3. **Stop**: send `{"type":"stop"}`; the server finishes and closes
//! 4. **Reconnect**: an unexpected close schedules a retry with exponential
//!    backoff ([`Reconnector`]); once the attempt budget is spent the session
//!    sits in `Failed` until `connect()` is called again
//!
//! Every manual `connect()` / `disconnect()` bumps a generation counter.
//! Background tasks (reader, retry timer) carry the generation they were
//! spawned for and go quiet once it is stale, so nothing from an old socket
//! can touch state after teardown.

use anyhow::Context;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::backoff::{ConnectionState, ReconnectPolicy, Reconnector};
use super::events::{parse_stt_message, SttControl, SttServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

// ── Events ─────────────────────────────────────────────────────────

/// Normalized event stream produced by [`SttSession`].
#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    /// One recognised word.
    Word {
        word: String,
        start_time: f64,
        end_time: Option<f64>,
    },
    /// The server closed an utterance.
    Final { text: String },
    /// The server reported an error. The session stays up.
    Error { message: String },
    /// Connection state transition.
    StateChanged(ConnectionState),
}

/// Encode mono f32 samples as a little-endian PCM byte frame.
pub fn encode_pcm_frame(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 4);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

// ── Session ────────────────────────────────────────────────────────

struct ConnSlot {
    machine: Reconnector,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    reader: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    stop_requested: bool,
    language: Option<String>,
}

struct Shared {
    url: String,
    slot: Mutex<ConnSlot>,
    events: mpsc::UnboundedSender<SttEvent>,
    frames_sent: AtomicU64,
}

/// Handle to one STT WebSocket session. Cheap to clone.
#[derive(Clone)]
pub struct SttSession {
    shared: Arc<Shared>,
}

impl SttSession {
    /// Create a disconnected session. Events arrive on the returned receiver.
    pub fn new(
        url: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<SttEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            url: url.into(),
            slot: Mutex::new(ConnSlot {
                machine: Reconnector::new(policy),
                generation: 0,
                outbound: None,
                reader: None,
                retry: None,
                stop_requested: false,
                language: None,
            }),
            events,
            frames_sent: AtomicU64::new(0),
        });
        (Self { shared }, event_rx)
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.slot.lock().machine.state()
    }

    /// Number of audio frames handed to the socket writer so far.
    pub fn frames_sent(&self) -> u64 {
        self.shared.frames_sent.load(Ordering::Relaxed)
    }

    /// Open the socket. No-op while already connecting or connected, unless
    /// the open socket was told to stop.
    ///
    /// Cancels any pending backoff retry. Resolves once the socket is open;
    /// a failure leaves the session in `Failed` and is returned.
    pub async fn connect(&self) -> anyhow::Result<()> {
        let generation = {
            let mut slot = self.shared.slot.lock();
            // A socket draining after `stop()` is on its way out; replace it
            // so its expected close cannot end the new stream.
            if slot.stop_requested && slot.machine.state() == ConnectionState::Connected {
                tracing::debug!("Replacing STT socket that is closing after stop");
                slot.machine.on_disconnect();
            }
            if !slot.machine.begin_connect() {
                tracing::debug!(state = %slot.machine.state(), "STT connect ignored, already active");
                return Ok(());
            }
            if let Some(retry) = slot.retry.take() {
                retry.abort();
            }
            if let Some(reader) = slot.reader.take() {
                reader.abort();
            }
            slot.outbound = None;
            slot.generation += 1;
            slot.stop_requested = false;
            self.shared.emit(SttEvent::StateChanged(ConnectionState::Connecting));
            slot.generation
        };

        tracing::info!(url = %self.shared.url, "Connecting to STT service");

        match Shared::open(&self.shared, generation).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut slot = self.shared.slot.lock();
                if slot.generation == generation {
                    slot.machine.on_connect_failed();
                    self.shared
                        .emit(SttEvent::StateChanged(slot.machine.state()));
                }
                tracing::warn!(url = %self.shared.url, error = %e, "STT connect failed");
                Err(e)
            }
        }
    }

    /// Send one frame of 24kHz mono samples. Frames are dropped, never
    /// buffered, unless the session is `Connected`.
    pub fn send_audio_frame(&self, samples: &[f32]) -> bool {
        if samples.is_empty() {
            return false;
        }
        let frame = encode_pcm_frame(samples);
        let slot = self.shared.slot.lock();
        if slot.machine.state() != ConnectionState::Connected {
            return false;
        }
        let Some(tx) = slot.outbound.as_ref() else {
            return false;
        };
        let sent = tx.send(WsMessage::Binary(frame.into())).is_ok();
        if sent {
            let n = self.shared.frames_sent.fetch_add(1, Ordering::Relaxed) + 1;
            if n == 1 || n % 500 == 0 {
                tracing::debug!(frames = n, samples = samples.len(), "Sending audio to STT");
            }
        }
        sent
    }

    /// Set the recognition language. Remembered across reconnects; sent
    /// immediately when connected. Returns whether it went out now.
    pub fn set_language(&self, code: &str) -> bool {
        let mut slot = self.shared.slot.lock();
        slot.language = Some(code.to_string());
        if slot.machine.state() != ConnectionState::Connected {
            return false;
        }
        slot.outbound
            .as_ref()
            .is_some_and(|tx| send_control(tx, &SttControl::SetLanguage { lang: code.into() }))
    }

    /// Ask the server to finish and close. The close that follows is
    /// treated as expected (no reconnect). Safe in any state.
    pub fn stop(&self) -> bool {
        let mut slot = self.shared.slot.lock();
        if slot.machine.state() != ConnectionState::Connected {
            return false;
        }
        slot.stop_requested = true;
        tracing::info!("Sending stop to STT service");
        slot.outbound
            .as_ref()
            .is_some_and(|tx| send_control(tx, &SttControl::Stop))
    }

    /// Force-close locally without waiting for the server. Cancels any
    /// retry timer. Safe in any state.
    pub fn disconnect(&self) {
        let mut slot = self.shared.slot.lock();
        slot.generation += 1;
        if let Some(retry) = slot.retry.take() {
            retry.abort();
        }
        if let Some(reader) = slot.reader.take() {
            reader.abort();
        }
        // Dropping the sender ends the writer, which closes the socket.
        slot.outbound = None;
        slot.stop_requested = false;
        let previous = slot.machine.state();
        slot.machine.on_disconnect();
        if previous != ConnectionState::Disconnected {
            tracing::info!(previous = %previous, "STT session disconnected");
            self.shared
                .emit(SttEvent::StateChanged(ConnectionState::Disconnected));
        }
    }
}

fn send_control(tx: &mpsc::UnboundedSender<WsMessage>, control: &SttControl) -> bool {
    match serde_json::to_string(control) {
        Ok(json) => tx.send(WsMessage::Text(json.into())).is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize STT control message");
            false
        }
    }
}

// ── Internal: socket lifecycle ─────────────────────────────────────

impl Shared {
    fn emit(&self, event: SttEvent) {
        let _ = self.events.send(event);
    }

    /// Open a socket for `generation` and start its reader/writer tasks.
    async fn open(shared: &Arc<Self>, generation: u64) -> anyhow::Result<()> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(shared.url.as_str())
            .await
            .with_context(|| format!("Failed to connect to STT service at {}", shared.url))?;
        let (ws_sender, ws_receiver) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<WsMessage>();

        let mut slot = shared.slot.lock();
        if slot.generation != generation {
            tracing::debug!("STT socket opened for a stale generation, dropping it");
            return Ok(());
        }
        slot.machine.on_open();
        if let Some(lang) = slot.language.clone() {
            send_control(&out_tx, &SttControl::SetLanguage { lang });
        }
        slot.outbound = Some(out_tx);
        tokio::spawn(Self::writer_loop(ws_sender, out_rx));
        slot.reader = Some(tokio::spawn(Self::reader_loop(
            Arc::clone(shared),
            ws_receiver,
            generation,
        )));
        shared.emit(SttEvent::StateChanged(ConnectionState::Connected));
        tracing::info!(url = %shared.url, "STT session connected");
        Ok(())
    }

    /// Drain outbound frames into the socket. Closes the socket once every
    /// sender is gone.
    async fn writer_loop(
        mut ws_sender: SplitSink<WsStream, WsMessage>,
        mut rx: mpsc::UnboundedReceiver<WsMessage>,
    ) {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                tracing::warn!(error = %e, "STT WebSocket send failed, closing writer");
                break;
            }
        }
        let _ = ws_sender.close().await;
        tracing::debug!("STT writer loop terminated");
    }

    /// Decode inbound frames in arrival order until the socket closes.
    async fn reader_loop(
        shared: Arc<Self>,
        mut ws_receiver: SplitStream<WsStream>,
        generation: u64,
    ) {
        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(WsMessage::Text(text)) => shared.handle_text(text.as_str(), generation),
                Ok(WsMessage::Binary(data)) => {
                    tracing::debug!(len = data.len(), "Ignoring binary frame from STT service");
                }
                Ok(WsMessage::Close(frame)) => {
                    tracing::info!(close_frame = ?frame, "STT service closed the connection");
                    break;
                }
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => {
                    // Handled by tungstenite automatically
                }
                Err(e) => {
                    tracing::warn!(error = %e, "STT WebSocket error");
                    break;
                }
            }
        }
        Self::on_socket_closed(&shared, generation);
    }

    fn handle_text(&self, text: &str, generation: u64) {
        if self.slot.lock().generation != generation {
            return;
        }
        match parse_stt_message(text) {
            Ok(SttServerMessage::Word {
                word,
                start_time,
                end_time,
            }) => self.emit(SttEvent::Word {
                word,
                start_time,
                end_time,
            }),
            Ok(SttServerMessage::Final { text }) => {
                tracing::debug!(text = %text, "STT final");
                self.emit(SttEvent::Final { text });
            }
            Ok(SttServerMessage::Error { message }) => {
                tracing::warn!(error = %message, "STT service reported an error");
                self.emit(SttEvent::Error { message });
            }
            Ok(SttServerMessage::Enhancement { kind }) => {
                tracing::debug!(kind = %kind, "Ignoring STT enhancement event");
            }
            Ok(SttServerMessage::Unknown { kind }) => {
                tracing::debug!(kind = %kind, "Ignoring unknown STT event");
            }
            Err(e) => {
                // A corrupt frame never takes the session down.
                tracing::warn!(error = %e, "Dropping malformed STT frame");
            }
        }
    }

    fn on_socket_closed(shared: &Arc<Self>, generation: u64) {
        let mut slot = shared.slot.lock();
        if slot.generation != generation {
            return;
        }
        slot.outbound = None;
        slot.reader = None;

        if slot.stop_requested {
            slot.stop_requested = false;
            slot.machine.on_disconnect();
            shared.emit(SttEvent::StateChanged(ConnectionState::Disconnected));
            tracing::info!("STT stream ended after stop");
            return;
        }

        match slot.machine.on_unexpected_close() {
            Some(delay) => {
                tracing::warn!(
                    attempt = slot.machine.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "STT connection dropped, scheduling reconnect"
                );
                shared.emit(SttEvent::StateChanged(ConnectionState::Reconnecting));
                slot.retry = Some(tokio::spawn(Self::retry_loop(
                    Arc::clone(shared),
                    generation,
                    delay,
                )));
            }
            None => {
                let state = slot.machine.state();
                if state == ConnectionState::Failed {
                    tracing::error!("STT reconnect attempts exhausted");
                }
                shared.emit(SttEvent::StateChanged(state));
            }
        }
    }

    /// Sleep, retry, and keep backing off until a socket opens or the
    /// attempt budget runs out.
    async fn retry_loop(shared: Arc<Self>, generation: u64, first_delay: Duration) {
        let mut delay = first_delay;
        loop {
            tokio::time::sleep(delay).await;
            {
                let slot = shared.slot.lock();
                if slot.generation != generation
                    || slot.machine.state() != ConnectionState::Reconnecting
                {
                    return;
                }
                tracing::info!(attempt = slot.machine.attempt(), "Reconnecting to STT service");
            }

            let err = match Self::open(&shared, generation).await {
                Ok(()) => return,
                Err(e) => e,
            };

            let mut slot = shared.slot.lock();
            if slot.generation != generation {
                return;
            }
            match slot.machine.on_connect_failed() {
                Some(next) => {
                    tracing::warn!(
                        error = %err,
                        attempt = slot.machine.attempt(),
                        delay_ms = next.as_millis() as u64,
                        "STT reconnect failed, backing off"
                    );
                    delay = next;
                }
                None => {
                    tracing::error!(error = %err, "STT reconnect attempts exhausted");
                    shared.emit(SttEvent::StateChanged(slot.machine.state()));
                    return;
                }
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
