//! Decoded audio buffers, output sinks and the gapless playback queue.
//!
//! Synthesized speech arrives as base64-encoded WAV chunks. Each chunk is
//! decoded on its own into an [`AudioBuffer`] and appended to the
//! [`PlaybackQueue`]. One player task pulls buffers strictly in order and
//! hands them to an [`AudioSink`]; the next buffer starts the moment the
//! previous one's `play` resolves, so there is no gap and no reordering
//! regardless of how chunk arrival lines up with synthesis requests.

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::resample::resample_linear;

// ── Audio buffer ───────────────────────────────────────────────────

/// Interleaved f32 samples in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioBuffer {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    /// Natural playback length.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / f64::from(self.sample_rate))
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

// ── WAV decoding ───────────────────────────────────────────────────

/// Decode one base64 `audio_chunk` payload.
pub fn decode_wav_chunk(chunk_b64: &str) -> anyhow::Result<AudioBuffer> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(chunk_b64.trim())
        .context("audio chunk is not valid base64")?;
    decode_wav_bytes(&bytes)
}

/// Read every sample as interleaved f32 in `[-1, 1]`, whatever the
/// stored format.
pub fn read_wav_samples<R: std::io::Read>(
    reader: hound::WavReader<R>,
) -> anyhow::Result<(Vec<f32>, hound::WavSpec)> {
    let spec = reader.spec();
    let samples = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .context("corrupt float WAV samples")?,
        hound::SampleFormat::Int => {
            let scale = (1u64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<Vec<_>, _>>()
                .context("corrupt PCM WAV samples")?
        }
    };
    Ok((samples, spec))
}

/// Decode a complete WAV file held in memory.
pub fn decode_wav_bytes(bytes: &[u8]) -> anyhow::Result<AudioBuffer> {
    let reader = hound::WavReader::new(Cursor::new(bytes)).context("invalid WAV data")?;
    let (samples, spec) = read_wav_samples(reader)?;
    Ok(AudioBuffer {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Encode a buffer as 16-bit PCM WAV.
#[cfg(test)]
pub(crate) fn encode_wav_bytes(buffer: &AudioBuffer) -> anyhow::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: buffer.channels,
        sample_rate: buffer.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in &buffer.samples {
            let clamped = sample.clamp(-1.0, 1.0);
            writer.write_sample((clamped * f32::from(i16::MAX)) as i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

// ── Sinks ──────────────────────────────────────────────────────────

/// Audio output device abstraction.
#[async_trait]
pub trait AudioSink: Send + Sync {
    fn name(&self) -> &str;

    /// Play one buffer. Resolves at the buffer's natural end.
    async fn play(&self, buffer: &AudioBuffer) -> anyhow::Result<()>;

    /// Flush anything the sink buffers internally.
    async fn finish(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Discards audio but takes as long as a real device would.
#[derive(Debug, Default)]
pub struct PacedSink;

#[async_trait]
impl AudioSink for PacedSink {
    fn name(&self) -> &str {
        "paced"
    }

    async fn play(&self, buffer: &AudioBuffer) -> anyhow::Result<()> {
        tokio::time::sleep(buffer.duration()).await;
        Ok(())
    }
}

/// Appends everything played to a single WAV file.
///
/// The file takes the format of the first buffer. Later mono buffers at a
/// different rate are resampled to match.
pub struct WavFileSink {
    path: PathBuf,
    paced: bool,
    writer: Mutex<Option<hound::WavWriter<std::io::BufWriter<std::fs::File>>>>,
}

impl WavFileSink {
    pub fn new(path: impl AsRef<Path>, paced: bool) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            paced,
            writer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, buffer: &AudioBuffer) -> anyhow::Result<()> {
        let mut guard = self.writer.lock();
        if guard.is_none() {
            let spec = hound::WavSpec {
                channels: buffer.channels,
                sample_rate: buffer.sample_rate,
                bits_per_sample: 32,
                sample_format: hound::SampleFormat::Float,
            };
            let writer = hound::WavWriter::create(&self.path, spec)
                .with_context(|| format!("Failed to create {}", self.path.display()))?;
            tracing::info!(path = %self.path.display(), sample_rate = buffer.sample_rate, "Writing synthesized audio");
            *guard = Some(writer);
        }
        let Some(writer) = guard.as_mut() else {
            return Ok(());
        };

        let spec = writer.spec();
        let converted;
        let samples = if buffer.channels == 1
            && spec.channels == 1
            && buffer.sample_rate != spec.sample_rate
        {
            converted = resample_linear(&buffer.samples, buffer.sample_rate, spec.sample_rate);
            &converted
        } else {
            &buffer.samples
        };
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[async_trait]
impl AudioSink for WavFileSink {
    fn name(&self) -> &str {
        "wav-file"
    }

    async fn play(&self, buffer: &AudioBuffer) -> anyhow::Result<()> {
        self.write(buffer)?;
        if self.paced {
            tokio::time::sleep(buffer.duration()).await;
        }
        Ok(())
    }

    async fn finish(&self) -> anyhow::Result<()> {
        if let Some(writer) = self.writer.lock().take() {
            writer.finalize()?;
            tracing::info!(path = %self.path.display(), "Finalized synthesized audio file");
        }
        Ok(())
    }
}

// ── Playback queue ─────────────────────────────────────────────────

#[derive(Default)]
struct QueueState {
    buffers: VecDeque<AudioBuffer>,
    playing: bool,
    closed: bool,
}

struct PlaybackInner {
    state: Mutex<QueueState>,
    wake: Notify,
    idle: Notify,
    sink: Arc<dyn AudioSink>,
    played: AtomicU64,
}

/// Ordered queue of decoded buffers drained by one player task.
pub struct PlaybackQueue {
    inner: Arc<PlaybackInner>,
    player: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackQueue {
    /// Start the player task on the current runtime.
    pub fn spawn(sink: Arc<dyn AudioSink>) -> Self {
        let inner = Arc::new(PlaybackInner {
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            idle: Notify::new(),
            sink,
            played: AtomicU64::new(0),
        });
        let player = tokio::spawn(Self::player_loop(Arc::clone(&inner)));
        Self {
            inner,
            player: Mutex::new(Some(player)),
        }
    }

    /// Append a buffer. Starts playing immediately when idle.
    pub fn enqueue(&self, buffer: AudioBuffer) {
        if buffer.is_empty() {
            return;
        }
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.buffers.push_back(buffer);
        }
        self.inner.wake.notify_one();
    }

    pub fn is_playing(&self) -> bool {
        self.inner.state.lock().playing
    }

    /// Buffers waiting behind the one currently playing.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().buffers.len()
    }

    /// Buffers that finished playing.
    pub fn played(&self) -> u64 {
        self.inner.played.load(Ordering::Relaxed)
    }

    fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        !state.playing && state.buffers.is_empty()
    }

    /// Resolve once nothing is playing or queued.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Stop the player, discarding queued and playing audio.
    pub fn shutdown(&self) {
        if let Some(player) = self.player.lock().take() {
            player.abort();
        }
        let dropped = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.playing = false;
            let n = state.buffers.len();
            state.buffers.clear();
            n
        };
        if dropped > 0 {
            tracing::debug!(dropped, "Discarded queued audio");
        }
        self.inner.idle.notify_waiters();
    }

    async fn player_loop(inner: Arc<PlaybackInner>) {
        loop {
            let next = {
                let mut state = inner.state.lock();
                let next = state.buffers.pop_front();
                state.playing = next.is_some();
                next
            };
            let Some(buffer) = next else {
                inner.idle.notify_waiters();
                inner.wake.notified().await;
                continue;
            };
            if let Err(e) = inner.sink.play(&buffer).await {
                tracing::warn!(sink = inner.sink.name(), error = %e, "Audio sink failed, dropping buffer");
            }
            inner.played.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        if let Some(player) = self.player.get_mut().take() {
            player.abort();
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
