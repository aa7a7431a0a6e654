//! Audio capture sources.
//!
//! Device I/O stays behind [`AudioSource`]: a source pushes mono frames at
//! its own native rate into a channel, and the session resamples them to
//! the STT rate before sending. Two sources ship for headless use: a WAV
//! file replayed in real time and raw 16-bit PCM read from stdin.

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::playback::read_wav_samples;

/// Frame length used by the shipped sources.
pub const DEFAULT_FRAME_MS: u32 = 20;

/// One block of captured mono samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Microphone-like audio source.
#[async_trait]
pub trait AudioSource: Send + Sync {
    fn name(&self) -> &str;

    /// Begin delivering frames on `frames`. Returns once capture is running;
    /// the channel closes when the source runs dry or is stopped.
    async fn start(&self, frames: mpsc::Sender<AudioFrame>) -> anyhow::Result<()>;

    /// Halt capture. Safe to call when not started.
    async fn stop(&self);
}

fn frame_len(sample_rate: u32, frame_ms: u32) -> usize {
    ((u64::from(sample_rate) * u64::from(frame_ms)) / 1000).max(1) as usize
}

/// Average interleaved channels down to mono.
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = usize::from(channels.max(1));
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

// ── WAV file ───────────────────────────────────────────────────────

/// Replays a WAV file as if it were live microphone input.
pub struct WavFileSource {
    path: PathBuf,
    frame_ms: u32,
    realtime: bool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WavFileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            frame_ms: DEFAULT_FRAME_MS,
            realtime: true,
            task: Mutex::new(None),
        }
    }

    /// Deliver frames as fast as the consumer takes them.
    pub fn unpaced(mut self) -> Self {
        self.realtime = false;
        self
    }

    pub fn with_frame_ms(mut self, frame_ms: u32) -> Self {
        self.frame_ms = frame_ms.max(1);
        self
    }

    fn read_mono(path: &Path) -> anyhow::Result<(Vec<f32>, u32)> {
        let reader = hound::WavReader::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let (interleaved, spec) = read_wav_samples(reader)?;
        Ok((downmix(&interleaved, spec.channels), spec.sample_rate))
    }
}

#[async_trait]
impl AudioSource for WavFileSource {
    fn name(&self) -> &str {
        "wav-file"
    }

    async fn start(&self, frames: mpsc::Sender<AudioFrame>) -> anyhow::Result<()> {
        let path = self.path.clone();
        let (samples, sample_rate) = tokio::task::spawn_blocking(move || Self::read_mono(&path))
            .await
            .context("WAV reader task panicked")??;

        tracing::info!(
            path = %self.path.display(),
            sample_rate,
            seconds = samples.len() as f64 / f64::from(sample_rate.max(1)),
            "Capturing from WAV file"
        );

        let chunk = frame_len(sample_rate, self.frame_ms);
        let pace = Duration::from_millis(u64::from(self.frame_ms));
        let realtime = self.realtime;
        let task = tokio::spawn(async move {
            let mut ticker = interval(pace);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            for block in samples.chunks(chunk) {
                if realtime {
                    ticker.tick().await;
                }
                let frame = AudioFrame {
                    samples: block.to_vec(),
                    sample_rate,
                };
                if frames.send(frame).await.is_err() {
                    break;
                }
            }
            tracing::debug!("WAV capture finished");
        });

        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

// ── Stdin PCM ──────────────────────────────────────────────────────

/// Reads raw signed 16-bit little-endian mono PCM from stdin
/// (e.g. `arecord -f S16_LE -c 1 -r 48000 | moa-voice-translate run --input -`).
pub struct StdinPcmSource {
    sample_rate: u32,
    frame_ms: u32,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StdinPcmSource {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frame_ms: DEFAULT_FRAME_MS,
            task: Mutex::new(None),
        }
    }
}

/// Convert s16le bytes to f32 samples. A trailing odd byte is ignored.
pub fn s16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32_768.0)
        .collect()
}

/// Read s16le PCM from `reader` until EOF, sending one frame per read.
/// Reads may split a sample; its first byte is carried into the next read.
async fn pump_s16le<R: AsyncRead + Unpin>(
    mut reader: R,
    sample_rate: u32,
    byte_len: usize,
    frames: mpsc::Sender<AudioFrame>,
) {
    let mut buf = vec![0u8; byte_len.max(2)];
    let mut carry: Option<u8> = None;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "PCM read failed, ending capture");
                break;
            }
        };
        let mut bytes = Vec::with_capacity(n + 1);
        bytes.extend(carry.take());
        bytes.extend_from_slice(&buf[..n]);
        if bytes.len() % 2 == 1 {
            carry = bytes.pop();
        }
        if bytes.is_empty() {
            continue;
        }
        let frame = AudioFrame {
            samples: s16le_to_f32(&bytes),
            sample_rate,
        };
        if frames.send(frame).await.is_err() {
            break;
        }
    }
    if carry.is_some() {
        tracing::debug!("PCM input ended mid-sample, dropping the last byte");
    }
}

#[async_trait]
impl AudioSource for StdinPcmSource {
    fn name(&self) -> &str {
        "stdin-pcm"
    }

    async fn start(&self, frames: mpsc::Sender<AudioFrame>) -> anyhow::Result<()> {
        let sample_rate = self.sample_rate;
        let byte_len = frame_len(sample_rate, self.frame_ms) * 2;
        tracing::info!(sample_rate, "Capturing s16le PCM from stdin");

        let task = tokio::spawn(async move {
            pump_s16le(tokio::io::stdin(), sample_rate, byte_len, frames).await;
            tracing::debug!("stdin capture finished");
        });

        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
