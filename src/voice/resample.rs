//! Linear-interpolation resampler for captured microphone audio.
//!
//! Capture devices run at whatever rate the hardware prefers (44.1kHz,
//! 48kHz, ...), while the STT service only accepts mono f32 PCM at
//! [`STT_SAMPLE_RATE`]. This is a pure function: the same input always
//! yields the same output, sample for sample.

/// Sample rate the STT service expects on the wire.
pub const STT_SAMPLE_RATE: u32 = 24_000;

/// Resample `input` from `from_rate` to `to_rate` using linear interpolation.
///
/// Produces `round(N · to_rate / from_rate)` samples. Output sample `i` sits
/// at source position `i · from_rate / to_rate` and is interpolated between
/// the two nearest source samples; indices past the end are clamped to the
/// last sample. Equal rates return the input unchanged.
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    if from_rate == 0 || to_rate == 0 {
        return Vec::new();
    }

    let ratio = f64::from(from_rate) / f64::from(to_rate);
    let out_len = (input.len() as f64 / ratio).round() as usize;
    let last = input.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx0 = (pos.floor() as usize).min(last);
            let idx1 = (idx0 + 1).min(last);
            let frac = (pos - idx0 as f64) as f32;
            let s0 = input[idx0];
            let s1 = input[idx1];
            s0 + (s1 - s0) * frac
        })
        .collect()
}

/// Resample to the STT wire rate.
pub fn to_stt_rate(input: &[f32], from_rate: u32) -> Vec<f32> {
    resample_linear(input, from_rate, STT_SAMPLE_RATE)
}
