//! Channel mixer: device-native PCM in, mono float samples out.
//!
//! Device callbacks hand over interleaved buffers in whatever format and
//! channel layout the stream was opened with. The mixer folds those down to
//! mono (uniform-weight average over the active channels) and the
//! [`FrameAccumulator`] cuts the result into fixed-length frames at the
//! device rate, ready for the resampler stage.

use crate::config::{SampleFormat, StreamSpec, ALL_CHANNELS};

/// Mixdown of interleaved float samples to mono.
pub(crate) struct ChannelMixer {
    channels: usize,
    /// Indices of the channels contributing to the mix; `None` when the mask
    /// selects all of them.
    active: Option<Vec<usize>>,
}

impl ChannelMixer {
    pub(crate) fn new(channels: u32, channel_mask: u64) -> Self {
        let channels = channels as usize;
        let active = if channel_mask == ALL_CHANNELS {
            None
        } else {
            Some(
                (0..channels)
                    .filter(|ch| channel_mask & (1u64 << ch) != 0)
                    .collect(),
            )
        };
        Self { channels, active }
    }

    /// Appends `interleaved.len() / channels` mono samples to `out`.
    pub(crate) fn mix_into(&self, out: &mut Vec<f32>, interleaved: &[f32]) {
        debug_assert_eq!(interleaved.len() % self.channels, 0);

        match &self.active {
            Some(active) => {
                let m = 1.0 / active.len().max(1) as f32;
                for frame in interleaved.chunks_exact(self.channels) {
                    out.push(active.iter().map(|&ch| frame[ch]).sum::<f32>() * m);
                }
            }
            None => match self.channels {
                1 => out.extend_from_slice(interleaved),
                2 => {
                    for frame in interleaved.chunks_exact(2) {
                        out.push((frame[0] + frame[1]) * 0.5);
                    }
                }
                n => {
                    let m = 1.0 / n as f32;
                    for frame in interleaved.chunks_exact(n) {
                        out.push(frame.iter().sum::<f32>() * m);
                    }
                }
            },
        }
    }
}

/// Reinterprets raw device bytes as at most `samples` interleaved float
/// sample frames, scaling 16-bit PCM by `1/32768`. Returns the number of
/// whole sample frames actually available.
pub(crate) fn convert_raw(
    scratch: &mut Vec<f32>,
    data: &[u8],
    samples: usize,
    channels: usize,
    format: SampleFormat,
) -> usize {
    scratch.clear();

    let available = data.len() / format.sample_size() / channels;
    let samples = samples.min(available);
    let values = samples * channels;

    match format {
        SampleFormat::Float32 => scratch.extend(
            data.chunks_exact(4)
                .take(values)
                .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
        ),
        SampleFormat::Int16 => scratch.extend(
            data.chunks_exact(2)
                .take(values)
                .map(|b| f32::from(i16::from_ne_bytes([b[0], b[1]])) * (1.0 / 32768.0)),
        ),
    }

    samples
}

/// How the accumulator presents a completed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccumulatorMode {
    /// Mono mixdown; a frame holds `frame_len` samples.
    Mixdown,
    /// Channels preserved for the multi-channel echo tail; a frame holds
    /// `frame_len * channels` interleaved samples.
    Interleaved,
}

/// Owns the partial-frame fill loop of a capture stream: consume arbitrarily
/// sized device callbacks, emit complete device-rate frames.
pub(crate) struct FrameAccumulator {
    spec: StreamSpec,
    mode: AccumulatorMode,
    mixer: ChannelMixer,
    /// Samples per completed frame (per channel in interleaved mode).
    frame_len: usize,
    pending: Vec<f32>,
    scratch: Vec<f32>,
}

impl FrameAccumulator {
    pub(crate) fn new(spec: StreamSpec, frame_len: usize, mode: AccumulatorMode) -> Self {
        Self {
            mixer: ChannelMixer::new(spec.channels, spec.channel_mask),
            spec,
            mode,
            frame_len,
            pending: Vec::with_capacity(frame_len * spec.channels as usize),
            scratch: Vec::new(),
        }
    }

    fn pending_frame_values(&self) -> usize {
        match self.mode {
            AccumulatorMode::Mixdown => self.frame_len,
            AccumulatorMode::Interleaved => self.frame_len * self.spec.channels as usize,
        }
    }

    /// Feeds `samples` interleaved sample frames of raw device bytes, calling
    /// `emit` once per completed frame.
    pub(crate) fn push(&mut self, data: &[u8], samples: usize, mut emit: impl FnMut(&[f32])) {
        let channels = self.spec.channels as usize;
        let got = convert_raw(&mut self.scratch, data, samples, channels, self.spec.format);
        if got < samples {
            tracing::warn!(
                expected = samples,
                available = got,
                "capture buffer shorter than announced, truncating"
            );
        }

        match self.mode {
            AccumulatorMode::Mixdown => {
                let scratch = std::mem::take(&mut self.scratch);
                self.mixer.mix_into(&mut self.pending, &scratch);
                self.scratch = scratch;
            }
            AccumulatorMode::Interleaved => self.pending.extend_from_slice(&self.scratch),
        }

        let frame_values = self.pending_frame_values();
        let mut offset = 0;
        while self.pending.len() - offset >= frame_values {
            emit(&self.pending[offset..offset + frame_values]);
            offset += frame_values;
        }
        self.pending.drain(..offset);
    }
}
