//! Per-frame DSP chain: echo cancellation, RNN denoise, preprocessor.

use crate::config::NoiseCancelMode;
use crate::error::AudioInputError;
use crate::levels::LevelMeter;
use crate::preprocess::Preprocessor;
use crate::resync::AudioChunk;
use nnnoiseless::DenoiseState;
use speex_rust_aec::{speex_echo_cancellation, EchoCanceller};
use std::sync::Arc;

/// AGC ramp while transmitting, dB per second.
const AGC_INCREMENT_ACTIVE: i32 = 12;
/// AGC decay, dB per second.
const AGC_DECREMENT: i32 = -60;
/// AGC target level on the i16 scale.
const AGC_TARGET: i32 = 30_000;

/// Runtime-tunable DSP knobs; changing any of them goes through the
/// processor reset latch and rebuilds the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DspTunables {
    pub noise_cancel: NoiseCancelMode,
    pub min_loudness: i32,
    pub noise_suppress: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct FrameAnalysis {
    pub peak_mic_db: f32,
    pub peak_speaker_db: f32,
    pub peak_signal_db: f32,
    pub speech_prob: f32,
    pub agc_gain_db: f32,
}

struct EchoState {
    canceller: EchoCanceller,
    speaker_len: usize,
    cleaned: Vec<i16>,
}

// The echo state is owned exclusively and only driven from the worker thread.
unsafe impl Send for EchoState {}

pub(crate) struct DspChain {
    frame_size: usize,
    noise_cancel: NoiseCancelMode,
    noise_suppress: i32,
    echo: Option<EchoState>,
    rnn: Option<Box<DenoiseState<'static>>>,
    rnn_in: Vec<f32>,
    rnn_out: Vec<f32>,
    pre: Preprocessor,
    levels: Arc<LevelMeter>,
}

impl DspChain {
    /// Builds the chain. `echo_channels` is zero when echo cancellation is
    /// disabled, otherwise the number of speaker channels feeding the
    /// canceller tail.
    pub(crate) fn new(
        tunables: DspTunables,
        frame_size: usize,
        sample_rate: u32,
        echo_channels: u32,
        nominal_lag: u32,
    ) -> Result<Self, AudioInputError> {
        let noise_cancel = effective_noise_cancel(tunables.noise_cancel, frame_size);

        let mut pre = Preprocessor::new(frame_size, sample_rate);
        pre.set_vad(true);
        pre.set_agc(true);
        pre.set_dereverb(true);
        pre.set_agc_target(AGC_TARGET);
        pre.set_agc_decrement(AGC_DECREMENT);
        pre.set_agc_increment(AGC_INCREMENT_ACTIVE);

        let max_gain =
            (20.0 * (AGC_TARGET as f32 / tunables.min_loudness.max(1) as f32).log10()).floor();
        pre.set_agc_max_gain_db(max_gain as i32);

        let speex_denoise = matches!(noise_cancel, NoiseCancelMode::Speex | NoiseCancelMode::Both);
        pre.set_denoise(speex_denoise);
        if speex_denoise {
            pre.set_noise_suppress(tunables.noise_suppress);
        }

        let echo = if echo_channels > 0 {
            let filter_length = frame_size * (10 + nominal_lag as usize);
            let canceller = EchoCanceller::new_multichannel(
                frame_size,
                filter_length,
                1,
                echo_channels as usize,
            )
            .ok_or(AudioInputError::EchoCanceller {
                frame_size,
                channels: echo_channels,
            })?;
            tracing::debug!(filter_length, echo_channels, "echo canceller active");
            Some(EchoState {
                canceller,
                speaker_len: frame_size * echo_channels as usize,
                cleaned: vec![0; frame_size],
            })
        } else {
            None
        };

        let rnn = matches!(noise_cancel, NoiseCancelMode::Rnn | NoiseCancelMode::Both)
            .then(DenoiseState::new);

        Ok(Self {
            frame_size,
            noise_cancel,
            noise_suppress: tunables.noise_suppress,
            echo,
            rnn,
            rnn_in: vec![0.0; frame_size],
            rnn_out: vec![0.0; frame_size],
            pre,
            levels: Arc::new(LevelMeter::default()),
        })
    }

    pub(crate) fn with_levels(mut self, levels: Arc<LevelMeter>) -> Self {
        self.levels = levels;
        self
    }

    /// AGC ramp follows the gate: frozen while transmission is off so silence
    /// cannot wind the gain up.
    pub(crate) fn set_transmitting(&mut self, transmitting: bool) {
        self.pre
            .set_agc_increment(if transmitting { AGC_INCREMENT_ACTIVE } else { 0 });
    }

    /// Runs the chain over one chunk, cleaning `chunk.mic` in place.
    pub(crate) fn process(&mut self, chunk: &mut AudioChunk) -> FrameAnalysis {
        debug_assert_eq!(chunk.mic.len(), self.frame_size);

        let peak_mic_db = rms_db(&chunk.mic);
        let peak_speaker_db = match (&self.echo, &chunk.speaker) {
            (Some(_), Some(speaker)) => rms_db(speaker),
            _ => 0.0,
        };
        self.levels.set_input_peaks(peak_mic_db, peak_speaker_db);

        // The noise suppressor fights the AGC: whatever the AGC adds would
        // otherwise lift the residual noise by the same amount.
        if matches!(
            self.noise_cancel,
            NoiseCancelMode::Speex | NoiseCancelMode::Both
        ) {
            self.pre
                .set_noise_suppress(self.noise_suppress - self.pre.agc_gain_db() as i32);
        }

        if let (Some(echo), Some(speaker)) = (&mut self.echo, &chunk.speaker) {
            debug_assert_eq!(speaker.len(), echo.speaker_len);
            unsafe {
                speex_echo_cancellation(
                    echo.canceller.as_ptr(),
                    chunk.mic.as_ptr(),
                    speaker.as_ptr(),
                    echo.cleaned.as_mut_ptr(),
                );
            }
            chunk.mic.copy_from_slice(&echo.cleaned);
        }

        if let Some(rnn) = &mut self.rnn {
            for (dst, &src) in self.rnn_in.iter_mut().zip(chunk.mic.iter()) {
                *dst = f32::from(src);
            }
            rnn.process_frame(&mut self.rnn_out, &self.rnn_in);
            for (dst, &src) in chunk.mic.iter_mut().zip(self.rnn_out.iter()) {
                *dst = src.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
            }
        }

        self.pre.run(&mut chunk.mic);
        let speech_prob = self.pre.speech_prob();

        let peak_signal_db = rms_db(&chunk.mic);
        let agc_gain_db = self.pre.agc_gain_db();
        let peak_clean_mic_db = (peak_signal_db - agc_gain_db).max(-96.0);
        self.levels
            .set_processed(peak_signal_db, peak_clean_mic_db, speech_prob);

        FrameAnalysis {
            peak_mic_db,
            peak_speaker_db,
            peak_signal_db,
            speech_prob,
            agc_gain_db,
        }
    }
}

fn effective_noise_cancel(requested: NoiseCancelMode, frame_size: usize) -> NoiseCancelMode {
    match requested {
        NoiseCancelMode::Rnn | NoiseCancelMode::Both
            if frame_size != DenoiseState::FRAME_SIZE =>
        {
            tracing::warn!(
                frame_size,
                "RNN denoiser requires {} sample frames, falling back to Speex",
                DenoiseState::FRAME_SIZE
            );
            NoiseCancelMode::Speex
        }
        other => other,
    }
}

/// RMS level of a frame in dB relative to full scale, floored at -96.
fn rms_db(frame: &[i16]) -> f32 {
    let mut sum = 1.0f32;
    for &s in frame {
        let v = f32::from(s);
        sum += v * v;
    }
    let rms = (sum / frame.len() as f32).sqrt();
    (20.0 * (rms / 32768.0).log10()).max(-96.0)
}
