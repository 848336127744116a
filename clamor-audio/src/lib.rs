//! Real-time voice capture and transmission pipeline.
//!
//! Raw device PCM goes in through [`pipeline::AudioInputPipeline::add_mic`]
//! and [`pipeline::AudioInputPipeline::add_echo`]; framed, codec-compressed
//! [`AudioData`](clamor_protocol::audio::AudioData) packets come out through
//! the configured sinks. In between sit the channel mixer, the resampler
//! stage, the mic/speaker resynchronizer, the DSP chain (echo cancellation,
//! RNN denoise, AGC/VAD preprocessing), the voice gate, the codec stage and
//! the packet assembler.

pub mod bandwidth;
pub mod codec;
pub mod config;
pub mod controls;
mod dsp;
pub mod error;
pub mod events;
mod gate;
pub mod levels;
mod mixer;
mod packet;
mod preprocess;
pub mod pipeline;
mod resample;
pub mod resync;
pub mod sink;

use std::time::Duration;

pub type EncodedAudioFrame = bytes::Bytes;

/// Codec sample rate; everything behind the resampler stage runs at this.
pub const SAMPLE_RATE: u32 = 48_000;
/// Frame duration the whole pipeline is aligned to.
pub const FRAME_DURATION_MS: u64 = 10;
/// Samples per frame at [`SAMPLE_RATE`].
pub const FRAME_SIZE: usize = (SAMPLE_RATE as usize * FRAME_DURATION_MS as usize) / 1000;
/// Minimum spacing between talking-while-muted cues.
pub const MUTE_CUE_DELAY: Duration = Duration::from_secs(5);

pub use error::AudioInputError;
pub use pipeline::AudioInputPipeline;
