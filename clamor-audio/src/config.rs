//! Pipeline configuration.
//!
//! A pipeline snapshots its [`InputConfig`] at construction and never observes
//! later edits; reconfiguring means shutting the pipeline down and building a
//! new one (see [`crate::pipeline`]). The only runtime-tunable knobs are the
//! ones exposed as setters there, which go through the processor reset latch.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Sample encoding of a capture stream, as delivered by the device layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    Float32,
    Int16,
}

impl SampleFormat {
    pub(crate) fn sample_size(self) -> usize {
        match self {
            SampleFormat::Float32 => 4,
            SampleFormat::Int16 => 2,
        }
    }
}

/// All channels contribute to the mixdown.
pub const ALL_CHANNELS: u64 = u64::MAX;

/// Shape of one capture stream (microphone or speaker loopback).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub sample_rate: u32,
    pub channels: u32,
    pub format: SampleFormat,
    /// Bitmask of channels contributing to the mixdown; [`ALL_CHANNELS`] for
    /// an unrestricted stream.
    pub channel_mask: u64,
}

impl StreamSpec {
    pub fn new(sample_rate: u32, channels: u32, format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            format,
            channel_mask: ALL_CHANNELS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransmitMode {
    Continuous,
    VoiceActivity,
    PushToTalk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoopbackMode {
    None,
    /// Packets go to the in-process loop buffer instead of the transport.
    Local,
    /// Packets go out with the reserved server-loopback target.
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NoiseCancelMode {
    Off,
    Speex,
    Rnn,
    Both,
}

/// Quantity driving the voice-activity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VadSource {
    /// Preprocessor speech probability.
    SignalToNoise,
    /// AGC-compensated signal level mapped onto 0..1.
    Amplitude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IdleAction {
    Nothing,
    Mute,
    Deafen,
}

/// Echo cancellation flavour. `Mixed` folds the loopback stream down to mono
/// before the canceller, `Multichannel` keeps one tail per speaker channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EchoCancelMode {
    Disabled,
    Mixed,
    Multichannel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub transmit_mode: TransmitMode,
    pub vad_source: VadSource,
    /// Level above which transmission always engages.
    pub vad_max: f32,
    /// Level above which an ongoing transmission is sustained.
    pub vad_min: f32,
    /// Frames transmission persists after the signal drops below `vad_min`.
    pub voice_hold: u32,
    /// Seconds of inactivity before `idle_action` fires.
    pub idle_time_secs: u64,
    pub idle_action: IdleAction,
    pub undo_idle_on_activity: bool,
    /// Double-push window for PTT latching; zero disables it.
    pub double_push_window: Duration,
    pub tx_audio_cue: bool,
    pub tx_mute_cue: bool,
    pub audio_cue_on: PathBuf,
    pub audio_cue_off: PathBuf,
    pub mute_cue: PathBuf,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            transmit_mode: TransmitMode::VoiceActivity,
            vad_source: VadSource::SignalToNoise,
            vad_max: 0.98,
            vad_min: 0.80,
            voice_hold: 50,
            idle_time_secs: 5 * 60,
            idle_action: IdleAction::Nothing,
            undo_idle_on_activity: false,
            double_push_window: Duration::ZERO,
            tx_audio_cue: false,
            tx_mute_cue: true,
            audio_cue_on: PathBuf::from("skin:cues/on.ogg"),
            audio_cue_off: PathBuf::from("skin:cues/off.ogg"),
            mute_cue: PathBuf::from("skin:cues/muted.ogg"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Requested encoder bitrate in bits/s.
    pub quality: i32,
    pub frames_per_packet: u32,
    pub allow_low_delay: bool,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            quality: 40_000,
            frames_per_packet: 2,
            allow_low_delay: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DspConfig {
    pub noise_cancel_mode: NoiseCancelMode,
    pub echo_cancel_mode: EchoCancelMode,
    /// Quietest input the AGC is expected to bring up to full scale; sets the
    /// maximum gain to `20·log10(30000 / min_loudness)` dB.
    pub min_loudness: i32,
    /// Speex noise attenuation in dB (negative).
    pub noise_suppress: i32,
}

impl Default for DspConfig {
    fn default() -> Self {
        Self {
            noise_cancel_mode: NoiseCancelMode::Both,
            echo_cancel_mode: EchoCancelMode::Disabled,
            min_loudness: 1000,
            noise_suppress: -30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Server bandwidth cap in bits/s, `-1` for unlimited.
    pub max_bandwidth: i32,
    pub transmit_position: bool,
    /// Voice rides the TCP tunnel; widens the per-packet overhead model.
    pub tcp_mode: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_bandwidth: -1,
            transmit_position: false,
            tcp_mode: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputConfig {
    pub gate: GateConfig,
    pub quality: QualityConfig,
    pub dsp: DspConfig,
    pub network: NetworkConfig,
    pub loopback_mode: LoopbackMode,
}

impl Default for LoopbackMode {
    fn default() -> Self {
        LoopbackMode::None
    }
}
