//! Lock-free level telemetry for metering UIs.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// Per-frame signal levels published by the worker thread.
///
/// Readable from any thread without blocking the hot path. Decibel values are
/// relative to full scale and floored at -96.
#[derive(Debug, Default)]
pub struct LevelMeter {
    peak_mic: AtomicF32,
    peak_speaker: AtomicF32,
    peak_signal: AtomicF32,
    peak_clean_mic: AtomicF32,
    speech_prob: AtomicF32,
    bitrate: AtomicI32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Levels {
    pub peak_mic_db: f32,
    pub peak_speaker_db: f32,
    pub peak_signal_db: f32,
    pub peak_clean_mic_db: f32,
    pub speech_prob: f32,
    /// Current encoder output bitrate in bits/s, 0 while not transmitting.
    pub bitrate: i32,
}

impl LevelMeter {
    pub fn snapshot(&self) -> Levels {
        Levels {
            peak_mic_db: self.peak_mic.load(),
            peak_speaker_db: self.peak_speaker.load(),
            peak_signal_db: self.peak_signal.load(),
            peak_clean_mic_db: self.peak_clean_mic.load(),
            speech_prob: self.speech_prob.load(),
            bitrate: self.bitrate.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_input_peaks(&self, mic_db: f32, speaker_db: f32) {
        self.peak_mic.store(mic_db);
        self.peak_speaker.store(speaker_db);
    }

    pub(crate) fn set_processed(&self, signal_db: f32, clean_mic_db: f32, speech_prob: f32) {
        self.peak_signal.store(signal_db);
        self.peak_clean_mic.store(clean_mic_db);
        self.speech_prob.store(speech_prob);
    }

    pub(crate) fn set_bitrate(&self, bitrate: i32) {
        self.bitrate.store(bitrate, Ordering::Relaxed);
    }
}

/// f32 stored as its bit pattern, the usual trick for atomic meters.
#[derive(Debug, Default)]
struct AtomicF32(AtomicU32);

impl AtomicF32 {
    fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}
