//! Frame-rate preprocessor: voice probability, AGC, noise attenuation.
//!
//! Control surface mirrors the classic Speex preprocessor: an AGC working in
//! dB with a target level, a gain ceiling and per-second ramp rates, a
//! speech-probability estimate driven by the tracked noise floor, and a
//! noise attenuation strength in negative dB. The dereverb switch is
//! accepted but shapes nothing, same as the reference implementation.

/// Loudest value a gained sample may take before clamping.
const FULL_SCALE: f32 = 32768.0;

/// SNR (dB) at which the speech probability saturates at 1.0.
const PROB_SNR_RANGE_DB: f32 = 25.0;

/// Noise floor rise per frame while the signal sits above it (~3.5 dB/s at
/// 100 frames/s).
const NOISE_RISE_PER_FRAME: f32 = 1.008;

pub(crate) struct Preprocessor {
    frames_per_sec: f32,

    agc_enabled: bool,
    vad_enabled: bool,
    denoise_enabled: bool,
    #[allow(dead_code)]
    dereverb_enabled: bool,

    /// AGC target as a linear i16-scale RMS.
    agc_target: f32,
    agc_max_gain_db: f32,
    /// dB per second, applied while ramping up. Zero freezes the gain.
    agc_increment_db_s: f32,
    /// dB per second, negative, applied while ramping down.
    agc_decrement_db_s: f32,
    /// Attenuation applied to non-speech content, negative dB.
    noise_suppress_db: f32,

    gain_db: f32,
    /// Tracked noise floor as mean square energy in i16 units.
    noise_energy: f32,
    speech_prob: f32,
}

impl Preprocessor {
    pub(crate) fn new(frame_size: usize, sample_rate: u32) -> Self {
        Self {
            frames_per_sec: sample_rate as f32 / frame_size as f32,
            agc_enabled: false,
            vad_enabled: false,
            denoise_enabled: false,
            dereverb_enabled: false,
            agc_target: 8000.0,
            agc_max_gain_db: 30.0,
            agc_increment_db_s: 12.0,
            agc_decrement_db_s: -40.0,
            noise_suppress_db: -15.0,
            gain_db: 0.0,
            noise_energy: f32::MAX,
            speech_prob: 0.0,
        }
    }

    pub(crate) fn set_vad(&mut self, enabled: bool) {
        self.vad_enabled = enabled;
    }

    pub(crate) fn set_agc(&mut self, enabled: bool) {
        self.agc_enabled = enabled;
    }

    pub(crate) fn set_denoise(&mut self, enabled: bool) {
        self.denoise_enabled = enabled;
    }

    pub(crate) fn set_dereverb(&mut self, enabled: bool) {
        self.dereverb_enabled = enabled;
    }

    pub(crate) fn set_agc_target(&mut self, target: i32) {
        self.agc_target = target as f32;
    }

    pub(crate) fn set_agc_max_gain_db(&mut self, max_gain: i32) {
        self.agc_max_gain_db = max_gain as f32;
    }

    pub(crate) fn set_agc_increment(&mut self, db_per_sec: i32) {
        self.agc_increment_db_s = db_per_sec as f32;
    }

    pub(crate) fn set_agc_decrement(&mut self, db_per_sec: i32) {
        self.agc_decrement_db_s = db_per_sec as f32;
    }

    pub(crate) fn set_noise_suppress(&mut self, db: i32) {
        self.noise_suppress_db = db as f32;
    }

    /// Current AGC gain in dB.
    pub(crate) fn agc_gain_db(&self) -> f32 {
        self.gain_db
    }

    /// Speech probability of the last processed frame, 0..=1.
    pub(crate) fn speech_prob(&self) -> f32 {
        self.speech_prob
    }

    /// Processes one frame in place. Returns the speech probability.
    pub(crate) fn run(&mut self, frame: &mut [i16]) -> f32 {
        let energy = Self::mean_square(frame);

        // Minima-tracking noise floor: snap down, creep up.
        if energy < self.noise_energy {
            self.noise_energy = energy;
        } else {
            self.noise_energy = (self.noise_energy * NOISE_RISE_PER_FRAME).min(energy);
        }

        self.speech_prob = if self.vad_enabled {
            let snr_db = 10.0 * (energy / self.noise_energy.max(1.0)).log10();
            (snr_db / PROB_SNR_RANGE_DB).clamp(0.0, 1.0)
        } else {
            1.0
        };

        let mut total_db = 0.0;

        if self.agc_enabled {
            let rms = energy.sqrt();
            let desired_db = 20.0 * (self.agc_target / rms.max(1.0)).log10();
            let desired_db = desired_db.clamp(0.0, self.agc_max_gain_db);

            if desired_db > self.gain_db {
                let step = self.agc_increment_db_s / self.frames_per_sec;
                self.gain_db = (self.gain_db + step).min(desired_db);
            } else {
                let step = self.agc_decrement_db_s / self.frames_per_sec;
                self.gain_db = (self.gain_db + step).max(desired_db);
            }
            total_db += self.gain_db;
        }

        if self.denoise_enabled {
            // Full attenuation on silence, fading out as speech dominates.
            total_db += self.noise_suppress_db * (1.0 - self.speech_prob);
        }

        if total_db != 0.0 {
            let scale = 10f32.powf(total_db / 20.0);
            for sample in frame.iter_mut() {
                let v = (f32::from(*sample) * scale).clamp(-FULL_SCALE, FULL_SCALE - 1.0);
                *sample = v as i16;
            }
        }

        self.speech_prob
    }

    fn mean_square(frame: &[i16]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }
        let sum: f32 = frame
            .iter()
            .map(|&s| {
                let v = f32::from(s);
                v * v
            })
            .sum();
        sum / frame.len() as f32
    }
}
