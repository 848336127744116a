//! Voice gate: the per-frame "transmit this frame?" decision.
//!
//! Pure with respect to its inputs: a [`FrameAnalysis`], a [`ControlsSnapshot`]
//! taken once at frame entry, and an explicit `now`. Everything the decision
//! triggers besides transmission (cues, idle actions, talking indicators)
//! leaves through the event callback.

use crate::config::{GateConfig, IdleAction, LoopbackMode, TransmitMode, VadSource};
use crate::controls::ControlsSnapshot;
use crate::dsp::FrameAnalysis;
use crate::events::{InputEvent, TalkingState};
use crate::MUTE_CUE_DELAY;
use std::time::Instant;

/// Frames of unbroken silence after which the utterance frame counter resets.
const SILENT_FRAMES_COUNTER_RESET: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GateDecision {
    pub transmit: bool,
    /// Transmission just ended; this frame carries the terminator flag.
    pub terminator: bool,
    /// Transmission just started; the encoder state must be reset.
    pub start_of_utterance: bool,
    pub reset_frame_counter: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActivityState {
    Active,
    Idle,
    ReturnedFromIdle,
}

pub(crate) struct VoiceGate {
    cfg: GateConfig,
    loopback: LoopbackMode,
    session_active: bool,

    previous_voice: bool,
    hold_frames: u32,
    silent_frames: u32,
    idle_since: Instant,
    activity: ActivityState,
    last_mute_cue: Option<Instant>,
    last_talking: Option<TalkingState>,
}

impl VoiceGate {
    pub(crate) fn new(cfg: GateConfig, loopback: LoopbackMode, session_active: bool) -> Self {
        Self {
            // The hold window starts exhausted so a freshly built pipeline
            // does not transmit `voice_hold` frames of startup silence.
            hold_frames: cfg.voice_hold,
            cfg,
            loopback,
            session_active,
            previous_voice: false,
            silent_frames: 0,
            idle_since: Instant::now(),
            activity: ActivityState::Active,
            last_mute_cue: None,
            last_talking: None,
        }
    }

    pub(crate) fn is_transmitting(&self) -> bool {
        self.previous_voice
    }

    pub(crate) fn decide(
        &mut self,
        analysis: &FrameAnalysis,
        controls: &ControlsSnapshot,
        now: Instant,
        mut emit: impl FnMut(InputEvent),
    ) -> GateDecision {
        let clean_mic_db = (analysis.peak_signal_db - analysis.agc_gain_db).max(-96.0);
        let level = match self.cfg.vad_source {
            VadSource::SignalToNoise => analysis.speech_prob,
            VadSource::Amplitude => 1.0 + clean_mic_db / 96.0,
        };

        let mut is_speech = level > self.cfg.vad_max
            || (level > self.cfg.vad_min && self.previous_voice);

        if !is_speech {
            self.hold_frames = self.hold_frames.saturating_add(1);
            if self.hold_frames <= self.cfg.voice_hold {
                // Keep the mic open for exactly `voice_hold` frames past the
                // end of detected speech.
                is_speech = true;
            }
        } else {
            self.hold_frames = 0;
        }

        match self.cfg.transmit_mode {
            TransmitMode::Continuous => is_speech = true,
            TransmitMode::PushToTalk => is_speech = controls.ptt_active,
            TransmitMode::VoiceActivity => {}
        }
        if controls.overwrite_activation {
            is_speech = true;
        }
        // A held whisper/PTT key opens the mic in any transmit mode.
        is_speech = is_speech || controls.ptt_active;

        let muted = controls.self_mute
            || (self.loopback != LoopbackMode::Local
                && (controls.server_mute || controls.suppressed))
            || controls.push_to_mute
            || controls.voice_target < 0;
        let talking_while_muted = muted && is_speech;
        if muted {
            is_speech = false;
        }

        let mut reset_frame_counter = false;
        if is_speech {
            self.silent_frames = 0;
        } else {
            self.silent_frames += 1;
            if self.silent_frames > SILENT_FRAMES_COUNTER_RESET {
                reset_frame_counter = true;
            }
        }

        self.emit_talking_state(is_speech, controls.voice_target, &mut emit);
        self.emit_cues(is_speech, talking_while_muted, controls, now, &mut emit);

        if !is_speech && !self.previous_voice {
            self.run_idle_detection(controls, now, &mut emit);
            return GateDecision {
                transmit: false,
                terminator: false,
                start_of_utterance: false,
                reset_frame_counter,
            };
        }

        if is_speech && self.activity == ActivityState::Idle {
            self.activity = ActivityState::ReturnedFromIdle;
        }
        self.idle_since = now;

        let decision = GateDecision {
            transmit: is_speech,
            terminator: !is_speech && self.previous_voice,
            start_of_utterance: is_speech && !self.previous_voice,
            reset_frame_counter,
        };
        self.previous_voice = is_speech;
        decision
    }

    fn emit_talking_state(
        &mut self,
        is_speech: bool,
        voice_target: i32,
        emit: &mut impl FnMut(InputEvent),
    ) {
        let talking = if !is_speech {
            TalkingState::Passive
        } else if voice_target == 0 {
            TalkingState::Talking
        } else {
            TalkingState::Shouting
        };
        if self.last_talking != Some(talking) {
            self.last_talking = Some(talking);
            emit(InputEvent::Talking(talking));
        }
    }

    fn emit_cues(
        &mut self,
        is_speech: bool,
        talking_while_muted: bool,
        controls: &ControlsSnapshot,
        now: Instant,
        emit: &mut impl FnMut(InputEvent),
    ) {
        if !self.session_active {
            return;
        }

        if self.cfg.tx_audio_cue {
            if is_speech && !self.previous_voice {
                emit(InputEvent::TransmitCueOn {
                    sample: self.cfg.audio_cue_on.clone(),
                });
            } else if !is_speech && self.previous_voice {
                emit(InputEvent::TransmitCueOff {
                    sample: self.cfg.audio_cue_off.clone(),
                });
            }
        }

        if self.cfg.tx_mute_cue
            && talking_while_muted
            && !controls.push_to_mute
            && !controls.self_deaf
            && self
                .last_mute_cue
                .is_none_or(|last| now.duration_since(last) > MUTE_CUE_DELAY)
        {
            self.last_mute_cue = Some(now);
            emit(InputEvent::MuteCue {
                sample: self.cfg.mute_cue.clone(),
            });
        }
    }

    fn run_idle_detection(
        &mut self,
        controls: &ControlsSnapshot,
        now: Instant,
        emit: &mut impl FnMut(InputEvent),
    ) {
        if now.duration_since(self.idle_since).as_secs() > self.cfg.idle_time_secs {
            self.activity = ActivityState::Idle;
            self.idle_since = now;
            match self.cfg.idle_action {
                IdleAction::Deafen if !controls.self_deaf => {
                    emit(InputEvent::IdleAction(IdleAction::Deafen));
                }
                IdleAction::Mute if !controls.self_mute => {
                    emit(InputEvent::IdleAction(IdleAction::Mute));
                }
                _ => {}
            }
        }

        if self.activity == ActivityState::ReturnedFromIdle {
            self.activity = ActivityState::Active;
            if self.cfg.undo_idle_on_activity {
                match self.cfg.idle_action {
                    IdleAction::Deafen if controls.self_deaf => {
                        emit(InputEvent::UndoIdleAction(IdleAction::Deafen));
                    }
                    IdleAction::Mute if controls.self_mute => {
                        emit(InputEvent::UndoIdleAction(IdleAction::Mute));
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateConfig;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn analysis(prob: f32) -> FrameAnalysis {
        FrameAnalysis {
            peak_mic_db: -20.0,
            peak_speaker_db: 0.0,
            peak_signal_db: -20.0,
            speech_prob: prob,
            agc_gain_db: 0.0,
        }
    }

    fn gate(cfg: GateConfig) -> VoiceGate {
        VoiceGate::new(cfg, LoopbackMode::None, true)
    }

    fn vad_cfg(voice_hold: u32) -> GateConfig {
        GateConfig {
            vad_max: 0.9,
            vad_min: 0.5,
            voice_hold,
            tx_mute_cue: false,
            ..GateConfig::default()
        }
    }

    fn drive(gate: &mut VoiceGate, prob: f32, now: Instant) -> GateDecision {
        gate.decide(&analysis(prob), &ControlsSnapshot::default(), now, |_| {})
    }

    #[test]
    fn hysteresis_sustains_between_min_and_max() {
        let mut g = gate(vad_cfg(0));
        let now = Instant::now();

        assert!(drive(&mut g, 0.95, now).transmit);
        // Dips between min and max keep the transmission alive.
        assert!(drive(&mut g, 0.7, now).transmit);
        assert!(drive(&mut g, 0.6, now).transmit);
        // Below min the gate closes (no hold configured).
        let d = drive(&mut g, 0.1, now);
        assert!(!d.transmit);
        assert!(d.terminator);
    }

    #[test]
    fn below_max_never_opens_gate() {
        let mut g = gate(vad_cfg(1));
        let now = Instant::now();

        assert!(!drive(&mut g, 0.7, now).transmit);
    }

    #[test]
    fn hold_persists_exactly_voice_hold_frames() {
        let mut g = gate(vad_cfg(5));
        let now = Instant::now();

        assert!(drive(&mut g, 0.95, now).transmit);

        // Exactly five more frames stay open thanks to the hold, the sixth
        // closes the gate.
        for i in 0..5 {
            assert!(drive(&mut g, 0.0, now).transmit, "hold frame {i}");
        }
        let d = drive(&mut g, 0.0, now);
        assert!(!d.transmit);
        assert!(d.terminator);
    }

    #[test]
    fn start_and_end_of_utterance_flags() {
        let mut g = gate(vad_cfg(0));
        let now = Instant::now();

        let d = drive(&mut g, 0.95, now);
        assert!(d.start_of_utterance);
        let d = drive(&mut g, 0.95, now);
        assert!(!d.start_of_utterance);
        let d = drive(&mut g, 0.0, now);
        assert!(d.terminator && !d.transmit);
        // Fully idle afterwards: no second terminator.
        let d = drive(&mut g, 0.0, now);
        assert!(!d.terminator && !d.transmit);
    }

    #[test]
    fn continuous_mode_forces_transmission() {
        let mut g = gate(GateConfig {
            transmit_mode: TransmitMode::Continuous,
            tx_mute_cue: false,
            ..GateConfig::default()
        });
        assert!(drive(&mut g, 0.0, Instant::now()).transmit);
    }

    #[test]
    fn push_to_talk_follows_key_state() {
        let mut g = gate(GateConfig {
            transmit_mode: TransmitMode::PushToTalk,
            tx_mute_cue: false,
            ..GateConfig::default()
        });
        let now = Instant::now();

        let controls = ControlsSnapshot {
            ptt_active: true,
            ..ControlsSnapshot::default()
        };
        assert!(g.decide(&analysis(0.0), &controls, now, |_| {}).transmit);

        let controls = ControlsSnapshot::default();
        let d = g.decide(&analysis(1.0), &controls, now, |_| {});
        assert!(!d.transmit);
        assert!(d.terminator);
    }

    #[test]
    fn mute_suppresses_transmission_and_flags_talking() {
        let mut g = gate(GateConfig {
            tx_mute_cue: true,
            ..vad_cfg(1)
        });
        let now = Instant::now();

        let controls = ControlsSnapshot {
            self_mute: true,
            ..ControlsSnapshot::default()
        };
        let mut events = Vec::new();
        let d = g.decide(&analysis(0.95), &controls, now, |e| events.push(e));

        assert!(!d.transmit);
        assert!(events
            .iter()
            .any(|e| matches!(e, InputEvent::MuteCue { .. })));
    }

    #[test]
    fn mute_cue_is_rate_limited() {
        let mut g = gate(GateConfig {
            tx_mute_cue: true,
            ..vad_cfg(1)
        });
        let controls = ControlsSnapshot {
            self_mute: true,
            ..ControlsSnapshot::default()
        };
        let t0 = Instant::now();

        let mut count = 0;
        for i in 0..10u64 {
            g.decide(&analysis(0.95), &controls, t0 + Duration::from_millis(i * 10), |e| {
                if matches!(e, InputEvent::MuteCue { .. }) {
                    count += 1;
                }
            });
        }
        assert_eq!(count, 1);

        // Past the delay the cue plays again.
        g.decide(&analysis(0.95), &controls, t0 + MUTE_CUE_DELAY + Duration::from_secs(1), |e| {
            if matches!(e, InputEvent::MuteCue { .. }) {
                count += 1;
            }
        });
        assert_eq!(count, 2);
    }

    #[test]
    fn negative_target_blocks_transmission() {
        let mut g = gate(vad_cfg(1));
        let controls = ControlsSnapshot {
            voice_target: -1,
            ..ControlsSnapshot::default()
        };
        assert!(!g.decide(&analysis(0.95), &controls, Instant::now(), |_| {}).transmit);
    }

    #[test]
    fn idle_action_fires_after_timeout_and_undoes_on_activity() {
        let mut g = gate(GateConfig {
            idle_time_secs: 10,
            idle_action: IdleAction::Mute,
            undo_idle_on_activity: true,
            ..vad_cfg(0)
        });
        let t0 = Instant::now();
        let controls = ControlsSnapshot::default();

        let mut events = Vec::new();
        g.decide(&analysis(0.0), &controls, t0 + Duration::from_secs(11), |e| {
            events.push(e)
        });
        assert!(events.contains(&InputEvent::IdleAction(IdleAction::Mute)));

        // Speech returns before the UI applies the mute: the utterance plays
        // out, and once the UI-applied mute is visible on a silent frame the
        // gate asks for the undo.
        events.clear();
        g.decide(&analysis(0.95), &controls, t0 + Duration::from_secs(12), |e| {
            events.push(e)
        });
        let muted = ControlsSnapshot {
            self_mute: true,
            ..ControlsSnapshot::default()
        };
        // Terminator frame, then a fully idle frame where the undo fires.
        g.decide(&analysis(0.0), &muted, t0 + Duration::from_secs(13), |e| {
            events.push(e)
        });
        g.decide(&analysis(0.0), &muted, t0 + Duration::from_secs(14), |e| {
            events.push(e)
        });
        assert!(events.contains(&InputEvent::UndoIdleAction(IdleAction::Mute)));
    }

    #[test]
    fn talking_state_tracks_target() {
        let mut g = gate(vad_cfg(0));
        let now = Instant::now();

        let mut events = Vec::new();
        let controls = ControlsSnapshot {
            voice_target: 5,
            ..ControlsSnapshot::default()
        };
        g.decide(&analysis(0.95), &controls, now, |e| events.push(e));
        assert!(events.contains(&InputEvent::Talking(TalkingState::Shouting)));

        events.clear();
        g.decide(&analysis(0.0), &ControlsSnapshot::default(), now, |e| events.push(e));
        assert!(events.contains(&InputEvent::Talking(TalkingState::Passive)));
    }

    #[test]
    fn counter_reset_after_long_silence() {
        let mut g = gate(GateConfig {
            voice_hold: 0,
            ..vad_cfg(0)
        });
        let now = Instant::now();

        let mut last = GateDecision {
            transmit: false,
            terminator: false,
            start_of_utterance: false,
            reset_frame_counter: false,
        };
        for _ in 0..SILENT_FRAMES_COUNTER_RESET {
            last = drive(&mut g, 0.0, now);
        }
        assert!(!last.reset_frame_counter);
        assert!(drive(&mut g, 0.0, now).reset_frame_counter);
    }
}
