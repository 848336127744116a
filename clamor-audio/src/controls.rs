//! Shared control state mutated by UI/keybind threads and read by the worker.
//!
//! The worker snapshots everything once per frame so a mid-frame change never
//! tears a decision; it simply lands on the next frame.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

/// Per-frame view of the control state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlsSnapshot {
    pub voice_target: i32,
    /// PTT key held, or latched/open through the double-push window.
    pub ptt_active: bool,
    pub self_mute: bool,
    pub self_deaf: bool,
    pub server_mute: bool,
    pub suppressed: bool,
    pub push_to_mute: bool,
    /// Plugin override forcing the microphone open.
    pub overwrite_activation: bool,
}

#[derive(Default)]
struct DoublePush {
    last_press: Option<Instant>,
    latched: bool,
}

/// Live transmission controls shared with the pipeline.
pub struct Controls {
    voice_target: AtomicI32,
    prev_target: AtomicI32,
    ptt: AtomicBool,
    push_to_mute: AtomicBool,
    self_mute: AtomicBool,
    self_deaf: AtomicBool,
    server_mute: AtomicBool,
    suppressed: AtomicBool,
    overwrite_activation: AtomicBool,
    double_push_window: Duration,
    double_push: Mutex<DoublePush>,
}

impl Controls {
    pub(crate) fn new(double_push_window: Duration) -> Self {
        Self {
            voice_target: AtomicI32::new(0),
            prev_target: AtomicI32::new(0),
            ptt: AtomicBool::new(false),
            push_to_mute: AtomicBool::new(false),
            self_mute: AtomicBool::new(false),
            self_deaf: AtomicBool::new(false),
            server_mute: AtomicBool::new(false),
            suppressed: AtomicBool::new(false),
            overwrite_activation: AtomicBool::new(false),
            double_push_window,
            double_push: Mutex::new(DoublePush::default()),
        }
    }

    /// Switches the voice target, remembering the previous one so the final
    /// packet of a whisper still reaches the old target after release.
    pub fn set_voice_target(&self, target: i32) {
        let old = self.voice_target.swap(target, Ordering::Relaxed);
        if old != target {
            self.prev_target.store(old, Ordering::Relaxed);
        }
    }

    pub fn voice_target(&self) -> i32 {
        self.voice_target.load(Ordering::Relaxed)
    }

    pub fn press_ptt(&self) {
        let now = Instant::now();
        self.ptt.store(true, Ordering::Relaxed);

        if !self.double_push_window.is_zero() {
            let mut dp = self.double_push.lock();
            if dp.latched {
                dp.latched = false;
            } else if dp
                .last_press
                .is_some_and(|last| now.duration_since(last) < self.double_push_window)
            {
                dp.latched = true;
            }
            dp.last_press = Some(now);
        }
    }

    pub fn release_ptt(&self) {
        self.ptt.store(false, Ordering::Relaxed);
    }

    pub fn set_self_mute(&self, mute: bool) {
        self.self_mute.store(mute, Ordering::Relaxed);
    }

    pub fn set_self_deaf(&self, deaf: bool) {
        self.self_deaf.store(deaf, Ordering::Relaxed);
    }

    pub fn set_server_mute(&self, mute: bool) {
        self.server_mute.store(mute, Ordering::Relaxed);
    }

    pub fn set_suppressed(&self, suppressed: bool) {
        self.suppressed.store(suppressed, Ordering::Relaxed);
    }

    pub fn set_push_to_mute(&self, active: bool) {
        self.push_to_mute.store(active, Ordering::Relaxed);
    }

    pub fn set_overwrite_activation(&self, active: bool) {
        self.overwrite_activation.store(active, Ordering::Relaxed);
    }

    /// Takes the remembered whisper target, if any. Called once when a
    /// terminator packet resolves its destination.
    pub(crate) fn consume_prev_target(&self) -> Option<i32> {
        let prev = self.prev_target.load(Ordering::Relaxed);
        if prev > 0 {
            self.prev_target.store(0, Ordering::Relaxed);
            Some(prev)
        } else {
            None
        }
    }

    pub(crate) fn snapshot(&self, now: Instant) -> ControlsSnapshot {
        let ptt_active = self.ptt.load(Ordering::Relaxed) || {
            !self.double_push_window.is_zero() && {
                let dp = self.double_push.lock();
                dp.latched
                    || dp
                        .last_press
                        .is_some_and(|last| now.duration_since(last) < self.double_push_window)
            }
        };

        ControlsSnapshot {
            voice_target: self.voice_target.load(Ordering::Relaxed),
            ptt_active,
            self_mute: self.self_mute.load(Ordering::Relaxed),
            self_deaf: self.self_deaf.load(Ordering::Relaxed),
            server_mute: self.server_mute.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            push_to_mute: self.push_to_mute.load(Ordering::Relaxed),
            overwrite_activation: self.overwrite_activation.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn voice_target_change_remembers_previous() {
        let controls = Controls::new(Duration::ZERO);

        controls.set_voice_target(5);
        controls.set_voice_target(0);

        assert_eq!(controls.consume_prev_target(), Some(5));
        // Consumed exactly once.
        assert_eq!(controls.consume_prev_target(), None);
    }

    #[test]
    fn prev_target_ignores_non_whisper_values() {
        let controls = Controls::new(Duration::ZERO);
        controls.set_voice_target(-2);
        controls.set_voice_target(0);
        assert_eq!(controls.consume_prev_target(), None);
    }

    #[test]
    fn ptt_snapshot_follows_key_state() {
        let controls = Controls::new(Duration::ZERO);
        assert!(!controls.snapshot(Instant::now()).ptt_active);

        controls.press_ptt();
        assert!(controls.snapshot(Instant::now()).ptt_active);

        controls.release_ptt();
        assert!(!controls.snapshot(Instant::now()).ptt_active);
    }

    #[test]
    fn double_push_latches_transmission() {
        let controls = Controls::new(Duration::from_millis(200));

        controls.press_ptt();
        controls.release_ptt();
        controls.press_ptt();
        controls.release_ptt();

        // Latched by the quick double press, despite the key being up.
        let later = Instant::now() + Duration::from_secs(1);
        assert!(controls.snapshot(later).ptt_active);

        // The next press clears the latch.
        sleep(Duration::from_millis(1));
        controls.press_ptt();
        controls.release_ptt();
        let later = Instant::now() + Duration::from_secs(1);
        assert!(!controls.snapshot(later).ptt_active);
    }

    #[test]
    fn single_tap_keeps_mic_open_for_window() {
        let controls = Controls::new(Duration::from_millis(200));

        controls.press_ptt();
        let pressed_at = Instant::now();
        controls.release_ptt();

        assert!(controls.snapshot(pressed_at + Duration::from_millis(50)).ptt_active);
        assert!(!controls.snapshot(pressed_at + Duration::from_millis(500)).ptt_active);
    }
}
