//! Mic/speaker resynchronizer.
//!
//! The microphone and the loopback capture run on independent callback
//! cadences. Echo cancellation needs each mic frame paired with the speaker
//! frame that was acoustically in the room at the same time, so mic frames
//! wait in a small elastic queue until their counterpart arrives. The state
//! machine keeps the queue near a nominal lag of two frames, dropping the
//! oldest mic frame on overflow and incoming speaker frames on underflow.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Mono 16-bit PCM of [`FRAME_SIZE`](crate::FRAME_SIZE) samples (times the
/// echo channel count for interleaved speaker frames).
pub type Frame = Vec<i16>;

/// A mic frame with its matching speaker frame, when echo cancellation is
/// active. Consumed exactly once by the encoder stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub mic: Frame,
    pub speaker: Option<Frame>,
}

impl AudioChunk {
    pub fn mic_only(mic: Frame) -> Self {
        Self { mic, speaker: None }
    }
}

/// Queue-depth states. `a`/`b` variants at the same depth differ in which
/// side produced last, which decides whether the next event grows or shrinks
/// the lag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    S0,
    S1a,
    S1b,
    S2,
    S3,
    S4a,
    S4b,
    S5,
}

struct Inner {
    state: State,
    queue: VecDeque<Frame>,
}

pub struct Resynchronizer {
    inner: Mutex<Inner>,
}

impl Default for Resynchronizer {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::S0,
                queue: VecDeque::with_capacity(5),
            }),
        }
    }
}

impl Resynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a mic frame. On overflow the oldest queued frame is dropped
    /// to stay inside the lag window.
    pub fn add_mic(&self, mic: Frame) {
        let mut inner = self.inner.lock();
        inner.queue.push_back(mic);

        let (next, drop) = match inner.state {
            State::S0 => (State::S1a, false),
            State::S1a => (State::S2, false),
            State::S1b => (State::S2, false),
            State::S2 => (State::S3, false),
            State::S3 => (State::S4a, false),
            State::S4a => (State::S5, false),
            State::S4b => (State::S4b, true),
            State::S5 => (State::S5, true),
        };
        inner.state = next;
        if drop {
            inner.queue.pop_front();
            tracing::trace!("dropped microphone frame due to overflow");
        }
    }

    /// Pairs a speaker frame with the oldest queued mic frame. Returns `None`
    /// (dropping the speaker frame) while the queue is still building up lag.
    pub fn add_speaker(&self, speaker: Frame) -> Option<AudioChunk> {
        let mut inner = self.inner.lock();

        let (next, drop) = match inner.state {
            State::S0 => (State::S0, true),
            State::S1a => (State::S1a, true),
            State::S1b => (State::S0, false),
            State::S2 => (State::S1b, false),
            State::S3 => (State::S2, false),
            State::S4a => (State::S3, false),
            State::S4b => (State::S3, false),
            State::S5 => (State::S4b, false),
        };
        inner.state = next;

        if drop {
            tracing::trace!("dropped speaker frame due to underflow");
            return None;
        }

        // Every pairing state holds at least one queued mic frame.
        let mic = inner.queue.pop_front()?;
        Some(AudioChunk {
            mic,
            speaker: Some(speaker),
        })
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = State::S0;
        inner.queue.clear();
    }

    /// Nominal number of mic frames queued ahead of their echo counterpart.
    pub fn nominal_lag(&self) -> u32 {
        2
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }
}
