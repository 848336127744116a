//! Events emitted by the pipeline towards the UI collaborator.
//!
//! The pipeline never calls into UI or output-audio code directly. Everything
//! that used to be a cross-thread method call (cue playback, idle actions,
//! talking indicators) is delivered as a message on the event channel returned
//! by [`AudioInputPipeline::new`](crate::pipeline::AudioInputPipeline::new);
//! the receiver decides what, if anything, to do with it.

use crate::config::IdleAction;
use std::path::PathBuf;

/// Talking indicator shown next to the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TalkingState {
    Passive,
    /// Transmitting into the current channel.
    Talking,
    /// Transmitting to a whisper target.
    Shouting,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    /// Transmission started; play the configured "on" cue.
    TransmitCueOn { sample: PathBuf },
    /// Transmission ended; play the configured "off" cue.
    TransmitCueOff { sample: PathBuf },
    /// The user is speaking while muted; rate-limited by
    /// [`MUTE_CUE_DELAY`](crate::MUTE_CUE_DELAY).
    MuteCue { sample: PathBuf },
    /// The idle timeout elapsed; the UI should apply the action.
    IdleAction(IdleAction),
    /// Activity resumed after idling and the undo option is set.
    UndoIdleAction(IdleAction),
    Talking(TalkingState),
    /// The bandwidth cap forced quality below the requested configuration.
    BandwidthAdjusted { bitrate: i32, frames_per_packet: u32 },
}
