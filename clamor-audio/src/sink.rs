//! Collaborator interfaces on the output side of the pipeline.

use clamor_protocol::audio::AudioData;
use std::sync::Arc;

/// Outbound transport. Implementations enqueue and return; the pipeline never
/// blocks on the network.
pub trait OutboundSink: Send + Sync {
    fn send_audio(&self, audio: &AudioData);
}

/// Consumer of finished packets outside the transport path: the voice
/// recorder and the local loopback buffer.
pub trait FrameSink: Send + Sync {
    fn add_frame(&self, audio: &AudioData);
}

/// Positional data provider (plugin manager). `None` when no supported game
/// is linked or the position is unavailable this frame.
pub trait PositionSource: Send + Sync {
    fn fetch_position(&self) -> Option<[f32; 3]>;
}

/// Everything the pipeline delivers into. All slots are optional; an absent
/// outbound sink silently drops packets at the boundary.
#[derive(Default, Clone)]
pub struct InputSinks {
    pub outbound: Option<Arc<dyn OutboundSink>>,
    pub recorder: Option<Arc<dyn FrameSink>>,
    /// Receives packets instead of the transport in local loopback mode.
    pub loopback: Option<Arc<dyn FrameSink>>,
    pub position: Option<Arc<dyn PositionSource>>,
}
