use thiserror::Error;

/// Construction-time and encode failures of the capture pipeline.
///
/// Per-frame failures never surface through this type to callers; the worker
/// logs them and recovers locally (dropped batch, cleared state). Only
/// pipeline construction reports errors to the owner.
#[derive(Debug, Error)]
pub enum AudioInputError {
    #[error("invalid stream spec: {0}")]
    InvalidStreamSpec(String),

    #[error("failed to initialise resampler: {0}")]
    Resampler(String),

    #[error("opus codec failure: {0}")]
    Opus(#[from] opus::Error),

    #[error("failed to create echo canceller ({frame_size} sample frame, {channels} channel echo)")]
    EchoCanceller { frame_size: usize, channels: u32 },

    #[error("audio frame encode failed: {0}")]
    Encode(String),

    #[error("failed to spawn pipeline worker: {0}")]
    Worker(#[from] std::io::Error),
}
