//! Packet assembler: buffered encoded frames in, [`AudioData`] out.

use crate::config::LoopbackMode;
use crate::controls::Controls;
use crate::sink::InputSinks;
use bytes::Bytes;
use clamor_protocol::audio::{legacy, targets, AudioCodec, AudioData};

/// Everything a flush needs besides the buffered frames themselves,
/// snapshotted at frame entry by the worker.
pub(crate) struct DeliveryContext<'a> {
    pub codec: AudioCodec,
    pub voice_target: i32,
    pub loopback: LoopbackMode,
    pub transmit_position: bool,
    pub controls: &'a Controls,
    pub sinks: &'a InputSinks,
}

/// Accumulates per-frame encoded blobs and the running frame counter, and
/// turns them into outbound packets.
pub(crate) struct PacketAssembler {
    frames: Vec<Bytes>,
    buffered_frames: u32,
    frame_counter: u64,
}

impl PacketAssembler {
    pub(crate) fn new() -> Self {
        Self {
            frames: Vec::new(),
            buffered_frames: 0,
            frame_counter: 0,
        }
    }

    pub(crate) fn buffered_frames(&self) -> u32 {
        self.buffered_frames
    }

    pub(crate) fn mark_buffered(&mut self, frames: u32) {
        self.buffered_frames += frames;
    }

    /// Advances the global frame counter (every captured frame, padding
    /// included, is stream time).
    pub(crate) fn advance_counter(&mut self, frames: u64) {
        self.frame_counter += frames;
    }

    pub(crate) fn reset_counter(&mut self) {
        self.frame_counter = 0;
    }

    /// Drops the buffered batch after a failed encode so the next flush's
    /// frame numbers stay consistent.
    pub(crate) fn discard(&mut self) {
        self.frames.clear();
        self.buffered_frames = 0;
    }

    /// Buffers one encoded frame and emits a packet once the batch is full or
    /// the utterance ended. Returns whether a packet went out.
    pub(crate) fn flush_check(
        &mut self,
        frame: Bytes,
        terminator: bool,
        frames_per_packet: u32,
        ctx: &DeliveryContext<'_>,
    ) -> bool {
        self.frames.push(frame);

        if !terminator && self.buffered_frames < frames_per_packet {
            return false;
        }

        let mut audio = AudioData::new(ctx.codec);
        audio.is_last_frame = terminator;
        audio.target_or_context = ctx.voice_target;

        if terminator {
            // A whisper release clears the live target before its last packet
            // flushes; that packet still belongs to the old target.
            if let Some(prev) = ctx.controls.consume_prev_target() {
                audio.target_or_context = prev;
            }
        }
        if ctx.loopback == LoopbackMode::Server {
            audio.target_or_context = targets::SERVER_LOOPBACK;
        }

        let frames = std::mem::take(&mut self.frames);
        let flushed = u64::from(self.buffered_frames);
        self.buffered_frames = 0;
        audio.frame_number = self.frame_counter - flushed;

        if ctx.transmit_position {
            if let Some(position) = ctx
                .sinks
                .position
                .as_ref()
                .and_then(|source| source.fetch_position())
            {
                audio.position = position;
                audio.contains_positional = true;
            }
        }

        audio.payload = if ctx.codec.is_legacy() {
            match legacy::encode_frames(&frames, terminator) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::error!(%err, "failed to assemble legacy payload, dropping packet");
                    return false;
                }
            }
        } else {
            // Opus carries exactly one encoded frame per packet.
            debug_assert_eq!(frames.len(), 1);
            frames.into_iter().next().unwrap_or_default()
        };

        if let Some(recorder) = &ctx.sinks.recorder {
            recorder.add_frame(&audio);
        }

        if ctx.loopback == LoopbackMode::Local {
            if let Some(loopback) = &ctx.sinks.loopback {
                loopback.add_frame(&audio);
            }
        } else if let Some(outbound) = &ctx.sinks.outbound {
            outbound.send_audio(&audio);
        }
        // Without an outbound sink the packet is dropped at the boundary.

        true
    }
}
