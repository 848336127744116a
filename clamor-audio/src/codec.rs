//! Codec selection and per-frame encoding.
//!
//! Opus is the primary codec. The legacy CELT variants survive only for old
//! servers: their implementations are loaded at runtime by the host
//! application (and may be absent entirely), so this module sees them as
//! trait objects keyed by bitstream version.

use crate::bandwidth::BandwidthBudget;
use crate::config::LoopbackMode;
use crate::error::AudioInputError;
use bytes::Bytes;
use clamor_protocol::audio::{legacy, AudioCodec, MAX_UDP_PACKET_SIZE};
use opus::{Application, Bitrate, Channels, Encoder};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A legacy codec implementation, identified by its bitstream version.
pub trait LegacyCodec: Send + Sync {
    fn bitstream_version(&self) -> i32;
    /// Creates an encoder with inter-frame prediction disabled.
    fn new_encoder(&self) -> Box<dyn LegacyEncoder>;
}

pub trait LegacyEncoder: Send {
    /// Drops all inter-frame encoder state.
    fn reset(&mut self);
    /// Encodes one frame at `vbr_rate` bits/s into at most `max_bytes` bytes.
    fn encode(
        &mut self,
        pcm: &[i16],
        vbr_rate: i32,
        max_bytes: usize,
    ) -> Result<Bytes, AudioInputError>;
}

/// Legacy codecs available to this client, keyed by bitstream version.
#[derive(Default, Clone)]
pub struct CodecRegistry {
    codecs: BTreeMap<i32, Arc<dyn LegacyCodec>>,
}

impl CodecRegistry {
    pub fn insert(&mut self, codec: Arc<dyn LegacyCodec>) {
        self.codecs.insert(codec.bitstream_version(), codec);
    }

    pub fn get(&self, version: i32) -> Option<&Arc<dyn LegacyCodec>> {
        self.codecs.get(&version)
    }

    /// Highest bitstream version, used for local loopback.
    pub fn latest(&self) -> Option<&Arc<dyn LegacyCodec>> {
        self.codecs.values().next_back()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

/// What the server advertised about codec support.
#[derive(Debug, Clone, Copy)]
pub struct ServerCodecInfo {
    pub opus: bool,
    pub celt_alpha: i32,
    pub celt_beta: i32,
    pub prefer_alpha: bool,
    /// False until a session is established.
    pub session_active: bool,
}

impl Default for ServerCodecInfo {
    fn default() -> Self {
        Self {
            opus: true,
            celt_alpha: 0,
            celt_beta: 0,
            prefer_alpha: true,
            session_active: false,
        }
    }
}

struct LegacySlot {
    version: i32,
    encoder: Box<dyn LegacyEncoder>,
}

/// Encoder state for the currently selected codec. At most one of the Opus
/// and legacy encoders is live at a time.
pub(crate) struct CodecStage {
    selected: Option<AudioCodec>,
    opus: Option<Encoder>,
    legacy: Option<LegacySlot>,
    reset_pending: bool,
}

impl CodecStage {
    pub(crate) fn new() -> Self {
        Self {
            selected: None,
            opus: None,
            legacy: None,
            reset_pending: true,
        }
    }

    pub(crate) fn request_reset(&mut self) {
        self.reset_pending = true;
    }

    /// Re-evaluates the codec choice. `mid_utterance` pins the current
    /// selection so the codec never changes inside an utterance.
    ///
    /// Returns the selected codec and whether it changed, or `None` when no
    /// usable codec exists (the pipeline then emits nothing).
    pub(crate) fn select(
        &mut self,
        server: &ServerCodecInfo,
        registry: &CodecRegistry,
        loopback: LoopbackMode,
        mid_utterance: bool,
    ) -> Option<(AudioCodec, bool)> {
        if mid_utterance {
            return self.selected.map(|codec| (codec, false));
        }

        let use_opus = server.opus || loopback == LoopbackMode::Local;

        let target = if use_opus {
            AudioCodec::Opus
        } else {
            let pick = if !server.session_active || loopback == LoopbackMode::Local {
                registry.latest()
            } else {
                let (first, second) = if server.prefer_alpha {
                    (server.celt_alpha, server.celt_beta)
                } else {
                    (server.celt_beta, server.celt_alpha)
                };
                registry.get(first).or_else(|| registry.get(second))
            };
            let pick = pick?.clone();
            let version = pick.bitstream_version();

            let codec = if !server.session_active || version == server.celt_alpha {
                AudioCodec::CeltAlpha
            } else if version == server.celt_beta {
                AudioCodec::CeltBeta
            } else {
                tracing::warn!(version, "no packet type for codec bitstream version");
                AudioCodec::CeltAlpha
            };

            let stale = self
                .legacy
                .as_ref()
                .map_or(true, |slot| slot.version != version);
            if stale {
                self.legacy = Some(LegacySlot {
                    version,
                    encoder: pick.new_encoder(),
                });
            }
            codec
        };

        let changed = self.selected != Some(target);
        if changed {
            tracing::debug!(?target, "switching voice codec");
            match target {
                AudioCodec::Opus => self.legacy = None,
                AudioCodec::CeltAlpha | AudioCodec::CeltBeta => self.opus = None,
            }
            self.selected = Some(target);
            self.reset_pending = true;
        }

        Some((target, changed))
    }

    /// Encodes `frames_per_packet` worth of buffered samples as one Opus
    /// packet. Returns the payload and the bitrate to report.
    pub(crate) fn encode_opus(
        &mut self,
        pcm: &[i16],
        budget: &BandwidthBudget,
        frame_size: usize,
    ) -> Result<(Bytes, i32), AudioInputError> {
        if self.opus.is_none() {
            self.opus = Some(create_opus_encoder(budget)?);
        }
        let Some(encoder) = self.opus.as_mut() else {
            return Err(AudioInputError::Encode("opus encoder unavailable".into()));
        };

        if self.reset_pending {
            encoder.reset_state()?;
            self.reset_pending = false;
        }
        encoder.set_bitrate(Bitrate::Bits(budget.bitrate))?;

        let mut buffer = vec![0u8; MAX_UDP_PACKET_SIZE];
        let len = encoder.encode(pcm, &mut buffer)?;
        if len == 0 {
            return Err(AudioInputError::Encode("empty opus packet".into()));
        }
        buffer.truncate(len);

        let ten_ms_frames = (pcm.len() / frame_size).max(1) as i32;
        let bitrate = (len as i32 * 8 * 100) / ten_ms_frames;

        Ok((Bytes::from(buffer), bitrate))
    }

    /// Encodes one frame with the selected legacy codec.
    pub(crate) fn encode_legacy(
        &mut self,
        pcm: &[i16],
        vbr_rate: i32,
    ) -> Result<(Bytes, i32), AudioInputError> {
        let slot = self
            .legacy
            .as_mut()
            .ok_or_else(|| AudioInputError::Encode("no legacy encoder selected".into()))?;

        if self.reset_pending {
            slot.encoder.reset();
            self.reset_pending = false;
        }

        let max_bytes = ((vbr_rate / 800) as usize).min(legacy::MAX_FRAME_LEN);
        let frame = slot.encoder.encode(pcm, vbr_rate, max_bytes)?;
        if frame.is_empty() || frame.len() > max_bytes {
            return Err(AudioInputError::Encode(format!(
                "legacy encoder produced {} bytes (cap {max_bytes})",
                frame.len()
            )));
        }

        let bitrate = frame.len() as i32 * 800;
        Ok((frame, bitrate))
    }
}

/// Application mode follows the bitrate: restricted low-delay only at high
/// rates (and only when allowed), full audio in the middle band, VoIP below.
fn create_opus_encoder(budget: &BandwidthBudget) -> Result<Encoder, AudioInputError> {
    let application = if budget.allow_low_delay && budget.bitrate >= 64_000 {
        Application::LowDelay
    } else if budget.bitrate >= 32_000 {
        Application::Audio
    } else {
        Application::Voip
    };
    tracing::debug!(
        bitrate = budget.bitrate,
        low_delay = budget.allow_low_delay,
        "creating opus encoder"
    );

    let mut encoder = Encoder::new(crate::SAMPLE_RATE, Channels::Mono, application)?;
    // CBR keeps the packet cadence uniform for the bandwidth model.
    encoder.set_vbr(false)?;
    Ok(encoder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FRAME_SIZE;
    use pretty_assertions::assert_eq;

    struct StubCodec {
        version: i32,
    }

    struct StubEncoder {
        resets: usize,
    }

    impl LegacyCodec for StubCodec {
        fn bitstream_version(&self) -> i32 {
            self.version
        }

        fn new_encoder(&self) -> Box<dyn LegacyEncoder> {
            Box::new(StubEncoder { resets: 0 })
        }
    }

    impl LegacyEncoder for StubEncoder {
        fn reset(&mut self) {
            self.resets += 1;
        }

        fn encode(
            &mut self,
            _pcm: &[i16],
            _vbr_rate: i32,
            max_bytes: usize,
        ) -> Result<Bytes, AudioInputError> {
            Ok(Bytes::from(vec![0x55u8; max_bytes.min(8)]))
        }
    }

    fn registry(versions: &[i32]) -> CodecRegistry {
        let mut registry = CodecRegistry::default();
        for &version in versions {
            registry.insert(Arc::new(StubCodec { version }));
        }
        registry
    }

    fn server(opus: bool, alpha: i32, beta: i32) -> ServerCodecInfo {
        ServerCodecInfo {
            opus,
            celt_alpha: alpha,
            celt_beta: beta,
            prefer_alpha: true,
            session_active: true,
        }
    }

    fn budget(bitrate: i32, allow_low_delay: bool) -> BandwidthBudget {
        BandwidthBudget {
            bitrate,
            frames_per_packet: 2,
            allow_low_delay,
        }
    }

    #[test]
    fn opus_selected_when_server_advertises_it() {
        let mut stage = CodecStage::new();
        let picked = stage.select(
            &server(true, 1, 2),
            &registry(&[1, 2]),
            LoopbackMode::None,
            false,
        );
        assert_eq!(picked, Some((AudioCodec::Opus, true)));
    }

    #[test]
    fn local_loopback_forces_opus() {
        let mut stage = CodecStage::new();
        let picked = stage.select(
            &server(false, 1, 2),
            &registry(&[1, 2]),
            LoopbackMode::Local,
            false,
        );
        assert_eq!(picked, Some((AudioCodec::Opus, true)));
    }

    #[test]
    fn legacy_preference_falls_back_to_other_version() {
        let mut stage = CodecStage::new();
        // Alpha version 7 is not installed, beta 9 is.
        let picked = stage.select(&server(false, 7, 9), &registry(&[9]), LoopbackMode::None, false);
        assert_eq!(picked, Some((AudioCodec::CeltBeta, true)));
    }

    #[test]
    fn selection_pinned_mid_utterance() {
        let mut stage = CodecStage::new();
        stage
            .select(&server(false, 1, 2), &registry(&[1, 2]), LoopbackMode::None, false)
            .unwrap();

        // The server starts advertising Opus mid-utterance; the selection
        // must hold until the utterance ends.
        let picked = stage.select(&server(true, 1, 2), &registry(&[1, 2]), LoopbackMode::None, true);
        assert_eq!(picked, Some((AudioCodec::CeltAlpha, false)));

        let picked = stage.select(&server(true, 1, 2), &registry(&[1, 2]), LoopbackMode::None, false);
        assert_eq!(picked, Some((AudioCodec::Opus, true)));
    }

    #[test]
    fn no_codec_available_yields_none() {
        let mut stage = CodecStage::new();
        let picked = stage.select(
            &server(false, 1, 2),
            &CodecRegistry::default(),
            LoopbackMode::None,
            false,
        );
        assert_eq!(picked, None);
    }

    #[test]
    fn opus_round_trip_produces_frames() {
        let mut stage = CodecStage::new();
        stage
            .select(&server(true, 0, 0), &registry(&[]), LoopbackMode::None, false)
            .unwrap();

        let pcm: Vec<i16> = (0..FRAME_SIZE * 2)
            .map(|i| ((i as f32 * 0.05).sin() * 12_000.0) as i16)
            .collect();
        let (payload, bitrate) = stage
            .encode_opus(&pcm, &budget(40_000, false), FRAME_SIZE)
            .unwrap();

        assert!(!payload.is_empty());
        // Two 10 ms frames: reported bitrate is bytes * 800 / 2.
        assert_eq!(bitrate, payload.len() as i32 * 8 * 100 / 2);
    }

    #[test]
    fn legacy_payload_respects_byte_cap() {
        let mut stage = CodecStage::new();
        stage
            .select(&server(false, 1, 2), &registry(&[1, 2]), LoopbackMode::None, false)
            .unwrap();

        let pcm = vec![0i16; FRAME_SIZE];
        let (frame, bitrate) = stage.encode_legacy(&pcm, 40_000).unwrap();

        assert!(frame.len() <= 50);
        assert_eq!(bitrate, frame.len() as i32 * 800);
    }
}
