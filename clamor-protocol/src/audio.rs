//! Voice packet data model.
//!
//! [`AudioData`] is the unit handed from the capture pipeline to the
//! transport. The transport owns the byte framing around it; this module only
//! fixes the fields every peer has to agree on, plus the legacy multi-frame
//! payload layout used by the pre-Opus codecs.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Largest audio packet any peer will accept, header included.
pub const MAX_UDP_PACKET_SIZE: usize = 1024;

/// Reserved voice target / context identifiers.
pub mod targets {
    /// Normal speech into the current channel.
    pub const REGULAR_SPEECH: i32 = 0;
    /// Whisper targets occupy `1..=30`.
    pub const WHISPER_START: i32 = 1;
    pub const WHISPER_END: i32 = 30;
    /// Server-side loopback: the server echoes the packet back to the sender.
    pub const SERVER_LOOPBACK: i32 = 31;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AudioCodec {
    Opus,
    CeltAlpha,
    CeltBeta,
}

impl AudioCodec {
    /// Legacy codecs pack several frames into one packet; Opus never does.
    pub fn is_legacy(self) -> bool {
        !matches!(self, AudioCodec::Opus)
    }
}

/// One outbound voice packet, ready for the transport to frame and send.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioData {
    /// Voice target while sending, context while receiving.
    pub target_or_context: i32,
    pub codec: AudioCodec,
    /// Index of the first audio frame contained in this packet.
    pub frame_number: u64,
    /// Set on the final packet of an utterance.
    pub is_last_frame: bool,
    pub contains_positional: bool,
    pub position: [f32; 3],
    pub payload: Bytes,
}

impl AudioData {
    pub fn new(codec: AudioCodec) -> Self {
        Self {
            target_or_context: targets::REGULAR_SPEECH,
            codec,
            frame_number: 0,
            is_last_frame: false,
            contains_positional: false,
            position: [0.0; 3],
            payload: Bytes::new(),
        }
    }
}

pub mod legacy {
    //! Multi-frame payload layout of the legacy (CELT) codecs.
    //!
    //! Each frame is prefixed with a single header byte: the frame length in
    //! the low 7 bits, and the top bit set while more frames follow. An empty
    //! trailing frame marks the end of an utterance.

    use super::*;

    /// Longest frame representable by the 7-bit length header.
    pub const MAX_FRAME_LEN: usize = 0x7f;

    const CONTINUATION: u8 = 0x80;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum LegacyPayloadError {
        #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte header limit")]
        FrameTooLong(usize),
        #[error("payload truncated: header announces {expected} bytes, {available} remain")]
        Truncated { expected: usize, available: usize },
        #[error("payload continues past the final frame")]
        TrailingData,
    }

    /// Concatenates `frames` into a single payload. With `terminator` set, an
    /// empty frame is appended as the end-of-utterance marker.
    pub fn encode_frames(
        frames: &[Bytes],
        terminator: bool,
    ) -> Result<Bytes, LegacyPayloadError> {
        let mut out = BytesMut::with_capacity(
            frames.iter().map(|f| f.len() + 1).sum::<usize>() + usize::from(terminator),
        );

        let total = frames.len() + usize::from(terminator);
        for (i, frame) in frames.iter().enumerate() {
            if frame.len() > MAX_FRAME_LEN {
                return Err(LegacyPayloadError::FrameTooLong(frame.len()));
            }
            let mut head = frame.len() as u8;
            if i + 1 < total {
                head |= CONTINUATION;
            }
            out.put_u8(head);
            out.put_slice(frame);
        }
        if terminator {
            out.put_u8(0);
        }

        Ok(out.freeze())
    }

    /// Walks the header chain back into the ordered list of frames.
    pub fn parse_frames(payload: &[u8]) -> Result<Vec<Bytes>, LegacyPayloadError> {
        let mut frames = Vec::new();
        let mut rest = payload;

        loop {
            let Some((&head, tail)) = rest.split_first() else {
                // An empty payload carries zero frames.
                return Ok(frames);
            };
            let len = usize::from(head & !CONTINUATION);
            if tail.len() < len {
                return Err(LegacyPayloadError::Truncated {
                    expected: len,
                    available: tail.len(),
                });
            }
            let (frame, tail) = tail.split_at(len);
            frames.push(Bytes::copy_from_slice(frame));
            rest = tail;

            if head & CONTINUATION == 0 {
                if !rest.is_empty() {
                    return Err(LegacyPayloadError::TrailingData);
                }
                return Ok(frames);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::legacy::*;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn legacy_round_trip() {
        let frames = vec![
            Bytes::from_static(b"alpha"),
            Bytes::from_static(b""),
            Bytes::from_static(&[0xab; 127]),
        ];

        let payload = encode_frames(&frames, false).unwrap();
        let parsed = parse_frames(&payload).unwrap();

        assert_eq!(parsed, frames);
    }

    #[test]
    fn legacy_terminator_appends_empty_frame() {
        let frames = vec![Bytes::from_static(b"voice")];
        let payload = encode_frames(&frames, true).unwrap();

        // Continuation bit set on the data frame, cleared on the marker.
        assert_eq!(payload[0], 0x80 | 5);
        assert_eq!(payload[payload.len() - 1], 0x00);

        let parsed = parse_frames(&payload).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed[1].is_empty());
    }

    #[test]
    fn legacy_chain_terminates_on_clear_top_bit() {
        let frames = vec![Bytes::from_static(b"a"), Bytes::from_static(b"bc")];
        let payload = encode_frames(&frames, false).unwrap();
        assert_ne!(payload[0] & 0x80, 0);
        assert_eq!(payload[2] & 0x80, 0);
    }

    #[test]
    fn legacy_rejects_oversized_frame() {
        let frames = vec![Bytes::from(vec![0u8; 128])];
        assert_eq!(
            encode_frames(&frames, false),
            Err(LegacyPayloadError::FrameTooLong(128))
        );
    }

    #[test]
    fn legacy_rejects_truncated_payload() {
        assert_eq!(
            parse_frames(&[0x05, b'x']),
            Err(LegacyPayloadError::Truncated {
                expected: 5,
                available: 1
            })
        );
    }

    #[test]
    fn legacy_rejects_trailing_data() {
        assert_eq!(
            parse_frames(&[0x01, b'x', 0xff]),
            Err(LegacyPayloadError::TrailingData)
        );
    }

    #[test]
    fn codec_legacy_classification() {
        assert!(!AudioCodec::Opus.is_legacy());
        assert!(AudioCodec::CeltAlpha.is_legacy());
        assert!(AudioCodec::CeltBeta.is_legacy());
    }
}
