//! Wire framing for audio chunks.
//!
//! Two framings are supported:
//!
//! - [`Framing::LengthPrefixed`]: every frame is `tag | u32 BE length | payload`.
//!   Audio chunks use tag `A`; graceful completion is an empty `E` frame and a
//!   stop acknowledgement is an empty `S` frame. Payload bytes can never be
//!   mistaken for a terminator.
//! - [`Framing::Legacy`]: raw chunks followed by the ASCII sentinel `Done` on
//!   completion, nothing on stop. Compatible with older clients, but a chunk
//!   whose bytes happen to read `Done` ends the stream early on their side.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio_util::codec::Decoder;

/// Completion marker written by [`Framing::Legacy`].
pub const LEGACY_SENTINEL: &[u8] = b"Done";

/// Tag byte of an audio frame.
pub const TAG_AUDIO: u8 = b'A';
/// Tag byte of the completion frame.
pub const TAG_COMPLETED: u8 = b'E';
/// Tag byte of the stop acknowledgement frame.
pub const TAG_STOPPED: u8 = b'S';

const HEADER_LEN: usize = 5;

/// Chunk framing used after the audio header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// Raw chunks plus a `Done` sentinel
    Legacy,
    /// Tagged, length-prefixed frames
    #[default]
    LengthPrefixed,
}

impl Framing {
    /// Bytes to put on the wire for one audio chunk.
    pub fn audio(self, chunk: &[u8]) -> Vec<u8> {
        match self {
            Framing::Legacy => chunk.to_vec(),
            Framing::LengthPrefixed => tagged(TAG_AUDIO, chunk),
        }
    }

    /// Bytes signalling the source was exhausted.
    pub fn completed(self) -> Vec<u8> {
        match self {
            Framing::Legacy => LEGACY_SENTINEL.to_vec(),
            Framing::LengthPrefixed => tagged(TAG_COMPLETED, &[]),
        }
    }

    /// Bytes acknowledging a stop, if this framing has any.
    pub fn stopped(self) -> Option<Vec<u8>> {
        match self {
            Framing::Legacy => None,
            Framing::LengthPrefixed => Some(tagged(TAG_STOPPED, &[])),
        }
    }
}

fn tagged(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(tag);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

// ============================================================================
// Decoding (receiver side)
// ============================================================================

/// A decoded length-prefixed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Audio(Vec<u8>),
    Completed,
    Stopped,
}

impl Frame {
    /// True for frames after which nothing more arrives for the stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Frame::Audio(_))
    }
}

/// Decoder for [`Framing::LengthPrefixed`] frames.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(1 << 20)
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let tag = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > self.max_payload {
            return Err(invalid(format!("frame of {len} bytes exceeds limit")));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(HEADER_LEN + len);
        let payload = &frame[HEADER_LEN..];
        match tag {
            TAG_AUDIO => Ok(Some(Frame::Audio(payload.to_vec()))),
            TAG_COMPLETED if payload.is_empty() => Ok(Some(Frame::Completed)),
            TAG_STOPPED if payload.is_empty() => Ok(Some(Frame::Stopped)),
            other => Err(invalid(format!("unexpected frame tag {other:#04x}"))),
        }
    }
}

fn invalid(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}
