//! Fixed-size 3-byte frames and their codec.
//!
//! Both directions of the bridge exchange exactly three bytes per message
//! (status, data1, data2). Anything shorter that is left over when the stream
//! ends or stalls is not a frame and is discarded by the caller.

use std::{fmt, io};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Number of bytes in every frame.
pub const FRAME_LEN: usize = 3;

/// One 3-byte message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame([u8; FRAME_LEN]);

impl Frame {
    pub const fn new(status: u8, data1: u8, data2: u8) -> Self {
        Self([status, data1, data2])
    }

    /// Build a frame from exactly three bytes, or `None` for any other length.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; FRAME_LEN]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Hex rendering used in forwarding log lines, e.g. `90 3c 40`.
impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [status, data1, data2] = self.0;
        write!(f, "{:02x} {:02x} {:02x}", status, data1, data2)
    }
}

/// Codec splitting a byte stream into frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if src.len() < FRAME_LEN {
            src.reserve(FRAME_LEN - src.len());
            return Ok(None);
        }

        let mut bytes = [0u8; FRAME_LEN];
        src.copy_to_slice(&mut bytes);
        Ok(Some(Frame(bytes)))
    }

    // A partial frame at end of stream is dropped rather than reported.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                src.clear();
                Ok(None)
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.reserve(FRAME_LEN);
        dst.put_slice(frame.as_bytes());
        Ok(())
    }
}
