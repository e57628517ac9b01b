use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::frame::Frame;
use crate::protocol::{ids, FRAME_SET_HEADER_SIZE};
use crate::util::buf_ext::{BufExt, BufMutExt};
use crate::util::u24::U24;

/// A sequence-numbered batch of frames that travels in a single datagram:
///
/// ```ascii
/// 0: id (u8) - 0x80 to 0x8f
/// 1: sequence number (u24 LE)
/// 4: frames, concatenated until the end of the datagram
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSet {
    pub sequence_number: U24,
    pub frames: Vec<Frame>,
}

impl FrameSet {
    pub fn byte_size(&self) -> usize {
        FRAME_SET_HEADER_SIZE + self.frames.iter().map(Frame::byte_size).sum::<usize>()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(ids::FRAME_SET);
        buf.put_u24_le(self.sequence_number);
        for frame in &self.frames {
            frame.ser(buf);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FrameSet> {
        let id = buf.get_u8_checked()?;
        if !ids::is_frame_set(id) {
            return Err(ProtocolError::malformed(format!("datagram id {:#04x} is not a frame set", id)));
        }
        let sequence_number = buf.get_u24_le_checked()?;

        let mut frames = Vec::new();
        while buf.has_remaining() {
            frames.push(Frame::deser(buf)?);
        }
        Ok(FrameSet { sequence_number, frames })
    }
}
