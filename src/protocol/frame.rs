use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::reliability::Reliability;
use crate::util::buf_ext::{BufExt, BufMutExt};
use crate::util::u24::U24;

const FLAG_FRAGMENTED: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderInfo {
    pub index: U24,
    pub channel: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentHeader {
    pub count: u32,
    pub id: u16,
    pub index: u32,
}
impl FragmentHeader {
    pub const SERIALIZED_LEN: usize = 4 + 2 + 4;
}

/// The atomic reliability unit, carrying one message or one fragment of a message.
///
/// ```ascii
/// 0: flags (u8): bits 5-7 reliability, bit 4 'fragmented'
/// 1: payload length in *bits* (u16)
/// *: reliable index (u24 LE) - if reliable
/// *: sequence index (u24 LE) - if sequenced
/// *: order index (u24 LE), order channel (u8) - if ordered or sequenced
/// *: fragment count (u32), fragment id (u16), fragment index (u32) - if fragmented
/// *: payload
/// ```
///
/// NB: The optional fields are present exactly if the reliability mode requires them. This is
///      established by the session when assigning indices, and checked when decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub reliability: Reliability,
    pub reliable_index: Option<U24>,
    pub sequence_index: Option<U24>,
    pub order: Option<OrderInfo>,
    pub fragment: Option<FragmentHeader>,
    pub payload: Bytes,
}

impl Frame {
    /// flags + bit length
    pub const BASE_HEADER_LEN: usize = 3;
    /// the biggest possible header: all indices plus fragment header
    pub const MAX_HEADER_LEN: usize = Self::BASE_HEADER_LEN + 3 + 3 + 4 + FragmentHeader::SERIALIZED_LEN;
    /// the payload length is written in bits as a u16
    pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize / 8;

    /// A frame without any indices assigned - the session fills them in before sending
    pub fn new(reliability: Reliability, payload: Bytes) -> Frame {
        Frame {
            reliability,
            reliable_index: None,
            sequence_index: None,
            order: None,
            fragment: None,
            payload,
        }
    }

    pub fn header_len(&self) -> usize {
        Self::header_len_for(self.reliability, self.fragment.is_some())
    }

    pub fn header_len_for(reliability: Reliability, fragmented: bool) -> usize {
        let mut result = Self::BASE_HEADER_LEN;
        if reliability.is_reliable() {
            result += 3;
        }
        if reliability.is_sequenced() {
            result += 3;
        }
        if reliability.is_ordered_or_sequenced() {
            result += 4;
        }
        if fragmented {
            result += FragmentHeader::SERIALIZED_LEN;
        }
        result
    }

    /// The exact number of bytes [Frame::ser] will write. This drives MTU based batching, so
    ///  it must never be an approximation.
    pub fn byte_size(&self) -> usize {
        self.header_len() + self.payload.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        debug_assert_eq!(self.reliable_index.is_some(), self.reliability.is_reliable());
        debug_assert_eq!(self.sequence_index.is_some(), self.reliability.is_sequenced());
        debug_assert_eq!(self.order.is_some(), self.reliability.is_ordered_or_sequenced());
        debug_assert!(self.payload.len() <= Self::MAX_PAYLOAD_LEN, "frame payload of {} bytes can not be encoded", self.payload.len());

        let mut flags = u8::from(self.reliability) << 5;
        if self.fragment.is_some() {
            flags |= FLAG_FRAGMENTED;
        }
        buf.put_u8(flags);
        buf.put_u16((self.payload.len() * 8) as u16);

        if self.reliability.is_reliable() {
            buf.put_u24_le(self.reliable_index.unwrap_or_default());
        }
        if self.reliability.is_sequenced() {
            buf.put_u24_le(self.sequence_index.unwrap_or_default());
        }
        if self.reliability.is_ordered_or_sequenced() {
            let order = self.order.unwrap_or(OrderInfo { index: U24::ZERO, channel: 0 });
            buf.put_u24_le(order.index);
            buf.put_u8(order.channel);
        }
        if let Some(fragment) = &self.fragment {
            buf.put_u32(fragment.count);
            buf.put_u16(fragment.id);
            buf.put_u32(fragment.index);
        }
        buf.put_slice(&self.payload);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Frame> {
        let flags = buf.get_u8_checked()?;
        let reliability = Reliability::try_from(flags >> 5)
            .map_err(|_| ProtocolError::malformed("invalid reliability"))?;

        let bit_len = buf.get_u16_checked()? as usize;
        let byte_len = bit_len.div_ceil(8);
        if byte_len == 0 {
            return Err(ProtocolError::malformed("frame with empty payload"));
        }

        let reliable_index = if reliability.is_reliable() {
            Some(buf.get_u24_le_checked()?)
        }
        else {
            None
        };
        let sequence_index = if reliability.is_sequenced() {
            Some(buf.get_u24_le_checked()?)
        }
        else {
            None
        };
        let order = if reliability.is_ordered_or_sequenced() {
            let index = buf.get_u24_le_checked()?;
            let channel = buf.get_u8_checked()?;
            Some(OrderInfo { index, channel })
        }
        else {
            None
        };
        let fragment = if flags & FLAG_FRAGMENTED != 0 {
            let count = buf.get_u32_checked()?;
            let id = buf.get_u16_checked()?;
            let index = buf.get_u32_checked()?;
            if index >= count {
                return Err(ProtocolError::malformed(format!("fragment index {} out of range for count {}", index, count)));
            }
            Some(FragmentHeader { count, id, index })
        }
        else {
            None
        };

        let payload = buf.get_bytes_checked(byte_len)?;

        Ok(Frame {
            reliability,
            reliable_index,
            sequence_index,
            order,
            fragment,
            payload,
        })
    }
}
