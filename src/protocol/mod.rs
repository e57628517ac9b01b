//! Wire format of the RakNet transport: offline (pre-session) messages, connected control
//!  messages, frames, frame sets and ACK / NACK records.
//!
//! All encoders follow the same pattern: `ser(&self, buf: &mut BytesMut)` appends the encoded
//!  form, `deser(buf: &mut impl Buf) -> anyhow::Result<Self>` consumes it, failing with
//!  [crate::error::ProtocolError::Malformed] on truncated or otherwise invalid input.

pub mod address;
pub mod connected;
pub mod frame;
pub mod frame_set;
pub mod offline;
pub mod record;
pub mod reliability;

/// The 16 byte cookie that every offline message carries
pub const MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];

/// IP header + UDP header, added to the datagram length when calculating MTU
pub const UDP_HEADER_SIZE: u16 = 28;

/// The largest MTU RakNet negotiates: a full Ethernet frame. This also keeps every frame's
///  payload well below what the frame header's bit length can express.
pub const MAX_MTU: u16 = 1500;

/// id byte + 24 bit sequence number
pub const FRAME_SET_HEADER_SIZE: usize = 4;

pub const MAX_ORDER_CHANNELS: u8 = 32;

pub mod ids {
    pub const CONNECTED_PING: u8 = 0x00;
    pub const UNCONNECTED_PING: u8 = 0x01;
    pub const UNCONNECTED_PING_OPEN_CONNECTIONS: u8 = 0x02;
    pub const CONNECTED_PONG: u8 = 0x03;
    pub const OPEN_CONNECTION_REQUEST_1: u8 = 0x05;
    pub const OPEN_CONNECTION_REPLY_1: u8 = 0x06;
    pub const OPEN_CONNECTION_REQUEST_2: u8 = 0x07;
    pub const OPEN_CONNECTION_REPLY_2: u8 = 0x08;
    pub const CONNECTION_REQUEST: u8 = 0x09;
    pub const CONNECTION_REQUEST_ACCEPTED: u8 = 0x10;
    pub const NEW_INCOMING_CONNECTION: u8 = 0x13;
    pub const DISCONNECT_NOTIFICATION: u8 = 0x15;
    pub const INCOMPATIBLE_PROTOCOL_VERSION: u8 = 0x19;
    pub const UNCONNECTED_PONG: u8 = 0x1c;

    pub const NACK: u8 = 0xa0;
    pub const ACK: u8 = 0xc0;
    /// the id that is written for data datagrams: 'valid' plus 'needs B and AS'
    pub const FRAME_SET: u8 = 0x84;

    /// application payloads produced by the wrapper layer
    pub const WRAPPER: u8 = 0xfe;

    pub fn is_frame_set(id: u8) -> bool {
        (0x80..=0x8f).contains(&id)
    }
}
