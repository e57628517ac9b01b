use std::net::SocketAddr;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::address::{deser_address, ser_address};
use crate::protocol::{ids, UDP_HEADER_SIZE};
use crate::util::buf_ext::{expect_fully_consumed, BufExt, BufMutExt};

/// The messages that are exchanged before a session exists. Each of them carries the 16 byte
///  magic cookie, and decoding fails with [ProtocolError::BadMagic] if it does not match.
///
/// ```ascii
/// UnconnectedPing (0x01 / 0x02):    time (u64), magic, client guid (u64)
/// UnconnectedPong (0x1c):           time (u64), server guid (u64), magic, motd (u16 len + UTF-8)
/// OpenConnectionRequest1 (0x05):    magic, protocol version (u8), zero padding up to the probed MTU
/// OpenConnectionReply1 (0x06):      magic, server guid (u64), security flag (u8), mtu (u16)
/// OpenConnectionRequest2 (0x07):    magic, server address, mtu (u16), client guid (u64)
/// OpenConnectionReply2 (0x08):      magic, server guid (u64), client address, mtu (u16), encryption flag (u8)
/// IncompatibleProtocolVersion (0x19): protocol version (u8), magic, server guid (u64)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfflineMessage {
    UnconnectedPing {
        time: u64,
        client_guid: u64,
        /// 0x02 - the client only wants an answer if there are open session slots
        open_connections_only: bool,
    },
    UnconnectedPong {
        time: u64,
        server_guid: u64,
        motd: String,
    },
    /// The MTU is not a field on the wire: the client pads the datagram to the size it probes,
    ///  and the MTU is the datagram's length plus IP and UDP headers
    OpenConnectionRequest1 {
        protocol_version: u8,
        mtu: u16,
    },
    OpenConnectionReply1 {
        server_guid: u64,
        mtu: u16,
    },
    OpenConnectionRequest2 {
        server_addr: SocketAddr,
        mtu: u16,
        client_guid: u64,
    },
    OpenConnectionReply2 {
        server_guid: u64,
        client_addr: SocketAddr,
        mtu: u16,
    },
    IncompatibleProtocolVersion {
        protocol_version: u8,
        server_guid: u64,
    },
}

impl OfflineMessage {
    pub fn is_offline_id(id: u8) -> bool {
        matches!(id,
            ids::UNCONNECTED_PING
            | ids::UNCONNECTED_PING_OPEN_CONNECTIONS
            | ids::UNCONNECTED_PONG
            | ids::OPEN_CONNECTION_REQUEST_1
            | ids::OPEN_CONNECTION_REPLY_1
            | ids::OPEN_CONNECTION_REQUEST_2
            | ids::OPEN_CONNECTION_REPLY_2
            | ids::INCOMPATIBLE_PROTOCOL_VERSION
        )
    }

    pub fn id(&self) -> u8 {
        match self {
            OfflineMessage::UnconnectedPing { open_connections_only: false, .. } => ids::UNCONNECTED_PING,
            OfflineMessage::UnconnectedPing { open_connections_only: true, .. } => ids::UNCONNECTED_PING_OPEN_CONNECTIONS,
            OfflineMessage::UnconnectedPong { .. } => ids::UNCONNECTED_PONG,
            OfflineMessage::OpenConnectionRequest1 { .. } => ids::OPEN_CONNECTION_REQUEST_1,
            OfflineMessage::OpenConnectionReply1 { .. } => ids::OPEN_CONNECTION_REPLY_1,
            OfflineMessage::OpenConnectionRequest2 { .. } => ids::OPEN_CONNECTION_REQUEST_2,
            OfflineMessage::OpenConnectionReply2 { .. } => ids::OPEN_CONNECTION_REPLY_2,
            OfflineMessage::IncompatibleProtocolVersion { .. } => ids::INCOMPATIBLE_PROTOCOL_VERSION,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u8(self.id());

        match self {
            OfflineMessage::UnconnectedPing { time, client_guid, .. } => {
                buf.put_u64(*time);
                buf.put_magic();
                buf.put_u64(*client_guid);
            }
            OfflineMessage::UnconnectedPong { time, server_guid, motd } => {
                buf.put_u64(*time);
                buf.put_u64(*server_guid);
                buf.put_magic();
                buf.put_string(motd);
            }
            OfflineMessage::OpenConnectionRequest1 { protocol_version, mtu } => {
                buf.put_magic();
                buf.put_u8(*protocol_version);
                let datagram_len = mtu.saturating_sub(UDP_HEADER_SIZE) as usize;
                let written = buf.len() - start;
                if datagram_len > written {
                    buf.put_bytes(0, datagram_len - written);
                }
            }
            OfflineMessage::OpenConnectionReply1 { server_guid, mtu } => {
                buf.put_magic();
                buf.put_u64(*server_guid);
                buf.put_bool(false);
                buf.put_u16(*mtu);
            }
            OfflineMessage::OpenConnectionRequest2 { server_addr, mtu, client_guid } => {
                buf.put_magic();
                ser_address(server_addr, buf);
                buf.put_u16(*mtu);
                buf.put_u64(*client_guid);
            }
            OfflineMessage::OpenConnectionReply2 { server_guid, client_addr, mtu } => {
                buf.put_magic();
                buf.put_u64(*server_guid);
                ser_address(client_addr, buf);
                buf.put_u16(*mtu);
                buf.put_bool(false);
            }
            OfflineMessage::IncompatibleProtocolVersion { protocol_version, server_guid } => {
                buf.put_u8(*protocol_version);
                buf.put_magic();
                buf.put_u64(*server_guid);
            }
        }
    }

    /// Decodes a complete offline datagram, including the id byte
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<OfflineMessage> {
        let datagram_len = buf.remaining();
        let id = buf.get_u8_checked()?;

        let result = match id {
            ids::UNCONNECTED_PING | ids::UNCONNECTED_PING_OPEN_CONNECTIONS => {
                let time = buf.get_u64_checked()?;
                buf.expect_magic()?;
                let client_guid = buf.get_u64_checked()?;
                OfflineMessage::UnconnectedPing {
                    time,
                    client_guid,
                    open_connections_only: id == ids::UNCONNECTED_PING_OPEN_CONNECTIONS,
                }
            }
            ids::UNCONNECTED_PONG => {
                let time = buf.get_u64_checked()?;
                let server_guid = buf.get_u64_checked()?;
                buf.expect_magic()?;
                let motd = buf.get_string_checked()?;
                OfflineMessage::UnconnectedPong { time, server_guid, motd }
            }
            ids::OPEN_CONNECTION_REQUEST_1 => {
                buf.expect_magic()?;
                let protocol_version = buf.get_u8_checked()?;
                buf.advance(buf.remaining());
                let mtu = (datagram_len + UDP_HEADER_SIZE as usize).min(u16::MAX as usize) as u16;
                OfflineMessage::OpenConnectionRequest1 { protocol_version, mtu }
            }
            ids::OPEN_CONNECTION_REPLY_1 => {
                buf.expect_magic()?;
                let server_guid = buf.get_u64_checked()?;
                let _security = buf.get_bool_checked()?;
                let mtu = buf.get_u16_checked()?;
                OfflineMessage::OpenConnectionReply1 { server_guid, mtu }
            }
            ids::OPEN_CONNECTION_REQUEST_2 => {
                buf.expect_magic()?;
                let server_addr = deser_address(buf)?;
                let mtu = buf.get_u16_checked()?;
                let client_guid = buf.get_u64_checked()?;
                OfflineMessage::OpenConnectionRequest2 { server_addr, mtu, client_guid }
            }
            ids::OPEN_CONNECTION_REPLY_2 => {
                buf.expect_magic()?;
                let server_guid = buf.get_u64_checked()?;
                let client_addr = deser_address(buf)?;
                let mtu = buf.get_u16_checked()?;
                let _encryption = buf.get_bool_checked()?;
                OfflineMessage::OpenConnectionReply2 { server_guid, client_addr, mtu }
            }
            ids::INCOMPATIBLE_PROTOCOL_VERSION => {
                let protocol_version = buf.get_u8_checked()?;
                buf.expect_magic()?;
                let server_guid = buf.get_u64_checked()?;
                OfflineMessage::IncompatibleProtocolVersion { protocol_version, server_guid }
            }
            id => return Err(ProtocolError::malformed(format!("{:#04x} is not an offline message id", id))),
        };

        expect_fully_consumed(buf, "offline message")?;
        Ok(result)
    }
}
