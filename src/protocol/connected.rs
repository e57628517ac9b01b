use std::net::SocketAddr;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::address::{deser_address, ser_address, unspecified_address};
use crate::protocol::ids;
use crate::util::buf_ext::{expect_fully_consumed, BufExt, BufMutExt};

/// RakNet sends this many 'system addresses' in a ConnectionRequestAccepted
pub const NUM_SYSTEM_ADDRESSES: usize = 10;

/// the two u64 timestamps that terminate the variable length address list
const TRAILING_TIMESTAMPS_LEN: usize = 16;

/// Control messages that travel as frame payloads inside an established session. Any payload
///  whose first byte is not one of these ids belongs to the application.
///
/// ```ascii
/// ConnectedPing (0x00):             time (u64)
/// ConnectedPong (0x03):             ping time (u64), pong time (u64)
/// ConnectionRequest (0x09):         client guid (u64), time (u64), security flag (u8)
/// ConnectionRequestAccepted (0x10): client address, system index (u16), 10 system addresses,
///                                    request time (u64), accepted time (u64)
/// NewIncomingConnection (0x13):     server address, system addresses, ping time (u64), pong time (u64)
/// DisconnectNotification (0x15):    -
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectedMessage {
    ConnectedPing {
        time: u64,
    },
    ConnectedPong {
        ping_time: u64,
        pong_time: u64,
    },
    ConnectionRequest {
        client_guid: u64,
        time: u64,
    },
    ConnectionRequestAccepted {
        client_addr: SocketAddr,
        system_index: u16,
        system_addresses: Vec<SocketAddr>,
        request_time: u64,
        accepted_time: u64,
    },
    NewIncomingConnection {
        server_addr: SocketAddr,
        system_addresses: Vec<SocketAddr>,
        ping_time: u64,
        pong_time: u64,
    },
    DisconnectNotification,
}

impl ConnectedMessage {
    pub fn is_control_id(id: u8) -> bool {
        matches!(id,
            ids::CONNECTED_PING
            | ids::CONNECTED_PONG
            | ids::CONNECTION_REQUEST
            | ids::CONNECTION_REQUEST_ACCEPTED
            | ids::NEW_INCOMING_CONNECTION
            | ids::DISCONNECT_NOTIFICATION
        )
    }

    pub fn id(&self) -> u8 {
        match self {
            ConnectedMessage::ConnectedPing { .. } => ids::CONNECTED_PING,
            ConnectedMessage::ConnectedPong { .. } => ids::CONNECTED_PONG,
            ConnectedMessage::ConnectionRequest { .. } => ids::CONNECTION_REQUEST,
            ConnectedMessage::ConnectionRequestAccepted { .. } => ids::CONNECTION_REQUEST_ACCEPTED,
            ConnectedMessage::NewIncomingConnection { .. } => ids::NEW_INCOMING_CONNECTION,
            ConnectedMessage::DisconnectNotification => ids::DISCONNECT_NOTIFICATION,
        }
    }

    /// A ConnectionRequestAccepted with the address list padded the way RakNet does it
    pub fn accepted(client_addr: SocketAddr, request_time: u64, accepted_time: u64) -> ConnectedMessage {
        ConnectedMessage::ConnectionRequestAccepted {
            client_addr,
            system_index: 0,
            system_addresses: vec![unspecified_address(); NUM_SYSTEM_ADDRESSES],
            request_time,
            accepted_time,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.id());

        match self {
            ConnectedMessage::ConnectedPing { time } => {
                buf.put_u64(*time);
            }
            ConnectedMessage::ConnectedPong { ping_time, pong_time } => {
                buf.put_u64(*ping_time);
                buf.put_u64(*pong_time);
            }
            ConnectedMessage::ConnectionRequest { client_guid, time } => {
                buf.put_u64(*client_guid);
                buf.put_u64(*time);
                buf.put_bool(false);
            }
            ConnectedMessage::ConnectionRequestAccepted { client_addr, system_index, system_addresses, request_time, accepted_time } => {
                ser_address(client_addr, buf);
                buf.put_u16(*system_index);
                for addr in system_addresses {
                    ser_address(addr, buf);
                }
                buf.put_u64(*request_time);
                buf.put_u64(*accepted_time);
            }
            ConnectedMessage::NewIncomingConnection { server_addr, system_addresses, ping_time, pong_time } => {
                ser_address(server_addr, buf);
                for addr in system_addresses {
                    ser_address(addr, buf);
                }
                buf.put_u64(*ping_time);
                buf.put_u64(*pong_time);
            }
            ConnectedMessage::DisconnectNotification => {}
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ConnectedMessage> {
        let result = match buf.get_u8_checked()? {
            ids::CONNECTED_PING => ConnectedMessage::ConnectedPing {
                time: buf.get_u64_checked()?,
            },
            ids::CONNECTED_PONG => ConnectedMessage::ConnectedPong {
                ping_time: buf.get_u64_checked()?,
                pong_time: buf.get_u64_checked()?,
            },
            ids::CONNECTION_REQUEST => {
                let client_guid = buf.get_u64_checked()?;
                let time = buf.get_u64_checked()?;
                // some clients omit the security flag
                if buf.has_remaining() {
                    let _security = buf.get_bool_checked()?;
                }
                ConnectedMessage::ConnectionRequest { client_guid, time }
            }
            ids::CONNECTION_REQUEST_ACCEPTED => {
                let client_addr = deser_address(buf)?;
                let system_index = buf.get_u16_checked()?;
                let system_addresses = Self::deser_system_addresses(buf)?;
                ConnectedMessage::ConnectionRequestAccepted {
                    client_addr,
                    system_index,
                    system_addresses,
                    request_time: buf.get_u64_checked()?,
                    accepted_time: buf.get_u64_checked()?,
                }
            }
            ids::NEW_INCOMING_CONNECTION => {
                let server_addr = deser_address(buf)?;
                let system_addresses = Self::deser_system_addresses(buf)?;
                ConnectedMessage::NewIncomingConnection {
                    server_addr,
                    system_addresses,
                    ping_time: buf.get_u64_checked()?,
                    pong_time: buf.get_u64_checked()?,
                }
            }
            ids::DISCONNECT_NOTIFICATION => ConnectedMessage::DisconnectNotification,
            id => return Err(ProtocolError::malformed(format!("{:#04x} is not a connected control message id", id))),
        };

        expect_fully_consumed(buf, "connected control message")?;
        Ok(result)
    }

    /// The number of system addresses varies between RakNet implementations, so they are read
    ///  until only the trailing timestamps remain
    fn deser_system_addresses(buf: &mut impl Buf) -> anyhow::Result<Vec<SocketAddr>> {
        let mut result = Vec::new();
        while buf.remaining() > TRAILING_TIMESTAMPS_LEN {
            result.push(deser_address(buf)?);
        }
        Ok(result)
    }
}
