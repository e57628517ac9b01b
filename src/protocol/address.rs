use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;
use crate::util::buf_ext::BufExt;

/// address family tag that RakNet writes for IP V6 (Windows' AF_INET6), little endian
const AF_INET6: u16 = 23;

/// RakNet address encoding:
///
/// ```ascii
/// 0: version (u8) - 4 or 6
/// V4:
///   1: address (4 bytes), each octet bitwise inverted
///   5: port (u16)
/// V6:
///   1: address family (u16 LE)
///   3: port (u16)
///   5: flow info (u32) - always 0
///   9: address (16 bytes)
///  25: scope id (u32) - always 0
/// ```
pub fn ser_address(addr: &SocketAddr, buf: &mut impl BufMut) {
    match addr {
        SocketAddr::V4(addr) => {
            buf.put_u8(4);
            for octet in addr.ip().octets() {
                buf.put_u8(!octet);
            }
            buf.put_u16(addr.port());
        }
        SocketAddr::V6(addr) => {
            buf.put_u8(6);
            buf.put_u16_le(AF_INET6);
            buf.put_u16(addr.port());
            buf.put_u32(0);
            buf.put_slice(&addr.ip().octets());
            buf.put_u32(0);
        }
    }
}

pub fn deser_address(buf: &mut impl Buf) -> anyhow::Result<SocketAddr> {
    match buf.get_u8_checked()? {
        4 => {
            let raw = buf.get_bytes_checked(4)?;
            let ip = Ipv4Addr::new(!raw[0], !raw[1], !raw[2], !raw[3]);
            let port = buf.get_u16_checked()?;
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        6 => {
            let _family = buf.get_u16_le_checked()?;
            let port = buf.get_u16_checked()?;
            let _flow_info = buf.get_u32_checked()?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf.get_bytes_checked(16)?);
            let _scope_id = buf.get_u32_checked()?;
            Ok(SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0)))
        }
        n => Err(ProtocolError::malformed(format!("invalid address version {}", n))),
    }
}

/// The placeholder RakNet uses to pad the list of 'system addresses'
pub fn unspecified_address() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}

pub fn serialized_len(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => 7,
        SocketAddr::V6(_) => 29,
    }
}
