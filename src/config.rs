use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::protocol::{MAX_MTU, MAX_ORDER_CHANNELS, UDP_HEADER_SIZE};

pub struct RakConfig {
    pub bind_addr: SocketAddr,

    /// The server's identity towards clients, sent in offline replies. Random by default.
    pub guid: u64,

    /// The only RakNet protocol version the server accepts - clients with a different version
    ///  get an 'incompatible protocol version' reply
    pub protocol_version: u8,

    /// Handshake requests beyond this number of concurrent sessions are silently ignored
    pub max_sessions: usize,

    /// The interval at which sessions flush buffered frames, send ACKs / NACKs, resend
    ///  unacknowledged frame sets and check for timeouts
    pub tick_interval: Duration,

    /// A session that received nothing for this long is closed. This also bounds how long a
    ///  half-finished offline handshake is remembered.
    pub session_timeout: Duration,

    /// The upper bound for the MTU the server agrees to, regardless of what clients probe. This
    ///  is the full IP packet size, i.e. it includes IP and UDP headers.
    ///
    /// With full Ethernet frames and no optional IP headers, this is 1500. The RakNet default of
    ///  1492 leaves some room for PPPoE.
    pub max_mtu: u16,

    /// Clients probing for an MTU below this are not served
    pub min_mtu: u16,

    /// The age after which an unacknowledged frame set is sent again, even without a NACK
    pub resend_timeout: Duration,

    /// Established sessions send a ping at this interval to track latency
    pub ping_interval: Duration,

    pub order_channels: u8,

    /// Upper bound for the number of fragments a single message may be split into
    pub max_fragment_count: u32,
    /// Upper bound for the number of partially received fragmented messages per session
    pub max_open_fragment_sets: usize,

    /// The 'message of the day' that is returned in response to unconnected pings
    pub motd: String,
}

impl RakConfig {
    pub fn new(bind_addr: SocketAddr) -> RakConfig {
        RakConfig {
            bind_addr,
            guid: rand::random(),
            protocol_version: 11,
            max_sessions: 1024,
            tick_interval: Duration::from_millis(50),
            session_timeout: Duration::from_secs(10),
            max_mtu: 1492,
            min_mtu: 400,
            resend_timeout: Duration::from_secs(1),
            ping_interval: Duration::from_secs(5),
            order_channels: MAX_ORDER_CHANNELS,
            max_fragment_count: 1024,
            max_open_fragment_sets: 64,
            motd: String::new(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_mtu < 2 * UDP_HEADER_SIZE + 64 {
            bail!("minimum MTU {} is too small to carry any meaningful payload", self.min_mtu);
        }
        if self.max_mtu > MAX_MTU {
            bail!("maximum MTU {} exceeds the protocol limit of {}", self.max_mtu, MAX_MTU);
        }
        if self.max_mtu < self.min_mtu {
            bail!("maximum MTU {} is smaller than the minimum MTU {}", self.max_mtu, self.min_mtu);
        }
        if self.order_channels == 0 || self.order_channels > MAX_ORDER_CHANNELS {
            bail!("number of order channels must be between 1 and {}, was {}", MAX_ORDER_CHANNELS, self.order_channels);
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must not be zero");
        }
        if self.session_timeout <= self.tick_interval {
            bail!("session timeout must be longer than the tick interval");
        }
        if self.max_sessions == 0 {
            bail!("max_sessions must be at least 1");
        }
        if self.max_fragment_count == 0 || self.max_open_fragment_sets == 0 {
            bail!("fragment limits must be at least 1");
        }
        if self.motd.len() > u16::MAX as usize {
            bail!("motd is too long");
        }
        Ok(())
    }
}
