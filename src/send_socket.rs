use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// This is an abstraction for sending a datagram on a UDP socket, introduced to facilitate
///  mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]);
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        trace!("UDP socket: sending {} bytes to {:?}", datagram.len(), to);

        //NB: a failed send is logged but not propagated - reliable frames are resent by the
        //     session, and everything else may be lost anyway
        if let Err(e) = self.send_to(datagram, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }
}
