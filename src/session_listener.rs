use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::session::{CloseReason, SessionId};

/// The application's view of the transport. Callbacks for a given session arrive in order:
///  `on_session_opened`, then any number of `on_message`, then `on_session_closed`.
///
/// Callbacks are awaited by the server's event loop, so implementations should hand off
///  anything expensive rather than doing it inline.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionListener: Send + Sync + 'static {
    async fn on_session_opened(&self, session_id: SessionId, peer_addr: SocketAddr);

    /// An application payload that arrived in order (for its reliability mode and channel)
    async fn on_message(&self, session_id: SessionId, payload: &[u8]);

    async fn on_session_closed(&self, session_id: SessionId, reason: CloseReason);
}
