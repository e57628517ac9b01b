//! The application-facing layer on top of sessions: batches of application messages are
//!  compressed (and optionally encrypted) into a single payload, prefixed with
//!  [crate::protocol::ids::WRAPPER], and sent reliable-ordered.
//!
//! Encoding and decoding run on per-session [task_queue::SerialQueue]s rather than on the
//!  server's event loop.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::end_point::ServerHandle;
use crate::protocol::reliability::Reliability;
use crate::session::{CloseReason, SessionId};

pub mod batch;
pub mod encryption;
pub mod pipeline;
pub mod task_queue;

/// The application behind the wrapper layer
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    /// The pipeline is the application's way to send batches to the session and to switch
    ///  on encryption once it completed its key exchange.
    async fn on_session_opened(&self, session_id: SessionId, peer_addr: SocketAddr, pipeline: Arc<pipeline::WrapperPipeline>);

    /// The messages of one batch, in the order they were encoded
    async fn on_messages(&self, session_id: SessionId, messages: Vec<Bytes>);

    async fn on_session_closed(&self, session_id: SessionId, reason: CloseReason);
}

/// Where encoded payloads go. This is implemented by [ServerHandle], and is a trait so the
///  pipeline can be tested without a server.
#[cfg_attr(test, automock)]
pub trait MessageSink: Send + Sync + 'static {
    fn send_message(&self, session_id: SessionId, payload: Bytes, reliability: Reliability) -> anyhow::Result<()>;

    fn disconnect(&self, session_id: SessionId) -> anyhow::Result<()>;
}

impl MessageSink for ServerHandle {
    fn send_message(&self, session_id: SessionId, payload: Bytes, reliability: Reliability) -> anyhow::Result<()> {
        ServerHandle::send_message(self, session_id, payload, reliability)
    }

    fn disconnect(&self, session_id: SessionId) -> anyhow::Result<()> {
        ServerHandle::disconnect(self, session_id)
    }
}
