//! Per-peer protocol state: everything that happens after the offline handshake created a
//!  session for a peer address.

use std::fmt::{Display, Formatter};

use bytes::Bytes;

pub mod ack_tracker;
pub mod fragments;
pub mod ordering;
#[allow(clippy::module_inception)]
pub mod session;

/// Identifies a session towards the application. Ids are assigned by the server and never
///  reused during its lifetime, so a stale id can not accidentally address a newer session
///  from the same peer address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// nothing was received from the peer for the configured session timeout
    Timeout,
    /// the peer sent a disconnect notification
    PeerDisconnected,
    /// the application closed the session
    LocalDisconnect,
    /// the server shut down
    Shutdown,
}

/// The handshake state of a peer address as seen by the server
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    /// no handshake in progress - the initial state of every address
    AwaitingOpenRequest1,
    /// OpenConnectionRequest1 was answered, the server waits for OpenConnectionRequest2
    AwaitingOpenRequest2,
    /// a session exists for the address
    Connected,
    Closed,
}

/// The login that happens inside the session's reliable channel after the offline handshake
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoginPhase {
    AwaitingConnectionRequest,
    AwaitingNewIncomingConnection,
    Established,
}

/// Things a session reports to its owner, in the order they happened
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// the login completed, application messages flow from now on
    Opened,
    Message(Bytes),
    Closed(CloseReason),
}
