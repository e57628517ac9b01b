//! A RakNet-style reliable transport over UDP, server side.
//!
//! ```ascii
//!  application  <-- BatchHandler / SessionListener -->  wrapper (batch, deflate, AES-CTR)
//!                                                          |
//!  RakServer event loop:  offline handshake  ->  Session per peer address
//!                                                 - frames, frame sets, ACK / NACK
//!                                                 - ordering, sequencing, fragments
//!                                                          |
//!                                                     UDP socket
//! ```
//!
//! [end_point::RakServer] owns the socket and all sessions, and is driven by a single event
//!  loop. The application talks to it through [end_point::ServerHandle] and is notified
//!  through [session_listener::SessionListener], which [wrapper::pipeline::WrapperListener]
//!  implements for applications that exchange compressed message batches.

pub mod config;
pub mod end_point;
pub mod error;
pub mod protocol;
pub mod send_socket;
pub mod session;
pub mod session_listener;
pub mod util;
pub mod wrapper;
