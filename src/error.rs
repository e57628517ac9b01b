use thiserror::Error;

/// Errors that callers need to tell apart. They travel inside `anyhow::Error` and can be
///  recovered with `downcast_ref::<ProtocolError>()`.
///
/// NB: None of these is fatal to the process - the worst case is that a single datagram or
///      wrapper payload is dropped, or a single session is closed
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Truncated buffer, trailing bytes, oversized var-int, unknown id etc.
    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("offline message without a valid magic cookie")]
    BadMagic,

    /// The wrapper checksum did not match - corruption, tampering or replay
    #[error("integrity check failed")]
    IntegrityFailure,

    #[error("payload of {len} bytes exceeds the limit of {limit} bytes")]
    PayloadTooLarge { len: usize, limit: usize },

    #[error("session is closed")]
    SessionClosed,
}

impl ProtocolError {
    pub fn malformed(msg: impl Into<String>) -> anyhow::Error {
        ProtocolError::Malformed(msg.into()).into()
    }
}

/// Checks if an error originated as a [ProtocolError::Malformed]
pub fn is_malformed(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<ProtocolError>(), Some(ProtocolError::Malformed(_)))
}
