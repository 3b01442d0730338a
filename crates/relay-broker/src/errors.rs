//! Broker error types.
//!
//! Transport and protocol failures are fatal only to the session they
//! occur on; cleanup failures are logged and swallowed so they can
//! never block other sessions.

use relay_protocol::CodecError;
use thiserror::Error;

/// Broker error type.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Socket-level failure (reset, broken pipe, bind failure).
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed or oversized control packet.
    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    /// Direct addressing named an identity with no active session.
    #[error("No active session for client: {0}")]
    UnknownClient(String),
}

impl BrokerError {
    /// Whether this error should tear down the session it occurred on.
    ///
    /// Transport and protocol failures are fatal to the originating
    /// session; [`BrokerError::UnknownClient`] only fails the single
    /// direct-addressing call that raised it.
    #[must_use]
    pub const fn is_fatal_to_session(&self) -> bool {
        !matches!(self, BrokerError::UnknownClient(_))
    }
}
