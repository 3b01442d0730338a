//! Injected capability interface for external collaborators.
//!
//! The broker never validates identities or persists messages itself;
//! both concerns are delegated through this seam. A hook set is passed
//! to the broker at construction and shared by every session.

use async_trait::async_trait;
use relay_protocol::RETURN_CODE_IDENTIFIER_REJECTED;
use serde_json::Value;

/// Outcome of an authorization check for a CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// The client may connect. `metadata` is opaque to the broker and
    /// is handed back to [`BrokerHooks::client_connected`].
    Accept {
        /// Collaborator-defined metadata (e.g. the device record that
        /// matched the presented token).
        metadata: Value,
    },
    /// The client may not connect; `return_code` is sent in the
    /// negative CONNACK before the connection is closed.
    Reject {
        /// CONNACK return code, conventionally 2 (identifier rejected).
        return_code: u8,
    },
}

impl AuthDecision {
    /// Accept with no metadata.
    #[must_use]
    pub const fn accept() -> Self {
        Self::Accept {
            metadata: Value::Null,
        }
    }

    /// Reject with the standard identifier-rejected return code.
    #[must_use]
    pub const fn reject() -> Self {
        Self::Reject {
            return_code: RETURN_CODE_IDENTIFIER_REJECTED,
        }
    }
}

/// External collaborator contract.
///
/// In the deployed system the implementation verifies device tokens
/// against the management database, tracks online/offline status, and
/// persists telemetry - none of which the broker core knows about.
#[async_trait]
pub trait BrokerHooks: Send + Sync + 'static {
    /// Decide whether a CONNECT with this client identifier is allowed.
    async fn authorize(&self, client_id: &str) -> AuthDecision;

    /// A session reached the Active state. `metadata` is whatever
    /// [`BrokerHooks::authorize`] returned for it.
    async fn client_connected(&self, client_id: &str, metadata: &Value) {
        let _ = (client_id, metadata);
    }

    /// A session was fully cleaned up.
    async fn client_disconnected(&self, client_id: &str) {
        let _ = client_id;
    }

    /// A PUBLISH was accepted and fanned out. Fire-and-forget: invoked
    /// from a detached task, after delivery, and never reported to the
    /// publisher.
    async fn message_published(&self, client_id: &str, topic: &str, payload: &[u8]) {
        let _ = (client_id, topic, payload);
    }
}

/// Hook set that accepts every client and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllHooks;

#[async_trait]
impl BrokerHooks for AcceptAllHooks {
    async fn authorize(&self, _client_id: &str) -> AuthDecision {
        AuthDecision::accept()
    }
}
