//! Serialized writes to one connection's outbound byte stream.
//!
//! Both a session's own replies and other sessions' fan-out deliveries
//! target the same connection concurrently. Unsynchronized interleaving
//! would corrupt the peer's byte stream, so every write goes through
//! this writer's lock; no component outside it ever touches the raw
//! write half.

use crate::errors::BrokerError;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tracing::debug;

/// Exclusive owner of one connection's write half.
pub struct ConnectionWriter {
    connection_id: String,
    inner: Mutex<OwnedWriteHalf>,
}

impl ConnectionWriter {
    /// Wrap a connection's write half.
    #[must_use]
    pub fn new(connection_id: String, write_half: OwnedWriteHalf) -> Self {
        Self {
            connection_id,
            inner: Mutex::new(write_half),
        }
    }

    /// Get the connection ID this writer belongs to.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Write one encoded frame, holding the write lock for the whole
    /// frame so concurrent senders cannot interleave partial frames.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Transport`] if the peer has gone away.
    pub async fn send(&self, frame: Bytes) -> Result<(), BrokerError> {
        let mut writer = self.inner.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Half-close the connection so the peer's read loop observes EOF.
    ///
    /// Errors are ignored: shutdown is only ever called on connections
    /// that are already being torn down.
    pub async fn shutdown(&self) {
        let mut writer = self.inner.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(
                target: "relay.writer",
                connection_id = %self.connection_id,
                error = %e,
                "Shutdown of write half failed"
            );
        }
    }
}

impl std::fmt::Debug for ConnectionWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionWriter")
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}
