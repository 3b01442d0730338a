//! Per-connection session actor.
//!
//! Each accepted connection runs one `Session` in its own task. The
//! session owns the read half of the socket, parses frames out of its
//! read buffer, and drives a small state machine:
//!
//! ```text
//! Created --CONNECT accepted--> Active --DISCONNECT/EOF/error--> Closing --> Closed
//!    |                                                              ^
//!    +--CONNECT rejected / protocol violation ---------------------+
//! ```
//!
//! Cleanup runs exactly once, on the way out of [`Session::run`]:
//! subscriptions are dropped, the identity is released, and the
//! disconnect hook fires if the session ever reached Active.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_protocol::{decode_packet, encode_packet, extract_frame, ConnAck, ControlPacket, SubAck};

use crate::broker::SharedState;
use crate::errors::BrokerError;
use crate::hooks::AuthDecision;
use crate::registry::SessionHandle;
use crate::writer::ConnectionWriter;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Connection accepted, no CONNECT seen yet.
    Created,
    /// CONNECT received, authorization hook in flight.
    Authenticating,
    /// Registered and routable.
    Active,
    /// Teardown started, no further packets are processed.
    Closing,
    /// Cleanup finished.
    Closed,
}

/// What the dispatcher wants the read loop to do next.
enum Flow {
    Continue,
    Close,
}

/// One connection's state machine and read loop.
pub struct Session {
    connection_id: String,
    remote_addr: SocketAddr,
    state: SessionState,
    /// Set on the Created -> Active transition, never changed after.
    client_id: Option<String>,
    reader: OwnedReadHalf,
    writer: Arc<ConnectionWriter>,
    shared: Arc<SharedState>,
    cancel: CancellationToken,
    read_buffer_bytes: usize,
}

impl Session {
    pub fn new(
        connection_id: String,
        remote_addr: SocketAddr,
        reader: OwnedReadHalf,
        writer: Arc<ConnectionWriter>,
        shared: Arc<SharedState>,
        cancel: CancellationToken,
        read_buffer_bytes: usize,
    ) -> Self {
        Self {
            connection_id,
            remote_addr,
            state: SessionState::Created,
            client_id: None,
            reader,
            writer,
            shared,
            cancel,
            read_buffer_bytes,
        }
    }

    /// Drive the session until disconnect, error, or shutdown, then
    /// clean up.
    pub async fn run(mut self) {
        info!(
            target: "relay.session",
            connection_id = %self.connection_id,
            remote_addr = %self.remote_addr,
            "Session started"
        );

        if let Err(error) = self.read_loop().await {
            if error.is_fatal_to_session() {
                warn!(
                    target: "relay.session",
                    connection_id = %self.connection_id,
                    client_id = ?self.client_id,
                    error = %error,
                    "Session terminated by error"
                );
            }
        }

        self.cleanup().await;
    }

    async fn read_loop(&mut self) -> Result<(), BrokerError> {
        let mut buffer = BytesMut::with_capacity(self.read_buffer_bytes);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!(
                        target: "relay.session",
                        connection_id = %self.connection_id,
                        "Shutdown requested, closing session"
                    );
                    return Ok(());
                }
                read = self.reader.read_buf(&mut buffer) => {
                    let bytes_read = read?;
                    if bytes_read == 0 {
                        debug!(
                            target: "relay.session",
                            connection_id = %self.connection_id,
                            "Peer closed the connection"
                        );
                        return Ok(());
                    }

                    while let Some(frame) = extract_frame(&mut buffer) {
                        match self.dispatch_frame(&frame).await? {
                            Flow::Continue => {}
                            Flow::Close => return Ok(()),
                        }
                    }
                }
            }
        }
    }

    async fn dispatch_frame(&mut self, frame: &Bytes) -> Result<Flow, BrokerError> {
        let packet = match decode_packet(frame) {
            Ok(packet) => packet,
            Err(error) => {
                warn!(
                    target: "relay.session",
                    connection_id = %self.connection_id,
                    client_id = ?self.client_id,
                    error = %error,
                    "Undecodable frame, closing session"
                );
                return Ok(Flow::Close);
            }
        };

        match (self.state, packet) {
            (SessionState::Created, ControlPacket::Connect(connect)) => {
                self.handle_connect(connect.client_id).await
            }
            (SessionState::Active, ControlPacket::Publish(publish)) => {
                self.handle_publish(publish.topic, &publish.payload).await
            }
            (SessionState::Active, ControlPacket::Subscribe(subscribe)) => {
                self.handle_subscribe(subscribe.packet_id, subscribe.filters)
                    .await
            }
            (SessionState::Active, ControlPacket::PingReq) => {
                self.send(&ControlPacket::PingResp).await?;
                Ok(Flow::Continue)
            }
            (_, ControlPacket::Disconnect) => {
                debug!(
                    target: "relay.session",
                    connection_id = %self.connection_id,
                    client_id = ?self.client_id,
                    "Disconnect received"
                );
                Ok(Flow::Close)
            }
            (_, ControlPacket::Unknown { packet_type }) => {
                debug!(
                    target: "relay.session",
                    connection_id = %self.connection_id,
                    packet_type = ?packet_type,
                    "Ignoring unsupported packet type"
                );
                Ok(Flow::Continue)
            }
            // Server-to-client packets arriving inbound carry no
            // meaning here.
            (
                _,
                ControlPacket::ConnAck(_) | ControlPacket::SubAck(_) | ControlPacket::PingResp,
            ) => {
                debug!(
                    target: "relay.session",
                    connection_id = %self.connection_id,
                    "Ignoring server-side packet from client"
                );
                Ok(Flow::Continue)
            }
            (state, packet) => {
                warn!(
                    target: "relay.session",
                    connection_id = %self.connection_id,
                    client_id = ?self.client_id,
                    state = ?state,
                    packet_type = ?packet.packet_type(),
                    "Packet not valid in this state, closing session"
                );
                Ok(Flow::Close)
            }
        }
    }

    async fn handle_connect(&mut self, client_id: String) -> Result<Flow, BrokerError> {
        self.state = SessionState::Authenticating;

        let decision = self.shared.hooks.authorize(&client_id).await;
        let metadata = match decision {
            AuthDecision::Accept { metadata } => metadata,
            AuthDecision::Reject { return_code } => {
                info!(
                    target: "relay.session",
                    connection_id = %self.connection_id,
                    client_id = %client_id,
                    return_code,
                    "Connection refused by authorization hook"
                );
                self.send(&ControlPacket::ConnAck(ConnAck { return_code }))
                    .await?;
                return Ok(Flow::Close);
            }
        };

        let handle = SessionHandle {
            connection_id: self.connection_id.clone(),
            writer: Arc::clone(&self.writer),
        };
        if !self.shared.registry.try_insert(&client_id, handle).await {
            info!(
                target: "relay.session",
                connection_id = %self.connection_id,
                client_id = %client_id,
                "Identity already connected, refusing"
            );
            self.send(&ControlPacket::ConnAck(ConnAck::identifier_rejected()))
                .await?;
            return Ok(Flow::Close);
        }

        self.client_id = Some(client_id.clone());
        self.state = SessionState::Active;
        self.send(&ControlPacket::ConnAck(ConnAck::accepted()))
            .await?;

        info!(
            target: "relay.session",
            connection_id = %self.connection_id,
            client_id = %client_id,
            "Client connected"
        );
        self.shared.hooks.client_connected(&client_id, &metadata).await;

        Ok(Flow::Continue)
    }

    async fn handle_publish(&mut self, topic: String, payload: &[u8]) -> Result<Flow, BrokerError> {
        let Some(client_id) = self.client_id.clone() else {
            return Ok(Flow::Close);
        };

        let delivered = self
            .shared
            .fan_out(Some(&client_id), &topic, payload)
            .await?;
        debug!(
            target: "relay.session",
            client_id = %client_id,
            topic = %topic,
            payload_len = payload.len(),
            delivered,
            "Publish routed"
        );

        // Fire and forget: a slow side effect must not stall this
        // session's read loop.
        let hooks = Arc::clone(&self.shared.hooks);
        let payload = payload.to_vec();
        tokio::spawn(async move {
            hooks.message_published(&client_id, &topic, &payload).await;
        });

        Ok(Flow::Continue)
    }

    async fn handle_subscribe(
        &mut self,
        packet_id: u16,
        filters: Vec<(String, u8)>,
    ) -> Result<Flow, BrokerError> {
        let Some(client_id) = self.client_id.clone() else {
            return Ok(Flow::Close);
        };

        if filters.is_empty() {
            debug!(
                target: "relay.session",
                client_id = %client_id,
                "Subscribe carried no topic filters, nothing to acknowledge"
            );
            return Ok(Flow::Continue);
        }

        for (topic, _requested_qos) in &filters {
            self.shared.topics.subscribe(&client_id, topic).await;
            debug!(
                target: "relay.session",
                client_id = %client_id,
                topic = %topic,
                "Subscribed"
            );
        }

        // One granted-QoS byte per filter. The count is bounded well
        // below 256 by the frame size limit.
        let granted = u8::try_from(filters.len()).unwrap_or(u8::MAX);
        self.send(&ControlPacket::SubAck(SubAck { packet_id, granted }))
            .await?;

        Ok(Flow::Continue)
    }

    async fn send(&self, packet: &ControlPacket) -> Result<(), BrokerError> {
        let frame = encode_packet(packet)?;
        self.writer.send(frame).await
    }

    /// Tear down the session. Safe against partial setup: sessions that
    /// never reached Active have nothing registered to remove.
    async fn cleanup(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closing;

        if let Some(client_id) = self.client_id.take() {
            self.shared.topics.remove_session(&client_id).await;
            let removed = self
                .shared
                .registry
                .remove(&client_id, &self.connection_id)
                .await;
            if removed {
                self.shared.hooks.client_disconnected(&client_id).await;
            }
            info!(
                target: "relay.session",
                connection_id = %self.connection_id,
                client_id = %client_id,
                "Client disconnected"
            );
        }

        self.writer.shutdown().await;
        self.state = SessionState::Closed;

        debug!(
            target: "relay.session",
            connection_id = %self.connection_id,
            "Session closed"
        );
    }
}
