//! Broker listener, shared state, and fan-out.
//!
//! `Broker::bind` claims the TCP listener up front so configuration
//! problems surface before anything is spawned. `Broker::spawn` then
//! starts the accept loop and returns a [`BrokerHandle`] the embedding
//! application uses to publish, inspect state, and shut down.
//!
//! Fan-out is snapshot based: the subscriber set is copied under the
//! subscription lock, the lock is released, and delivery walks the
//! snapshot. A subscriber that disconnects mid-delivery is skipped or
//! logged and skipped; one slow or dead subscriber never poisons the
//! rest of the batch.

use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use relay_protocol::{encode_packet, ControlPacket, Publish};

use crate::config::Config;
use crate::errors::BrokerError;
use crate::hooks::BrokerHooks;
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::topics::SubscriptionTable;
use crate::writer::ConnectionWriter;

/// State shared by the accept loop, all sessions, and the handle.
pub struct SharedState {
    /// Topic -> subscriber routing.
    pub topics: SubscriptionTable,
    /// Client identity -> live session.
    pub registry: SessionRegistry,
    /// Collaborator callbacks.
    pub hooks: Arc<dyn BrokerHooks>,
}

impl SharedState {
    /// Deliver a payload to every subscriber of a topic, excluding
    /// `origin` if given. Returns the number of successful deliveries.
    ///
    /// The frame is encoded once and shared across all recipients.
    pub async fn fan_out(
        &self,
        origin: Option<&str>,
        topic: &str,
        payload: &[u8],
    ) -> Result<usize, BrokerError> {
        let frame = encode_packet(&ControlPacket::Publish(Publish {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
        }))?;

        let recipients = match origin {
            Some(origin) => self.topics.subscribers_excluding(topic, origin).await,
            None => self.topics.subscribers(topic).await,
        };
        if recipients.is_empty() {
            return Ok(0);
        }

        let writers = self.registry.writers_for(&recipients).await;
        let mut delivered = 0;
        for (client_id, writer) in writers {
            match writer.send(frame.clone()).await {
                Ok(()) => delivered += 1,
                Err(error) => {
                    warn!(
                        target: "relay.fanout",
                        client_id = %client_id,
                        connection_id = %writer.connection_id(),
                        topic = %topic,
                        error = %error,
                        "Delivery failed, shutting subscriber connection down"
                    );
                    writer.shutdown().await;
                }
            }
        }

        debug!(
            target: "relay.fanout",
            topic = %topic,
            recipients = recipients.len(),
            delivered,
            "Fan-out complete"
        );
        Ok(delivered)
    }

    /// Deliver a payload straight to one client, bypassing its
    /// subscriptions.
    pub async fn publish_to_client(
        &self,
        client_id: &str,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let frame = encode_packet(&ControlPacket::Publish(Publish {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
        }))?;

        let Some(handle) = self.registry.get(client_id).await else {
            return Err(BrokerError::UnknownClient(client_id.to_string()));
        };
        handle.writer.send(frame).await
    }
}

/// A bound broker, ready to spawn its accept loop.
pub struct Broker {
    config: Config,
    listener: TcpListener,
    shared: Arc<SharedState>,
    cancel: CancellationToken,
}

impl Broker {
    /// Bind the configured TCP address. Fails fast if the address is
    /// unavailable.
    pub async fn bind(config: Config, hooks: Arc<dyn BrokerHooks>) -> Result<Self, BrokerError> {
        let listener = TcpListener::bind(&config.bind_address).await?;
        info!(
            target: "relay.broker",
            broker_id = %config.broker_id,
            local_addr = %listener.local_addr()?,
            "Broker listening"
        );

        Ok(Self {
            config,
            listener,
            shared: Arc::new(SharedState {
                topics: SubscriptionTable::new(),
                registry: SessionRegistry::new(),
                hooks,
            }),
            cancel: CancellationToken::new(),
        })
    }

    /// Address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, BrokerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Start the accept loop. Returns a handle for control and the
    /// loop's join handle.
    #[must_use]
    pub fn spawn(self) -> (BrokerHandle, JoinHandle<()>) {
        let handle = BrokerHandle {
            shared: Arc::clone(&self.shared),
            cancel: self.cancel.clone(),
        };
        let join = tokio::spawn(self.accept_loop());
        (handle, join)
    }

    async fn accept_loop(self) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!(
                        target: "relay.broker",
                        broker_id = %self.config.broker_id,
                        "Broker stopping, no longer accepting connections"
                    );
                    return;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let connection_id = Uuid::new_v4().to_string();
                            debug!(
                                target: "relay.broker",
                                connection_id = %connection_id,
                                remote_addr = %remote_addr,
                                "Connection accepted"
                            );

                            let (reader, write_half) = stream.into_split();
                            let writer = Arc::new(ConnectionWriter::new(
                                connection_id.clone(),
                                write_half,
                            ));
                            let session = Session::new(
                                connection_id,
                                remote_addr,
                                reader,
                                writer,
                                Arc::clone(&self.shared),
                                self.cancel.child_token(),
                                self.config.read_buffer_bytes,
                            );
                            tokio::spawn(session.run());
                        }
                        Err(error) => {
                            warn!(
                                target: "relay.broker",
                                error = %error,
                                "Accept failed"
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Control surface for a running broker.
#[derive(Clone)]
pub struct BrokerHandle {
    shared: Arc<SharedState>,
    cancel: CancellationToken,
}

impl BrokerHandle {
    /// Stop accepting connections and signal every session to close.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Publish on behalf of the hosting application. Every subscriber
    /// of the topic receives the message; there is no origin to
    /// exclude. Returns the number of deliveries.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<usize, BrokerError> {
        self.shared.fan_out(None, topic, payload).await
    }

    /// Send a message directly to one connected client.
    pub async fn publish_to_client(
        &self,
        client_id: &str,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        self.shared.publish_to_client(client_id, topic, payload).await
    }

    /// Topics that currently have at least one subscriber.
    pub async fn list_topics(&self) -> Vec<String> {
        self.shared.topics.topics().await
    }

    /// Number of subscribers of a topic.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.shared.topics.subscriber_count(topic).await
    }

    /// Identities of all connected clients.
    pub async fn client_ids(&self) -> Vec<String> {
        self.shared.registry.client_ids().await
    }

    /// Whether a client identity is currently connected.
    pub async fn is_connected(&self, client_id: &str) -> bool {
        self.shared.registry.contains(client_id).await
    }
}
