//! Relay Broker Library
//!
//! This library provides the core of Relay - a minimal publish/subscribe
//! message broker speaking an MQTT-modeled binary protocol over TCP:
//!
//! - Per-connection session state machines with strict in-order packet
//!   processing
//! - Exact-match topic routing with snapshot-based fan-out
//! - Client identity registry for direct addressing
//! - Injected hook seam for authorization and publish side effects
//!
//! # Architecture
//!
//! One tokio task per connection, shared state behind async mutexes:
//!
//! ```text
//! Broker (accept loop, owns the listener)
//! ├── spawns N Sessions (one per TCP connection)
//! │   └── Session read loop: decode -> dispatch -> fan out
//! └── SharedState
//!     ├── SubscriptionTable (topic <-> subscriber identities)
//!     ├── SessionRegistry   (identity -> connection writer)
//!     └── BrokerHooks       (authorization, lifecycle, side effects)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Writer ownership**: each connection's outbound stream is owned by
//!   exactly one [`writer::ConnectionWriter`]; replies and fan-out
//!   deliveries from other sessions serialize through its lock
//! - **Snapshot fan-out**: the subscription table lock is released
//!   before any network write; deliveries use a snapshot of the
//!   subscriber set
//! - **Identity collision**: a CONNECT for an already-active identity is
//!   rejected with CONNACK return code 2; the active session is untouched
//! - **At-most-once delivery**: no acknowledgment, retry, or persistence
//!
//! # Modules
//!
//! - [`broker`] - listener, accept loop, management surface
//! - [`session`] - per-connection state machine and read loop
//! - [`topics`] - subscription table and routing snapshots
//! - [`registry`] - client identity to writer map
//! - [`writer`] - serialized per-connection writes
//! - [`hooks`] - injected capability interface
//! - [`config`] - service configuration from environment
//! - [`errors`] - error types

pub mod broker;
pub mod config;
pub mod errors;
pub mod hooks;
pub mod registry;
pub mod session;
pub mod topics;
pub mod writer;

pub use broker::{Broker, BrokerHandle};
pub use config::Config;
pub use errors::BrokerError;
pub use hooks::{AcceptAllHooks, AuthDecision, BrokerHooks};
