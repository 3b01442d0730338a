//! Wire protocol for the Relay message broker.
//!
//! This crate implements the binary control packet format the broker
//! speaks over TCP: a two-byte fixed header (type nibble + single-byte
//! remaining length) followed by a packet-specific body. The format is
//! modeled on MQTT 3.1.1 but deliberately minimal: QoS 0 only, no
//! retained messages, no wildcard filters.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod packet;

pub use codec::{decode_packet, encode_packet, extract_frame, CodecError};
pub use packet::{
    ConnAck, Connect, ControlPacket, PacketType, Publish, SubAck, Subscribe, MAX_REMAINING_LENGTH,
    RETURN_CODE_ACCEPTED, RETURN_CODE_IDENTIFIER_REJECTED,
};
