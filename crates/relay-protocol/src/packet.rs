//! Control packet types.

use bytes::Bytes;

/// Maximum body size expressible by the single-byte remaining length.
///
/// The fixed header carries the remaining length in one byte, so a
/// packet body can never exceed 255 bytes. Oversized bodies are
/// rejected at encode time, never truncated.
pub const MAX_REMAINING_LENGTH: usize = 255;

/// CONNACK return code: connection accepted.
pub const RETURN_CODE_ACCEPTED: u8 = 0x00;

/// CONNACK return code: client identifier rejected.
pub const RETURN_CODE_IDENTIFIER_REJECTED: u8 = 0x02;

/// Control packet type, taken from the high nibble of the first header
/// byte (MQTT 3.1.1 numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Client request to connect
    Connect = 1,
    /// Connect acknowledgment
    ConnAck = 2,
    /// Publish a message to a topic
    Publish = 3,
    /// QoS 1 publish acknowledgment (not processed by the broker)
    PubAck = 4,
    /// QoS 2 publish received (not processed by the broker)
    PubRec = 5,
    /// QoS 2 publish release (not processed by the broker)
    PubRel = 6,
    /// QoS 2 publish complete (not processed by the broker)
    PubComp = 7,
    /// Subscribe to topic filters
    Subscribe = 8,
    /// Subscribe acknowledgment
    SubAck = 9,
    /// Unsubscribe from topic filters (not processed by the broker)
    Unsubscribe = 10,
    /// Unsubscribe acknowledgment (not processed by the broker)
    UnsubAck = 11,
    /// Keep-alive request
    PingReq = 12,
    /// Keep-alive response
    PingResp = 13,
    /// Clean disconnect
    Disconnect = 14,
}

impl PacketType {
    /// Map a type nibble to a packet type.
    ///
    /// Nibbles 0 and 15 are reserved in MQTT 3.1.1 and have no mapping.
    #[must_use]
    pub const fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            1 => Some(Self::Connect),
            2 => Some(Self::ConnAck),
            3 => Some(Self::Publish),
            4 => Some(Self::PubAck),
            5 => Some(Self::PubRec),
            6 => Some(Self::PubRel),
            7 => Some(Self::PubComp),
            8 => Some(Self::Subscribe),
            9 => Some(Self::SubAck),
            10 => Some(Self::Unsubscribe),
            11 => Some(Self::UnsubAck),
            12 => Some(Self::PingReq),
            13 => Some(Self::PingResp),
            14 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

/// CONNECT packet body.
///
/// Body layout:
/// - Protocol name: 2-byte length prefix + bytes
/// - Protocol level: 1 byte
/// - Connect flags: 1 byte
/// - Keep-alive: 2 bytes big-endian, seconds
/// - Client identifier: 2-byte length prefix + bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Protocol name, "MQTT" for conforming clients.
    pub protocol_name: String,
    /// Protocol level, 4 for MQTT 3.1.1.
    pub protocol_level: u8,
    /// Connect flags byte. Carried verbatim; the broker does not act
    /// on clean-session or will flags.
    pub connect_flags: u8,
    /// Keep-alive interval in seconds. Carried verbatim; the broker
    /// does not enforce keep-alive timeouts.
    pub keep_alive_seconds: u16,
    /// Client identifier presented for authorization.
    pub client_id: String,
}

/// CONNACK packet body: one reserved byte (0x00) and a return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    /// Return code: 0 = accepted, 2 = identifier rejected.
    pub return_code: u8,
}

impl ConnAck {
    /// A successful connection acknowledgment.
    #[must_use]
    pub const fn accepted() -> Self {
        Self {
            return_code: RETURN_CODE_ACCEPTED,
        }
    }

    /// A rejection for an invalid or colliding client identifier.
    #[must_use]
    pub const fn identifier_rejected() -> Self {
        Self {
            return_code: RETURN_CODE_IDENTIFIER_REJECTED,
        }
    }
}

/// PUBLISH packet body: length-prefixed topic name, then the raw
/// payload with no further framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Topic name, an opaque exact-match string.
    pub topic: String,
    /// Application payload.
    pub payload: Bytes,
}

/// SUBSCRIBE packet body: a packet identifier followed by one or more
/// `{length-prefixed topic filter, QoS byte}` entries filling the rest
/// of the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    /// Packet identifier echoed back in the SUBACK.
    pub packet_id: u16,
    /// Requested `(topic, qos)` filters, in order.
    pub filters: Vec<(String, u8)>,
}

/// SUBACK packet body: the original packet identifier and one 0x00
/// granted-QoS byte per acknowledged filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubAck {
    /// Packet identifier from the SUBSCRIBE being acknowledged.
    pub packet_id: u16,
    /// Number of acknowledged filters.
    pub granted: u8,
}

/// A decoded control packet. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    /// Client connection request.
    Connect(Connect),
    /// Connection acknowledgment.
    ConnAck(ConnAck),
    /// Message publication.
    Publish(Publish),
    /// Subscription request.
    Subscribe(Subscribe),
    /// Subscription acknowledgment.
    SubAck(SubAck),
    /// Keep-alive request.
    PingReq,
    /// Keep-alive response.
    PingResp,
    /// Clean disconnect.
    Disconnect,
    /// A well-formed packet of a type the broker does not process
    /// (PUBACK, PUBREC, PUBREL, PUBCOMP, UNSUBSCRIBE, UNSUBACK).
    /// Logged and ignored by the session.
    Unknown {
        /// The packet type that was received.
        packet_type: PacketType,
    },
}

impl ControlPacket {
    /// The wire type of this packet, if it has one. `Unknown` reports
    /// the type it was decoded from.
    #[must_use]
    pub const fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnAck(_) => PacketType::ConnAck,
            Self::Publish(_) => PacketType::Publish,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::SubAck(_) => PacketType::SubAck,
            Self::PingReq => PacketType::PingReq,
            Self::PingResp => PacketType::PingResp,
            Self::Disconnect => PacketType::Disconnect,
            Self::Unknown { packet_type } => *packet_type,
        }
    }
}
