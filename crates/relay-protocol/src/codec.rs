//! Codec for encoding and decoding control packets.
//!
//! A frame on the wire is a two-byte fixed header followed by the
//! packet body: byte 0 carries the packet type in its high nibble and
//! flags in its low nibble, byte 1 is the remaining length (0-255,
//! single byte). Decoding is fail-closed: truncated input, a declared
//! length that disagrees with the frame, a reserved type nibble, or a
//! malformed field grammar each yield an error.

use crate::packet::{
    ConnAck, Connect, ControlPacket, PacketType, Publish, SubAck, Subscribe, MAX_REMAINING_LENGTH,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Fixed header byte for CONNECT.
const HEADER_CONNECT: u8 = 0x10;
/// Fixed header byte for CONNACK.
const HEADER_CONNACK: u8 = 0x20;
/// Fixed header byte for a QoS 0 PUBLISH.
const HEADER_PUBLISH: u8 = 0x30;
/// Fixed header byte for SUBSCRIBE (reserved flags 0b0010).
const HEADER_SUBSCRIBE: u8 = 0x82;
/// Fixed header byte for SUBACK.
const HEADER_SUBACK: u8 = 0x90;
/// Fixed header byte for PINGREQ.
const HEADER_PINGREQ: u8 = 0xC0;
/// Fixed header byte for PINGRESP.
const HEADER_PINGRESP: u8 = 0xD0;
/// Fixed header byte for DISCONNECT.
const HEADER_DISCONNECT: u8 = 0xE0;

/// Error type for codec operations
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    /// Insufficient data to decode
    #[error("Insufficient data")]
    InsufficientData,

    /// Declared remaining length disagrees with the frame
    #[error("Length mismatch: declared {declared} bytes, frame has {actual}")]
    LengthMismatch {
        /// Remaining length from the fixed header.
        declared: usize,
        /// Bytes actually present after the fixed header.
        actual: usize,
    },

    /// Reserved or invalid packet type nibble
    #[error("Invalid packet type nibble: {0}")]
    InvalidPacketType(u8),

    /// A string field is not valid UTF-8
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    /// Bytes left over after the packet grammar was consumed
    #[error("Trailing bytes after packet body: {count}")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        count: usize,
    },

    /// Body exceeds the single-byte remaining length
    #[error("Body too large for single-byte remaining length: {len} bytes (max {MAX_REMAINING_LENGTH})")]
    BodyTooLarge {
        /// Body size that was requested.
        len: usize,
    },

    /// Packet kind has no wire encoding
    #[error("Packet type {0:?} is not encodable")]
    NotEncodable(PacketType),
}

/// Extract one complete frame from a read buffer.
///
/// Returns `None` until the buffer holds the full fixed header and the
/// declared body; the returned frame is exactly `2 + remaining_length`
/// bytes and is removed from the buffer.
#[must_use]
pub fn extract_frame(buf: &mut BytesMut) -> Option<Bytes> {
    let declared = usize::from(*buf.get(1)?);
    let frame_len = 2 + declared;
    if buf.len() < frame_len {
        return None;
    }
    Some(buf.split_to(frame_len).freeze())
}

/// Decode a single complete frame into a control packet.
///
/// The input must be exactly one frame as produced by
/// [`extract_frame`]; any disagreement between the declared remaining
/// length and the actual frame size is an error.
///
/// # Errors
///
/// Returns a [`CodecError`] on truncated input, length mismatch, a
/// reserved type nibble, invalid UTF-8 in a string field, or bytes
/// left over after the packet grammar.
pub fn decode_packet(frame: &[u8]) -> Result<ControlPacket, CodecError> {
    let mut buf = frame;
    if buf.remaining() < 2 {
        return Err(CodecError::InsufficientData);
    }

    let first_byte = buf.get_u8();
    let declared = usize::from(buf.get_u8());
    if buf.remaining() != declared {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: buf.remaining(),
        });
    }

    let nibble = first_byte >> 4;
    let packet_type =
        PacketType::from_nibble(nibble).ok_or(CodecError::InvalidPacketType(nibble))?;

    match packet_type {
        PacketType::Connect => decode_connect(&mut buf),
        PacketType::ConnAck => decode_connack(&mut buf),
        PacketType::Publish => decode_publish(&mut buf),
        PacketType::Subscribe => decode_subscribe(&mut buf),
        PacketType::SubAck => decode_suback(&mut buf),
        PacketType::PingReq => empty_body(&buf, ControlPacket::PingReq),
        PacketType::PingResp => empty_body(&buf, ControlPacket::PingResp),
        PacketType::Disconnect => empty_body(&buf, ControlPacket::Disconnect),
        // Well-formed but unsupported by the broker; the body is
        // accepted verbatim and the session decides what to do.
        PacketType::PubAck
        | PacketType::PubRec
        | PacketType::PubRel
        | PacketType::PubComp
        | PacketType::Unsubscribe
        | PacketType::UnsubAck => Ok(ControlPacket::Unknown { packet_type }),
    }
}

/// Encode a control packet to its wire frame.
///
/// # Errors
///
/// Returns [`CodecError::BodyTooLarge`] if the body exceeds the
/// single-byte remaining length (255 bytes) and
/// [`CodecError::NotEncodable`] for [`ControlPacket::Unknown`].
/// Oversized packets are rejected, never truncated.
pub fn encode_packet(packet: &ControlPacket) -> Result<Bytes, CodecError> {
    let (header, body) = match packet {
        ControlPacket::Connect(connect) => (HEADER_CONNECT, encode_connect(connect)?),
        ControlPacket::ConnAck(connack) => {
            let mut body = BytesMut::with_capacity(2);
            body.put_u8(0x00);
            body.put_u8(connack.return_code);
            (HEADER_CONNACK, body)
        }
        ControlPacket::Publish(publish) => (HEADER_PUBLISH, encode_publish(publish)?),
        ControlPacket::Subscribe(subscribe) => (HEADER_SUBSCRIBE, encode_subscribe(subscribe)?),
        ControlPacket::SubAck(suback) => {
            let mut body = BytesMut::with_capacity(2 + usize::from(suback.granted));
            body.put_u16(suback.packet_id);
            body.put_bytes(0x00, usize::from(suback.granted));
            (HEADER_SUBACK, body)
        }
        ControlPacket::PingReq => (HEADER_PINGREQ, BytesMut::new()),
        ControlPacket::PingResp => (HEADER_PINGRESP, BytesMut::new()),
        ControlPacket::Disconnect => (HEADER_DISCONNECT, BytesMut::new()),
        ControlPacket::Unknown { packet_type } => {
            return Err(CodecError::NotEncodable(*packet_type));
        }
    };

    let remaining = u8::try_from(body.len()).map_err(|_| CodecError::BodyTooLarge {
        len: body.len(),
    })?;

    let mut frame = BytesMut::with_capacity(2 + body.len());
    frame.put_u8(header);
    frame.put_u8(remaining);
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

fn decode_connect(buf: &mut &[u8]) -> Result<ControlPacket, CodecError> {
    let protocol_name = get_string(buf)?;
    let protocol_level = get_u8(buf)?;
    let connect_flags = get_u8(buf)?;
    let keep_alive_seconds = get_u16(buf)?;
    let client_id = get_string(buf)?;
    expect_consumed(buf)?;

    Ok(ControlPacket::Connect(Connect {
        protocol_name,
        protocol_level,
        connect_flags,
        keep_alive_seconds,
        client_id,
    }))
}

fn decode_connack(buf: &mut &[u8]) -> Result<ControlPacket, CodecError> {
    // Byte 0 is reserved (session-present in MQTT 3.1.1); the value is
    // not interpreted.
    let _reserved = get_u8(buf)?;
    let return_code = get_u8(buf)?;
    expect_consumed(buf)?;
    Ok(ControlPacket::ConnAck(ConnAck { return_code }))
}

fn decode_publish(buf: &mut &[u8]) -> Result<ControlPacket, CodecError> {
    let topic = get_string(buf)?;
    // Everything after the topic is the payload, no further framing.
    let payload = Bytes::copy_from_slice(buf);
    buf.advance(buf.remaining());
    Ok(ControlPacket::Publish(Publish { topic, payload }))
}

fn decode_subscribe(buf: &mut &[u8]) -> Result<ControlPacket, CodecError> {
    let packet_id = get_u16(buf)?;
    let mut filters = Vec::new();
    while buf.has_remaining() {
        let topic = get_string(buf)?;
        let qos = get_u8(buf)?;
        filters.push((topic, qos));
    }
    Ok(ControlPacket::Subscribe(Subscribe { packet_id, filters }))
}

fn decode_suback(buf: &mut &[u8]) -> Result<ControlPacket, CodecError> {
    let packet_id = get_u16(buf)?;
    // One granted-QoS byte per acknowledged filter; the broker only
    // ever grants QoS 0, so the values are not interpreted.
    let granted = u8::try_from(buf.remaining()).map_err(|_| CodecError::TrailingBytes {
        count: buf.remaining(),
    })?;
    buf.advance(buf.remaining());
    Ok(ControlPacket::SubAck(SubAck { packet_id, granted }))
}

fn empty_body(buf: &[u8], packet: ControlPacket) -> Result<ControlPacket, CodecError> {
    expect_consumed(buf)?;
    Ok(packet)
}

fn encode_connect(connect: &Connect) -> Result<BytesMut, CodecError> {
    let mut body = BytesMut::new();
    put_string(&mut body, &connect.protocol_name)?;
    body.put_u8(connect.protocol_level);
    body.put_u8(connect.connect_flags);
    body.put_u16(connect.keep_alive_seconds);
    put_string(&mut body, &connect.client_id)?;
    Ok(body)
}

fn encode_publish(publish: &Publish) -> Result<BytesMut, CodecError> {
    let mut body = BytesMut::with_capacity(2 + publish.topic.len() + publish.payload.len());
    put_string(&mut body, &publish.topic)?;
    body.extend_from_slice(&publish.payload);
    Ok(body)
}

fn encode_subscribe(subscribe: &Subscribe) -> Result<BytesMut, CodecError> {
    let mut body = BytesMut::new();
    body.put_u16(subscribe.packet_id);
    for (topic, qos) in &subscribe.filters {
        put_string(&mut body, topic)?;
        body.put_u8(*qos);
    }
    Ok(body)
}

fn expect_consumed(buf: &[u8]) -> Result<(), CodecError> {
    if buf.has_remaining() {
        return Err(CodecError::TrailingBytes {
            count: buf.remaining(),
        });
    }
    Ok(())
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::InsufficientData);
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> Result<u16, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::InsufficientData);
    }
    Ok(buf.get_u16())
}

fn get_string(buf: &mut &[u8]) -> Result<String, CodecError> {
    let len = usize::from(get_u16(buf)?);
    if buf.remaining() < len {
        return Err(CodecError::InsufficientData);
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)
}

fn put_string(body: &mut BytesMut, value: &str) -> Result<(), CodecError> {
    // A single field longer than the maximum body can never fit, and
    // guarding here keeps the u16 length prefix exact.
    let len = u16::try_from(value.len()).map_err(|_| CodecError::BodyTooLarge {
        len: value.len(),
    })?;
    body.put_u16(len);
    body.extend_from_slice(value.as_bytes());
    Ok(())
}
