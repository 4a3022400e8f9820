//! Packet framing for the local IPC socket.
//!
//! Each packet is a 4-byte little-endian opcode, a 4-byte little-endian
//! payload length, and a JSON payload. Little-endian framing is what the
//! presence service expects on its pipe.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Maximum packet payload size (64 KiB).
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Header size in bytes (opcode + length).
pub const HEADER_SIZE: usize = 8;

/// Packet opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    Handshake = 0,
    Frame = 1,
    Close = 2,
    Ping = 3,
    Pong = 4,
}

impl TryFrom<u32> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Opcode::Handshake),
            1 => Ok(Opcode::Frame),
            2 => Ok(Opcode::Close),
            3 => Ok(Opcode::Ping),
            4 => Ok(Opcode::Pong),
            other => Err(ProtocolError::InvalidOpcode(other)),
        }
    }
}

/// A framed IPC packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Packet opcode.
    pub opcode: Opcode,
    /// JSON payload.
    pub payload: serde_json::Value,
}

impl Packet {
    /// Create a new packet.
    #[must_use]
    pub fn new(opcode: Opcode, payload: serde_json::Value) -> Self {
        Self { opcode, payload }
    }
}

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Packet exceeds maximum size.
    #[error("Packet size {0} exceeds maximum {MAX_PACKET_SIZE}")]
    PacketTooLarge(usize),

    /// Not enough data to decode a packet.
    #[error("Incomplete packet: need {0} more bytes")]
    Incomplete(usize),

    /// Unknown opcode on the wire.
    #[error("Invalid opcode: {0}")]
    InvalidOpcode(u32),

    /// JSON encoding/decoding error.
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Encode a packet to bytes.
///
/// # Errors
///
/// Returns an error if the payload is too large or serialization fails.
pub fn encode(packet: &Packet) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(packet, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a packet into an existing buffer.
///
/// # Errors
///
/// Returns an error if the payload is too large or serialization fails.
pub fn encode_into(packet: &Packet, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = serde_json::to_vec(&packet.payload)?;

    if payload.len() > MAX_PACKET_SIZE {
        return Err(ProtocolError::PacketTooLarge(payload.len()));
    }

    buf.reserve(HEADER_SIZE + payload.len());
    buf.put_u32_le(packet.opcode as u32);
    buf.put_u32_le(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a packet from a complete byte slice.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Packet, ProtocolError> {
    let mut buf = BytesMut::from(data);
    let needed = HEADER_SIZE.saturating_sub(data.len());
    decode_from(&mut buf)?.ok_or(ProtocolError::Incomplete(needed.max(1)))
}

/// Try to decode a packet from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(packet))` if a complete packet was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the packet is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let opcode = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let length = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;

    if length > MAX_PACKET_SIZE {
        return Err(ProtocolError::PacketTooLarge(length));
    }

    if buf.len() < HEADER_SIZE + length {
        return Ok(None);
    }

    let opcode = Opcode::try_from(opcode)?;
    buf.advance(HEADER_SIZE);
    let payload = buf.split_to(length);
    let payload = serde_json::from_slice(&payload)?;

    Ok(Some(Packet { opcode, payload }))
}
