//! Socket tunnel packet framing
//!
//! Two packet shapes share one data channel. Connection IDs start at 1, so a
//! leading zero byte marks a control packet.
//!
//! ```text
//! Data packet:     ┌──────────────┬──────────────────────┐
//!                  │ conn id (1B) │ payload (N bytes)    │
//!                  └──────────────┴──────────────────────┘
//!
//! Control packet:  ┌──────┬─────────────┬──────────────┐
//!                  │ 0x00 │ opcode (1B) │ conn id (1B) │   exactly 3 bytes
//!                  └──────┴─────────────┴──────────────┘
//! ```
//!
//! There is no length field; the data channel preserves message boundaries.

use std::fmt;

// ============================================================================
// Constants
// ============================================================================

/// Connection ID marking a control packet
pub const CONTROL_CONNECTION_ID: u8 = 0;

/// Lowest assignable connection ID
pub const MIN_CONNECTION_ID: u8 = 1;

/// Maximum concurrently addressable connections per data channel
pub const MAX_CONNECTION_COUNT: usize = 64;

/// Highest assignable connection ID
pub const MAX_CONNECTION_ID: u8 = MIN_CONNECTION_ID + MAX_CONNECTION_COUNT as u8 - 1;

/// Size of every control packet
pub const CONTROL_PACKET_SIZE: usize = 3;

// ============================================================================
// Op Codes
// ============================================================================

/// Control packet operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Client → server: open a new logical connection
    ClientOpen = 0,
    /// Client → server: client has no more data for this connection
    ClientClose = 1,
    /// Server → client: local socket connected
    ServerOpenAck = 2,
    /// Server → client: server has no more data, or connect failed
    ServerClose = 3,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OpCode::ClientOpen),
            1 => Some(OpCode::ClientClose),
            2 => Some(OpCode::ServerOpenAck),
            3 => Some(OpCode::ServerClose),
            _ => None,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpCode::ClientOpen => write!(f, "CLIENT_OPEN"),
            OpCode::ClientClose => write!(f, "CLIENT_CLOSE"),
            OpCode::ServerOpenAck => write!(f, "SERVER_OPEN_ACK"),
            OpCode::ServerClose => write!(f, "SERVER_CLOSE"),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// A violation of the tunnel protocol. Always fatal to the data channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty packet")]
    EmptyPacket,
    #[error("control packet of {0} bytes (expected 3)")]
    InvalidControlPacketSize(usize),
    #[error("connection id {0} out of range")]
    InvalidConnectionId(u8),
    #[error("unknown opcode {0}")]
    UnknownOpCode(u8),
    #[error("unexpected {op} for connection {connection_id}")]
    UnexpectedControl { op: OpCode, connection_id: u8 },
    #[error("unexpected data for connection {0}")]
    UnexpectedData(u8),
}

// ============================================================================
// Packets
// ============================================================================

/// A decoded tunnel packet borrowing from the received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    Data { connection_id: u8, payload: &'a [u8] },
    Control { op: OpCode, connection_id: u8 },
}

pub fn is_valid_connection_id(connection_id: u8) -> bool {
    (MIN_CONNECTION_ID..=MAX_CONNECTION_ID).contains(&connection_id)
}

/// Decode one data channel message
pub fn decode_packet(buf: &[u8]) -> Result<Packet<'_>, ProtocolError> {
    let (&first, rest) = buf.split_first().ok_or(ProtocolError::EmptyPacket)?;

    if first != CONTROL_CONNECTION_ID {
        if !is_valid_connection_id(first) {
            return Err(ProtocolError::InvalidConnectionId(first));
        }
        return Ok(Packet::Data {
            connection_id: first,
            payload: rest,
        });
    }

    if buf.len() != CONTROL_PACKET_SIZE {
        return Err(ProtocolError::InvalidControlPacketSize(buf.len()));
    }
    let op = OpCode::from_u8(buf[1]).ok_or(ProtocolError::UnknownOpCode(buf[1]))?;
    let connection_id = buf[2];
    if !is_valid_connection_id(connection_id) {
        return Err(ProtocolError::InvalidConnectionId(connection_id));
    }
    Ok(Packet::Control { op, connection_id })
}

/// Build a data packet: `[connection_id][payload]`
pub fn encode_data(connection_id: u8, payload: &[u8]) -> Vec<u8> {
    debug_assert!(is_valid_connection_id(connection_id));
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(connection_id);
    buf.extend_from_slice(payload);
    buf
}

/// Build a control packet: `[0][op][connection_id]`
pub fn encode_control(op: OpCode, connection_id: u8) -> [u8; CONTROL_PACKET_SIZE] {
    debug_assert!(is_valid_connection_id(connection_id));
    [CONTROL_CONNECTION_ID, op as u8, connection_id]
}

// ============================================================================
// Tests
// ============================================================================
