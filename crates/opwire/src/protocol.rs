// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire protocol: message identifiers, opcodes, and packet headers.
//!
//! Every packet starts with a common header carrying an opcode and the
//! [`MessageId`] it concerns. Opcode-specific fields follow:
//!
//! ```text
//! Common = opcode(u8) | transport_id(u64 le) | sequence(u64 le) | tag(u32 le)
//! DATA   = Common | index(u16 le) | total_length(u32 le)
//! GRANT  = Common | packet_index(u32 le)
//! DONE   = Common
//! ```
//!
//! The `tag` discriminates the role of a message within an operation:
//! [`ULTIMATE_RESPONSE_TAG`] marks the final reply, [`INITIAL_REQUEST_TAG`]
//! marks the first request, and higher values mark chained server-to-server
//! requests (each hop adds one). Both sentinels are wire constants and must
//! match on all peers.

use crate::driver::RawAddress;

/// Tag of the final reply message of an operation.
pub const ULTIMATE_RESPONSE_TAG: u32 = 0;
/// Tag of the first request message of an operation.
pub const INITIAL_REQUEST_TAG: u32 = 1;

/// Identifies an operation: the originating transport and its sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId {
    /// Transport that originated the operation.
    pub transport_id: u64,
    /// Sequence number assigned by the originating transport.
    pub sequence: u64,
}

/// Identifies a single message within an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    /// Transport that originated the operation.
    pub transport_id: u64,
    /// Sequence number assigned by the originating transport.
    pub sequence: u64,
    /// Role of this message within the operation.
    pub tag: u32,
}

impl MessageId {
    /// Encoded size on the wire.
    pub const WIRE_SIZE: usize = 20;

    /// Create a MessageId for the given operation and tag.
    pub fn new(op_id: OpId, tag: u32) -> Self {
        Self {
            transport_id: op_id.transport_id,
            sequence: op_id.sequence,
            tag,
        }
    }

    /// The operation this message belongs to.
    #[must_use]
    pub fn op_id(&self) -> OpId {
        OpId {
            transport_id: self.transport_id,
            sequence: self.sequence,
        }
    }

    /// True for request messages (initial or chained), false for replies.
    #[must_use]
    pub fn is_request(&self) -> bool {
        self.tag >= INITIAL_REQUEST_TAG
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(WireError::Truncated);
        }
        buf[0..8].copy_from_slice(&self.transport_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.sequence.to_le_bytes());
        buf[16..20].copy_from_slice(&self.tag.to_le_bytes());
        Ok(Self::WIRE_SIZE)
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize), WireError> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(WireError::Truncated);
        }
        let transport_id = u64::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ]);
        let sequence = u64::from_le_bytes([
            buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
        ]);
        let tag = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        Ok((
            Self {
                transport_id,
                sequence,
                tag,
            },
            Self::WIRE_SIZE,
        ))
    }
}

/// Packet opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Carries a slice of message payload.
    Data = 0x01,
    /// Authorizes the sender to transmit further packets.
    Grant = 0x02,
    /// Acknowledges full receipt of a message that expects one.
    Done = 0x03,
}

impl Opcode {
    /// Decode an opcode byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Data),
            0x02 => Some(Self::Grant),
            0x03 => Some(Self::Done),
            _ => None,
        }
    }
}

/// Read the opcode byte of a packet payload without consuming it.
pub fn peek_opcode(payload: &[u8]) -> Option<Opcode> {
    payload.first().and_then(|b| Opcode::from_u8(*b))
}

/// Wire codec error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer too small for the header.
    Truncated,
    /// Opcode byte does not match the expected header kind.
    WrongOpcode,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "buffer too small for header"),
            Self::WrongOpcode => write!(f, "opcode does not match header kind"),
        }
    }
}

impl std::error::Error for WireError {}

fn encode_common(opcode: Opcode, id: &MessageId, buf: &mut [u8]) -> Result<usize, WireError> {
    if buf.is_empty() {
        return Err(WireError::Truncated);
    }
    buf[0] = opcode as u8;
    let n = id.encode(&mut buf[1..])?;
    Ok(1 + n)
}

fn decode_common(opcode: Opcode, buf: &[u8]) -> Result<(MessageId, usize), WireError> {
    if buf.is_empty() {
        return Err(WireError::Truncated);
    }
    if buf[0] != opcode as u8 {
        return Err(WireError::WrongOpcode);
    }
    let (id, n) = MessageId::decode(&buf[1..])?;
    Ok((id, 1 + n))
}

/// Header of a DATA packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Message the payload slice belongs to.
    pub message_id: MessageId,
    /// Packet number within the message.
    pub index: u16,
    /// Raw length of the whole message in bytes.
    pub total_length: u32,
}

impl DataHeader {
    /// Encoded size on the wire.
    pub const WIRE_SIZE: usize = 1 + MessageId::WIRE_SIZE + 2 + 4;

    /// Encode into the front of a packet payload.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(WireError::Truncated);
        }
        let mut offset = encode_common(Opcode::Data, &self.message_id, buf)?;
        buf[offset..offset + 2].copy_from_slice(&self.index.to_le_bytes());
        offset += 2;
        buf[offset..offset + 4].copy_from_slice(&self.total_length.to_le_bytes());
        offset += 4;
        Ok(offset)
    }

    /// Decode from the front of a packet payload.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), WireError> {
        let (message_id, mut offset) = decode_common(Opcode::Data, buf)?;
        if buf.len() < Self::WIRE_SIZE {
            return Err(WireError::Truncated);
        }
        let index = u16::from_le_bytes([buf[offset], buf[offset + 1]]);
        offset += 2;
        let total_length = u32::from_le_bytes([
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ]);
        offset += 4;
        Ok((
            Self {
                message_id,
                index,
                total_length,
            },
            offset,
        ))
    }
}

/// Header of a GRANT packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantHeader {
    /// Message being granted.
    pub message_id: MessageId,
    /// Exclusive packet index the sender may transmit up to.
    pub packet_index: u32,
}

impl GrantHeader {
    /// Encoded size on the wire.
    pub const WIRE_SIZE: usize = 1 + MessageId::WIRE_SIZE + 4;

    /// Encode into the front of a packet payload.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(WireError::Truncated);
        }
        let mut offset = encode_common(Opcode::Grant, &self.message_id, buf)?;
        buf[offset..offset + 4].copy_from_slice(&self.packet_index.to_le_bytes());
        offset += 4;
        Ok(offset)
    }

    /// Decode from the front of a packet payload.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), WireError> {
        let (message_id, offset) = decode_common(Opcode::Grant, buf)?;
        if buf.len() < Self::WIRE_SIZE {
            return Err(WireError::Truncated);
        }
        let packet_index = u32::from_le_bytes([
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ]);
        Ok((
            Self {
                message_id,
                packet_index,
            },
            offset + 4,
        ))
    }
}

/// Header of a DONE packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoneHeader {
    /// Message being acknowledged.
    pub message_id: MessageId,
}

impl DoneHeader {
    /// Encoded size on the wire.
    pub const WIRE_SIZE: usize = 1 + MessageId::WIRE_SIZE;

    /// Encode into the front of a packet payload.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        encode_common(Opcode::Done, &self.message_id, buf)
    }

    /// Decode from the front of a packet payload.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), WireError> {
        let (message_id, offset) = decode_common(Opcode::Done, buf)?;
        Ok((Self { message_id }, offset))
    }
}

/// Application-level header at the front of every message payload.
///
/// Reserved by the transport when a message buffer is constructed; the
/// application's own bytes start right after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    /// Bit-exact raw address the final reply should be sent to.
    pub reply_address: RawAddress,
}

impl MessageHeader {
    /// Encoded size at the front of the message payload.
    pub const WIRE_SIZE: usize = 8;

    /// Encode into a message payload region.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(WireError::Truncated);
        }
        buf[..Self::WIRE_SIZE].copy_from_slice(&self.reply_address);
        Ok(Self::WIRE_SIZE)
    }

    /// Decode from a message payload region.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), WireError> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(WireError::Truncated);
        }
        let mut reply_address = [0u8; 8];
        reply_address.copy_from_slice(&buf[..Self::WIRE_SIZE]);
        Ok((Self { reply_address }, Self::WIRE_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(tag: u32) -> MessageId {
        MessageId {
            transport_id: 42,
            sequence: 32,
            tag,
        }
    }

    #[test]
    fn data_header_roundtrip() {
        let header = DataHeader {
            message_id: id(22),
            index: 3,
            total_length: 1420,
        };

        let mut buf = [0u8; 64];
        let written = header.encode(&mut buf).unwrap();
        assert_eq!(written, DataHeader::WIRE_SIZE);

        let (decoded, read) = DataHeader::decode(&buf).unwrap();
        assert_eq!(read, written);
        assert_eq!(decoded, header);
    }

    #[test]
    fn grant_header_roundtrip() {
        let header = GrantHeader {
            message_id: id(INITIAL_REQUEST_TAG),
            packet_index: 7,
        };

        let mut buf = [0u8; 64];
        let written = header.encode(&mut buf).unwrap();

        let (decoded, read) = GrantHeader::decode(&buf).unwrap();
        assert_eq!(read, written);
        assert_eq!(decoded, header);
    }

    #[test]
    fn opcode_dispatch_by_first_byte() {
        let header = DoneHeader { message_id: id(2) };
        let mut buf = [0u8; 32];
        header.encode(&mut buf).unwrap();

        assert_eq!(peek_opcode(&buf), Some(Opcode::Done));
        assert_eq!(peek_opcode(&[0xFF]), None);
        assert_eq!(peek_opcode(&[]), None);
    }

    #[test]
    fn wrong_opcode_rejected() {
        let header = GrantHeader {
            message_id: id(1),
            packet_index: 1,
        };
        let mut buf = [0u8; 32];
        header.encode(&mut buf).unwrap();

        assert_eq!(DataHeader::decode(&buf), Err(WireError::WrongOpcode));
    }

    #[test]
    fn request_tags() {
        assert!(id(INITIAL_REQUEST_TAG).is_request());
        assert!(id(INITIAL_REQUEST_TAG + 1).is_request());
        assert!(!id(ULTIMATE_RESPONSE_TAG).is_request());
    }
}
