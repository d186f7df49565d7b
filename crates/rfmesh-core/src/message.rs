//! Control message types and wire codecs
//!
//! Every frame begins with an 8-byte little-endian header:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0x00    2B    src_node (logical address of the sender)
//! 0x02    2B    dst_node (logical address of the destination)
//! 0x04    2B    id (per-sender frame counter)
//! 0x06    1B    msg_type
//! 0x07    1B    reserved (carries the requester's node id during joins)
//! ```
//!
//! Payload layouts are fixed-size little-endian and validated for length
//! before any field is read:
//!
//! - lookup responses: `i16` result (address, node id, or the not-found
//!   sentinel)
//! - address offers: `u16` address in the first two payload bytes
//! - address requests: `u16` parent address at offset 0, `u8` child bitmap
//!   at offset 3 (filled in by the poll node as it forwards)

use crate::address::{Addr, ChildBitmap};

/// Offer of a newly generated address (network layer value)
pub const NETWORK_ADDR_RESPONSE: u8 = 128;
/// Child confirms an offered address to the master (network-acked)
pub const MESH_ADDR_CONFIRM: u8 = 129;
/// Connectivity probe to the master (network layer value)
pub const NETWORK_PING: u8 = 130;
/// Multicast parent discovery (network layer value)
pub const NETWORK_POLL: u8 = 194;
/// Request for a new address, relayed toward the master (network layer value)
pub const NETWORK_REQ_ADDRESS: u8 = 195;
/// Resolve a node id to an address
pub const MESH_ADDR_LOOKUP: u8 = 196;
/// Release the sender's address binding
pub const MESH_ADDR_RELEASE: u8 = 197;
/// Resolve an address to a node id
pub const MESH_ID_LOOKUP: u8 = 198;
/// Wire sentinel for "no id / no address supplied"
pub const MESH_BLANK_ID: u16 = 65535;

/// Wire value the master answers with when a lookup misses
pub const LOOKUP_NOT_FOUND: i16 = -2;

/// Classification of the last inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Nothing received this pass
    Idle,
    /// `NETWORK_ADDR_RESPONSE`
    AddrResponse,
    /// `MESH_ADDR_CONFIRM`
    AddrConfirm,
    /// `NETWORK_PING`
    Ping,
    /// `NETWORK_POLL` (request or response, by direction)
    Poll,
    /// `NETWORK_REQ_ADDRESS`
    ReqAddress,
    /// `MESH_ADDR_LOOKUP`
    AddrLookup,
    /// `MESH_ADDR_RELEASE`
    AddrRelease,
    /// `MESH_ID_LOOKUP`
    IdLookup,
    /// Application-defined or unrecognized type
    Other(u8),
}

impl MessageType {
    /// Map a raw wire value to a message classification
    pub fn from_value(value: u8) -> Self {
        match value {
            0 => MessageType::Idle,
            NETWORK_ADDR_RESPONSE => MessageType::AddrResponse,
            MESH_ADDR_CONFIRM => MessageType::AddrConfirm,
            NETWORK_PING => MessageType::Ping,
            NETWORK_POLL => MessageType::Poll,
            NETWORK_REQ_ADDRESS => MessageType::ReqAddress,
            MESH_ADDR_LOOKUP => MessageType::AddrLookup,
            MESH_ADDR_RELEASE => MessageType::AddrRelease,
            MESH_ID_LOOKUP => MessageType::IdLookup,
            other => MessageType::Other(other),
        }
    }

    /// Raw wire value of this classification
    pub fn value(&self) -> u8 {
        match self {
            MessageType::Idle => 0,
            MessageType::AddrResponse => NETWORK_ADDR_RESPONSE,
            MessageType::AddrConfirm => MESH_ADDR_CONFIRM,
            MessageType::Ping => NETWORK_PING,
            MessageType::Poll => NETWORK_POLL,
            MessageType::ReqAddress => NETWORK_REQ_ADDRESS,
            MessageType::AddrLookup => MESH_ADDR_LOOKUP,
            MessageType::AddrRelease => MESH_ADDR_RELEASE,
            MessageType::IdLookup => MESH_ID_LOOKUP,
            MessageType::Other(value) => *value,
        }
    }
}

/// Frame header shared by every control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Logical address of the sender
    pub src_node: Addr,
    /// Logical address of the destination
    pub dst_node: Addr,
    /// Per-sender frame counter
    pub id: u16,
    /// Message classification
    pub msg_type: MessageType,
    /// Requester's node id during address acquisition, 0 otherwise
    pub reserved: u8,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a header addressed to `dst_node`; the network layer stamps
    /// the source address on transmit.
    pub fn to_node(dst_node: Addr, msg_type: MessageType) -> Self {
        Self {
            src_node: Addr::DEFAULT,
            dst_node,
            id: 0,
            msg_type,
            reserved: 0,
        }
    }

    /// Serialize to the 8-byte wire layout
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..2].copy_from_slice(&self.src_node.raw().to_le_bytes());
        bytes[2..4].copy_from_slice(&self.dst_node.raw().to_le_bytes());
        bytes[4..6].copy_from_slice(&self.id.to_le_bytes());
        bytes[6] = self.msg_type.value();
        bytes[7] = self.reserved;
        bytes
    }

    /// Deserialize from the wire; `None` when the buffer is short
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            src_node: Addr::from_raw(u16::from_le_bytes([bytes[0], bytes[1]])),
            dst_node: Addr::from_raw(u16::from_le_bytes([bytes[2], bytes[3]])),
            id: u16::from_le_bytes([bytes[4], bytes[5]]),
            msg_type: MessageType::from_value(bytes[6]),
            reserved: bytes[7],
        })
    }
}

/// Payload of a `NETWORK_REQ_ADDRESS` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrRequest {
    /// Address of the polled parent candidate
    pub parent: Addr,
    /// Occupancy of the parent's child slots, filled by the poll node
    pub child_bitmap: ChildBitmap,
}

impl AddrRequest {
    /// Payload size in bytes
    pub const SIZE: usize = 4;
    /// Offset of the child bitmap byte
    pub const BITMAP_OFFSET: usize = 3;

    /// Create a request naming the polled contact as parent; the bitmap is
    /// left empty for the poll node to fill.
    pub fn for_parent(parent: Addr) -> Self {
        Self {
            parent,
            child_bitmap: ChildBitmap::EMPTY,
        }
    }

    /// Serialize to the 4-byte wire layout
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..2].copy_from_slice(&self.parent.raw().to_le_bytes());
        bytes[Self::BITMAP_OFFSET] = self.child_bitmap.raw();
        bytes
    }

    /// Deserialize from the wire; `None` when the payload is short
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            parent: Addr::from_raw(u16::from_le_bytes([bytes[0], bytes[1]])),
            child_bitmap: ChildBitmap::from_raw(bytes[Self::BITMAP_OFFSET]),
        })
    }
}

/// Read a little-endian `u16` payload field, validating length
pub fn read_u16_le(payload: &[u8]) -> Option<u16> {
    if payload.len() < 2 {
        return None;
    }
    Some(u16::from_le_bytes([payload[0], payload[1]]))
}

/// Read a little-endian `i16` payload field, validating length
pub fn read_i16_le(payload: &[u8]) -> Option<i16> {
    if payload.len() < 2 {
        return None;
    }
    Some(i16::from_le_bytes([payload[0], payload[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::from_value(129), MessageType::AddrConfirm);
        assert_eq!(MessageType::from_value(196), MessageType::AddrLookup);
        assert_eq!(MessageType::AddrRelease.value(), 197);
        assert_eq!(MessageType::from_value(42), MessageType::Other(42));
        assert_eq!(MessageType::Other(42).value(), 42);
    }

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader {
            src_node: Addr::from_raw(0o12),
            dst_node: Addr::MASTER,
            id: 7,
            msg_type: MessageType::AddrConfirm,
            reserved: 11,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes[6], MESH_ADDR_CONFIRM);
        assert_eq!(bytes[7], 11);

        let recovered = FrameHeader::from_bytes(&bytes).unwrap();
        assert_eq!(recovered, header);
    }

    #[test]
    fn test_header_short_buffer() {
        assert!(FrameHeader::from_bytes(&[0u8; 7]).is_none());
    }

    #[test]
    fn test_addr_request_roundtrip() {
        let mut request = AddrRequest::for_parent(Addr::from_raw(0o4));
        request.child_bitmap.mark_taken(2);

        let bytes = request.to_bytes();
        assert_eq!(bytes[3], 0b10);

        let recovered = AddrRequest::from_bytes(&bytes).unwrap();
        assert_eq!(recovered.parent, Addr::from_raw(0o4));
        assert!(recovered.child_bitmap.is_taken(2));
    }

    #[test]
    fn test_addr_request_short_payload() {
        assert!(AddrRequest::from_bytes(&[0x04, 0x00]).is_none());
    }

    #[test]
    fn test_payload_field_reads() {
        assert_eq!(read_u16_le(&[0x0B, 0x00]), Some(11));
        assert_eq!(read_u16_le(&[0x0B]), None);
        assert_eq!(read_i16_le(&[0xFE, 0xFF]), Some(-2));
        assert_eq!(read_i16_le(&[]), None);
    }
}
