//! Wire codec for LEACH control traffic.
//!
//! Every control datagram starts with a one-octet type discriminator
//! followed by a fixed-layout payload. All four payloads share a three-octet
//! reserved prefix (a 16-bit zero then an 8-bit zero). Addresses are carried
//! as their four octets, sequence numbers in network byte order, and the
//! coordinate and millisecond fields little-endian, the mixed byte order of
//! the deployed format, reproduced exactly.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      Type     |                  Reserved                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Originator IP Address                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    (kind-specific fields)                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::fmt;
use std::net::Ipv4Addr;

/// Length of the shared reserved prefix in every payload.
const RESERVED_LEN: usize = 3;

/// Message type discriminator values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Cluster-head advertisement, broadcast during setup.
    Advertise = 1,
    /// Join reply, unicast from a member to its chosen head.
    JoinReply = 2,
    /// Time-table slot assignment, unicast from a head to a member.
    TimeTable = 3,
    /// Sensor data framing for application payloads.
    Data = 4,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<MessageKind> {
        match value {
            1 => Some(MessageKind::Advertise),
            2 => Some(MessageKind::JoinReply),
            3 => Some(MessageKind::TimeTable),
            4 => Some(MessageKind::Data),
            _ => None,
        }
    }

    /// Payload length excluding the type octet.
    pub fn payload_len(&self) -> usize {
        match self {
            MessageKind::Advertise | MessageKind::TimeTable => 19,
            MessageKind::JoinReply | MessageKind::Data => 11,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Advertise => "LEACH_AD",
            MessageKind::JoinReply => "LEACH_AD_REP",
            MessageKind::TimeTable => "LEACH_TT",
            MessageKind::Data => "LEACH_MSG",
        };
        f.write_str(name)
    }
}

/// Cluster-head advertisement: the head's address, sequence number and
/// coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertiseHeader {
    pub origin: Ipv4Addr,
    pub origin_seq: u32,
    pub x: u32,
    pub y: u32,
}

/// Join reply: member address and the head it joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinReplyHeader {
    pub origin: Ipv4Addr,
    pub head: Ipv4Addr,
}

/// Slot assignment: absolute slot start and slot width in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeTableHeader {
    pub origin: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub slot_start_ms: u32,
    pub slot_duration_ms: u32,
}

/// Sensor data framing: origin address and per-origin sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub origin: Ipv4Addr,
    pub origin_seq: u32,
}

/// A decoded control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Advertise(AdvertiseHeader),
    JoinReply(JoinReplyHeader),
    TimeTable(TimeTableHeader),
    Data(DataHeader),
}

/// Decoding failure. Malformed control packets are dropped silently by the
/// receive path; the error only surfaces in counters and debug logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    Truncated,
    UnknownKind(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "truncated control packet"),
            DecodeError::UnknownKind(value) => write!(f, "unknown message type {}", value),
        }
    }
}

impl std::error::Error for DecodeError {}

impl ControlMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ControlMessage::Advertise(_) => MessageKind::Advertise,
            ControlMessage::JoinReply(_) => MessageKind::JoinReply,
            ControlMessage::TimeTable(_) => MessageKind::TimeTable,
            ControlMessage::Data(_) => MessageKind::Data,
        }
    }

    /// Total encoded length: type octet plus payload.
    pub fn encoded_len(&self) -> usize {
        1 + self.kind().payload_len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(self.kind() as u8);
        buf.extend_from_slice(&[0u8; RESERVED_LEN]);
        match self {
            ControlMessage::Advertise(h) => {
                buf.extend_from_slice(&h.origin.octets());
                buf.extend_from_slice(&h.origin_seq.to_be_bytes());
                buf.extend_from_slice(&h.x.to_le_bytes());
                buf.extend_from_slice(&h.y.to_le_bytes());
            }
            ControlMessage::JoinReply(h) => {
                buf.extend_from_slice(&h.origin.octets());
                buf.extend_from_slice(&h.head.octets());
            }
            ControlMessage::TimeTable(h) => {
                buf.extend_from_slice(&h.origin.octets());
                buf.extend_from_slice(&h.destination.octets());
                buf.extend_from_slice(&h.slot_start_ms.to_le_bytes());
                buf.extend_from_slice(&h.slot_duration_ms.to_le_bytes());
            }
            ControlMessage::Data(h) => {
                buf.extend_from_slice(&h.origin.octets());
                buf.extend_from_slice(&h.origin_seq.to_be_bytes());
            }
        }
        buf
    }

    /// Decode a control message from the start of `bytes`. Trailing bytes
    /// beyond the fixed layout are ignored (data frames carry padding).
    pub fn decode(bytes: &[u8]) -> Result<ControlMessage, DecodeError> {
        let (&type_octet, rest) = bytes.split_first().ok_or(DecodeError::Truncated)?;
        let kind = MessageKind::from_u8(type_octet).ok_or(DecodeError::UnknownKind(type_octet))?;
        if rest.len() < kind.payload_len() {
            return Err(DecodeError::Truncated);
        }
        let fields = &rest[RESERVED_LEN..];
        let message = match kind {
            MessageKind::Advertise => ControlMessage::Advertise(AdvertiseHeader {
                origin: read_addr(fields, 0),
                origin_seq: read_u32_be(fields, 4),
                x: read_u32_le(fields, 8),
                y: read_u32_le(fields, 12),
            }),
            MessageKind::JoinReply => ControlMessage::JoinReply(JoinReplyHeader {
                origin: read_addr(fields, 0),
                head: read_addr(fields, 4),
            }),
            MessageKind::TimeTable => ControlMessage::TimeTable(TimeTableHeader {
                origin: read_addr(fields, 0),
                destination: read_addr(fields, 4),
                slot_start_ms: read_u32_le(fields, 8),
                slot_duration_ms: read_u32_le(fields, 12),
            }),
            MessageKind::Data => ControlMessage::Data(DataHeader {
                origin: read_addr(fields, 0),
                origin_seq: read_u32_be(fields, 4),
            }),
        };
        Ok(message)
    }
}

fn read_addr(bytes: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3])
}

fn read_u32_be(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u32_le(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 1, 1, last)
    }

    #[test]
    fn advertise_round_trip() {
        let message = ControlMessage::Advertise(AdvertiseHeader {
            origin: addr(3),
            origin_seq: 7,
            x: 120,
            y: 45,
        });
        let bytes = message.encode();
        assert_eq!(bytes.len(), 20);
        assert_eq!(ControlMessage::decode(&bytes), Ok(message));
    }

    #[test]
    fn join_reply_round_trip() {
        let message = ControlMessage::JoinReply(JoinReplyHeader {
            origin: addr(4),
            head: addr(2),
        });
        let bytes = message.encode();
        assert_eq!(bytes.len(), 12);
        assert_eq!(ControlMessage::decode(&bytes), Ok(message));
    }

    #[test]
    fn time_table_round_trip_and_length() {
        let message = ControlMessage::TimeTable(TimeTableHeader {
            origin: Ipv4Addr::new(1, 2, 3, 4),
            destination: Ipv4Addr::new(1, 2, 3, 5),
            slot_start_ms: 1234,
            slot_duration_ms: 567,
        });
        let bytes = message.encode();
        assert_eq!(bytes.len(), 20);
        assert_eq!(ControlMessage::decode(&bytes), Ok(message));
    }

    #[test]
    fn data_round_trip() {
        let message = ControlMessage::Data(DataHeader {
            origin: addr(9),
            origin_seq: 0xDEAD_BEEF,
        });
        let bytes = message.encode();
        assert_eq!(bytes.len(), 12);
        assert_eq!(ControlMessage::decode(&bytes), Ok(message));
    }

    #[test]
    fn byte_layout_is_fixed() {
        let message = ControlMessage::Advertise(AdvertiseHeader {
            origin: Ipv4Addr::new(10, 1, 1, 2),
            origin_seq: 0x0102_0304,
            x: 0x0A0B_0C0D,
            y: 1,
        });
        let bytes = message.encode();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..4], &[0, 0, 0]);
        assert_eq!(&bytes[4..8], &[10, 1, 1, 2]);
        // sequence number travels in network byte order
        assert_eq!(&bytes[8..12], &[0x01, 0x02, 0x03, 0x04]);
        // coordinates travel little-endian
        assert_eq!(&bytes[12..16], &[0x0D, 0x0C, 0x0B, 0x0A]);
        assert_eq!(&bytes[16..20], &[1, 0, 0, 0]);
    }

    #[test]
    fn slot_fields_are_little_endian() {
        let message = ControlMessage::TimeTable(TimeTableHeader {
            origin: addr(2),
            destination: addr(3),
            slot_start_ms: 0x0102_0304,
            slot_duration_ms: 0x0506_0708,
        });
        let bytes = message.encode();
        assert_eq!(&bytes[12..16], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[16..20], &[0x08, 0x07, 0x06, 0x05]);
    }

    #[test]
    fn unknown_discriminator_is_rejected() {
        assert_eq!(
            ControlMessage::decode(&[0u8; 20]),
            Err(DecodeError::UnknownKind(0))
        );
        assert_eq!(
            ControlMessage::decode(&[5u8; 20]),
            Err(DecodeError::UnknownKind(5))
        );
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let message = ControlMessage::JoinReply(JoinReplyHeader {
            origin: addr(4),
            head: addr(2),
        });
        let bytes = message.encode();
        for len in 0..bytes.len() {
            assert_eq!(
                ControlMessage::decode(&bytes[..len]),
                Err(DecodeError::Truncated),
                "length {len} should not decode"
            );
        }
    }

    #[test]
    fn trailing_padding_is_ignored() {
        let message = ControlMessage::Data(DataHeader {
            origin: addr(6),
            origin_seq: 11,
        });
        let mut bytes = message.encode();
        bytes.resize(1024, 0);
        assert_eq!(ControlMessage::decode(&bytes), Ok(message));
    }
}
