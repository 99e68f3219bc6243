use crate::error::PacketProcessError;
use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use parking_lot::Mutex;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};

pub const MAC_LEN: usize = 8;

/// id (u16) + type and flags (u8)
pub const SERVER_HEADER_LEN: usize = 3;
/// id (u16) + client id (u16) + type and flags (u8)
pub const CLIENT_HEADER_LEN: usize = 5;

pub const TYPE_MASK: u8 = 0x0F;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Voice = 0,
    VoiceWhisper = 1,
    Command = 2,
    CommandLow = 3,
    Ping = 4,
    Pong = 5,
    Ack = 6,
    AckLow = 7,
    Init1 = 8,
}

impl PacketType {
    pub const COUNT: usize = 9;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn lane(self) -> Option<Lane> {
        match self {
            PacketType::Command => Some(Lane::Normal),
            PacketType::CommandLow => Some(Lane::Low),
            _ => None,
        }
    }
}

/// The two priority classes of reliable command traffic. Each lane has its own id sequence,
///  acknowledgement packet type and reassembly buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Normal,
    Low,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::Normal, Lane::Low];

    pub fn index(self) -> usize {
        match self {
            Lane::Normal => 0,
            Lane::Low => 1,
        }
    }

    pub fn from_low_flag(low: bool) -> Lane {
        if low { Lane::Low } else { Lane::Normal }
    }

    pub fn command_type(self) -> PacketType {
        match self {
            Lane::Normal => PacketType::Command,
            Lane::Low => PacketType::CommandLow,
        }
    }

    pub fn ack_type(self) -> PacketType {
        match self {
            Lane::Normal => PacketType::Ack,
            Lane::Low => PacketType::AckLow,
        }
    }
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct PacketFlags: u8 {
        const FRAGMENTED   = 0x10;
        const NEW_PROTOCOL = 0x20;
        const COMPRESSED   = 0x40;
        const UNENCRYPTED  = 0x80;
    }
}

pub fn full_packet_id(generation: u16, packet_id: u16) -> u32 {
    ((generation as u32) << 16) | packet_id as u32
}

pub(crate) struct WireState {
    pub mac: [u8; MAC_LEN],
    pub payload: Vec<u8>,
    pub encrypted: bool,
}

/// A server-to-client packet. Type, flags and id are fixed when the packet is framed; the MAC
///  and payload are rewritten in place exactly once when the packet gets encrypted.
///
/// Packets are shared (`Arc`) between the write queues and the acknowledge manager. Whether a
///  packet currently sits in one of the write queues is tracked by `queued`, which only the
///  encoder's queue operations touch.
pub struct OutgoingPacket {
    type_and_flags: u8,
    packet_id: u16,
    generation: u16,
    wire: Mutex<WireState>,
    queued: AtomicBool,
}

impl Debug for OutgoingPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PCKT{{{:?}{:?}#{}@{}}}", self.packet_type(), self.flags(), self.packet_id, self.generation)
    }
}

impl OutgoingPacket {
    pub fn new(packet_type: PacketType, flags: PacketFlags, packet_id: u16, generation: u16, payload: Vec<u8>) -> OutgoingPacket {
        OutgoingPacket {
            type_and_flags: packet_type as u8 | flags.bits(),
            packet_id,
            generation,
            wire: Mutex::new(WireState {
                mac: [0; MAC_LEN],
                payload,
                encrypted: false,
            }),
            queued: AtomicBool::new(false),
        }
    }

    pub fn packet_type(&self) -> PacketType {
        // the type was a valid PacketType when the packet was created
        PacketType::try_from(self.type_and_flags & TYPE_MASK)
            .unwrap_or(PacketType::Init1)
    }

    pub fn flags(&self) -> PacketFlags {
        PacketFlags::from_bits_truncate(self.type_and_flags)
    }

    pub fn packet_id(&self) -> u16 {
        self.packet_id
    }

    pub fn generation(&self) -> u16 {
        self.generation
    }

    pub fn full_id(&self) -> u32 {
        full_packet_id(self.generation, self.packet_id)
    }

    pub fn header(&self) -> [u8; SERVER_HEADER_LEN] {
        let id = self.packet_id.to_be_bytes();
        [id[0], id[1], self.type_and_flags]
    }

    pub fn payload_len(&self) -> usize {
        self.wire.lock().payload.len()
    }

    /// total length on the wire, including MAC and header
    pub fn packet_len(&self) -> usize {
        MAC_LEN + SERVER_HEADER_LEN + self.payload_len()
    }

    pub fn is_encrypted(&self) -> bool {
        self.wire.lock().encrypted
    }

    /// the bytes that go into the UDP datagram
    pub fn to_wire(&self) -> Bytes {
        let wire = self.wire.lock();
        let mut buf = BytesMut::with_capacity(MAC_LEN + SERVER_HEADER_LEN + wire.payload.len());
        buf.put_slice(&wire.mac);
        buf.put_slice(&self.header());
        buf.put_slice(&wire.payload);
        buf.freeze()
    }

    pub(crate) fn with_wire<R>(&self, f: impl FnOnce(&mut WireState) -> R) -> R {
        f(&mut self.wire.lock())
    }

    /// returns `false` if the packet was already queued
    pub(crate) fn mark_queued(&self) -> bool {
        !self.queued.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn mark_dequeued(&self) {
        self.queued.store(false, Ordering::Release);
    }

    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }
}


/// A client-to-server datagram: `[mac:8][id:2][client id:2][type and flags:1][payload...]`.
///
/// The generation is not part of the wire format; it is filled in by the decoder's generation
///  estimator before the packet is decrypted.
pub struct IncomingPacket {
    buffer: BytesMut,
    estimated_generation: u16,
    decrypted: bool,
}

impl Debug for IncomingPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PCKT{{{:#04x}#{}@{} from {}: {} bytes}}", self.type_and_flags(), self.packet_id(), self.estimated_generation, self.client_id(), self.payload().len())
    }
}

impl IncomingPacket {
    pub const MIN_LEN: usize = MAC_LEN + CLIENT_HEADER_LEN;

    pub fn parse(buffer: BytesMut) -> Result<IncomingPacket, PacketProcessError> {
        if buffer.len() < Self::MIN_LEN {
            return Err(PacketProcessError::InvalidPacket("datagram shorter than packet header"));
        }
        if PacketType::try_from(buffer[MAC_LEN + 4] & TYPE_MASK).is_err() {
            return Err(PacketProcessError::InvalidPacket("unknown packet type"));
        }

        Ok(IncomingPacket {
            buffer,
            estimated_generation: 0,
            decrypted: false,
        })
    }

    pub fn mac(&self) -> &[u8] {
        &self.buffer[..MAC_LEN]
    }

    pub fn header(&self) -> &[u8] {
        &self.buffer[MAC_LEN..Self::MIN_LEN]
    }

    pub fn packet_id(&self) -> u16 {
        u16::from_be_bytes([self.buffer[MAC_LEN], self.buffer[MAC_LEN + 1]])
    }

    pub fn client_id(&self) -> u16 {
        u16::from_be_bytes([self.buffer[MAC_LEN + 2], self.buffer[MAC_LEN + 3]])
    }

    pub fn type_and_flags(&self) -> u8 {
        self.buffer[MAC_LEN + 4]
    }

    pub fn packet_type(&self) -> PacketType {
        // validated in parse()
        PacketType::try_from(self.type_and_flags() & TYPE_MASK)
            .unwrap_or(PacketType::Init1)
    }

    pub fn flags(&self) -> PacketFlags {
        PacketFlags::from_bits_truncate(self.type_and_flags())
    }

    pub fn is_encrypted(&self) -> bool {
        !self.decrypted && !self.flags().contains(PacketFlags::UNENCRYPTED)
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[Self::MIN_LEN..]
    }

    pub fn estimated_generation(&self) -> u16 {
        self.estimated_generation
    }

    pub fn set_estimated_generation(&mut self, generation: u16) {
        self.estimated_generation = generation;
    }

    pub fn full_packet_id(&self) -> u32 {
        full_packet_id(self.estimated_generation, self.packet_id())
    }

    pub(crate) fn set_decrypted(&mut self) {
        self.decrypted = true;
    }

    /// splits the buffer into (mac, header, payload) for in-place decryption
    pub(crate) fn crypt_parts(&mut self) -> (&[u8], &[u8], &mut [u8]) {
        let (mac_and_header, payload) = self.buffer.split_at_mut(Self::MIN_LEN);
        let (mac, header) = mac_and_header.split_at(MAC_LEN);
        (mac, header, payload)
    }

    pub fn into_payload(mut self) -> Bytes {
        self.buffer.split_off(Self::MIN_LEN).freeze()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// builds an unencrypted-on-the-wire client datagram with a zero MAC
    pub fn client_datagram(packet_type: PacketType, flags: PacketFlags, packet_id: u16, client_id: u16, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0; MAC_LEN]);
        buf.put_u16(packet_id);
        buf.put_u16(client_id);
        buf.put_u8(packet_type as u8 | flags.bits());
        buf.put_slice(payload);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::test_support::client_datagram;
    use rstest::rstest;

    #[rstest]
    #[case::voice(0x00, Some(PacketType::Voice), PacketFlags::empty())]
    #[case::command_fragmented(0x32, Some(PacketType::Command), PacketFlags::FRAGMENTED | PacketFlags::NEW_PROTOCOL)]
    #[case::ack_unencrypted(0xA6, Some(PacketType::Ack), PacketFlags::UNENCRYPTED | PacketFlags::NEW_PROTOCOL)]
    #[case::compressed_low(0x43, Some(PacketType::CommandLow), PacketFlags::COMPRESSED)]
    #[case::init(0x88, Some(PacketType::Init1), PacketFlags::UNENCRYPTED)]
    #[case::invalid(0x0C, None, PacketFlags::empty())]
    fn test_parse_type_and_flags(#[case] type_and_flags: u8, #[case] expected_type: Option<PacketType>, #[case] expected_flags: PacketFlags) {
        let mut buf = BytesMut::new();
        buf.put_slice(&[1,2,3,4,5,6,7,8, 0,9, 0,3]);
        buf.put_u8(type_and_flags);
        buf.put_slice(b"xyz");

        match (IncomingPacket::parse(buf), expected_type) {
            (Ok(packet), Some(expected_type)) => {
                assert_eq!(packet.packet_type(), expected_type);
                assert_eq!(packet.flags(), expected_flags);
                assert_eq!(packet.packet_id(), 9);
                assert_eq!(packet.client_id(), 3);
                assert_eq!(packet.mac(), &[1,2,3,4,5,6,7,8]);
                assert_eq!(packet.payload(), b"xyz");
            }
            (Err(_), None) => {}
            (other, expected) => panic!("unexpected result {:?} for {:?}", other.map(|p| p.packet_type()), expected),
        }
    }

    #[test]
    fn test_parse_too_short() {
        assert!(IncomingPacket::parse(BytesMut::from(&[0u8; 12][..])).is_err());
        assert!(IncomingPacket::parse(BytesMut::from(&[0u8; 13][..])).is_ok());
    }

    #[test]
    fn test_full_id() {
        let mut packet = IncomingPacket::parse(client_datagram(PacketType::Command, PacketFlags::empty(), 0x1234, 1, b"")).unwrap();
        packet.set_estimated_generation(3);
        assert_eq!(packet.full_packet_id(), 0x0003_1234);
    }

    #[test]
    fn test_outgoing_wire_layout() {
        let packet = OutgoingPacket::new(PacketType::Command, PacketFlags::NEW_PROTOCOL, 0x0102, 7, b"abc".to_vec());
        packet.with_wire(|w| w.mac = [9; MAC_LEN]);

        assert_eq!(packet.to_wire().as_ref(), &[9,9,9,9,9,9,9,9, 1,2, 0x22, b'a', b'b', b'c']);
        assert_eq!(packet.full_id(), 0x0007_0102);
        assert_eq!(packet.packet_len(), 14);
    }

    #[test]
    fn test_queued_marker() {
        let packet = OutgoingPacket::new(PacketType::Command, PacketFlags::empty(), 1, 0, vec![]);
        assert!(packet.mark_queued());
        assert!(!packet.mark_queued());
        packet.mark_dequeued();
        assert!(!packet.is_queued());
    }
}
