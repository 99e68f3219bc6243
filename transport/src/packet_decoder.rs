use crate::compression;
use crate::crypt_handler::{CryptHandler, DEFAULT_KEY, DEFAULT_NONCE};
use crate::error::PacketProcessError;
use crate::fragment_ring::{Fragment, FragmentRing, InsertError};
use crate::generation_estimator::GenerationEstimator;
use crate::packet_header::{IncomingPacket, Lane, PacketFlags, PacketType};
#[cfg(test)] use mockall::automock;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tracing::trace;

/// A complete (reassembled and decompressed) command as it was sent by the client
pub struct ReassembledCommand {
    lane: Lane,
    data: Bytes,
}

impl Debug for ReassembledCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CMD{{{:?}: {} bytes}}", self.lane, self.data.len())
    }
}

impl ReassembledCommand {
    pub fn new(lane: Lane, data: Bytes) -> ReassembledCommand {
        ReassembledCommand { lane, data }
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    pub fn command(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

#[cfg_attr(test, automock)]
pub trait DecoderCallbacks: Send + Sync {
    /// a decrypted packet that is not a command
    fn decoded_packet(&self, packet: IncomingPacket);
    fn decoded_command(&self, command: ReassembledCommand);
    fn send_acknowledge(&self, packet_id: u16, lane: Lane);
}

/// Decrypts incoming packets and reassembles commands from their fragments.
///
/// Command packets are acknowledged as soon as they are stored in their lane's fragment ring,
///  and commands are handed on strictly in packet id order. A fragment sequence starts and ends
///  with a packet carrying the `FRAGMENTED` flag; the packets in between have it cleared.
pub struct PacketDecoder {
    max_command_size: usize,
    crypt_handler: Arc<CryptHandler>,
    callbacks: Arc<dyn DecoderCallbacks>,
    estimators: Mutex<[GenerationEstimator; PacketType::COUNT]>,
    fragment_buffers: [Mutex<FragmentRing>; 2],
}

/// the raw (possibly compressed) data of a complete fragment sequence
struct RawCommand {
    flags: PacketFlags,
    data: Bytes,
}

impl PacketDecoder {
    pub const FRAGMENT_BUFFER_CAPACITY: usize = 32;

    pub fn new(max_command_size: usize, crypt_handler: Arc<CryptHandler>, callbacks: Arc<dyn DecoderCallbacks>) -> PacketDecoder {
        PacketDecoder {
            max_command_size,
            crypt_handler,
            callbacks,
            estimators: Default::default(),
            fragment_buffers: [
                Mutex::new(FragmentRing::new(Self::FRAGMENT_BUFFER_CAPACITY)),
                Mutex::new(FragmentRing::new(Self::FRAGMENT_BUFFER_CAPACITY)),
            ],
        }
    }

    pub fn reset(&self) {
        for buffer in &self.fragment_buffers {
            buffer.lock().reset();
        }
        for estimator in self.estimators.lock().iter_mut() {
            estimator.reset();
        }
    }

    /// The client's `clientinitiv` is command packet 0, which is processed before the decoder's
    ///  state is reset for the new handshake - so the next command packet has id 1
    pub fn register_initiv_packet(&self) {
        self.fragment_buffers[Lane::Normal.index()].lock().set_full_index_to(1);
    }

    /// Assigns the packet's estimated generation without decoding it
    pub fn estimate_generation(&self, packet: &mut IncomingPacket) {
        let generation = self.estimators.lock()[packet.packet_type().index()].visit_packet(packet.packet_id());
        packet.set_estimated_generation(generation);
    }

    pub fn process_incoming_data(&self, mut packet: IncomingPacket) -> Result<(), PacketProcessError> {
        self.estimate_generation(&mut packet);
        self.decrypt_incoming_packet(&mut packet)?;

        let lane = match packet.packet_type().lane() {
            Some(lane) => lane,
            None => {
                self.callbacks.decoded_packet(packet);
                return Ok(());
            }
        };

        let packet_id = packet.packet_id();
        let full_id = packet.full_packet_id();
        let fragment = Fragment {
            packet_id,
            generation: packet.estimated_generation(),
            flags: packet.flags(),
            payload: packet.into_payload(),
        };

        let buffer = &self.fragment_buffers[lane.index()];
        {
            let mut ring = buffer.lock();
            if let Err(e) = ring.insert(full_id, fragment) {
                let detail = format!("pid: {}, bidx: {}, bcap: {}", packet_id, ring.current_index(), ring.capacity());
                drop(ring);

                return Err(match e {
                    InsertError::Duplicate => {
                        self.callbacks.send_acknowledge(packet_id, lane);
                        PacketProcessError::DuplicatedPacket
                    }
                    InsertError::Underflow => {
                        // a resend of something we processed already, the ack got lost
                        self.callbacks.send_acknowledge(packet_id, lane);
                        PacketProcessError::BufferUnderflow(detail)
                    }
                    InsertError::Overflow => PacketProcessError::BufferOverflow(detail),
                });
            }
        }
        self.callbacks.send_acknowledge(packet_id, lane);

        loop {
            let raw = match Self::try_pop_sequence(&mut buffer.lock(), self.max_command_size)? {
                Some(raw) => raw,
                None => return Ok(()),
            };

            let data = if raw.flags.contains(PacketFlags::COMPRESSED) {
                Bytes::from(compression::decompress(&raw.data, self.max_command_size)?)
            }
            else {
                raw.data
            };
            trace!("reassembled {:?} command of {} bytes", lane, data.len());
            self.callbacks.decoded_command(ReassembledCommand::new(lane, data));
        }
    }

    fn decrypt_incoming_packet(&self, packet: &mut IncomingPacket) -> Result<(), PacketProcessError> {
        if !packet.is_encrypted() {
            return Ok(());
        }

        let packet_type = packet.packet_type() as u8;
        let packet_id = packet.packet_id();
        let generation = packet.estimated_generation();

        let mut use_default_key = !self.crypt_handler.encryption_initialized();
        loop {
            let (key, nonce) = if use_default_key {
                (DEFAULT_KEY, DEFAULT_NONCE)
            }
            else {
                self.crypt_handler.generate_key_nonce(true, packet_type, packet_id, generation)
                    .map_err(|_| PacketProcessError::DecryptKeyGenFailed)?
            };

            let (mac, header, payload) = packet.crypt_parts();
            match self.crypt_handler.decrypt(header, payload, mac, &key, &nonce) {
                Ok(()) => break,
                // packets sent by the client before it learned about the shared secret
                Err(_) if !use_default_key && packet_id < 10 && generation == 0 => {
                    use_default_key = true;
                }
                Err(_) => return Err(PacketProcessError::DecryptFailed),
            }
        }

        packet.set_decrypted();
        Ok(())
    }

    /// Pops the next complete command from the front of the ring, if there is one
    fn try_pop_sequence(ring: &mut FragmentRing, max_command_size: usize) -> Result<Option<RawCommand>, PacketProcessError> {
        let first = match ring.slot(0) {
            Some(first) => first,
            None => return Ok(None),
        };

        if !first.flags.contains(PacketFlags::FRAGMENTED) {
            return Ok(ring.pop_front().map(|f| RawCommand { flags: f.flags, data: f.payload }));
        }

        let mut sequence_length = 1;
        let mut total_length = first.payload.len();
        loop {
            if sequence_length >= ring.capacity() {
                return Err(PacketProcessError::CommandSequenceLengthTooLong);
            }
            let fragment = match ring.slot(sequence_length) {
                Some(fragment) => fragment,
                None => return Ok(None),
            };

            sequence_length += 1;
            total_length += fragment.payload.len();
            if fragment.flags.contains(PacketFlags::FRAGMENTED) {
                break;
            }
        }

        if total_length > max_command_size {
            return Err(PacketProcessError::CommandTooLarge(total_length));
        }

        let mut data = BytesMut::with_capacity(total_length);
        let mut flags = PacketFlags::empty();
        for idx in 0..sequence_length {
            if let Some(fragment) = ring.pop_front() {
                if idx == 0 {
                    flags = fragment.flags;
                }
                data.extend_from_slice(&fragment.payload);
            }
        }
        Ok(Some(RawCommand { flags, data: data.freeze() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_header::test_support::client_datagram;
    use crate::packet_header::{MAC_LEN, CLIENT_HEADER_LEN};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{RngCore, SeedableRng};
    use rstest::rstest;
    use std::sync::mpsc;

    /// collects decoded commands and acknowledgements in channels
    fn recording_callbacks() -> (MockDecoderCallbacks, mpsc::Receiver<ReassembledCommand>, mpsc::Receiver<(u16, Lane)>) {
        let (cmd_send, cmd_recv) = mpsc::channel();
        let (ack_send, ack_recv) = mpsc::channel();
        let cmd_send = Mutex::new(cmd_send);
        let ack_send = Mutex::new(ack_send);

        let mut callbacks = MockDecoderCallbacks::new();
        callbacks.expect_decoded_command()
            .returning(move |cmd| cmd_send.lock().send(cmd).unwrap());
        callbacks.expect_send_acknowledge()
            .returning(move |id, lane| ack_send.lock().send((id, lane)).unwrap());
        (callbacks, cmd_recv, ack_recv)
    }

    fn decoder(callbacks: MockDecoderCallbacks) -> PacketDecoder {
        PacketDecoder::new(64 * 1024 * 1024, Arc::new(CryptHandler::new()), Arc::new(callbacks))
    }

    fn unencrypted(packet_type: PacketType, flags: PacketFlags, packet_id: u16, payload: &[u8]) -> IncomingPacket {
        IncomingPacket::parse(client_datagram(packet_type, flags | PacketFlags::UNENCRYPTED, packet_id, 1, payload)).unwrap()
    }

    /// fragments the way the sending side does it
    fn fragments(data: &[u8], first_id: u16, compressed: bool) -> Vec<IncomingPacket> {
        let chunk_count = data.len().div_ceil(487).max(1);
        let chunk_size = data.len().div_ceil(chunk_count).max(1);
        let chunks = if data.is_empty() { vec![data] } else { data.chunks(chunk_size).collect::<Vec<_>>() };
        let n = chunks.len();
        chunks.into_iter()
            .enumerate()
            .map(|(idx, chunk)| {
                let mut flags = PacketFlags::NEW_PROTOCOL;
                if n > 1 && (idx == 0 || idx == n - 1) {
                    flags |= PacketFlags::FRAGMENTED;
                }
                if idx == 0 && compressed {
                    flags |= PacketFlags::COMPRESSED;
                }
                unencrypted(PacketType::Command, flags, first_id + idx as u16, chunk)
            })
            .collect()
    }

    #[rstest]
    #[case::empty(0, 1)]
    #[case::single(300, 2)]
    #[case::two(600, 3)]
    #[case::many(10_000, 4)]
    #[case::max_sequence(487 * 31, 5)]
    fn test_reassembly_in_any_order(#[case] len: usize, #[case] seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data = vec![0u8; len];
        rng.fill_bytes(&mut data);

        let (callbacks, commands, acks) = recording_callbacks();
        let decoder = decoder(callbacks);

        let mut packets = fragments(&data, 0, false);
        let num_packets = packets.len();
        packets.shuffle(&mut rng);
        for packet in packets {
            decoder.process_incoming_data(packet).unwrap();
        }

        let received = commands.try_iter().collect::<Vec<_>>();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].command(), data.as_slice());
        assert_eq!(received[0].lane(), Lane::Normal);
        assert_eq!(acks.try_iter().count(), num_packets);
    }

    #[test]
    fn test_commands_in_id_order() {
        let (callbacks, commands, _acks) = recording_callbacks();
        let decoder = decoder(callbacks);

        decoder.process_incoming_data(unencrypted(PacketType::Command, PacketFlags::empty(), 1, b"second")).unwrap();
        assert!(commands.try_recv().is_err());
        decoder.process_incoming_data(unencrypted(PacketType::Command, PacketFlags::empty(), 0, b"first")).unwrap();

        let received = commands.try_iter().map(|c| c.command().to_vec()).collect::<Vec<_>>();
        assert_eq!(received, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn test_compressed_command() {
        let (callbacks, commands, _acks) = recording_callbacks();
        let decoder = decoder(callbacks);

        let command = b"clientupdate client_input_muted=1 ".repeat(100);
        let compressed = compression::compress(&command).unwrap();
        for packet in fragments(&compressed, 0, true) {
            decoder.process_incoming_data(packet).unwrap();
        }
        assert_eq!(commands.try_recv().unwrap().command(), command.as_slice());
    }

    #[rstest]
    #[case::garbage(vec![5, 0, 0, 0, 1, 2, 3], PacketProcessError::CommandDecompressFailed)]
    #[case::huge(vec![0, 0, 0, 0x10, 1, 2, 3], PacketProcessError::CommandTooLarge(0x1000_0000))]
    fn test_decompress_errors(#[case] payload: Vec<u8>, #[case] expected: PacketProcessError) {
        let (callbacks, commands, _acks) = recording_callbacks();
        let decoder = decoder(callbacks);

        let result = decoder.process_incoming_data(unencrypted(PacketType::Command, PacketFlags::COMPRESSED, 0, &payload));
        assert_eq!(result, Err(expected));
        assert!(commands.try_recv().is_err());
    }

    #[test]
    fn test_duplicate_and_underflow_are_acknowledged() {
        let (callbacks, commands, acks) = recording_callbacks();
        let decoder = decoder(callbacks);

        decoder.process_incoming_data(unencrypted(PacketType::Command, PacketFlags::empty(), 2, b"later")).unwrap();
        assert_eq!(
            decoder.process_incoming_data(unencrypted(PacketType::Command, PacketFlags::empty(), 2, b"later")),
            Err(PacketProcessError::DuplicatedPacket)
        );

        decoder.process_incoming_data(unencrypted(PacketType::Command, PacketFlags::empty(), 0, b"a")).unwrap();
        let result = decoder.process_incoming_data(unencrypted(PacketType::Command, PacketFlags::empty(), 0, b"a"));
        assert!(matches!(result, Err(PacketProcessError::BufferUnderflow(_))));

        assert_eq!(acks.try_iter().collect::<Vec<_>>(), vec![(2, Lane::Normal), (2, Lane::Normal), (0, Lane::Normal), (0, Lane::Normal)]);
        assert_eq!(commands.try_iter().count(), 1);
    }

    #[test]
    fn test_overflow_is_not_acknowledged() {
        let (callbacks, _commands, acks) = recording_callbacks();
        let decoder = decoder(callbacks);

        let result = decoder.process_incoming_data(unencrypted(PacketType::CommandLow, PacketFlags::empty(), 32, b"x"));
        assert!(matches!(result, Err(PacketProcessError::BufferOverflow(_))));
        assert!(acks.try_recv().is_err());
    }

    #[test]
    fn test_sequence_too_long() {
        let (callbacks, commands, _acks) = recording_callbacks();
        let decoder = decoder(callbacks);

        decoder.process_incoming_data(unencrypted(PacketType::Command, PacketFlags::FRAGMENTED, 0, b"start")).unwrap();
        for id in 1..31 {
            decoder.process_incoming_data(unencrypted(PacketType::Command, PacketFlags::empty(), id, b"middle")).unwrap();
        }
        let result = decoder.process_incoming_data(unencrypted(PacketType::Command, PacketFlags::empty(), 31, b"middle"));
        assert_eq!(result, Err(PacketProcessError::CommandSequenceLengthTooLong));
        assert!(result.unwrap_err().is_fatal());
        assert!(commands.try_recv().is_err());
    }

    #[test]
    fn test_lanes_are_independent() {
        let (callbacks, commands, acks) = recording_callbacks();
        let decoder = decoder(callbacks);

        decoder.process_incoming_data(unencrypted(PacketType::CommandLow, PacketFlags::empty(), 0, b"low")).unwrap();
        decoder.process_incoming_data(unencrypted(PacketType::Command, PacketFlags::empty(), 0, b"normal")).unwrap();

        let received = commands.try_iter().map(|c| (c.lane(), c.command().to_vec())).collect::<Vec<_>>();
        assert_eq!(received, vec![(Lane::Low, b"low".to_vec()), (Lane::Normal, b"normal".to_vec())]);
        assert_eq!(acks.try_iter().collect::<Vec<_>>(), vec![(0, Lane::Low), (0, Lane::Normal)]);
    }

    #[test]
    fn test_register_initiv_packet() {
        let (callbacks, commands, _acks) = recording_callbacks();
        let decoder = decoder(callbacks);
        decoder.register_initiv_packet();

        decoder.process_incoming_data(unencrypted(PacketType::Command, PacketFlags::empty(), 1, b"clientek")).unwrap();
        assert_eq!(commands.try_recv().unwrap().command(), b"clientek");
    }

    #[test]
    fn test_non_command_packets() {
        let mut callbacks = MockDecoderCallbacks::new();
        callbacks.expect_decoded_packet()
            .times(1)
            .withf(|p| p.packet_type() == PacketType::Ping && p.packet_id() == 7)
            .returning(|_| ());
        let decoder = decoder(callbacks);

        decoder.process_incoming_data(unencrypted(PacketType::Ping, PacketFlags::empty(), 7, b"")).unwrap();
    }

    fn encrypt_client_packet(crypt_handler: &CryptHandler, packet_type: PacketType, packet_id: u16, generation: u16, payload: &[u8], use_default_key: bool) -> IncomingPacket {
        let mut buf = client_datagram(packet_type, PacketFlags::NEW_PROTOCOL, packet_id, 1, payload);
        let (key, nonce) = if use_default_key {
            (DEFAULT_KEY, DEFAULT_NONCE)
        }
        else {
            crypt_handler.generate_key_nonce(true, packet_type as u8, packet_id, generation).unwrap()
        };
        let (mac_and_header, body) = buf.split_at_mut(MAC_LEN + CLIENT_HEADER_LEN);
        let mac = crypt_handler.encrypt(&mac_and_header[MAC_LEN..], body, &key, &nonce).unwrap();
        buf[..MAC_LEN].copy_from_slice(&mac);
        IncomingPacket::parse(buf).unwrap()
    }

    #[rstest]
    #[case::derived_key(0, false, true)]
    #[case::default_key_early_packet(3, true, true)]
    #[case::default_key_late_packet(10, true, false)]
    fn test_decrypt(#[case] packet_id: u16, #[case] use_default_key: bool, #[case] expect_ok: bool) {
        let crypt_handler = Arc::new(CryptHandler::new());
        crypt_handler.setup_shared_secret(&[1; 10], &[2; 10], b"secret").unwrap();

        let mut callbacks = MockDecoderCallbacks::new();
        callbacks.expect_decoded_packet()
            .times(if expect_ok { 1 } else { 0 })
            .withf(|p| p.payload() == b"voice data")
            .returning(|_| ());
        let decoder = PacketDecoder::new(1024, crypt_handler.clone(), Arc::new(callbacks));
        decoder.estimators.lock()[PacketType::Voice.index()].set_last_state(packet_id, 0);

        let packet = encrypt_client_packet(&crypt_handler, PacketType::Voice, packet_id, 0, b"voice data", use_default_key);
        let result = decoder.process_incoming_data(packet);
        assert_eq!(result.is_ok(), expect_ok);
        if !expect_ok {
            assert_eq!(result, Err(PacketProcessError::DecryptFailed));
        }
    }

    #[test]
    fn test_tampered_packet() {
        let crypt_handler = Arc::new(CryptHandler::new());
        let decoder = PacketDecoder::new(1024, crypt_handler.clone(), Arc::new(MockDecoderCallbacks::new()));

        let packet = encrypt_client_packet(&crypt_handler, PacketType::Voice, 0, 0, b"voice data", true);
        let mut buf = BytesMut::from(&packet.mac()[..]);
        buf.extend_from_slice(packet.header());
        buf.extend_from_slice(packet.payload());
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let result = decoder.process_incoming_data(IncomingPacket::parse(buf).unwrap());
        assert_eq!(result, Err(PacketProcessError::DecryptFailed));
    }
}
