use crate::ack_manager::{AckListener, AcknowledgeManager, ResendFailure};
use crate::compression;
use crate::config::{ResendConfig, TransportConfig};
use crate::crypt_handler::{CryptHandler, DEFAULT_KEY, DEFAULT_NONCE};
use crate::error::CryptError;
use crate::packet_header::{full_packet_id, Lane, OutgoingPacket, PacketFlags, PacketType};
use crate::packet_id::PacketIdManager;
use crate::packet_statistics::{PacketStatistics, TrafficCategory};
#[cfg(test)] use mockall::automock;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, trace};

/// The encoder's view of its connection
#[cfg_attr(test, automock)]
pub trait EncoderCallbacks: Send + Sync {
    /// there is data in the write queues, the transport should call `pop_write_buffer`
    fn request_write(&self);
    /// a packet could not be encrypted and was dropped
    fn crypt_error(&self, error: CryptError);
    /// a reliable packet was never acknowledged, which is a connection timeout
    fn resend_failed(&self, failure: &ResendFailure);
    fn resend_stats(&self, resent_packets: usize);
    fn connection_stats(&self, category: TrafficCategory, bytes: usize);
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub max_fragment_payload: usize,
    pub compression_threshold: usize,
    pub resend: ResendConfig,
}

impl From<&TransportConfig> for EncoderConfig {
    fn from(config: &TransportConfig) -> Self {
        EncoderConfig {
            max_fragment_payload: config.max_fragment_payload,
            compression_threshold: config.compression_threshold,
            resend: config.resend.clone(),
        }
    }
}

#[derive(Default)]
struct WriteQueues {
    /// framed packets that still need to be encrypted
    encrypt: VecDeque<Arc<OutgoingPacket>>,
    /// encrypted packets, ready to go on the wire
    send: VecDeque<Arc<OutgoingPacket>>,
    /// incremented by every `reset()`, so that resends collected before a reset are discarded
    reset_count: u64,
}

impl WriteQueues {
    fn has_more(&self) -> bool {
        !self.send.is_empty() || !self.encrypt.is_empty()
    }
}

/// Turns outgoing payloads and commands into encrypted wire packets.
///
/// Packets pass through two queues: they are appended to the *encrypt* queue when they are
///  framed, and move to the *send* queue once they are encrypted. Writers drain the send queue
///  first, encrypting packets from the encrypt queue lazily when the send queue is empty.
///
/// Reliable command packets are additionally registered with the acknowledge manager, which
///  shares ownership of the packet until it is acknowledged. A packet is never in more than one
///  queue at a time (see `OutgoingPacket::mark_queued`), so a resend of a packet that is still
///  waiting to be written is skipped.
pub struct PacketEncoder {
    config: EncoderConfig,
    crypt_handler: Arc<CryptHandler>,
    statistics: Arc<PacketStatistics>,
    callbacks: Arc<dyn EncoderCallbacks>,
    ack_manager: AcknowledgeManager,
    /// NB: id assignment, loss statistics, ack registration and enqueueing happen together
    ///      under this lock, so packets of a type are queued in id order. Lock order is
    ///      `packet_ids` before the ack manager before `queues`.
    packet_ids: Mutex<PacketIdManager>,
    queues: Mutex<WriteQueues>,
    /// notified whenever the write queues become empty
    writes_drained: Condvar,
}

impl PacketEncoder {
    pub fn new(config: EncoderConfig, crypt_handler: Arc<CryptHandler>, statistics: Arc<PacketStatistics>, callbacks: Arc<dyn EncoderCallbacks>) -> PacketEncoder {
        PacketEncoder {
            ack_manager: AcknowledgeManager::new(config.resend.clone()),
            config,
            crypt_handler,
            statistics,
            callbacks,
            packet_ids: Default::default(),
            queues: Default::default(),
            writes_drained: Condvar::new(),
        }
    }

    pub fn ack_manager(&self) -> &AcknowledgeManager {
        &self.ack_manager
    }

    /// Drops everything that was not written yet, and all pending acknowledgements
    pub fn reset(&self) {
        self.ack_manager.reset();

        let (encrypt, send) = {
            let mut queues = self.queues.lock();
            queues.reset_count += 1;
            (std::mem::take(&mut queues.encrypt), std::mem::take(&mut queues.send))
        };
        for packet in encrypt.iter().chain(send.iter()) {
            packet.mark_dequeued();
        }
        self.writes_drained.notify_all();
    }

    /// Frames and queues a single unfragmented packet, returning its full id
    pub fn send_packet(&self, packet_type: PacketType, flags: PacketFlags, payload: &[u8]) -> u32 {
        let (full_id, packet_len) = {
            let mut packet_ids = self.packet_ids.lock();
            let full_id = packet_ids.generate_full_id(packet_type);
            let packet = Arc::new(OutgoingPacket::new(packet_type, flags, full_id as u16, (full_id >> 16) as u16, payload.to_vec()));
            trace!("framed {:?}", packet);
            let packet_len = packet.packet_len();

            let mut queues = self.queues.lock();
            packet.mark_queued();
            queues.encrypt.push_back(packet);
            (full_id, packet_len)
        };

        self.callbacks.connection_stats(TrafficCategory::from_type(packet_type), packet_len + TrafficCategory::DATAGRAM_OVERHEAD);
        self.callbacks.request_write();
        full_id
    }

    pub fn send_packet_acknowledge(&self, packet_id: u16, lane: Lane) {
        self.send_packet(lane.ack_type(), PacketFlags::UNENCRYPTED | PacketFlags::NEW_PROTOCOL, &packet_id.to_be_bytes());
    }

    /// Sends a command reliably: compressed if that pays off, split into fragments if it is too
    ///  long for a single packet. The listener is notified when the *last* fragment is
    ///  acknowledged, or when delivery fails.
    pub fn send_command(&self, command: &[u8], lane: Lane, ack_listener: Option<AckListener>) {
        let packet_type = lane.command_type();

        let mut head_flags = PacketFlags::empty();
        let compressed = if command.len() > self.config.compression_threshold {
            match compression::compress_if_smaller(command) {
                Ok(compressed) => compressed,
                Err(e) => {
                    error!("failed to compress command, dropping it: {}", e);
                    if let Some(listener) = ack_listener {
                        listener(false);
                    }
                    return;
                }
            }
        }
        else {
            None
        };
        let data = match &compressed {
            Some(compressed) => {
                head_flags |= PacketFlags::COMPRESSED;
                compressed.as_slice()
            }
            None => command,
        };

        let chunks = self.split_fragments(data);
        let num_chunks = chunks.len();

        let packets = {
            let mut packet_ids = self.packet_ids.lock();
            let packets = chunks.into_iter()
                .enumerate()
                .map(|(idx, chunk)| {
                    let mut flags = PacketFlags::NEW_PROTOCOL;
                    if idx == 0 {
                        flags |= head_flags;
                    }
                    if num_chunks > 1 && (idx == 0 || idx == num_chunks - 1) {
                        flags |= PacketFlags::FRAGMENTED;
                    }

                    let full_id = packet_ids.generate_full_id(packet_type);
                    self.statistics.send_command(packet_type, full_id);
                    Arc::new(OutgoingPacket::new(packet_type, flags, full_id as u16, (full_id >> 16) as u16, chunk.to_vec()))
                })
                .collect::<Vec<_>>();

            let now = Instant::now();
            let mut ack_listener = ack_listener;
            for (idx, packet) in packets.iter().enumerate() {
                let listener = if idx == num_chunks - 1 { ack_listener.take() } else { None };
                self.ack_manager.process_packet(packet_type, packet.full_id(), packet.clone(), listener, now);
            }

            let mut queues = self.queues.lock();
            for packet in &packets {
                packet.mark_queued();
                queues.encrypt.push_back(packet.clone());
            }
            packets
        };
        trace!("command of {} bytes ({} on the wire) framed into {} packets", command.len(), data.len(), packets.len());

        for packet in &packets {
            self.callbacks.connection_stats(TrafficCategory::Command, packet.packet_len() + TrafficCategory::DATAGRAM_OVERHEAD);
        }
        self.callbacks.request_write();
    }

    /// `ceil(len / max)` chunks of roughly equal size
    fn split_fragments<'a>(&self, data: &'a [u8]) -> Vec<&'a [u8]> {
        if data.len() <= self.config.max_fragment_payload {
            return vec![data];
        }

        let chunk_count = data.len().div_ceil(self.config.max_fragment_payload);
        let chunk_size = data.len().div_ceil(chunk_count);
        data.chunks(chunk_size).collect()
    }

    /// Encrypts all packets in the encrypt queue with the crypto state that is current *now*,
    ///  moving them to the send queue.
    pub fn encrypt_pending_packets(&self) {
        let pending = std::mem::take(&mut self.queues.lock().encrypt);
        if pending.is_empty() {
            return;
        }

        let mut encrypted = Vec::with_capacity(pending.len());
        for packet in pending {
            if self.encrypt_outgoing_packet(&packet) {
                encrypted.push(packet);
            }
            else {
                packet.mark_dequeued();
            }
        }

        self.queues.lock().send.extend(encrypted);
    }

    /// Encrypts a packet unless it is already encrypted. Failures are reported to the callbacks,
    ///  and the packet must not be sent.
    fn encrypt_outgoing_packet(&self, packet: &OutgoingPacket) -> bool {
        let header = packet.header();
        let flags = packet.flags();

        let result = packet.with_wire(|wire| {
            if wire.encrypted {
                return Ok(());
            }

            if flags.contains(PacketFlags::UNENCRYPTED) {
                wire.mac = self.crypt_handler.current_mac();
            }
            else {
                let (key, nonce) = if self.crypt_handler.encryption_initialized() {
                    self.crypt_handler.generate_key_nonce(false, packet.packet_type() as u8, packet.packet_id(), packet.generation())?
                }
                else {
                    (DEFAULT_KEY, DEFAULT_NONCE)
                };
                wire.mac = self.crypt_handler.encrypt(&header, &mut wire.payload, &key, &nonce)?;
            }
            wire.encrypted = true;
            Ok(())
        });

        match result {
            Ok(()) => true,
            Err(e) => {
                error!("failed to encrypt {:?}, dropping it: {}", packet, e);
                self.callbacks.crypt_error(e);
                false
            }
        }
    }

    /// Takes the next packet to write, together with a flag whether there are more
    pub fn pop_write_buffer(&self) -> Option<(Arc<OutgoingPacket>, bool)> {
        loop {
            let (packet, more) = {
                let mut queues = self.queues.lock();
                let packet = match queues.send.pop_front() {
                    Some(packet) => packet,
                    None => queues.encrypt.pop_front()?,
                };
                packet.mark_dequeued();
                let more = queues.has_more();
                if !more {
                    self.writes_drained.notify_all();
                }
                (packet, more)
            };

            if self.encrypt_outgoing_packet(&packet) {
                return Some((packet, more));
            }
            if !more {
                return None;
            }
        }
    }

    /// Puts a packet that could not be written back at the head of the send queue
    pub fn reenqueue_failed_buffer(&self, packet: Arc<OutgoingPacket>) {
        let mut queues = self.queues.lock();
        if !packet.mark_queued() {
            return;
        }
        queues.send.push_front(packet);
    }

    pub fn has_pending_writes(&self) -> bool {
        self.queues.lock().has_more()
    }

    /// Re-enqueues unacknowledged packets whose resend is due, returning the next resend
    ///  deadline if any packets are still waiting for their acknowledgement
    pub fn execute_resend(&self, now: Instant) -> Option<Instant> {
        let reset_count = self.queues.lock().reset_count;
        let batch = self.ack_manager.execute_resend(now);

        for failure in &batch.failed {
            self.callbacks.resend_failed(failure);
        }

        if !batch.resend.is_empty() {
            let mut resent = Vec::with_capacity(batch.resend.len());
            {
                let mut queues = self.queues.lock();
                if queues.reset_count != reset_count {
                    // e.g. the connection was closed by a failed resend of this very batch
                    debug!("encoder was reset - discarding {} due resends", batch.resend.len());
                    return None;
                }
                for request in &batch.resend {
                    // still waiting in one of the queues
                    if !request.packet.mark_queued() {
                        continue;
                    }
                    queues.send.push_back(request.packet.clone());
                    self.statistics.send_command(request.packet_type, request.full_id);
                    resent.push((request.packet_type, request.full_id));
                }
            }

            for (packet_type, full_id) in &resent {
                self.ack_manager.register_resent(*packet_type, *full_id);
            }
            debug!("resending {} of {} due packets", resent.len(), batch.resend.len());

            self.callbacks.request_write();
            self.callbacks.resend_stats(batch.resend.len());
        }

        batch.next_deadline
    }

    /// Blocks until both write queues are empty, or the deadline passes. Returns `false` on
    ///  timeout.
    pub fn wait_empty_write_queue(&self, deadline: Option<Instant>) -> bool {
        let mut queues = self.queues.lock();
        while queues.has_more() {
            match deadline {
                Some(deadline) => {
                    if self.writes_drained.wait_until(&mut queues, deadline).timed_out() {
                        return !queues.has_more();
                    }
                }
                None => self.writes_drained.wait(&mut queues),
            }
        }
        true
    }

    pub fn current_packet_id(&self, packet_type: PacketType) -> u32 {
        let packet_ids = self.packet_ids.lock();
        full_packet_id(packet_ids.current_generation(packet_type), packet_ids.current_packet_id(packet_type))
    }
}
