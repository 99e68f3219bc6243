use crate::ack_manager::{AckListener, ResendFailure};
use crate::command_queue::{CommandHandler, CommandQueue};
use crate::config::TransportConfig;
use crate::crypt_handler::CryptHandler;
use crate::crypt_setup::{CommandHandleResult, ConnectionState, CryptSetupHandler, KeyExchange, SetupConfig, SetupTransport};
use crate::error::{CloseReason, CryptError, PacketProcessError};
use crate::executor::CommandExecutor;
use crate::packet_decoder::{DecoderCallbacks, PacketDecoder, ReassembledCommand};
use crate::packet_encoder::{EncoderCallbacks, EncoderConfig, PacketEncoder};
use crate::packet_header::{IncomingPacket, Lane, OutgoingPacket, PacketFlags, PacketType};
use crate::packet_statistics::{PacketStatistics, TrafficCategory};
use crate::ping_handler::{PingCallbacks, PingConfig, PingHandler};
use crate::whisper::{WhisperConfig, WhisperDirectory, WhisperHandler, WhisperOutcome, WhisperRouter};
#[cfg(test)] use mockall::automock;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// A client that does not continue its handshake for this long is dropped
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Time a connection gets to deliver its last words (e.g. an error response) before it is closed
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// voice sequence id (u16) + codec (u8)
const VOICE_HEADER_LEN: usize = 3;

/// The application's view of a connection's non-command traffic and its lifecycle
#[cfg_attr(test, automock)]
pub trait ConnectionListener: Send + Sync {
    fn on_voice(&self, voice_packet_id: u16, codec: u8, data: &[u8]);
    fn on_whisper(&self, voice_packet_id: u16, codec: u8, data: &[u8]);

    /// called exactly once per connection
    fn on_close(&self, reason: CloseReason);
}

/// Notifies the I/O side that a connection has packets waiting to be written
#[cfg_attr(test, automock)]
pub trait WriteScheduler: Send + Sync {
    fn schedule_write(&self, client_id: u16);
}

pub struct WhisperServices {
    /// the client's id in the audio router
    pub rtc_client_id: u32,
    pub directory: Arc<dyn WhisperDirectory>,
    pub router: Arc<dyn WhisperRouter>,
}

/// Server-wide collaborators a connection is wired to
pub struct ConnectionServices {
    pub executor: Arc<CommandExecutor>,
    pub key_exchange: Arc<dyn KeyExchange>,
    pub command_handler: Arc<dyn CommandHandler>,
    pub listener: Arc<dyn ConnectionListener>,
    pub write_scheduler: Arc<dyn WriteScheduler>,
    /// `None` if whispering is not supported for this client
    pub whisper: Option<WhisperServices>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrafficCounter {
    pub incoming_bytes: u64,
    pub outgoing_bytes: u64,
}

struct PendingClose {
    reason: CloseReason,
    deadline: Instant,
}

/// One client's voice connection: the encoder, decoder, crypto setup, command queue, ping and
///  whisper handling of a client, wired together.
///
/// There is a single close path ([VoiceConnection::close]). It runs at most once, no matter how
///  many fatal events occur, and it is the only place that notifies the [ConnectionListener] of
///  the connection's end.
pub struct VoiceConnection {
    client_id: u16,
    peer_addr: SocketAddr,
    crypt_handler: Arc<CryptHandler>,
    statistics: Arc<PacketStatistics>,
    encoder: PacketEncoder,
    decoder: PacketDecoder,
    crypt_setup: CryptSetupHandler,
    ping_handler: PingHandler,
    whisper_handler: Option<WhisperHandler>,
    command_queue: CommandQueue,
    listener: Arc<dyn ConnectionListener>,
    write_scheduler: Arc<dyn WriteScheduler>,
    traffic: Mutex<FxHashMap<TrafficCategory, TrafficCounter>>,
    pending_close: Mutex<Option<PendingClose>>,
    closed: AtomicBool,
}

impl VoiceConnection {
    pub fn new(config: &TransportConfig, client_id: u16, peer_addr: SocketAddr, services: ConnectionServices) -> Arc<VoiceConnection> {
        Arc::new_cyclic(|connection| {
            let callbacks = Arc::new(ConnectionCallbacks { connection: connection.clone() });
            let crypt_handler = Arc::new(CryptHandler::new());
            let statistics = Arc::new(PacketStatistics::new());

            VoiceConnection {
                client_id,
                peer_addr,
                encoder: PacketEncoder::new(EncoderConfig::from(config), crypt_handler.clone(), statistics.clone(), callbacks.clone()),
                decoder: PacketDecoder::new(config.max_command_size, crypt_handler.clone(), callbacks.clone()),
                crypt_setup: CryptSetupHandler::new(SetupConfig::from(config), crypt_handler.clone(), services.key_exchange, callbacks.clone()),
                ping_handler: PingHandler::new(PingConfig::from(config), callbacks),
                whisper_handler: services.whisper
                    .map(|w| WhisperHandler::new(WhisperConfig::from(config), client_id, w.rtc_client_id, w.directory, w.router)),
                command_queue: CommandQueue::new(services.executor, services.command_handler),
                listener: services.listener,
                write_scheduler: services.write_scheduler,
                crypt_handler,
                statistics,
                traffic: Default::default(),
                pending_close: Default::default(),
                closed: AtomicBool::new(false),
            }
        })
    }

    pub fn client_id(&self) -> u16 {
        self.client_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.crypt_setup.connection_state()
    }

    pub fn crypt_setup(&self) -> &CryptSetupHandler {
        &self.crypt_setup
    }

    pub fn statistics(&self) -> &PacketStatistics {
        &self.statistics
    }

    pub fn current_ping(&self) -> Option<Duration> {
        self.ping_handler.current_ping()
    }

    pub fn whisper_handler(&self) -> Option<&WhisperHandler> {
        self.whisper_handler.as_ref()
    }

    pub fn traffic(&self, category: TrafficCategory) -> TrafficCounter {
        self.traffic.lock().get(&category).copied().unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_closing(&self) -> bool {
        self.pending_close.lock().is_some()
    }

    /// Feeds a datagram that was routed to this connection through the decoder
    pub fn handle_incoming_datagram(&self, packet: IncomingPacket) {
        if self.is_closed() {
            trace!(client_id = self.client_id, "datagram for closed connection - dropping");
            return;
        }

        let wire_len = packet.payload().len() + IncomingPacket::MIN_LEN + TrafficCategory::DATAGRAM_OVERHEAD;
        self.count_traffic(TrafficCategory::from_type(packet.packet_type()), wire_len, 0);

        let error = match self.decoder.process_incoming_data(packet) {
            Ok(()) => return,
            Err(e) => e,
        };

        match &error {
            PacketProcessError::DecryptFailed | PacketProcessError::DuplicatedPacket => {
                trace!(client_id = self.client_id, "dropping packet: {}", error);
            }
            PacketProcessError::DecryptKeyGenFailed => {
                error!(client_id = self.client_id, "failed to generate decrypt key - dropping packet");
            }
            PacketProcessError::BufferOverflow(_) | PacketProcessError::BufferUnderflow(_) => {
                debug!(client_id = self.client_id, "dropping command packet: {}", error);
            }
            PacketProcessError::CommandDecompressFailed | PacketProcessError::InvalidPacket(_) => {
                warn!(client_id = self.client_id, "dropping command: {}", error);
            }
            PacketProcessError::CommandTooLarge(_) | PacketProcessError::CommandSequenceLengthTooLong => {}
        }

        if error.is_fatal() {
            warn!(client_id = self.client_id, "{} - dropping client", error);
            self.close(CloseReason::ProtocolViolation(error.to_string()));
        }
    }

    pub fn send_command(&self, command: &str, lane: Lane, ack_listener: Option<AckListener>) {
        self.encoder.send_command(command.as_bytes(), lane, ack_listener);
    }

    pub fn send_packet(&self, packet_type: PacketType, flags: PacketFlags, payload: &[u8]) -> u32 {
        self.encoder.send_packet(packet_type, flags, payload)
    }

    /// Injects a command into the command queue as if the client had sent it
    pub fn enqueue_command(&self, command: &str) {
        self.command_queue.enqueue_command_string(command);
    }

    pub fn pop_write_buffer(&self) -> Option<(Arc<OutgoingPacket>, bool)> {
        self.encoder.pop_write_buffer()
    }

    pub fn reenqueue_failed_buffer(&self, packet: Arc<OutgoingPacket>) {
        self.encoder.reenqueue_failed_buffer(packet);
    }

    pub fn has_pending_writes(&self) -> bool {
        self.encoder.has_pending_writes()
    }

    /// Blocks until everything queued was written, see [PacketEncoder::wait_empty_write_queue]
    pub fn wait_empty_write_queue(&self, deadline: Option<Instant>) -> bool {
        self.encoder.wait_empty_write_queue(deadline)
    }

    /// Periodic housekeeping: resends, keep-alive, statistics, handshake timeout and the
    ///  completion of a pending flush. Returns the next resend deadline, if any.
    pub fn tick(&self, now: Instant) -> Option<Instant> {
        if self.is_closed() {
            return None;
        }

        let next_resend = self.encoder.execute_resend(now);

        match self.crypt_setup.connection_state() {
            ConnectionState::Connected => {
                self.ping_handler.tick(now);
                self.statistics.tick(now);
            }
            ConnectionState::InitLow | ConnectionState::InitHigh => {
                if let Some(last_command) = self.crypt_setup.last_command() {
                    if now.saturating_duration_since(last_command) > HANDSHAKE_TIMEOUT {
                        debug!(client_id = self.client_id, "handshake timeout in state {:?}", self.crypt_setup.connection_state());
                        self.flush_and_close(CloseReason::Timeout, now + CLOSE_FLUSH_TIMEOUT);
                    }
                }
            }
        }

        self.check_pending_close(now);
        next_resend
    }

    /// Closes the connection once everything was written and acknowledged, or when the deadline
    ///  passes. Repeated calls can only move the deadline closer.
    pub fn flush_and_close(&self, reason: CloseReason, deadline: Instant) {
        if self.is_closed() {
            return;
        }

        {
            let mut pending = self.pending_close.lock();
            match pending.as_mut() {
                Some(pending) => pending.deadline = pending.deadline.min(deadline),
                None => {
                    debug!(client_id = self.client_id, "flushing connection before close ({})", reason);
                    *pending = Some(PendingClose { reason, deadline });
                }
            }
        }
        self.check_pending_close(Instant::now());
    }

    /// Closes the connection immediately, dropping everything that was not written yet
    pub fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            trace!(client_id = self.client_id, "connection is closed already");
            return;
        }
        info!(client_id = self.client_id, "closing connection to {:?}: {}", self.peer_addr, reason);

        self.pending_close.lock().take();
        self.command_queue.reset();
        self.encoder.reset();
        self.decoder.reset();
        self.ping_handler.reset();
        if let Some(whisper) = &self.whisper_handler {
            whisper.signal_session_reset();
            whisper.reset_session();
        }
        self.crypt_handler.reset();

        self.listener.on_close(reason);
    }

    fn is_flushed(&self) -> bool {
        !self.encoder.has_pending_writes() && self.encoder.ack_manager().awaiting_acknowledge() == 0
    }

    fn check_pending_close(&self, now: Instant) {
        let reason = {
            let pending = self.pending_close.lock();
            let Some(pending) = pending.as_ref() else {
                return;
            };

            let flushed = self.is_flushed();
            if !flushed && now <= pending.deadline {
                return;
            }

            if flushed {
                debug!(client_id = self.client_id, "connection flushed");
            }
            else {
                debug!(client_id = self.client_id, "connection flush timed out - force closing");
            }
            pending.reason.clone()
        };
        self.close(reason);
    }

    fn count_traffic(&self, category: TrafficCategory, incoming: usize, outgoing: usize) {
        let mut traffic = self.traffic.lock();
        let counter = traffic.entry(category).or_default();
        counter.incoming_bytes += incoming as u64;
        counter.outgoing_bytes += outgoing as u64;
    }

    fn handle_decoded_packet(&self, packet: IncomingPacket) {
        self.statistics.received_packet(packet.packet_type(), packet.full_packet_id());

        let now = Instant::now();
        match packet.packet_type() {
            PacketType::Voice => self.handle_voice(&packet),
            PacketType::VoiceWhisper => self.handle_whisper(&packet, now),
            PacketType::Ack | PacketType::AckLow => self.handle_acknowledge(&packet, now),
            PacketType::Ping => {
                trace!(client_id = self.client_id, "sending pong for ping {}", packet.packet_id());
                self.encoder.send_packet(PacketType::Pong, PacketFlags::UNENCRYPTED, &packet.packet_id().to_be_bytes());
            }
            PacketType::Pong => {
                if let Some(ping_id) = read_u16(packet.payload()) {
                    self.ping_handler.received_pong(ping_id, now);
                }
            }
            PacketType::Init1 => trace!(client_id = self.client_id, "init1 packet on an established connection - dropping"),
            PacketType::Command | PacketType::CommandLow => {
                error!(client_id = self.client_id, "command packet was not reassembled - dropping");
            }
        }
    }

    fn handle_voice(&self, packet: &IncomingPacket) {
        if self.connection_state() != ConnectionState::Connected {
            trace!(client_id = self.client_id, "voice before the connection is set up - dropping");
            return;
        }

        let payload = packet.payload();
        let Some(voice_packet_id) = read_u16(payload) else {
            return;
        };
        if payload.len() < VOICE_HEADER_LEN {
            return;
        }
        self.listener.on_voice(voice_packet_id, payload[2], &payload[VOICE_HEADER_LEN..]);
    }

    fn handle_whisper(&self, packet: &IncomingPacket, now: Instant) {
        if self.connection_state() != ConnectionState::Connected {
            trace!(client_id = self.client_id, "whisper before the connection is set up - dropping");
            return;
        }
        let Some(whisper_handler) = &self.whisper_handler else {
            trace!(client_id = self.client_id, "whispering is not supported - dropping");
            return;
        };

        let payload = packet.payload();
        if payload.len() < VOICE_HEADER_LEN {
            return;
        }
        let voice_packet_id = u16::from_be_bytes([payload[0], payload[1]]);
        let codec = payload[2];

        match whisper_handler.process_packet(packet.flags().contains(PacketFlags::NEW_PROTOCOL), payload, now) {
            WhisperOutcome::Forward(data) => self.listener.on_whisper(voice_packet_id, codec, data),
            WhisperOutcome::Drop => {}
            WhisperOutcome::InitializeFailed(e) => {
                self.encoder.send_command(e.build_response(None).build().as_bytes(), Lane::Normal, None);
            }
        }
    }

    fn handle_acknowledge(&self, packet: &IncomingPacket, now: Instant) {
        let Some(target_id) = read_u16(packet.payload()) else {
            return;
        };

        self.ping_handler.received_command_acknowledged(now);
        match self.encoder.ack_manager().process_acknowledge(packet.packet_type(), target_id, now) {
            Ok(full_id) => self.statistics.received_acknowledge(packet.packet_type(), full_id),
            Err(e) => debug!(client_id = self.client_id, "failed to handle acknowledge: {}", e),
        }
    }

    fn handle_decoded_command(&self, command: ReassembledCommand) {
        match self.crypt_setup.handle_command(command.command()) {
            CommandHandleResult::PassThrough => self.command_queue.enqueue_command(command),
            CommandHandleResult::ConsumeCommand => {}
            CommandHandleResult::CloseConnection(reason) => {
                self.flush_and_close(reason, Instant::now() + CLOSE_FLUSH_TIMEOUT);
            }
        }
    }
}

fn read_u16(payload: &[u8]) -> Option<u16> {
    match payload {
        [a, b, ..] => Some(u16::from_be_bytes([*a, *b])),
        _ => None,
    }
}

/// The callback side of a [VoiceConnection], as it is seen by its parts. It holds the
///  connection weakly so that the parts do not keep their owner alive.
struct ConnectionCallbacks {
    connection: Weak<VoiceConnection>,
}

impl ConnectionCallbacks {
    fn with_connection(&self, f: impl FnOnce(&VoiceConnection)) {
        if let Some(connection) = self.connection.upgrade() {
            f(&connection);
        }
    }
}

impl EncoderCallbacks for ConnectionCallbacks {
    fn request_write(&self) {
        self.with_connection(|c| {
            if !c.is_closed() {
                c.write_scheduler.schedule_write(c.client_id);
            }
        });
    }

    fn crypt_error(&self, error: CryptError) {
        self.with_connection(|c| error!(client_id = c.client_id, "failed to encrypt outgoing packet: {}", error));
    }

    fn resend_failed(&self, failure: &ResendFailure) {
        self.with_connection(|c| {
            debug!(client_id = c.client_id, "failed to resend packet {:?} {} - dropping connection", failure.packet_type, failure.full_id);
            c.close(CloseReason::Timeout);
        });
    }

    fn resend_stats(&self, resent_packets: usize) {
        self.with_connection(|c| trace!(client_id = c.client_id, "resending {} packets", resent_packets));
    }

    fn connection_stats(&self, category: TrafficCategory, bytes: usize) {
        self.with_connection(|c| c.count_traffic(category, 0, bytes));
    }
}

impl DecoderCallbacks for ConnectionCallbacks {
    fn decoded_packet(&self, packet: IncomingPacket) {
        self.with_connection(|c| c.handle_decoded_packet(packet));
    }

    fn decoded_command(&self, command: ReassembledCommand) {
        self.with_connection(|c| c.handle_decoded_command(command));
    }

    fn send_acknowledge(&self, packet_id: u16, lane: Lane) {
        self.with_connection(|c| c.encoder.send_packet_acknowledge(packet_id, lane));
    }
}

impl SetupTransport for ConnectionCallbacks {
    fn reset_for_handshake(&self) {
        self.with_connection(|c| {
            c.crypt_handler.reset();
            c.ping_handler.reset();
            c.decoder.reset();
            c.encoder.reset();
            c.decoder.register_initiv_packet();
            c.statistics.reset_offsets();
        });
    }

    fn send_command(&self, command: &str) {
        self.with_connection(|c| c.encoder.send_command(command.as_bytes(), Lane::Normal, None));
    }

    fn encrypt_pending_packets(&self) {
        self.with_connection(|c| c.encoder.encrypt_pending_packets());
    }

    fn reset_acknowledges(&self) {
        self.with_connection(|c| c.encoder.ack_manager().reset());
    }

    fn send_encrypted_acknowledge(&self, packet_id: u16) {
        self.with_connection(|c| {
            c.encoder.send_packet(PacketType::Ack, PacketFlags::NEW_PROTOCOL, &packet_id.to_be_bytes());
        });
    }
}

impl PingCallbacks for ConnectionCallbacks {
    fn send_ping(&self) -> u16 {
        self.connection.upgrade()
            .map(|c| c.encoder.send_packet(PacketType::Ping, PacketFlags::UNENCRYPTED, &[]) as u16)
            .unwrap_or_default()
    }

    fn send_recovery_command(&self) {
        self.with_connection(|c| {
            c.encoder.send_command(b"notifyconnectioninforequest invokerids=0", Lane::Normal, None);
        });
    }
}
