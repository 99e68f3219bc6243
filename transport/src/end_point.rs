use crate::config::TransportConfig;
use crate::connection::{VoiceConnection, WriteScheduler};
use crate::error::CloseReason;
use crate::packet_header::IncomingPacket;
use crate::send_pipeline::{SendPipeline, SendSocket};
use anyhow::bail;
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// Clients never send datagrams anywhere near this size
const MAX_DATAGRAM_LEN: usize = 4096;

/// Receives datagrams that do not belong to a registered connection, which is how new clients
///  show up (the low-level init handshake happens before a connection is registered)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UnknownPeerHandler: Send + Sync + 'static {
    async fn on_unknown_peer(&self, from: SocketAddr, packet: IncomingPacket);
}

struct ChannelWriteScheduler {
    sender: mpsc::UnboundedSender<u16>,
}

impl WriteScheduler for ChannelWriteScheduler {
    fn schedule_write(&self, client_id: u16) {
        if self.sender.send(client_id).is_err() {
            trace!("write loop is terminated - dropping write request for client {}", client_id);
        }
    }
}

/// EndPoint is where the per-connection parts meet the network: it listens on a UdpSocket,
///  dispatching incoming datagrams to their connections by client id, writes what the
///  connections queue for sending, and drives their timers.
pub struct EndPoint {
    config: Arc<TransportConfig>,
    receive_socket: Arc<UdpSocket>,
    send_pipeline: SendPipeline,
    connections: RwLock<FxHashMap<u16, Arc<VoiceConnection>>>,
    unknown_peer_handler: Arc<dyn UnknownPeerHandler>,
    write_scheduler: Arc<ChannelWriteScheduler>,
    write_requests: Mutex<Option<mpsc::UnboundedReceiver<u16>>>,
    cancel_sender: broadcast::Sender<()>,
}

impl EndPoint {
    pub async fn new(config: Arc<TransportConfig>, unknown_peer_handler: Arc<dyn UnknownPeerHandler>) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        info!("bound voice socket to {:?}", UdpSocket::local_addr(&socket)?);

        Ok(Self::with_sockets(config, socket.clone(), Arc::new(socket), unknown_peer_handler))
    }

    pub fn with_sockets(
        config: Arc<TransportConfig>,
        receive_socket: Arc<UdpSocket>,
        send_socket: Arc<dyn SendSocket>,
        unknown_peer_handler: Arc<dyn UnknownPeerHandler>,
    ) -> EndPoint {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (cancel_sender, _) = broadcast::channel(1);

        EndPoint {
            config,
            receive_socket,
            send_pipeline: SendPipeline::new(send_socket),
            connections: Default::default(),
            unknown_peer_handler,
            write_scheduler: Arc::new(ChannelWriteScheduler { sender }),
            write_requests: Mutex::new(Some(receiver)),
            cancel_sender,
        }
    }

    pub fn self_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(UdpSocket::local_addr(&self.receive_socket)?)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// The scheduler to wire into connections that are registered with this end point
    pub fn write_scheduler(&self) -> Arc<dyn WriteScheduler> {
        self.write_scheduler.clone()
    }

    pub fn register_connection(&self, connection: Arc<VoiceConnection>) -> anyhow::Result<()> {
        let client_id = connection.client_id();
        match self.connections.write().entry(client_id) {
            Entry::Occupied(e) if !e.get().is_closed() => {
                bail!("client id {} is in use by {:?}", client_id, e.get().peer_addr());
            }
            Entry::Occupied(mut e) => {
                e.insert(connection);
            }
            Entry::Vacant(e) => {
                e.insert(connection);
            }
        }
        debug!("registered connection for client {}", client_id);
        Ok(())
    }

    pub fn remove_connection(&self, client_id: u16) -> Option<Arc<VoiceConnection>> {
        self.connections.write().remove(&client_id)
    }

    pub fn connection(&self, client_id: u16) -> Option<Arc<VoiceConnection>> {
        self.connections.read().get(&client_id).cloned()
    }

    pub fn num_connections(&self) -> usize {
        self.connections.read().len()
    }

    /// Runs the receive, write and timer loops until [EndPoint::shut_down] is called
    pub async fn run(&self) {
        tokio::join!(
            self.recv_loop(),
            self.write_loop(),
            self.tick_loop(),
        );
    }

    pub fn shut_down(&self) {
        if self.cancel_sender.send(()).is_err() {
            debug!("shutting down end point that is not running");
        }
    }

    /// Asks every connection to close once its pending data is delivered
    pub fn close_all(&self, reason: CloseReason, deadline: Instant) {
        for connection in self.snapshot() {
            connection.flush_and_close(reason.clone(), deadline);
        }
    }

    pub async fn recv_loop(&self) {
        info!("starting receive loop");
        let mut cancel_receiver = self.cancel_sender.subscribe();

        let mut buf = BytesMut::with_capacity(MAX_DATAGRAM_LEN);
        loop {
            buf.resize(MAX_DATAGRAM_LEN, 0);
            let (num_read, from) = tokio::select! {
                r = self.receive_socket.recv_from(&mut buf) => match r {
                    Ok(x) => x,
                    Err(e) => {
                        error!("socket error: {}", e);
                        continue;
                    }
                },
                _ = cancel_receiver.recv() => break,
            };
            buf.truncate(num_read);
            let datagram = buf.split();

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);
            self.on_datagram(from, datagram)
                .instrument(span)
                .await;
        }
        info!("receive loop terminated");
    }

    pub async fn on_datagram(&self, from: SocketAddr, datagram: BytesMut) {
        trace!("received {} bytes from {:?}", datagram.len(), from);

        let packet = match IncomingPacket::parse(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping datagram from {:?}: {}", from, e);
                return;
            }
        };

        match self.connection(packet.client_id()) {
            Some(connection) if connection.peer_addr() == from => connection.handle_incoming_datagram(packet),
            Some(connection) => {
                debug!("datagram for client {} from {:?}, but the client is connected from {:?} - dropping", connection.client_id(), from, connection.peer_addr());
            }
            None => self.unknown_peer_handler.on_unknown_peer(from, packet).await,
        }
    }

    pub async fn write_loop(&self) {
        let Some(mut write_requests) = self.write_requests.lock().take() else {
            error!("write loop is running already");
            return;
        };

        info!("starting write loop");
        let mut cancel_receiver = self.cancel_sender.subscribe();
        loop {
            let client_id = tokio::select! {
                r = write_requests.recv() => match r {
                    Some(client_id) => client_id,
                    None => break,
                },
                _ = cancel_receiver.recv() => break,
            };

            if let Some(connection) = self.connection(client_id) {
                self.write_connection(&connection).await;
            }
        }

        *self.write_requests.lock() = Some(write_requests);
        info!("write loop terminated");
    }

    /// Sends everything the connection has queued. A packet that can not be sent goes back to the
    ///  head of the queue, to be retried on the next write request or tick.
    async fn write_connection(&self, connection: &VoiceConnection) {
        while let Some((packet, more)) = connection.pop_write_buffer() {
            if !self.send_pipeline.send_packet(connection.peer_addr(), &packet).await {
                connection.reenqueue_failed_buffer(packet);
                break;
            }
            if !more {
                break;
            }
        }
    }

    pub async fn tick_loop(&self) {
        let mut interval = tokio::time::interval(self.config.resend.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cancel_receiver = self.cancel_sender.subscribe();

        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = cancel_receiver.recv() => break,
            }
            self.tick_connections(Instant::now());
        }
    }

    /// Runs every connection's timers and forgets connections that are closed
    pub fn tick_connections(&self, now: Instant) {
        for connection in self.snapshot() {
            connection.tick(now);
            if connection.has_pending_writes() {
                self.write_scheduler.schedule_write(connection.client_id());
            }
        }

        let removed = {
            let mut connections = self.connections.write();
            let before = connections.len();
            connections.retain(|_, c| !c.is_closed());
            before - connections.len()
        };
        if removed > 0 {
            debug!("removed {} closed connections", removed);
        }
    }

    fn snapshot(&self) -> Vec<Arc<VoiceConnection>> {
        self.connections.read().values().cloned().collect()
    }
}

impl Drop for EndPoint {
    fn drop(&mut self) {
        let connections = std::mem::take(self.connections.get_mut());
        for connection in connections.into_values() {
            if !connection.is_closed() {
                warn!("end point dropped with open connection for client {}", connection.client_id());
                connection.close(CloseReason::Server("server shutdown".to_string()));
            }
        }
    }
}
