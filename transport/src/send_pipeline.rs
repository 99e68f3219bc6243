use crate::packet_header::OutgoingPacket;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// This is an abstraction for sending a datagram on a UDP socket, introduced to facilitate
///  mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    /// Returns `false` if the datagram could not be handed to the OS
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> bool;

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> bool {
        trace!("UDP socket: sending {} bytes to {:?}", packet_buf.len(), to);

        match self.send_to(packet_buf, to).await {
            Ok(_) => true,
            Err(e) => {
                error!("error sending UDP packet to {:?}: {}", to, e);
                false
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
    }
}


/// Puts a connection's encrypted packets on the wire
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>) -> SendPipeline {
        SendPipeline { socket }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub async fn send_packet(&self, to: SocketAddr, packet: &OutgoingPacket) -> bool {
        let wire = packet.to_wire();
        trace!("sending {:?} ({} bytes on the wire)", packet, wire.len());
        self.socket.do_send_packet(to, &wire).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_header::{PacketFlags, PacketType};

    #[tokio::test]
    async fn test_send_packet() {
        let packet = OutgoingPacket::new(PacketType::Pong, PacketFlags::UNENCRYPTED, 3, 0, vec![0, 7]);
        let expected = packet.to_wire().to_vec();

        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet()
            .once()
            .withf(move |addr, buf|
                addr == &SocketAddr::from(([1, 2, 3, 4], 9)) &&
                    buf == expected.as_slice()
            )
            .returning(|_, _| true);

        let pipeline = SendPipeline::new(Arc::new(socket));
        assert!(pipeline.send_packet(SocketAddr::from(([1, 2, 3, 4], 9)), &packet).await);
    }

    #[tokio::test]
    async fn test_send_failure_is_reported() {
        let packet = OutgoingPacket::new(PacketType::Ping, PacketFlags::UNENCRYPTED, 1, 0, vec![]);

        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet()
            .once()
            .returning(|_, _| false);

        let pipeline = SendPipeline::new(Arc::new(socket));
        assert!(!pipeline.send_packet(SocketAddr::from(([1, 2, 3, 4], 9)), &packet).await);
    }
}
