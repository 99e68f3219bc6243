//! The UDP transport of a TeamSpeak 3 compatible voice server: framing, encryption,
//!  fragmentation, acknowledgement and resending of the packets exchanged with voice clients,
//!  plus the per-connection plumbing around them (crypto setup handshake, command queue,
//!  whisper sessions, keep-alive).
//!
//! ## Packet layout
//!
//! All numbers in network byte order (BE).
//!
//! Server to client:
//! ```ascii
//! 0:  MAC (8 bytes) - the truncated EAX tag, or a fixed value for unencrypted packets
//! 8:  packet id (u16)
//! 10: type and flags (u8)
//! 11: payload
//! ```
//!
//! Client to server:
//! ```ascii
//! 0:  MAC (8 bytes)
//! 8:  packet id (u16)
//! 10: client id (u16)
//! 12: type and flags (u8)
//! 13: payload
//! ```
//!
//! The lower four bits of 'type and flags' are the packet type:
//!
//! ```ascii
//! 0 VOICE          3 COMMAND_LOW    6 ACK
//! 1 VOICE_WHISPER  4 PING           7 ACK_LOW
//! 2 COMMAND        5 PONG           8 INIT1
//! ```
//!
//! and the upper four bits are flags: 0x10 FRAGMENTED, 0x20 NEW_PROTOCOL, 0x40 COMPRESSED,
//!  0x80 UNENCRYPTED.
//!
//! Every packet type has its own 16 bit id sequence. When an id wraps, the type's 'generation'
//!  is incremented, and `generation << 16 | id` is the packet's full id. The generation is not
//!  transmitted, the receiving side infers it from the ids it has seen.
//!
//! ## Commands
//!
//! Commands are text in TeamSpeak query syntax. They are sent reliably on one of two lanes,
//!  COMMAND and COMMAND_LOW, each with its own id sequence and each acknowledged by its own
//!  acknowledgement type (ACK and ACK_LOW respectively) carrying the acknowledged id as payload.
//!  Acknowledgements are sent with UNENCRYPTED | NEW_PROTOCOL.
//!
//! A command is optionally compressed (COMPRESSED flag) and then split into fragments of at most
//!  487 bytes. The first and the last fragment of a multi-packet command carry the FRAGMENTED
//!  flag, the fragments in between don't. The receiver reassembles commands strictly in id
//!  order per lane.
//!
//! Unacknowledged packets are resent with an estimated retransmission timeout. A packet that was
//!  resent too often over too long a time causes the connection to be dropped.
//!
//! ## Encryption
//!
//! Packets are encrypted with AES-128 in EAX mode, using the header without the MAC as
//!  associated data and the 8 byte truncated tag as the packet's MAC. Key and nonce are derived
//!  per packet from the shared secret's IV, the direction, the packet type, its generation and
//!  its id.
//!
//! Until the crypto setup handshake (`clientinitiv` / `clientek`) establishes a shared secret,
//!  commands are encrypted with a fixed default key and nonce. Voice, ping and acknowledgement
//!  packets are sent unencrypted.

pub mod ack_manager;
pub mod command;
pub mod command_queue;
pub mod compression;
pub mod config;
pub mod connection;
pub mod crypt_handler;
pub mod crypt_setup;
pub mod end_point;
pub mod error;
pub mod executor;
mod fragment_ring;
pub mod generation_estimator;
pub mod packet_decoder;
pub mod packet_encoder;
pub mod packet_header;
pub mod packet_id;
pub mod packet_statistics;
pub mod ping_handler;
pub mod safe_converter;
pub mod send_pipeline;
pub mod whisper;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            // .with_max_level(Level::DEBUG)
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
