use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use anyhow::bail;

pub struct TransportConfig {
    pub bind_addr: SocketAddr,

    /// Number of OS threads in the command executor pool. These threads run the (blocking)
    ///  command handlers of all connections, so this should be in the order of magnitude
    ///  of available cores rather than the number of connections.
    pub executor_threads: usize,

    /// Maximum payload of a single command fragment. Commands with a longer (possibly
    ///  compressed) payload are split into fragments of roughly equal size.
    ///
    /// Clients rely on this value, so changing it is for testing only.
    pub max_fragment_payload: usize,

    /// Commands up to this length are sent uncompressed without even trying
    pub compression_threshold: usize,

    /// Upper limit for the size of a reassembled (and decompressed) incoming command. Clients
    ///  exceeding this are disconnected.
    pub max_command_size: usize,

    pub resend: ResendConfig,

    pub ping_interval: Duration,
    /// If no pong arrives for this long, the connection is asked to recover
    pub ping_timeout: Duration,

    /// An established whisper session is re-resolved after this interval even if the
    ///  whisper header did not change
    pub whisper_refresh: Duration,
    /// A failed whisper resolution is not retried within this interval unless the header changes
    pub whisper_retry: Duration,
    pub max_whisper_targets: usize,

    /// accept clients that do not announce themselves as TeaSpeak clients
    pub allow_legacy_clients: bool,
    /// offer the licensed (`initivexpand2`) handshake to clients that support it
    pub licensed_protocol: bool,
}

impl TransportConfig {
    /// The protocol defaults as clients expect them, listening on the well-known voice port
    pub fn default_ipv4() -> TransportConfig {
        TransportConfig {
            bind_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 9987)),
            executor_threads: 4,
            max_fragment_payload: 487,
            compression_threshold: 100,
            max_command_size: 64 * 1024 * 1024,
            resend: ResendConfig::default(),
            ping_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(15),
            whisper_refresh: Duration::from_secs(5),
            whisper_retry: Duration::from_millis(500),
            max_whisper_targets: 1024,
            allow_legacy_clients: true,
            licensed_protocol: true,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.executor_threads == 0 {
            bail!("at least one executor thread is required");
        }
        if self.max_fragment_payload < 16 {
            bail!("fragment payload is too small");
        }
        if self.max_command_size < self.max_fragment_payload {
            bail!("maximum command size must be at least one fragment");
        }
        if self.max_whisper_targets == 0 {
            bail!("maximum whisper target count must be positive");
        }
        self.resend.validate()?;

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ResendConfig {
    /// interval of the timer that checks for unacknowledged packets
    pub tick: Duration,
    pub initial_rto: Duration,
    pub min_rto: Duration,
    /// upper bound for the interval between two resends of the same packet
    pub max_interval: Duration,
    /// A packet fails only if it was resent more than `max_count` times *and* its first send
    ///  is more than `timeout` ago
    pub max_count: u32,
    pub timeout: Duration,
}

impl Default for ResendConfig {
    fn default() -> Self {
        ResendConfig {
            tick: Duration::from_millis(100),
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(50),
            max_interval: Duration::from_millis(1500),
            max_count: 15,
            timeout: Duration::from_secs(15),
        }
    }
}

impl ResendConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick.is_zero() {
            bail!("resend tick must be positive");
        }
        if self.min_rto > self.max_interval {
            bail!("minimum RTO exceeds the maximum resend interval");
        }
        if self.initial_rto < self.min_rto {
            bail!("initial RTO is below the minimum RTO");
        }
        Ok(())
    }
}
