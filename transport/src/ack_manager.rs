use crate::config::ResendConfig;
use crate::packet_header::{Lane, OutgoingPacket, PacketType};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Called exactly once per reliably sent command: `true` when its last fragment was
///  acknowledged, `false` when the packet was dropped (reset or resend failure).
pub type AckListener = Box<dyn FnOnce(bool) + Send>;

struct AckEntry {
    packet_type: PacketType,
    full_id: u32,
    packet: Arc<OutgoingPacket>,
    resend_count: u32,
    first_send: Instant,
    next_resend: Instant,
    listener: Option<AckListener>,
}

/// A packet whose resend deadline elapsed and that should be put on the wire again
pub struct ResendRequest {
    pub packet_type: PacketType,
    pub full_id: u32,
    pub packet: Arc<OutgoingPacket>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResendFailure {
    pub packet_type: PacketType,
    pub full_id: u32,
    pub resend_count: u32,
}

#[derive(Default)]
pub struct ResendBatch {
    pub resend: Vec<ResendRequest>,
    pub failed: Vec<ResendFailure>,
    /// the earliest deadline of the entries that are still pending
    pub next_deadline: Option<Instant>,
}

/// Smoothed round trip time estimation (RFC 6298 style) that drives the resend timeout
struct RtoCalculator {
    srtt: Option<f64>,
    rttvar: f64,
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
    initial_rto: Duration,
}

impl RtoCalculator {
    const ALPHA: f64 = 1.0 / 8.0;
    const BETA: f64 = 1.0 / 4.0;

    fn new(config: &ResendConfig) -> RtoCalculator {
        RtoCalculator {
            srtt: None,
            rttvar: 0.0,
            rto: config.initial_rto,
            min_rto: config.min_rto,
            max_rto: config.max_interval,
            initial_rto: config.initial_rto,
        }
    }

    fn reset(&mut self) {
        self.srtt = None;
        self.rttvar = 0.0;
        self.rto = self.initial_rto;
    }

    fn update(&mut self, sample: Duration) {
        let r = sample.as_secs_f64();
        let srtt = match self.srtt {
            None => {
                self.rttvar = r / 2.0;
                r
            }
            Some(srtt) => {
                self.rttvar = (1.0 - Self::BETA) * self.rttvar + Self::BETA * (srtt - r).abs();
                (1.0 - Self::ALPHA) * srtt + Self::ALPHA * r
            }
        };
        self.srtt = Some(srtt);

        let rto = Duration::from_secs_f64(srtt + 4.0 * self.rttvar);
        self.rto = rto.clamp(self.min_rto, self.max_rto);
    }
}

struct AckManagerInner {
    /// newest entries first
    entries: VecDeque<AckEntry>,
    rto: RtoCalculator,
}

/// Keeps track of reliably sent packets until they are acknowledged, and decides when they are
///  due for resending - or when resending has failed for good.
pub struct AcknowledgeManager {
    config: ResendConfig,
    inner: Mutex<AckManagerInner>,
}

impl AcknowledgeManager {
    pub fn new(config: ResendConfig) -> AcknowledgeManager {
        AcknowledgeManager {
            inner: Mutex::new(AckManagerInner {
                entries: VecDeque::new(),
                rto: RtoCalculator::new(&config),
            }),
            config,
        }
    }

    pub fn current_rto(&self) -> Duration {
        self.inner.lock().rto.rto
    }

    pub fn awaiting_acknowledge(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Drops all pending entries, notifying their listeners of the failure
    pub fn reset(&self) {
        let entries = {
            let mut inner = self.inner.lock();
            inner.rto.reset();
            std::mem::take(&mut inner.entries)
        };

        if !entries.is_empty() {
            debug!("dropping {} unacknowledged packets", entries.len());
        }
        for entry in entries {
            if let Some(listener) = entry.listener {
                listener(false);
            }
        }
    }

    pub fn process_packet(&self, packet_type: PacketType, full_id: u32, packet: Arc<OutgoingPacket>, listener: Option<AckListener>, now: Instant) {
        let mut inner = self.inner.lock();
        let next_resend = now + inner.rto.rto;
        inner.entries.push_front(AckEntry {
            packet_type,
            full_id,
            packet,
            resend_count: 0,
            first_send: now,
            next_resend,
            listener,
        });
    }

    /// Retires the newest entry of the acknowledged lane whose packet id matches. Returns an
    ///  error for spurious or duplicate acknowledgements, which callers should log and ignore.
    pub fn process_acknowledge(&self, ack_type: PacketType, packet_id: u16, now: Instant) -> anyhow::Result<u32> {
        let target_type = if ack_type == PacketType::AckLow { Lane::Low } else { Lane::Normal }
            .command_type();

        let entry = {
            let mut inner = self.inner.lock();
            let position = inner.entries.iter()
                .position(|e| e.packet_type == target_type && (e.full_id & 0xFFFF) as u16 == packet_id);

            let Some(entry) = position.and_then(|p| inner.entries.remove(p)) else {
                anyhow::bail!("Missing packet id ({})", packet_id);
            };
            if entry.resend_count == 0 {
                // Karn: only unambiguous samples
                inner.rto.update(now.saturating_duration_since(entry.first_send));
            }
            entry
        };

        trace!("packet {:?} {} acknowledged", entry.packet_type, entry.full_id);
        if let Some(listener) = entry.listener {
            listener(true);
        }
        Ok(entry.full_id)
    }

    /// Collects the entries whose resend deadline has elapsed. Entries that exceeded the resend
    ///  budget are removed and reported as failed instead, their listeners are notified.
    ///
    /// NB: The resend counter is *not* incremented here - the encoder does that via
    ///      `register_resent` for the packets it actually re-enqueued
    pub fn execute_resend(&self, now: Instant) -> ResendBatch {
        let mut batch = ResendBatch::default();
        let mut failed_entries = Vec::new();

        {
            let mut inner = self.inner.lock();
            let resend_interval = inner.rto.rto.min(self.config.max_interval);

            let mut idx = 0;
            while idx < inner.entries.len() {
                let entry = &mut inner.entries[idx];
                if entry.next_resend <= now {
                    if entry.resend_count > self.config.max_count && entry.first_send + self.config.timeout < now {
                        if let Some(entry) = inner.entries.remove(idx) {
                            failed_entries.push(entry);
                        }
                        continue;
                    }

                    entry.next_resend = now + resend_interval;
                    batch.resend.push(ResendRequest {
                        packet_type: entry.packet_type,
                        full_id: entry.full_id,
                        packet: entry.packet.clone(),
                    });
                }

                let deadline = entry.next_resend;
                batch.next_deadline = Some(batch.next_deadline.map_or(deadline, |d| d.min(deadline)));
                idx += 1;
            }
        }

        for entry in failed_entries {
            debug!("resend of packet {:?} {} failed after {} attempts", entry.packet_type, entry.full_id, entry.resend_count);
            batch.failed.push(ResendFailure {
                packet_type: entry.packet_type,
                full_id: entry.full_id,
                resend_count: entry.resend_count,
            });
            if let Some(listener) = entry.listener {
                listener(false);
            }
        }

        batch
    }

    pub fn register_resent(&self, packet_type: PacketType, full_id: u32) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.packet_type == packet_type && e.full_id == full_id) {
            entry.resend_count += 1;
        }
    }
}
