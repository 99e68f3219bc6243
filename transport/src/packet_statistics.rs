use crate::packet_header::PacketType;
use crate::safe_converter::SafeCast;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Loss tracking for packets that are received without acknowledgement (voice, pings, acks).
///
/// The last 32 packet ids are kept in a bit history (bit `n` = packet `offset - n` was
///  received), so moderately reordered packets still count as received. A packet id is
///  counted as lost once it is shifted out of the history without having arrived.
#[derive(Default, Debug)]
struct UnorderedLossCalculator {
    received: u32,
    lost: u32,
    received_total: u32,
    lost_total: u32,
    history: u32,
    history_offset: u32,
    last_short_offset: u32,
}

impl UnorderedLossCalculator {
    const HISTORY_BITS: u32 = 32;

    fn packet_received(&mut self, full_id: u32) {
        if full_id > self.history_offset {
            let age = full_id - self.history_offset;
            let shifted_out = if age >= Self::HISTORY_BITS {
                std::mem::take(&mut self.history)
            }
            else {
                let shifted_out = self.history >> (Self::HISTORY_BITS - age);
                self.history <<= age;
                shifted_out
            };

            let received = shifted_out.count_ones();
            self.add(received, age - received);

            self.history |= 1;
            self.history_offset = full_id;

            if full_id <= Self::HISTORY_BITS {
                // the history was not filled yet, so everything shifted out is noise
                self.received = 0;
                self.lost = 0;
                self.received_total = 0;
                self.lost_total = 0;
            }
        }
        else {
            let age = self.history_offset - full_id;
            if age < Self::HISTORY_BITS {
                self.history |= 1 << age;
            }
        }
    }

    fn add(&mut self, received: u32, lost: u32) {
        self.received += received;
        self.received_total += received;
        self.lost += lost;
        self.lost_total += lost;
    }

    fn short_stats(&mut self) {
        if self.history_offset.wrapping_sub(self.last_short_offset) < Self::HISTORY_BITS {
            return;
        }
        self.received /= 2;
        self.lost /= 2;
        self.last_short_offset = self.history_offset;
    }

    fn reset(&mut self) {
        *self = Default::default();
    }

    fn reset_offsets(&mut self) {
        self.history = 0;
        self.history_offset = 0;
        self.last_short_offset = 0;
    }
}

/// Loss tracking for reliably sent commands: a packet counts as lost when its slot in the
///  ack ring is reused while it still has outstanding (re)sends.
#[derive(Default, Debug)]
struct CommandLossCalculator {
    received: u32,
    lost: u32,
    received_total: u32,
    lost_total: u32,
    history_offset: u32,
    sent_since_short: u32,
    ack_counts: [u8; CommandLossCalculator::RING_LEN],
}

impl CommandLossCalculator {
    const RING_LEN: usize = 32;
    const SHORT_INTERVAL: u32 = 64;

    fn slot(full_id: u32) -> usize {
        let full_id: usize = full_id.safe_cast();
        full_id % Self::RING_LEN
    }

    fn packet_sent(&mut self, full_id: u32) {
        let slot = &mut self.ack_counts[Self::slot(full_id)];
        if full_id > self.history_offset {
            let lost = std::mem::replace(slot, 1) as u32;
            self.lost += lost;
            self.lost_total += lost;
            self.history_offset = full_id;
        }
        else {
            // resend
            *slot = slot.saturating_add(1);
        }
        self.sent_since_short += 1;
    }

    fn ack_received(&mut self, full_id: u32) {
        let slot = &mut self.ack_counts[Self::slot(full_id)];
        *slot = slot.saturating_sub(1);

        self.received += 1;
        self.received_total += 1;
    }

    fn unconfirmed(&self) -> u32 {
        self.ack_counts.iter().map(|&c| c as u32).sum()
    }

    fn short_stats(&mut self) {
        if self.sent_since_short < Self::SHORT_INTERVAL {
            return;
        }
        let factor = Self::SHORT_INTERVAL as f64 / self.sent_since_short as f64;
        self.sent_since_short = 0;
        self.received = (self.received as f64 * factor) as u32;
        self.lost = (self.lost as f64 * factor) as u32;
    }

    fn reset(&mut self) {
        *self = Default::default();
    }

    fn reset_offsets(&mut self) {
        self.history_offset = 0;
        self.sent_since_short = 0;
        self.ack_counts = [0; Self::RING_LEN];
    }
}

/// Traffic classes for per connection byte counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficCategory {
    Voice,
    Command,
    Ack,
    KeepAlive,
}

impl TrafficCategory {
    /// approximate per datagram overhead of IP and UDP headers, added to byte counts
    pub const DATAGRAM_OVERHEAD: usize = 96;

    pub fn from_type(packet_type: PacketType) -> TrafficCategory {
        match packet_type {
            PacketType::Voice | PacketType::VoiceWhisper => TrafficCategory::Voice,
            PacketType::Command | PacketType::CommandLow | PacketType::Init1 => TrafficCategory::Command,
            PacketType::Ack | PacketType::AckLow => TrafficCategory::Ack,
            PacketType::Ping | PacketType::Pong => TrafficCategory::KeepAlive,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PacketLossReport {
    pub received_voice: u32,
    pub lost_voice: u32,
    pub received_keep_alive: u32,
    pub lost_keep_alive: u32,
    pub received_control: u32,
    pub lost_control: u32,
}

impl PacketLossReport {
    pub fn received(&self) -> u32 {
        self.received_voice + self.received_keep_alive + self.received_control
    }

    pub fn lost(&self) -> u32 {
        self.lost_voice + self.lost_keep_alive + self.lost_control
    }

    /// loss ratio in `[0, 1]`
    pub fn total_loss(&self) -> f32 {
        let total = self.received() + self.lost();
        if total == 0 {
            return 0.0;
        }
        self.lost() as f32 / total as f32
    }
}

#[derive(Default)]
struct Calculators {
    command: CommandLossCalculator,
    command_low: CommandLossCalculator,
    ack: UnorderedLossCalculator,
    ack_low: UnorderedLossCalculator,
    voice: UnorderedLossCalculator,
    voice_whisper: UnorderedLossCalculator,
    ping: UnorderedLossCalculator,
    last_short: Option<Instant>,
}

/// Per connection packet loss statistics
#[derive(Default)]
pub struct PacketStatistics {
    calculators: Mutex<Calculators>,
}

impl PacketStatistics {
    const SHORT_STATS_INTERVAL: Duration = Duration::from_secs(15);

    pub fn new() -> PacketStatistics {
        Default::default()
    }

    pub fn received_packet(&self, packet_type: PacketType, full_id: u32) {
        let mut c = self.calculators.lock();
        match packet_type {
            PacketType::Voice => c.voice.packet_received(full_id),
            PacketType::VoiceWhisper => c.voice_whisper.packet_received(full_id),
            PacketType::Ack => c.ack.packet_received(full_id),
            PacketType::AckLow => c.ack_low.packet_received(full_id),
            PacketType::Ping => c.ping.packet_received(full_id),
            // commands are covered by their acknowledgements
            PacketType::Command | PacketType::CommandLow | PacketType::Pong | PacketType::Init1 => {}
        }
    }

    /// NB: must be called in id order - the encoder does this under its id lock
    pub fn send_command(&self, packet_type: PacketType, full_id: u32) {
        let mut c = self.calculators.lock();
        match packet_type {
            PacketType::Command => c.command.packet_sent(full_id),
            PacketType::CommandLow => c.command_low.packet_sent(full_id),
            _ => {}
        }
    }

    pub fn received_acknowledge(&self, ack_type: PacketType, full_id: u32) {
        let mut c = self.calculators.lock();
        match ack_type {
            PacketType::Ack => c.command.ack_received(full_id),
            PacketType::AckLow => c.command_low.ack_received(full_id),
            _ => {}
        }
    }

    pub fn loss_report(&self) -> PacketLossReport {
        let c = self.calculators.lock();
        PacketLossReport {
            received_voice: c.voice.received + c.voice_whisper.received,
            lost_voice: c.voice.lost + c.voice_whisper.lost,
            received_keep_alive: c.ping.received,
            lost_keep_alive: c.ping.lost,
            received_control: c.command.received + c.command_low.received + c.ack.received + c.ack_low.received,
            lost_control: c.command.lost + c.command_low.lost,
        }
    }

    /// like `loss_report`, but with counters that are never decayed
    pub fn total_loss_report(&self) -> PacketLossReport {
        let c = self.calculators.lock();
        PacketLossReport {
            received_voice: c.voice.received_total + c.voice_whisper.received_total,
            lost_voice: c.voice.lost_total + c.voice_whisper.lost_total,
            received_keep_alive: c.ping.received_total,
            lost_keep_alive: c.ping.lost_total,
            received_control: c.command.received_total + c.command_low.received_total + c.ack.received_total + c.ack_low.received_total,
            lost_control: c.command.lost_total + c.command_low.lost_total,
        }
    }

    pub fn current_packet_loss(&self) -> f32 {
        self.loss_report().total_loss()
    }

    /// number of sent commands for which no acknowledgement arrived yet
    pub fn unconfirmed_commands(&self) -> u32 {
        let c = self.calculators.lock();
        c.command.unconfirmed() + c.command_low.unconfirmed()
    }

    /// Decays the short term counters so the loss report reflects recent traffic
    pub fn tick(&self, now: Instant) {
        let mut c = self.calculators.lock();
        if let Some(last) = c.last_short {
            if now < last + Self::SHORT_STATS_INTERVAL {
                return;
            }
        }
        c.last_short = Some(now);

        c.command.short_stats();
        c.command_low.short_stats();
        c.ack.short_stats();
        c.ack_low.short_stats();
        c.voice.short_stats();
        c.voice_whisper.short_stats();
        c.ping.short_stats();
    }

    pub fn reset(&self) {
        let mut c = self.calculators.lock();
        c.command.reset();
        c.command_low.reset();
        c.ack.reset();
        c.ack_low.reset();
        c.voice.reset();
        c.voice_whisper.reset();
        c.ping.reset();
    }

    /// Forgets the id positions but keeps the counters, for when the peer restarts its id
    ///  sequences (i.e. on a new handshake)
    pub fn reset_offsets(&self) {
        let mut c = self.calculators.lock();
        c.command.reset_offsets();
        c.command_low.reset_offsets();
        c.ack.reset_offsets();
        c.ack_low.reset_offsets();
        c.voice.reset_offsets();
        c.voice_whisper.reset_offsets();
        c.ping.reset_offsets();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::no_loss(100, vec![], 68, 0)]
    #[case::single_loss(100, vec![50], 67, 1)]
    #[case::burst(100, vec![40, 41, 42, 43], 64, 4)]
    #[case::early_loss(100, vec![10], 67, 1)]
    #[case::loss_still_in_history(100, vec![90], 68, 0)]
    fn test_unordered_loss(#[case] count: u32, #[case] dropped: Vec<u32>, #[case] expected_received: u32, #[case] expected_lost: u32) {
        let mut calc = UnorderedLossCalculator::default();
        for id in 1..=count {
            if !dropped.contains(&id) {
                calc.packet_received(id);
            }
        }
        // ids up to 100 - 32 = 68 were shifted out of the history
        assert_eq!(calc.received + calc.lost, 68);
        assert_eq!(calc.received, expected_received);
        assert_eq!(calc.lost, expected_lost);
    }

    #[test]
    fn test_unordered_reordering_is_not_loss() {
        let mut calc = UnorderedLossCalculator::default();
        let mut ids = (1..=200u32).collect::<Vec<_>>();
        for chunk in ids.chunks_mut(4) {
            chunk.reverse();
        }
        for id in ids {
            calc.packet_received(id);
        }
        assert_eq!(calc.lost, 0);
        assert!(calc.received > 100);
    }

    #[test]
    fn test_unordered_big_gap() {
        let mut calc = UnorderedLossCalculator::default();
        for id in 1..=40 {
            calc.packet_received(id);
        }
        assert_eq!((calc.received, calc.lost), (8, 0));

        // 9..=40 leave the history as received, 41..=108 as lost
        calc.packet_received(140);
        assert_eq!((calc.received, calc.lost), (40, 68));
    }

    #[test]
    fn test_command_loss() {
        let mut calc = CommandLossCalculator::default();
        for id in 0..32 {
            calc.packet_sent(id);
            if id != 5 {
                calc.ack_received(id);
            }
        }
        assert_eq!(calc.lost, 0);
        assert_eq!(calc.unconfirmed(), 1);

        // slot of packet 5 gets reused
        for id in 32..40 {
            calc.packet_sent(id);
            calc.ack_received(id);
        }
        assert_eq!(calc.lost, 1);
        assert_eq!(calc.received, 39);
        assert_eq!(calc.unconfirmed(), 0);
    }

    #[test]
    fn test_command_resend_then_ack() {
        let mut calc = CommandLossCalculator::default();
        calc.packet_sent(1);
        calc.packet_sent(1);
        assert_eq!(calc.unconfirmed(), 2);
        calc.ack_received(1);
        calc.ack_received(1);
        calc.ack_received(1);
        assert_eq!(calc.unconfirmed(), 0);
    }

    #[test]
    fn test_report_and_reset() {
        let stats = PacketStatistics::new();
        for id in 1..=100 {
            if id % 10 != 0 {
                stats.received_packet(PacketType::Voice, id);
            }
            stats.received_packet(PacketType::Ping, id);
        }
        stats.send_command(PacketType::Command, 1);
        stats.received_acknowledge(PacketType::Ack, 1);

        let report = stats.loss_report();
        assert!(report.lost_voice > 0);
        assert_eq!(report.lost_keep_alive, 0);
        assert_eq!(report.received_control, 1);
        assert!(stats.current_packet_loss() > 0.0);

        stats.reset();
        assert_eq!(stats.loss_report(), PacketLossReport::default());
        assert_eq!(stats.current_packet_loss(), 0.0);
    }

    #[test]
    fn test_tick_decays() {
        let stats = PacketStatistics::new();
        for id in 1..=200 {
            stats.received_packet(PacketType::Ping, id);
        }
        let before = stats.loss_report().received_keep_alive;

        let now = Instant::now();
        stats.tick(now);
        let after = stats.loss_report().received_keep_alive;
        assert_eq!(after, before / 2);

        for id in 201..=300 {
            stats.received_packet(PacketType::Ping, id);
        }
        let before = stats.loss_report().received_keep_alive;
        stats.tick(now + Duration::from_secs(1));
        assert_eq!(stats.loss_report().received_keep_alive, before);

        assert_eq!(stats.total_loss_report().received_keep_alive, 268);
    }
}
