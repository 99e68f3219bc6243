use crate::packet_header::PacketType;

/// Hands out packet ids per packet type. Internally each type has a 32 bit counter: the lower
///  16 bits are the packet id that goes on the wire, the upper 16 bits are the 'generation',
///  i.e. the number of times the id wrapped around.
///
/// NB: This is not thread safe by itself - the encoder holds it under the same lock as the
///      loss statistics so that id order matches submission order
#[derive(Default)]
pub struct PacketIdManager {
    counters: [u32; PacketType::COUNT],
}

impl PacketIdManager {
    pub fn new() -> PacketIdManager {
        Default::default()
    }

    /// returns the full id (generation << 16 | packet id) and advances the counter
    pub fn generate_full_id(&mut self, packet_type: PacketType) -> u32 {
        let counter = &mut self.counters[packet_type.index()];
        let result = *counter;
        *counter = counter.wrapping_add(1);
        result
    }

    pub fn current_packet_id(&self, packet_type: PacketType) -> u16 {
        (self.counters[packet_type.index()] & 0xFFFF) as u16
    }

    pub fn current_generation(&self, packet_type: PacketType) -> u16 {
        (self.counters[packet_type.index()] >> 16) as u16
    }

    pub fn reset(&mut self) {
        self.counters = [0; PacketType::COUNT];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::start(0, 0, 0)]
    #[case::before_wrap(0xFFFF, 0xFFFF, 0)]
    #[case::wrap(0x1_0000, 0, 1)]
    #[case::later(0x3_0005, 5, 3)]
    fn test_generate_full_id(#[case] initial: u32, #[case] expected_id: u16, #[case] expected_generation: u16) {
        let mut manager = PacketIdManager::new();
        manager.counters[PacketType::Command.index()] = initial;

        let full_id = manager.generate_full_id(PacketType::Command);
        assert_eq!((full_id & 0xFFFF) as u16, expected_id);
        assert_eq!((full_id >> 16) as u16, expected_generation);
        assert_eq!(manager.counters[PacketType::Command.index()], initial + 1);
    }

    #[test]
    fn test_monotonic_across_wrap() {
        let mut manager = PacketIdManager::new();
        let mut prev_id = None;
        let mut wraps = 0;
        for _ in 0..(3 * 0x1_0000 + 17) {
            let full_id = manager.generate_full_id(PacketType::CommandLow);
            let id = (full_id & 0xFFFF) as u16;
            if let Some(prev) = prev_id {
                assert_eq!(id, u16::wrapping_add(prev, 1));
                if id == 0 {
                    wraps += 1;
                }
            }
            assert_eq!((full_id >> 16) as u16, wraps);
            prev_id = Some(id);
        }
        assert_eq!(wraps, 3);
    }

    #[test]
    fn test_types_are_independent() {
        let mut manager = PacketIdManager::new();
        manager.generate_full_id(PacketType::Command);
        manager.generate_full_id(PacketType::Command);
        assert_eq!(manager.generate_full_id(PacketType::CommandLow), 0);
        assert_eq!(manager.current_packet_id(PacketType::Command), 2);

        manager.reset();
        assert_eq!(manager.current_packet_id(PacketType::Command), 0);
        assert_eq!(manager.current_generation(PacketType::Command), 0);
    }
}
