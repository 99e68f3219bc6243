/// Infers the generation (wrap count) of incoming 16 bit packet ids.
///
/// The estimator keeps the highest full id (generation << 16 | id) it has seen so far. An
///  incoming id is interpreted as the full id closest to that high water mark, i.e. it is
///  assumed to lie within half the id range (32768 packets) before or after it. That tolerates
///  both heavy loss and reordering far beyond anything UDP delivers in practice.
///
/// Ids that would map below full id 0 (old packets before the first wrap) stay in generation 0
///  and leave the high water mark untouched.
#[derive(Default, Clone, Debug)]
pub struct GenerationEstimator {
    high_water_mark: u32,
}

impl GenerationEstimator {
    const ID_RANGE: i64 = 0x1_0000;

    pub fn new() -> GenerationEstimator {
        Default::default()
    }

    pub fn reset(&mut self) {
        self.high_water_mark = 0;
    }

    pub fn set_last_state(&mut self, packet_id: u16, generation: u16) {
        self.high_water_mark = ((generation as u32) << 16) | packet_id as u32;
    }

    /// generation of the highest id seen so far
    pub fn generation(&self) -> u16 {
        (self.high_water_mark >> 16) as u16
    }

    pub fn visit_packet(&mut self, packet_id: u16) -> u16 {
        let last_id = (self.high_water_mark & 0xFFFF) as u16;
        let distance = packet_id.wrapping_sub(last_id) as i16 as i64;

        let mut estimate = self.high_water_mark as i64 + distance;
        if estimate < 0 {
            // an old packet from before the first wrap: it must not move the high water mark
            return 0;
        }
        else if estimate > u32::MAX as i64 {
            estimate -= Self::ID_RANGE;
        }

        let estimate = estimate as u32;
        if estimate > self.high_water_mark {
            self.high_water_mark = estimate;
        }
        (estimate >> 16) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;

    #[rstest]
    #[case::wrap_with_reorder(0xFF00, 1, vec![0xFFFE, 0xFFFF, 0, 1, 0xFFFC, 2], vec![1, 1, 2, 2, 1, 2])]
    #[case::start(0, 0, vec![0, 1, 2, 4, 3, 5], vec![0, 0, 0, 0, 0, 0])]
    #[case::before_first_wrap(0, 0, vec![0xFFFF, 0, 1], vec![0, 0, 0])]
    #[case::stale_ids_at_start(2, 0, vec![0xFFFE, 0xFFFF, 3, 0xFFF0, 4], vec![0, 0, 0, 0, 0])]
    #[case::wrap_from_gen0(0xFF00, 0, vec![0, 1, 2, 0xFF00, 3, 5], vec![1, 1, 1, 0, 1, 1])]
    #[case::big_jump(0x0010, 4, vec![0x7000, 0x0011, 0xE000, 0x0100], vec![4, 4, 4, 5])]
    fn test_visit_packet(#[case] last_id: u16, #[case] last_generation: u16, #[case] ids: Vec<u16>, #[case] expected: Vec<u16>) {
        let mut estimator = GenerationEstimator::new();
        estimator.set_last_state(last_id, last_generation);

        let actual = ids.iter()
            .map(|&id| estimator.visit_packet(id))
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_stale_id_keeps_high_water_mark() {
        let mut estimator = GenerationEstimator::new();
        assert_eq!(estimator.visit_packet(0xFFFF), 0);
        assert_eq!(estimator.generation(), 0);
        assert_eq!((estimator.visit_packet(0), estimator.visit_packet(1)), (0, 0));
    }

    fn sequence(len: u32, loss_percent: u32, step: u32, rng: &mut StdRng) -> Vec<(u16, u16)> {
        (0..len)
            .filter(|_| rng.gen_range(0..100) >= loss_percent)
            .map(|i| i * step)
            .map(|full| ((full & 0xFFFF) as u16, (full >> 16) as u16))
            .collect()
    }

    fn swap_elements(mut v: Vec<(u16, u16)>, percent: u32, max_distance: usize, rng: &mut StdRng) -> Vec<(u16, u16)> {
        for i in 0..v.len() - max_distance {
            if rng.gen_range(0..100) < percent {
                let offset = rng.gen_range(0..max_distance);
                v.swap(i, i + offset);
            }
        }
        v
    }

    #[rstest]
    #[case::no_loss(0, 0, 1, 1)]
    #[case::loss_10(10, 0, 1, 1)]
    #[case::loss_50(50, 0, 1, 1)]
    #[case::loss_99(99, 0, 1, 1)]
    #[case::swap_4(0, 30, 4, 1)]
    #[case::swap_200(0, 80, 200, 1)]
    #[case::step_6(0, 100, 8, 6)]
    fn test_sequences(#[case] loss_percent: u32, #[case] swap_percent: u32, #[case] max_distance: usize, #[case] step: u32) {
        let mut rng = StdRng::seed_from_u64(4711);
        let v = sequence(0x3_0000, loss_percent, step, &mut rng);
        let v = if swap_percent > 0 { swap_elements(v, swap_percent, max_distance, &mut rng) } else { v };

        let mut estimator = GenerationEstimator::new();
        for (id, expected_generation) in v {
            assert_eq!(estimator.visit_packet(id), expected_generation, "id {}", id);
        }
    }
}
