//! Purpose: Map between logical stream positions and (term id, partition, term offset).
//! Exports: `partition_index`, `next_partition_index`, `position_bits_to_shift`,
//! `compute_term_begin_position`, `compute_position`, `compute_term_id_from_position`,
//! `compute_term_offset_from_position`, `compute_max_possible_position`.
//! Role: Pure arithmetic shared by the publication and any reader of the log.
//! Invariants: Term length is a power of two; results for other lengths are meaningless.
//! Invariants: Term ids wrap as `i32`; the term count relative to the initial term id does not.
use crate::core::descriptor::PARTITION_COUNT;

pub fn partition_index(term_id: i32, initial_term_id: i32) -> usize {
    let term_count = term_id.wrapping_sub(initial_term_id) as i64;
    term_count.rem_euclid(PARTITION_COUNT as i64) as usize
}

pub fn next_partition_index(index: usize) -> usize {
    (index + 1) % PARTITION_COUNT
}

pub fn position_bits_to_shift(term_length: usize) -> u32 {
    debug_assert!(term_length.is_power_of_two());
    term_length.trailing_zeros()
}

pub fn compute_term_begin_position(
    term_id: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    let term_count = term_id.wrapping_sub(initial_term_id) as i64;
    term_count << position_bits_to_shift
}

pub fn compute_position(
    term_id: i32,
    term_offset: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    compute_term_begin_position(term_id, position_bits_to_shift, initial_term_id)
        + term_offset as i64
}

pub fn compute_term_id_from_position(
    position: i64,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i32 {
    ((position >> position_bits_to_shift) as i32).wrapping_add(initial_term_id)
}

pub fn compute_term_offset_from_position(position: i64, position_bits_to_shift: u32) -> i32 {
    let mask = (1i64 << position_bits_to_shift) - 1;
    (position & mask) as i32
}

/// Highest position before the term count overflows `i32`.
pub fn compute_max_possible_position(term_length: usize) -> i64 {
    (term_length as i64) << 31
}

#[cfg(test)]
mod tests {
    use super::{
        compute_max_possible_position, compute_position, compute_term_begin_position,
        compute_term_id_from_position, compute_term_offset_from_position, next_partition_index,
        partition_index, position_bits_to_shift,
    };

    struct XorShift64 {
        state: u64,
    }

    impl XorShift64 {
        fn new(seed: u64) -> Self {
            Self { state: seed }
        }

        fn next_u64(&mut self) -> u64 {
            let mut x = self.state;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.state = x;
            x
        }

        fn next_i32(&mut self) -> i32 {
            self.next_u64() as i32
        }
    }

    #[test]
    fn partition_index_cycles_through_three() {
        let initial = 100;
        let indexes: Vec<usize> = (0..7).map(|n| partition_index(initial + n, initial)).collect();
        assert_eq!(indexes, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(next_partition_index(2), 0);
    }

    #[test]
    fn partition_index_handles_term_id_wrap() {
        let initial = i32::MAX - 1;
        assert_eq!(partition_index(initial, initial), 0);
        assert_eq!(partition_index(i32::MAX, initial), 1);
        assert_eq!(partition_index(i32::MIN, initial), 2);
        assert_eq!(partition_index(i32::MIN + 1, initial), 0);
    }

    #[test]
    fn positions_for_known_terms() {
        let shift = position_bits_to_shift(65_536);
        assert_eq!(shift, 16);
        assert_eq!(compute_term_begin_position(5, shift, 5), 0);
        assert_eq!(compute_term_begin_position(7, shift, 5), 131_072);
        assert_eq!(compute_position(7, 96, shift, 5), 131_168);
        assert_eq!(compute_term_id_from_position(131_168, shift, 5), 7);
        assert_eq!(compute_term_offset_from_position(131_168, shift), 96);
    }

    #[test]
    fn max_possible_position_scales_with_term_length() {
        assert_eq!(compute_max_possible_position(65_536), 65_536i64 << 31);
    }

    #[test]
    fn prop_position_round_trips() {
        let seeds = [1u64, 7, 42, 99, 0xDEAD_BEEF];
        for seed in seeds {
            let mut rng = XorShift64::new(seed);
            for _ in 0..1_000 {
                let shift = 16 + (rng.next_u64() % 15) as u32;
                let term_length = 1i64 << shift;
                let initial_term_id = rng.next_i32();
                let term_count = (rng.next_u64() % (1 << 31)) as i32;
                let term_id = initial_term_id.wrapping_add(term_count);
                let term_offset = (rng.next_u64() % term_length as u64) as i32;

                let position = compute_position(term_id, term_offset, shift, initial_term_id);
                assert!(position >= 0);
                assert_eq!(
                    compute_term_id_from_position(position, shift, initial_term_id),
                    term_id
                );
                assert_eq!(compute_term_offset_from_position(position, shift), term_offset);
                assert_eq!(
                    compute_term_begin_position(term_id, shift, initial_term_id) + term_offset as i64,
                    position
                );
            }
        }
    }
}
