//! Single-bit fault model.
//!
//! A fault is one XOR of one bit in one register, modeling a transient
//! hardware error. Choosing the fault is random; applying it is a pure
//! function of the snapshot so a recorded fault can be replayed offline.

use crate::registers::{self, RegisterSnapshot, REGISTER_FILE, REGISTER_WIDTH};
use rand::Rng;
use std::fmt;

/// One fully determined corruption: which register slot, which bit.
///
/// Generated once per injection and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultSpec {
    /// Register slot index, `0..REGISTER_FILE`.
    pub register: usize,
    /// Bit index within the register, `0..REGISTER_WIDTH`.
    pub bit: u32,
}

impl fmt::Display for FaultSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bit {}", registers::slot_name(self.register), self.bit)
    }
}

/// Draw a fault uniformly over `register_count` register slots and `width`
/// bits.
///
/// `register_count` restricts the corruptible subset: the first 8 slots bias
/// toward operands of recently executed instructions, the full GPR file
/// serves general campaigns, and `REGISTER_FILE` additionally exposes sp and
/// pc. Control-flow registers are deliberately not excluded; studying
/// control-flow corruption is part of the fault model.
pub fn choose_fault(rng: &mut impl Rng, register_count: usize, width: u32) -> FaultSpec {
    assert!(
        register_count >= 1 && register_count <= REGISTER_FILE,
        "register subset {register_count} outside 1..={REGISTER_FILE}"
    );
    assert!(
        width >= 1 && width <= REGISTER_WIDTH,
        "register width {width} outside 1..={REGISTER_WIDTH}"
    );
    FaultSpec {
        register: rng.gen_range(0..register_count),
        bit: rng.gen_range(0..width),
    }
}

/// Apply a fault to a snapshot, returning the corrupted copy.
///
/// Pure: flips exactly one bit in exactly one register and leaves every
/// other field byte-identical. Applying the same spec twice restores the
/// original snapshot.
pub fn apply(snapshot: &RegisterSnapshot, spec: &FaultSpec) -> RegisterSnapshot {
    assert!(
        spec.register < REGISTER_FILE,
        "fault register {} outside the register file",
        spec.register
    );
    assert!(
        spec.bit < REGISTER_WIDTH,
        "fault bit {} outside the register width",
        spec.bit
    );
    let mut corrupted = *snapshot;
    corrupted.set_slot(spec.register, snapshot.slot(spec.register) ^ (1u64 << spec.bit));
    corrupted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::GPR_COUNT;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn apply_flips_exactly_one_bit() {
        let mut snapshot = RegisterSnapshot::zeroed();
        for index in 0..REGISTER_FILE {
            snapshot.set_slot(index, 0xa5a5_5a5a_ffff_0000 + index as u64);
        }
        let spec = FaultSpec {
            register: 3,
            bit: 17,
        };
        let corrupted = apply(&snapshot, &spec);
        for index in 0..REGISTER_FILE {
            let diff = snapshot.slot(index) ^ corrupted.slot(index);
            if index == spec.register {
                assert_eq!(diff, 1u64 << spec.bit);
            } else {
                assert_eq!(diff, 0);
            }
        }
        assert_eq!(snapshot.pstate(), corrupted.pstate());
    }

    #[test]
    fn apply_is_an_involution() {
        let mut snapshot = RegisterSnapshot::zeroed();
        snapshot.set_slot(1, 0x0123_4567_89ab_cdef);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..200 {
            let spec = choose_fault(&mut rng, REGISTER_FILE, REGISTER_WIDTH);
            assert_eq!(apply(&apply(&snapshot, &spec), &spec), snapshot);
        }
    }

    #[test]
    fn control_registers_are_not_excluded() {
        let mut snapshot = RegisterSnapshot::zeroed();
        snapshot.set_pc(0x40_0000);
        let spec = FaultSpec {
            register: GPR_COUNT + 1,
            bit: 2,
        };
        assert_eq!(apply(&snapshot, &spec).pc(), 0x40_0004);
    }

    #[test]
    fn choose_fault_stays_in_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..10_000 {
            let spec = choose_fault(&mut rng, 8, REGISTER_WIDTH);
            assert!(spec.register < 8);
            assert!(spec.bit < REGISTER_WIDTH);
        }
    }

    /// Pearson chi-square against the uniform expectation. Thresholds are
    /// far out in the tail (p < 1e-4) so the seeded runs stay stable.
    fn chi_square(counts: &[u64], total: u64) -> f64 {
        let expected = total as f64 / counts.len() as f64;
        counts
            .iter()
            .map(|&observed| {
                let delta = observed as f64 - expected;
                delta * delta / expected
            })
            .sum()
    }

    #[test]
    fn choose_fault_is_uniform_over_registers_and_bits() {
        const TRIALS: u64 = 10_000;
        const SUBSET: usize = 8;
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut register_counts = [0u64; SUBSET];
        let mut bit_counts = [0u64; REGISTER_WIDTH as usize];
        for _ in 0..TRIALS {
            let spec = choose_fault(&mut rng, SUBSET, REGISTER_WIDTH);
            register_counts[spec.register] += 1;
            bit_counts[spec.bit as usize] += 1;
        }
        // 7 degrees of freedom: chi2 above 30 has p < 1e-4.
        assert!(chi_square(&register_counts, TRIALS) < 30.0);
        // 63 degrees of freedom: chi2 above 120 has p < 1e-4.
        assert!(chi_square(&bit_counts, TRIALS) < 120.0);
    }
}
