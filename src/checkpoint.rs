//! In-process fault delivery, for targets that cannot be traced externally
//! (e.g. cross-compiled environments without ptrace).
//!
//! A target links this crate and threads a [`FaultInjectorState`] value
//! through its hot path, calling [`FaultInjectorState::checkpoint`] on the
//! variables it wants exposed to corruption. The state fires at most once
//! per run, flipping one bit of the checkpointed variable's raw bit pattern
//! once the invocation count crosses a threshold. Each call is O(1) with no
//! allocation.

use crate::controller::reseed;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Environment toggle that activates the in-process path.
pub const ENABLE_FAULT_ENV: &str = "ENABLE_FAULT";

const DEFAULT_THRESHOLD_RANGE: std::ops::Range<u64> = 10_000..60_000;

/// Numeric types whose raw bit pattern can be corrupted.
///
/// Floating-point values are flipped on their IEEE-754 bit pattern, not
/// their numeric value; integers are XORed directly.
pub trait BitPattern: Copy {
    /// Width of the raw pattern in bits.
    const WIDTH: u32;
    fn to_raw(self) -> u64;
    fn from_raw(raw: u64) -> Self;
}

impl BitPattern for f64 {
    const WIDTH: u32 = 64;
    fn to_raw(self) -> u64 {
        self.to_bits()
    }
    fn from_raw(raw: u64) -> Self {
        f64::from_bits(raw)
    }
}

impl BitPattern for f32 {
    const WIDTH: u32 = 32;
    fn to_raw(self) -> u64 {
        u64::from(self.to_bits())
    }
    fn from_raw(raw: u64) -> Self {
        f32::from_bits(raw as u32)
    }
}

impl BitPattern for u64 {
    const WIDTH: u32 = 64;
    fn to_raw(self) -> u64 {
        self
    }
    fn from_raw(raw: u64) -> Self {
        raw
    }
}

impl BitPattern for i64 {
    const WIDTH: u32 = 64;
    fn to_raw(self) -> u64 {
        self as u64
    }
    fn from_raw(raw: u64) -> Self {
        raw as i64
    }
}

impl BitPattern for u32 {
    const WIDTH: u32 = 32;
    fn to_raw(self) -> u64 {
        u64::from(self)
    }
    fn from_raw(raw: u64) -> Self {
        raw as u32
    }
}

impl BitPattern for i32 {
    const WIDTH: u32 = 32;
    fn to_raw(self) -> u64 {
        self as u32 as u64
    }
    fn from_raw(raw: u64) -> Self {
        raw as i32
    }
}

/// Explicit single-fire injection state, owned by the target's top-level
/// execution context instead of living in process-wide globals.
pub struct FaultInjectorState {
    enabled: bool,
    threshold: u64,
    invocations: u64,
    /// Bit that was flipped, once fired. `Some` blocks further injections.
    fired_bit: Option<u32>,
    rng: ChaCha8Rng,
}

impl FaultInjectorState {
    /// Initialize from the environment, as a target does once at process
    /// start: active when `ENABLE_FAULT=1`, with a threshold drawn uniformly
    /// from the default window and the RNG seeded from time ^ pid.
    pub fn from_env() -> Self {
        let enabled = std::env::var(ENABLE_FAULT_ENV).as_deref() == Ok("1");
        let mut rng = ChaCha8Rng::seed_from_u64(reseed());
        let threshold = rng.gen_range(DEFAULT_THRESHOLD_RANGE);
        Self {
            enabled,
            threshold,
            invocations: 0,
            fired_bit: None,
            rng,
        }
    }

    /// Active state with a fixed threshold and seed, for reproducible runs
    /// and tests.
    pub fn with_threshold(threshold: u64, seed: u64) -> Self {
        Self {
            enabled: true,
            threshold,
            invocations: 0,
            fired_bit: None,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Inert state; every checkpoint is a cheap no-op.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            threshold: 0,
            invocations: 0,
            fired_bit: None,
            rng: ChaCha8Rng::seed_from_u64(0),
        }
    }

    /// Expose one variable to corruption. Counts the invocation and, the
    /// first time the threshold is crossed, flips one uniformly chosen bit
    /// of the raw pattern. Returns whether this call fired.
    pub fn checkpoint<T: BitPattern>(&mut self, value: &mut T) -> bool {
        if !self.enabled || self.fired_bit.is_some() {
            return false;
        }
        self.invocations += 1;
        if self.invocations < self.threshold {
            return false;
        }
        let bit = self.rng.gen_range(0..T::WIDTH);
        *value = T::from_raw(value.to_raw() ^ (1u64 << bit));
        self.fired_bit = Some(bit);
        true
    }

    /// Whether the single allowed injection has happened.
    pub fn has_fired(&self) -> bool {
        self.fired_bit.is_some()
    }

    /// The flipped bit index, once fired.
    pub fn fired_bit(&self) -> Option<u32> {
        self.fired_bit
    }

    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_exactly_once_at_the_threshold() {
        let mut state = FaultInjectorState::with_threshold(5, 1234);
        let mut a = 1.5f64;
        let original = 1.5f64.to_bits();

        for _ in 0..4 {
            assert!(!state.checkpoint(&mut a));
            assert_eq!(a.to_bits(), original);
        }
        assert!(state.checkpoint(&mut a));
        let flipped = a.to_bits();
        assert_eq!((flipped ^ original).count_ones(), 1);
        assert_eq!(
            flipped ^ original,
            1u64 << state.fired_bit().unwrap()
        );

        // A sixth call must not change anything further.
        assert!(!state.checkpoint(&mut a));
        assert_eq!(a.to_bits(), flipped);
        assert_eq!(state.invocations(), 5);
    }

    #[test]
    fn integer_patterns_flip_within_their_width() {
        let mut state = FaultInjectorState::with_threshold(1, 7);
        let mut value = 0i32;
        assert!(state.checkpoint(&mut value));
        assert_eq!((value as u32).count_ones(), 1);
        assert!(state.fired_bit().unwrap() < 32);
    }

    #[test]
    fn disabled_state_never_counts_or_fires() {
        let mut state = FaultInjectorState::disabled();
        let mut value = 42u64;
        for _ in 0..100 {
            assert!(!state.checkpoint(&mut value));
        }
        assert_eq!(value, 42);
        assert_eq!(state.invocations(), 0);
        assert!(!state.has_fired());
    }

    #[test]
    fn from_env_threshold_is_in_the_default_window() {
        let state = FaultInjectorState::from_env();
        assert!(DEFAULT_THRESHOLD_RANGE.contains(&state.threshold()));
    }
}
