//! Environment abstraction for deterministic testing.
//!
//! The `Environment` trait decouples engine logic from system resources
//! (time, randomness). State machines never read the clock or entropy pool
//! directly; drivers pass instants into methods that need them, and the
//! OpenMLS provider draws its randomness through this trait.
//!
//! The environment is implemented twice:
//!
//! 1. `SimEnv` (marmot-harness): virtual clock and seeded RNG, so whole
//!    bootstrap-and-chat scenarios replay identically.
//! 2. Host environments: real clock, OS entropy.
//!
//! # Invariants
//!
//! - Monotonicity: `now()` never goes backwards within one execution.
//! - Determinism: with a seeded implementation, `random_bytes()` produces
//!   the same sequence for the same seed.

use std::time::Duration;

/// Abstract environment providing time and randomness.
///
/// `Instant` is an opaque point in time; engine code only ever compares
/// instants and subtracts them to get a `Duration`, which lets simulated
/// clocks use plain counters.
pub trait Environment: Clone + 'static {
    /// A point in time. Comparison and subtraction are all the engine
    /// needs; no arithmetic that could overflow a virtual clock.
    type Instant: Copy + Ord + std::ops::Sub<Output = Duration>;

    /// Current monotonic time.
    fn now(&self) -> Self::Instant;

    /// Current wall-clock unix time in seconds. Used only for
    /// user-visible timestamps (message `created_at`, capability
    /// windows), never for protocol ordering.
    fn unix_now(&self) -> u64;

    /// Fill `buffer` with random bytes.
    ///
    /// Production implementations MUST use cryptographically secure
    /// entropy; simulation implementations use a logged seed.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Random `u64`, for correlation ids.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Random `u128`, for session/channel tokens.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }
}
