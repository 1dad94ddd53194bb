//! Counter-based random generation for dropout masks.
//!
//! Masks are drawn from Philox-4x32-10, keyed by a 64-bit seed. Every element
//! owns its own counter block `(offset, element index)`, so a mask is a pure
//! function of `(seed, offset, index)` and no sequential RNG state exists on
//! the kernel side. The only mutable piece is the generator offset: each
//! forward call consumes `increment` positions of the stream and the offset
//! moves past them, which keeps successive calls on disjoint sub-streams.
//!
//! [`GeneratorState`] is a plain value whose [`GeneratorState::advance`]
//! returns the next state. [`Generator`] wraps one in a shared handle for
//! callers that want a process-wide default; both implement
//! [`OffsetGenerator`], the seam the dropout resolver consumes.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::errors::{FusedError, Result};

const PHILOX_M0: u32 = 0xD251_1F53;
const PHILOX_M1: u32 = 0xCD9E_8D57;
const PHILOX_W0: u32 = 0x9E37_79B9;
const PHILOX_W1: u32 = 0xBB67_AE85;
const PHILOX_ROUNDS: usize = 10;

fn mulhilo(a: u32, b: u32) -> (u32, u32) {
    let product = u64::from(a) * u64::from(b);
    ((product >> 32) as u32, product as u32)
}

fn philox_round(ctr: [u32; 4], key: [u32; 2]) -> [u32; 4] {
    let (hi0, lo0) = mulhilo(PHILOX_M0, ctr[0]);
    let (hi1, lo1) = mulhilo(PHILOX_M1, ctr[2]);
    [hi1 ^ ctr[1] ^ key[0], lo1, hi0 ^ ctr[3] ^ key[1], lo0]
}

/// Philox-4x32-10 block function.
pub fn philox4x32(counter: [u32; 4], key: [u32; 2]) -> [u32; 4] {
    let mut ctr = counter;
    let mut key = key;
    for round in 0..PHILOX_ROUNDS {
        if round > 0 {
            key[0] = key[0].wrapping_add(PHILOX_W0);
            key[1] = key[1].wrapping_add(PHILOX_W1);
        }
        ctr = philox_round(ctr, key);
    }
    ctr
}

/// Uniform sample in `[0, 1)` for element `index` of the stream at `offset`.
pub fn uniform(seed: u64, offset: u64, index: u64) -> f32 {
    let counter = [
        offset as u32,
        (offset >> 32) as u32,
        index as u32,
        (index >> 32) as u32,
    ];
    let key = [seed as u32, (seed >> 32) as u32];
    let word = philox4x32(counter, key)[0];
    // 24 mantissa bits keep the result strictly below 1.0.
    (word >> 8) as f32 * (1.0 / (1u32 << 24) as f32)
}

/// Seed and stream offset handed to a kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedOffset {
    pub seed: u64,
    pub offset: u64,
}

/// Explicit generator state. Advancing returns a new value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorState {
    seed: u64,
    offset: u64,
}

impl GeneratorState {
    pub fn new(seed: u64) -> Self {
        Self { seed, offset: 0 }
    }

    pub fn with_offset(seed: u64, offset: u64) -> Self {
        Self { seed, offset }
    }

    pub fn current(&self) -> SeedOffset {
        SeedOffset {
            seed: self.seed,
            offset: self.offset,
        }
    }

    /// Consumes `increment` stream positions: returns the seed with the
    /// offset *before* the advance, and the state positioned after it.
    #[must_use]
    pub fn advance(self, increment: u64) -> (SeedOffset, GeneratorState) {
        let consumed = self.current();
        let next = Self {
            seed: self.seed,
            offset: self.offset.wrapping_add(increment),
        };
        (consumed, next)
    }
}

/// Anything the dropout resolver can draw a seed and offset from.
pub trait OffsetGenerator {
    /// Moves the stream forward by `increment` and returns the consumed
    /// seed/offset pair.
    fn increment_offset(&mut self, increment: u64) -> Result<SeedOffset>;
}

impl OffsetGenerator for GeneratorState {
    fn increment_offset(&mut self, increment: u64) -> Result<SeedOffset> {
        let (consumed, next) = self.advance(increment);
        *self = next;
        Ok(consumed)
    }
}

/// Cloneable handle over a shared [`GeneratorState`].
///
/// The mutex only protects the state value itself. Pipelines on different
/// streams that share one handle still need the caller to order their calls
/// if the drawn offsets must be reproducible.
#[derive(Debug, Clone)]
pub struct Generator {
    state: Arc<Mutex<GeneratorState>>,
}

impl Generator {
    pub fn new(seed: u64) -> Self {
        Self::from_state(GeneratorState::new(seed))
    }

    pub fn from_state(state: GeneratorState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn snapshot(&self) -> Result<GeneratorState> {
        let guard = self
            .state
            .lock()
            .map_err(|_| FusedError::Generator("generator mutex poisoned".into()))?;
        Ok(*guard)
    }

    /// Replaces the state, e.g. when resuming from a checkpoint.
    pub fn restore(&self, state: GeneratorState) -> Result<()> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| FusedError::Generator("generator mutex poisoned".into()))?;
        *guard = state;
        Ok(())
    }

    pub fn advance(&self, increment: u64) -> Result<SeedOffset> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| FusedError::Generator("generator mutex poisoned".into()))?;
        guard.increment_offset(increment)
    }
}

impl OffsetGenerator for Generator {
    fn increment_offset(&mut self, increment: u64) -> Result<SeedOffset> {
        self.advance(increment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn philox_matches_known_answer_for_zero_inputs() {
        let out = philox4x32([0, 0, 0, 0], [0, 0]);
        assert_eq!(out, [0x6627_e8d5, 0xe169_c58d, 0xbc57_ac4c, 0x9b00_dbd8]);
    }

    #[test]
    fn philox_matches_known_answer_for_pi_digits() {
        let out = philox4x32(
            [0x243f_6a88, 0x85a3_08d3, 0x1319_8a2e, 0x0370_7344],
            [0xa409_3822, 0x299f_31d0],
        );
        assert_eq!(out, [0xd16c_fe09, 0x94fd_cceb, 0x5001_e420, 0x2412_6ea1]);
    }

    #[test]
    fn uniform_is_deterministic_and_in_range() {
        for index in 0..1000u64 {
            let a = uniform(7, 3, index);
            let b = uniform(7, 3, index);
            assert_eq!(a, b);
            assert!((0.0..1.0).contains(&a));
        }
        assert_ne!(uniform(7, 3, 0), uniform(7, 4, 0));
        assert_ne!(uniform(7, 3, 0), uniform(8, 3, 0));
    }

    #[test]
    fn advance_returns_previous_offset_and_new_state() {
        let state = GeneratorState::new(11);
        let (first, state) = state.advance(4);
        let (second, state) = state.advance(8);
        assert_eq!(first, SeedOffset { seed: 11, offset: 0 });
        assert_eq!(second, SeedOffset { seed: 11, offset: 4 });
        assert_eq!(state.current().offset, 12);
    }

    #[test]
    fn shared_handle_observes_advances_from_clones() -> Result<()> {
        let generator = Generator::new(5);
        let mut other = generator.clone();
        other.increment_offset(16)?;
        assert_eq!(generator.snapshot()?.current().offset, 16);

        generator.restore(GeneratorState::with_offset(5, 2))?;
        assert_eq!(generator.advance(1)?.offset, 2);
        assert_eq!(other.snapshot()?.current().offset, 3);
        Ok(())
    }
}
