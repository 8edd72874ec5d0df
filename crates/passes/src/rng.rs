//! Randomness for pass decisions.
//!
//! Passes draw split positions, opaque constants, and per-string keys from
//! an [`ObfRng`] threaded through the pass context. The default source is OS
//! entropy; reproducible builds construct it from a fixed seed instead.
//! Nothing here touches global state.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub struct ObfRng {
    inner: StdRng,
}

impl ObfRng {
    /// Seed from the operating system's entropy source.
    pub fn from_entropy() -> ObfRng {
        ObfRng {
            inner: StdRng::from_entropy(),
        }
    }

    /// Deterministic stream for reproducible builds and tests.
    pub fn from_seed(seed: u64) -> ObfRng {
        ObfRng {
            inner: StdRng::seed_from_u64(seed),
        }
    }

    /// Uniform draw from the inclusive range `[min, max]`.
    pub fn int_in_range(&mut self, min: u32, max: u32) -> u32 {
        self.inner.gen_range(min..=max)
    }

    /// Uniform draw over the full 32-bit range.
    pub fn int(&mut self) -> u32 {
        self.inner.r#gen()
    }
}
