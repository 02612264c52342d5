//! Deterministic uniform random streams.
//!
//! Each routing agent owns one `UniformStream`. Streams derived from the
//! same base seed but different stream indices are independent, so a
//! simulation is reproducible from a single scene seed regardless of node
//! count or event interleaving.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Mixing constant for stream derivation (the 64-bit golden ratio).
const STREAM_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// A seeded source of uniform random values.
#[derive(Debug, Clone)]
pub struct UniformStream {
    rng: StdRng,
    base_seed: u64,
}

impl UniformStream {
    pub fn new(seed: u64) -> Self {
        UniformStream {
            rng: StdRng::seed_from_u64(seed),
            base_seed: seed,
        }
    }

    /// Re-seed this source onto an independent sub-stream of the base seed.
    /// Returns the number of streams consumed (always 1), matching the
    /// stream-assignment contract of the original simulator.
    pub fn assign_stream(&mut self, stream: u64) -> u64 {
        let mixed = self.base_seed ^ stream.wrapping_mul(STREAM_MIX);
        self.rng = StdRng::seed_from_u64(mixed);
        1
    }

    /// Uniform value in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        self.rng.gen_range(0.0..1.0)
    }

    /// Uniform integer in `[lo, hi]`.
    pub fn range_inclusive(&mut self, lo: u64, hi: u64) -> u64 {
        self.rng.gen_range(lo..=hi)
    }
}
