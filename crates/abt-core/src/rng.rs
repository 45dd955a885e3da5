//! Deterministic RNG wrapper and visitor-hashing helpers.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use siphasher::sip::SipHasher13;
use std::hash::Hasher;

use crate::{ExperimentId, Variant};

/// Deterministic RNG handle used for random variant assignment.
///
/// The handle is a thin wrapper around `StdRng`. A master `seed: u64` must be
/// provided by the caller so assignment sequences are reproducible in tests.
#[derive(Debug, Clone)]
pub struct RngHandle {
    rng: StdRng,
}

impl RngHandle {
    /// Creates a new RNG handle from a master seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draws a variant with equal probability.
    pub fn coin_flip(&mut self) -> Variant {
        if self.rng.gen_bool(0.5) {
            Variant::Treatment
        } else {
            Variant::Control
        }
    }
}

/// Maps a visitor onto a variant by hashing `(seed, experiment, visitor_key)`.
///
/// SipHash-1-3 with fixed zero keys keeps the mapping stable across
/// processes and platforms, so every service instance agrees on a visitor's
/// variant without coordination.
pub fn hashed_variant(seed: u64, experiment: ExperimentId, visitor_key: &str) -> Variant {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write_u64(seed);
    hasher.write_i64(experiment.as_raw());
    hasher.write(visitor_key.as_bytes());
    if hasher.finish() & 1 == 0 {
        Variant::Control
    } else {
        Variant::Treatment
    }
}
