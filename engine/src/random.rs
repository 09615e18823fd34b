//! Randomness abstraction.
//!
//! Node ids, row ids, nonces, and jitter all draw from a [`RandomSource`]
//! seam so that tests can run fully deterministic.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

/// A source of cryptographic-quality randomness.
pub trait RandomSource: Send + Sync {
    /// Fill `dest` with random bytes.
    fn fill_bytes(&self, dest: &mut [u8]);

    /// A uniform float in `[0, 1)`.
    fn next_f64(&self) -> f64;
}

/// The OS-backed random source.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRandom;

impl RandomSource for SystemRandom {
    fn fill_bytes(&self, dest: &mut [u8]) {
        rand::thread_rng().fill_bytes(dest);
    }

    fn next_f64(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// A seeded random source for deterministic tests.
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    /// Create a source from a fixed seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn fill_bytes(&self, dest: &mut [u8]) {
        self.rng.lock().expect("rng lock poisoned").fill_bytes(dest);
    }

    fn next_f64(&self) -> f64 {
        self.rng.lock().expect("rng lock poisoned").gen::<f64>()
    }
}
