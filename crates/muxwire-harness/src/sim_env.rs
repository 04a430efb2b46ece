//! Simulated environment.

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use muxwire_core::Environment;
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Turmoil clock and a seeded RNG.
///
/// Inside a turmoil host, tokio time is the simulated clock, so reading it
/// here gives virtual time. Clones share one RNG stream, which keeps a whole
/// simulation reproducible from its seed.
#[derive(Debug, Clone)]
pub struct SimEnv {
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl SimEnv {
    /// Environment seeded with zero.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment seeded with `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self { rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))) }
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SimEnv {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().fill_bytes(buffer);
    }
}
