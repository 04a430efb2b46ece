//! Environment abstraction for deterministic testing.
//!
//! Connection logic never reads the clock or an RNG directly. Production
//! passes a tokio-backed environment, simulation passes one driven by the
//! turmoil clock and a seeded RNG, so a failing seed replays exactly.

use std::{
    future::Future,
    time::{Duration, Instant},
};

/// Source of time, sleeping and randomness.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Sleep for `duration` on this environment's clock.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Random `u64`, used for trace and span ids.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}
