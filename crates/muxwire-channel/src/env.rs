//! Production environment backed by the tokio clock.

use std::{
    future::Future,
    time::{Duration, Instant},
};

use muxwire_core::Environment;
use rand::RngCore;

/// Tokio time and thread-local randomness.
///
/// Time is read through `tokio::time`, so a paused test runtime controls it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        rand::thread_rng().fill_bytes(buffer);
    }
}
