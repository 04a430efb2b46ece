//! Deterministic simulation harness for muxwire testing.
//!
//! Turmoil-based implementations of the Environment and Transport traits for
//! deterministic, reproducible testing under various network conditions, and
//! a sans-IO scenario framework that pumps frames between connection state
//! machines without any runtime at all.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod scenario;
pub mod sim_env;
pub mod sim_transport;

pub use sim_env::SimEnv;
pub use sim_transport::{SimListener, SimTransport};

/// Install a `tracing` subscriber honouring `RUST_LOG`, once per process.
///
/// Output goes through the test writer so it is captured per test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
