//! muxwire protocol core logic
//!
//! Pure state machine logic for the muxwire RPC transport, decoupled from I/O.
//!
//! # Architecture
//!
//! Protocol logic in this crate is implemented as deterministic state
//! machines that are isolated from I/O, time, randomness, and scheduling.
//! All external effects are supplied explicitly by the caller.
//!
//! State transitions produce declarative actions that describe intended
//! effects rather than executing them directly. The async driver in
//! `muxwire-channel`, or a test harness, interprets and executes these
//! actions. The same connection code therefore runs under tokio, under a
//! turmoil simulation, and inside plain unit tests that pump frames between
//! two state machines by hand.
//!
//! # Components
//!
//! - [`connection`]: per-socket state machine (handshake, call multiplexing,
//!   fragmentation, timeouts, cancellation, close)
//! - [`peer_heap`]: load- and health-ordered peer selection heap
//! - [`ids`]: message id allocation
//! - [`mod@env`]: environment abstraction (time, RNG)
//! - [`transport`]: transport abstraction (byte streams)
//! - [`error`]: connection and call error types

pub mod connection;
pub mod env;
pub mod error;
pub mod ids;
pub mod peer_heap;
pub mod transport;

pub use connection::{
    CallResponse, Connection, ConnectionAction, ConnectionConfig, ConnectionState, InboundCall,
    OutboundCall, OutboundResponse, RemoteInfo, Role,
};
pub use env::Environment;
pub use error::{CallError, ConnectionError};
pub use peer_heap::{CallOutcome, PeerHeap, Score};
pub use transport::{BoxedStream, ByteStream, Listener, Transport};
