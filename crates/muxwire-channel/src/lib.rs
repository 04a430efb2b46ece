//! Tokio runtime for the muxwire RPC transport.
//!
//! Drives the sans-IO [`muxwire_core::Connection`] over real byte streams and
//! adds everything that needs tasks and shared state.
//!
//! # Components
//!
//! - [`connection`]: per-connection driver task, [`ConnectionHandle`] and
//!   [`PendingCallHandle`]
//! - [`peer`]: one remote endpoint with single-flight connect
//! - [`selector`]: per-service peer selection over the core peer heap
//! - [`channel`]: the [`Channel`] context object tying it together
//! - [`handler`]: inbound call dispatch by service and method
//! - [`tcp`]: tokio TCP transport and listener
//! - [`mod@env`]: tokio-backed [`muxwire_core::Environment`]
//! - [`config`]: channel and peer settings
//!
//! # Example
//!
//! ```ignore
//! let server = Channel::new(ChannelConfig::new("kv-server", "127.0.0.1:4040"));
//! server.register_handler("kv", "get", handler_fn(|call| async move {
//!     Ok(OutboundResponse::ok("", lookup(call.arg3())))
//! }));
//! server.listen("127.0.0.1:4040").await?;
//!
//! let client = Channel::new(ChannelConfig::new("kv-client", "127.0.0.1:0"));
//! client.add_peer("kv", "127.0.0.1:4040");
//! let response = client
//!     .open_call("kv", "get", Vec::new(), "", "some-key", Duration::from_secs(1))
//!     .await?;
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod env;
pub mod handler;
pub mod peer;
pub mod selector;
pub mod tcp;

pub use channel::Channel;
pub use config::{ChannelConfig, PeerConfig};
pub use connection::{ConnectionBuilder, ConnectionHandle, ConnectionStatus, PendingCallHandle};
pub use env::SystemEnv;
pub use handler::{CallSink, FnHandler, Handler, HandlerError, HandlerRegistry, handler_fn};
pub use peer::Peer;
pub use selector::PeerSelector;
pub use tcp::{TcpAcceptor, TcpTransport};
