//! Transport abstraction for outbound and inbound connections.
//!
//! A muxwire connection needs nothing more than an ordered, reliable byte
//! stream. Production uses tokio TCP, tests use turmoil's simulated TCP or
//! in-memory duplex pipes.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream a connection can run over.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased stream returned by [`Transport::connect`].
pub type BoxedStream = Box<dyn ByteStream>;

/// Opens byte streams to remote `host:port` addresses.
///
/// Object safe so a channel can hold `Arc<dyn Transport>` and swap real TCP
/// for simulated networking without changing type parameters.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to `host_port`.
    ///
    /// Resolves once the stream is usable. Protocol handshaking happens on
    /// top of the returned stream.
    async fn connect(&self, host_port: &str) -> io::Result<BoxedStream>;
}

/// Accepts inbound byte streams.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next inbound stream.
    ///
    /// Returns the stream and the remote address it came from.
    async fn accept(&self) -> io::Result<(BoxedStream, String)>;

    /// Address this listener is bound to, as `host:port`.
    fn local_addr(&self) -> io::Result<String>;
}
