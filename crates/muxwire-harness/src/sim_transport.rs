//! Turmoil-backed transport.
//!
//! Simulated TCP with the same byte-stream semantics as tokio TCP, plus
//! turmoil's latency, loss, partition and crash injection.

use std::io;

use async_trait::async_trait;
use muxwire_core::{BoxedStream, Listener, Transport};
use turmoil::net::{TcpListener, TcpStream};

/// Dials simulated hosts by `host:port`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimTransport;

#[async_trait]
impl Transport for SimTransport {
    async fn connect(&self, host_port: &str) -> io::Result<BoxedStream> {
        Ok(Box::new(TcpStream::connect(host_port).await?))
    }
}

/// Simulated TCP listener.
pub struct SimListener {
    listener: TcpListener,
}

impl SimListener {
    /// Bind inside the current simulated host.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        Ok(Self { listener: TcpListener::bind(addr).await? })
    }
}

#[async_trait]
impl Listener for SimListener {
    async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        let (stream, remote) = self.listener.accept().await?;
        Ok((Box::new(stream), remote.to_string()))
    }

    fn local_addr(&self) -> io::Result<String> {
        self.listener.local_addr().map(|addr| addr.to_string())
    }
}
