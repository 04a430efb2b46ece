//! Tokio TCP transport.

use std::io;

use async_trait::async_trait;
use muxwire_core::{BoxedStream, Listener, Transport};
use tokio::net::{TcpListener, TcpStream};

/// Connects over TCP with Nagle disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, host_port: &str) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(host_port).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Bound TCP listener.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind to `addr`.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        Ok(Self { listener: TcpListener::bind(addr).await? })
    }
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), remote.to_string()))
    }

    fn local_addr(&self) -> io::Result<String> {
        self.listener.local_addr().map(|addr| addr.to_string())
    }
}
