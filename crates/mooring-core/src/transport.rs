//! Transport abstraction for peer connections.
//!
//! A transport hands out ordered, reliable byte streams; framing and the
//! `init` exchange live in [`crate::link`]. Production uses TCP, tests use
//! Turmoil (simulated TCP) or in-memory duplex pipes.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
};

/// Abstract transport for peer connections.
///
/// Each call yields one bidirectional stream to one peer. Streams are not
/// shared between links.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Byte stream to a peer.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Accept an incoming connection.
    ///
    /// Blocks until a peer connects and returns the stream with the peer's
    /// address.
    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)>;

    /// Connect to a remote endpoint.
    async fn connect(&self, remote: SocketAddr) -> io::Result<Self::Stream>;
}

/// Plain TCP transport.
///
/// Outbound-only instances refuse `accept`.
#[derive(Debug)]
pub struct TcpTransport {
    listener: Option<TcpListener>,
}

impl TcpTransport {
    /// Listen on `addr` for inbound peers. Outbound connects also work.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(local = %listener.local_addr()?, "listening for peers");
        Ok(Self { listener: Some(listener) })
    }

    /// Transport that only dials out.
    pub fn outbound() -> Self {
        Self { listener: None }
    }

    /// Bound address, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport is not listening"))?;
        let (stream, remote) = listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, remote))
    }

    async fn connect(&self, remote: SocketAddr) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(remote).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
