//! Turmoil-backed [`Transport`].
//!
//! Streams are simulated TCP connections, so latency, partitions, and host
//! crashes are under the simulation's control and every run is reproducible.

use std::{fmt, io, net::SocketAddr};

use async_trait::async_trait;
use mooring_core::Transport;
use turmoil::net::{TcpListener, TcpStream};

/// Simulated TCP transport.
pub struct SimTransport {
    listener: Option<TcpListener>,
}

impl fmt::Debug for SimTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimTransport").field("listening", &self.listener.is_some()).finish_non_exhaustive()
    }
}

impl SimTransport {
    /// Listen on `addr` inside the current simulated host.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener: Some(listener) })
    }

    /// Transport that only dials out.
    pub fn client() -> Self {
        Self { listener: None }
    }
}

#[async_trait]
impl Transport for SimTransport {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "simulated transport is not listening"))?;
        listener.accept().await
    }

    async fn connect(&self, remote: SocketAddr) -> io::Result<TcpStream> {
        TcpStream::connect(remote).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_reports_listening_state() {
        insta::assert_snapshot!(format!("{:?}", SimTransport::client()), @"SimTransport { listening: false, .. }");
    }
}
