//! Authenticated, framed peer links.
//!
//! # Protocol Flow
//!
//! 1. The transport yields a byte stream (outbound connect or inbound accept)
//! 2. Both sides send `init` carrying their node id, then read the peer's
//! 3. The announced id must equal the counterparty recorded for the channel
//! 4. Frames then flow in both directions; `ping` is answered inline
//!
//! Links are move-only. [`PeerLink::send`] and [`PeerLink::recv_channel_msg`]
//! consume the link and hand back its successor with advanced counters. A
//! future dropped mid-frame drops the link with it, so a partially read
//! frame can never be observed as received.

use std::{fmt, io, net::SocketAddr};

use async_trait::async_trait;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use mooring_proto::{ChannelMessage, Frame, FrameHeader, Init, Message, NodeId, Pong};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    error::{ConnectError, LinkError, RecvMsgError},
    transport::Transport,
};

/// Largest `num_pong_bytes` we answer.
///
/// Larger requests would not fit a pong into one frame and are ignored.
pub const MAX_PONG_BYTES: u16 = 32_768;

/// Capability set a channel session needs from its peer connection.
#[async_trait]
pub trait PeerLink: fmt::Debug + Send + Sized + 'static {
    /// Identity the peer proved during setup.
    fn remote_node_id(&self) -> NodeId;

    /// Peer's current network address.
    fn remote_endpoint(&self) -> SocketAddr;

    /// Send one message, flushed before returning.
    async fn send(self, message: Message) -> Result<Self, LinkError>;

    /// Wait for the next channel-scoped message.
    ///
    /// Link-level traffic (`ping`, `pong`, `init`) is handled internally. A
    /// peer `error` ends the wait with [`RecvMsgError::PeerError`], which
    /// carries the link back to the caller.
    async fn recv_channel_msg(self) -> Result<(Self, ChannelMessage), RecvMsgError<Self>>;

    /// Shut the connection down, releasing its resources.
    async fn close(self);
}

/// [`PeerLink`] over any ordered byte stream, using 6-byte-header frames.
pub struct FramedLink<S> {
    stream: S,
    local_node_id: NodeId,
    remote_node_id: NodeId,
    remote_endpoint: SocketAddr,
    sent: u64,
    received: u64,
}

impl<S> fmt::Debug for FramedLink<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedLink")
            .field("local_node_id", &self.local_node_id)
            .field("remote_node_id", &self.remote_node_id)
            .field("remote_endpoint", &self.remote_endpoint)
            .field("sent", &self.sent)
            .field("received", &self.received)
            .finish_non_exhaustive()
    }
}

impl<S> FramedLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Dial `remote_node_id` at `endpoint` and run the `init` exchange.
    pub async fn connect<T>(
        transport: &T,
        node_secret: &SecretKey,
        remote_node_id: NodeId,
        endpoint: SocketAddr,
    ) -> Result<Self, ConnectError>
    where
        T: Transport<Stream = S>,
    {
        tracing::debug!(remote = %endpoint, node_id = %remote_node_id, "connecting to peer");
        let stream = transport.connect(endpoint).await?;
        Self::handshake(stream, node_secret, remote_node_id, endpoint).await
    }

    /// Accept the next inbound connection and require it to be `expected`.
    pub async fn accept<T>(
        transport: &T,
        node_secret: &SecretKey,
        expected: NodeId,
    ) -> Result<Self, ConnectError>
    where
        T: Transport<Stream = S>,
    {
        let (stream, remote) = transport.accept().await?;
        tracing::debug!(remote = %remote, node_id = %expected, "accepted peer connection");
        Self::handshake(stream, node_secret, expected, remote).await
    }

    /// Wrap an already-connected stream and run the `init` exchange.
    pub async fn handshake(
        stream: S,
        node_secret: &SecretKey,
        expected: NodeId,
        remote_endpoint: SocketAddr,
    ) -> Result<Self, ConnectError> {
        let local_node_id = NodeId::from_secret_key(&Secp256k1::signing_only(), node_secret);
        let link = Self {
            stream,
            local_node_id,
            remote_node_id: expected,
            remote_endpoint,
            sent: 0,
            received: 0,
        };

        let init = Message::Init(Init { node_id: local_node_id, features: Vec::new() });
        let link = link.send_message(&init).await?;
        let (link, reply) = link.recv_message().await?;

        match reply {
            Message::Init(init) if init.node_id == expected => {
                tracing::debug!(remote = %remote_endpoint, node_id = %expected, "init exchanged");
                Ok(link)
            },
            Message::Init(init) => {
                tracing::warn!(
                    remote = %remote_endpoint,
                    expected = %expected,
                    actual = %init.node_id,
                    "peer announced unexpected node id"
                );
                Err(ConnectError::NodeIdMismatch { expected, actual: init.node_id })
            },
            other => Err(ConnectError::UnexpectedHandshakeMessage(other.message_type())),
        }
    }

    /// Encode, write, and flush one message.
    pub async fn send_message(mut self, message: &Message) -> Result<Self, LinkError> {
        let frame = message.into_frame()?;
        let mut buf = Vec::new();
        frame.encode(&mut buf);

        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        self.sent += 1;

        tracing::trace!(message_type = %message.message_type(), sent = self.sent, "sent frame");
        Ok(self)
    }

    /// Read exactly one frame and decode it.
    ///
    /// End of stream at any point, including between frames, is
    /// [`LinkError::Closed`].
    pub async fn recv_message(mut self) -> Result<(Self, Message), LinkError> {
        let mut buf = vec![0u8; FrameHeader::SIZE];
        read_exact_or_closed(&mut self.stream, &mut buf).await?;

        let payload_len = FrameHeader::from_bytes(&buf)?.payload_len();
        buf.resize(FrameHeader::SIZE + payload_len, 0);
        read_exact_or_closed(&mut self.stream, &mut buf[FrameHeader::SIZE..]).await?;

        let (frame, _) = Frame::decode(&buf)?;
        let message = Message::from_frame(&frame)?;
        self.received += 1;

        tracing::trace!(
            message_type = %message.message_type(),
            received = self.received,
            "received frame"
        );
        Ok((self, message))
    }

    /// Our own node id, as announced in `init`.
    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    /// Frames sent, including `init`.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Frames received, including `init`.
    pub fn received(&self) -> u64 {
        self.received
    }
}

#[async_trait]
impl<S> PeerLink for FramedLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn remote_node_id(&self) -> NodeId {
        self.remote_node_id
    }

    fn remote_endpoint(&self) -> SocketAddr {
        self.remote_endpoint
    }

    async fn send(self, message: Message) -> Result<Self, LinkError> {
        self.send_message(&message).await
    }

    async fn recv_channel_msg(self) -> Result<(Self, ChannelMessage), RecvMsgError<Self>> {
        let mut link = self;
        loop {
            let (next, message) = link.recv_message().await?;
            link = next;

            match message {
                Message::Channel(message) => return Ok((link, message)),
                Message::Error(message) => {
                    tracing::warn!(
                        remote = %link.remote_endpoint,
                        channel_id = %message.channel_id,
                        error = %message,
                        "peer sent error"
                    );
                    return Err(RecvMsgError::PeerError { link, message });
                },
                Message::Ping(ping) if ping.num_pong_bytes <= MAX_PONG_BYTES => {
                    let pong = Pong { ignored: vec![0; usize::from(ping.num_pong_bytes)] };
                    link = link.send_message(&Message::Pong(pong)).await?;
                },
                Message::Ping(ping) => {
                    tracing::debug!(num_pong_bytes = ping.num_pong_bytes, "ignoring oversized ping");
                },
                Message::Pong(_) | Message::Init(_) => {
                    tracing::trace!(message_type = %message.message_type(), "skipping link message");
                },
            }
        }
    }

    async fn close(mut self) {
        if let Err(err) = self.stream.shutdown().await {
            tracing::debug!(remote = %self.remote_endpoint, error = %err, "error while closing link");
        }
    }
}

async fn read_exact_or_closed<S>(stream: &mut S, buf: &mut [u8]) -> Result<(), LinkError>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(LinkError::Closed),
        Err(err) => Err(LinkError::Io(err)),
    }
}
