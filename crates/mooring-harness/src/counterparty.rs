//! Scripted remote peer.
//!
//! A [`Counterparty`] is the other end of a channel, driven by a fixed list
//! of steps over a real [`FramedLink`]. It authenticates with its own node
//! key, so the wallet under test exercises the genuine `init` exchange,
//! framing, and ping handling.
//!
//! Optional seeded noise interleaves `ping`s ahead of scripted sends. The
//! wallet must answer them while it waits; answered pongs are counted in the
//! [`PeerReport`].

use std::net::SocketAddr;

use bitcoin::secp256k1::SecretKey;
use mooring_core::{ConnectError, FramedLink, LinkError, Transport};
use mooring_proto::{Message, MessageType, NodeId, Ping};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// One scripted action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Receive a message of this type, skipping pongs
    Expect(MessageType),
    /// Send this message
    Send(Message),
    /// Wait for the wallet to close the link, skipping pongs
    AwaitClose,
}

/// What the counterparty observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerReport {
    /// Types matched by `Expect` steps, in order
    pub received: Vec<MessageType>,
    /// Pings sent as noise
    pub pings: usize,
    /// Pongs received
    pub pongs: usize,
}

/// Counterparty script failed.
#[derive(Debug, Error)]
pub enum CounterpartyError {
    /// Link setup failed
    #[error("link setup failed: {0}")]
    Connect(#[from] ConnectError),

    /// Link failed mid-script
    #[error("link failed: {0}")]
    Link(#[from] LinkError),

    /// Wallet sent the wrong message
    #[error("expected {expected}, got {actual}")]
    Unexpected {
        /// Scripted type
        expected: MessageType,
        /// Received type
        actual: MessageType,
    },

    /// Wallet kept talking instead of closing
    #[error("expected close, got {0}")]
    NotClosed(MessageType),
}

/// Remote peer following a script.
#[derive(Debug, Clone)]
pub struct Counterparty {
    secret: SecretKey,
    wallet: NodeId,
    steps: Vec<Step>,
    noise: Option<u64>,
}

impl Counterparty {
    /// Peer holding `secret` that expects to talk to `wallet`.
    pub fn new(secret: SecretKey, wallet: NodeId) -> Self {
        Self { secret, wallet, steps: Vec::new(), noise: None }
    }

    /// Expect a message of `message_type`.
    pub fn expect(mut self, message_type: MessageType) -> Self {
        self.steps.push(Step::Expect(message_type));
        self
    }

    /// Send `message`.
    pub fn send(mut self, message: impl Into<Message>) -> Self {
        self.steps.push(Step::Send(message.into()));
        self
    }

    /// Wait for the wallet to hang up.
    pub fn await_close(mut self) -> Self {
        self.steps.push(Step::AwaitClose);
        self
    }

    /// Precede each send with up to two pings, chosen by `seed`.
    pub fn with_noise(mut self, seed: u64) -> Self {
        self.noise = Some(seed);
        self
    }

    /// Accept the wallet's connection and run the script.
    pub async fn accept_on<T: Transport>(self, transport: &T) -> Result<PeerReport, CounterpartyError> {
        let link = FramedLink::accept(transport, &self.secret, self.wallet).await?;
        self.run(link).await
    }

    /// Dial the wallet at `endpoint` and run the script.
    pub async fn connect_to<T: Transport>(
        self,
        transport: &T,
        endpoint: SocketAddr,
    ) -> Result<PeerReport, CounterpartyError> {
        let link = FramedLink::connect(transport, &self.secret, self.wallet, endpoint).await?;
        self.run(link).await
    }

    async fn run<S>(self, mut link: FramedLink<S>) -> Result<PeerReport, CounterpartyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut rng = self.noise.map(ChaCha8Rng::seed_from_u64);
        let mut report = PeerReport::default();

        for step in self.steps {
            match step {
                Step::Expect(expected) => {
                    let (next, actual) = recv_skipping_pongs(link, &mut report).await?;
                    link = next;
                    if actual != expected {
                        return Err(CounterpartyError::Unexpected { expected, actual });
                    }
                    report.received.push(actual);
                },
                Step::Send(message) => {
                    if let Some(rng) = rng.as_mut() {
                        for _ in 0..rng.gen_range(0..=2) {
                            let ping = Ping { num_pong_bytes: rng.gen_range(0..64), ignored: vec![0; 4] };
                            link = link.send_message(&Message::Ping(ping)).await?;
                            report.pings += 1;
                        }
                    }
                    link = link.send_message(&message).await?;
                },
                Step::AwaitClose => match recv_skipping_pongs(link, &mut report).await {
                    Err(CounterpartyError::Link(LinkError::Closed)) => return Ok(report),
                    Err(err) => return Err(err),
                    Ok((_, actual)) => return Err(CounterpartyError::NotClosed(actual)),
                },
            }
        }

        Ok(report)
    }
}

async fn recv_skipping_pongs<S>(
    mut link: FramedLink<S>,
    report: &mut PeerReport,
) -> Result<(FramedLink<S>, MessageType), CounterpartyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let (next, message) = link.recv_message().await?;
        link = next;
        match message {
            Message::Pong(_) => report.pongs += 1,
            other => {
                tracing::debug!(message_type = %other.message_type(), "counterparty received");
                return Ok((link, other.message_type()));
            },
        }
    }
}
