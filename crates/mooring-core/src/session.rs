//! Reconnected channel sessions.
//!
//! A [`ChannelSession`] only comes into existence through a successful
//! `channel_reestablish` handshake. Connect and accept differ only in which
//! side opens the transport connection:
//!
//! 1. Load the persisted record and restore the state machine from it
//! 2. Bring up an authenticated link (outbound dial or inbound accept)
//! 3. Run [`crate::reestablish`]
//!
//! Any failure leaves no session behind; the channel remains closable from
//! its last persisted state.

use std::{fmt, net::SocketAddr, sync::Arc};

use bitcoin::{Network, Txid};
use mooring_proto::{ChannelId, ChannelMessage, ErrorMessage, ErrorScope, Message, NodeId};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    account::Account,
    channel::{ChannelStateMachine, DisabledFundingProvider, FundingOutput, RestoreContext},
    error::{LinkError, ReconnectError, RecvMsgError, invariant_violated},
    link::{FramedLink, PeerLink},
    reestablish::reestablish,
    store::{ChannelStore, PersistedChannel, StoreError},
    transport::Transport,
};

/// A live, reestablished channel.
///
/// Owns its link and state machine; shares the account. Every exchange
/// consumes the session and returns its successor.
pub struct ChannelSession<L, M, A: ?Sized> {
    link: L,
    machine: M,
    account: Arc<A>,
    remote_endpoint: SocketAddr,
    min_safe_depth: u32,
    channel_index: u32,
}

impl<L: fmt::Debug, M, A: ?Sized> fmt::Debug for ChannelSession<L, M, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSession")
            .field("link", &self.link)
            .field("remote_endpoint", &self.remote_endpoint)
            .field("min_safe_depth", &self.min_safe_depth)
            .field("channel_index", &self.channel_index)
            .finish_non_exhaustive()
    }
}

/// A restored machine plus the record fields the session keeps.
#[derive(Debug)]
struct LoadedChannel<M> {
    machine: M,
    remote_node_id: NodeId,
    remote_endpoint: SocketAddr,
    min_safe_depth: u32,
    channel_index: u32,
}

fn load<M, St, A>(store: &St, account: &A, channel_id: ChannelId) -> Result<LoadedChannel<M>, StoreError>
where
    M: ChannelStateMachine,
    St: ChannelStore + ?Sized,
    A: Account + ?Sized,
{
    let record = store.load(&channel_id)?;
    if record.channel_id != channel_id {
        return Err(StoreError::ChannelIdMismatch { expected: channel_id, actual: Some(record.channel_id) });
    }

    let context = RestoreContext {
        channel_id,
        remote_node_id: record.remote_node_id,
        network: record.network,
        node_secret: *account.node_secret(),
        funding_provider: Arc::new(DisabledFundingProvider::new(channel_id)),
    };
    let machine = M::restore(&record.state_snapshot, context)
        .map_err(|e| StoreError::Restore { channel_id, reason: e.to_string() })?;

    let actual = machine.channel_id();
    if actual != Some(channel_id) {
        return Err(StoreError::ChannelIdMismatch { expected: channel_id, actual });
    }

    tracing::debug!(
        %channel_id,
        remote = %record.remote_endpoint,
        channel_index = record.channel_index,
        "loaded channel"
    );

    Ok(LoadedChannel {
        machine,
        remote_node_id: record.remote_node_id,
        remote_endpoint: record.remote_endpoint,
        min_safe_depth: record.min_safe_depth,
        channel_index: record.channel_index,
    })
}

impl<L, M, A> ChannelSession<L, M, A>
where
    L: PeerLink,
    M: ChannelStateMachine,
    A: Account + ?Sized,
{
    /// Resume `channel_id` over an already authenticated `link`.
    ///
    /// For callers that manage their own connections. [`Self::connect`] and
    /// [`Self::accept`] cover the usual TCP/simulated paths.
    pub async fn resume<St>(
        link: L,
        store: &St,
        account: Arc<A>,
        channel_id: ChannelId,
    ) -> Result<Self, ReconnectError<L>>
    where
        St: ChannelStore + ?Sized,
    {
        let loaded = load(store, &*account, channel_id)?;
        Self::reestablish_loaded(link, loaded, account).await
    }

    async fn reestablish_loaded(
        link: L,
        loaded: LoadedChannel<M>,
        account: Arc<A>,
    ) -> Result<Self, ReconnectError<L>> {
        let (link, machine) = reestablish(link, loaded.machine).await?;
        let session = Self {
            link,
            machine,
            account,
            remote_endpoint: loaded.remote_endpoint,
            min_safe_depth: loaded.min_safe_depth,
            channel_index: loaded.channel_index,
        };

        tracing::info!(
            channel_id = %session.channel_id(),
            remote = %session.link.remote_endpoint(),
            "channel session established"
        );
        Ok(session)
    }

    /// Channel id. Always present on a session.
    pub fn channel_id(&self) -> ChannelId {
        match self.machine.channel_id() {
            Some(id) => id,
            None => invariant_violated(format_args!("session without channel id")),
        }
    }

    /// Funding transaction id.
    ///
    /// # Panics
    ///
    /// If the machine has no funding transaction yet. Sessions are only
    /// resumed for funded channels.
    pub fn funding_txid(&self) -> Txid {
        match self.machine.funding_txid() {
            Some(txid) => txid,
            None => invariant_violated(format_args!("session for {} without funding txid", self.channel_id())),
        }
    }

    /// Funding output, absent until funding confirms.
    pub fn funding_output(&self) -> Option<FundingOutput> {
        self.machine.funding_output()
    }

    /// Counterparty.
    pub fn remote_node_id(&self) -> NodeId {
        self.machine.remote_node_id()
    }

    /// Chain the channel lives on.
    pub fn network(&self) -> Network {
        self.machine.network()
    }

    /// Counterparty's dialable address, as recorded for the channel.
    ///
    /// On an accepted session this differs from the link's peer address,
    /// which is the counterparty's outbound source port.
    pub fn remote_endpoint(&self) -> SocketAddr {
        self.remote_endpoint
    }

    /// Index within the owning account.
    pub fn channel_index(&self) -> u32 {
        self.channel_index
    }

    /// Confirmations required before funding is considered safe.
    pub fn min_safe_depth(&self) -> u32 {
        self.min_safe_depth
    }

    /// Owning account.
    pub fn account(&self) -> &Arc<A> {
        &self.account
    }

    /// State machine.
    pub fn machine(&self) -> &M {
        &self.machine
    }

    /// Peer link.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Record describing the session as it stands now.
    pub fn persisted(&self) -> Result<PersistedChannel, StoreError> {
        let channel_id = self.channel_id();
        let state_snapshot = self
            .machine
            .snapshot()
            .map_err(|e| StoreError::Snapshot { channel_id, reason: e.to_string() })?;

        Ok(PersistedChannel {
            channel_id,
            channel_index: self.channel_index,
            network: self.network(),
            remote_node_id: self.remote_node_id(),
            state_snapshot,
            account_file: self.account.file_identity().to_string(),
            remote_endpoint: self.remote_endpoint,
            min_safe_depth: self.min_safe_depth,
        })
    }

    /// Persist the session.
    pub fn save<St: ChannelStore + ?Sized>(&self, store: &St) -> Result<(), StoreError> {
        store.save(&self.persisted()?)
    }

    /// Send a message to the counterparty.
    pub async fn send(self, message: Message) -> Result<Self, LinkError> {
        let Self { link, machine, account, remote_endpoint, min_safe_depth, channel_index } = self;
        let link = link.send(message).await?;
        Ok(Self { link, machine, account, remote_endpoint, min_safe_depth, channel_index })
    }

    /// Wait for the next channel message.
    pub async fn recv_channel_msg(self) -> Result<(Self, ChannelMessage), RecvMsgError<Self>> {
        let Self { link, machine, account, remote_endpoint, min_safe_depth, channel_index } = self;
        match link.recv_channel_msg().await {
            Ok((link, message)) => {
                let session = Self { link, machine, account, remote_endpoint, min_safe_depth, channel_index };
                Ok((session, message))
            },
            Err(RecvMsgError::Link(err)) => Err(RecvMsgError::Link(err)),
            Err(RecvMsgError::PeerError { link, message }) => Err(RecvMsgError::PeerError {
                link: Self { link, machine, account, remote_endpoint, min_safe_depth, channel_index },
                message,
            }),
        }
    }

    /// Report a protocol error to the counterparty.
    ///
    /// Transport failures propagate as ordinary send failures.
    pub async fn send_error(self, scope: ErrorScope, data: impl Into<Vec<u8>>) -> Result<Self, LinkError> {
        let message = ErrorMessage::new(scope, data);
        tracing::debug!(channel_id = %message.channel_id, error = %message, "sending error to peer");
        self.send(message.into()).await
    }

    /// Dispose of the session, closing its link.
    pub async fn close(self) {
        tracing::info!(channel_id = %self.channel_id(), "closing channel session");
        self.link.close().await;
    }
}

impl<S, M, A> ChannelSession<FramedLink<S>, M, A>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    M: ChannelStateMachine,
    A: Account + ?Sized,
{
    /// Reconnect as initiator: dial the counterparty's last known address.
    pub async fn connect<T, St>(
        store: &St,
        transport: &T,
        account: Arc<A>,
        channel_id: ChannelId,
    ) -> Result<Self, ReconnectError<FramedLink<S>>>
    where
        T: Transport<Stream = S>,
        St: ChannelStore + ?Sized,
    {
        let loaded = load::<M, _, _>(store, &*account, channel_id)?;
        let link = FramedLink::connect(
            transport,
            account.node_secret(),
            loaded.remote_node_id,
            loaded.remote_endpoint,
        )
        .await?;

        Self::reestablish_loaded(link, loaded, account).await
    }

    /// Reconnect as responder: wait for the counterparty to dial in.
    pub async fn accept<T, St>(
        store: &St,
        transport: &T,
        account: Arc<A>,
        channel_id: ChannelId,
    ) -> Result<Self, ReconnectError<FramedLink<S>>>
    where
        T: Transport<Stream = S>,
        St: ChannelStore + ?Sized,
    {
        let loaded = load::<M, _, _>(store, &*account, channel_id)?;
        let link = FramedLink::accept(transport, account.node_secret(), loaded.remote_node_id).await?;

        Self::reestablish_loaded(link, loaded, account).await
    }
}

#[cfg(test)]
mod tests {
    use mooring_proto::MessageType;

    use super::*;
    use crate::{
        PossibleBug, ReestablishError,
        store::MemoryChannelStore,
        testing::{Reply, ScriptedChannel, ScriptedLink, StaticAccount, fixtures},
    };

    type Session = ChannelSession<ScriptedLink, ScriptedChannel, StaticAccount>;

    fn seeded_store() -> MemoryChannelStore {
        let store = MemoryChannelStore::new();
        store.save(&fixtures::persisted(fixtures::CHANNEL)).unwrap();
        store
    }

    async fn resumed(replies: Vec<Reply>) -> Session {
        let (link, _) = ScriptedLink::new(replies);
        Session::resume(link, &seeded_store(), Arc::new(fixtures::account()), fixtures::CHANNEL)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn resumed_session_reports_its_channel() {
        let session = resumed(vec![Reply::Message(fixtures::reestablish(fixtures::CHANNEL))]).await;

        assert_eq!(session.channel_id(), fixtures::CHANNEL);
        assert_eq!(session.funding_txid(), fixtures::funding_output().outpoint.txid);
        assert_eq!(session.funding_output(), Some(fixtures::funding_output()));
        assert_eq!(session.remote_node_id(), fixtures::remote_node_id());
        assert_eq!(session.network(), Network::Regtest);
        assert_eq!(session.channel_index(), 3);
        assert_eq!(session.min_safe_depth(), 3);
        assert!(session.machine().reestablish_sent());
    }

    #[tokio::test]
    async fn save_after_load_is_lossless() {
        let store = seeded_store();
        let session = resumed(vec![Reply::Message(fixtures::reestablish(fixtures::CHANNEL))]).await;

        session.save(&store).unwrap();
        assert_eq!(store.load(&fixtures::CHANNEL).unwrap(), fixtures::persisted(fixtures::CHANNEL));
    }

    #[tokio::test]
    async fn missing_record_fails_before_any_io() {
        let (link, journal) = ScriptedLink::new([Reply::Closed]);
        let err = Session::resume(link, &MemoryChannelStore::new(), Arc::new(fixtures::account()), fixtures::CHANNEL)
            .await
            .unwrap_err();

        assert!(matches!(err, ReconnectError::Load(StoreError::NotFound(_))));
        assert!(!err.possible_bug());
        assert!(journal.lock().unwrap().sent.is_empty());
    }

    #[tokio::test]
    async fn record_for_another_channel_is_a_mismatch() {
        let store = MemoryChannelStore::new();
        let mut record = fixtures::persisted(fixtures::CHANNEL);
        record.state_snapshot = fixtures::snapshot(ChannelId([0x99; 32]));
        store.save(&record).unwrap();

        let (link, _) = ScriptedLink::new([Reply::Closed]);
        let err = Session::resume(link, &store, Arc::new(fixtures::account()), fixtures::CHANNEL)
            .await
            .unwrap_err();

        assert!(matches!(err, ReconnectError::Load(StoreError::ChannelIdMismatch { .. })));
        assert!(err.possible_bug());
    }

    #[tokio::test]
    async fn peer_error_yields_no_session() {
        let error = ErrorMessage::new(ErrorScope::Channel(fixtures::CHANNEL), b"insufficient funds".to_vec());
        let (link, _) = ScriptedLink::new([Reply::Error(error)]);

        let err = Session::resume(link, &seeded_store(), Arc::new(fixtures::account()), fixtures::CHANNEL)
            .await
            .unwrap_err();

        match err {
            ReconnectError::Reestablish(ReestablishError::PeerErrorResponse { message, .. }) => {
                assert_eq!(message.data, b"insufficient funds");
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn send_error_reaches_the_link() {
        let (link, journal) = ScriptedLink::new([Reply::Message(fixtures::reestablish(fixtures::CHANNEL))]);
        let session = Session::resume(link, &seeded_store(), Arc::new(fixtures::account()), fixtures::CHANNEL)
            .await
            .unwrap();

        let session = session.send_error(ErrorScope::All, b"shutting down".to_vec()).await.unwrap();
        session.close().await;

        let journal = journal.lock().unwrap();
        assert_eq!(journal.sent.len(), 2);
        match &journal.sent[1] {
            Message::Error(error) => {
                assert_eq!(error.scope(), ErrorScope::All);
                assert_eq!(error.data, b"shutting down");
            },
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(journal.closed);
    }

    #[tokio::test]
    async fn session_receives_replace_the_link() {
        let session = resumed(vec![
            Reply::Message(fixtures::reestablish(fixtures::CHANNEL)),
            Reply::Message(fixtures::shutdown(fixtures::CHANNEL)),
        ])
        .await;

        let (session, message) = session.recv_channel_msg().await.unwrap();
        assert_eq!(message.message_type(), MessageType::Shutdown);
        assert_eq!(session.link().receives(), 2);
    }
}
