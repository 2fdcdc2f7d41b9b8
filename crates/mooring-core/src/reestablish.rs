//! The `channel_reestablish` handshake.
//!
//! # Protocol Flow
//!
//! ```text
//!   us                                    peer
//!    │ ── channel_reestablish ──────────────> │
//!    │ <───────────── channel_reestablish ──  │   done
//!    │                                        │
//!    │ <────────────────── funding_locked ──  │   race: peer retransmits
//!    │ <───────────── channel_reestablish ──  │   done
//! ```
//!
//! Our message is flushed before we wait for theirs. A peer `error` in place
//! of either reply ends the handshake and returns the link so the caller can
//! report it. Anything else, including either kind addressed to another
//! channel, is an unexpected message; after a first reply that is neither
//! kind, no second receive is attempted.

use mooring_proto::{ChannelMessage, ChannelReestablish};

use crate::{
    channel::{ChannelCommand, ChannelEvent, ChannelStateMachine},
    error::{RecvMsgError, ReestablishError, invariant_violated},
    link::PeerLink,
};

/// Resynchronize a channel with its counterparty.
///
/// Returns the link as of the final receive and the machine in its
/// "reestablish sent" state. The counterparty's commitment numbers are not
/// compared against local state.
///
/// # Panics
///
/// If `machine` has no channel id, or if `CreateReestablish` does not yield
/// exactly one `channel_reestablish`. Both are bugs in the caller or the state
/// machine, never peer behavior.
pub async fn reestablish<L, M>(link: L, machine: M) -> Result<(L, M), ReestablishError<L>>
where
    L: PeerLink,
    M: ChannelStateMachine,
{
    let Some(channel_id) = machine.channel_id() else {
        invariant_violated(format_args!("reestablish requires a channel id"));
    };

    let (machine, ours) = create_reestablish(machine);
    tracing::debug!(
        %channel_id,
        remote = %link.remote_endpoint(),
        next_commitment_number = ours.next_commitment_number,
        next_revocation_number = ours.next_revocation_number,
        "sending channel_reestablish"
    );

    let link = link.send(ours.into()).await.map_err(ReestablishError::SendReestablish)?;

    let (link, first) = receive(link).await?;
    let (link, theirs) = match first {
        ChannelMessage::ChannelReestablish(theirs) if theirs.channel_id == channel_id => (link, theirs),
        ChannelMessage::FundingLocked(locked) if locked.channel_id == channel_id => {
            tracing::debug!(%channel_id, "peer sent funding_locked before channel_reestablish");
            let (link, second) = receive(link).await?;
            match second {
                ChannelMessage::ChannelReestablish(theirs) if theirs.channel_id == channel_id => (link, theirs),
                received => {
                    tracing::warn!(
                        %channel_id,
                        received_channel_id = %received.channel_id(),
                        message_type = %received.message_type(),
                        "expected channel_reestablish"
                    );
                    return Err(ReestablishError::ExpectedReestablish { received });
                },
            }
        },
        received => {
            tracing::warn!(
                %channel_id,
                received_channel_id = %received.channel_id(),
                message_type = %received.message_type(),
                "expected channel_reestablish or funding_locked"
            );
            return Err(ReestablishError::ExpectedReestablishOrFundingLocked { received });
        },
    };

    // Counterparty commitment numbers are accepted as reported.
    tracing::debug!(
        %channel_id,
        next_commitment_number = theirs.next_commitment_number,
        next_revocation_number = theirs.next_revocation_number,
        "channel reestablished"
    );

    Ok((link, machine))
}

fn create_reestablish<M: ChannelStateMachine>(machine: M) -> (M, ChannelReestablish) {
    let (machine, events) = match machine.execute(ChannelCommand::CreateReestablish) {
        Ok(result) => result,
        Err(err) => invariant_violated(format_args!("CreateReestablish failed: {err}")),
    };

    let mut events = events.into_iter();
    match (events.next(), events.next()) {
        (Some(ChannelEvent::WeSentChannelReestablish(message)), None) => (machine, message),
        (first, second) => invariant_violated(format_args!(
            "CreateReestablish must yield exactly one channel_reestablish, got {first:?} then {second:?}"
        )),
    }
}

async fn receive<L: PeerLink>(link: L) -> Result<(L, ChannelMessage), ReestablishError<L>> {
    link.recv_channel_msg().await.map_err(|err| match err {
        RecvMsgError::Link(err) => ReestablishError::ReceiveReestablish(err),
        RecvMsgError::PeerError { link, message } => {
            ReestablishError::PeerErrorResponse { link, message }
        },
    })
}

#[cfg(test)]
mod tests {
    use mooring_proto::{ChannelId, ErrorMessage, ErrorScope, MessageType};

    use super::*;
    use crate::{
        LinkError, PossibleBug,
        testing::{ChannelFixture, Misbehavior, Reply, ScriptedChannel, ScriptedLink, fixtures},
    };

    fn machine() -> ScriptedChannel {
        ScriptedChannel::new(ChannelFixture::funded(fixtures::CHANNEL))
    }

    #[tokio::test]
    async fn immediate_reestablish_succeeds() {
        let (link, journal) = ScriptedLink::new([Reply::Message(fixtures::reestablish(fixtures::CHANNEL))]);

        let (link, machine) = reestablish(link, machine()).await.unwrap();

        assert!(machine.reestablish_sent());
        assert_eq!(machine.channel_id(), Some(fixtures::CHANNEL));
        assert_eq!(link.receives(), 1);

        let journal = journal.lock().unwrap();
        assert_eq!(journal.sent.len(), 1);
        assert_eq!(journal.sent[0].message_type(), MessageType::ChannelReestablish);
    }

    #[tokio::test]
    async fn funding_locked_then_reestablish_succeeds() {
        let (link, journal) = ScriptedLink::new([
            Reply::Message(fixtures::funding_locked(fixtures::CHANNEL)),
            Reply::Message(fixtures::reestablish(fixtures::CHANNEL)),
        ]);

        let (link, _) = reestablish(link, machine()).await.unwrap();

        assert_eq!(link.receives(), 2);
        assert_eq!(journal.lock().unwrap().receives, 2);
    }

    #[tokio::test]
    async fn funding_locked_then_other_fails() {
        let (link, _) = ScriptedLink::new([
            Reply::Message(fixtures::funding_locked(fixtures::CHANNEL)),
            Reply::Message(fixtures::shutdown(fixtures::CHANNEL)),
        ]);

        let err = reestablish(link, machine()).await.unwrap_err();
        match err {
            ReestablishError::ExpectedReestablish { received } => {
                assert_eq!(received.message_type(), MessageType::Shutdown);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unexpected_first_reply_fails_without_second_receive() {
        let (link, journal) = ScriptedLink::new([
            Reply::Message(fixtures::shutdown(fixtures::CHANNEL)),
            Reply::Message(fixtures::reestablish(fixtures::CHANNEL)),
        ]);

        let err = reestablish(link, machine()).await.unwrap_err();

        assert!(matches!(err, ReestablishError::ExpectedReestablishOrFundingLocked { .. }));
        assert!(!err.possible_bug());
        assert_eq!(journal.lock().unwrap().receives, 1);
    }

    #[tokio::test]
    async fn reestablish_for_another_channel_is_unexpected() {
        let (link, journal) = ScriptedLink::new([
            Reply::Message(fixtures::reestablish(ChannelId([0x99; 32]))),
            Reply::Message(fixtures::reestablish(fixtures::CHANNEL)),
        ]);

        let err = reestablish(link, machine()).await.unwrap_err();

        match err {
            ReestablishError::ExpectedReestablishOrFundingLocked { received } => {
                assert_eq!(received.channel_id(), ChannelId([0x99; 32]));
            },
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(journal.lock().unwrap().receives, 1);
    }

    #[tokio::test]
    async fn foreign_reestablish_after_funding_locked_is_unexpected() {
        let (link, _) = ScriptedLink::new([
            Reply::Message(fixtures::funding_locked(fixtures::CHANNEL)),
            Reply::Message(fixtures::reestablish(ChannelId([0x99; 32]))),
        ]);

        let err = reestablish(link, machine()).await.unwrap_err();
        assert!(matches!(err, ReestablishError::ExpectedReestablish { .. }));
    }

    #[tokio::test]
    async fn funding_locked_for_another_channel_is_unexpected() {
        let (link, journal) = ScriptedLink::new([
            Reply::Message(fixtures::funding_locked(ChannelId([0x99; 32]))),
            Reply::Message(fixtures::reestablish(fixtures::CHANNEL)),
        ]);

        let err = reestablish(link, machine()).await.unwrap_err();

        assert!(matches!(err, ReestablishError::ExpectedReestablishOrFundingLocked { .. }));
        assert_eq!(journal.lock().unwrap().receives, 1);
    }

    #[tokio::test]
    async fn peer_error_is_returned_with_link() {
        let error = ErrorMessage::new(ErrorScope::Channel(fixtures::CHANNEL), b"insufficient funds".to_vec());
        let (link, _) = ScriptedLink::new([Reply::Error(error.clone())]);

        match reestablish(link, machine()).await.unwrap_err() {
            ReestablishError::PeerErrorResponse { link, message } => {
                assert_eq!(message.data, b"insufficient funds");
                assert_eq!(message, error);
                assert_eq!(link.receives(), 1);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn peer_error_after_funding_locked_is_classified_the_same() {
        let error = ErrorMessage::new(ErrorScope::All, b"restart".to_vec());
        let (link, _) = ScriptedLink::new([
            Reply::Message(fixtures::funding_locked(fixtures::CHANNEL)),
            Reply::Error(error),
        ]);

        let err = reestablish(link, machine()).await.unwrap_err();
        assert!(matches!(err, ReestablishError::PeerErrorResponse { .. }));
    }

    #[tokio::test]
    async fn closed_link_is_a_receive_failure() {
        let (link, _) = ScriptedLink::new([Reply::Closed]);

        let err = reestablish(link, machine()).await.unwrap_err();
        assert!(matches!(err, ReestablishError::ReceiveReestablish(LinkError::Closed)));
    }

    #[tokio::test]
    async fn send_failure_skips_receive() {
        let (link, journal) = ScriptedLink::new([Reply::Message(fixtures::reestablish(fixtures::CHANNEL))]);

        let err = reestablish(link.failing_sends(), machine()).await.unwrap_err();

        assert!(matches!(err, ReestablishError::SendReestablish(LinkError::Closed)));
        assert_eq!(journal.lock().unwrap().receives, 0);
    }

    #[tokio::test]
    #[should_panic(expected = "reestablish requires a channel id")]
    async fn missing_channel_id_panics() {
        let (link, _) = ScriptedLink::new([Reply::Closed]);
        let machine = ScriptedChannel::new(ChannelFixture { channel_id: None, ..ChannelFixture::funded(ChannelId([1; 32])) });

        let _ = reestablish(link, machine).await;
    }

    #[tokio::test]
    #[should_panic(expected = "exactly one channel_reestablish")]
    async fn double_reestablish_panics() {
        let (link, _) = ScriptedLink::new([Reply::Closed]);
        let machine = ScriptedChannel::new(ChannelFixture {
            misbehavior: Some(Misbehavior::DoubleReestablish),
            ..ChannelFixture::funded(fixtures::CHANNEL)
        });

        let _ = reestablish(link, machine).await;
    }

    #[tokio::test]
    #[should_panic(expected = "CreateReestablish failed")]
    async fn rejected_create_reestablish_panics() {
        let (link, _) = ScriptedLink::new([Reply::Closed]);
        let machine = ScriptedChannel::new(ChannelFixture {
            misbehavior: Some(Misbehavior::RejectCommands),
            ..ChannelFixture::funded(fixtures::CHANNEL)
        });

        let _ = reestablish(link, machine).await;
    }

    #[tokio::test]
    #[should_panic(expected = "exactly one channel_reestablish")]
    async fn funding_locked_alongside_reestablish_panics() {
        let (link, _) = ScriptedLink::new([Reply::Closed]);
        let machine = ScriptedChannel::new(ChannelFixture {
            misbehavior: Some(Misbehavior::ResendFundingLocked),
            ..ChannelFixture::funded(fixtures::CHANNEL)
        });

        let _ = reestablish(link, machine).await;
    }

    #[tokio::test]
    #[should_panic(expected = "exactly one channel_reestablish")]
    async fn silent_reestablish_panics() {
        let (link, _) = ScriptedLink::new([Reply::Closed]);
        let machine = ScriptedChannel::new(ChannelFixture {
            misbehavior: Some(Misbehavior::SilentReestablish),
            ..ChannelFixture::funded(fixtures::CHANNEL)
        });

        let _ = reestablish(link, machine).await;
    }
}
