// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Presence announcement preceding every protocol session.

use crate::{
    errors::{InternalError, Result},
    net::{BroadcastChannel, ChannelReceiver, NetMessage},
    protocol::{Identifier, KeepId, MemberId, SessionKind},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt::{Display, Formatter},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Our announcement is repeated this often while peers are missing.
const RETRANSMIT_INTERVAL: Duration = Duration::from_secs(1);

/// "I am here and ready to run the session tagged `tag`."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerReady {
    /// Keep the session belongs to.
    pub keep_id: KeepId,
    /// The announcing member.
    pub member_id: MemberId,
    /// Session tag, see [`SessionTag`].
    pub tag: String,
}

/// Distinguishes the handshakes of concurrent sessions on one keep, and of
/// successive attempts of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTag {
    /// The operation the session runs
    pub kind: SessionKind,
    /// Attempt counter, starting at zero
    pub attempt: u32,
}

impl SessionTag {
    /// Tag of attempt `attempt` of `kind`.
    pub fn new(kind: SessionKind, attempt: u32) -> Self {
        Self { kind, attempt }
    }

    /// The protocol session identifier matching this handshake.
    pub fn session_id(&self, keep_id: &KeepId) -> Identifier {
        Identifier::derive(keep_id, &self.kind, self.attempt)
    }
}

impl Display for SessionTag {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self.kind {
            SessionKind::KeyGeneration => write!(f, "dkg:{}", self.attempt),
            SessionKind::Signing(digest) => {
                write!(f, "sign:{}:{}", hex::encode(digest), self.attempt)
            }
            SessionKind::LiquidationRecovery => write!(f, "recovery:{}", self.attempt),
        }
    }
}

/// Announce this member and wait for the `expected` members to do the same,
/// at most `timeout`.
///
/// Returns the confirmed members, this one included, in the order of
/// `expected`. A partial set is returned when the deadline passes; the caller
/// decides whether that is enough. Non-handshake messages received meanwhile
/// are handed back to `receiver`.
#[instrument(skip_all, fields(keep_id = %keep_id, tag = %tag), err(Debug))]
pub async fn announce_presence(
    channel: &BroadcastChannel,
    receiver: &mut ChannelReceiver,
    keep_id: &KeepId,
    tag: SessionTag,
    expected: &[MemberId],
    timeout: Duration,
) -> Result<Vec<MemberId>> {
    let tag = tag.to_string();
    let own = NetMessage::Ready(SignerReady {
        keep_id: keep_id.clone(),
        member_id: channel.member_id().clone(),
        tag: tag.clone(),
    });
    let mut confirmed = HashSet::from([channel.member_id().clone()]);
    let mut deferred = Vec::new();
    let deadline = Instant::now() + timeout;
    let mut retransmit = tokio::time::interval(RETRANSMIT_INTERVAL);

    while !expected.iter().all(|m| confirmed.contains(m)) {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                warn!(
                    "Only {} of {} members announced themselves in time",
                    confirmed.len(),
                    expected.len()
                );
                break;
            }
            _ = retransmit.tick() => channel.send(&own).await?,
            received = receiver.recv() => match received {
                None => return Err(InternalError::Transport("subscription closed".into())),
                Some((sender, NetMessage::Ready(ready))) => {
                    if ready.tag != tag || &ready.keep_id != keep_id || ready.member_id != sender {
                        continue;
                    }
                    if expected.contains(&sender) && confirmed.insert(sender.clone()) {
                        debug!("Member {sender} is ready");
                        // Answer newcomers right away; they missed our earlier announcements.
                        channel.send(&own).await?;
                    }
                }
                Some(other) => deferred.push(other),
            }
        }
    }

    receiver.defer(deferred);
    let present: Vec<MemberId> = expected
        .iter()
        .filter(|m| confirmed.contains(*m))
        .cloned()
        .collect();
    info!("{} of {} members are ready", present.len(), expected.len());
    Ok(present)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        messages::{DkgMessageType, Message, MessageType},
        net::{join_channel, local::LocalProvider, OperatorKey, Provider},
    };
    use rand::rngs::OsRng;
    use std::sync::Arc;
    use test_log::test;

    fn group(size: usize) -> (Vec<Arc<OperatorKey>>, Vec<MemberId>) {
        let keys: Vec<_> = (0..size)
            .map(|_| Arc::new(OperatorKey::random(&mut OsRng)))
            .collect();
        let members = keys.iter().map(|k| k.member_id().clone()).collect();
        (keys, members)
    }

    async fn announce(
        provider: Arc<dyn Provider>,
        key: Arc<OperatorKey>,
        members: Vec<MemberId>,
        timeout: Duration,
    ) -> Result<Vec<MemberId>> {
        let keep = KeepId::new("0xkeep");
        let channel = join_channel(provider, key, &keep, members.clone());
        let mut receiver = channel.receiver().await?;
        announce_presence(
            &channel,
            &mut receiver,
            &keep,
            SessionTag::new(SessionKind::KeyGeneration, 0),
            &members,
            timeout,
        )
        .await
    }

    #[test]
    fn tags_name_the_session() {
        assert_eq!(SessionTag::new(SessionKind::KeyGeneration, 0).to_string(), "dkg:0");
        assert_eq!(
            SessionTag::new(SessionKind::LiquidationRecovery, 2).to_string(),
            "recovery:2"
        );
        let tag = SessionTag::new(SessionKind::Signing([0xab; 32]), 3);
        assert_eq!(tag.to_string(), format!("sign:{}:3", "ab".repeat(32)));
        let keep = KeepId::new("0xkeep");
        assert_eq!(
            tag.session_id(&keep),
            Identifier::derive(&keep, &SessionKind::Signing([0xab; 32]), 3)
        );
    }

    #[test(tokio::test)]
    async fn all_members_confirm_each_other() -> Result<()> {
        let provider: Arc<dyn Provider> = Arc::new(LocalProvider::new());
        let (keys, members) = group(3);
        let tasks: Vec<_> = keys
            .into_iter()
            .map(|key| {
                tokio::spawn(announce(
                    provider.clone(),
                    key,
                    members.clone(),
                    Duration::from_secs(10),
                ))
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap()?, members);
        }
        Ok(())
    }

    #[test(tokio::test)]
    async fn late_member_still_sees_everyone() -> Result<()> {
        let provider: Arc<dyn Provider> = Arc::new(LocalProvider::new());
        let (mut keys, members) = group(2);
        let late = keys.pop().unwrap();
        let early = tokio::spawn(announce(
            provider.clone(),
            keys.pop().unwrap(),
            members.clone(),
            Duration::from_secs(10),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let late = announce(provider, late, members.clone(), Duration::from_secs(10)).await?;
        assert_eq!(late, members);
        assert_eq!(early.await.unwrap()?, members);
        Ok(())
    }

    #[test(tokio::test)]
    async fn absent_member_yields_partial_set() -> Result<()> {
        let provider: Arc<dyn Provider> = Arc::new(LocalProvider::new());
        let (keys, members) = group(3);
        let present = announce(
            provider,
            keys[1].clone(),
            members.clone(),
            Duration::from_millis(200),
        )
        .await?;
        assert_eq!(present, vec![members[1].clone()]);
        Ok(())
    }

    #[test(tokio::test)]
    async fn protocol_messages_are_kept_for_the_session() -> Result<()> {
        let provider: Arc<dyn Provider> = Arc::new(LocalProvider::new());
        let (keys, members) = group(2);
        let keep = KeepId::new("0xkeep");
        let alice = join_channel(provider.clone(), keys[0].clone(), &keep, members.clone());
        let bob = join_channel(provider, keys[1].clone(), &keep, members.clone());
        let mut receiver = alice.receiver().await?;

        let sid = Identifier::derive(&keep, &SessionKind::KeyGeneration, 0);
        let early = Message::new(
            MessageType::Dkg(DkgMessageType::R1CommitHash),
            sid,
            members[1].clone(),
            None,
            &(),
        )?;
        bob.send(&NetMessage::Protocol(early)).await?;
        bob.send(&NetMessage::Ready(SignerReady {
            keep_id: keep.clone(),
            member_id: members[1].clone(),
            tag: "dkg:0".into(),
        }))
        .await?;

        let present = announce_presence(
            &alice,
            &mut receiver,
            &keep,
            SessionTag::new(SessionKind::KeyGeneration, 0),
            &members,
            Duration::from_secs(10),
        )
        .await?;
        assert_eq!(present, members);
        let (_, next) = receiver.recv().await.unwrap();
        assert!(matches!(next, NetMessage::Protocol(m) if m.id() == sid));
        Ok(())
    }
}
