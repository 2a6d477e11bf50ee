// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Keep-scoped broadcast channels on top of a peer-to-peer [`Provider`].
//!
//! Every payload travels inside an [`Envelope`] signed with the sender's
//! [`OperatorKey`]. A [`BroadcastChannel`] binds the topic of one keep to its
//! member list; its [`ChannelReceiver`]s only deliver verified messages from
//! other members and silently drop everything else.

pub mod local;
pub mod ready;

use crate::{
    errors::{InternalError, Result},
    messages::Message,
    protocol::{KeepId, MemberId},
    recovery::RecoveryAnnouncement,
};
use async_trait::async_trait;
use k256::{
    ecdsa::{
        signature::{Signer, Verifier},
        Signature as EcdsaSignature, SigningKey, VerifyingKey,
    },
    PublicKey,
};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, fmt::Debug, sync::Arc};
use tokio::sync::mpsc;
use tracing::{trace, warn};

pub use ready::{announce_presence, SessionTag, SignerReady};

/// The long-term key of this operator. Its public key is the operator's
/// [`MemberId`].
#[derive(Clone)]
pub struct OperatorKey {
    signing_key: SigningKey,
    member_id: MemberId,
}

impl Debug for OperatorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorKey")
            .field("member_id", &self.member_id)
            .field("signing_key", &"[redacted]")
            .finish()
    }
}

impl OperatorKey {
    /// Wrap an existing signing key.
    pub fn new(signing_key: SigningKey) -> Self {
        let member_id = MemberId::from_public_key(&PublicKey::from(signing_key.verifying_key()));
        Self {
            signing_key,
            member_id,
        }
    }

    /// Generate a fresh key.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::new(SigningKey::random(rng))
    }

    /// The member id of this operator.
    pub fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    fn sign(&self, message: &[u8]) -> EcdsaSignature {
        self.signing_key.sign(message)
    }
}

/// Everything that can be said on a keep channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NetMessage {
    /// Presence announcement preceding a session.
    Ready(SignerReady),
    /// A threshold protocol message.
    Protocol(Message),
    /// Beneficiary and fee announcement of liquidation recovery.
    Recovery(RecoveryAnnouncement),
}

/// A signed, topic-bound payload as carried by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    sender: MemberId,
    topic: String,
    payload: Vec<u8>,
    signature: Vec<u8>,
}

impl Envelope {
    fn signed_bytes(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(topic.len() + payload.len());
        bytes.extend_from_slice(topic.as_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Serialize `message` and sign it for `topic`.
    pub(crate) fn seal(key: &OperatorKey, topic: &str, message: &NetMessage) -> Result<Self> {
        let payload = serialize!(message)?;
        let signature = key.sign(&Self::signed_bytes(topic, &payload));
        Ok(Self {
            sender: key.member_id().clone(),
            topic: topic.to_string(),
            payload,
            signature: signature.to_bytes().to_vec(),
        })
    }

    /// Check the signature against the sender id and decode the payload.
    pub(crate) fn open(&self) -> Result<NetMessage> {
        let verifying_key = VerifyingKey::from(&self.sender.public_key()?);
        let signature = EcdsaSignature::from_slice(&self.signature)
            .map_err(|_| InternalError::Transport("malformed envelope signature".into()))?;
        verifying_key
            .verify(&Self::signed_bytes(&self.topic, &self.payload), &signature)
            .map_err(|_| InternalError::Transport("envelope signature mismatch".into()))?;
        deserialize!(&self.payload)
    }

    /// The claimed sender.
    pub fn sender(&self) -> &MemberId {
        &self.sender
    }

    /// The topic the envelope was published on.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Peer-to-peer transport.
///
/// Delivery is best effort: envelopes may be duplicated, and envelopes
/// published before a subscription exists are not replayed.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Publish an envelope to every subscriber of its topic.
    async fn publish(&self, envelope: Envelope) -> Result<()>;

    /// Receive every envelope published on `topic` from now on.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<Envelope>>;
}

/// A broadcast channel restricted to the members of one keep.
#[derive(Clone)]
pub struct BroadcastChannel {
    topic: String,
    key: Arc<OperatorKey>,
    members: Arc<Vec<MemberId>>,
    provider: Arc<dyn Provider>,
}

impl Debug for BroadcastChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastChannel")
            .field("topic", &self.topic)
            .field("member_id", self.key.member_id())
            .field("members", &self.members)
            .finish()
    }
}

/// Bind a channel to the topic of `keep_id`, accepting messages from
/// `members` only.
pub fn join_channel(
    provider: Arc<dyn Provider>,
    key: Arc<OperatorKey>,
    keep_id: &KeepId,
    members: Vec<MemberId>,
) -> BroadcastChannel {
    BroadcastChannel {
        topic: format!("keep/{keep_id}"),
        key,
        members: Arc::new(members),
        provider,
    }
}

impl BroadcastChannel {
    /// The topic this channel publishes on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The member id messages are signed as.
    pub fn member_id(&self) -> &MemberId {
        self.key.member_id()
    }

    /// Members accepted as senders.
    pub fn members(&self) -> &[MemberId] {
        &self.members
    }

    /// Sign and broadcast a message to every member.
    pub async fn send(&self, message: &NetMessage) -> Result<()> {
        let envelope = Envelope::seal(&self.key, &self.topic, message)?;
        self.provider.publish(envelope).await
    }

    /// Start receiving. Each session takes its own receiver, so concurrent
    /// sessions on one keep all see every message.
    pub async fn receiver(&self) -> Result<ChannelReceiver> {
        let inner = self.provider.subscribe(&self.topic).await?;
        Ok(ChannelReceiver {
            topic: self.topic.clone(),
            member_id: self.key.member_id().clone(),
            members: self.members.clone(),
            inner,
            deferred: VecDeque::new(),
        })
    }
}

/// Verified messages from other keep members.
#[derive(Debug)]
pub struct ChannelReceiver {
    topic: String,
    member_id: MemberId,
    members: Arc<Vec<MemberId>>,
    inner: mpsc::UnboundedReceiver<Envelope>,
    deferred: VecDeque<(MemberId, NetMessage)>,
}

impl ChannelReceiver {
    /// The next message and its authenticated sender, or `None` once the
    /// provider dropped the subscription.
    pub async fn recv(&mut self) -> Option<(MemberId, NetMessage)> {
        if let Some(deferred) = self.deferred.pop_front() {
            return Some(deferred);
        }
        loop {
            let envelope = self.inner.recv().await?;
            if envelope.topic != self.topic
                || envelope.sender == self.member_id
                || !self.members.contains(&envelope.sender)
            {
                trace!("Dropping envelope from {} on {}", envelope.sender, envelope.topic);
                continue;
            }
            match envelope.open() {
                Ok(message) => return Some((envelope.sender, message)),
                Err(e) => warn!("Dropping envelope from {}: {e}", envelope.sender),
            }
        }
    }

    /// Hand messages back so the next [`ChannelReceiver::recv`] calls return
    /// them first, in order.
    pub(crate) fn defer(&mut self, messages: Vec<(MemberId, NetMessage)>) {
        for message in messages.into_iter().rev() {
            self.deferred.push_front(message);
        }
    }
}
