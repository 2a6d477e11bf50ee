// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Contains the functions and definitions for dealing with messages that are
//! passed between members during a threshold protocol session.

use crate::{
    errors::{InternalError, Result},
    protocol::{Identifier, MemberId},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::Debug;
use tracing::{error, instrument, trace};

/////////////////
// Message API //
/////////////////

/// An enum consisting of all message types
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Key generation messages
    Dkg(DkgMessageType),
    /// Signing messages
    Sign(SignMessageType),
}

/// An enum consisting of all key generation message types
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum DkgMessageType {
    /// A hash commitment to the polynomial commitments, together with an
    /// ephemeral key for share encryption
    R1CommitHash,
    /// The information committed to in Round 1
    R2Decommit,
    /// An encrypted polynomial share, sent to one member only
    R2Share,
    /// The resulting public key share with a proof of knowledge
    R3Proof,
}

/// An enum consisting of all signing message types
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignMessageType {
    /// Commitment to the nonce point and the encrypted nonce share
    R1Commit,
    /// Multiplicative-to-additive responses, sent to one member only
    R2MtaResponse,
    /// The delta share and the nonce point decommitment
    R3Delta,
    /// The signature share
    R4SignatureShare,
}

/// A message that can be posted to (and read from) a keep channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// The type of the message
    pub(crate) message_type: MessageType,
    /// The session identifier that this message belongs to.
    identifier: Identifier,
    /// Which member this message is coming from.
    from: MemberId,
    /// Which member this message is addressed to; `None` for broadcasts.
    to: Option<MemberId>,
    /// The raw bytes for the message, which need to be verified.
    pub(crate) unverified_bytes: Vec<u8>,
}

impl Message {
    /// Creates a new instance of [`Message`].
    #[instrument(skip_all)]
    pub(crate) fn new<T>(
        message_type: MessageType,
        identifier: Identifier,
        from: MemberId,
        to: Option<MemberId>,
        unverified_bytes: &T,
    ) -> Result<Self>
    where
        T: Serialize,
    {
        trace!("New message created.");
        Ok(Self {
            message_type,
            identifier,
            from,
            to,
            unverified_bytes: serialize!(unverified_bytes)?,
        })
    }

    /// The message type associated with the message.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// The session identifier associated with the message.
    pub fn id(&self) -> Identifier {
        self.identifier
    }

    /// The member that sent this message.
    pub fn from(&self) -> &MemberId {
        &self.from
    }

    /// The member that should receive this message, if it was not broadcast.
    pub fn to(&self) -> Option<&MemberId> {
        self.to.as_ref()
    }

    /// Returns `true` if `member` should process this message.
    pub fn is_for(&self, member: &MemberId) -> bool {
        self.to.as_ref().map_or(true, |to| to == member) && &self.from != member
    }

    /// Check if the message type is correct.
    pub(crate) fn check_type(&self, expected_type: MessageType) -> Result<()> {
        if self.message_type() != expected_type {
            error!(
                "A message was misrouted. Expected {:?}, Got {:?}",
                expected_type,
                self.message_type()
            );
            return Err(InternalError::MisroutedMessage);
        }
        Ok(())
    }

    /// Check the type and decode the payload.
    pub(crate) fn decode<T: DeserializeOwned>(&self, expected_type: MessageType) -> Result<T> {
        self.check_type(expected_type)?;
        deserialize!(&self.unverified_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{KeepId, SessionKind};
    use k256::SecretKey;
    use rand::rngs::OsRng;
    use test_log::test;

    fn member() -> MemberId {
        MemberId::from_public_key(&SecretKey::random(&mut OsRng).public_key())
    }

    #[test]
    fn unicast_messages_are_only_for_their_recipient() {
        let (a, b, c) = (member(), member(), member());
        let sid = Identifier::derive(&KeepId::new("k"), &SessionKind::KeyGeneration, 0);
        let message = Message::new(
            MessageType::Dkg(DkgMessageType::R2Share),
            sid,
            a.clone(),
            Some(b.clone()),
            &7u32,
        )
        .unwrap();
        assert!(message.is_for(&b));
        assert!(!message.is_for(&c));
        assert!(!message.is_for(&a));

        let decoded: u32 = message
            .decode(MessageType::Dkg(DkgMessageType::R2Share))
            .unwrap();
        assert_eq!(decoded, 7);
        assert_eq!(
            message
                .decode::<u32>(MessageType::Sign(SignMessageType::R1Commit))
                .unwrap_err(),
            InternalError::MisroutedMessage
        );
    }
}
