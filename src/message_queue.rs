// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The `MessageQueue` type for holding messages that arrived before the
//! round they belong to.
//!
//! Members progress through rounds at different speeds, so a message for
//! round two can arrive while round one is still collecting. Such messages
//! are parked here by [`MessageType`] and replayed once the round opens.

use crate::{
    messages::{Message, MessageType},
    protocol::MemberId,
};
use std::collections::HashMap;

/// A type for storing a queue of [`Message`]s by [`MessageType`].
#[derive(Clone, Default)]
pub(crate) struct MessageQueue(HashMap<MessageType, Vec<Message>>);

impl MessageQueue {
    /// Store a message by its [`MessageType`].
    pub(crate) fn store(&mut self, message: Message) {
        self.0
            .entry(message.message_type())
            .or_default()
            .push(message);
    }

    /// Retrieve (and remove) all [`Message`]s of a given [`MessageType`].
    pub(crate) fn retrieve_all(&mut self, message_type: MessageType) -> Vec<Message> {
        self.0.remove(&message_type).unwrap_or_default()
    }

    /// Retrieve (and remove) the [`Message`]s of a given [`MessageType`] sent
    /// by `sender`.
    pub(crate) fn retrieve(&mut self, message_type: MessageType, sender: &MemberId) -> Vec<Message> {
        let queue = self.0.remove(&message_type).unwrap_or_default();
        let (out, rest): (Vec<_>, Vec<_>) =
            queue.into_iter().partition(|msg| msg.from() == sender);
        if !rest.is_empty() {
            let _ = self.0.insert(message_type, rest);
        }
        out
    }

    /// Number of parked messages.
    pub(crate) fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        messages::{DkgMessageType, SignMessageType},
        protocol::{Identifier, KeepId, SessionKind},
    };
    use k256::SecretKey;
    use rand::rngs::OsRng;
    use test_log::test;

    #[test]
    fn messages_are_retrieved_once() {
        let sid = Identifier::derive(&KeepId::new("k"), &SessionKind::KeyGeneration, 0);
        let alice = MemberId::from_public_key(&SecretKey::random(&mut OsRng).public_key());
        let bob = MemberId::from_public_key(&SecretKey::random(&mut OsRng).public_key());
        let decommit = MessageType::Dkg(DkgMessageType::R2Decommit);

        let mut queue = MessageQueue::default();
        for from in [&alice, &bob, &alice] {
            queue.store(Message::new(decommit, sid, from.clone(), None, &()).unwrap());
        }
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.retrieve(decommit, &alice).len(), 2);
        assert!(queue.retrieve(decommit, &alice).is_empty());
        assert!(queue
            .retrieve_all(MessageType::Sign(SignMessageType::R1Commit))
            .is_empty());
        assert_eq!(queue.retrieve_all(decommit).len(), 1);
        assert_eq!(queue.len(), 0);
    }
}
