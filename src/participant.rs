// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! This module contains [`ProtocolParticipant`], the core trait implemented
//! by the key generation and signing sessions.

use crate::{
    errors::{InternalError, Result},
    local_storage::{storage as local_storage, LocalStorage, TypeTag},
    messages::{Message, MessageType},
    protocol::{Identifier, MemberId},
};
use rand::{CryptoRng, RngCore};
use std::fmt::Debug;
use tracing::error;

/// Possible outcomes from processing one or more messages.
///
/// Processing a message can park it for later, complete a round (producing
/// messages for other members), produce the session output, or both.
pub enum ProcessOutcome<O> {
    /// The message was not fully processed; we need more inputs to continue.
    Incomplete,
    /// The message was processed successfully but the session isn't done.
    Processed(Vec<Message>),
    /// The session is done for this member but there are still messages to
    /// send to others.
    TerminatedForThisParticipant(O, Vec<Message>),
    /// The session is done and there are no more messages to send.
    Terminated(O),
}

impl<O> Debug for ProcessOutcome<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let descriptor = match self {
            ProcessOutcome::Incomplete => "Incomplete",
            ProcessOutcome::Processed(_) => "Processed",
            ProcessOutcome::Terminated(_) => "Terminated",
            ProcessOutcome::TerminatedForThisParticipant(_, _) => "Terminated for this participant",
        };
        write!(f, "ProcessOutcome::{descriptor}")
    }
}

impl<O> ProcessOutcome<O> {
    /// Create a [`ProcessOutcome`] from an optional output and a set of
    /// outgoing messages.
    pub(crate) fn from(output: Option<O>, messages: Vec<Message>) -> Self {
        match (output, messages.len()) {
            (None, 0) => Self::Incomplete,
            (None, _) => Self::Processed(messages),
            (Some(o), 0) => Self::Terminated(o),
            (Some(o), _) => Self::TerminatedForThisParticipant(o, messages),
        }
    }

    /// Convert the [`ProcessOutcome`] into its constituent parts.
    pub(crate) fn into_parts(self) -> (Option<O>, Vec<Message>) {
        match self {
            Self::Incomplete => (None, Vec::new()),
            Self::Processed(msgs) => (None, msgs),
            Self::TerminatedForThisParticipant(output, msgs) => (Some(output), msgs),
            Self::Terminated(output) => (Some(output), Vec::new()),
        }
    }

    /// Collect a set of `ProcessOutcome`s into a single outcome.
    ///
    /// All messages are kept; more than one output is an error.
    pub(crate) fn collect(outcomes: Vec<Self>) -> Result<Self> {
        let (outputs, messages): (Vec<_>, Vec<_>) =
            outcomes.into_iter().map(Self::into_parts).unzip();

        let mut actual_outputs = outputs.into_iter().flatten();
        let output = actual_outputs.next();
        if actual_outputs.next().is_some() {
            error!("Produced more than one output in a single session.");
            return Err(InternalError::InternalInvariantFailed);
        }

        let messages = messages.into_iter().flatten().collect();
        Ok(ProcessOutcome::from(output, messages))
    }

    /// Combine a `ProcessOutcome` with an additional set of [`Message`]s.
    pub(crate) fn with_messages(self, mut messages: Vec<Message>) -> Self {
        let (output, mut original_messages) = self.into_parts();
        original_messages.append(&mut messages);
        Self::from(output, original_messages)
    }
}

/// Status of a protocol session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Created; first round not yet sent.
    Initialized,
    /// First round sent; collecting peer messages.
    Running,
    /// Output produced.
    TerminatedSuccessfully,
}

/// These are the public-facing methods of a protocol session.
pub trait ProtocolParticipant {
    /// Output type of a successful protocol execution.
    type Output: Debug;

    /// Return the member id of this participant.
    fn id(&self) -> &MemberId;

    /// Return the other members taking part in the session.
    fn other_ids(&self) -> &[MemberId];

    /// Returns a list of all member ids, including `self`'s.
    fn all_participants(&self) -> Vec<MemberId> {
        let mut participants = self.other_ids().to_vec();
        participants.push(self.id().clone());
        participants
    }

    /// The session identifier for the current session.
    fn sid(&self) -> Identifier;

    /// The status of the protocol execution.
    fn status(&self) -> Status;

    /// Produce the first round of messages.
    fn initialize<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<ProcessOutcome<Self::Output>>;

    /// Process an incoming message.
    ///
    /// This method parses the message, does any immediate per-message
    /// processing, and if all messages of a round have been received,
    /// computes the next round. Messages that arrive early are stashed and
    /// replayed when their round opens.
    fn process_message<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Self::Output>>;
}

pub(crate) trait InnerProtocolParticipant: ProtocolParticipant {
    /// Returns a reference to the [`LocalStorage`] associated with this
    /// session.
    fn local_storage(&self) -> &LocalStorage;
    /// Returns a mutable reference to the [`LocalStorage`] associated with
    /// this session.
    fn local_storage_mut(&mut self) -> &mut LocalStorage;

    /// Check that a message belongs to this session, comes from a peer, and
    /// is addressed to us.
    fn validate_message(&self, message: &Message) -> Result<()> {
        if message.id() != self.sid() {
            error!("Message for session {} reached session {}", message.id(), self.sid());
            return Err(InternalError::MisroutedMessage);
        }
        if !self.other_ids().contains(message.from()) {
            error!("Message from {} who is not part of the session", message.from());
            return Err(InternalError::PeerMisbehaved(
                message.from().to_string(),
                "not a session member".into(),
            ));
        }
        if !message.is_for(self.id()) {
            return Err(InternalError::WrongMessageRecipient);
        }
        Ok(())
    }

    /// Retrieves an item from [`LocalStorage`] associated with the given
    /// [`TypeTag`] for this member, populating it with its [`Default`] if
    /// absent.
    fn get_from_storage<T: TypeTag>(&mut self) -> Result<&mut T::Value>
    where
        T::Value: Default,
    {
        let id = self.id().clone();
        if !self.local_storage().contains::<T>(&id) {
            self.local_storage_mut().store::<T>(&id, Default::default());
        }
        self.local_storage_mut()
            .retrieve_mut::<T>(&id)
            .ok_or(InternalError::InternalInvariantFailed)
    }

    /// Store [`Message`] in the message queue.
    fn stash_message(&mut self, message: &Message) -> Result<()> {
        let message_storage = self.get_from_storage::<local_storage::MessageQueue>()?;
        message_storage.store(message.clone());
        Ok(())
    }

    /// Fetch (and remove) all [`Message`]s matching the given [`MessageType`].
    fn fetch_messages(&mut self, message_type: MessageType) -> Result<Vec<Message>> {
        let message_storage = self.get_from_storage::<local_storage::MessageQueue>()?;
        Ok(message_storage.retrieve_all(message_type))
    }

    fn write_progress(&mut self, func_name: String) -> Result<()> {
        let progress_storage = self.get_from_storage::<local_storage::ProgressStore>()?;
        let _ = progress_storage.insert(func_name);
        Ok(())
    }

    fn read_progress(&mut self, func_name: String) -> Result<bool> {
        let progress_storage = self.get_from_storage::<local_storage::ProgressStore>()?;
        Ok(progress_storage.contains(&func_name))
    }
}

#[macro_export]
/// A macro to keep track of which functions have already been run in a given
/// session. Must be a `self.function()` so that we can access local storage.
macro_rules! run_only_once {
    ($self:ident . $func_name:ident $args:tt) => {{
        if $self.read_progress(stringify!($func_name).to_string())? {
            Ok(vec![])
        } else {
            $self.write_progress(stringify!($func_name).to_string())?;
            $self.$func_name$args
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        messages::DkgMessageType,
        protocol::{KeepId, SessionKind},
    };
    use k256::SecretKey;
    use rand::rngs::OsRng;
    use test_log::test;

    fn message() -> Message {
        let sid = Identifier::derive(&KeepId::new("k"), &SessionKind::KeyGeneration, 0);
        let from = MemberId::from_public_key(&SecretKey::random(&mut OsRng).public_key());
        Message::new(MessageType::Dkg(DkgMessageType::R3Proof), sid, from, None, &()).unwrap()
    }

    #[test]
    fn outcomes_consolidate_messages() {
        let outcome = ProcessOutcome::<u8>::collect(vec![
            ProcessOutcome::Processed(vec![message()]),
            ProcessOutcome::Incomplete,
            ProcessOutcome::TerminatedForThisParticipant(7, vec![message()]),
        ])
        .unwrap();
        let (output, messages) = outcome.into_parts();
        assert_eq!(output, Some(7));
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn two_outputs_are_an_error() {
        assert!(ProcessOutcome::<u8>::collect(vec![
            ProcessOutcome::Terminated(1),
            ProcessOutcome::Terminated(2),
        ])
        .is_err());
    }

    #[test]
    fn adding_messages_keeps_output() {
        let outcome = ProcessOutcome::Terminated(3u8).with_messages(vec![message()]);
        assert!(matches!(
            outcome,
            ProcessOutcome::TerminatedForThisParticipant(3, _)
        ));
        assert!(matches!(
            ProcessOutcome::<u8>::from(None, vec![]),
            ProcessOutcome::Incomplete
        ));
    }
}
