// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    auxinfo::{AuxInfoProof, AuxInfoPublic},
    errors::{InternalError, Result},
    keygen::{
        commit::{KeygenCommit, KeygenDecommit, KeygenRoundOne},
        share::{EncryptedShare, KeySharePrivate, KeySharePublic},
    },
    local_storage::{LocalStorage, TypeTag},
    messages::{DkgMessageType, Message, MessageType},
    paillier::DecryptionKey,
    participant::{InnerProtocolParticipant, ProcessOutcome, ProtocolParticipant, Status},
    protocol::{Identifier, MemberId},
    run_only_once,
    utils::{
        evaluate_commitments, evaluate_polynomial, evaluation_point, random_nonzero_scalar,
        random_scalar, CurvePoint,
    },
    zkp::{
        pifac::{PiFacInput, PiFacProof, PiFacSecret},
        pisch::{PiSchInput, PiSchProof, PiSchSecret},
        Proof,
    },
};
use k256::Scalar;
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use zeroize::Zeroize;

mod storage {
    use super::*;

    pub(super) struct Coefficients;
    impl TypeTag for Coefficients {
        type Value = Vec<Scalar>;
    }
    pub(super) struct EphemeralSecret;
    impl TypeTag for EphemeralSecret {
        type Value = Scalar;
    }
    pub(super) struct EphemeralKey;
    impl TypeTag for EphemeralKey {
        type Value = CurvePoint;
    }
    pub(super) struct Commit;
    impl TypeTag for Commit {
        type Value = KeygenCommit;
    }
    pub(super) struct Decommit;
    impl TypeTag for Decommit {
        type Value = KeygenDecommit;
    }
    pub(super) struct AuxInfo;
    impl TypeTag for AuxInfo {
        type Value = AuxInfoPublic;
    }
    pub(super) struct ReceivedShare;
    impl TypeTag for ReceivedShare {
        type Value = Scalar;
    }
    pub(super) struct PrivateShare;
    impl TypeTag for PrivateShare {
        type Value = KeySharePrivate;
    }
    pub(super) struct PublicShare;
    impl TypeTag for PublicShare {
        type Value = KeySharePublic;
    }
    pub(super) struct ConfirmedPublicShare;
    impl TypeTag for ConfirmedPublicShare {
        type Value = ();
    }
}

/// Round two unicast payload: the encrypted share for the recipient and a
/// proof, under the recipient's parameters, that our modulus has no small
/// factors.
#[derive(Serialize, Deserialize, Clone, Debug)]
struct KeygenShare {
    share: EncryptedShare,
    factors: PiFacProof,
}

/// Round three payload: the sender's public share and a proof it knows the
/// matching private share.
#[derive(Serialize, Deserialize, Clone, Debug)]
struct KeygenRoundThree {
    public_share: KeySharePublic,
    proof: PiSchProof,
}

/// Everything a member holds after a successful key generation.
#[derive(Debug, Clone)]
pub(crate) struct KeygenOutput {
    pub(crate) private_share: KeySharePrivate,
    /// Public shares of every member, in group order.
    pub(crate) public_shares: Vec<KeySharePublic>,
    pub(crate) group_public_key: CurvePoint,
    /// Auxiliary information of every member, in group order.
    pub(crate) aux_infos: Vec<AuxInfoPublic>,
    pub(crate) paillier_decryption_key: DecryptionKey,
}

/// One member's view of a distributed key generation session.
///
/// Members are identified by their position in `members`; a member at
/// position `i` receives the evaluation of every polynomial at `i + 1`. The
/// session produces a degree-`threshold` sharing, so any `threshold + 1`
/// members can later sign.
#[derive(Debug)]
pub(crate) struct KeygenParticipant {
    sid: Identifier,
    id: MemberId,
    other_ids: Vec<MemberId>,
    members: Vec<MemberId>,
    threshold: usize,
    paillier: DecryptionKey,
    local_storage: LocalStorage,
    status: Status,
}

impl KeygenParticipant {
    pub(crate) fn new(
        sid: Identifier,
        id: MemberId,
        members: Vec<MemberId>,
        threshold: usize,
        paillier: DecryptionKey,
    ) -> Result<Self> {
        if members.len() < 2 {
            return arg_err!("key generation needs at least two members");
        }
        if threshold + 1 > members.len() {
            return arg_err!("threshold must be smaller than the group size");
        }
        if !members.contains(&id) {
            return arg_err!("this member is not part of the group");
        }
        let mut deduplicated = members.clone();
        deduplicated.sort();
        deduplicated.dedup();
        if deduplicated.len() != members.len() {
            return arg_err!("group contains duplicate members");
        }
        let other_ids = members.iter().filter(|m| **m != id).cloned().collect();
        Ok(Self {
            sid,
            id,
            other_ids,
            members,
            threshold,
            paillier,
            local_storage: Default::default(),
            status: Status::Initialized,
        })
    }

    fn index_of(&self, member: &MemberId) -> Result<usize> {
        self.members
            .iter()
            .position(|m| m == member)
            .ok_or(InternalError::InternalInvariantFailed)
    }

    fn schnorr_transcript(&self, sender: &MemberId, context: &'static [u8]) -> Transcript {
        let mut transcript = Transcript::new(b"keep dkg schnorr");
        transcript.append_message(b"context", context);
        transcript.append_message(b"sid", &self.sid.to_bytes());
        transcript.append_message(b"sender", sender.as_bytes());
        transcript
    }

    fn factors_transcript(&self, sender: &MemberId, recipient: &MemberId) -> Transcript {
        let mut transcript = Transcript::new(b"keep dkg no small factors");
        transcript.append_message(b"sid", &self.sid.to_bytes());
        transcript.append_message(b"sender", sender.as_bytes());
        transcript.append_message(b"recipient", recipient.as_bytes());
        transcript
    }

    fn misbehaved(member: &MemberId, reason: &str) -> InternalError {
        error!("Member {member} misbehaved during key generation: {reason}");
        InternalError::PeerMisbehaved(member.to_string(), reason.into())
    }

    #[instrument(skip_all, err(Debug))]
    fn gen_round_one_msgs<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<Vec<Message>> {
        info!("Generating round one key generation messages.");

        let mut coefficients = Vec::with_capacity(self.threshold + 1);
        coefficients.push(random_nonzero_scalar(rng));
        for _ in 0..self.threshold {
            coefficients.push(random_scalar(rng));
        }
        let commitments: Vec<CurvePoint> = coefficients
            .iter()
            .map(|a| CurvePoint::GENERATOR.multiply(a))
            .collect();

        let proof = PiSchProof::prove(
            &PiSchInput::new(&commitments[0]),
            &PiSchSecret::new(&coefficients[0]),
            &mut self.schnorr_transcript(&self.id, b"constant term"),
            rng,
        )?;
        let decommit = KeygenDecommit::new(
            rng,
            self.sid,
            &self.id,
            commitments,
            proof,
        );
        let commit = decommit.commit()?;

        let (aux_info, lambda) = AuxInfoPublic::new(&self.paillier, rng)?;
        let aux_proof =
            AuxInfoProof::prove(rng, self.sid, &self.id, &aux_info, &self.paillier, &lambda)?;

        let ephemeral_secret = random_nonzero_scalar(rng);
        let ephemeral_key = CurvePoint::GENERATOR.multiply(&ephemeral_secret);

        let id = self.id.clone();
        self.local_storage
            .store::<storage::Coefficients>(&id, coefficients);
        self.local_storage
            .store::<storage::EphemeralSecret>(&id, ephemeral_secret);
        self.local_storage
            .store::<storage::EphemeralKey>(&id, ephemeral_key);
        self.local_storage
            .store::<storage::Commit>(&id, commit.clone());
        self.local_storage
            .store::<storage::Decommit>(&id, decommit);
        self.local_storage
            .store::<storage::AuxInfo>(&id, aux_info.clone());

        let message = Message::new(
            MessageType::Dkg(DkgMessageType::R1CommitHash),
            self.sid,
            self.id.clone(),
            None,
            &KeygenRoundOne {
                commit,
                ephemeral_key,
                aux_info,
                aux_proof,
            },
        )?;
        Ok(vec![message])
    }

    #[instrument(skip_all, err(Debug))]
    fn handle_round_one_msg<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<KeygenOutput>> {
        let round_one: KeygenRoundOne =
            message.decode(MessageType::Dkg(DkgMessageType::R1CommitHash))?;
        if self.local_storage.contains::<storage::Commit>(message.from()) {
            warn!("Ignoring repeated round one message from {}", message.from());
            return Ok(ProcessOutcome::Incomplete);
        }
        round_one
            .aux_proof
            .verify(self.sid, message.from(), &round_one.aux_info)
            .map_err(|_| Self::misbehaved(message.from(), "invalid auxiliary information"))?;
        self.local_storage
            .store::<storage::AuxInfo>(message.from(), round_one.aux_info);
        self.local_storage
            .store::<storage::Commit>(message.from(), round_one.commit);
        self.local_storage
            .store::<storage::EphemeralKey>(message.from(), round_one.ephemeral_key);

        if !self.round_one_done() {
            return Ok(ProcessOutcome::Incomplete);
        }

        let messages = run_only_once!(self.gen_round_two_msgs(rng))?;
        let mut stashed = self.fetch_messages(MessageType::Dkg(DkgMessageType::R2Decommit))?;
        stashed.extend(self.fetch_messages(MessageType::Dkg(DkgMessageType::R2Share))?);
        let outcomes = stashed
            .iter()
            .map(|msg| self.process_message(rng, msg))
            .collect::<Result<Vec<_>>>()?;
        Ok(ProcessOutcome::collect(outcomes)?.with_messages(messages))
    }

    fn round_one_done(&self) -> bool {
        self.local_storage
            .contains_for_all_ids::<storage::Commit>(&self.other_ids)
    }

    #[instrument(skip_all, err(Debug))]
    fn gen_round_two_msgs<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<Vec<Message>> {
        info!("Generating round two key generation messages.");

        let decommit = self.local_storage.retrieve::<storage::Decommit>(&self.id)?;
        let mut messages = vec![Message::new(
            MessageType::Dkg(DkgMessageType::R2Decommit),
            self.sid,
            self.id.clone(),
            None,
            decommit,
        )?];

        let coefficients = self.local_storage.retrieve::<storage::Coefficients>(&self.id)?;
        let ephemeral_secret = self.local_storage.retrieve::<storage::EphemeralSecret>(&self.id)?;
        let own_modulus = self.paillier.encryption_key().n();
        for other in &self.other_ids {
            let x = evaluation_point(self.index_of(other)?);
            let mut share = evaluate_polynomial(coefficients, &x);
            let recipient_key = self.local_storage.retrieve::<storage::EphemeralKey>(other)?;
            let encrypted = EncryptedShare::encrypt(
                rng,
                &share,
                ephemeral_secret,
                recipient_key,
                self.sid,
                &self.id,
                other,
            );
            share.zeroize();
            let recipient_info = self.local_storage.retrieve::<storage::AuxInfo>(other)?;
            let factors = PiFacProof::prove(
                &PiFacInput::new(recipient_info.params(), own_modulus),
                &PiFacSecret::new(&self.paillier),
                &mut self.factors_transcript(&self.id, other),
                rng,
            )?;
            messages.push(Message::new(
                MessageType::Dkg(DkgMessageType::R2Share),
                self.sid,
                self.id.clone(),
                Some(other.clone()),
                &KeygenShare {
                    share: encrypted?,
                    factors,
                },
            )?);
        }
        Ok(messages)
    }

    #[instrument(skip_all, err(Debug))]
    fn handle_round_two_decommit<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<KeygenOutput>> {
        if !self.round_one_done() {
            self.stash_message(message)?;
            return Ok(ProcessOutcome::Incomplete);
        }
        let from = message.from();
        if self.local_storage.contains::<storage::Decommit>(from) {
            warn!("Ignoring repeated decommitment from {from}");
            return Ok(ProcessOutcome::Incomplete);
        }

        let decommit: KeygenDecommit =
            message.decode(MessageType::Dkg(DkgMessageType::R2Decommit))?;
        let commit = self.local_storage.retrieve::<storage::Commit>(from)?;
        decommit.verify(self.sid, from, commit)?;

        if decommit.coefficient_commitments.len() != self.threshold + 1 {
            return Err(Self::misbehaved(from, "polynomial has the wrong degree"));
        }
        decommit.proof.verify(
            &PiSchInput::new(&decommit.coefficient_commitments[0]),
            &mut self.schnorr_transcript(from, b"constant term"),
        )?;
        self.local_storage.store::<storage::Decommit>(from, decommit);
        self.maybe_finish_round_two(rng)
    }

    #[instrument(skip_all, err(Debug))]
    fn handle_round_two_share<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<KeygenOutput>> {
        if !self.round_one_done() {
            self.stash_message(message)?;
            return Ok(ProcessOutcome::Incomplete);
        }
        let from = message.from();
        if self.local_storage.contains::<storage::ReceivedShare>(from) {
            warn!("Ignoring repeated share from {from}");
            return Ok(ProcessOutcome::Incomplete);
        }

        let received: KeygenShare = message.decode(MessageType::Dkg(DkgMessageType::R2Share))?;
        let own_info = self.local_storage.retrieve::<storage::AuxInfo>(&self.id)?;
        let sender_info = self.local_storage.retrieve::<storage::AuxInfo>(from)?;
        received
            .factors
            .verify(
                &PiFacInput::new(own_info.params(), sender_info.encryption_key().n()),
                &mut self.factors_transcript(from, &self.id),
            )
            .map_err(|_| Self::misbehaved(from, "Paillier modulus may have small factors"))?;
        let share = received.share.decrypt(
            self.local_storage.retrieve::<storage::EphemeralSecret>(&self.id)?,
            self.local_storage.retrieve::<storage::EphemeralKey>(from)?,
            self.sid,
            from,
            &self.id,
        )?;
        self.local_storage
            .store::<storage::ReceivedShare>(from, share);
        self.maybe_finish_round_two(rng)
    }

    fn maybe_finish_round_two<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<ProcessOutcome<KeygenOutput>> {
        let r2_done = self
            .local_storage
            .contains_for_all_ids::<storage::Decommit>(&self.other_ids)
            && self
                .local_storage
                .contains_for_all_ids::<storage::ReceivedShare>(&self.other_ids);
        if !r2_done {
            return Ok(ProcessOutcome::Incomplete);
        }

        let messages = run_only_once!(self.gen_round_three_msgs(rng))?;
        let outcomes = self
            .fetch_messages(MessageType::Dkg(DkgMessageType::R3Proof))?
            .iter()
            .map(|msg| self.process_message(rng, msg))
            .collect::<Result<Vec<_>>>()?;
        Ok(ProcessOutcome::collect(outcomes)?.with_messages(messages))
    }

    #[instrument(skip_all, err(Debug))]
    fn gen_round_three_msgs<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<Vec<Message>> {
        info!("Generating round three key generation messages.");

        let my_point = evaluation_point(self.index_of(&self.id)?);
        let coefficients = self.local_storage.retrieve::<storage::Coefficients>(&self.id)?;
        let mut x = evaluate_polynomial(coefficients, &my_point);

        for other in &self.other_ids {
            let share = self.local_storage.retrieve::<storage::ReceivedShare>(other)?;
            let decommit = self.local_storage.retrieve::<storage::Decommit>(other)?;
            let expected = evaluate_commitments(&decommit.coefficient_commitments, &my_point);
            if CurvePoint::GENERATOR.multiply(share) != expected {
                return Err(Self::misbehaved(other, "share does not match commitments"));
            }
            x += share;
        }

        // Every member's public share follows from the broadcast commitments.
        let decommits = self
            .members
            .iter()
            .map(|member| self.local_storage.retrieve::<storage::Decommit>(member))
            .collect::<Result<Vec<_>>>()?;
        let public_shares = (0..self.members.len())
            .map(|index| {
                let point = evaluation_point(index);
                let X = decommits.iter().fold(
                    k256::ProjectivePoint::IDENTITY,
                    |acc, decommit| acc + evaluate_commitments(&decommit.coefficient_commitments, &point).0,
                );
                KeySharePublic { X: CurvePoint(X) }
            })
            .collect::<Vec<_>>();

        let private_share = KeySharePrivate { x };
        x.zeroize();
        let my_public_share = private_share.public_share();
        if public_shares[self.index_of(&self.id)?] != my_public_share {
            error!("Computed public share does not match the private share");
            return Err(InternalError::InternalInvariantFailed);
        }

        let proof = PiSchProof::prove(
            &PiSchInput::new(&my_public_share.X),
            &PiSchSecret::new(&private_share.x),
            &mut self.schnorr_transcript(&self.id, b"public share"),
            rng,
        )?;

        for (member, public_share) in self.members.clone().iter().zip(public_shares) {
            self.local_storage
                .store::<storage::PublicShare>(member, public_share);
        }
        let id = self.id.clone();
        self.local_storage
            .store::<storage::PrivateShare>(&id, private_share);

        let message = Message::new(
            MessageType::Dkg(DkgMessageType::R3Proof),
            self.sid,
            self.id.clone(),
            None,
            &KeygenRoundThree {
                public_share: my_public_share,
                proof,
            },
        )?;
        Ok(vec![message])
    }

    #[instrument(skip_all, err(Debug))]
    fn handle_round_three_msg(&mut self, message: &Message) -> Result<ProcessOutcome<KeygenOutput>> {
        if !self.local_storage.contains::<storage::PrivateShare>(&self.id) {
            self.stash_message(message)?;
            return Ok(ProcessOutcome::Incomplete);
        }
        let from = message.from();
        if self
            .local_storage
            .contains::<storage::ConfirmedPublicShare>(from)
        {
            warn!("Ignoring repeated public share from {from}");
            return Ok(ProcessOutcome::Incomplete);
        }

        let round_three: KeygenRoundThree =
            message.decode(MessageType::Dkg(DkgMessageType::R3Proof))?;
        let expected = self.local_storage.retrieve::<storage::PublicShare>(from)?;
        if &round_three.public_share != expected {
            return Err(Self::misbehaved(from, "public share mismatch"));
        }
        round_three.proof.verify(
            &PiSchInput::new(&expected.X),
            &mut self.schnorr_transcript(from, b"public share"),
        )?;
        self.local_storage
            .store::<storage::ConfirmedPublicShare>(from, ());

        if !self
            .local_storage
            .contains_for_all_ids::<storage::ConfirmedPublicShare>(&self.other_ids)
        {
            return Ok(ProcessOutcome::Incomplete);
        }

        let output = self.output()?;
        self.status = Status::TerminatedSuccessfully;
        info!("Key generation completed.");
        Ok(ProcessOutcome::Terminated(output))
    }

    fn output(&self) -> Result<KeygenOutput> {
        let public_shares = self
            .members
            .iter()
            .map(|member| self.local_storage.retrieve::<storage::PublicShare>(member).copied())
            .collect::<Result<Vec<_>>>()?;
        let group_public_key = self.members.iter().try_fold(
            k256::ProjectivePoint::IDENTITY,
            |acc, member| -> Result<_> {
                let decommit = self.local_storage.retrieve::<storage::Decommit>(member)?;
                Ok(acc + decommit.coefficient_commitments[0].0)
            },
        )?;
        let aux_infos = self
            .members
            .iter()
            .map(|member| self.local_storage.retrieve::<storage::AuxInfo>(member).cloned())
            .collect::<Result<Vec<_>>>()?;
        Ok(KeygenOutput {
            private_share: self
                .local_storage
                .retrieve::<storage::PrivateShare>(&self.id)?
                .clone(),
            public_shares,
            group_public_key: CurvePoint(group_public_key),
            aux_infos,
            paillier_decryption_key: self.paillier.clone(),
        })
    }
}

impl ProtocolParticipant for KeygenParticipant {
    type Output = KeygenOutput;

    fn id(&self) -> &MemberId {
        &self.id
    }

    fn other_ids(&self) -> &[MemberId] {
        &self.other_ids
    }

    fn sid(&self) -> Identifier {
        self.sid
    }

    fn status(&self) -> Status {
        self.status
    }

    fn initialize<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<ProcessOutcome<Self::Output>> {
        let messages = run_only_once!(self.gen_round_one_msgs(rng))?;
        self.status = Status::Running;
        Ok(ProcessOutcome::from(None, messages))
    }

    #[instrument(skip_all, fields(sid = %self.sid, from = %message.from()), err(Debug))]
    fn process_message<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Self::Output>> {
        match self.status {
            Status::Initialized => {
                error!("Key generation received a message before it was initialized");
                return Err(InternalError::InternalInvariantFailed);
            }
            Status::TerminatedSuccessfully => {
                debug!("Key generation already finished; dropping message");
                return Ok(ProcessOutcome::Incomplete);
            }
            Status::Running => {}
        }
        self.validate_message(message)?;

        match message.message_type() {
            MessageType::Dkg(DkgMessageType::R1CommitHash) => {
                self.handle_round_one_msg(rng, message)
            }
            MessageType::Dkg(DkgMessageType::R2Decommit) => {
                self.handle_round_two_decommit(rng, message)
            }
            MessageType::Dkg(DkgMessageType::R2Share) => self.handle_round_two_share(rng, message),
            MessageType::Dkg(DkgMessageType::R3Proof) => self.handle_round_three_msg(message),
            message_type => {
                error!("Incorrect MessageType given to KeygenParticipant. Got: {message_type:?}");
                Err(InternalError::MisroutedMessage)
            }
        }
    }
}

impl InnerProtocolParticipant for KeygenParticipant {
    fn local_storage(&self) -> &LocalStorage {
        &self.local_storage
    }

    fn local_storage_mut(&mut self) -> &mut LocalStorage {
        &mut self.local_storage
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        protocol::{KeepId, SessionKind},
        safe_primes_512::POOL_OF_PRIMES,
    };
    use k256::SecretKey;
    use rand::{
        rngs::{OsRng, StdRng},
        Rng, SeedableRng,
    };
    use std::collections::HashMap;
    use test_log::test;

    pub(crate) fn members(count: usize) -> Vec<MemberId> {
        (0..count)
            .map(|_| MemberId::from_public_key(&SecretKey::random(&mut OsRng).public_key()))
            .collect()
    }

    pub(crate) fn paillier_key(index: usize) -> DecryptionKey {
        let pool = &*POOL_OF_PRIMES;
        let p = &pool[(2 * index) % pool.len()];
        let q = &pool[(2 * index + 1) % pool.len()];
        DecryptionKey::from_primes(p, q).unwrap()
    }

    /// The same round three message carrying a public share that does not
    /// follow from the broadcast commitments.
    pub(crate) fn forge_round_three(message: &Message) -> Result<Message> {
        let genuine: KeygenRoundThree =
            message.decode(MessageType::Dkg(DkgMessageType::R3Proof))?;
        let forged = KeygenRoundThree {
            public_share: KeySharePublic {
                X: CurvePoint(genuine.public_share.X.0 + CurvePoint::GENERATOR.0),
            },
            proof: genuine.proof,
        };
        Message::new(
            message.message_type(),
            message.id(),
            message.from().clone(),
            None,
            &forged,
        )
    }

    fn quorum(members: &[MemberId], threshold: usize) -> Vec<KeygenParticipant> {
        let sid = Identifier::derive(&KeepId::new("keep"), &SessionKind::KeyGeneration, 0);
        members
            .iter()
            .enumerate()
            .map(|(i, id)| {
                KeygenParticipant::new(sid, id.clone(), members.to_vec(), threshold, paillier_key(i))
                    .unwrap()
            })
            .collect()
    }

    fn deliver_all(messages: &[Message], inboxes: &mut HashMap<MemberId, Vec<Message>>) {
        for message in messages {
            for (id, inbox) in inboxes.iter_mut() {
                if message.is_for(id) {
                    inbox.push(message.clone());
                }
            }
        }
    }

    /// Run key generation to completion, delivering messages in random order.
    pub(crate) fn run_keygen(
        members: &[MemberId],
        threshold: usize,
        rng: &mut StdRng,
    ) -> Result<Vec<KeygenOutput>> {
        let mut quorum = quorum(members, threshold);
        let mut inboxes: HashMap<MemberId, Vec<Message>> =
            members.iter().map(|m| (m.clone(), vec![])).collect();
        let mut outputs: HashMap<MemberId, KeygenOutput> = HashMap::new();

        for participant in quorum.iter_mut() {
            let (_, messages) = participant.initialize(rng)?.into_parts();
            deliver_all(&messages, &mut inboxes);
        }

        while outputs.len() < members.len() {
            let index = rng.gen_range(0..quorum.len());
            let participant = &mut quorum[index];
            let inbox = inboxes.get_mut(participant.id()).unwrap();
            if inbox.is_empty() {
                continue;
            }
            let message = inbox.remove(rng.gen_range(0..inbox.len()));
            let (output, messages) = participant.process_message(rng, &message)?.into_parts();
            deliver_all(&messages, &mut inboxes);
            if let Some(output) = output {
                assert!(outputs.insert(participant.id().clone(), output).is_none());
            }
        }
        Ok(members.iter().map(|m| outputs.remove(m).unwrap()).collect())
    }

    #[test]
    fn keygen_produces_consistent_shares() -> Result<()> {
        let seed = OsRng.next_u64();
        let mut rng = StdRng::seed_from_u64(seed);
        debug!("Running key generation with seed {seed}");
        let members = members(3);
        let outputs = run_keygen(&members, 1, &mut rng)?;

        let group_key = outputs[0].group_public_key;
        for output in &outputs {
            assert_eq!(output.group_public_key, group_key);
            assert_eq!(output.public_shares, outputs[0].public_shares);
            assert_eq!(output.aux_infos, outputs[0].aux_infos);
        }
        for (index, output) in outputs.iter().enumerate() {
            assert_eq!(
                output.private_share.public_share(),
                output.public_shares[index]
            );
        }

        // Any two shares interpolate the same secret.
        let x = |i: usize, subset: &[usize]| {
            crate::utils::lagrange_coefficient(i, subset).unwrap() * outputs[i].private_share.x
        };
        let secret = x(0, &[0, 2]) + x(2, &[0, 2]);
        assert_eq!(CurvePoint::GENERATOR.multiply(&secret), group_key);
        let secret = x(1, &[1, 2]) + x(2, &[1, 2]);
        assert_eq!(CurvePoint::GENERATOR.multiply(&secret), group_key);
        Ok(())
    }

    #[test]
    fn repeated_messages_are_ignored() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(OsRng.next_u64());
        let members = members(2);
        let mut quorum = quorum(&members, 1);
        let (_, first) = quorum[0].initialize(&mut rng)?.into_parts();
        let _ = quorum[1].initialize(&mut rng)?;

        let outcome = quorum[1].process_message(&mut rng, &first[0])?;
        assert!(matches!(outcome, ProcessOutcome::Processed(_)));
        let repeated = quorum[1].process_message(&mut rng, &first[0])?;
        assert!(matches!(repeated, ProcessOutcome::Incomplete));
        Ok(())
    }

    #[test]
    fn foreign_aux_info_is_rejected() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(OsRng.next_u64());
        let members = members(3);
        let mut quorum = quorum(&members, 1);
        let (_, first) = quorum[0].initialize(&mut rng)?.into_parts();
        let (_, second) = quorum[1].initialize(&mut rng)?.into_parts();
        let _ = quorum[2].initialize(&mut rng)?;

        let round_one_type = MessageType::Dkg(DkgMessageType::R1CommitHash);
        let mut round_one: KeygenRoundOne = first[0].decode(round_one_type)?;
        let other: KeygenRoundOne = second[0].decode(round_one_type)?;
        round_one.aux_info = other.aux_info;
        let tampered = Message::new(round_one_type, first[0].id(), members[0].clone(), None, &round_one)?;
        assert!(matches!(
            quorum[2].process_message(&mut rng, &tampered),
            Err(InternalError::PeerMisbehaved(..))
        ));

        // The honest message is still accepted afterwards.
        let outcome = quorum[2].process_message(&mut rng, &first[0])?;
        assert!(matches!(outcome, ProcessOutcome::Incomplete));
        Ok(())
    }

    #[test]
    fn share_with_foreign_factor_proof_is_rejected() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(OsRng.next_u64());
        let members = members(3);
        let mut quorum = quorum(&members, 1);
        let round_one = quorum
            .iter_mut()
            .map(|p| Ok(p.initialize(&mut rng)?.into_parts().1))
            .collect::<Result<Vec<_>>>()?;
        // Members 0 and 1 finish round one and produce their shares.
        let mut round_two = Vec::new();
        for (i, participant) in quorum.iter_mut().enumerate().take(2) {
            for (j, messages) in round_one.iter().enumerate() {
                if i != j {
                    let (_, out) = participant.process_message(&mut rng, &messages[0])?.into_parts();
                    round_two.extend(out);
                }
            }
        }
        for messages in &round_one[..2] {
            let _ = quorum[2].process_message(&mut rng, &messages[0])?;
        }

        let share_type = MessageType::Dkg(DkgMessageType::R2Share);
        let for_member_two = |sender: &MemberId| {
            round_two
                .iter()
                .find(|m| m.message_type() == share_type && m.from() == sender && m.is_for(&members[2]))
                .cloned()
                .unwrap()
        };
        let from_zero = for_member_two(&members[0]);
        let from_one = for_member_two(&members[1]);
        // Member 0's share carrying the factor proof member 1 made for member 2.
        let mut share: KeygenShare = from_zero.decode(share_type)?;
        share.factors = from_one.decode::<KeygenShare>(share_type)?.factors;
        let tampered = Message::new(
            share_type,
            from_zero.id(),
            members[0].clone(),
            Some(members[2].clone()),
            &share,
        )?;
        assert!(matches!(
            quorum[2].process_message(&mut rng, &tampered),
            Err(InternalError::PeerMisbehaved(..))
        ));
        Ok(())
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let sid = Identifier::derive(&KeepId::new("keep"), &SessionKind::KeyGeneration, 0);
        let members = members(3);
        let outsider = self::members(1).remove(0);
        assert!(
            KeygenParticipant::new(sid, members[0].clone(), members.clone(), 3, paillier_key(0))
                .is_err()
        );
        assert!(
            KeygenParticipant::new(sid, outsider, members.clone(), 1, paillier_key(0)).is_err()
        );
        let duplicated = vec![members[0].clone(), members[0].clone(), members[1].clone()];
        assert!(
            KeygenParticipant::new(sid, members[0].clone(), duplicated, 1, paillier_key(0))
                .is_err()
        );
    }

    #[test]
    fn messages_from_another_session_are_rejected() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(OsRng.next_u64());
        let members = members(2);
        let mut quorum = quorum(&members, 1);
        let _ = quorum[1].initialize(&mut rng)?;

        let other_sid = Identifier::derive(&KeepId::new("keep"), &SessionKind::KeyGeneration, 1);
        let mut stray = KeygenParticipant::new(
            other_sid,
            members[0].clone(),
            members.clone(),
            1,
            paillier_key(0),
        )?;
        let (_, messages) = stray.initialize(&mut rng)?.into_parts();
        assert_eq!(
            quorum[1].process_message(&mut rng, &messages[0]).unwrap_err(),
            InternalError::MisroutedMessage
        );
        Ok(())
    }
}
