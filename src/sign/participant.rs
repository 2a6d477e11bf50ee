// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    auxinfo::AuxInfoPublic,
    errors::{InternalError, Result},
    local_storage::{LocalStorage, TypeTag},
    messages::{Message, MessageType, SignMessageType},
    paillier::Ciphertext,
    participant::{InnerProtocolParticipant, ProcessOutcome, ProtocolParticipant, Status},
    protocol::{Identifier, MemberId},
    run_only_once,
    sign::record::{
        mta_finish, mta_respond, GammaCommit, GammaDecommit, MtaResponse, SignRoundFour,
        SignRoundOne, SignRoundThree,
    },
    signer::{Signature, ThresholdSigner},
    utils::{
        lagrange_coefficient, random_nonzero_scalar, scalar_from_digest, scalar_to_bn,
        CurvePoint,
    },
    zkp::{
        pienc::{PiEncInput, PiEncProof, PiEncSecret},
        Proof,
    },
};
use k256::{
    ecdsa::{RecoveryId, Signature as EcdsaSignature, VerifyingKey},
    elliptic_curve::{ops::Reduce, point::AffineCoordinates},
    ProjectivePoint, Scalar, U256,
};
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use tracing::{debug, error, info, instrument, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// The ephemeral secrets of one signing session.
#[derive(Zeroize, ZeroizeOnDrop)]
struct SignNonces {
    k: Scalar,
    gamma: Scalar,
}

/// Additive shares this member keeps as the responder of share conversion.
#[derive(Clone, Copy)]
struct ResponderShares {
    beta: Scalar,
    nu: Scalar,
}

/// Additive shares this member decrypted as the initiator.
#[derive(Clone, Copy)]
struct InitiatorShares {
    alpha: Scalar,
    mu: Scalar,
}

struct Presignature {
    R: CurvePoint,
    r: Scalar,
}

mod storage {
    use super::*;

    pub(super) struct Nonces;
    impl TypeTag for Nonces {
        type Value = SignNonces;
    }
    pub(super) struct Commit;
    impl TypeTag for Commit {
        type Value = GammaCommit;
    }
    pub(super) struct Decommit;
    impl TypeTag for Decommit {
        type Value = GammaDecommit;
    }
    pub(super) struct EncryptedK;
    impl TypeTag for EncryptedK {
        type Value = Ciphertext;
    }
    pub(super) struct ClaimedGamma;
    impl TypeTag for ClaimedGamma {
        type Value = CurvePoint;
    }
    pub(super) struct Responder;
    impl TypeTag for Responder {
        type Value = ResponderShares;
    }
    pub(super) struct Initiator;
    impl TypeTag for Initiator {
        type Value = InitiatorShares;
    }
    pub(super) struct Delta;
    impl TypeTag for Delta {
        type Value = Scalar;
    }
    pub(super) struct GammaPoint;
    impl TypeTag for GammaPoint {
        type Value = CurvePoint;
    }
    pub(super) struct Sigma;
    impl TypeTag for Sigma {
        type Value = Scalar;
    }
    pub(super) struct Presig;
    impl TypeTag for Presig {
        type Value = Presignature;
    }
    pub(super) struct SignatureShare;
    impl TypeTag for SignatureShare {
        type Value = Scalar;
    }
}

/// One member's view of a signing session over a fixed subset of the group.
///
/// The subset may be any set of at least `threshold + 1` group members; each
/// member weighs its key share by its Lagrange coefficient within the subset.
pub(crate) struct SignParticipant {
    sid: Identifier,
    id: MemberId,
    other_ids: Vec<MemberId>,
    signer: ThresholdSigner,
    /// Group positions of the signing subset.
    subset_indices: Vec<usize>,
    digest: [u8; 32],
    /// `lambda_i * x_i`, this member's additive share of the group key.
    w: Scalar,
    local_storage: LocalStorage,
    status: Status,
}

impl std::fmt::Debug for SignParticipant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignParticipant")
            .field("sid", &self.sid)
            .field("id", &self.id)
            .field("other_ids", &self.other_ids)
            .field("digest", &hex::encode(self.digest))
            .field("status", &self.status)
            .finish()
    }
}

impl Drop for SignParticipant {
    fn drop(&mut self) {
        self.w.zeroize();
    }
}

impl SignParticipant {
    pub(crate) fn new(
        sid: Identifier,
        signer: &ThresholdSigner,
        subset: &[MemberId],
        digest: [u8; 32],
    ) -> Result<Self> {
        let id = signer.member_id().clone();
        if !subset.contains(&id) {
            return arg_err!("this member is not part of the signing subset");
        }
        if subset.len() < signer.threshold() + 1 {
            return Err(InternalError::InsufficientMembers {
                present: subset.len(),
                required: signer.threshold() + 1,
            });
        }
        let indices = subset
            .iter()
            .map(|member| {
                signer
                    .group_member_ids()
                    .iter()
                    .position(|m| m == member)
                    .ok_or_else(|| InternalError::InvalidArgument(format!("{member} is not a group member")))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut deduplicated = indices.clone();
        deduplicated.sort_unstable();
        deduplicated.dedup();
        if deduplicated.len() != indices.len() {
            return arg_err!("signing subset contains duplicate members");
        }

        let w = lagrange_coefficient(signer.member_index(), &indices)? * signer.key_share().x;
        let other_ids = subset.iter().filter(|m| **m != id).cloned().collect();
        Ok(Self {
            sid,
            id,
            other_ids,
            signer: signer.clone(),
            subset_indices: indices,
            digest,
            w,
            local_storage: Default::default(),
            status: Status::Initialized,
        })
    }

    fn group_index(&self, member: &MemberId) -> Result<usize> {
        self.signer
            .group_member_ids()
            .iter()
            .position(|m| m == member)
            .ok_or(InternalError::InternalInvariantFailed)
    }

    fn aux_info(&self, member: &MemberId) -> Result<&AuxInfoPublic> {
        Ok(&self.signer.aux_infos()[self.group_index(member)?])
    }

    /// `W_j = lambda_j * X_j`, the public counterpart of a member's additive
    /// share of the group key within this subset.
    fn additive_public_share(&self, member: &MemberId) -> Result<CurvePoint> {
        let index = self.group_index(member)?;
        let lambda = lagrange_coefficient(index, &self.subset_indices)?;
        Ok(self.signer.public_shares()[index].X.multiply(&lambda))
    }

    fn range_transcript(&self, sender: &MemberId, recipient: &MemberId) -> Transcript {
        let mut transcript = Transcript::new(b"keep signing nonce range");
        transcript.append_message(b"sid", &self.sid.to_bytes());
        transcript.append_message(b"sender", sender.as_bytes());
        transcript.append_message(b"recipient", recipient.as_bytes());
        transcript
    }

    fn mta_transcript(
        &self,
        context: &'static [u8],
        responder: &MemberId,
        initiator: &MemberId,
    ) -> Transcript {
        let mut transcript = Transcript::new(b"keep signing share conversion");
        transcript.append_message(b"context", context);
        transcript.append_message(b"sid", &self.sid.to_bytes());
        transcript.append_message(b"responder", responder.as_bytes());
        transcript.append_message(b"initiator", initiator.as_bytes());
        transcript
    }

    fn misbehaved(member: &MemberId, reason: &str) -> InternalError {
        error!("Member {member} misbehaved during signing: {reason}");
        InternalError::PeerMisbehaved(member.to_string(), reason.into())
    }

    #[instrument(skip_all, err(Debug))]
    fn gen_round_one_msgs<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<Vec<Message>> {
        info!("Generating round one signing messages.");

        let nonces = SignNonces {
            k: random_nonzero_scalar(rng),
            gamma: random_nonzero_scalar(rng),
        };
        let Gamma = CurvePoint::GENERATOR.multiply(&nonces.gamma);
        let decommit = GammaDecommit::new(rng, self.sid, &self.id, Gamma);
        let commit = decommit.commit()?;
        let k = scalar_to_bn(&nonces.k);
        let own_key = self.signer.paillier_decryption_key().encryption_key();
        let (encrypted_k, rho) = own_key.encrypt(rng, &k)?;

        let mut messages = Vec::with_capacity(self.other_ids.len());
        for other in &self.other_ids {
            let range_proof = PiEncProof::prove(
                &PiEncInput::new(self.aux_info(other)?.params(), own_key, &encrypted_k),
                &PiEncSecret::new(&k, &rho),
                &mut self.range_transcript(&self.id, other),
                rng,
            )?;
            messages.push(Message::new(
                MessageType::Sign(SignMessageType::R1Commit),
                self.sid,
                self.id.clone(),
                Some(other.clone()),
                &SignRoundOne {
                    commit: commit.clone(),
                    encrypted_k: encrypted_k.clone(),
                    range_proof,
                },
            )?);
        }

        let id = self.id.clone();
        self.local_storage.store::<storage::Nonces>(&id, nonces);
        self.local_storage
            .store::<storage::Commit>(&id, commit.clone());
        self.local_storage
            .store::<storage::Decommit>(&id, decommit);
        self.local_storage
            .store::<storage::EncryptedK>(&id, encrypted_k);
        Ok(messages)
    }

    fn round_one_done(&self) -> bool {
        self.local_storage
            .contains_for_all_ids::<storage::Commit>(&self.other_ids)
    }

    #[instrument(skip_all, err(Debug))]
    fn handle_round_one_msg<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Signature>> {
        let from = message.from();
        if self.local_storage.contains::<storage::Commit>(from) {
            warn!("Ignoring repeated round one message from {from}");
            return Ok(ProcessOutcome::Incomplete);
        }
        let round_one: SignRoundOne = message.decode(MessageType::Sign(SignMessageType::R1Commit))?;
        round_one
            .range_proof
            .verify(
                &PiEncInput::new(
                    self.aux_info(&self.id)?.params(),
                    self.aux_info(from)?.encryption_key(),
                    &round_one.encrypted_k,
                ),
                &mut self.range_transcript(from, &self.id),
            )
            .map_err(|_| Self::misbehaved(from, "encrypted nonce failed its range proof"))?;
        self.local_storage
            .store::<storage::Commit>(from, round_one.commit);
        self.local_storage
            .store::<storage::EncryptedK>(from, round_one.encrypted_k);

        if !self.round_one_done() {
            return Ok(ProcessOutcome::Incomplete);
        }
        let messages = run_only_once!(self.gen_round_two_msgs(rng))?;
        let outcomes = self
            .fetch_messages(MessageType::Sign(SignMessageType::R2MtaResponse))?
            .iter()
            .map(|msg| self.process_message(rng, msg))
            .collect::<Result<Vec<_>>>()?;
        Ok(ProcessOutcome::collect(outcomes)?.with_messages(messages))
    }

    #[instrument(skip_all, err(Debug))]
    fn gen_round_two_msgs<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<Vec<Message>> {
        info!("Generating round two signing messages.");

        let gamma = self.local_storage.retrieve::<storage::Nonces>(&self.id)?.gamma;
        let Gamma = self.local_storage.retrieve::<storage::Decommit>(&self.id)?.Gamma;
        let W = self.additive_public_share(&self.id)?;
        let mut messages = Vec::with_capacity(self.other_ids.len());
        for other in self.other_ids.clone() {
            let initiator = self.aux_info(&other)?;
            let encrypted_k = self.local_storage.retrieve::<storage::EncryptedK>(&other)?;
            let (gamma_reply, beta) = mta_respond(
                rng,
                initiator,
                encrypted_k,
                &gamma,
                &Gamma,
                &mut self.mta_transcript(b"gamma", &self.id, &other),
            )?;
            let (w_reply, nu) = mta_respond(
                rng,
                initiator,
                encrypted_k,
                &self.w,
                &W,
                &mut self.mta_transcript(b"w", &self.id, &other),
            )?;
            self.local_storage
                .store::<storage::Responder>(&other, ResponderShares { beta, nu });
            messages.push(Message::new(
                MessageType::Sign(SignMessageType::R2MtaResponse),
                self.sid,
                self.id.clone(),
                Some(other),
                &MtaResponse {
                    Gamma,
                    gamma: gamma_reply,
                    w: w_reply,
                },
            )?);
        }
        Ok(messages)
    }

    #[instrument(skip_all, err(Debug))]
    fn handle_round_two_msg<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Signature>> {
        if !self.round_one_done() {
            self.stash_message(message)?;
            return Ok(ProcessOutcome::Incomplete);
        }
        let from = message.from();
        if self.local_storage.contains::<storage::Initiator>(from) {
            warn!("Ignoring repeated share conversion response from {from}");
            return Ok(ProcessOutcome::Incomplete);
        }
        let response: MtaResponse =
            message.decode(MessageType::Sign(SignMessageType::R2MtaResponse))?;
        let own_info = self.aux_info(&self.id)?;
        let key = self.signer.paillier_decryption_key();
        let encrypted_k = self.local_storage.retrieve::<storage::EncryptedK>(&self.id)?;
        let W = self.additive_public_share(from)?;
        let alpha = mta_finish(
            own_info,
            key,
            encrypted_k,
            &response.gamma,
            &response.Gamma,
            &mut self.mta_transcript(b"gamma", from, &self.id),
        )
        .map_err(|_| Self::misbehaved(from, "invalid share conversion for gamma"))?;
        let mu = mta_finish(
            own_info,
            key,
            encrypted_k,
            &response.w,
            &W,
            &mut self.mta_transcript(b"w", from, &self.id),
        )
        .map_err(|_| Self::misbehaved(from, "invalid share conversion for w"))?;
        self.local_storage
            .store::<storage::Initiator>(from, InitiatorShares { alpha, mu });
        self.local_storage
            .store::<storage::ClaimedGamma>(from, response.Gamma);

        let r2_done = self
            .local_storage
            .contains_for_all_ids::<storage::Initiator>(&self.other_ids)
            && self
                .local_storage
                .contains_for_all_ids::<storage::Responder>(&self.other_ids);
        if !r2_done {
            return Ok(ProcessOutcome::Incomplete);
        }
        let messages = run_only_once!(self.gen_round_three_msgs())?;
        let outcomes = self
            .fetch_messages(MessageType::Sign(SignMessageType::R3Delta))?
            .iter()
            .map(|msg| self.process_message(rng, msg))
            .collect::<Result<Vec<_>>>()?;
        Ok(ProcessOutcome::collect(outcomes)?.with_messages(messages))
    }

    #[instrument(skip_all, err(Debug))]
    fn gen_round_three_msgs(&mut self) -> Result<Vec<Message>> {
        info!("Generating round three signing messages.");

        let nonces = self.local_storage.retrieve::<storage::Nonces>(&self.id)?;
        let mut delta = nonces.k * nonces.gamma;
        let mut sigma = nonces.k * self.w;
        for other in &self.other_ids {
            let initiator = self.local_storage.retrieve::<storage::Initiator>(other)?;
            let responder = self.local_storage.retrieve::<storage::Responder>(other)?;
            delta += initiator.alpha + responder.beta;
            sigma += initiator.mu + responder.nu;
        }
        let decommit = self
            .local_storage
            .retrieve::<storage::Decommit>(&self.id)?
            .clone();

        let id = self.id.clone();
        self.local_storage.store::<storage::Delta>(&id, delta);
        self.local_storage
            .store::<storage::GammaPoint>(&id, decommit.Gamma);
        self.local_storage.store::<storage::Sigma>(&id, sigma);
        sigma.zeroize();

        let message = Message::new(
            MessageType::Sign(SignMessageType::R3Delta),
            self.sid,
            self.id.clone(),
            None,
            &SignRoundThree { delta, decommit },
        )?;
        Ok(vec![message])
    }

    #[instrument(skip_all, err(Debug))]
    fn handle_round_three_msg(&mut self, message: &Message) -> Result<ProcessOutcome<Signature>> {
        if !self.local_storage.contains::<storage::Sigma>(&self.id) {
            self.stash_message(message)?;
            return Ok(ProcessOutcome::Incomplete);
        }
        let from = message.from();
        if self.local_storage.contains::<storage::Delta>(from) {
            warn!("Ignoring repeated delta from {from}");
            return Ok(ProcessOutcome::Incomplete);
        }
        let round_three: SignRoundThree =
            message.decode(MessageType::Sign(SignMessageType::R3Delta))?;
        let commit = self.local_storage.retrieve::<storage::Commit>(from)?;
        round_three.decommit.verify(self.sid, from, commit)?;
        if self.local_storage.retrieve::<storage::ClaimedGamma>(from)? != &round_three.decommit.Gamma {
            return Err(Self::misbehaved(from, "opened a different Gamma than it proved against"));
        }
        self.local_storage
            .store::<storage::Delta>(from, round_three.delta);
        self.local_storage
            .store::<storage::GammaPoint>(from, round_three.decommit.Gamma);

        if !self
            .local_storage
            .contains_for_all_ids::<storage::Delta>(&self.other_ids)
        {
            return Ok(ProcessOutcome::Incomplete);
        }
        let messages = run_only_once!(self.gen_round_four_msgs())?;
        let outcomes = self
            .fetch_messages(MessageType::Sign(SignMessageType::R4SignatureShare))?
            .iter()
            .map(|msg| self.handle_round_four_msg(msg))
            .collect::<Result<Vec<_>>>()?;
        Ok(ProcessOutcome::collect(outcomes)?.with_messages(messages))
    }

    #[instrument(skip_all, err(Debug))]
    fn gen_round_four_msgs(&mut self) -> Result<Vec<Message>> {
        info!("Generating round four signing messages.");

        let participants = self.all_participants();
        let mut delta = Scalar::ZERO;
        let mut Gamma = ProjectivePoint::IDENTITY;
        for member in &participants {
            delta += self.local_storage.retrieve::<storage::Delta>(member)?;
            Gamma += self.local_storage.retrieve::<storage::GammaPoint>(member)?.0;
        }
        let delta_inv: Option<Scalar> = delta.invert().into();
        let delta_inv = delta_inv.ok_or(InternalError::CouldNotInvertScalar)?;
        let R = CurvePoint(Gamma * delta_inv);
        if R.0 == ProjectivePoint::IDENTITY {
            return verify_err!("nonce point is the identity");
        }
        let r = <Scalar as Reduce<U256>>::reduce_bytes(&R.to_affine().x());
        if bool::from(r.is_zero()) {
            return verify_err!("signature r is zero");
        }

        let k = self.local_storage.retrieve::<storage::Nonces>(&self.id)?.k;
        let sigma = *self.local_storage.retrieve::<storage::Sigma>(&self.id)?;
        let s = scalar_from_digest(&self.digest) * k + r * sigma;

        let id = self.id.clone();
        self.local_storage
            .store::<storage::Presig>(&id, Presignature { R, r });
        self.local_storage
            .store::<storage::SignatureShare>(&id, s);

        let message = Message::new(
            MessageType::Sign(SignMessageType::R4SignatureShare),
            self.sid,
            self.id.clone(),
            None,
            &SignRoundFour { s },
        )?;
        Ok(vec![message])
    }

    #[instrument(skip_all, err(Debug))]
    fn handle_round_four_msg(&mut self, message: &Message) -> Result<ProcessOutcome<Signature>> {
        if !self.local_storage.contains::<storage::Presig>(&self.id) {
            self.stash_message(message)?;
            return Ok(ProcessOutcome::Incomplete);
        }
        let from = message.from();
        if self.local_storage.contains::<storage::SignatureShare>(from) {
            warn!("Ignoring repeated signature share from {from}");
            return Ok(ProcessOutcome::Incomplete);
        }
        let round_four: SignRoundFour =
            message.decode(MessageType::Sign(SignMessageType::R4SignatureShare))?;
        self.local_storage
            .store::<storage::SignatureShare>(from, round_four.s);

        if !self
            .local_storage
            .contains_for_all_ids::<storage::SignatureShare>(&self.other_ids)
        {
            return Ok(ProcessOutcome::Incomplete);
        }
        let signature = self.finish()?;
        self.status = Status::TerminatedSuccessfully;
        info!("Signing completed.");
        Ok(ProcessOutcome::Terminated(signature))
    }

    /// Combine the signature shares, normalize `s` and check the result
    /// against the group key.
    fn finish(&self) -> Result<Signature> {
        let presig = self.local_storage.retrieve::<storage::Presig>(&self.id)?;
        let s = self
            .all_participants()
            .iter()
            .map(|member| self.local_storage.retrieve::<storage::SignatureShare>(member))
            .try_fold(Scalar::ZERO, |acc, share| -> Result<Scalar> { Ok(acc + share?) })?;

        let R = presig.R.to_affine();
        let x_reduced = R.x() != presig.r.to_bytes();
        if x_reduced {
            // A reduced x coordinate cannot be expressed as a 0/1 recovery id.
            return Err(InternalError::SignatureInstantiationError);
        }
        let y_odd = bool::from(R.y_is_odd());
        let signature = EcdsaSignature::from_scalars(presig.r.to_bytes(), s.to_bytes())
            .map_err(|_| InternalError::SignatureInstantiationError)?;
        let (signature, recovery_id) = match signature.normalize_s() {
            Some(normalized) => (normalized, RecoveryId::new(!y_odd, false)),
            None => (signature, RecoveryId::new(y_odd, false)),
        };

        let group_key = VerifyingKey::from_affine(self.signer.group_public_point().to_affine())
            .map_err(|_| InternalError::InternalInvariantFailed)?;
        let recovered = VerifyingKey::recover_from_prehash(&self.digest, &signature, recovery_id)
            .map_err(|_| InternalError::FailedToVerifyProof("signature does not recover".into()))?;
        if recovered != group_key {
            error!("Combined signature does not verify under the group key");
            return verify_err!("signature does not verify under the group key");
        }
        Ok(Signature::from_parts(&signature, recovery_id))
    }
}

impl ProtocolParticipant for SignParticipant {
    type Output = Signature;

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
                error!("Signing received a message before it was initialized");
                return Err(InternalError::InternalInvariantFailed);
            }
            Status::TerminatedSuccessfully => {
                debug!("Signing already finished; dropping message");
                return Ok(ProcessOutcome::Incomplete);
            }
            Status::Running => {}
        }
        self.validate_message(message)?;

        match message.message_type() {
            MessageType::Sign(SignMessageType::R1Commit) => self.handle_round_one_msg(rng, message),
            MessageType::Sign(SignMessageType::R2MtaResponse) => {
                self.handle_round_two_msg(rng, message)
            }
            MessageType::Sign(SignMessageType::R3Delta) => self.handle_round_three_msg(message),
            MessageType::Sign(SignMessageType::R4SignatureShare) => {
                self.handle_round_four_msg(message)
            }
            message_type => {
                error!("Incorrect MessageType given to SignParticipant. Got: {message_type:?}");
                Err(InternalError::MisroutedMessage)
            }
        }
    }
}

impl InnerProtocolParticipant for SignParticipant {
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
        signer::tests::signers,
    };
    use k256::sha2::{Digest, Sha256};
    use libpaillier::unknown_order::BigNumber;
    use rand::{
        rngs::{OsRng, StdRng},
        Rng, SeedableRng,
    };
    use std::collections::HashMap;
    use test_log::test;

    /// Run a signing session among `subset`, delivering messages in random
    /// order.
    pub(crate) fn run_signing(
        signers: &[ThresholdSigner],
        subset: &[MemberId],
        digest: [u8; 32],
        rng: &mut StdRng,
    ) -> Result<Vec<Signature>> {
        let sid = Identifier::derive(&KeepId::new("0xkeep"), &SessionKind::Signing(digest), 0);
        let mut quorum = signers
            .iter()
            .filter(|s| subset.contains(s.member_id()))
            .map(|s| SignParticipant::new(sid, s, subset, digest))
            .collect::<Result<Vec<_>>>()?;
        let mut inboxes: HashMap<MemberId, Vec<Message>> =
            subset.iter().map(|m| (m.clone(), vec![])).collect();
        let deliver = |messages: Vec<Message>, inboxes: &mut HashMap<MemberId, Vec<Message>>| {
            for message in messages {
                for (id, inbox) in inboxes.iter_mut() {
                    if message.is_for(id) {
                        inbox.push(message.clone());
                    }
                }
            }
        };

        for participant in quorum.iter_mut() {
            let (_, messages) = participant.initialize(rng)?.into_parts();
            deliver(messages, &mut inboxes);
        }
        let mut outputs = HashMap::new();
        while outputs.len() < quorum.len() {
            let index = rng.gen_range(0..quorum.len());
            let participant = &mut quorum[index];
            let inbox = inboxes.get_mut(participant.id()).unwrap();
            if inbox.is_empty() {
                continue;
            }
            let message = inbox.remove(rng.gen_range(0..inbox.len()));
            let (output, messages) = participant.process_message(rng, &message)?.into_parts();
            deliver(messages, &mut inboxes);
            if let Some(output) = output {
                let _ = outputs.insert(participant.id().clone(), output);
            }
        }
        Ok(outputs.into_values().collect())
    }

    fn digest() -> [u8; 32] {
        Sha256::digest(b"Do or do not. There is no try.").into()
    }

    #[test]
    fn threshold_subset_produces_recoverable_signature() -> Result<()> {
        let seed = OsRng.next_u64();
        debug!("Running signing with seed {seed}");
        let mut rng = StdRng::seed_from_u64(seed);
        let signers = signers(3, 1);
        let subset = vec![
            signers[0].member_id().clone(),
            signers[2].member_id().clone(),
        ];

        let signatures = run_signing(&signers, &subset, digest(), &mut rng)?;
        assert_eq!(signatures.len(), 2);
        assert!(signatures.iter().all(|s| s == &signatures[0]));
        let signature = signatures[0];
        assert!(signature.recovery_id <= 1);
        assert_eq!(
            signature.recover_public_key(&digest())?,
            signers[0].group_public_key()?
        );
        assert!(signature.to_ecdsa()?.normalize_s().is_none());
        Ok(())
    }

    #[test]
    fn whole_group_can_sign() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(OsRng.next_u64());
        let signers = signers(3, 1);
        let subset = signers[0].group_member_ids().to_vec();
        let signatures = run_signing(&signers, &subset, [7u8; 32], &mut rng)?;
        assert_eq!(
            signatures[0].recover_public_key(&[7u8; 32])?,
            signers[1].group_public_key()?
        );
        Ok(())
    }

    fn pair(
        signers: &[ThresholdSigner],
        rng: &mut StdRng,
    ) -> Result<(SignParticipant, SignParticipant, Vec<Message>, Vec<Message>)> {
        let subset = vec![
            signers[0].member_id().clone(),
            signers[1].member_id().clone(),
        ];
        let sid = Identifier::derive(&KeepId::new("0xkeep"), &SessionKind::Signing(digest()), 0);
        let mut first = SignParticipant::new(sid, &signers[0], &subset, digest())?;
        let mut second = SignParticipant::new(sid, &signers[1], &subset, digest())?;
        let (_, first_out) = first.initialize(rng)?.into_parts();
        let (_, second_out) = second.initialize(rng)?.into_parts();
        Ok((first, second, first_out, second_out))
    }

    #[test]
    fn tampered_nonce_ciphertext_is_rejected() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(OsRng.next_u64());
        let signers = signers(3, 1);
        let (_, mut second, first_out, _) = pair(&signers, &mut rng)?;

        let round_one_type = MessageType::Sign(SignMessageType::R1Commit);
        let mut round_one: SignRoundOne = first_out[0].decode(round_one_type)?;
        let key = signers[0].paillier_decryption_key().encryption_key();
        let (one, _) = key.encrypt(&mut rng, &BigNumber::one())?;
        round_one.encrypted_k = key.add(&round_one.encrypted_k, &one);
        let tampered = Message::new(
            round_one_type,
            first_out[0].id(),
            signers[0].member_id().clone(),
            Some(signers[1].member_id().clone()),
            &round_one,
        )?;
        assert!(matches!(
            second.process_message(&mut rng, &tampered),
            Err(InternalError::PeerMisbehaved(..))
        ));

        // The honest message still moves the session to round two.
        let (_, messages) = second.process_message(&mut rng, &first_out[0])?.into_parts();
        assert_eq!(messages.len(), 1);
        Ok(())
    }

    #[test]
    fn tampered_share_conversion_is_rejected() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(OsRng.next_u64());
        let signers = signers(3, 1);
        let (mut first, mut second, first_out, second_out) = pair(&signers, &mut rng)?;
        let (_, responses) = first.process_message(&mut rng, &second_out[0])?.into_parts();
        let _ = second.process_message(&mut rng, &first_out[0])?;

        let response_type = MessageType::Sign(SignMessageType::R2MtaResponse);
        let mut response: MtaResponse = responses[0].decode(response_type)?;
        let key = signers[1].paillier_decryption_key().encryption_key();
        let (one, _) = key.encrypt(&mut rng, &BigNumber::one())?;
        response.w.ciphertext = key.add(&response.w.ciphertext, &one);
        let tampered = Message::new(
            response_type,
            responses[0].id(),
            signers[0].member_id().clone(),
            Some(signers[1].member_id().clone()),
            &response,
        )?;
        assert!(matches!(
            second.process_message(&mut rng, &tampered),
            Err(InternalError::PeerMisbehaved(..))
        ));
        Ok(())
    }

    #[test]
    fn undersized_subset_is_rejected() {
        let signers = signers(3, 1);
        let sid = Identifier::derive(&KeepId::new("0xkeep"), &SessionKind::Signing([0; 32]), 0);
        let subset = vec![signers[0].member_id().clone()];
        assert!(matches!(
            SignParticipant::new(sid, &signers[0], &subset, [0; 32]),
            Err(InternalError::InsufficientMembers { present: 1, required: 2 })
        ));
    }
}
