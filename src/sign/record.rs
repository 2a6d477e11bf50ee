// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Round payloads of the signing protocol.

use crate::{
    auxinfo::AuxInfoPublic,
    errors::Result,
    paillier::{Ciphertext, DecryptionKey},
    parameters::ELL_PRIME,
    protocol::{Identifier, MemberId},
    utils::{bn_to_scalar, random_bn_in_range, scalar_to_bn, CurvePoint},
    zkp::{
        piaffg::{PiAffgInput, PiAffgProof, PiAffgSecret},
        pienc::PiEncProof,
        Proof,
    },
};
use k256::Scalar;
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub(crate) struct GammaCommit {
    hash: [u8; 32],
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub(crate) struct GammaDecommit {
    sid: Identifier,
    sender: MemberId,
    nonce: [u8; 32],
    pub(crate) Gamma: CurvePoint,
}

impl GammaDecommit {
    pub(crate) fn new<R: RngCore + CryptoRng>(
        rng: &mut R,
        sid: Identifier,
        sender: &MemberId,
        Gamma: CurvePoint,
    ) -> Self {
        let mut nonce = [0u8; 32];
        rng.fill_bytes(nonce.as_mut_slice());
        Self {
            sid,
            sender: sender.clone(),
            nonce,
            Gamma,
        }
    }

    pub(crate) fn commit(&self) -> Result<GammaCommit> {
        let mut transcript = Transcript::new(b"SignR1");
        transcript.append_message(b"decom", &serialize!(&self)?);
        let mut hash = [0u8; 32];
        transcript.challenge_bytes(b"hashing r1", &mut hash);
        Ok(GammaCommit { hash })
    }

    pub(crate) fn verify(&self, sid: Identifier, sender: &MemberId, com: &GammaCommit) -> Result<()> {
        if self.sid != sid || &self.sender != sender {
            return verify_err!("decommitment bound to another session or sender");
        }
        if &self.commit()? != com {
            return verify_err!("decommitment does not open the commitment");
        }
        Ok(())
    }
}

/// Round one: commitment to `Gamma_i`, `Enc_i(k_i)`, and a proof under the
/// recipient's parameters that `k_i` is in range.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub(crate) struct SignRoundOne {
    pub(crate) commit: GammaCommit,
    pub(crate) encrypted_k: Ciphertext,
    pub(crate) range_proof: PiEncProof,
}

/// A share conversion response and the proof it was formed honestly.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub(crate) struct MtaReply {
    pub(crate) ciphertext: Ciphertext,
    pub(crate) proof: PiAffgProof,
}

/// Round two: share conversion responses for `k_j * gamma_i` and
/// `k_j * w_i`, both under the recipient's Paillier key. The first response
/// is proven against `Gamma`, which round three must open to.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub(crate) struct MtaResponse {
    pub(crate) Gamma: CurvePoint,
    pub(crate) gamma: MtaReply,
    pub(crate) w: MtaReply,
}

/// Round three: the sender's `delta_i` and the opening of `Gamma_i`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub(crate) struct SignRoundThree {
    pub(crate) delta: Scalar,
    pub(crate) decommit: GammaDecommit,
}

/// Round four: the sender's signature share.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub(crate) struct SignRoundFour {
    pub(crate) s: Scalar,
}

/// Responder side of the multiplicative-to-additive conversion.
///
/// Given `Enc(a)` under the initiator's key, returns `Enc(a * b + beta')`
/// with a proof against `B = b * G`, and the responder's additive share
/// `-beta' mod q`.
pub(crate) fn mta_respond<R: RngCore + CryptoRng>(
    rng: &mut R,
    initiator: &AuxInfoPublic,
    encrypted_a: &Ciphertext,
    b: &Scalar,
    B: &CurvePoint,
    transcript: &mut Transcript,
) -> Result<(MtaReply, Scalar)> {
    let key = initiator.encryption_key();
    let beta_prime = random_bn_in_range(rng, ELL_PRIME);
    let b = scalar_to_bn(b);
    let (encrypted_beta, rho) = key.encrypt(rng, &beta_prime)?;
    let ciphertext = key.add(&key.mul(encrypted_a, &b), &encrypted_beta);
    let proof = PiAffgProof::prove(
        &PiAffgInput::new(initiator.params(), key, encrypted_a, &ciphertext, B),
        &PiAffgSecret::new(&b, &beta_prime, &rho),
        transcript,
        rng,
    )?;
    Ok((MtaReply { ciphertext, proof }, -bn_to_scalar(&beta_prime)?))
}

/// Initiator side: check the proof against `B`, then decrypt the response
/// into the initiator's additive share.
pub(crate) fn mta_finish(
    initiator: &AuxInfoPublic,
    key: &DecryptionKey,
    encrypted_a: &Ciphertext,
    reply: &MtaReply,
    B: &CurvePoint,
    transcript: &mut Transcript,
) -> Result<Scalar> {
    reply.proof.verify(
        &PiAffgInput::new(
            initiator.params(),
            initiator.encryption_key(),
            encrypted_a,
            &reply.ciphertext,
            B,
        ),
        transcript,
    )?;
    bn_to_scalar(&key.decrypt(&reply.ciphertext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        keygen::test_paillier_key,
        protocol::{KeepId, SessionKind},
        utils::random_scalar,
    };
    use k256::SecretKey;
    use rand::rngs::OsRng;
    use test_log::test;

    fn transcript() -> Transcript {
        Transcript::new(b"share conversion test")
    }

    #[test]
    fn share_conversion_adds_up_to_product() -> Result<()> {
        let mut rng = OsRng;
        let alice = test_paillier_key(0);
        let (alice_info, _) = AuxInfoPublic::new(&alice, &mut rng)?;
        let a = random_scalar(&mut rng);
        let b = random_scalar(&mut rng);
        let B = CurvePoint::GENERATOR.multiply(&b);

        let (encrypted_a, _) = alice
            .encryption_key()
            .encrypt(&mut rng, &scalar_to_bn(&a))?;
        let (reply, beta) =
            mta_respond(&mut rng, &alice_info, &encrypted_a, &b, &B, &mut transcript())?;
        let alpha = mta_finish(&alice_info, &alice, &encrypted_a, &reply, &B, &mut transcript())?;
        assert_eq!(alpha + beta, a * b);
        Ok(())
    }

    #[test]
    fn share_conversion_rejects_a_mismatched_point() -> Result<()> {
        let mut rng = OsRng;
        let alice = test_paillier_key(0);
        let (alice_info, _) = AuxInfoPublic::new(&alice, &mut rng)?;
        let a = random_scalar(&mut rng);
        let b = random_scalar(&mut rng);

        let (encrypted_a, _) = alice
            .encryption_key()
            .encrypt(&mut rng, &scalar_to_bn(&a))?;
        // The responder multiplies by `b` but claims another point.
        let claimed = CurvePoint::GENERATOR.multiply(&random_scalar(&mut rng));
        let (reply, _) =
            mta_respond(&mut rng, &alice_info, &encrypted_a, &b, &claimed, &mut transcript())?;
        let finished =
            mta_finish(&alice_info, &alice, &encrypted_a, &reply, &claimed, &mut transcript());
        assert!(finished.is_err());
        Ok(())
    }

    #[test]
    fn gamma_decommitment_is_binding() -> Result<()> {
        let mut rng = OsRng;
        let sid = Identifier::derive(&KeepId::new("k"), &SessionKind::Signing([0; 32]), 0);
        let sender = MemberId::from_public_key(&SecretKey::random(&mut rng).public_key());
        let gamma = CurvePoint::GENERATOR.multiply(&random_scalar(&mut rng));

        let decommit = GammaDecommit::new(&mut rng, sid, &sender, gamma);
        let commit = decommit.commit()?;
        assert!(decommit.verify(sid, &sender, &commit).is_ok());

        let other = GammaDecommit::new(&mut rng, sid, &sender, CurvePoint::GENERATOR);
        assert!(other.verify(sid, &sender, &commit).is_err());
        Ok(())
    }
}
