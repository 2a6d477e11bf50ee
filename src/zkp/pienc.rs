// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Implements the ZKP from Figure 14 of https://eprint.iacr.org/2021/060.pdf
//!
//! The prover shows that a Paillier ciphertext `K` under its own key encrypts
//! a plaintext `k < 2^ELL`. Commitments are made under the verifier's
//! [`RingPedersen`] parameters.

use super::Proof;
use crate::{
    errors::*,
    paillier::{Ciphertext, EncryptionKey, Nonce},
    parameters::{ELL, EPSILON},
    ring_pedersen::RingPedersen,
    utils::{bn_random_from_transcript, k256_order, random_bn_in_range, random_bn_in_z_star},
};
use libpaillier::unknown_order::BigNumber;
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PiEncProof {
    /// Encryption of the plaintext mask `alpha`.
    A: Ciphertext,
    /// Commitment to the plaintext.
    S: BigNumber,
    /// Commitment to the plaintext mask.
    C: BigNumber,
    e: BigNumber,
    z1: BigNumber,
    z2: Nonce,
    z3: BigNumber,
}

#[derive(Serialize)]
pub(crate) struct PiEncInput {
    /// The verifier's commitment parameters.
    setup_params: RingPedersen,
    /// The prover's Paillier key.
    encryption_key: EncryptionKey,
    /// The ciphertext `K` whose plaintext is range checked.
    ciphertext: Ciphertext,
}

impl PiEncInput {
    pub(crate) fn new(
        verifier_setup_params: &RingPedersen,
        encryption_key: &EncryptionKey,
        ciphertext: &Ciphertext,
    ) -> Self {
        Self {
            setup_params: verifier_setup_params.clone(),
            encryption_key: encryption_key.clone(),
            ciphertext: ciphertext.clone(),
        }
    }
}

/// The plaintext `k` and nonce `ρ` of `K`.
pub(crate) struct PiEncSecret {
    plaintext: BigNumber,
    nonce: Nonce,
}

impl PiEncSecret {
    pub(crate) fn new(plaintext: &BigNumber, nonce: &Nonce) -> Self {
        Self {
            plaintext: plaintext.clone(),
            nonce: nonce.clone(),
        }
    }
}

fn challenge(
    transcript: &mut Transcript,
    input: &PiEncInput,
    A: &Ciphertext,
    S: &BigNumber,
    C: &BigNumber,
) -> Result<BigNumber> {
    transcript.append_message(b"PiEnc CommonInput", &serialize!(input)?);
    transcript.append_message(b"A", &A.0.to_bytes());
    transcript.append_message(b"S", &S.to_bytes());
    transcript.append_message(b"C", &C.to_bytes());
    Ok(bn_random_from_transcript(transcript, &k256_order()))
}

impl Proof for PiEncProof {
    type CommonInput = PiEncInput;
    type ProverSecret = PiEncSecret;

    fn prove<R: RngCore + CryptoRng>(
        input: &Self::CommonInput,
        secret: &Self::ProverSecret,
        transcript: &mut Transcript,
        rng: &mut R,
    ) -> Result<Self> {
        let setup = &input.setup_params;
        let one = BigNumber::one();

        let alpha = random_bn_in_range(rng, ELL + EPSILON);
        let mu = setup.commitment_randomness(ELL, &one, rng);
        let r = Nonce(random_bn_in_z_star(rng, input.encryption_key.n()));
        let gamma = setup.commitment_randomness(ELL + EPSILON, &one, rng);

        let S = setup.commit(&secret.plaintext, &mu);
        let A = input.encryption_key.encrypt_with_nonce(&alpha, &r);
        let C = setup.commit(&alpha, &gamma);

        let e = challenge(transcript, input, &A, &S, &C)?;

        let z1 = &alpha + &e * &secret.plaintext;
        let z2 = input.encryption_key.mask(&secret.nonce, &r, &e);
        let z3 = &gamma + &e * &mu;

        Ok(Self {
            A,
            S,
            C,
            e,
            z1,
            z2,
            z3,
        })
    }

    fn verify(&self, input: &Self::CommonInput, transcript: &mut Transcript) -> Result<()> {
        let setup = &input.setup_params;
        let key = &input.encryption_key;
        if key.validate(&input.ciphertext).is_err() || key.validate(&self.A).is_err() {
            error!("Range proof carries a ciphertext outside Z*_{{N^2}}");
            return verify_err!("ciphertext is not a unit");
        }

        let e = challenge(transcript, input, &self.A, &self.S, &self.C)?;
        if e != self.e {
            return verify_err!("Fiat-Shamir consistency check failed");
        }

        // (1 + N0)^z1 * z2^N0 = A * K^e
        let lhs = key.encrypt_with_nonce(&self.z1, &self.z2);
        let rhs = key.add(&self.A, &key.mul(&input.ciphertext, &e));
        if lhs != rhs {
            return verify_err!("ciphertext check failed");
        }

        // s^z1 * t^z3 = C * S^e
        if setup.commit(&self.z1, &self.z3) != setup.combine(&self.C, &self.S, &e) {
            return verify_err!("plaintext commitment check failed");
        }

        if self.z1 >= BigNumber::one() << (ELL + EPSILON + 1) {
            return verify_err!("plaintext response out of range");
        }
        Ok(())
    }
}
