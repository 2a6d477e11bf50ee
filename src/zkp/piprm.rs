// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Implements a zero-knowledge proof that [`RingPedersen`] parameters were
//! correctly constructed: `s = t^λ mod N` for a secret `λ`. The proof is
//! defined in Figure 17 of <https://eprint.iacr.org/2021/060.pdf>, with one
//! bit of challenge per repetition.

use super::Proof;
use crate::{
    errors::*,
    parameters::SOUNDNESS_PARAMETER,
    ring_pedersen::RingPedersen,
    utils::{modpow, random_bn},
};
use libpaillier::unknown_order::BigNumber;
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

/// Proof that externally provided [`RingPedersen`] parameters are constructed
/// correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PiPrmProof {
    /// The commitments computed by the prover (`A_i` in the paper).
    commitments: Vec<BigNumber>,
    /// The challenge bytes (`e_i` in the paper, one bit each).
    challenge_bytes: Vec<u8>,
    /// The prover responses (`z_i` in the paper).
    responses: Vec<BigNumber>,
}

/// The secret exponent `λ` and Euler's totient of the modulus.
pub(crate) struct PiPrmSecret {
    exponent: BigNumber,
    totient: BigNumber,
}

impl PiPrmSecret {
    pub(crate) fn new(exponent: BigNumber, totient: BigNumber) -> Self {
        Self { exponent, totient }
    }
}

fn generate_challenge_bytes(
    transcript: &mut Transcript,
    input: &RingPedersen,
    commitments: &[BigNumber],
) -> Result<Vec<u8>> {
    transcript.append_message(b"PiPrmProof common input", &serialize!(&input)?);
    transcript.append_message(b"Commitments", &serialize!(&commitments)?);
    let mut challenges = [0u8; SOUNDNESS_PARAMETER];
    transcript.challenge_bytes(b"Challenges", challenges.as_mut_slice());
    Ok(challenges.into())
}

impl Proof for PiPrmProof {
    type CommonInput = RingPedersen;
    type ProverSecret = PiPrmSecret;

    fn prove<R: RngCore + CryptoRng>(
        input: &Self::CommonInput,
        secret: &Self::ProverSecret,
        transcript: &mut Transcript,
        rng: &mut R,
    ) -> Result<Self> {
        // Sample secret exponents `a_i ← Z[ɸ(N)]`.
        let secret_exponents: Vec<_> = std::iter::repeat_with(|| random_bn(rng, &secret.totient))
            .take(SOUNDNESS_PARAMETER)
            .collect();
        // Compute commitments values `A_i = t^{a_i} mod N`.
        let commitments = secret_exponents
            .iter()
            .map(|a| modpow(input.t(), a, input.modulus()))
            .collect::<Vec<_>>();
        let challenge_bytes = generate_challenge_bytes(transcript, input, &commitments)?;
        // Compute challenge responses `z_i = a_i + e_i λ mod ɸ(N)`.
        let responses = challenge_bytes
            .iter()
            .zip(secret_exponents)
            .map(|(e, a)| {
                if e % 2 == 1 {
                    a.modadd(&secret.exponent, &secret.totient)
                } else {
                    a
                }
            })
            .collect();

        Ok(Self {
            commitments,
            challenge_bytes,
            responses,
        })
    }

    fn verify(&self, input: &Self::CommonInput, transcript: &mut Transcript) -> Result<()> {
        if !input.is_well_formed() {
            return verify_err!("ring-Pedersen parameters are not units");
        }
        if self.commitments.len() != SOUNDNESS_PARAMETER
            || self.challenge_bytes.len() != SOUNDNESS_PARAMETER
            || self.responses.len() != SOUNDNESS_PARAMETER
        {
            return verify_err!("length of values provided does not match soundness parameter");
        }
        let challenges = generate_challenge_bytes(transcript, input, &self.commitments)?;
        if challenges != self.challenge_bytes {
            return verify_err!("Fiat-Shamir does not verify");
        }

        let is_sound = challenges
            .into_iter()
            .zip(&self.responses)
            .zip(&self.commitments)
            .all(|((e, z), a)| {
                // `t^{z_i} = A_i * s^{e_i} mod N`
                let lhs = modpow(input.t(), z, input.modulus());
                let rhs = if e % 2 == 1 {
                    a.modmul(input.s(), input.modulus())
                } else {
                    a.clone()
                };
                lhs == rhs
            });
        if !is_sound {
            return verify_err!("response validation check failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{paillier::DecryptionKey, safe_primes_512::POOL_OF_PRIMES};
    use rand::rngs::OsRng;
    use test_log::test;

    fn transcript() -> Transcript {
        Transcript::new(b"PiPrmProof test")
    }

    fn random_ring_pedersen_proof() -> Result<(RingPedersen, PiPrmProof)> {
        let mut rng = OsRng;
        let sk = DecryptionKey::from_primes(&POOL_OF_PRIMES[4], &POOL_OF_PRIMES[5])?;
        let (scheme, lambda) = RingPedersen::extract(&sk, &mut rng)?;
        let proof = PiPrmProof::prove(
            &scheme,
            &PiPrmSecret::new(lambda, sk.totient()),
            &mut transcript(),
            &mut rng,
        )?;
        Ok((scheme, proof))
    }

    #[test]
    fn test_ring_pedersen_proof() -> Result<()> {
        let (input, proof) = random_ring_pedersen_proof()?;
        proof.verify(&input, &mut transcript())?;
        assert!(proof.verify(&input, &mut Transcript::new(b"other")).is_err());
        Ok(())
    }

    #[test]
    fn swapped_parameters_are_rejected() -> Result<()> {
        let (input, proof) = random_ring_pedersen_proof()?;
        let tampered = RingPedersen::from_parts(
            input.s().modmul(input.t(), input.modulus()),
            input.t().clone(),
            input.modulus().clone(),
        );
        assert!(proof.verify(&tampered, &mut transcript()).is_err());
        Ok(())
    }
}
