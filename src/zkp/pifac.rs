// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Implements the ZKP from Figure 28 of https://eprint.iacr.org/2021/060.pdf
//!
//! The prover shows that both factors of its modulus `N0` are close to
//! `sqrt(N0)`, so neither is small. Commitments are made under the
//! verifier's [`RingPedersen`] parameters.
//!
//! All masks are sampled from `[0, 2^l * m)` rather than `±2^l * m`, and
//! `σ` is offset by `ν * p` so that every response stays non-negative.

use super::Proof;
use crate::{
    errors::*,
    paillier::DecryptionKey,
    parameters::{ELL, EPSILON},
    ring_pedersen::RingPedersen,
    utils::{bn_random_from_transcript, k256_order, modpow, random_bn_scaled},
};
use libpaillier::unknown_order::BigNumber;
use merlin::Transcript;
use num_bigint::BigUint;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PiFacProof {
    P: BigNumber,
    Q: BigNumber,
    A: BigNumber,
    B: BigNumber,
    T: BigNumber,
    sigma: BigNumber,
    e: BigNumber,
    z1: BigNumber,
    z2: BigNumber,
    w1: BigNumber,
    w2: BigNumber,
    v: BigNumber,
}

#[derive(Serialize)]
pub(crate) struct PiFacInput {
    /// The verifier's commitment parameters.
    setup_params: RingPedersen,
    /// The prover's Paillier modulus.
    N0: BigNumber,
}

impl PiFacInput {
    pub(crate) fn new(verifier_setup_params: &RingPedersen, N0: &BigNumber) -> Self {
        Self {
            setup_params: verifier_setup_params.clone(),
            N0: N0.clone(),
        }
    }
}

pub(crate) struct PiFacSecret {
    p: BigNumber,
    q: BigNumber,
}

impl PiFacSecret {
    pub(crate) fn new(sk: &DecryptionKey) -> Self {
        let (p, q) = sk.primes();
        Self {
            p: p.clone(),
            q: q.clone(),
        }
    }

    #[cfg(test)]
    fn from_factors(p: BigNumber, q: BigNumber) -> Self {
        Self { p, q }
    }
}

/// Find the square root of a positive BigNumber, rounding down
fn sqrt(num: &BigNumber) -> BigNumber {
    let num_bigint = BigUint::from_bytes_be(&num.to_bytes());
    BigNumber::from_slice(num_bigint.sqrt().to_bytes_be().as_slice())
}

#[allow(clippy::too_many_arguments)]
fn challenge(
    transcript: &mut Transcript,
    input: &PiFacInput,
    P: &BigNumber,
    Q: &BigNumber,
    A: &BigNumber,
    B: &BigNumber,
    T: &BigNumber,
    sigma: &BigNumber,
) -> Result<BigNumber> {
    transcript.append_message(b"PiFac CommonInput", &serialize!(input)?);
    transcript.append_message(b"P", &P.to_bytes());
    transcript.append_message(b"Q", &Q.to_bytes());
    transcript.append_message(b"A", &A.to_bytes());
    transcript.append_message(b"B", &B.to_bytes());
    transcript.append_message(b"T", &T.to_bytes());
    transcript.append_message(b"sigma", &sigma.to_bytes());
    Ok(bn_random_from_transcript(transcript, &k256_order()))
}

impl Proof for PiFacProof {
    type CommonInput = PiFacInput;
    type ProverSecret = PiFacSecret;

    fn prove<R: RngCore + CryptoRng>(
        input: &Self::CommonInput,
        secret: &Self::ProverSecret,
        transcript: &mut Transcript,
        rng: &mut R,
    ) -> Result<Self> {
        let setup = &input.setup_params;
        let one = BigNumber::one();
        let sqrt_N0 = sqrt(&input.N0);

        let alpha = random_bn_scaled(rng, ELL + EPSILON, &sqrt_N0);
        let beta = random_bn_scaled(rng, ELL + EPSILON, &sqrt_N0);
        let mu = setup.commitment_randomness(ELL, &one, rng);
        let nu = setup.commitment_randomness(ELL, &one, rng);
        let sigma_hat = setup.commitment_randomness(ELL, &input.N0, rng);
        let sigma = &sigma_hat + &nu * &secret.p;
        let r = setup.commitment_randomness(ELL + EPSILON, &input.N0, rng);
        let x = setup.commitment_randomness(ELL + EPSILON, &one, rng);
        let y = setup.commitment_randomness(ELL + EPSILON, &one, rng);

        let P = setup.commit(&secret.p, &mu);
        let Q = setup.commit(&secret.q, &nu);
        let A = setup.commit(&alpha, &x);
        let B = setup.commit(&beta, &y);
        // T = Q^alpha * t^r
        let T = setup.combine(&modpow(setup.t(), &r, setup.modulus()), &Q, &alpha);

        let e = challenge(transcript, input, &P, &Q, &A, &B, &T, &sigma)?;

        let z1 = &alpha + &e * &secret.p;
        let z2 = &beta + &e * &secret.q;
        let w1 = &x + &e * &mu;
        let w2 = &y + &e * &nu;
        let v = &r + &e * &sigma_hat;

        Ok(Self {
            P,
            Q,
            A,
            B,
            T,
            sigma,
            e,
            z1,
            z2,
            w1,
            w2,
            v,
        })
    }

    fn verify(&self, input: &Self::CommonInput, transcript: &mut Transcript) -> Result<()> {
        let setup = &input.setup_params;
        let e = challenge(
            transcript, input, &self.P, &self.Q, &self.A, &self.B, &self.T, &self.sigma,
        )?;
        if e != self.e {
            return verify_err!("Fiat-Shamir consistency check failed");
        }

        // s^z1 t^w1 = A P^e
        if setup.commit(&self.z1, &self.w1) != setup.combine(&self.A, &self.P, &e) {
            return verify_err!("p commitment check failed");
        }
        // s^z2 t^w2 = B Q^e
        if setup.commit(&self.z2, &self.w2) != setup.combine(&self.B, &self.Q, &e) {
            return verify_err!("q commitment check failed");
        }
        // Q^z1 t^v = T R^e, where R = s^N0 t^sigma
        let R = setup.commit(&input.N0, &self.sigma);
        let lhs = setup.combine(
            &modpow(setup.t(), &self.v, setup.modulus()),
            &self.Q,
            &self.z1,
        );
        if lhs != setup.combine(&self.T, &R, &e) {
            return verify_err!("modulus check failed");
        }

        // 2^{ELL + EPSILON + 1} * sqrt(N_0)
        let z_bound = sqrt(&input.N0) * (BigNumber::one() << (ELL + EPSILON + 1));
        if self.z1 >= z_bound || self.z2 >= z_bound {
            return verify_err!("factor response out of range");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safe_primes_512::POOL_OF_PRIMES;
    use rand::rngs::OsRng;
    use test_log::test;

    fn transcript() -> Transcript {
        Transcript::new(b"PiFacProof test")
    }

    fn verifier_params() -> Result<RingPedersen> {
        let sk = DecryptionKey::from_primes(&POOL_OF_PRIMES[6], &POOL_OF_PRIMES[7])?;
        Ok(RingPedersen::extract(&sk, &mut OsRng)?.0)
    }

    #[test]
    fn test_no_small_factors_proof() -> Result<()> {
        let mut rng = OsRng;
        let sk = DecryptionKey::from_primes(&POOL_OF_PRIMES[0], &POOL_OF_PRIMES[1])?;
        let params = verifier_params()?;
        let input = PiFacInput::new(&params, sk.encryption_key().n());
        let proof = PiFacProof::prove(&input, &PiFacSecret::new(&sk), &mut transcript(), &mut rng)?;
        proof.verify(&input, &mut transcript())?;

        let other = PiFacInput::new(&params, &(&POOL_OF_PRIMES[2] * &POOL_OF_PRIMES[3]));
        assert!(proof.verify(&other, &mut transcript()).is_err());
        Ok(())
    }

    #[test]
    fn modulus_with_a_small_factor_is_rejected() -> Result<()> {
        let mut rng = OsRng;
        let large = POOL_OF_PRIMES[..4]
            .iter()
            .fold(BigNumber::one(), |acc, p| acc * p);
        let N0 = &large * &BigNumber::from(7u64);
        let input = PiFacInput::new(&verifier_params()?, &N0);
        let secret = PiFacSecret::from_factors(BigNumber::from(7u64), large);
        let proof = PiFacProof::prove(&input, &secret, &mut transcript(), &mut rng)?;
        assert!(proof.verify(&input, &mut transcript()).is_err());
        Ok(())
    }
}
