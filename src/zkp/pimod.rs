// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Implements the ZKP from Figure 16 of https://eprint.iacr.org/2021/060.pdf
//!
//! The prover shows its Paillier modulus `N` is a Blum integer coprime to
//! `φ(N)`: for challenges `y_i`, it reveals an `N`-th root `z_i` of `y_i` and
//! a fourth root `x_i` of `(-1)^a_i * w^b_i * y_i`.

use super::Proof;
use crate::{
    errors::*,
    paillier::DecryptionKey,
    parameters::SOUNDNESS_PARAMETER,
    utils::{bn_mod, bn_random_from_transcript, modpow, random_bn_in_z_star},
};
use libpaillier::unknown_order::BigNumber;
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PiModProof {
    /// A non-residue with Jacobi symbol `-1`.
    w: BigNumber,
    elements: Vec<PiModProofElements>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PiModProofElements {
    x: BigNumber,
    a: bool,
    b: bool,
    z: BigNumber,
}

pub(crate) struct PiModInput {
    N: BigNumber,
}

impl PiModInput {
    pub(crate) fn new(N: &BigNumber) -> Self {
        Self { N: N.clone() }
    }
}

pub(crate) struct PiModSecret {
    p: BigNumber,
    q: BigNumber,
}

impl PiModSecret {
    pub(crate) fn new(sk: &DecryptionKey) -> Self {
        let (p, q) = sk.primes();
        Self {
            p: p.clone(),
            q: q.clone(),
        }
    }
}

/// Whether `x` is a quadratic residue modulo the odd prime `p`.
fn is_residue(x: &BigNumber, p: &BigNumber) -> bool {
    let exponent = (p - &BigNumber::one()) / &BigNumber::from(2u64);
    modpow(x, &exponent, p) == BigNumber::one()
}

/// The fourth root of a residue `y` modulo a prime `p = 3 mod 4`.
///
/// `y^((p+1)/4)` is the square root that is itself a residue, so applying
/// the map twice gives a fourth root.
fn fourth_root_mod_prime(y: &BigNumber, p: &BigNumber) -> BigNumber {
    let exponent = (p + &BigNumber::one()) / &BigNumber::from(4u64);
    modpow(&modpow(y, &exponent, p), &exponent, p)
}

/// Finds an x such that x = a1 (mod p) and x = a2 (mod q)
fn chinese_remainder_theorem(
    a1: &BigNumber,
    a2: &BigNumber,
    p: &BigNumber,
    q: &BigNumber,
) -> Result<BigNumber> {
    let p_inv = p.invert(q).ok_or(InternalError::CouldNotGenerateProof)?;
    let t = a2.modsub(&bn_mod(a1, q), q).modmul(&p_inv, q);
    Ok(a1 + p * t)
}

/// Compute y' = (-1)^a * w^b * y (mod N)
fn y_prime_from_y(y: &BigNumber, w: &BigNumber, a: bool, b: bool, N: &BigNumber) -> BigNumber {
    let mut y_prime = y.clone();
    if b {
        y_prime = y_prime.modmul(w, N);
    }
    if a {
        y_prime = y_prime.modneg(N);
    }
    y_prime
}

fn fill_out_transcript(transcript: &mut Transcript, N: &BigNumber, w: &BigNumber) {
    transcript.append_message(b"PiModProof N", &N.to_bytes());
    transcript.append_message(b"w", &w.to_bytes());
}

impl Proof for PiModProof {
    type CommonInput = PiModInput;
    type ProverSecret = PiModSecret;

    fn prove<R: RngCore + CryptoRng>(
        input: &Self::CommonInput,
        secret: &Self::ProverSecret,
        transcript: &mut Transcript,
        rng: &mut R,
    ) -> Result<Self> {
        let N = &input.N;
        let (p, q) = (&secret.p, &secret.q);
        if &(p * q) != N {
            return Err(InternalError::CouldNotGenerateProof);
        }

        // (w|p) = -1 and (w|q) = 1, so the Jacobi symbol of w is -1.
        let w = loop {
            let w = random_bn_in_z_star(rng, N);
            if !is_residue(&w, p) && is_residue(&w, q) {
                break w;
            }
        };
        fill_out_transcript(transcript, N, &w);

        let one = BigNumber::one();
        let phi_n = (p - &one) * (q - &one);
        let exp = N
            .invert(&phi_n)
            .ok_or(InternalError::CouldNotGenerateProof)?;

        let mut elements = Vec::with_capacity(SOUNDNESS_PARAMETER);
        for _ in 0..SOUNDNESS_PARAMETER {
            let y = bn_random_from_transcript(transcript, N);
            // Exactly one combination is a residue modulo both primes.
            let (a, b) = [(false, false), (false, true), (true, false), (true, true)]
                .into_iter()
                .find(|(a, b)| {
                    let y_prime = y_prime_from_y(&y, &w, *a, *b, N);
                    is_residue(&y_prime, p) && is_residue(&y_prime, q)
                })
                .ok_or(InternalError::CouldNotGenerateProof)?;
            let y_prime = y_prime_from_y(&y, &w, a, b, N);
            let x = chinese_remainder_theorem(
                &fourth_root_mod_prime(&y_prime, p),
                &fourth_root_mod_prime(&y_prime, q),
                p,
                q,
            )?;
            let z = modpow(&y, &exp, N);
            elements.push(PiModProofElements { x, a, b, z });
        }

        Ok(Self { w, elements })
    }

    fn verify(&self, input: &Self::CommonInput, transcript: &mut Transcript) -> Result<()> {
        let N = &input.N;
        // Verify that N is an odd composite number
        if bn_mod(N, &BigNumber::from(2u64)) == BigNumber::zero() {
            error!("Paillier-Blum modulus is even");
            return verify_err!("N is even");
        }
        if N.is_prime() {
            error!("Paillier-Blum modulus is prime");
            return verify_err!("N is not composite");
        }
        if self.elements.len() != SOUNDNESS_PARAMETER {
            return verify_err!("wrong number of proof elements");
        }
        if self.w <= BigNumber::zero() || &self.w >= N {
            return verify_err!("w is not in Z_N");
        }

        fill_out_transcript(transcript, N, &self.w);
        let four = BigNumber::from(4u64);
        for elements in &self.elements {
            let y = bn_random_from_transcript(transcript, N);
            if modpow(&elements.z, N, N) != y {
                return verify_err!("z^N != y (mod N)");
            }
            let y_prime = y_prime_from_y(&y, &self.w, elements.a, elements.b, N);
            if modpow(&elements.x, &four, N) != y_prime {
                return verify_err!("x^4 != y' (mod N)");
            }
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
        Transcript::new(b"PiModProof test")
    }

    fn key(i: usize) -> DecryptionKey {
        DecryptionKey::from_primes(&POOL_OF_PRIMES[2 * i], &POOL_OF_PRIMES[2 * i + 1]).unwrap()
    }

    fn random_modulus_proof(sk: &DecryptionKey) -> Result<(PiModInput, PiModProof)> {
        let input = PiModInput::new(sk.encryption_key().n());
        let proof = PiModProof::prove(&input, &PiModSecret::new(sk), &mut transcript(), &mut OsRng)?;
        Ok((input, proof))
    }

    #[test]
    fn test_paillier_blum_modulus_proof() -> Result<()> {
        let (input, proof) = random_modulus_proof(&key(0))?;
        proof.verify(&input, &mut transcript())?;
        assert!(proof
            .verify(&input, &mut Transcript::new(b"another session"))
            .is_err());
        Ok(())
    }

    #[test]
    fn proof_does_not_transfer_to_another_modulus() -> Result<()> {
        let (_, proof) = random_modulus_proof(&key(0))?;
        let other = PiModInput::new(key(1).encryption_key().n());
        assert!(proof.verify(&other, &mut transcript()).is_err());
        Ok(())
    }

    #[test]
    fn malformed_moduli_are_rejected() -> Result<()> {
        let (_, proof) = random_modulus_proof(&key(0))?;
        let prime = PiModInput::new(&POOL_OF_PRIMES[0]);
        assert!(proof.verify(&prime, &mut transcript()).is_err());
        let even = PiModInput::new(&(key(0).encryption_key().n() + BigNumber::one()));
        assert!(proof.verify(&even, &mut transcript()).is_err());
        Ok(())
    }

    #[test]
    fn prover_needs_the_factorization() {
        let sk = key(0);
        let input = PiModInput::new(key(1).encryption_key().n());
        assert!(PiModProof::prove(&input, &PiModSecret::new(&sk), &mut transcript(), &mut OsRng).is_err());
    }

    #[test]
    fn helpers_compute_roots() -> Result<()> {
        let (p, q) = (&POOL_OF_PRIMES[0], &POOL_OF_PRIMES[1]);
        let x = BigNumber::from(123_456_789u64);
        let y = modpow(&x, &BigNumber::from(4u64), p);
        let root = fourth_root_mod_prime(&y, p);
        assert_eq!(modpow(&root, &BigNumber::from(4u64), p), y);

        let combined = chinese_remainder_theorem(&BigNumber::from(3u64), &BigNumber::from(5u64), p, q)?;
        assert_eq!(bn_mod(&combined, p), BigNumber::from(3u64));
        assert_eq!(bn_mod(&combined, q), BigNumber::from(5u64));
        Ok(())
    }
}
