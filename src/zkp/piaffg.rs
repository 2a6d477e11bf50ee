// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Implements the ZKP from Figure 15 of https://eprint.iacr.org/2021/060.pdf
//!
//! A share conversion responder holds `x` with public `X = x * G` and
//! answers the initiator's ciphertext `C` with `D = C^x * (1 + N0)^y * ρ^N0`
//! under the initiator's key `N0`. The proof shows `D` was formed this way
//! with `x < 2^ELL` and `y < 2^ELL_PRIME`, so the initiator learns nothing
//! beyond `x * k + y`.
//!
//! The responder never sends its mask encrypted under its own key, so the
//! statement carries no `Y` term.

use super::Proof;
use crate::{
    errors::*,
    paillier::{Ciphertext, EncryptionKey, Nonce},
    parameters::{ELL, ELL_PRIME, EPSILON},
    ring_pedersen::RingPedersen,
    utils::{
        bn_random_from_transcript, bn_to_scalar, k256_order, random_bn_in_range,
        random_bn_in_z_star, CurvePoint,
    },
};
use libpaillier::unknown_order::BigNumber;
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PiAffgProof {
    A: Ciphertext,
    Bx: CurvePoint,
    E: BigNumber,
    F: BigNumber,
    S: BigNumber,
    T: BigNumber,
    e: BigNumber,
    z1: BigNumber,
    z2: BigNumber,
    z3: BigNumber,
    z4: BigNumber,
    w: Nonce,
}

#[derive(Serialize)]
pub(crate) struct PiAffgInput {
    /// The verifier's commitment parameters.
    setup_params: RingPedersen,
    /// The verifier's Paillier key `N0`.
    encryption_key: EncryptionKey,
    /// The verifier's ciphertext.
    C: Ciphertext,
    /// The prover's response.
    D: Ciphertext,
    /// The prover's public multiplier `X = x * G`.
    X: CurvePoint,
}

impl PiAffgInput {
    pub(crate) fn new(
        verifier_setup_params: &RingPedersen,
        verifier_encryption_key: &EncryptionKey,
        C: &Ciphertext,
        D: &Ciphertext,
        X: &CurvePoint,
    ) -> Self {
        Self {
            setup_params: verifier_setup_params.clone(),
            encryption_key: verifier_encryption_key.clone(),
            C: C.clone(),
            D: D.clone(),
            X: *X,
        }
    }
}

pub(crate) struct PiAffgSecret {
    x: BigNumber,
    y: BigNumber,
    rho: Nonce,
}

impl PiAffgSecret {
    pub(crate) fn new(x: &BigNumber, y: &BigNumber, rho: &Nonce) -> Self {
        Self {
            x: x.clone(),
            y: y.clone(),
            rho: rho.clone(),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn challenge(
    transcript: &mut Transcript,
    input: &PiAffgInput,
    A: &Ciphertext,
    Bx: &CurvePoint,
    E: &BigNumber,
    F: &BigNumber,
    S: &BigNumber,
    T: &BigNumber,
) -> Result<BigNumber> {
    transcript.append_message(b"PiAffg CommonInput", &serialize!(input)?);
    transcript.append_message(b"A", &A.0.to_bytes());
    transcript.append_message(b"Bx", &Bx.to_compressed());
    transcript.append_message(b"E", &E.to_bytes());
    transcript.append_message(b"F", &F.to_bytes());
    transcript.append_message(b"S", &S.to_bytes());
    transcript.append_message(b"T", &T.to_bytes());
    Ok(bn_random_from_transcript(transcript, &k256_order()))
}

impl Proof for PiAffgProof {
    type CommonInput = PiAffgInput;
    type ProverSecret = PiAffgSecret;

    fn prove<R: RngCore + CryptoRng>(
        input: &Self::CommonInput,
        secret: &Self::ProverSecret,
        transcript: &mut Transcript,
        rng: &mut R,
    ) -> Result<Self> {
        let setup = &input.setup_params;
        let key = &input.encryption_key;
        let one = BigNumber::one();

        let alpha = random_bn_in_range(rng, ELL + EPSILON);
        let beta = random_bn_in_range(rng, ELL_PRIME + EPSILON);
        let r = Nonce(random_bn_in_z_star(rng, key.n()));
        let gamma = setup.commitment_randomness(ELL + EPSILON, &one, rng);
        let m = setup.commitment_randomness(ELL, &one, rng);
        let delta = setup.commitment_randomness(ELL + EPSILON, &one, rng);
        let mu = setup.commitment_randomness(ELL, &one, rng);

        // A = C^alpha * (1 + N0)^beta * r^N0
        let A = key.add(
            &key.mul(&input.C, &alpha),
            &key.encrypt_with_nonce(&beta, &r),
        );
        let Bx = CurvePoint::GENERATOR.multiply(&bn_to_scalar(&alpha)?);
        let E = setup.commit(&alpha, &gamma);
        let S = setup.commit(&secret.x, &m);
        let F = setup.commit(&beta, &delta);
        let T = setup.commit(&secret.y, &mu);

        let e = challenge(transcript, input, &A, &Bx, &E, &F, &S, &T)?;

        let z1 = &alpha + &e * &secret.x;
        let z2 = &beta + &e * &secret.y;
        let z3 = &gamma + &e * &m;
        let z4 = &delta + &e * &mu;
        let w = key.mask(&secret.rho, &r, &e);

        Ok(Self {
            A,
            Bx,
            E,
            F,
            S,
            T,
            e,
            z1,
            z2,
            z3,
            z4,
            w,
        })
    }

    fn verify(&self, input: &Self::CommonInput, transcript: &mut Transcript) -> Result<()> {
        let setup = &input.setup_params;
        let key = &input.encryption_key;
        if [&input.C, &input.D, &self.A]
            .into_iter()
            .any(|c| key.validate(c).is_err())
        {
            error!("Share conversion proof carries a ciphertext outside Z*_{{N^2}}");
            return verify_err!("ciphertext is not a unit");
        }

        let e = challenge(
            transcript, input, &self.A, &self.Bx, &self.E, &self.F, &self.S, &self.T,
        )?;
        if e != self.e {
            return verify_err!("Fiat-Shamir consistency check failed");
        }

        // C^z1 * (1 + N0)^z2 * w^N0 = A * D^e
        let lhs = key.add(
            &key.mul(&input.C, &self.z1),
            &key.encrypt_with_nonce(&self.z2, &self.w),
        );
        let rhs = key.add(&self.A, &key.mul(&input.D, &e));
        if lhs != rhs {
            return verify_err!("ciphertext check failed");
        }

        // g^z1 = Bx * X^e
        let lhs = CurvePoint::GENERATOR.multiply(&bn_to_scalar(&self.z1)?);
        let rhs = CurvePoint(self.Bx.0 + input.X.multiply(&bn_to_scalar(&e)?).0);
        if lhs != rhs {
            return verify_err!("group element check failed");
        }

        // s^z1 t^z3 = E S^e
        if setup.commit(&self.z1, &self.z3) != setup.combine(&self.E, &self.S, &e) {
            return verify_err!("multiplier commitment check failed");
        }
        // s^z2 t^z4 = F T^e
        if setup.commit(&self.z2, &self.z4) != setup.combine(&self.F, &self.T, &e) {
            return verify_err!("mask commitment check failed");
        }

        if self.z1 >= BigNumber::one() << (ELL + EPSILON + 1) {
            return verify_err!("multiplier response out of range");
        }
        if self.z2 >= BigNumber::one() << (ELL_PRIME + EPSILON + 1) {
            return verify_err!("mask response out of range");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        paillier::DecryptionKey,
        safe_primes_512::POOL_OF_PRIMES,
        utils::{random_bn, scalar_to_bn},
    };
    use k256::{elliptic_curve::Field, Scalar};
    use rand::rngs::OsRng;
    use test_log::test;

    fn transcript() -> Transcript {
        Transcript::new(b"PiAffgProof test")
    }

    struct Conversion {
        verifier: DecryptionKey,
        params: RingPedersen,
        C: Ciphertext,
        D: Ciphertext,
        X: CurvePoint,
        proof: PiAffgProof,
    }

    /// Answer an encryption of a random `k` with multiplier `x` and mask `y`.
    fn convert(x: &Scalar, y: &BigNumber) -> Result<Conversion> {
        let mut rng = OsRng;
        let verifier = DecryptionKey::from_primes(&POOL_OF_PRIMES[0], &POOL_OF_PRIMES[1])?;
        let (params, _) = RingPedersen::extract(&verifier, &mut rng)?;
        let key = verifier.encryption_key();

        let k = random_bn(&mut rng, &k256_order());
        let (C, _) = key.encrypt(&mut rng, &k)?;
        let x_bn = scalar_to_bn(x);
        let rho = Nonce(random_bn_in_z_star(&mut rng, key.n()));
        let D = key.add(&key.mul(&C, &x_bn), &key.encrypt_with_nonce(y, &rho));
        let X = CurvePoint::GENERATOR.multiply(x);

        let input = PiAffgInput::new(&params, key, &C, &D, &X);
        let proof = PiAffgProof::prove(
            &input,
            &PiAffgSecret::new(&x_bn, y, &rho),
            &mut transcript(),
            &mut rng,
        )?;
        Ok(Conversion {
            verifier,
            params,
            C,
            D,
            X,
            proof,
        })
    }

    impl Conversion {
        fn input(&self) -> PiAffgInput {
            PiAffgInput::new(
                &self.params,
                self.verifier.encryption_key(),
                &self.C,
                &self.D,
                &self.X,
            )
        }
    }

    #[test]
    fn test_affine_operation_proof() -> Result<()> {
        let y = random_bn_in_range(&mut OsRng, ELL_PRIME);
        let conversion = convert(&Scalar::random(&mut OsRng), &y)?;
        conversion
            .proof
            .verify(&conversion.input(), &mut transcript())?;
        assert!(conversion
            .proof
            .verify(&conversion.input(), &mut Transcript::new(b"another session"))
            .is_err());
        Ok(())
    }

    #[test]
    fn wrong_public_multiplier_is_rejected() -> Result<()> {
        let y = random_bn_in_range(&mut OsRng, ELL_PRIME);
        let mut conversion = convert(&Scalar::random(&mut OsRng), &y)?;
        conversion.X = CurvePoint::GENERATOR.multiply(&Scalar::random(&mut OsRng));
        assert!(conversion
            .proof
            .verify(&conversion.input(), &mut transcript())
            .is_err());
        Ok(())
    }

    #[test]
    fn tampered_response_is_rejected() -> Result<()> {
        let y = random_bn_in_range(&mut OsRng, ELL_PRIME);
        let mut conversion = convert(&Scalar::random(&mut OsRng), &y)?;
        let key = conversion.verifier.encryption_key().clone();
        let (one, _) = key.encrypt(&mut OsRng, &BigNumber::one())?;
        conversion.D = key.add(&conversion.D, &one);
        assert!(conversion
            .proof
            .verify(&conversion.input(), &mut transcript())
            .is_err());
        Ok(())
    }

    #[test]
    fn oversized_mask_is_rejected() -> Result<()> {
        let y = BigNumber::one() << (ELL_PRIME + EPSILON + 100);
        let conversion = convert(&Scalar::random(&mut OsRng), &y)?;
        assert!(conversion
            .proof
            .verify(&conversion.input(), &mut transcript())
            .is_err());
        Ok(())
    }
}
