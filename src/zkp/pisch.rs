// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Schnorr proof of knowledge of a discrete logarithm: given `X`, the prover
//! shows it knows `x` with `X = x * g`.

use super::Proof;
use crate::{
    errors::*,
    utils::{random_nonzero_scalar, scalar_from_transcript, CurvePoint},
};
use k256::Scalar;
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PiSchProof {
    A: CurvePoint,
    e: Scalar,
    z: Scalar,
}

pub(crate) struct PiSchInput {
    g: CurvePoint,
    X: CurvePoint,
}

impl PiSchInput {
    pub(crate) fn new(X: &CurvePoint) -> Self {
        Self {
            g: CurvePoint::GENERATOR,
            X: *X,
        }
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct PiSchSecret {
    x: Scalar,
}

impl PiSchSecret {
    pub(crate) fn new(x: &Scalar) -> Self {
        Self { x: *x }
    }
}

fn challenge(transcript: &mut Transcript, input: &PiSchInput, A: &CurvePoint) -> Scalar {
    transcript.append_message(b"g", &input.g.to_compressed());
    transcript.append_message(b"X", &input.X.to_compressed());
    transcript.append_message(b"A", &A.to_compressed());
    scalar_from_transcript(transcript, b"PiSchProof challenge")
}

impl Proof for PiSchProof {
    type CommonInput = PiSchInput;
    type ProverSecret = PiSchSecret;

    fn prove<R: RngCore + CryptoRng>(
        input: &Self::CommonInput,
        secret: &Self::ProverSecret,
        transcript: &mut Transcript,
        rng: &mut R,
    ) -> Result<Self> {
        let mut alpha = random_nonzero_scalar(rng);
        let A = input.g.multiply(&alpha);
        let e = challenge(transcript, input, &A);
        let z = alpha + e * secret.x;
        alpha.zeroize();
        Ok(Self { A, e, z })
    }

    fn verify(&self, input: &Self::CommonInput, transcript: &mut Transcript) -> Result<()> {
        // First check Fiat-Shamir challenge consistency
        let e = challenge(transcript, input, &self.A);
        if e != self.e {
            return verify_err!("Fiat-Shamir consistency check failed");
        }

        let lhs = input.g.multiply(&self.z);
        let rhs = CurvePoint(self.A.0 + input.X.multiply(&self.e).0);
        if lhs != rhs {
            return verify_err!("Schnorr equation does not hold");
        }
        Ok(())
    }
}
