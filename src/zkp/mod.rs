// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2023 Bolt Labs, Inc.
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Non-interactive zero-knowledge proofs, made non-interactive with a
//! [`merlin`] transcript that both sides bind to the session first.
//!
//! Key generation proves knowledge of discrete logarithms ([`pisch`]) and
//! that every member's Paillier modulus and ring-Pedersen parameters are well
//! formed ([`pimod`], [`piprm`], [`pifac`]). Signing proves that encrypted
//! nonces are in range ([`pienc`]) and that share conversion responses were
//! formed honestly ([`piaffg`]).

pub(crate) mod piaffg;
pub(crate) mod pienc;
pub(crate) mod pifac;
pub(crate) mod pimod;
pub(crate) mod piprm;
pub(crate) mod pisch;

use crate::errors::Result;
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{de::DeserializeOwned, Serialize};

/// A proof that travels inside protocol messages.
///
/// [`Proof::CommonInput`] is the statement both sides know;
/// [`Proof::ProverSecret`] is the witness.
pub(crate) trait Proof: Sized + Serialize + DeserializeOwned {
    type CommonInput;
    type ProverSecret;

    /// Prove the statement, drawing challenges from `transcript`.
    fn prove<R: RngCore + CryptoRng>(
        input: &Self::CommonInput,
        secret: &Self::ProverSecret,
        transcript: &mut Transcript,
        rng: &mut R,
    ) -> Result<Self>;

    /// Check the proof; `transcript` must be in the prover's starting state.
    fn verify(&self, input: &Self::CommonInput, transcript: &mut Transcript) -> Result<()>;
}
