// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    auxinfo::{AuxInfoProof, AuxInfoPublic},
    errors::Result,
    protocol::{Identifier, MemberId},
    utils::CurvePoint,
    zkp::pisch::PiSchProof,
};
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub(crate) struct KeygenCommit {
    hash: [u8; 32],
}

/// Round one payload: the commitment, the ephemeral key peers use to
/// encrypt the shares they send us, and our proven auxiliary information.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub(crate) struct KeygenRoundOne {
    pub(crate) commit: KeygenCommit,
    pub(crate) ephemeral_key: CurvePoint,
    pub(crate) aux_info: AuxInfoPublic,
    pub(crate) aux_proof: AuxInfoProof,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub(crate) struct KeygenDecommit {
    pub(crate) sid: Identifier,
    pub(crate) sender: MemberId,
    nonce: [u8; 32],
    /// Feldman commitments `a_k * g` to the polynomial coefficients.
    pub(crate) coefficient_commitments: Vec<CurvePoint>,
    /// Proof of knowledge of the constant term.
    pub(crate) proof: PiSchProof,
}

impl KeygenDecommit {
    pub(crate) fn new<R: RngCore + CryptoRng>(
        rng: &mut R,
        sid: Identifier,
        sender: &MemberId,
        coefficient_commitments: Vec<CurvePoint>,
        proof: PiSchProof,
    ) -> Self {
        let mut nonce = [0u8; 32];
        rng.fill_bytes(nonce.as_mut_slice());
        Self {
            sid,
            sender: sender.clone(),
            nonce,
            coefficient_commitments,
            proof,
        }
    }

    pub(crate) fn commit(&self) -> Result<KeygenCommit> {
        let mut transcript = Transcript::new(b"KeyGenR1");
        transcript.append_message(b"decom", &serialize!(&self)?);
        let mut hash = [0u8; 32];
        transcript.challenge_bytes(b"hashing r1", &mut hash);
        Ok(KeygenCommit { hash })
    }

    /// Check the decommitment opens `com` and was produced for this session
    /// by `sender`.
    pub(crate) fn verify(
        &self,
        sid: Identifier,
        sender: &MemberId,
        com: &KeygenCommit,
    ) -> Result<()> {
        if self.sid != sid || &self.sender != sender {
            return verify_err!("decommitment bound to another session or sender");
        }
        if &self.commit()? != com {
            return verify_err!("decommitment does not open the commitment");
        }
        Ok(())
    }
}
