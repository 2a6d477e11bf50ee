// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Auxiliary information every member publishes during key generation: its
//! Paillier key and the ring-Pedersen parameters peers commit under when
//! they send it range proofs.

use crate::{
    errors::Result,
    paillier::{DecryptionKey, EncryptionKey},
    protocol::{Identifier, MemberId},
    ring_pedersen::RingPedersen,
    zkp::{
        pimod::{PiModInput, PiModProof, PiModSecret},
        piprm::{PiPrmProof, PiPrmSecret},
        Proof,
    },
};
use libpaillier::unknown_order::BigNumber;
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AuxInfoPublic {
    encryption_key: EncryptionKey,
    params: RingPedersen,
}

impl AuxInfoPublic {
    /// Derive the public information for `sk`, returning it with the
    /// ring-Pedersen exponent needed to prove it.
    pub(crate) fn new<R: RngCore + CryptoRng>(
        sk: &DecryptionKey,
        rng: &mut R,
    ) -> Result<(Self, BigNumber)> {
        let (params, lambda) = RingPedersen::extract(sk, rng)?;
        Ok((
            Self {
                encryption_key: sk.encryption_key().clone(),
                params,
            },
            lambda,
        ))
    }

    pub(crate) fn encryption_key(&self) -> &EncryptionKey {
        &self.encryption_key
    }

    pub(crate) fn params(&self) -> &RingPedersen {
        &self.params
    }

    /// The parameters live over the Paillier modulus and are units.
    pub(crate) fn verify(&self) -> Result<()> {
        if self.encryption_key.n() != self.params.modulus() {
            return verify_err!("Mismatch with pk.n() and params.N");
        }
        if !self.params.is_well_formed() {
            return verify_err!("ring-Pedersen parameters are malformed");
        }
        Ok(())
    }
}

/// Proofs that a member's [`AuxInfoPublic`] was honestly generated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct AuxInfoProof {
    pimod: PiModProof,
    piprm: PiPrmProof,
}

fn transcript(label: &'static [u8], sid: Identifier, sender: &MemberId) -> Transcript {
    let mut transcript = Transcript::new(label);
    transcript.append_message(b"sid", &sid.to_bytes());
    transcript.append_message(b"sender", sender.as_bytes());
    transcript
}

impl AuxInfoProof {
    pub(crate) fn prove<R: RngCore + CryptoRng>(
        rng: &mut R,
        sid: Identifier,
        sender: &MemberId,
        public: &AuxInfoPublic,
        sk: &DecryptionKey,
        lambda: &BigNumber,
    ) -> Result<Self> {
        let pimod = PiModProof::prove(
            &PiModInput::new(public.encryption_key.n()),
            &PiModSecret::new(sk),
            &mut transcript(b"PaillierBlumModulusProof", sid, sender),
            rng,
        )?;
        let piprm = PiPrmProof::prove(
            &public.params,
            &PiPrmSecret::new(lambda.clone(), sk.totient()),
            &mut transcript(b"PiPrmProof", sid, sender),
            rng,
        )?;
        Ok(Self { pimod, piprm })
    }

    pub(crate) fn verify(
        &self,
        sid: Identifier,
        sender: &MemberId,
        public: &AuxInfoPublic,
    ) -> Result<()> {
        public.verify()?;
        self.pimod.verify(
            &PiModInput::new(public.encryption_key.n()),
            &mut transcript(b"PaillierBlumModulusProof", sid, sender),
        )?;
        self.piprm.verify(
            &public.params,
            &mut transcript(b"PiPrmProof", sid, sender),
        )
    }
}
