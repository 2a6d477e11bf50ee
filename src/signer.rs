// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The [`ThresholdSigner`] produced by key generation, and the recoverable
//! [`Signature`] produced by signing.

use crate::{
    auxinfo::AuxInfoPublic,
    errors::{InternalError, Result},
    keygen::{KeySharePrivate, KeySharePublic, KeygenOutput},
    paillier::DecryptionKey,
    protocol::{KeepId, MemberId},
    utils::CurvePoint,
};
use k256::{
    ecdsa::{RecoveryId, Signature as EcdsaSignature, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
    PublicKey,
};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Offset Ethereum adds to recovery ids in the `v` signature field.
const ETHEREUM_V_OFFSET: u8 = 27;

/// A member's immutable share of a keep key.
///
/// Holds the group public key, this member's key share and index, the ordered
/// group membership, and the Paillier keys and ring-Pedersen parameters the
/// signing protocol needs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdSigner {
    keep_id: KeepId,
    member_id: MemberId,
    member_index: usize,
    group_member_ids: Vec<MemberId>,
    threshold: usize,
    group_public_key: CurvePoint,
    key_share: KeySharePrivate,
    public_shares: Vec<KeySharePublic>,
    aux_infos: Vec<AuxInfoPublic>,
    paillier_decryption_key: DecryptionKey,
}

impl Debug for ThresholdSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThresholdSigner")
            .field("keep_id", &self.keep_id)
            .field("member_index", &self.member_index)
            .field("group_member_ids", &self.group_member_ids)
            .field("threshold", &self.threshold)
            .field("group_public_key", &hex::encode(self.public_key_bytes()))
            .field("key_share", &"[redacted]")
            .finish()
    }
}

impl ThresholdSigner {
    pub(crate) fn from_keygen(
        keep_id: KeepId,
        member_id: MemberId,
        group_member_ids: Vec<MemberId>,
        threshold: usize,
        output: KeygenOutput,
    ) -> Result<Self> {
        let member_index = group_member_ids
            .iter()
            .position(|m| m == &member_id)
            .ok_or(InternalError::InternalInvariantFailed)?;
        let signer = Self {
            keep_id,
            member_id,
            member_index,
            group_member_ids,
            threshold,
            group_public_key: output.group_public_key,
            key_share: output.private_share,
            public_shares: output.public_shares,
            aux_infos: output.aux_infos,
            paillier_decryption_key: output.paillier_decryption_key,
        };
        signer.check_consistency()?;
        Ok(signer)
    }

    fn check_consistency(&self) -> Result<()> {
        let members = self.group_member_ids.len();
        if self.member_index >= members
            || self.group_member_ids[self.member_index] != self.member_id
            || self.public_shares.len() != members
            || self.aux_infos.len() != members
            || self.threshold >= members
        {
            return Err(InternalError::Serialization);
        }
        if self.key_share.public_share() != self.public_shares[self.member_index] {
            return Err(InternalError::Serialization);
        }
        if self.aux_infos[self.member_index].encryption_key()
            != self.paillier_decryption_key.encryption_key()
        {
            return Err(InternalError::Serialization);
        }
        for aux_info in &self.aux_infos {
            aux_info.verify()?;
        }
        Ok(())
    }

    /// The keep this signer belongs to.
    pub fn keep_id(&self) -> &KeepId {
        &self.keep_id
    }

    /// This operator's member id.
    pub fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    /// This operator's position within the ordered group.
    pub fn member_index(&self) -> usize {
        self.member_index
    }

    /// The ordered group membership.
    pub fn group_member_ids(&self) -> &[MemberId] {
        &self.group_member_ids
    }

    /// The degree of the sharing polynomial; `threshold() + 1` members are
    /// needed to sign.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// The shared ECDSA public key.
    pub fn group_public_key(&self) -> Result<PublicKey> {
        PublicKey::from_affine(self.group_public_key.to_affine())
            .map_err(|_| InternalError::InternalInvariantFailed)
    }

    /// The group key as published on chain: `X || Y`, big-endian, without the
    /// SEC1 prefix byte.
    pub fn public_key_bytes(&self) -> [u8; 64] {
        let encoded = self.group_public_key.to_affine().to_encoded_point(false);
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(&encoded.as_bytes()[1..]);
        bytes
    }

    pub(crate) fn group_public_point(&self) -> CurvePoint {
        self.group_public_key
    }

    pub(crate) fn key_share(&self) -> &KeySharePrivate {
        &self.key_share
    }

    pub(crate) fn public_shares(&self) -> &[KeySharePublic] {
        &self.public_shares
    }

    pub(crate) fn aux_infos(&self) -> &[AuxInfoPublic] {
        &self.aux_infos
    }

    pub(crate) fn paillier_decryption_key(&self) -> &DecryptionKey {
        &self.paillier_decryption_key
    }

    /// Serialize the signer. The encoding is deterministic, so marshalling the
    /// same signer twice yields identical bytes.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        serialize!(self)
    }

    /// Restore a signer produced by [`ThresholdSigner::marshal`].
    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let signer: Self = deserialize!(bytes)?;
        signer.check_consistency()?;
        Ok(signer)
    }
}

/// A recoverable ECDSA signature with a low `s` and `recovery_id` in
/// `{0, 1}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Big-endian `r`.
    pub r: [u8; 32],
    /// Big-endian `s`.
    pub s: [u8; 32],
    /// Parity of the nonce point's `y` coordinate.
    pub recovery_id: u8,
}

impl Signature {
    pub(crate) fn from_parts(signature: &EcdsaSignature, recovery_id: RecoveryId) -> Self {
        let (r, s) = signature.split_bytes();
        Self {
            r: r.into(),
            s: s.into(),
            recovery_id: recovery_id.to_byte(),
        }
    }

    /// Build a signature from an Ethereum-style `v` of 27 or 28.
    pub fn from_ethereum_v(r: [u8; 32], s: [u8; 32], v: u8) -> Result<Self> {
        match v.checked_sub(ETHEREUM_V_OFFSET) {
            Some(recovery_id @ (0 | 1)) => Ok(Self { r, s, recovery_id }),
            _ => arg_err!(format!("unexpected recovery value {v}")),
        }
    }

    /// Wire encoding `r || s || v`.
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut bytes = [0u8; 65];
        bytes[..32].copy_from_slice(&self.r);
        bytes[32..64].copy_from_slice(&self.s);
        bytes[64] = self.recovery_id;
        bytes
    }

    /// Parse the `r || s || v` wire encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 65 {
            return arg_err!("signature must be 65 bytes");
        }
        if bytes[64] > 1 {
            return arg_err!("recovery id must be 0 or 1");
        }
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..64]);
        Ok(Self {
            r,
            s,
            recovery_id: bytes[64],
        })
    }

    /// The signature without its recovery id.
    pub fn to_ecdsa(&self) -> Result<EcdsaSignature> {
        EcdsaSignature::from_scalars(self.r, self.s)
            .map_err(|_| InternalError::SignatureInstantiationError)
    }

    /// Recover the public key that produced this signature over `digest`.
    pub fn recover_public_key(&self, digest: &[u8; 32]) -> Result<PublicKey> {
        let recovery_id = RecoveryId::from_byte(self.recovery_id)
            .ok_or(InternalError::SignatureInstantiationError)?;
        let key = VerifyingKey::recover_from_prehash(digest, &self.to_ecdsa()?, recovery_id)
            .map_err(|_| InternalError::SignatureInstantiationError)?;
        Ok(PublicKey::from(&key))
    }
}
