// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Key shares and the point-to-point encryption of polynomial shares during
//! key generation.

use crate::{
    errors::{InternalError, Result},
    protocol::{Identifier, MemberId},
    utils::CurvePoint,
};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use k256::{elliptic_curve::PrimeField, FieldBytes, Scalar};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

const NONCE_LEN: usize = 12;

/// Private key share `x_i`.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub(crate) struct KeySharePrivate {
    pub(crate) x: Scalar,
}

impl Debug for KeySharePrivate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeySharePrivate([redacted])")
    }
}

/// Public key share `X_i = x_i * g`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct KeySharePublic {
    pub(crate) X: CurvePoint,
}

impl KeySharePrivate {
    pub(crate) fn public_share(&self) -> KeySharePublic {
        KeySharePublic {
            X: CurvePoint::GENERATOR.multiply(&self.x),
        }
    }
}

/// A polynomial share encrypted under an ECDH key shared by sender and
/// recipient.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct EncryptedShare {
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

fn share_key(
    secret: &Scalar,
    peer_ephemeral_key: &CurvePoint,
    sid: Identifier,
    sender: &MemberId,
    recipient: &MemberId,
) -> Result<ChaCha20Poly1305> {
    let shared = peer_ephemeral_key.multiply(secret);
    if shared == CurvePoint(k256::ProjectivePoint::IDENTITY) {
        return Err(InternalError::PeerMisbehaved(
            recipient.to_string(),
            "degenerate ephemeral key".into(),
        ));
    }
    let mut key = Sha256::new()
        .chain_update(b"keep dkg share encryption")
        .chain_update(shared.to_compressed())
        .chain_update(sid.to_bytes())
        .chain_update(sender.as_bytes())
        .chain_update(recipient.as_bytes())
        .finalize();
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    key.zeroize();
    Ok(cipher)
}

impl EncryptedShare {
    /// Encrypt `share` from `sender` to `recipient`, using the sender's
    /// ephemeral secret and the recipient's ephemeral public key.
    pub(crate) fn encrypt<R: RngCore + CryptoRng>(
        rng: &mut R,
        share: &Scalar,
        ephemeral_secret: &Scalar,
        recipient_ephemeral_key: &CurvePoint,
        sid: Identifier,
        sender: &MemberId,
        recipient: &MemberId,
    ) -> Result<Self> {
        let cipher = share_key(ephemeral_secret, recipient_ephemeral_key, sid, sender, recipient)?;
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);
        let mut plaintext = share.to_bytes();
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_slice(),
                    aad: &sid.to_bytes(),
                },
            )
            .map_err(|_| InternalError::InternalInvariantFailed);
        plaintext.zeroize();
        Ok(Self {
            nonce,
            ciphertext: ciphertext?,
        })
    }

    /// Decrypt a share addressed to `recipient` (us).
    pub(crate) fn decrypt(
        &self,
        ephemeral_secret: &Scalar,
        sender_ephemeral_key: &CurvePoint,
        sid: Identifier,
        sender: &MemberId,
        recipient: &MemberId,
    ) -> Result<Scalar> {
        let cipher = share_key(ephemeral_secret, sender_ephemeral_key, sid, sender, recipient)?;
        let misbehaved =
            |reason: &str| InternalError::PeerMisbehaved(sender.to_string(), reason.into());
        let mut plaintext = cipher
            .decrypt(
                Nonce::from_slice(&self.nonce),
                Payload {
                    msg: &self.ciphertext,
                    aad: &sid.to_bytes(),
                },
            )
            .map_err(|_| misbehaved("undecryptable share"))?;
        if plaintext.len() != 32 {
            plaintext.zeroize();
            return Err(misbehaved("share has the wrong length"));
        }
        let share = Option::<Scalar>::from(Scalar::from_repr(*FieldBytes::from_slice(&plaintext)));
        plaintext.zeroize();
        share.ok_or_else(|| misbehaved("share is not a scalar"))
    }
}
