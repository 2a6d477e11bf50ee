// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Identities shared by every protocol run: operator [`MemberId`]s, keep
//! identifiers and per-session [`Identifier`]s.

use crate::errors::{InternalError, Result};
use k256::{elliptic_curve::sec1::ToEncodedPoint, PublicKey};
use merlin::Transcript;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};

/// Length of an uncompressed SEC1 public key.
pub const MEMBER_ID_LEN: usize = 65;

/// An operator's identity: its uncompressed SEC1 public key.
///
/// Ordering is lexicographic over the encoded bytes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>")]
pub struct MemberId(Vec<u8>);

impl MemberId {
    /// Parse a member id, checking it encodes a valid secp256k1 point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != MEMBER_ID_LEN || bytes[0] != 0x04 {
            return arg_err!("member id must be an uncompressed SEC1 public key");
        }
        PublicKey::from_sec1_bytes(bytes).map_err(|_| InternalError::Serialization)?;
        Ok(Self(bytes.to_vec()))
    }

    /// Member id of an operator public key.
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(public_key.to_encoded_point(false).as_bytes().to_vec())
    }

    /// The operator public key behind this id.
    pub fn public_key(&self) -> Result<PublicKey> {
        PublicKey::from_sec1_bytes(&self.0).map_err(|_| InternalError::Serialization)
    }

    /// Raw SEC1 bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<Vec<u8>> for MemberId {
    type Error = InternalError;

    fn try_from(bytes: Vec<u8>) -> Result<Self> {
        Self::from_bytes(&bytes)
    }
}

impl Display for MemberId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        // The X coordinate prefix is enough to tell members apart in logs.
        match self.0.get(1..9) {
            Some(prefix) => write!(f, "{}", hex::encode(prefix)),
            None => write!(f, "{}", hex::encode(&self.0)),
        }
    }
}

impl Debug for MemberId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "MemberId({self})")
    }
}

/// Identifier of a keep on the host chain. Usually the keep contract
/// address.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Debug)]
pub struct KeepId(String);

impl KeepId {
    /// Create a new keep id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as it appears on chain.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for KeepId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for KeepId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The operation a protocol session runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionKind {
    /// Distributed key generation.
    KeyGeneration,
    /// Signing of a single digest.
    Signing([u8; 32]),
    /// Liquidation recovery of a terminated keep.
    LiquidationRecovery,
}

/// A session identifier that every member derives independently from the
/// same inputs, so peers agree on it without extra communication.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier(u128);

impl Identifier {
    /// Derive the identifier of attempt `attempt` of `kind` on `keep_id`.
    pub fn derive(keep_id: &KeepId, kind: &SessionKind, attempt: u32) -> Self {
        let mut transcript = Transcript::new(b"keep session identifier");
        transcript.append_message(b"keep", keep_id.as_str().as_bytes());
        match kind {
            SessionKind::KeyGeneration => transcript.append_message(b"kind", b"dkg"),
            SessionKind::Signing(digest) => {
                transcript.append_message(b"kind", b"sign");
                transcript.append_message(b"digest", digest);
            }
            SessionKind::LiquidationRecovery => transcript.append_message(b"kind", b"recovery"),
        }
        transcript.append_u64(b"attempt", attempt as u64);
        let mut bytes = [0u8; 16];
        transcript.challenge_bytes(b"identifier", &mut bytes);
        Self(u128::from_be_bytes(bytes))
    }

    pub(crate) fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl Debug for Identifier {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Identifier({self})")
    }
}
