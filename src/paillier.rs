// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Paillier encryption over `N = p * q`, using the generator `g = N + 1`.
//!
//! Decryption keys are [`libpaillier`] keys built from safe primes.
//! Encryption is done here rather than through [`libpaillier`] because the
//! range proofs need the nonce of every ciphertext.

use crate::{
    parameters::MIN_MODULUS_BITS,
    utils::{bit_length, bn_mod, modpow, random_bn_in_z_star},
};
use libpaillier::unknown_order::BigNumber;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use thiserror::Error;

/// Paillier-specific errors.
#[derive(Clone, Eq, PartialEq, Error, Debug)]
pub enum Error {
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Plaintext is larger than the modulus")]
    PlaintextOutOfRange,
    #[error("Ciphertext is not an element of Z*_{{N^2}}")]
    InvalidCiphertext,
    #[error("Modulus is malformed or too small")]
    InvalidModulus,
    #[error("The provided primes cannot be used to build a key")]
    InvalidPrimes,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Ciphertext(pub(crate) BigNumber);

/// The randomness `r` of a ciphertext `(1 + N)^m * r^N`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Nonce(pub(crate) BigNumber);

/// A Paillier public key. Only the modulus is serialized; deserializing
/// checks it again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BigNumber", into = "BigNumber")]
pub(crate) struct EncryptionKey {
    n: BigNumber,
    nn: BigNumber,
}

impl TryFrom<BigNumber> for EncryptionKey {
    type Error = Error;

    fn try_from(n: BigNumber) -> Result<Self, Error> {
        Self::from_modulus(n)
    }
}

impl From<EncryptionKey> for BigNumber {
    fn from(key: EncryptionKey) -> Self {
        key.n
    }
}

impl EncryptionKey {
    /// Build a key from a modulus received from a peer.
    pub(crate) fn from_modulus(n: BigNumber) -> Result<Self, Error> {
        if bit_length(&n) < MIN_MODULUS_BITS || bn_mod(&n, &BigNumber::from(2u64)) == BigNumber::zero() {
            return Err(Error::InvalidModulus);
        }
        let nn = &n * &n;
        Ok(Self { n, nn })
    }

    pub(crate) fn n(&self) -> &BigNumber {
        &self.n
    }

    pub(crate) fn nn(&self) -> &BigNumber {
        &self.nn
    }

    /// Encrypt `m < N` under a fresh nonce.
    pub(crate) fn encrypt<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        m: &BigNumber,
    ) -> Result<(Ciphertext, Nonce), Error> {
        if m >= &self.n {
            return Err(Error::PlaintextOutOfRange);
        }
        let nonce = Nonce(random_bn_in_z_star(rng, &self.n));
        Ok((self.encrypt_with_nonce(m, &nonce), nonce))
    }

    /// `(1 + N)^m * r^N mod N^2`; `m` is taken modulo `N`.
    pub(crate) fn encrypt_with_nonce(&self, m: &BigNumber, nonce: &Nonce) -> Ciphertext {
        // (1 + N)^m = 1 + m * N (mod N^2)
        let a = BigNumber::one() + bn_mod(m, &self.n) * &self.n;
        let b = modpow(&nonce.0, &self.n, &self.nn);
        Ciphertext(a.modmul(&b, &self.nn))
    }

    /// Homomorphic addition of the underlying plaintexts.
    pub(crate) fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Ciphertext {
        Ciphertext(a.0.modmul(&b.0, &self.nn))
    }

    /// Homomorphic multiplication of the underlying plaintext by `k`.
    pub(crate) fn mul(&self, c: &Ciphertext, k: &BigNumber) -> Ciphertext {
        Ciphertext(modpow(&c.0, k, &self.nn))
    }

    /// The nonce response `mask * nonce^e mod N` of a proof.
    pub(crate) fn mask(&self, nonce: &Nonce, mask: &Nonce, e: &BigNumber) -> Nonce {
        Nonce(mask.0.modmul(&modpow(&nonce.0, e, &self.n), &self.n))
    }

    /// Check that a ciphertext received from a peer is a unit mod `N^2`.
    pub(crate) fn validate(&self, c: &Ciphertext) -> Result<(), Error> {
        if c.0 == BigNumber::zero() || c.0 >= self.nn || c.0.gcd(&self.n) != BigNumber::one() {
            return Err(Error::InvalidCiphertext);
        }
        Ok(())
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct PrimePair {
    p: BigNumber,
    q: BigNumber,
}

/// A Paillier secret key. Serialized as its two primes.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "PrimePair", into = "PrimePair")]
pub(crate) struct DecryptionKey {
    p: BigNumber,
    q: BigNumber,
    inner: libpaillier::DecryptionKey,
    encryption_key: EncryptionKey,
}

impl TryFrom<PrimePair> for DecryptionKey {
    type Error = Error;

    fn try_from(pair: PrimePair) -> Result<Self, Error> {
        Self::from_primes(&pair.p, &pair.q)
    }
}

impl From<DecryptionKey> for PrimePair {
    fn from(key: DecryptionKey) -> Self {
        Self { p: key.p, q: key.q }
    }
}

impl PartialEq for DecryptionKey {
    fn eq(&self, other: &Self) -> bool {
        self.p == other.p && self.q == other.q
    }
}

impl Eq for DecryptionKey {}

impl Debug for DecryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionKey")
            .field("p", &"[redacted]")
            .field("q", &"[redacted]")
            .field("encryption_key", &self.encryption_key)
            .finish()
    }
}

impl DecryptionKey {
    /// Build a key from two distinct safe primes. Both must be `3 mod 4`, as
    /// the modulus proof needs a Blum integer.
    pub(crate) fn from_primes(p: &BigNumber, q: &BigNumber) -> Result<Self, Error> {
        let four = BigNumber::from(4u64);
        let three = BigNumber::from(3u64);
        if p == q || bn_mod(p, &four) != three || bn_mod(q, &four) != three {
            return Err(Error::InvalidPrimes);
        }
        let inner =
            libpaillier::DecryptionKey::with_safe_primes_unchecked(p, q).ok_or(Error::InvalidPrimes)?;
        let encryption_key = EncryptionKey::from_modulus(p * q).map_err(|_| Error::InvalidPrimes)?;
        Ok(Self {
            p: p.clone(),
            q: q.clone(),
            inner,
            encryption_key,
        })
    }

    pub(crate) fn encryption_key(&self) -> &EncryptionKey {
        &self.encryption_key
    }

    pub(crate) fn primes(&self) -> (&BigNumber, &BigNumber) {
        (&self.p, &self.q)
    }

    /// Euler's totient `(p - 1) * (q - 1)` of the modulus.
    pub(crate) fn totient(&self) -> BigNumber {
        let one = BigNumber::one();
        (&self.p - &one) * (&self.q - &one)
    }

    pub(crate) fn decrypt(&self, c: &Ciphertext) -> Result<BigNumber, Error> {
        self.encryption_key.validate(c)?;
        let bytes = self.inner.decrypt(&c.0).ok_or(Error::DecryptionFailed)?;
        Ok(BigNumber::from_slice(bytes.as_slice()))
    }
}
