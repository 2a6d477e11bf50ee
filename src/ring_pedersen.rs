// Copyright (c) 2023 Bolt Labs, Inc.
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Ring-Pedersen commitments, as specified in Definition 1.3 of
//! <https://eprint.iacr.org/2021/060.pdf>.
//!
//! Every member derives its parameters from its own Paillier modulus during
//! key generation. Peers use them as the verifier's setup in the range
//! proofs they send that member; [`PiPrmProof`](crate::zkp::piprm::PiPrmProof)
//! shows they were built correctly.

use crate::{
    errors::Result,
    paillier::DecryptionKey,
    utils::{bn_mod, modpow, random_bn, random_bn_in_z_star, random_bn_scaled},
};
use libpaillier::unknown_order::BigNumber;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

/// A commitment scheme `s^x * t^r mod N` where `s = t^λ` for a secret `λ`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct RingPedersen {
    /// The RSA modulus, corresponding to `N^hat` in the paper.
    modulus: BigNumber,
    /// Ring-Pedersen parameter `s`.
    s: BigNumber,
    /// Ring-Pedersen parameter `t`.
    t: BigNumber,
}

impl RingPedersen {
    /// Derive parameters over the modulus of `sk`, returning the scheme and
    /// the exponent `λ` with `s = t^λ mod N`.
    pub(crate) fn extract<R: RngCore + CryptoRng>(
        sk: &DecryptionKey,
        rng: &mut R,
    ) -> Result<(Self, BigNumber)> {
        let modulus = sk.encryption_key().n().clone();
        let tau = random_bn_in_z_star(rng, &modulus);
        let lambda = random_bn(rng, &sk.totient());
        let t = modpow(&tau, &BigNumber::from(2u64), &modulus);
        let s = modpow(&t, &lambda, &modulus);
        Ok((Self { modulus, s, t }, lambda))
    }

    #[cfg(test)]
    pub(crate) fn from_parts(s: BigNumber, t: BigNumber, modulus: BigNumber) -> Self {
        Self { modulus, s, t }
    }

    pub(crate) fn modulus(&self) -> &BigNumber {
        &self.modulus
    }

    pub(crate) fn s(&self) -> &BigNumber {
        &self.s
    }

    pub(crate) fn t(&self) -> &BigNumber {
        &self.t
    }

    /// Both parameters are units and `t` is not trivial.
    pub(crate) fn is_well_formed(&self) -> bool {
        let one = BigNumber::one();
        let is_unit = |x: &BigNumber| {
            x > &BigNumber::zero() && x < &self.modulus && x.gcd(&self.modulus) == one
        };
        is_unit(&self.s) && is_unit(&self.t) && bn_mod(&self.t, &self.modulus) != one
    }

    /// Commitment randomness in `[0, 2^range * scale * N)`.
    pub(crate) fn commitment_randomness<R: RngCore + CryptoRng>(
        &self,
        range: usize,
        scale: &BigNumber,
        rng: &mut R,
    ) -> BigNumber {
        random_bn_scaled(rng, range, &(scale * &self.modulus))
    }

    /// `s^value * t^randomness mod N`.
    pub(crate) fn commit(&self, value: &BigNumber, randomness: &BigNumber) -> BigNumber {
        let a = modpow(&self.s, value, &self.modulus);
        let b = modpow(&self.t, randomness, &self.modulus);
        a.modmul(&b, &self.modulus)
    }

    /// `base * other^e mod N`, the right-hand side of every commitment check.
    pub(crate) fn combine(&self, base: &BigNumber, other: &BigNumber, e: &BigNumber) -> BigNumber {
        base.modmul(&modpow(other, e, &self.modulus), &self.modulus)
    }
}
