// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Security parameter definitions.
//!
//! Range proofs use 80-bit statistical security. Sizes follow Figure 1 and
//! Table 2 of Canetti, Gennaro, Goldfeder, Makriyannis and Peled, "UC
//! Non-Interactive, Proactive, Threshold ECDSA with Identifiable Aborts"
//! ([PDF](https://eprint.iacr.org/2021/060.pdf)).

/// Security parameter κ: the bit size of a secp256k1 scalar.
const SECURITY_PARAM: usize = 256;

/// Range for secret scalars in range proofs ([Π-enc](crate::zkp::pienc),
/// [Π-aff-g](crate::zkp::piaffg)) and for the factor proof
/// ([Π-fac](crate::zkp::pifac)). Values lie in `[0, 2^ELL)`.
pub(crate) const ELL: usize = SECURITY_PARAM;

/// Range for the additive mask of share conversion, checked by
/// [Π-aff-g](crate::zkp::piaffg). A masked product `k * x + y` must stay
/// below the smallest accepted Paillier modulus.
pub(crate) const ELL_PRIME: usize = 3 * SECURITY_PARAM;

/// Slack of every range check: a secret in `[0, 2^l)` yields a response below
/// `2^(l + EPSILON + 1)`.
pub(crate) const EPSILON: usize = 2 * SECURITY_PARAM;

/// Bit size of the safe prime factors of a Paillier modulus.
pub(crate) const PRIME_BITS: usize = 1024;

/// Repetitions of proofs whose challenge is a single bit.
pub(crate) const SOUNDNESS_PARAMETER: usize = 80;

/// Smallest Paillier modulus accepted from a peer.
#[cfg(not(test))]
pub(crate) const MIN_MODULUS_BITS: usize = 2 * PRIME_BITS - 1;

/// Tests run with 512-bit primes from a fixed pool.
#[cfg(test)]
pub(crate) const MIN_MODULUS_BITS: usize = 1023;
