// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::errors::{InternalError, Result};
use k256::{
    elliptic_curve::{
        ops::Reduce,
        sec1::{FromEncodedPoint, ToEncodedPoint},
        Field, PrimeField,
    },
    AffinePoint, EncodedPoint, FieldBytes, NonZeroScalar, ProjectivePoint, Scalar, U256,
};
use lazy_static::lazy_static;
use libpaillier::unknown_order::BigNumber;
use merlin::Transcript;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::error;

lazy_static! {
    static ref K256_ORDER: BigNumber = scalar_to_bn(&-Scalar::ONE) + BigNumber::one();
}

/// Wrapper around a secp256k1 point, serialized in compressed SEC1 form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CurvePoint(pub(crate) ProjectivePoint);

impl CurvePoint {
    pub(crate) const GENERATOR: Self = CurvePoint(ProjectivePoint::GENERATOR);

    pub(crate) fn to_affine(self) -> AffinePoint {
        self.0.to_affine()
    }

    pub(crate) fn to_compressed(self) -> Vec<u8> {
        self.0.to_affine().to_encoded_point(true).as_bytes().to_vec()
    }

    /// Parse a SEC1 point, rejecting the identity.
    pub(crate) fn try_from_bytes(bytes: &[u8]) -> Result<Self> {
        let encoded = EncodedPoint::from_bytes(bytes).map_err(|_| InternalError::Serialization)?;
        let affine: Option<AffinePoint> = AffinePoint::from_encoded_point(&encoded).into();
        match affine {
            Some(point) if point != AffinePoint::IDENTITY => Ok(CurvePoint(point.into())),
            _ => {
                error!("Received an invalid or identity curve point");
                Err(InternalError::Serialization)
            }
        }
    }

    pub(crate) fn multiply(&self, scalar: &Scalar) -> Self {
        CurvePoint(self.0 * scalar)
    }
}

impl Serialize for CurvePoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_compressed().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CurvePoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        CurvePoint::try_from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// The order of the secp256k1 group.
pub(crate) fn k256_order() -> BigNumber {
    K256_ORDER.clone()
}

/// Computes a^e (mod n)
pub(crate) fn modpow(a: &BigNumber, e: &BigNumber, n: &BigNumber) -> BigNumber {
    a.modpow(e, n)
}

/// Reduces `x` into `[0, n)`.
pub(crate) fn bn_mod(x: &BigNumber, n: &BigNumber) -> BigNumber {
    x.modadd(&BigNumber::zero(), n)
}

/// Number of significant bits of a non-negative number.
pub(crate) fn bit_length(x: &BigNumber) -> usize {
    let bytes = x.to_bytes();
    match bytes.iter().position(|b| *b != 0) {
        Some(i) => (bytes.len() - i) * 8 - bytes[i].leading_zeros() as usize,
        None => 0,
    }
}

/// Generate a random BigNumber in the range `[0, n)`.
pub(crate) fn random_bn<R: RngCore + CryptoRng>(rng: &mut R, n: &BigNumber) -> BigNumber {
    let bits = bit_length(n);
    if bits == 0 {
        return BigNumber::zero();
    }
    let mut bytes = vec![0u8; (bits + 7) / 8];
    let excess = bytes.len() * 8 - bits;
    loop {
        rng.fill_bytes(&mut bytes);
        bytes[0] &= 0xff >> excess;
        let candidate = BigNumber::from_slice(&bytes);
        if &candidate < n {
            return candidate;
        }
    }
}

/// Generate a random BigNumber in the range `[0, 2^bits)`.
pub(crate) fn random_bn_in_range<R: RngCore + CryptoRng>(rng: &mut R, bits: usize) -> BigNumber {
    random_bn(rng, &(BigNumber::one() << bits))
}

/// Generate a random BigNumber in the range `[0, 2^bits * n)`.
pub(crate) fn random_bn_scaled<R: RngCore + CryptoRng>(
    rng: &mut R,
    bits: usize,
    n: &BigNumber,
) -> BigNumber {
    random_bn(rng, &((BigNumber::one() << bits) * n))
}

/// Generate a random unit of `Z_n`.
pub(crate) fn random_bn_in_z_star<R: RngCore + CryptoRng>(
    rng: &mut R,
    n: &BigNumber,
) -> BigNumber {
    loop {
        let bn = random_bn(rng, n);
        if bn != BigNumber::zero() && bn.gcd(n) == BigNumber::one() {
            return bn;
        }
    }
}

/// Sample a value in `[0, n)` from a Fiat-Shamir transcript.
pub(crate) fn bn_random_from_transcript(transcript: &mut Transcript, n: &BigNumber) -> BigNumber {
    let bits = bit_length(n);
    let mut t = vec![0u8; (bits + 7) / 8];
    let excess = t.len() * 8 - bits;
    loop {
        transcript.challenge_bytes(b"sampling randomness", t.as_mut_slice());
        if let Some(first) = t.first_mut() {
            *first &= 0xff >> excess;
        }
        let b = BigNumber::from_slice(t.as_slice());
        if &b < n {
            return b;
        }
    }
}

/// Reduce an arbitrary non-negative integer into a scalar.
pub(crate) fn bn_to_scalar(x: &BigNumber) -> Result<Scalar> {
    let reduced = bn_mod(x, &K256_ORDER).to_bytes();
    if reduced.len() > 32 {
        return Err(InternalError::CouldNotConvertToScalar);
    }
    let mut repr = FieldBytes::default();
    repr[32 - reduced.len()..].copy_from_slice(&reduced);
    Option::<Scalar>::from(Scalar::from_repr(repr)).ok_or(InternalError::CouldNotConvertToScalar)
}

pub(crate) fn scalar_to_bn(x: &Scalar) -> BigNumber {
    BigNumber::from_slice(x.to_bytes().as_slice())
}

pub(crate) fn random_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    Scalar::random(rng)
}

pub(crate) fn random_nonzero_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    *NonZeroScalar::random(rng)
}

/// Interpret a 32-byte message digest as a scalar, reducing modulo the order.
pub(crate) fn scalar_from_digest(digest: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(FieldBytes::from_slice(digest))
}

/// Draw a challenge scalar from a Fiat-Shamir transcript.
pub(crate) fn scalar_from_transcript(transcript: &mut Transcript, label: &'static [u8]) -> Scalar {
    let mut bytes = [0u8; 32];
    transcript.challenge_bytes(label, &mut bytes);
    scalar_from_digest(&bytes)
}

/// Polynomial evaluation point for the member at `index` (zero is never
/// used, it would reveal the constant term).
pub(crate) fn evaluation_point(index: usize) -> Scalar {
    Scalar::from(index as u64 + 1)
}

pub(crate) fn evaluate_polynomial(coefficients: &[Scalar], x: &Scalar) -> Scalar {
    coefficients
        .iter()
        .rev()
        .fold(Scalar::ZERO, |acc, coefficient| acc * x + coefficient)
}

/// Evaluate Feldman commitments `C_k = a_k * G` at `x`, yielding `f(x) * G`.
pub(crate) fn evaluate_commitments(commitments: &[CurvePoint], x: &Scalar) -> CurvePoint {
    CurvePoint(
        commitments
            .iter()
            .rev()
            .fold(ProjectivePoint::IDENTITY, |acc, c| acc * x + c.0),
    )
}

/// Lagrange coefficient at zero for the member at `index` within `subset`.
pub(crate) fn lagrange_coefficient(index: usize, subset: &[usize]) -> Result<Scalar> {
    if !subset.contains(&index) {
        return arg_err!("index is not part of the signing subset");
    }
    let x_i = evaluation_point(index);
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;
    for &j in subset.iter().filter(|&&j| j != index) {
        let x_j = evaluation_point(j);
        numerator *= x_j;
        denominator *= x_j - x_i;
    }
    let inverse: Option<Scalar> = denominator.invert().into();
    Ok(numerator * inverse.ok_or(InternalError::CouldNotInvertScalar)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use test_log::test;

    #[test]
    fn lagrange_interpolation_recovers_constant_term() {
        let mut rng = OsRng;
        let coefficients: Vec<Scalar> = (0..3).map(|_| random_scalar(&mut rng)).collect();
        let subset = [0usize, 2, 4];
        let recovered = subset.iter().fold(Scalar::ZERO, |acc, &i| {
            let share = evaluate_polynomial(&coefficients, &evaluation_point(i));
            acc + lagrange_coefficient(i, &subset).unwrap() * share
        });
        assert_eq!(recovered, coefficients[0]);
    }

    #[test]
    fn commitments_match_polynomial() {
        let mut rng = OsRng;
        let coefficients: Vec<Scalar> = (0..4).map(|_| random_scalar(&mut rng)).collect();
        let commitments: Vec<CurvePoint> = coefficients
            .iter()
            .map(|a| CurvePoint::GENERATOR.multiply(a))
            .collect();
        let x = evaluation_point(6);
        assert_eq!(
            evaluate_commitments(&commitments, &x),
            CurvePoint::GENERATOR.multiply(&evaluate_polynomial(&coefficients, &x))
        );
    }

    #[test]
    fn scalar_conversions_reduce_modulo_order() {
        let mut rng = OsRng;
        let s = random_scalar(&mut rng);
        assert_eq!(bn_to_scalar(&scalar_to_bn(&s)).unwrap(), s);
        let wrapped = scalar_to_bn(&s) + k256_order();
        assert_eq!(bn_to_scalar(&wrapped).unwrap(), s);
        assert_eq!(bn_to_scalar(&k256_order()).unwrap(), Scalar::ZERO);
        assert_eq!(bit_length(&k256_order()), 256);
    }

    #[test]
    fn random_numbers_stay_in_range() {
        let mut rng = OsRng;
        let bound = BigNumber::from(1000u64);
        for _ in 0..200 {
            assert!(random_bn(&mut rng, &bound) < bound);
        }
        // Long enough to be drawn from the whole range.
        let wide = (0..20)
            .map(|_| bit_length(&random_bn_in_range(&mut rng, 300)))
            .max()
            .unwrap_or_default();
        assert!(wide > 290 && wide <= 300);
        assert_eq!(bit_length(&BigNumber::zero()), 0);
        assert_eq!(bit_length(&BigNumber::from(255u64)), 8);
        assert_eq!(bit_length(&BigNumber::from(256u64)), 9);

        let n = BigNumber::from(15u64);
        for _ in 0..50 {
            let unit = random_bn_in_z_star(&mut rng, &n);
            assert_eq!(unit.gcd(&n), BigNumber::one());
        }
    }

    #[test]
    fn transcript_sampling_is_deterministic() {
        let n = k256_order();
        let mut a = Transcript::new(b"sampling");
        let mut b = Transcript::new(b"sampling");
        let x = bn_random_from_transcript(&mut a, &n);
        assert_eq!(x, bn_random_from_transcript(&mut b, &n));
        assert!(x < n);
    }

    #[test]
    fn curve_points_serialize_compressed() {
        let mut rng = OsRng;
        let point = CurvePoint::GENERATOR.multiply(&random_nonzero_scalar(&mut rng));
        let bytes = bincode::serialize(&point).unwrap();
        let decoded: CurvePoint = bincode::deserialize(&bytes).unwrap();
        assert_eq!(point, decoded);
        assert_eq!(point.to_compressed().len(), 33);

        let identity = CurvePoint(ProjectivePoint::IDENTITY).to_compressed();
        assert!(CurvePoint::try_from_bytes(&identity).is_err());
    }

    #[test]
    fn lagrange_rejects_foreign_index() {
        assert!(lagrange_coefficient(3, &[0, 1]).is_err());
    }
}
