// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Threshold signing over a subset of a keep's members.
//!
//! Round one commits to the nonce point share `Gamma_i` and sends `Enc(k_i)`
//! with a range proof; round two converts the products `k_j * gamma_i` and
//! `k_j * w_i` into additive shares, proving each response against `Gamma_i`
//! and `W_i = lambda_i * X_i`; round three reveals `delta_i` and opens
//! `Gamma_i`; round four exchanges the signature shares
//! `s_i = m * k_i + r * sigma_i`.

mod participant;
mod record;

pub(crate) use participant::SignParticipant;

#[cfg(test)]
pub(crate) use participant::tests::run_signing;
