// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Distributed key generation.
//!
//! Three rounds: a commitment to the member's Feldman commitments together
//! with its proven Paillier key and ring-Pedersen parameters, the
//! decommitment together with encrypted polynomial shares, and finally the
//! resulting public share with a proof of knowledge.

mod commit;
mod participant;
mod share;

pub(crate) use participant::{KeygenOutput, KeygenParticipant};
pub(crate) use share::{KeySharePrivate, KeySharePublic};

#[cfg(test)]
pub(crate) use participant::tests::{
    forge_round_three, members as test_members, paillier_key as test_paillier_key, run_keygen,
};
