// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! A keep network client for threshold ECDSA.
//!
//! An operator running this client joins the keeps a host chain opens for it.
//! Together with the other members of a keep it generates a secp256k1 key
//! whose private part never exists in one place, publishes the public key on
//! the chain, and produces signatures whenever the keep is asked for one.
//! Any `honest_threshold` members can sign; fewer learn nothing about the
//! key.
//!
//! The threshold protocol follows Gennaro and Goldfeder: key generation
//! distributes Feldman-verified shares of a random polynomial, and signing
//! converts multiplicative shares to additive ones with Paillier encryption.
//! Each member proves its Paillier modulus and commitment parameters well
//! formed during key generation, and every encrypted value exchanged while
//! signing carries a range proof. Paillier keys are built from safe primes
//! generated ahead of time in [`pre_params`], as their search takes minutes.
//!
//! Everything outside the process sits behind a trait: the host chain
//! ([`chain::ChainHandle`]), the peer-to-peer transport ([`net::Provider`])
//! and, for tBTC liquidation recovery, the Bitcoin network
//! ([`recovery::electrs::BitcoinConnection`]). [`client::Client`] wires
//! them together.

#![allow(non_snake_case)]
#![warn(missing_docs)]

#[macro_use]
pub mod errors;

mod auxinfo;
pub mod chain;
pub mod client;
pub mod config;
pub mod dedup;
mod keygen;
mod local_storage;
mod message_queue;
mod messages;
pub mod net;
pub mod node;
mod paillier;
mod parameters;
mod participant;
pub mod persistence;
pub mod pre_params;
pub mod protocol;
pub mod recovery;
pub mod registration;
pub mod registry;
mod ring_pedersen;
#[cfg(test)]
mod safe_primes_512;
mod sign;
pub mod signer;
pub mod tss;
mod utils;
mod zkp;

pub use client::{Client, Collaborators};
pub use config::Config;
pub use errors::{InternalError, Result};
pub use messages::Message;
pub use protocol::{Identifier, KeepId, MemberId};
pub use signer::{Signature, ThresholdSigner};
