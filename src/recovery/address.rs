// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Beneficiary addresses: either a plain Bitcoin address, or the next unused
//! address of a BIP32 extended public key.

use crate::{
    errors::{InternalError, Result},
    recovery::{electrs::BitcoinConnection, index_store::DerivationIndexStore},
};
use bitcoin::{
    base58,
    bip32::{ChildNumber, Xpub},
    secp256k1::Secp256k1,
    Address, CompressedPublicKey, Network, NetworkKind,
};
use std::str::FromStr;
use tracing::{debug, info, instrument};

/// Depth of the external chain below an account key (`m/purpose'/coin'/account'/0`).
const EXTERNAL_CHAIN_DEPTH: u8 = 4;

const XPUB: [u8; 4] = [0x04, 0x88, 0xb2, 0x1e];
const TPUB: [u8; 4] = [0x04, 0x35, 0x87, 0xcf];

/// How addresses derived from an extended key are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    /// xpub, tpub
    P2pkh,
    /// ypub, upub
    P2shP2wpkh,
    /// zpub, vpub
    P2wpkh,
}

/// Version bytes of every extended key format: encoding, network, private.
const VERSIONS: [([u8; 4], Encoding, NetworkKind, bool); 12] = [
    (XPUB, Encoding::P2pkh, NetworkKind::Main, false),
    ([0x04, 0x88, 0xad, 0xe4], Encoding::P2pkh, NetworkKind::Main, true),
    ([0x04, 0x9d, 0x7c, 0xb2], Encoding::P2shP2wpkh, NetworkKind::Main, false),
    ([0x04, 0x9d, 0x78, 0x78], Encoding::P2shP2wpkh, NetworkKind::Main, true),
    ([0x04, 0xb2, 0x47, 0x46], Encoding::P2wpkh, NetworkKind::Main, false),
    ([0x04, 0xb2, 0x43, 0x0c], Encoding::P2wpkh, NetworkKind::Main, true),
    (TPUB, Encoding::P2pkh, NetworkKind::Test, false),
    ([0x04, 0x35, 0x83, 0x94], Encoding::P2pkh, NetworkKind::Test, true),
    ([0x04, 0x4a, 0x52, 0x62], Encoding::P2shP2wpkh, NetworkKind::Test, false),
    ([0x04, 0x4a, 0x4e, 0x28], Encoding::P2shP2wpkh, NetworkKind::Test, true),
    ([0x04, 0x5f, 0x1c, 0xf6], Encoding::P2wpkh, NetworkKind::Test, false),
    ([0x04, 0x5f, 0x18, 0xbc], Encoding::P2wpkh, NetworkKind::Test, true),
];

fn invalid(reason: impl Into<String>) -> InternalError {
    InternalError::Configuration(reason.into())
}

/// An extended public key positioned on its external chain.
#[derive(Debug, Clone)]
pub struct ExtendedPublicKey {
    chain: Xpub,
    encoding: Encoding,
    network: Network,
}

impl ExtendedPublicKey {
    /// Parse `encoded` for use on `network`.
    ///
    /// Private keys, keys of the other network kind and keys deeper than the
    /// external chain are refused.
    pub fn parse(encoded: &str, network: Network) -> Result<Self> {
        let mut data = base58::decode_check(encoded)
            .map_err(|_| invalid("beneficiary is neither an address nor an extended key"))?;
        let version: [u8; 4] = data
            .get(..4)
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| invalid("extended key is too short"))?;
        let &(_, encoding, kind, private) = VERSIONS
            .iter()
            .find(|(bytes, ..)| *bytes == version)
            .ok_or_else(|| invalid("unknown extended key version"))?;
        if private {
            return Err(invalid("extended private keys are not accepted"));
        }
        if kind != NetworkKind::from(network) {
            return Err(invalid(format!(
                "extended key does not belong to network {network}"
            )));
        }

        // The library decodes xpub and tpub only; rewrite the version.
        let canonical = if kind == NetworkKind::Main { XPUB } else { TPUB };
        data[..4].copy_from_slice(&canonical);
        let mut key =
            Xpub::decode(&data).map_err(|e| invalid(format!("malformed extended key: {e}")))?;

        if key.depth > EXTERNAL_CHAIN_DEPTH {
            return Err(invalid(format!(
                "extended key depth {} exceeds {EXTERNAL_CHAIN_DEPTH}",
                key.depth
            )));
        }
        let secp = Secp256k1::verification_only();
        while key.depth < EXTERNAL_CHAIN_DEPTH {
            key = key
                .ckd_pub(&secp, ChildNumber::Normal { index: 0 })
                .map_err(|e| invalid(e.to_string()))?;
        }
        Ok(Self {
            chain: key,
            encoding,
            network,
        })
    }

    /// The address at `index` of the external chain.
    pub fn address(&self, index: u32) -> Result<Address> {
        let child = ChildNumber::from_normal_idx(index)
            .map_err(|_| invalid(format!("index {index} would need hardened derivation")))?;
        let derived = self
            .chain
            .ckd_pub(&Secp256k1::verification_only(), child)
            .map_err(|e| invalid(e.to_string()))?;
        let key = CompressedPublicKey(derived.public_key);
        Ok(match self.encoding {
            Encoding::P2pkh => Address::p2pkh(key.pubkey_hash(), self.network),
            Encoding::P2shP2wpkh => Address::p2shwpkh(&key, self.network),
            Encoding::P2wpkh => Address::p2wpkh(&key, self.network),
        })
    }
}

/// Resolve the configured beneficiary to an address on `network`.
///
/// An extended key yields its first unused address at or after the one
/// following the last recorded index; the chosen index is recorded.
#[instrument(skip_all, err(Debug))]
pub async fn resolve_beneficiary(
    beneficiary: &str,
    network: Network,
    store: &DerivationIndexStore,
    bitcoin: &dyn BitcoinConnection,
) -> Result<Address> {
    if let Ok(address) = Address::from_str(beneficiary) {
        if let Ok(address) = address.require_network(network) {
            return Ok(address);
        }
    }

    let key = ExtendedPublicKey::parse(beneficiary, network)?;
    let mut index = match store.read(beneficiary)? {
        Some(last) => last
            .checked_add(1)
            .ok_or_else(|| invalid("derivation indexes are exhausted"))?,
        None => 0,
    };
    loop {
        let address = key.address(index)?;
        if bitcoin.is_address_unused(&address).await? {
            store.save(beneficiary, index)?;
            info!("Using beneficiary address {address} at index {index}");
            return Ok(address);
        }
        debug!("Address {address} at index {index} was used before");
        index += 1;
    }
}
