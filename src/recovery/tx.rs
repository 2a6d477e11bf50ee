// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The liquidation recovery transaction: one p2wpkh input spending the
//! deposit, one equal output per member.
//!
//! Every member builds the transaction independently; all inputs to the
//! construction are agreed on beforehand, so the results are identical.

use crate::{
    chain::DepositUtxo,
    errors::{InternalError, Result},
    signer::Signature,
};
use bitcoin::{
    absolute::LockTime, hashes::Hash, sighash::SighashCache, transaction::Version, Address, Amount,
    CompressedPublicKey, EcdsaSighashType, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use k256::{elliptic_curve::sec1::ToEncodedPoint, PublicKey};

/// Outputs below this value are not relayed.
const DUST_LIMIT: u64 = 546;

/// Length of a DER signature with its sighash byte, at most.
const PLACEHOLDER_SIGNATURE_LENGTH: usize = 74;

/// Length of a compressed public key.
const PLACEHOLDER_KEY_LENGTH: usize = 33;

/// The group key in the form Bitcoin scripts use.
pub fn compressed_key(group_key: &PublicKey) -> Result<CompressedPublicKey> {
    CompressedPublicKey::from_slice(group_key.to_encoded_point(true).as_bytes())
        .map_err(|e| InternalError::Bitcoin(format!("unusable group key: {e}")))
}

fn unsigned(utxo: &DepositUtxo, beneficiaries: &[Address], value: u64) -> Transaction {
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: utxo.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ZERO,
            witness: Witness::default(),
        }],
        output: beneficiaries
            .iter()
            .map(|address| TxOut {
                value: Amount::from_sat(value),
                script_pubkey: address.script_pubkey(),
            })
            .collect(),
    }
}

/// Virtual size of `transaction` once its single input carries a p2wpkh
/// witness.
pub fn signed_vsize(transaction: &Transaction) -> usize {
    let mut sized = transaction.clone();
    let mut witness = Witness::new();
    witness.push([0u8; PLACEHOLDER_SIGNATURE_LENGTH]);
    witness.push([0u8; PLACEHOLDER_KEY_LENGTH]);
    for input in &mut sized.input {
        input.witness = witness.clone();
    }
    sized.vsize()
}

/// Build the unsigned transaction splitting `utxo` evenly between
/// `beneficiaries`, in the given order, after a fee of `fee_per_vbyte`.
///
/// The division remainder goes to the fee.
pub fn build_transaction(
    utxo: &DepositUtxo,
    beneficiaries: &[Address],
    fee_per_vbyte: u64,
) -> Result<Transaction> {
    if beneficiaries.is_empty() {
        return Err(InternalError::Bitcoin("no beneficiaries".into()));
    }
    let vsize = signed_vsize(&unsigned(utxo, beneficiaries, 0)) as u64;
    let fee = fee_per_vbyte
        .checked_mul(vsize)
        .ok_or_else(|| InternalError::Bitcoin("fee overflows".into()))?;
    let remaining = utxo.value.checked_sub(fee).ok_or_else(|| {
        InternalError::Bitcoin(format!(
            "fee of {fee} sat exceeds the deposit of {} sat",
            utxo.value
        ))
    })?;
    let value = remaining / beneficiaries.len() as u64;
    if value < DUST_LIMIT {
        return Err(InternalError::Bitcoin(format!(
            "output of {value} sat is below the dust limit"
        )));
    }
    Ok(unsigned(utxo, beneficiaries, value))
}

/// BIP143 digest the group signs to spend the deposit.
pub fn signature_hash(
    transaction: &Transaction,
    utxo: &DepositUtxo,
    group_key: &CompressedPublicKey,
) -> Result<[u8; 32]> {
    let script_pubkey = ScriptBuf::new_p2wpkh(&group_key.wpubkey_hash());
    let sighash = SighashCache::new(transaction)
        .p2wpkh_signature_hash(
            0,
            &script_pubkey,
            Amount::from_sat(utxo.value),
            EcdsaSighashType::All,
        )
        .map_err(|e| InternalError::Bitcoin(e.to_string()))?;
    Ok(sighash.to_byte_array())
}

/// Attach the group signature to the deposit input.
pub fn add_witness(
    transaction: &mut Transaction,
    signature: &Signature,
    group_key: &CompressedPublicKey,
) -> Result<()> {
    let mut encoded = signature.to_ecdsa()?.to_der().as_bytes().to_vec();
    encoded.push(EcdsaSighashType::All.to_u32() as u8);
    let mut witness = Witness::new();
    witness.push(encoded);
    witness.push(group_key.to_bytes());
    let input = transaction
        .input
        .first_mut()
        .ok_or_else(|| InternalError::Bitcoin("transaction has no input".into()))?;
    input.witness = witness;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{Network, OutPoint, Txid};
    use k256::ecdsa::{signature::hazmat::PrehashVerifier, SigningKey, VerifyingKey};
    use rand::rngs::OsRng;
    use test_log::test;

    fn deposit(value: u64) -> DepositUtxo {
        DepositUtxo {
            outpoint: OutPoint::new(Txid::from_byte_array([7; 32]), 1),
            value,
        }
    }

    fn beneficiaries(count: usize) -> Vec<Address> {
        (0..count)
            .map(|_| {
                let key = SigningKey::random(&mut OsRng);
                let key = compressed_key(&PublicKey::from(key.verifying_key())).unwrap();
                Address::p2wpkh(&key, Network::Bitcoin)
            })
            .collect()
    }

    #[test]
    fn deposit_is_split_evenly() -> Result<()> {
        let addresses = beneficiaries(3);
        let tx = build_transaction(&deposit(100_000_000), &addresses, 10)?;

        // 144 base bytes, 2 marker bytes and a 110 byte witness.
        assert_eq!(signed_vsize(&tx), 172);
        assert_eq!(tx.version, Version::ONE);
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].sequence, Sequence::ZERO);
        assert_eq!(tx.output.len(), 3);
        for (output, address) in tx.output.iter().zip(&addresses) {
            assert_eq!(output.value, Amount::from_sat((100_000_000 - 1720) / 3));
            assert_eq!(output.script_pubkey, address.script_pubkey());
        }
        Ok(())
    }

    #[test]
    fn remainder_goes_to_the_fee() -> Result<()> {
        let tx = build_transaction(&deposit(100_000), &beneficiaries(3), 1)?;
        let paid: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
        let fee = 100_000 - paid;
        assert!(fee >= 172 && fee < 172 + 3);
        Ok(())
    }

    #[test]
    fn unaffordable_fees_are_rejected() {
        assert!(build_transaction(&deposit(1_000), &beneficiaries(3), 10).is_err());
        assert!(build_transaction(&deposit(1_500), &beneficiaries(3), 1).is_err());
        assert!(build_transaction(&deposit(2_000), &[], 1).is_err());
    }

    #[test]
    fn witness_carries_a_valid_signature() -> Result<()> {
        let signing_key = SigningKey::random(&mut OsRng);
        let group_key = PublicKey::from(signing_key.verifying_key());
        let compressed = compressed_key(&group_key)?;
        let utxo = deposit(50_000);
        let mut tx = build_transaction(&utxo, &beneficiaries(2), 5)?;
        let sighash = signature_hash(&tx, &utxo, &compressed)?;

        let (signature, recovery_id) = signing_key.sign_prehash_recoverable(&sighash).unwrap();
        let signature = Signature::from_parts(&signature, recovery_id);
        add_witness(&mut tx, &signature, &compressed)?;

        let witness: Vec<&[u8]> = tx.input[0].witness.iter().collect();
        assert_eq!(witness.len(), 2);
        assert_eq!(*witness[0].last().unwrap(), 0x01);
        assert_eq!(witness[1], &compressed.to_bytes()[..]);
        let der = k256::ecdsa::Signature::from_der(&witness[0][..witness[0].len() - 1]).unwrap();
        assert!(VerifyingKey::from(&group_key)
            .verify_prehash(&sighash, &der)
            .is_ok());
        assert!(tx.vsize() <= signed_vsize(&tx));
        Ok(())
    }
}
