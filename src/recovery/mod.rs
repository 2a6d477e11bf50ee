// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Liquidation recovery for terminated tBTC keeps.
//!
//! All members of the keep announce a beneficiary address and the highest
//! fee they accept, then sign one transaction spending the deposit to every
//! beneficiary in equal parts, at the lowest announced fee. Every member
//! assembles and broadcasts the same signed transaction.

pub mod address;
pub mod electrs;
pub mod index_store;
pub mod tx;

use crate::{
    chain::DepositUtxo,
    config::{LiquidationRecoveryConfig, TssConfig},
    errors::{InternalError, Result},
    net::{announce_presence, BroadcastChannel, ChannelReceiver, NetMessage, SessionTag},
    node::backoff,
    protocol::{MemberId, SessionKind},
    signer::ThresholdSigner,
    tss,
};
use bitcoin::{consensus::encode::serialize_hex, Address, Network, Transaction};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, str::FromStr, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use self::{electrs::BitcoinConnection, index_store::DerivationIndexStore};

/// Confirmation target of the fee estimate, in blocks.
const FEE_ESTIMATE_BLOCKS: u32 = 6;

/// Broadcast tries before the transaction is left to the operator.
const BROADCAST_ATTEMPTS: u32 = 5;

/// One member's terms for the recovery transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAnnouncement {
    /// The announcing member
    pub member_id: MemberId,
    /// Where this member's share goes
    pub beneficiary_address: String,
    /// Highest fee this member accepts (satoshi per vbyte)
    pub max_fee_per_vbyte: u64,
}

/// The lowest fee among `announcements`; the group pays no more than any
/// member accepts.
pub fn agreed_fee(announcements: &[RecoveryAnnouncement]) -> Result<u64> {
    announcements
        .iter()
        .map(|a| a.max_fee_per_vbyte)
        .min()
        .ok_or_else(|| InternalError::InvalidArgument("no announcements".into()))
}

/// Runs liquidation recovery for this operator.
pub struct LiquidationRecovery {
    config: LiquidationRecoveryConfig,
    network: Network,
    index_store: DerivationIndexStore,
    bitcoin: Arc<dyn BitcoinConnection>,
    tss: TssConfig,
    signing_timeout: Duration,
}

impl std::fmt::Debug for LiquidationRecovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiquidationRecovery")
            .field("network", &self.network)
            .field("electrs_url", &self.config.electrs_url)
            .finish_non_exhaustive()
    }
}

impl LiquidationRecovery {
    /// Recovery as configured, recording derivation indexes below
    /// `data_dir`. Each signing attempt is bounded by `signing_timeout`.
    pub fn new(
        config: LiquidationRecoveryConfig,
        data_dir: &Path,
        bitcoin: Arc<dyn BitcoinConnection>,
        tss: TssConfig,
        signing_timeout: Duration,
    ) -> Result<Self> {
        let network = config.network()?;
        Ok(Self {
            config,
            network,
            index_store: DerivationIndexStore::new(data_dir),
            bitcoin,
            tss,
            signing_timeout,
        })
    }

    /// Overall recovery deadline.
    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    /// The fee this operator announces: the configured maximum, lowered to
    /// the relay's estimate when one is available.
    pub async fn advertised_fee(&self) -> u64 {
        let max = u64::from(self.config.max_fee_per_vbyte);
        match self.bitcoin.fee_estimate(FEE_ESTIMATE_BLOCKS).await {
            Ok(Some(estimate)) if estimate.is_finite() && estimate > 0.0 => {
                max.min(estimate.ceil() as u64)
            }
            Ok(_) => max,
            Err(e) => {
                warn!("No fee estimate available: {e}");
                max
            }
        }
    }

    /// Recover `utxo` together with the other members of the keep of
    /// `signer`, retrying failed attempts until the recovery deadline.
    ///
    /// Returns the signed transaction, whether or not the relay took it.
    #[instrument(skip_all, fields(keep_id = %signer.keep_id()), err(Debug))]
    pub async fn run(
        &self,
        signer: &ThresholdSigner,
        utxo: DepositUtxo,
        channel: &BroadcastChannel,
    ) -> Result<Transaction> {
        let deadline = Instant::now() + self.timeout();
        let beneficiary = address::resolve_beneficiary(
            &self.config.beneficiary_address,
            self.network,
            &self.index_store,
            self.bitcoin.as_ref(),
        )
        .await?;
        let own = RecoveryAnnouncement {
            member_id: signer.member_id().clone(),
            beneficiary_address: beneficiary.to_string(),
            max_fee_per_vbyte: self.advertised_fee().await,
        };

        let mut attempt = 0;
        let transaction = loop {
            match self
                .attempt(signer, &utxo, channel, &own, attempt, deadline)
                .await
            {
                Ok(transaction) => break transaction,
                Err(e) if e.is_retryable() => {
                    warn!("Recovery attempt {attempt} failed: {e}");
                    let wake = Instant::now()
                        + backoff(attempt, self.tss.retry_backoff(), self.tss.max_backoff());
                    if wake >= deadline {
                        return Err(InternalError::Timeout("liquidation recovery".into()));
                    }
                    tokio::time::sleep_until(wake).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        self.broadcast(&transaction).await;
        Ok(transaction)
    }

    async fn attempt(
        &self,
        signer: &ThresholdSigner,
        utxo: &DepositUtxo,
        channel: &BroadcastChannel,
        own: &RecoveryAnnouncement,
        attempt: u32,
        deadline: Instant,
    ) -> Result<Transaction> {
        let keep_id = signer.keep_id();
        let members = signer.group_member_ids();
        let remaining = deadline.saturating_duration_since(Instant::now());

        let mut receiver = channel.receiver().await?;
        let tag = SessionTag::new(SessionKind::LiquidationRecovery, attempt);
        let present = announce_presence(
            channel,
            &mut receiver,
            keep_id,
            tag,
            members,
            self.tss.ready_timeout().min(remaining),
        )
        .await?;
        if present.len() < members.len() {
            return Err(InternalError::InsufficientMembers {
                present: present.len(),
                required: members.len(),
            });
        }

        channel.send(&NetMessage::Recovery(own.clone())).await?;
        let announcements = self
            .collect_announcements(members, own, &mut receiver)
            .await?;
        let fee_per_vbyte = agreed_fee(&announcements)?;
        let beneficiaries = announcements
            .iter()
            .map(|a| self.parse_address(a))
            .collect::<Result<Vec<_>>>()?;
        info!("Recovering to {} beneficiaries at {fee_per_vbyte} sat/vbyte", beneficiaries.len());

        let group_key = tx::compressed_key(&signer.group_public_key()?)?;
        let mut transaction = tx::build_transaction(utxo, &beneficiaries, fee_per_vbyte)?;
        let sighash = tx::signature_hash(&transaction, utxo, &group_key)?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let signature = tss::calculate_signature(
            signer,
            tag.session_id(keep_id),
            sighash,
            members,
            channel,
            &mut receiver,
            self.signing_timeout.min(remaining),
        )
        .await?;
        tx::add_witness(&mut transaction, &signature, &group_key)?;
        Ok(transaction)
    }

    /// Wait for the announcement of every member; returned in member order.
    async fn collect_announcements(
        &self,
        members: &[MemberId],
        own: &RecoveryAnnouncement,
        receiver: &mut ChannelReceiver,
    ) -> Result<Vec<RecoveryAnnouncement>> {
        let mut received = HashMap::from([(own.member_id.clone(), own.clone())]);
        let mut deferred = Vec::new();
        let collected = tokio::time::timeout(self.tss.ready_timeout(), async {
            while received.len() < members.len() {
                match receiver.recv().await {
                    None => return Err(InternalError::Transport("subscription closed".into())),
                    Some((sender, NetMessage::Recovery(announcement))) => {
                        if announcement.member_id != sender {
                            warn!("Member {sender} announced terms for someone else");
                            continue;
                        }
                        let _ = received.insert(sender, announcement);
                    }
                    Some(other) => deferred.push(other),
                }
            }
            Ok(())
        })
        .await;
        receiver.defer(deferred);
        collected.map_err(|_| InternalError::Timeout("recovery announcements".into()))??;

        members
            .iter()
            .map(|member| {
                received
                    .remove(member)
                    .ok_or(InternalError::InternalInvariantFailed)
            })
            .collect()
    }

    fn parse_address(&self, announcement: &RecoveryAnnouncement) -> Result<Address> {
        Address::from_str(&announcement.beneficiary_address)
            .ok()
            .and_then(|address| address.require_network(self.network).ok())
            .ok_or_else(|| {
                InternalError::Bitcoin(format!(
                    "member {} announced unusable address {}",
                    announcement.member_id, announcement.beneficiary_address
                ))
            })
    }

    /// Hand the transaction to the relay. Failures are logged with the raw
    /// transaction so an operator can broadcast it by other means.
    async fn broadcast(&self, transaction: &Transaction) {
        let raw = serialize_hex(transaction);
        for attempt in 0..BROADCAST_ATTEMPTS {
            match self.bitcoin.broadcast(&raw).await {
                Ok(()) => {
                    info!("Broadcast recovery transaction {}", transaction.compute_txid());
                    return;
                }
                Err(e) => {
                    error!("Broadcasting recovery transaction failed: {e}; raw transaction: {raw}");
                    tokio::time::sleep(backoff(
                        attempt,
                        self.tss.retry_backoff(),
                        self.tss.max_backoff(),
                    ))
                    .await;
                }
            }
        }
        error!(
            "Giving up on broadcasting recovery transaction {}; broadcast it manually: {raw}",
            transaction.compute_txid()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        net::{join_channel, local::LocalProvider, Provider},
        node::tests::test_tss_config,
        protocol::KeepId,
        recovery::electrs::tests::MockBitcoin,
        tss::tests::{generate_signers, operators},
    };
    use bitcoin::{hashes::Hash, OutPoint, Txid};
    use test_log::test;

    fn recovery_config(beneficiary: &str, max_fee: u32) -> LiquidationRecoveryConfig {
        LiquidationRecoveryConfig {
            beneficiary_address: beneficiary.to_string(),
            max_fee_per_vbyte: max_fee,
            bitcoin_network: "bitcoin".into(),
            electrs_url: "http://localhost".into(),
            timeout_secs: 120,
        }
    }

    fn announcement(fee: u64) -> RecoveryAnnouncement {
        RecoveryAnnouncement {
            member_id: crate::net::OperatorKey::random(&mut rand::rngs::OsRng)
                .member_id()
                .clone(),
            beneficiary_address: String::new(),
            max_fee_per_vbyte: fee,
        }
    }

    #[test]
    fn lowest_fee_wins() {
        assert_eq!(
            agreed_fee(&[announcement(30), announcement(12), announcement(75)]).unwrap(),
            12
        );
        assert!(agreed_fee(&[]).is_err());
    }

    #[test(tokio::test)]
    async fn advertised_fee_follows_the_estimate() {
        let dir = tempfile::tempdir().unwrap();
        let bitcoin = Arc::new(MockBitcoin::default());
        let recovery = LiquidationRecovery::new(
            recovery_config("1MjCqoLqMZ6Ru64TTtP16XnpSdiE8Kpgcx", 75),
            dir.path(),
            bitcoin.clone(),
            test_tss_config(),
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(recovery.advertised_fee().await, 75);
        bitcoin.set_fee_estimate(Some(20.2));
        assert_eq!(recovery.advertised_fee().await, 21);
        bitcoin.set_fee_estimate(Some(300.0));
        assert_eq!(recovery.advertised_fee().await, 75);
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn members_agree_on_one_signed_transaction() -> Result<()> {
        let provider: Arc<dyn Provider> = Arc::new(LocalProvider::new());
        let keep_id = KeepId::new("0xkeep");
        let (keys, members) = operators(3);
        let signers = generate_signers(provider.clone(), &keep_id, &keys, &members, 1).await?;

        let beneficiaries = [
            "1MjCqoLqMZ6Ru64TTtP16XnpSdiE8Kpgcx",
            "1E7FxE46iV81NnNFARoiWu1jwmtVzZZ3y1",
            "1K5CAm9YFWRJvn8k1khZNzyqZWd8U5NSAt",
        ];
        let fees = [40, 15, 75];
        let utxo = DepositUtxo {
            outpoint: OutPoint::new(Txid::from_byte_array([3; 32]), 0),
            value: 10_000_000,
        };

        let mut tasks = Vec::new();
        let mut relays = Vec::new();
        for (index, (signer, key)) in signers.iter().zip(&keys).enumerate() {
            let dir = tempfile::tempdir().unwrap();
            let bitcoin = Arc::new(MockBitcoin::default());
            bitcoin.fail_next_broadcasts(1);
            relays.push(bitcoin.clone());
            let recovery = LiquidationRecovery::new(
                recovery_config(beneficiaries[index], fees[index]),
                dir.path(),
                bitcoin,
                test_tss_config(),
                Duration::from_secs(60),
            )?;
            let channel = join_channel(provider.clone(), key.clone(), &keep_id, members.clone());
            let signer = signer.clone();
            tasks.push(tokio::spawn(async move {
                let _dir = dir;
                recovery.run(&signer, utxo, &channel).await
            }));
        }
        let mut transactions = Vec::new();
        for task in tasks {
            transactions.push(task.await.unwrap()?);
        }

        let raw = serialize_hex(&transactions[0]);
        assert!(transactions.iter().all(|t| serialize_hex(t) == raw));
        let transaction = &transactions[0];
        assert_eq!(transaction.output.len(), 3);
        let fee = 15 * tx::signed_vsize(transaction) as u64;
        for (output, beneficiary) in transaction.output.iter().zip(beneficiaries) {
            let address = Address::from_str(beneficiary)
                .unwrap()
                .require_network(Network::Bitcoin)
                .unwrap();
            assert_eq!(output.script_pubkey, address.script_pubkey());
            assert_eq!(output.value.to_sat(), (10_000_000 - fee) / 3);
        }
        assert_eq!(transaction.input[0].witness.len(), 2);
        for relay in relays {
            assert_eq!(relay.broadcasts(), vec![raw.clone()]);
        }
        Ok(())
    }
}
