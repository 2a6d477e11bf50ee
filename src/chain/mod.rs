// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The host chain as seen by the client.
//!
//! [`ChainHandle`] is the entire on-chain surface: event subscriptions,
//! calls and transactions. Chain families implement it; nothing chain
//! specific leaks past it.

pub mod local;

use crate::{
    errors::Result,
    protocol::{KeepId, MemberId},
    signer::Signature,
};
use async_trait::async_trait;
use bitcoin::OutPoint;
use tokio::sync::mpsc;

/// A stream of events. Dropping it unsubscribes.
pub type Subscription<T> = mpsc::UnboundedReceiver<T>;

/// Address of an application operators register for.
pub type ApplicationAddress = String;

/// A keep was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepCreatedEvent {
    /// The new keep
    pub keep_id: KeepId,
    /// Ordered members of the keep
    pub members: Vec<MemberId>,
    /// Number of members needed to sign
    pub honest_threshold: usize,
    /// Block the keep was opened in
    pub block_number: u64,
}

/// All members submitted the same public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyPublishedEvent {
    /// The keep
    pub keep_id: KeepId,
    /// `X || Y` of the keep key
    pub public_key: [u8; 64],
}

/// Members submitted different public keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictingPublicKeySubmittedEvent {
    /// The keep
    pub keep_id: KeepId,
    /// Member whose submission conflicted
    pub submitting_member: MemberId,
    /// The submitted key
    pub conflicting_public_key: [u8; 64],
}

/// A signature over `digest` was requested from the keep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRequestedEvent {
    /// The keep
    pub keep_id: KeepId,
    /// Digest to sign
    pub digest: [u8; 32],
    /// Block of the request
    pub block_number: u64,
}

/// A signature was accepted by the keep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureSubmittedEvent {
    /// The keep
    pub keep_id: KeepId,
    /// Signed digest
    pub digest: [u8; 32],
    /// The signature
    pub signature: Signature,
}

/// The keep was closed or terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepClosureEvent {
    /// The keep
    pub keep_id: KeepId,
    /// Block of the closure
    pub block_number: u64,
}

/// Events that may change an operator's eligibility in the sortition pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorStatusEvent {
    /// Unbonded value was withdrawn
    UnbondedValueWithdrawn,
    /// A bond was created
    BondCreated,
    /// Staked tokens were slashed
    TokensSlashed,
    /// Staked tokens were seized
    TokensSeized,
}

/// The Bitcoin output held by a tBTC deposit keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositUtxo {
    /// Funding outpoint
    pub outpoint: OutPoint,
    /// Value in satoshi
    pub value: u64,
}

/// Everything the client needs from the host chain.
///
/// Transactions are serialized by the implementation (nonce management and
/// gas escalation live there).
#[async_trait]
pub trait ChainHandle: Send + Sync {
    /// Member id of this operator.
    fn operator(&self) -> MemberId;

    /// Number of the latest block.
    async fn current_block(&self) -> Result<u64>;

    /// Every new block number.
    async fn on_new_block(&self) -> Result<Subscription<u64>>;

    /// Keeps opened from now on.
    async fn on_keep_created(&self) -> Result<Subscription<KeepCreatedEvent>>;

    /// Public key publication of `keep`.
    async fn on_public_key_published(
        &self,
        keep: &KeepId,
    ) -> Result<Subscription<PublicKeyPublishedEvent>>;

    /// Conflicting public key submissions for `keep`.
    async fn on_conflicting_public_key_submitted(
        &self,
        keep: &KeepId,
    ) -> Result<Subscription<ConflictingPublicKeySubmittedEvent>>;

    /// Signature requests to `keep`.
    async fn on_signature_requested(
        &self,
        keep: &KeepId,
    ) -> Result<Subscription<SignatureRequestedEvent>>;

    /// Signatures accepted by `keep`.
    async fn on_signature_submitted(
        &self,
        keep: &KeepId,
    ) -> Result<Subscription<SignatureSubmittedEvent>>;

    /// Closure of `keep`.
    async fn on_keep_closed(&self, keep: &KeepId) -> Result<Subscription<KeepClosureEvent>>;

    /// Termination of `keep`.
    async fn on_keep_terminated(&self, keep: &KeepId) -> Result<Subscription<KeepClosureEvent>>;

    /// Status changes of this operator.
    async fn on_operator_status_changed(&self) -> Result<Subscription<OperatorStatusEvent>>;

    /// Signature requests `keep` received so far, oldest first.
    async fn past_signature_requested_events(
        &self,
        keep: &KeepId,
    ) -> Result<Vec<SignatureRequestedEvent>>;

    /// Number of keeps opened by the factory.
    async fn keep_count(&self) -> Result<u64>;

    /// The keep at `index`, in opening order.
    async fn keep_at_index(&self, index: u64) -> Result<KeepId>;

    /// Unix time (seconds) `keep` was opened at.
    async fn keep_opened_timestamp(&self, keep: &KeepId) -> Result<u64>;

    /// Whether `keep` is neither closed nor terminated.
    async fn is_active(&self, keep: &KeepId) -> Result<bool>;

    /// Whether `keep` waits for a signature over `digest`.
    async fn is_awaiting_signature(&self, keep: &KeepId, digest: &[u8; 32]) -> Result<bool>;

    /// Ordered members of `keep`.
    async fn get_members(&self, keep: &KeepId) -> Result<Vec<MemberId>>;

    /// Published key of `keep`; empty while unpublished.
    async fn get_public_key(&self, keep: &KeepId) -> Result<Vec<u8>>;

    /// Number of members needed to sign for `keep`.
    async fn honest_threshold(&self, keep: &KeepId) -> Result<usize>;

    /// The deposit output of `keep`, if it backs a tBTC deposit.
    async fn deposit_utxo(&self, keep: &KeepId) -> Result<Option<DepositUtxo>>;

    /// Applications operators may register for.
    async fn sanctioned_applications(&self) -> Result<Vec<ApplicationAddress>>;

    /// Whether this operator is a member candidate for `application`.
    async fn is_registered_for_application(&self, application: &str) -> Result<bool>;

    /// Whether this operator may register for `application`.
    async fn is_eligible_for_application(&self, application: &str) -> Result<bool>;

    /// Whether the pool status of this operator is current.
    async fn is_status_up_to_date_for_application(&self, application: &str) -> Result<bool>;

    /// Submit this member's view of the keep public key, `X || Y`.
    async fn submit_public_key(&self, keep: &KeepId, public_key: &[u8; 64]) -> Result<()>;

    /// Submit a signature; `v` is 0 or 1.
    async fn submit_signature(&self, keep: &KeepId, signature: &Signature) -> Result<()>;

    /// Register as member candidate for `application`.
    async fn register_as_member_candidate(&self, application: &str) -> Result<()>;

    /// Refresh the pool status for `application`.
    async fn update_status_for_application(&self, application: &str) -> Result<()>;

    /// Close `keep`.
    async fn close_keep(&self, keep: &KeepId) -> Result<()>;
}
