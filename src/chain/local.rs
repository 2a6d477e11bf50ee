// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! An in-memory host chain.
//!
//! Every [`LocalChain`] obtained through [`LocalChain::connect`] shares the
//! same state and acts as a different operator, which is enough to run
//! several clients against each other in one process. Keep contract rules
//! are modelled after the bonded ECDSA keep: members submit the key one by
//! one, the key is published once all submissions agree, and a submitted
//! signature must verify against the published key.

use crate::{
    chain::{
        ApplicationAddress, ChainHandle, ConflictingPublicKeySubmittedEvent, DepositUtxo,
        KeepClosureEvent, KeepCreatedEvent, OperatorStatusEvent, PublicKeyPublishedEvent,
        SignatureRequestedEvent, SignatureSubmittedEvent, Subscription,
    },
    errors::{InternalError, Result},
    protocol::{KeepId, MemberId},
    signer::Signature,
};
use async_trait::async_trait;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeepStatus {
    Active,
    Closed,
    Terminated,
}

#[derive(Debug)]
struct KeepState {
    members: Vec<MemberId>,
    honest_threshold: usize,
    opened_at: u64,
    status: KeepStatus,
    submitted_keys: HashMap<MemberId, [u8; 64]>,
    public_key: Option<[u8; 64]>,
    awaiting: Option<[u8; 32]>,
    requests: Vec<SignatureRequestedEvent>,
    signatures: Vec<(MemberId, Signature)>,
    deposit: Option<DepositUtxo>,
}

#[derive(Debug, Default)]
struct Application {
    eligible: HashSet<MemberId>,
    registered: HashSet<MemberId>,
    stale: HashSet<MemberId>,
}

#[derive(Debug, Default)]
struct World {
    block: u64,
    keep_order: Vec<KeepId>,
    keeps: HashMap<KeepId, KeepState>,
    applications: BTreeMap<ApplicationAddress, Application>,
    failing_transactions: usize,
    public_key_submissions: HashMap<KeepId, usize>,
}

impl World {
    fn keep(&self, keep: &KeepId) -> Result<&KeepState> {
        self.keeps
            .get(keep)
            .ok_or_else(|| InternalError::Chain(format!("unknown keep {keep}")))
    }

    fn keep_mut(&mut self, keep: &KeepId) -> Result<&mut KeepState> {
        self.keeps
            .get_mut(keep)
            .ok_or_else(|| InternalError::Chain(format!("unknown keep {keep}")))
    }

    fn application(&mut self, application: &str) -> Result<&mut Application> {
        self.applications
            .get_mut(application)
            .ok_or_else(|| InternalError::Chain(format!("unknown application {application}")))
    }

    /// Consume one injected failure, if any is pending.
    fn take_failure(&mut self) -> Result<()> {
        if self.failing_transactions > 0 {
            self.failing_transactions -= 1;
            return Err(InternalError::Chain("transaction underpriced".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum ChainEvent {
    Block(u64),
    KeepCreated(KeepCreatedEvent),
    PublicKeyPublished(PublicKeyPublishedEvent),
    ConflictingPublicKey(ConflictingPublicKeySubmittedEvent),
    SignatureRequested(SignatureRequestedEvent),
    SignatureSubmitted(SignatureSubmittedEvent),
    KeepClosed(KeepClosureEvent),
    KeepTerminated(KeepClosureEvent),
    OperatorStatus(MemberId, OperatorStatusEvent),
}

/// A handle on an in-memory chain, acting as one operator.
#[derive(Debug, Clone)]
pub struct LocalChain {
    world: Arc<Mutex<World>>,
    events: broadcast::Sender<ChainEvent>,
    operator: MemberId,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn not_a_member(keep: &KeepId) -> InternalError {
    InternalError::Chain(format!("operator is not a member of keep {keep}"))
}

impl LocalChain {
    /// A fresh chain, handled by `operator`.
    pub fn new(operator: MemberId) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            world: Default::default(),
            events,
            operator,
        }
    }

    /// Another handle on the same chain, acting as `operator`.
    pub fn connect(&self, operator: MemberId) -> Self {
        Self {
            world: self.world.clone(),
            events: self.events.clone(),
            operator,
        }
    }

    fn emit(&self, event: ChainEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn forward<T, F>(&self, select: F) -> Subscription<T>
    where
        T: Send + 'static,
        F: Fn(ChainEvent) -> Option<T> + Send + 'static,
    {
        let mut events = self.events.subscribe();
        let (sender, receiver) = mpsc::unbounded_channel();
        let _handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(selected) = select(event) {
                            if sender.send(selected).is_err() {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        receiver
    }

    /// Mine a block.
    pub fn mine_block(&self) -> u64 {
        let block = {
            let mut world = self.world.lock();
            world.block += 1;
            world.block
        };
        self.emit(ChainEvent::Block(block));
        block
    }

    /// Open a keep and announce it.
    pub fn open_keep(
        &self,
        keep_id: &KeepId,
        members: Vec<MemberId>,
        honest_threshold: usize,
    ) -> KeepCreatedEvent {
        let event = {
            let mut world = self.world.lock();
            let block_number = world.block;
            world.keep_order.push(keep_id.clone());
            let _ = world.keeps.insert(
                keep_id.clone(),
                KeepState {
                    members: members.clone(),
                    honest_threshold,
                    opened_at: now(),
                    status: KeepStatus::Active,
                    submitted_keys: HashMap::new(),
                    public_key: None,
                    awaiting: None,
                    requests: Vec::new(),
                    signatures: Vec::new(),
                    deposit: None,
                },
            );
            KeepCreatedEvent {
                keep_id: keep_id.clone(),
                members,
                honest_threshold,
                block_number,
            }
        };
        info!("Opened keep {keep_id}");
        self.emit(ChainEvent::KeepCreated(event.clone()));
        event
    }

    /// Override when `keep` was opened.
    pub fn set_opened_timestamp(&self, keep: &KeepId, timestamp: u64) -> Result<()> {
        self.world.lock().keep_mut(keep)?.opened_at = timestamp;
        Ok(())
    }

    /// Attach a deposit output to `keep`.
    pub fn set_deposit_utxo(&self, keep: &KeepId, utxo: DepositUtxo) -> Result<()> {
        self.world.lock().keep_mut(keep)?.deposit = Some(utxo);
        Ok(())
    }

    /// Ask `keep` for a signature over `digest`.
    pub fn request_signature(&self, keep: &KeepId, digest: [u8; 32]) -> Result<()> {
        let event = {
            let mut world = self.world.lock();
            let block_number = world.block;
            let state = world.keep_mut(keep)?;
            if state.status != KeepStatus::Active || state.public_key.is_none() {
                return Err(InternalError::Chain("keep cannot sign".into()));
            }
            if state.awaiting.is_some() {
                return Err(InternalError::Chain("signing already in progress".into()));
            }
            state.awaiting = Some(digest);
            let event = SignatureRequestedEvent {
                keep_id: keep.clone(),
                digest,
                block_number,
            };
            state.requests.push(event.clone());
            event
        };
        self.emit(ChainEvent::SignatureRequested(event));
        Ok(())
    }

    /// Deliver an earlier signature request event again, as a resubscription
    /// would.
    pub fn redeliver_signature_request(&self, keep: &KeepId) -> Result<()> {
        let event = self
            .world
            .lock()
            .keep(keep)?
            .requests
            .last()
            .cloned()
            .ok_or_else(|| InternalError::Chain("no signature request".into()))?;
        self.emit(ChainEvent::SignatureRequested(event));
        Ok(())
    }

    /// Announce `keep` again, as a resubscription replaying old blocks would.
    pub fn redeliver_keep_created(&self, keep: &KeepId) -> Result<()> {
        let event = {
            let world = self.world.lock();
            let state = world.keep(keep)?;
            KeepCreatedEvent {
                keep_id: keep.clone(),
                members: state.members.clone(),
                honest_threshold: state.honest_threshold,
                block_number: world.block,
            }
        };
        self.emit(ChainEvent::KeepCreated(event));
        Ok(())
    }

    fn end_keep(&self, keep: &KeepId, status: KeepStatus) -> Result<KeepClosureEvent> {
        let mut world = self.world.lock();
        let block_number = world.block;
        let state = world.keep_mut(keep)?;
        if state.status != KeepStatus::Active {
            return Err(InternalError::Chain(format!("keep {keep} is not active")));
        }
        state.status = status;
        state.awaiting = None;
        Ok(KeepClosureEvent {
            keep_id: keep.clone(),
            block_number,
        })
    }

    /// Close `keep` as its owner would.
    pub fn close(&self, keep: &KeepId) -> Result<()> {
        let event = self.end_keep(keep, KeepStatus::Closed)?;
        self.emit(ChainEvent::KeepClosed(event));
        Ok(())
    }

    /// Terminate `keep`, as after a deposit liquidation.
    pub fn terminate(&self, keep: &KeepId) -> Result<()> {
        let event = self.end_keep(keep, KeepStatus::Terminated)?;
        self.emit(ChainEvent::KeepTerminated(event));
        Ok(())
    }

    /// Make the next `count` transactions of any operator fail.
    pub fn fail_next_transactions(&self, count: usize) {
        self.world.lock().failing_transactions = count;
    }

    /// Register an application; `eligible` operators may join its pool.
    pub fn add_application(&self, application: &str, eligible: &[MemberId]) {
        let mut world = self.world.lock();
        let entry = world
            .applications
            .entry(application.to_string())
            .or_default();
        entry.eligible.extend(eligible.iter().cloned());
    }

    /// Let `operator` join the pool of `application`.
    pub fn make_eligible(&self, application: &str, operator: &MemberId) -> Result<()> {
        let _ = self
            .world
            .lock()
            .application(application)?
            .eligible
            .insert(operator.clone());
        Ok(())
    }

    /// Record a status change of `operator`, outdating its pool status.
    pub fn change_operator_status(
        &self,
        application: &str,
        operator: &MemberId,
        event: OperatorStatusEvent,
    ) -> Result<()> {
        let _ = self
            .world
            .lock()
            .application(application)?
            .stale
            .insert(operator.clone());
        self.emit(ChainEvent::OperatorStatus(operator.clone(), event));
        Ok(())
    }

    /// Signatures accepted by `keep`, with their submitter.
    pub fn accepted_signatures(&self, keep: &KeepId) -> Result<Vec<(MemberId, Signature)>> {
        Ok(self.world.lock().keep(keep)?.signatures.clone())
    }

    /// Number of public key submission transactions for `keep`.
    pub fn public_key_submissions(&self, keep: &KeepId) -> usize {
        self.world
            .lock()
            .public_key_submissions
            .get(keep)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChainHandle for LocalChain {
    fn operator(&self) -> MemberId {
        self.operator.clone()
    }

    async fn current_block(&self) -> Result<u64> {
        Ok(self.world.lock().block)
    }

    async fn on_new_block(&self) -> Result<Subscription<u64>> {
        Ok(self.forward(|event| match event {
            ChainEvent::Block(block) => Some(block),
            _ => None,
        }))
    }

    async fn on_keep_created(&self) -> Result<Subscription<KeepCreatedEvent>> {
        Ok(self.forward(|event| match event {
            ChainEvent::KeepCreated(event) => Some(event),
            _ => None,
        }))
    }

    async fn on_public_key_published(
        &self,
        keep: &KeepId,
    ) -> Result<Subscription<PublicKeyPublishedEvent>> {
        let keep = keep.clone();
        Ok(self.forward(move |event| match event {
            ChainEvent::PublicKeyPublished(event) if event.keep_id == keep => Some(event),
            _ => None,
        }))
    }

    async fn on_conflicting_public_key_submitted(
        &self,
        keep: &KeepId,
    ) -> Result<Subscription<ConflictingPublicKeySubmittedEvent>> {
        let keep = keep.clone();
        Ok(self.forward(move |event| match event {
            ChainEvent::ConflictingPublicKey(event) if event.keep_id == keep => Some(event),
            _ => None,
        }))
    }

    async fn on_signature_requested(
        &self,
        keep: &KeepId,
    ) -> Result<Subscription<SignatureRequestedEvent>> {
        let keep = keep.clone();
        Ok(self.forward(move |event| match event {
            ChainEvent::SignatureRequested(event) if event.keep_id == keep => Some(event),
            _ => None,
        }))
    }

    async fn on_signature_submitted(
        &self,
        keep: &KeepId,
    ) -> Result<Subscription<SignatureSubmittedEvent>> {
        let keep = keep.clone();
        Ok(self.forward(move |event| match event {
            ChainEvent::SignatureSubmitted(event) if event.keep_id == keep => Some(event),
            _ => None,
        }))
    }

    async fn on_keep_closed(&self, keep: &KeepId) -> Result<Subscription<KeepClosureEvent>> {
        let keep = keep.clone();
        Ok(self.forward(move |event| match event {
            ChainEvent::KeepClosed(event) if event.keep_id == keep => Some(event),
            _ => None,
        }))
    }

    async fn on_keep_terminated(&self, keep: &KeepId) -> Result<Subscription<KeepClosureEvent>> {
        let keep = keep.clone();
        Ok(self.forward(move |event| match event {
            ChainEvent::KeepTerminated(event) if event.keep_id == keep => Some(event),
            _ => None,
        }))
    }

    async fn on_operator_status_changed(&self) -> Result<Subscription<OperatorStatusEvent>> {
        let operator = self.operator.clone();
        Ok(self.forward(move |event| match event {
            ChainEvent::OperatorStatus(member, event) if member == operator => Some(event),
            _ => None,
        }))
    }

    async fn past_signature_requested_events(
        &self,
        keep: &KeepId,
    ) -> Result<Vec<SignatureRequestedEvent>> {
        Ok(self.world.lock().keep(keep)?.requests.clone())
    }

    async fn keep_count(&self) -> Result<u64> {
        Ok(self.world.lock().keep_order.len() as u64)
    }

    async fn keep_at_index(&self, index: u64) -> Result<KeepId> {
        let world = self.world.lock();
        usize::try_from(index)
            .ok()
            .and_then(|index| world.keep_order.get(index))
            .cloned()
            .ok_or_else(|| InternalError::Chain(format!("no keep at index {index}")))
    }

    async fn keep_opened_timestamp(&self, keep: &KeepId) -> Result<u64> {
        Ok(self.world.lock().keep(keep)?.opened_at)
    }

    async fn is_active(&self, keep: &KeepId) -> Result<bool> {
        Ok(self.world.lock().keep(keep)?.status == KeepStatus::Active)
    }

    async fn is_awaiting_signature(&self, keep: &KeepId, digest: &[u8; 32]) -> Result<bool> {
        Ok(self.world.lock().keep(keep)?.awaiting.as_ref() == Some(digest))
    }

    async fn get_members(&self, keep: &KeepId) -> Result<Vec<MemberId>> {
        Ok(self.world.lock().keep(keep)?.members.clone())
    }

    async fn get_public_key(&self, keep: &KeepId) -> Result<Vec<u8>> {
        Ok(self
            .world
            .lock()
            .keep(keep)?
            .public_key
            .map(|key| key.to_vec())
            .unwrap_or_default())
    }

    async fn honest_threshold(&self, keep: &KeepId) -> Result<usize> {
        Ok(self.world.lock().keep(keep)?.honest_threshold)
    }

    async fn deposit_utxo(&self, keep: &KeepId) -> Result<Option<DepositUtxo>> {
        Ok(self.world.lock().keep(keep)?.deposit)
    }

    async fn sanctioned_applications(&self) -> Result<Vec<ApplicationAddress>> {
        Ok(self.world.lock().applications.keys().cloned().collect())
    }

    async fn is_registered_for_application(&self, application: &str) -> Result<bool> {
        Ok(self
            .world
            .lock()
            .application(application)?
            .registered
            .contains(&self.operator))
    }

    async fn is_eligible_for_application(&self, application: &str) -> Result<bool> {
        Ok(self
            .world
            .lock()
            .application(application)?
            .eligible
            .contains(&self.operator))
    }

    async fn is_status_up_to_date_for_application(&self, application: &str) -> Result<bool> {
        Ok(!self
            .world
            .lock()
            .application(application)?
            .stale
            .contains(&self.operator))
    }

    async fn submit_public_key(&self, keep: &KeepId, public_key: &[u8; 64]) -> Result<()> {
        let (conflict, published) = {
            let mut world = self.world.lock();
            world.take_failure()?;
            *world.public_key_submissions.entry(keep.clone()).or_default() += 1;
            let state = world.keep_mut(keep)?;
            if !state.members.contains(&self.operator) {
                return Err(not_a_member(keep));
            }
            if state.status != KeepStatus::Active {
                return Err(InternalError::Chain(format!("keep {keep} is not active")));
            }
            match state.submitted_keys.get(&self.operator) {
                Some(submitted) if submitted == public_key => return Ok(()),
                Some(_) => {
                    return Err(InternalError::Chain("public key already submitted".into()))
                }
                None => {}
            }
            let conflict = state
                .submitted_keys
                .values()
                .any(|submitted| submitted != public_key);
            let _ = state
                .submitted_keys
                .insert(self.operator.clone(), *public_key);
            let complete = state.submitted_keys.len() == state.members.len();
            let published = if complete && !conflict {
                state.public_key = Some(*public_key);
                true
            } else {
                false
            };
            (conflict, published)
        };

        debug!("Operator {} submitted a public key for {keep}", self.operator);
        if conflict {
            self.emit(ChainEvent::ConflictingPublicKey(
                ConflictingPublicKeySubmittedEvent {
                    keep_id: keep.clone(),
                    submitting_member: self.operator.clone(),
                    conflicting_public_key: *public_key,
                },
            ));
        }
        if published {
            info!("Published public key of keep {keep}");
            self.emit(ChainEvent::PublicKeyPublished(PublicKeyPublishedEvent {
                keep_id: keep.clone(),
                public_key: *public_key,
            }));
        }
        Ok(())
    }

    async fn submit_signature(&self, keep: &KeepId, signature: &Signature) -> Result<()> {
        let event = {
            let mut world = self.world.lock();
            world.take_failure()?;
            let operator = self.operator.clone();
            let state = world.keep_mut(keep)?;
            if !state.members.contains(&operator) {
                return Err(not_a_member(keep));
            }
            let digest = state
                .awaiting
                .ok_or_else(|| InternalError::Chain("keep is not awaiting a signature".into()))?;
            let public_key = state
                .public_key
                .ok_or_else(|| InternalError::Chain("keep has no public key".into()))?;
            let recovered = signature.recover_public_key(&digest)?;
            if recovered.to_encoded_point(false).as_bytes()[1..] != public_key[..] {
                return Err(InternalError::Chain("signature does not match the keep key".into()));
            }
            state.awaiting = None;
            state.signatures.push((operator, *signature));
            SignatureSubmittedEvent {
                keep_id: keep.clone(),
                digest,
                signature: *signature,
            }
        };
        info!("Keep {keep} accepted a signature");
        self.emit(ChainEvent::SignatureSubmitted(event));
        Ok(())
    }

    async fn register_as_member_candidate(&self, application: &str) -> Result<()> {
        let mut world = self.world.lock();
        world.take_failure()?;
        let operator = self.operator.clone();
        let entry = world.application(application)?;
        if !entry.eligible.contains(&operator) {
            return Err(InternalError::Chain("operator is not eligible".into()));
        }
        let _ = entry.registered.insert(operator);
        Ok(())
    }

    async fn update_status_for_application(&self, application: &str) -> Result<()> {
        let mut world = self.world.lock();
        world.take_failure()?;
        let operator = self.operator.clone();
        let _ = world.application(application)?.stale.remove(&operator);
        Ok(())
    }

    async fn close_keep(&self, keep: &KeepId) -> Result<()> {
        {
            let mut world = self.world.lock();
            world.take_failure()?;
            if !world.keep(keep)?.members.contains(&self.operator) {
                return Err(not_a_member(keep));
            }
        }
        self.close(keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::OperatorKey;
    use rand::rngs::OsRng;
    use test_log::test;

    fn operators(count: usize) -> Vec<MemberId> {
        (0..count)
            .map(|_| OperatorKey::random(&mut OsRng).member_id().clone())
            .collect()
    }

    #[test(tokio::test)]
    async fn public_key_is_published_once_everyone_agrees() -> Result<()> {
        let members = operators(2);
        let alice = LocalChain::new(members[0].clone());
        let bob = alice.connect(members[1].clone());
        let keep = KeepId::new("0xkeep");
        let _ = alice.open_keep(&keep, members.clone(), 2);
        let mut published = alice.on_public_key_published(&keep).await?;

        alice.submit_public_key(&keep, &[1; 64]).await?;
        assert!(alice.get_public_key(&keep).await?.is_empty());
        // Resubmitting the same key is harmless.
        alice.submit_public_key(&keep, &[1; 64]).await?;
        bob.submit_public_key(&keep, &[1; 64]).await?;
        assert_eq!(published.recv().await.unwrap().public_key, [1; 64]);
        assert_eq!(bob.get_public_key(&keep).await?, vec![1; 64]);
        assert_eq!(alice.public_key_submissions(&keep), 3);
        Ok(())
    }

    #[test(tokio::test)]
    async fn disagreeing_keys_are_reported() -> Result<()> {
        let members = operators(2);
        let alice = LocalChain::new(members[0].clone());
        let bob = alice.connect(members[1].clone());
        let keep = KeepId::new("0xkeep");
        let _ = alice.open_keep(&keep, members.clone(), 2);
        let mut conflicts = bob.on_conflicting_public_key_submitted(&keep).await?;

        alice.submit_public_key(&keep, &[1; 64]).await?;
        bob.submit_public_key(&keep, &[2; 64]).await?;
        let conflict = conflicts.recv().await.unwrap();
        assert_eq!(conflict.submitting_member, members[1]);
        assert!(alice.get_public_key(&keep).await?.is_empty());
        Ok(())
    }

    #[test(tokio::test)]
    async fn outsiders_and_injected_failures_are_rejected() -> Result<()> {
        let members = operators(3);
        let chain = LocalChain::new(members[2].clone());
        let keep = KeepId::new("0xkeep");
        let _ = chain.open_keep(&keep, members[..2].to_vec(), 2);
        assert!(chain.submit_public_key(&keep, &[1; 64]).await.is_err());

        let member = chain.connect(members[0].clone());
        chain.fail_next_transactions(1);
        assert!(member.submit_public_key(&keep, &[1; 64]).await.is_err());
        assert!(member.submit_public_key(&keep, &[1; 64]).await.is_ok());
        Ok(())
    }

    #[test(tokio::test)]
    async fn closing_ends_the_keep() -> Result<()> {
        let members = operators(2);
        let chain = LocalChain::new(members[0].clone());
        let keep = KeepId::new("0xkeep");
        let _ = chain.open_keep(&keep, members, 2);
        let mut closed = chain.on_keep_closed(&keep).await?;
        chain.close_keep(&keep).await?;
        assert_eq!(closed.recv().await.unwrap().keep_id, keep);
        assert!(!chain.is_active(&keep).await?);
        assert!(chain.terminate(&keep).is_err());
        Ok(())
    }
}
