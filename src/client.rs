// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The top-level orchestrator.
//!
//! [`Client::initialize`] loads the persisted signers, starts the
//! pre-parameters pool and the registration monitor, and then supervises
//! every keep this operator belongs to in a task of its own:
//!
//! ```text
//! key generation -> public key publication -> signing requests
//!                                          \-> closed / terminated
//! ```
//!
//! A closed keep is archived. A terminated tBTC keep first goes through
//! liquidation recovery, when it is configured.

use crate::{
    chain::{ChainHandle, KeepCreatedEvent, Subscription},
    config::Config,
    dedup::Deduplicator,
    errors::{InternalError, Result},
    net::{OperatorKey, Provider},
    node::Node,
    persistence::EncryptedPersistence,
    pre_params::{PreParamsGenerator, PreParamsPool},
    protocol::{KeepId, MemberId},
    recovery::{
        electrs::{BitcoinConnection, ElectrsConnection},
        LiquidationRecovery,
    },
    registration::monitor_registrations,
    registry::KeepRegistry,
    signer::ThresholdSigner,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Everything outside the process the client talks to.
pub struct Collaborators {
    /// The host chain, acting as this operator
    pub chain: Arc<dyn ChainHandle>,
    /// Peer-to-peer transport
    pub provider: Arc<dyn Provider>,
    /// Key this operator signs network messages with
    pub operator_key: Arc<OperatorKey>,
    /// Source of fresh pre-parameters
    pub pre_params_generator: Arc<dyn PreParamsGenerator>,
    /// Bitcoin access for liquidation recovery. An Electrs client for the
    /// configured URL is used when absent.
    pub bitcoin: Option<Arc<dyn BitcoinConnection>>,
}

/// Where the supervisor of a keep starts.
enum Start {
    /// The keep was just opened; generate its signer.
    Generate {
        members: Vec<MemberId>,
        honest_threshold: usize,
    },
    /// A signer exists already.
    Resume(ThresholdSigner),
}

/// How a keep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Closed,
    Terminated,
}

struct Inner {
    chain: Arc<dyn ChainHandle>,
    node: Arc<Node>,
    registry: Arc<KeepRegistry>,
    dedup: Arc<Deduplicator>,
    pre_params: Arc<PreParamsPool>,
    recovery: Option<Arc<LiquidationRecovery>>,
    config: Config,
    keeps: Mutex<HashMap<KeepId, CancellationToken>>,
    cancel: CancellationToken,
}

/// A running keep-ecdsa client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("operator", self.inner.node.member_id())
            .field("keeps", &self.supervised_keeps())
            .finish_non_exhaustive()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl Client {
    /// Start the client. Everything it spawns stops when `cancel` fires.
    ///
    /// Fails when the configuration is invalid, the operator key does not
    /// match the chain handle, or a persisted signer does not decrypt with
    /// `password`.
    #[instrument(skip_all, err(Debug))]
    pub async fn initialize(
        config: Config,
        collaborators: Collaborators,
        password: &str,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            chain,
            provider,
            operator_key,
            pre_params_generator,
            bitcoin,
        } = collaborators;
        if chain.operator() != *operator_key.member_id() {
            return Err(InternalError::Configuration(
                "operator key does not match the chain account".into(),
            ));
        }

        let registry = Arc::new(KeepRegistry::new(EncryptedPersistence::open(
            &config.chain_dir(),
            password,
        )?));
        registry.load_existing(chain.as_ref()).await?;

        let recovery = match &config.extensions.tbtc {
            Some(tbtc) => {
                let settings = &tbtc.liquidation_recovery;
                let bitcoin: Arc<dyn BitcoinConnection> = match bitcoin {
                    Some(bitcoin) => bitcoin,
                    None => Arc::new(ElectrsConnection::new(&settings.electrs_url)?),
                };
                Some(Arc::new(LiquidationRecovery::new(
                    settings.clone(),
                    &config.data_dir,
                    bitcoin,
                    config.tss.clone(),
                    config.client.signing_attempt_timeout(),
                )?))
            }
            None => None,
        };

        let pre_params = Arc::new(PreParamsPool::start(
            &config.pre_params,
            pre_params_generator,
            cancel.child_token(),
        ));
        let dedup = Arc::new(Deduplicator::new(registry.clone()));
        let node = Arc::new(Node::new(
            chain.clone(),
            provider,
            operator_key,
            registry.clone(),
            dedup.clone(),
            pre_params.clone(),
            config.client.clone(),
            config.tss.clone(),
        ));

        monitor_registrations(chain.clone(), config.tss.max_backoff(), cancel.child_token())
            .await?;

        let inner = Arc::new(Inner {
            chain,
            node,
            registry,
            dedup,
            pre_params,
            recovery,
            config,
            keeps: Mutex::new(HashMap::new()),
            cancel,
        });

        // Subscribe before scanning, so no keep falls in between.
        let created = inner.chain.on_keep_created().await?;
        inner.resume_registered_keeps()?;
        inner.scan_awaiting_key_generation().await?;
        let _handle = tokio::spawn(inner.clone().watch_keep_creation(created));

        info!("Client started as operator {}", inner.node.member_id());
        Ok(Self { inner })
    }

    /// Member id of this operator.
    pub fn member_id(&self) -> &MemberId {
        self.inner.node.member_id()
    }

    /// The signers of this operator.
    pub fn registry(&self) -> &Arc<KeepRegistry> {
        &self.inner.registry
    }

    /// Keeps currently supervised.
    pub fn supervised_keeps(&self) -> Vec<KeepId> {
        let mut keeps: Vec<_> = self.inner.keeps.lock().keys().cloned().collect();
        keeps.sort();
        keeps
    }

    /// Number of pre-parameters ready for key generation.
    pub fn pre_params_pool_size(&self) -> usize {
        self.inner.pre_params.size()
    }

    /// Stop every task of the client.
    pub fn shutdown(&self) {
        info!("Shutting down");
        self.inner.cancel.cancel();
    }
}

impl Inner {
    fn member_id(&self) -> &MemberId {
        self.node.member_id()
    }

    /// Start supervising `keep_id` unless that already happens.
    fn supervise(self: &Arc<Self>, keep_id: KeepId, start: Start) {
        let token = {
            let mut keeps = self.keeps.lock();
            if keeps.contains_key(&keep_id) {
                debug!("Keep {keep_id} is already supervised");
                return;
            }
            let token = self.cancel.child_token();
            let _ = keeps.insert(keep_id.clone(), token.clone());
            token
        };
        let _handle = tokio::spawn(self.clone().run_supervisor(keep_id, start, token));
    }

    fn resume_registered_keeps(self: &Arc<Self>) -> Result<()> {
        for keep_id in self.registry.keeps() {
            let signer = self.registry.get_signer(&keep_id)?;
            info!("Resuming keep {keep_id}");
            self.supervise(keep_id, Start::Resume(signer));
        }
        Ok(())
    }

    /// Pick up keeps opened within the lookback window that still wait for
    /// this operator's key generation.
    #[instrument(skip_all, err(Debug))]
    async fn scan_awaiting_key_generation(self: &Arc<Self>) -> Result<()> {
        let lookback = self.config.client.awaiting_key_generation_lookback();
        let oldest = unix_now().saturating_sub(lookback.as_secs());
        let count = self.chain.keep_count().await?;
        for index in (0..count).rev() {
            let keep_id = self.chain.keep_at_index(index).await?;
            if self.chain.keep_opened_timestamp(&keep_id).await? < oldest {
                break;
            }
            let members = self.chain.get_members(&keep_id).await?;
            if !members.contains(self.member_id()) || !self.awaits_key_generation(&keep_id).await? {
                continue;
            }
            let honest_threshold = self.chain.honest_threshold(&keep_id).await?;
            info!("Keep {keep_id} awaits key generation");
            self.supervise(
                keep_id,
                Start::Generate {
                    members,
                    honest_threshold,
                },
            );
        }
        Ok(())
    }

    async fn watch_keep_creation(self: Arc<Self>, mut created: Subscription<KeepCreatedEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = created.recv() => match event {
                    Some(event) => self.on_keep_created(event).await,
                    None => {
                        error!("Keep creation subscription ended");
                        return;
                    }
                },
            }
        }
    }

    async fn on_keep_created(self: &Arc<Self>, event: KeepCreatedEvent) {
        if !event.members.contains(self.member_id()) {
            debug!("Not a member of keep {}", event.keep_id);
            return;
        }
        match self.awaits_key_generation(&event.keep_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Keep {} needs no key generation", event.keep_id);
                return;
            }
            Err(e) => {
                error!("Could not check state of keep {}: {e}", event.keep_id);
                return;
            }
        }
        info!(
            "Member of new keep {} with {} members at block {}",
            event.keep_id,
            event.members.len(),
            event.block_number
        );
        self.supervise(
            event.keep_id,
            Start::Generate {
                members: event.members,
                honest_threshold: event.honest_threshold,
            },
        );
    }

    /// Whether `keep_id` is active and still has neither a local signer nor a
    /// published key.
    async fn awaits_key_generation(&self, keep_id: &KeepId) -> Result<bool> {
        if self.registry.has_signer(keep_id) || !self.chain.is_active(keep_id).await? {
            return Ok(false);
        }
        if !self.chain.get_public_key(keep_id).await?.is_empty() {
            warn!("Keep {keep_id} has a public key but no local signer");
            return Ok(false);
        }
        Ok(true)
    }

    #[instrument(skip(self, start, token))]
    async fn run_supervisor(self: Arc<Self>, keep_id: KeepId, start: Start, token: CancellationToken) {
        if let Err(e) = self.supervise_keep(&keep_id, start, &token).await {
            error!("Supervision of keep {keep_id} failed: {e}");
        }
        let _ = self.keeps.lock().remove(&keep_id);
    }

    async fn supervise_keep(
        &self,
        keep_id: &KeepId,
        start: Start,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut closed = self.chain.on_keep_closed(keep_id).await?;
        let mut terminated = self.chain.on_keep_terminated(keep_id).await?;
        let signing = token.child_token();

        let mut lifecycle = Box::pin(self.run_lifecycle(keep_id, start, &signing));
        let mut lifecycle_running = true;
        let ending = loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                result = &mut lifecycle, if lifecycle_running => {
                    lifecycle_running = false;
                    if let Err(e) = result {
                        error!("Keep {keep_id} halted: {e}");
                    }
                }
                Some(_) = closed.recv() => break Ending::Closed,
                Some(_) = terminated.recv() => break Ending::Terminated,
            }
        };
        drop(lifecycle);
        signing.cancel();
        info!("Keep {keep_id} was {ending:?}");
        self.handle_ending(keep_id, ending, token).await
    }

    /// Key generation, publication, then signing every request until the
    /// keep ends.
    async fn run_lifecycle(
        &self,
        keep_id: &KeepId,
        start: Start,
        signing: &CancellationToken,
    ) -> Result<()> {
        let signer = match start {
            Start::Resume(signer) => signer,
            Start::Generate {
                members,
                honest_threshold,
            } => match self
                .node
                .generate_signer_for_keep(keep_id, &members, honest_threshold)
                .await?
            {
                Some(signer) => signer,
                None => {
                    debug!("Key generation for {keep_id} is handled elsewhere");
                    return Ok(());
                }
            },
        };

        let mut requests = self.chain.on_signature_requested(keep_id).await?;
        self.node.publish_public_key(&signer).await?;

        // A request may have arrived while this operator was away.
        if let Some(latest) = self
            .chain
            .past_signature_requested_events(keep_id)
            .await?
            .pop()
        {
            self.spawn_signing(&signer, latest.digest, signing);
        }
        while let Some(request) = requests.recv().await {
            info!(
                "Signature over {} requested at block {}",
                hex::encode(request.digest),
                request.block_number
            );
            self.spawn_signing(&signer, request.digest, signing);
        }
        Err(InternalError::Chain(
            "signature request subscription ended".into(),
        ))
    }

    fn spawn_signing(&self, signer: &ThresholdSigner, digest: [u8; 32], token: &CancellationToken) {
        let node = self.node.clone();
        let signer = signer.clone();
        let token = token.clone();
        let _handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Signing of {} cancelled", hex::encode(digest));
                }
                result = node.sign_digest(&signer, digest) => if let Err(e) = result {
                    error!("Signing of {} failed: {e}", hex::encode(digest));
                }
            }
        });
    }

    async fn handle_ending(
        &self,
        keep_id: &KeepId,
        ending: Ending,
        token: &CancellationToken,
    ) -> Result<()> {
        if !self.dedup.close_keep_if_allowed(keep_id) {
            debug!("Closure of keep {keep_id} is handled elsewhere");
            return Ok(());
        }
        let result = self.finish_keep(keep_id, ending, token).await;
        self.dedup.notify_closing_completed(keep_id);
        result
    }

    async fn finish_keep(
        &self,
        keep_id: &KeepId,
        ending: Ending,
        token: &CancellationToken,
    ) -> Result<()> {
        if !self.registry.has_signer(keep_id) {
            return Ok(());
        }
        if ending == Ending::Terminated {
            if let Some(recovery) = &self.recovery {
                self.recover(recovery, keep_id, token).await?;
            }
        }
        self.registry.archive(keep_id)?;
        info!("Archived keep {keep_id}");
        Ok(())
    }

    /// Run liquidation recovery for the deposit of `keep_id`, if it has one.
    /// The signer is snapshotted first so it outlives the archive.
    async fn recover(
        &self,
        recovery: &LiquidationRecovery,
        keep_id: &KeepId,
        token: &CancellationToken,
    ) -> Result<()> {
        let Some(utxo) = self.chain.deposit_utxo(keep_id).await? else {
            info!("Keep {keep_id} holds no deposit; nothing to recover");
            return Ok(());
        };
        self.registry.snapshot(keep_id)?;
        let signer = self.registry.get_signer(keep_id)?;
        let channel = self.node.channel(keep_id, signer.group_member_ids());
        tokio::select! {
            _ = token.cancelled() => Err(InternalError::Cancelled),
            result = recovery.run(&signer, utxo, &channel) => match result {
                Ok(transaction) => {
                    info!("Recovered deposit of keep {keep_id} in {}", transaction.compute_txid());
                    Ok(())
                }
                // The archive still happens; the snapshot keeps the signer.
                Err(e) => {
                    error!("Liquidation recovery of keep {keep_id} failed: {e}");
                    Ok(())
                }
            },
        }
    }
}
