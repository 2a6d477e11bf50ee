// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The keep coordinator: key generation with retries, public key
//! publication and signing of requested digests.
//!
//! Every session is preceded by a presence announcement tagged with the
//! operation and the attempt number, so members that retry stay in step
//! with each other. A failed attempt is retried with a jittered exponential
//! backoff until the operation deadline.

use crate::{
    chain::ChainHandle,
    config::{ClientConfig, TssConfig},
    dedup::Deduplicator,
    errors::{InternalError, Result},
    net::{announce_presence, join_channel, BroadcastChannel, OperatorKey, Provider, SessionTag},
    pre_params::{PreParamsBox, PreParamsPool},
    protocol::{KeepId, MemberId, SessionKind},
    registry::KeepRegistry,
    signer::{Signature, ThresholdSigner},
    tss,
};
use rand::Rng;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

/// Delay before retry number `attempt`: `base * 2^attempt`, capped at `max`,
/// plus up to half of that again as jitter.
pub(crate) fn backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let delay = base
        .checked_mul(1u32 << attempt.min(16))
        .unwrap_or(max)
        .min(max);
    let jitter_millis = (delay.as_millis() / 2) as u64;
    let jitter = if jitter_millis == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_millis)
    };
    delay + Duration::from_millis(jitter)
}

/// Releases a key generation claim when dropped.
struct KeyGenerationClaim<'a> {
    dedup: &'a Deduplicator,
    keep_id: &'a KeepId,
}

impl Drop for KeyGenerationClaim<'_> {
    fn drop(&mut self) {
        self.dedup.notify_key_generated(self.keep_id);
    }
}

/// Releases a signing claim when dropped.
struct SigningClaim<'a> {
    dedup: &'a Deduplicator,
    keep_id: &'a KeepId,
    digest: [u8; 32],
}

impl Drop for SigningClaim<'_> {
    fn drop(&mut self) {
        self.dedup.notify_signing_completed(self.keep_id, &self.digest);
    }
}

/// Drives the signer lifecycle of the keeps this operator belongs to.
pub struct Node {
    chain: Arc<dyn ChainHandle>,
    provider: Arc<dyn Provider>,
    key: Arc<OperatorKey>,
    registry: Arc<KeepRegistry>,
    dedup: Arc<Deduplicator>,
    pre_params: Arc<PreParamsPool>,
    client: ClientConfig,
    tss: TssConfig,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("operator", self.key.member_id())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// A coordinator acting as `key` on `chain`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainHandle>,
        provider: Arc<dyn Provider>,
        key: Arc<OperatorKey>,
        registry: Arc<KeepRegistry>,
        dedup: Arc<Deduplicator>,
        pre_params: Arc<PreParamsPool>,
        client: ClientConfig,
        tss: TssConfig,
    ) -> Self {
        Self {
            chain,
            provider,
            key,
            registry,
            dedup,
            pre_params,
            client,
            tss,
        }
    }

    /// Member id of this operator.
    pub fn member_id(&self) -> &MemberId {
        self.key.member_id()
    }

    /// The broadcast channel of `keep_id`.
    pub fn channel(&self, keep_id: &KeepId, members: &[MemberId]) -> BroadcastChannel {
        join_channel(
            self.provider.clone(),
            self.key.clone(),
            keep_id,
            members.to_vec(),
        )
    }

    fn backoff(&self, attempt: u32) -> Duration {
        backoff(attempt, self.tss.retry_backoff(), self.tss.max_backoff())
    }

    /// Sleep before the next attempt; fails if that would cross `deadline`.
    async fn pause(&self, attempt: u32, deadline: Instant, operation: &str) -> Result<()> {
        let wake = Instant::now() + self.backoff(attempt);
        if wake >= deadline {
            return Err(InternalError::Timeout(operation.into()));
        }
        tokio::time::sleep_until(wake).await;
        Ok(())
    }

    /// Submit a chain transaction, retrying transient failures until
    /// `deadline`.
    async fn submit_with_retry<F, Fut>(
        &self,
        operation: &str,
        deadline: Instant,
        mut submit: F,
    ) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut attempt = 0;
        loop {
            match submit().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!("{operation} failed: {e}; retrying");
                    self.pause(attempt, deadline, operation).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Generate the signer of `keep_id` with the other `members`, unless
    /// another task already does so or a signer exists.
    ///
    /// `honest_threshold` members are needed to sign. Attempts are retried
    /// until the key generation deadline; the signer is registered before
    /// this returns.
    #[instrument(skip(self, members), err(Debug))]
    pub async fn generate_signer_for_keep(
        &self,
        keep_id: &KeepId,
        members: &[MemberId],
        honest_threshold: usize,
    ) -> Result<Option<ThresholdSigner>> {
        if honest_threshold == 0 || honest_threshold > members.len() {
            return Err(InternalError::InvalidArgument(format!(
                "honest threshold {honest_threshold} does not fit {} members",
                members.len()
            )));
        }
        if !self.dedup.generate_key_if_allowed(keep_id) {
            return Ok(None);
        }
        let _claim = KeyGenerationClaim {
            dedup: &self.dedup,
            keep_id,
        };

        let threshold = honest_threshold - 1;
        let deadline = Instant::now() + self.client.key_generation_timeout();
        let channel = self.channel(keep_id, members);
        let mut unused: Option<PreParamsBox> = None;
        let mut attempt = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut pre_params = match unused.take() {
                Some(pre_params) if !pre_params.is_consumed() => pre_params,
                _ => tokio::time::timeout(remaining, self.pre_params.get())
                    .await
                    .map_err(|_| InternalError::Timeout("key generation".into()))??,
            };

            let result = self
                .key_generation_attempt(
                    keep_id,
                    members,
                    threshold,
                    &mut pre_params,
                    &channel,
                    attempt,
                    deadline,
                )
                .await;
            match result {
                Ok(signer) => {
                    self.registry.register_signer(keep_id, &signer)?;
                    return Ok(Some(signer));
                }
                Err(e) if e.is_retryable() => {
                    warn!("Key generation attempt {attempt} failed: {e}");
                    unused = Some(pre_params);
                    self.pause(attempt, deadline, "key generation").await?;
                    attempt += 1;
                }
                Err(e) => {
                    error!("Key generation failed: {e}");
                    return Err(e);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn key_generation_attempt(
        &self,
        keep_id: &KeepId,
        members: &[MemberId],
        threshold: usize,
        pre_params: &mut PreParamsBox,
        channel: &BroadcastChannel,
        attempt: u32,
        deadline: Instant,
    ) -> Result<ThresholdSigner> {
        let mut receiver = channel.receiver().await?;
        let tag = SessionTag::new(SessionKind::KeyGeneration, attempt);
        let remaining = deadline.saturating_duration_since(Instant::now());
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

        let remaining = deadline.saturating_duration_since(Instant::now());
        tss::generate_threshold_signer(
            keep_id,
            tag.session_id(keep_id),
            members,
            threshold,
            pre_params,
            channel,
            &mut receiver,
            self.client.key_generation_attempt_timeout().min(remaining),
        )
        .await
    }

    /// Submit the group key of `signer` and wait until the chain publishes
    /// it.
    ///
    /// Fails with [`InternalError::ConflictingPublicKey`] when the chain
    /// holds, publishes or reports a different key; the keep is then left
    /// alone.
    #[instrument(skip_all, fields(keep_id = %signer.keep_id()), err(Debug))]
    pub async fn publish_public_key(&self, signer: &ThresholdSigner) -> Result<()> {
        let keep_id = signer.keep_id();
        let public_key = signer.public_key_bytes();
        let conflict = || InternalError::ConflictingPublicKey(keep_id.to_string());

        let mut published = self.chain.on_public_key_published(keep_id).await?;
        let mut conflicts = self.chain.on_conflicting_public_key_submitted(keep_id).await?;
        let on_chain = self.chain.get_public_key(keep_id).await?;
        if on_chain == public_key {
            info!("Public key is already published");
            return Ok(());
        }
        if !on_chain.is_empty() {
            error!("Keep published {} instead of our key", hex::encode(&on_chain));
            return Err(conflict());
        }

        let deadline = Instant::now() + self.client.key_generation_timeout();
        let chain = self.chain.as_ref();
        let submitted = &public_key;
        self.submit_with_retry("public key submission", deadline, move || {
            chain.submit_public_key(keep_id, submitted)
        })
        .await?;
        info!("Submitted public key {}", hex::encode(public_key));

        let outcome = tokio::time::timeout(self.tss.publication_timeout(), async {
            tokio::select! {
                event = published.recv() => {
                    let event = event
                        .ok_or_else(|| InternalError::Chain("publication subscription ended".into()))?;
                    if event.public_key != public_key {
                        error!("Keep published {} instead of our key", hex::encode(event.public_key));
                        return Err(conflict());
                    }
                    info!("Public key published");
                    Ok(())
                }
                event = conflicts.recv() => {
                    let event = event
                        .ok_or_else(|| InternalError::Chain("conflict subscription ended".into()))?;
                    error!(
                        "Member {} submitted conflicting key {}",
                        event.submitting_member,
                        hex::encode(event.conflicting_public_key)
                    );
                    Err(conflict())
                }
            }
        })
        .await;
        outcome.map_err(|_| {
            warn!("Public key of keep {keep_id} was not published in time");
            InternalError::Timeout("public key publication".into())
        })?
    }

    /// Sign `digest` with the other members and submit the signature, unless
    /// signing it already runs or the keep no longer waits for it.
    #[instrument(skip_all, fields(keep_id = %signer.keep_id(), digest = %hex::encode(digest)), err(Debug))]
    pub async fn sign_digest(&self, signer: &ThresholdSigner, digest: [u8; 32]) -> Result<()> {
        let keep_id = signer.keep_id();
        if !self
            .dedup
            .sign_if_allowed(keep_id, &digest, self.chain.as_ref())
            .await?
        {
            return Ok(());
        }
        let _claim = SigningClaim {
            dedup: &self.dedup,
            keep_id,
            digest,
        };

        let deadline = Instant::now() + self.client.signing_timeout();
        let channel = self.channel(keep_id, signer.group_member_ids());
        let mut attempt = 0;
        loop {
            if !self.chain.is_awaiting_signature(keep_id, &digest).await? {
                info!("Keep no longer awaits this signature");
                return Ok(());
            }
            match self.signing_attempt(signer, digest, &channel, attempt, deadline).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!("Signing attempt {attempt} failed: {e}");
                    self.pause(attempt, deadline, "signing").await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn signing_attempt(
        &self,
        signer: &ThresholdSigner,
        digest: [u8; 32],
        channel: &BroadcastChannel,
        attempt: u32,
        deadline: Instant,
    ) -> Result<()> {
        let keep_id = signer.keep_id();
        let required = signer.threshold() + 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt_timeout = self.client.signing_attempt_timeout().min(remaining);

        let mut receiver = channel.receiver().await?;
        let tag = SessionTag::new(SessionKind::Signing(digest), attempt);
        let mut present = announce_presence(
            channel,
            &mut receiver,
            keep_id,
            tag,
            signer.group_member_ids(),
            self.tss.ready_timeout().min(attempt_timeout),
        )
        .await?;
        if present.len() < required {
            return Err(InternalError::InsufficientMembers {
                present: present.len(),
                required,
            });
        }
        present.sort();
        present.truncate(required);
        let subset = present;

        if !subset.contains(self.member_id()) {
            info!("Not selected for signing; waiting for the signature");
            return self.await_submission(keep_id, digest, attempt_timeout).await;
        }

        let signature = tss::calculate_signature(
            signer,
            tag.session_id(keep_id),
            digest,
            &subset,
            channel,
            &mut receiver,
            attempt_timeout,
        )
        .await?;
        self.submit_signature(keep_id, digest, &signature, deadline)
            .await
    }

    /// Wait at most `timeout` for another member to submit the signature
    /// over `digest`.
    async fn await_submission(
        &self,
        keep_id: &KeepId,
        digest: [u8; 32],
        timeout: Duration,
    ) -> Result<()> {
        let mut submitted = self.chain.on_signature_submitted(keep_id).await?;
        if !self.chain.is_awaiting_signature(keep_id, &digest).await? {
            return Ok(());
        }
        tokio::time::timeout(timeout, async {
            loop {
                match submitted.recv().await {
                    Some(event) if event.digest == digest => return Ok(()),
                    Some(_) => continue,
                    None => {
                        return Err(InternalError::Chain(
                            "signature subscription ended".into(),
                        ))
                    }
                }
            }
        })
        .await
        .map_err(|_| InternalError::Timeout("signature submission".into()))?
    }

    async fn submit_signature(
        &self,
        keep_id: &KeepId,
        digest: [u8; 32],
        signature: &Signature,
        deadline: Instant,
    ) -> Result<()> {
        let chain = self.chain.as_ref();
        let signature = *signature;
        self.submit_with_retry("signature submission", deadline, move || async move {
            // Another member of the subset may have been faster.
            if !chain.is_awaiting_signature(keep_id, &digest).await? {
                return Ok(());
            }
            chain.submit_signature(keep_id, &signature).await
        })
        .await?;
        info!(
            "Submitted signature r={} s={} v={}",
            hex::encode(signature.r),
            hex::encode(signature.s),
            signature.recovery_id
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        chain::local::LocalChain,
        net::local::LocalProvider,
        persistence::EncryptedPersistence,
        pre_params::tests::{test_config, TestPoolGenerator},
        tss::tests::operators,
    };
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;
    use test_log::test;
    use tokio_util::sync::CancellationToken;

    /// Coordinators of several operators sharing one chain and transport.
    pub(crate) struct Cluster {
        pub(crate) chain: LocalChain,
        pub(crate) provider: Arc<dyn Provider>,
        pub(crate) keys: Vec<Arc<OperatorKey>>,
        pub(crate) members: Vec<MemberId>,
        pub(crate) nodes: Vec<Arc<Node>>,
        pub(crate) registries: Vec<Arc<KeepRegistry>>,
        pub(crate) _dirs: Vec<TempDir>,
        pub(crate) cancel: CancellationToken,
    }

    pub(crate) fn test_client_config() -> ClientConfig {
        ClientConfig {
            key_generation_timeout_secs: 120,
            key_generation_attempt_timeout_secs: 60,
            signing_timeout_secs: 120,
            signing_attempt_timeout_secs: 60,
            ..Default::default()
        }
    }

    pub(crate) fn test_tss_config() -> TssConfig {
        TssConfig {
            ready_timeout_secs: 10,
            retry_backoff_millis: 10,
            max_backoff_secs: 1,
            publication_timeout_secs: 30,
        }
    }

    impl Cluster {
        pub(crate) fn new(size: usize) -> Self {
            Self::with_config(size, test_client_config(), test_tss_config())
        }

        pub(crate) fn with_config(size: usize, client: ClientConfig, tss: TssConfig) -> Self {
            let (keys, members) = operators(size);
            let provider: Arc<dyn Provider> = Arc::new(LocalProvider::new());
            let chain = LocalChain::new(members[0].clone());
            let cancel = CancellationToken::new();
            let mut nodes = Vec::new();
            let mut registries = Vec::new();
            let mut dirs = Vec::new();
            for (index, key) in keys.iter().enumerate() {
                let dir = tempfile::tempdir().unwrap();
                let registry = Arc::new(KeepRegistry::new(
                    EncryptedPersistence::open(dir.path(), "password").unwrap(),
                ));
                let pool = PreParamsPool::start(
                    &test_config(1),
                    Arc::new(TestPoolGenerator::starting_at(index)),
                    cancel.clone(),
                );
                nodes.push(Arc::new(Node::new(
                    Arc::new(chain.connect(key.member_id().clone())),
                    provider.clone(),
                    key.clone(),
                    registry.clone(),
                    Arc::new(Deduplicator::new(registry.clone())),
                    Arc::new(pool),
                    client.clone(),
                    tss.clone(),
                )));
                registries.push(registry);
                dirs.push(dir);
            }
            Self {
                chain,
                provider,
                keys,
                members,
                nodes,
                registries,
                _dirs: dirs,
                cancel,
            }
        }

        /// Open a keep and run key generation on every node.
        pub(crate) async fn generate(
            &self,
            keep_id: &KeepId,
            honest_threshold: usize,
        ) -> Result<Vec<ThresholdSigner>> {
            let _ = self
                .chain
                .open_keep(keep_id, self.members.clone(), honest_threshold);
            let tasks: Vec<_> = self
                .nodes
                .iter()
                .map(|node| {
                    let node = node.clone();
                    let keep_id = keep_id.clone();
                    let members = self.members.clone();
                    tokio::spawn(async move {
                        node.generate_signer_for_keep(&keep_id, &members, honest_threshold)
                            .await
                    })
                })
                .collect();
            let mut signers = Vec::new();
            for task in tasks {
                let signer = task
                    .await
                    .map_err(|_| InternalError::InternalInvariantFailed)??
                    .ok_or(InternalError::InternalInvariantFailed)?;
                signers.push(signer);
            }
            Ok(signers)
        }

        /// Publish every signer's key.
        pub(crate) async fn publish(&self, signers: &[ThresholdSigner]) -> Result<()> {
            let tasks: Vec<_> = self
                .nodes
                .iter()
                .zip(signers)
                .map(|(node, signer)| {
                    let node = node.clone();
                    let signer = signer.clone();
                    tokio::spawn(async move { node.publish_public_key(&signer).await })
                })
                .collect();
            for task in tasks {
                task.await
                    .map_err(|_| InternalError::InternalInvariantFailed)??;
            }
            Ok(())
        }
    }

    impl Drop for Cluster {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        let first = backoff(0, base, max);
        assert!(first >= base && first <= base * 3 / 2);
        let third = backoff(2, base, max);
        assert!(third >= base * 4 && third <= base * 6);
        let late = backoff(30, base, max);
        assert!(late >= max && late <= max * 3 / 2);
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn keep_generates_publishes_and_signs() -> Result<()> {
        let cluster = Cluster::new(3);
        let keep = KeepId::new("0xkeep");
        let signers = cluster.generate(&keep, 2).await?;
        for (registry, signer) in cluster.registries.iter().zip(&signers) {
            assert_eq!(&registry.get_signer(&keep)?, signer);
            assert_eq!(signer.threshold(), 1);
        }

        cluster.publish(&signers).await?;
        assert_eq!(
            cluster.chain.get_public_key(&keep).await?,
            signers[0].public_key_bytes().to_vec()
        );

        let digest: [u8; 32] = Sha256::digest(b"keep signing").into();
        cluster.chain.request_signature(&keep, digest)?;
        let tasks: Vec<_> = cluster
            .nodes
            .iter()
            .zip(&signers)
            .map(|(node, signer)| {
                let node = node.clone();
                let signer = signer.clone();
                tokio::spawn(async move { node.sign_digest(&signer, digest).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap()?;
        }

        let accepted = cluster.chain.accepted_signatures(&keep)?;
        assert_eq!(accepted.len(), 1);
        let (_, signature) = &accepted[0];
        assert!(signature.recovery_id <= 1);
        assert_eq!(
            signature.recover_public_key(&digest)?,
            signers[0].group_public_key()?
        );
        assert!(!cluster.chain.is_awaiting_signature(&keep, &digest).await?);
        Ok(())
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn signing_is_skipped_when_nothing_is_awaited() -> Result<()> {
        let cluster = Cluster::new(2);
        let keep = KeepId::new("0xkeep");
        let signers = cluster.generate(&keep, 2).await?;
        cluster.publish(&signers).await?;

        // No request: returns at once without joining any session.
        tokio::time::timeout(
            Duration::from_secs(1),
            cluster.nodes[0].sign_digest(&signers[0], [7; 32]),
        )
        .await
        .unwrap()?;
        assert!(cluster.chain.accepted_signatures(&keep)?.is_empty());
        Ok(())
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn second_generation_is_suppressed() -> Result<()> {
        let cluster = Cluster::new(2);
        let keep = KeepId::new("0xkeep");
        let _ = cluster.generate(&keep, 1).await?;
        let again = cluster.nodes[0]
            .generate_signer_for_keep(&keep, &cluster.members, 1)
            .await?;
        assert!(again.is_none());
        Ok(())
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn conflicting_key_halts_publication() -> Result<()> {
        let cluster = Cluster::new(2);
        let keep = KeepId::new("0xkeep");
        let signers = cluster.generate(&keep, 2).await?;

        let mut forged = signers[1].public_key_bytes();
        forged[0] ^= 1;
        cluster
            .chain
            .connect(cluster.members[1].clone())
            .submit_public_key(&keep, &forged)
            .await?;

        let result = cluster.nodes[0].publish_public_key(&signers[0]).await;
        assert_eq!(
            result.unwrap_err(),
            InternalError::ConflictingPublicKey(keep.to_string())
        );
        Ok(())
    }

    #[test(tokio::test)]
    async fn invalid_threshold_is_rejected() {
        let cluster = Cluster::new(2);
        let keep = KeepId::new("0xkeep");
        for honest_threshold in [0, 3] {
            assert!(matches!(
                cluster.nodes[0]
                    .generate_signer_for_keep(&keep, &cluster.members, honest_threshold)
                    .await,
                Err(InternalError::InvalidArgument(_))
            ));
        }
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn transient_submission_failures_are_retried() -> Result<()> {
        let cluster = Cluster::new(2);
        let keep = KeepId::new("0xkeep");
        let signers = cluster.generate(&keep, 2).await?;
        cluster.chain.fail_next_transactions(2);
        cluster.publish(&signers).await?;
        assert_eq!(cluster.chain.public_key_submissions(&keep), 2);
        Ok(())
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn unpublished_key_times_out() -> Result<()> {
        let cluster = Cluster::with_config(
            2,
            test_client_config(),
            TssConfig {
                publication_timeout_secs: 1,
                ..test_tss_config()
            },
        );
        let keep = KeepId::new("0xkeep");
        let signers = cluster.generate(&keep, 2).await?;

        // The other member never submits, so the keep never publishes.
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            cluster.nodes[0].publish_public_key(&signers[0]),
        )
        .await
        .unwrap();
        assert_eq!(
            result.unwrap_err(),
            InternalError::Timeout("public key publication".into())
        );
        assert_eq!(cluster.chain.public_key_submissions(&keep), 1);
        assert!(cluster.chain.get_public_key(&keep).await?.is_empty());
        Ok(())
    }
}
