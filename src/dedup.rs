// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Collapses redundant deliveries of chain events, so each action runs at
//! most once at a time.

use crate::{chain::ChainHandle, errors::Result, protocol::KeepId, registry::KeepRegistry};
use parking_lot::Mutex;
use std::{collections::HashSet, sync::Arc};
use tracing::debug;

/// Test-and-set guards for key generation, signing and keep closure.
#[derive(Debug)]
pub struct Deduplicator {
    registry: Arc<KeepRegistry>,
    key_generation: Mutex<HashSet<KeepId>>,
    signing: Mutex<HashSet<(KeepId, [u8; 32])>>,
    closing: Mutex<HashSet<KeepId>>,
}

impl Deduplicator {
    /// Guards consulting `registry` for existing signers.
    pub fn new(registry: Arc<KeepRegistry>) -> Self {
        Self {
            registry,
            key_generation: Default::default(),
            signing: Default::default(),
            closing: Default::default(),
        }
    }

    /// Claim key generation for `keep_id`. Fails if it is already running
    /// or a signer already exists.
    pub fn generate_key_if_allowed(&self, keep_id: &KeepId) -> bool {
        let mut in_flight = self.key_generation.lock();
        if in_flight.contains(keep_id) || self.registry.has_signer(keep_id) {
            debug!("Key generation for {keep_id} is not allowed");
            return false;
        }
        in_flight.insert(keep_id.clone())
    }

    /// Release the key generation claim on `keep_id`.
    pub fn notify_key_generated(&self, keep_id: &KeepId) {
        let _ = self.key_generation.lock().remove(keep_id);
    }

    /// Claim signing of `digest` for `keep_id`. Fails if it is already
    /// running or the chain no longer waits for that signature; in the latter
    /// case nothing is claimed.
    pub async fn sign_if_allowed(
        &self,
        keep_id: &KeepId,
        digest: &[u8; 32],
        chain: &dyn ChainHandle,
    ) -> Result<bool> {
        let key = (keep_id.clone(), *digest);
        if self.signing.lock().contains(&key) {
            debug!("Signing {} for {keep_id} already runs", hex::encode(digest));
            return Ok(false);
        }
        if !chain.is_awaiting_signature(keep_id, digest).await? {
            debug!("Keep {keep_id} does not await {}", hex::encode(digest));
            return Ok(false);
        }
        // Checked again under the lock; another delivery may have won.
        Ok(self.signing.lock().insert(key))
    }

    /// Release the signing claim on `(keep_id, digest)`.
    pub fn notify_signing_completed(&self, keep_id: &KeepId, digest: &[u8; 32]) {
        let _ = self.signing.lock().remove(&(keep_id.clone(), *digest));
    }

    /// Claim closure handling of `keep_id`.
    pub fn close_keep_if_allowed(&self, keep_id: &KeepId) -> bool {
        self.closing.lock().insert(keep_id.clone())
    }

    /// Release the closure claim on `keep_id`.
    pub fn notify_closing_completed(&self, keep_id: &KeepId) {
        let _ = self.closing.lock().remove(keep_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::local::LocalChain, net::OperatorKey, persistence::EncryptedPersistence,
        signer::tests::signers,
    };
    use rand::rngs::OsRng;
    use test_log::test;

    fn deduplicator(root: &std::path::Path) -> (Deduplicator, Arc<KeepRegistry>) {
        let registry = Arc::new(KeepRegistry::new(
            EncryptedPersistence::open(root, "password").unwrap(),
        ));
        (Deduplicator::new(registry.clone()), registry)
    }

    #[test]
    fn key_generation_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let (dedup, registry) = deduplicator(dir.path());
        let signer = signers(2, 1).remove(0);
        let keep = signer.keep_id().clone();

        assert!(dedup.generate_key_if_allowed(&keep));
        assert!(!dedup.generate_key_if_allowed(&keep));
        dedup.notify_key_generated(&keep);
        dedup.notify_key_generated(&keep);
        assert!(dedup.generate_key_if_allowed(&keep));
        dedup.notify_key_generated(&keep);

        registry.register_signer(&keep, &signer).unwrap();
        assert!(!dedup.generate_key_if_allowed(&keep));
    }

    #[test(tokio::test)]
    async fn signing_requires_a_pending_request() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let (dedup, _) = deduplicator(dir.path());
        let operator = OperatorKey::random(&mut OsRng).member_id().clone();
        let chain = LocalChain::new(operator.clone());
        let keep = KeepId::new("0xkeep");
        let _ = chain.open_keep(&keep, vec![operator], 1);

        // Not awaiting: refused, and nothing is claimed.
        assert!(!dedup.sign_if_allowed(&keep, &[1; 32], &chain).await?);
        assert!(dedup.signing.lock().is_empty());
        Ok(())
    }

    #[test(tokio::test)]
    async fn signing_runs_once_per_digest() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let (dedup, _) = deduplicator(dir.path());
        let signer = signers(2, 1).remove(0);
        let keep = signer.keep_id().clone();
        let chain = LocalChain::new(signer.member_id().clone());
        let _ = chain.open_keep(&keep, signer.group_member_ids().to_vec(), 2);
        for member in signer.group_member_ids() {
            chain
                .connect(member.clone())
                .submit_public_key(&keep, &signer.public_key_bytes())
                .await?;
        }
        chain.request_signature(&keep, [1; 32])?;

        assert!(dedup.sign_if_allowed(&keep, &[1; 32], &chain).await?);
        assert!(!dedup.sign_if_allowed(&keep, &[1; 32], &chain).await?);
        dedup.notify_signing_completed(&keep, &[1; 32]);
        dedup.notify_signing_completed(&keep, &[1; 32]);
        assert!(dedup.sign_if_allowed(&keep, &[1; 32], &chain).await?);
        Ok(())
    }

    #[test]
    fn closing_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let (dedup, _) = deduplicator(dir.path());
        let keep = KeepId::new("0xkeep");
        assert!(dedup.close_keep_if_allowed(&keep));
        assert!(!dedup.close_keep_if_allowed(&keep));
        dedup.notify_closing_completed(&keep);
        assert!(dedup.close_keep_if_allowed(&keep));
    }
}
