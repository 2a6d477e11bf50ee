// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The durable registry of this operator's signers.
//!
//! Disk writes happen under the same lock as map updates, and always before
//! them, so what is on disk is a superset of what is in memory.

use crate::{
    chain::ChainHandle,
    errors::{InternalError, Result},
    persistence::EncryptedPersistence,
    protocol::KeepId,
    signer::ThresholdSigner,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{info, instrument, warn};

fn file_name(signer: &ThresholdSigner) -> String {
    format!("membership_{}", signer.member_index())
}

/// Signers by keep, backed by encrypted files.
#[derive(Debug)]
pub struct KeepRegistry {
    persistence: EncryptedPersistence,
    signers: Mutex<HashMap<KeepId, ThresholdSigner>>,
}

impl KeepRegistry {
    /// An empty registry on top of `persistence`; see
    /// [`KeepRegistry::load_existing`].
    pub fn new(persistence: EncryptedPersistence) -> Self {
        Self {
            persistence,
            signers: Mutex::new(HashMap::new()),
        }
    }

    /// Persist `signer`, then make it available.
    #[instrument(skip(self, signer), err(Debug))]
    pub fn register_signer(&self, keep_id: &KeepId, signer: &ThresholdSigner) -> Result<()> {
        let mut signers = self.signers.lock();
        self.persistence
            .save(keep_id.as_str(), &file_name(signer), &signer.marshal()?)?;
        let _ = signers.insert(keep_id.clone(), signer.clone());
        info!("Registered signer for keep {keep_id}");
        Ok(())
    }

    /// Whether a signer is registered for `keep_id`.
    pub fn has_signer(&self, keep_id: &KeepId) -> bool {
        self.signers.lock().contains_key(keep_id)
    }

    /// The signer registered for `keep_id`.
    pub fn get_signer(&self, keep_id: &KeepId) -> Result<ThresholdSigner> {
        self.signers
            .lock()
            .get(keep_id)
            .cloned()
            .ok_or_else(|| InternalError::SignerNotFound(keep_id.to_string()))
    }

    /// Keeps with a registered signer.
    pub fn keeps(&self) -> Vec<KeepId> {
        let mut keeps: Vec<_> = self.signers.lock().keys().cloned().collect();
        keeps.sort();
        keeps
    }

    /// Load every persisted signer. Signers of keeps the chain no longer
    /// reports active are archived instead.
    ///
    /// A record that does not decrypt or parse fails the whole load.
    #[instrument(skip_all, err(Debug))]
    pub async fn load_existing(&self, chain: &dyn ChainHandle) -> Result<()> {
        let mut loaded = Vec::new();
        for file in self.persistence.read_all()? {
            let signer = ThresholdSigner::unmarshal(&file.content).map_err(|_| {
                InternalError::Decryption(format!("{}/{}", file.directory, file.name))
            })?;
            if signer.keep_id().as_str() != file.directory {
                return Err(InternalError::Decryption(format!(
                    "{}/{} belongs to keep {}",
                    file.directory,
                    file.name,
                    signer.keep_id()
                )));
            }
            loaded.push(signer);
        }

        for signer in loaded {
            let keep_id = signer.keep_id().clone();
            if chain.is_active(&keep_id).await? {
                info!("Loaded signer for keep {keep_id}");
                let _ = self.signers.lock().insert(keep_id, signer);
            } else {
                warn!("Keep {keep_id} is no longer active; archiving its signer");
                self.persistence.archive(keep_id.as_str())?;
            }
        }
        Ok(())
    }

    /// Move the records of `keep_id` to the archive and forget the signer.
    #[instrument(skip(self), err(Debug))]
    pub fn archive(&self, keep_id: &KeepId) -> Result<()> {
        let mut signers = self.signers.lock();
        self.persistence.archive(keep_id.as_str())?;
        let _ = signers.remove(keep_id);
        Ok(())
    }

    /// Keep a copy of the signer of `keep_id` that survives archival.
    #[instrument(skip(self), err(Debug))]
    pub fn snapshot(&self, keep_id: &KeepId) -> Result<()> {
        let signers = self.signers.lock();
        let signer = signers
            .get(keep_id)
            .ok_or_else(|| InternalError::SignerNotFound(keep_id.to_string()))?;
        self.persistence
            .snapshot(keep_id.as_str(), &file_name(signer), &signer.marshal()?)
    }
}
