// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Single-use Paillier pre-parameters and the background pool producing them.
//!
//! Safe prime generation takes minutes, so a pool keeps a number of
//! [`PreParams`] ready. Every key generation attempt takes a fresh
//! [`PreParamsBox`] and destroys it as soon as the Paillier modulus has been
//! shared with peers.

use crate::{
    config::PreParamsConfig,
    errors::{InternalError, Result},
    paillier::DecryptionKey,
    parameters::PRIME_BITS,
};
use libpaillier::unknown_order::BigNumber;
use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Size of each safe prime; the Paillier modulus has twice as many bits.
pub const SAFE_PRIME_BITS: usize = PRIME_BITS;

/// Paillier safe primes for one key generation.
#[derive(Clone, PartialEq, Eq)]
pub struct PreParams {
    p: BigNumber,
    q: BigNumber,
}

impl Debug for PreParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreParams")
            .field("p", &"[redacted]")
            .field("q", &"[redacted]")
            .finish()
    }
}

impl PreParams {
    pub(crate) fn new(p: BigNumber, q: BigNumber) -> Result<Self> {
        let params = Self { p, q };
        let _ = params.decryption_key()?;
        Ok(params)
    }

    pub(crate) fn decryption_key(&self) -> Result<DecryptionKey> {
        Ok(DecryptionKey::from_primes(&self.p, &self.q)?)
    }
}

/// A consumable container for one [`PreParams`].
///
/// Once [`PreParamsBox::destroy`] has been called, [`PreParamsBox::content`]
/// fails.
#[derive(Debug)]
pub struct PreParamsBox {
    content: Option<PreParams>,
}

impl PreParamsBox {
    /// Wrap fresh pre-parameters.
    pub fn new(params: PreParams) -> Self {
        Self {
            content: Some(params),
        }
    }

    /// The pre-parameters, unless they were already destroyed.
    pub fn content(&self) -> Result<&PreParams> {
        self.content.as_ref().ok_or(InternalError::PreParamsConsumed)
    }

    /// Drop the pre-parameters for good.
    pub fn destroy(&mut self) {
        self.content = None;
    }

    /// Whether the box was destroyed.
    pub fn is_consumed(&self) -> bool {
        self.content.is_none()
    }
}

/// Source of fresh pre-parameters. Runs on a blocking worker.
pub trait PreParamsGenerator: Send + Sync + 'static {
    /// Produce pre-parameters, or `None` if `deadline` passed first.
    fn generate(&self, deadline: Instant) -> Option<PreParams>;
}

/// Generates pre-parameters from two fresh safe primes.
#[derive(Debug, Clone)]
pub struct SafePrimeGenerator {
    bits: usize,
}

impl Default for SafePrimeGenerator {
    fn default() -> Self {
        Self {
            bits: SAFE_PRIME_BITS,
        }
    }
}

impl SafePrimeGenerator {
    /// One safe prime, unless `deadline` already passed. A search that has
    /// started runs to completion.
    fn safe_prime(&self, deadline: Instant) -> Option<BigNumber> {
        if Instant::now() >= deadline {
            return None;
        }
        Some(BigNumber::safe_prime(self.bits))
    }
}

impl PreParamsGenerator for SafePrimeGenerator {
    fn generate(&self, deadline: Instant) -> Option<PreParams> {
        let p = self.safe_prime(deadline)?;
        loop {
            let q = self.safe_prime(deadline)?;
            if q != p {
                return PreParams::new(p, q).ok();
            }
        }
    }
}

/// A pool of pre-parameters, topped up by a background task.
#[derive(Debug)]
pub struct PreParamsPool {
    receiver: Mutex<mpsc::Receiver<PreParams>>,
    size: Arc<AtomicUsize>,
}

impl PreParamsPool {
    /// Start filling a pool up to the configured target. The filler stops
    /// when `cancel` fires.
    pub fn start(
        config: &PreParamsConfig,
        generator: Arc<dyn PreParamsGenerator>,
        cancel: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.target_pool_size.max(1));
        let size = Arc::new(AtomicUsize::new(0));
        let _handle = tokio::spawn(fill(
            config.clone(),
            generator,
            sender,
            size.clone(),
            cancel,
        ));
        Self {
            receiver: Mutex::new(receiver),
            size,
        }
    }

    /// Take one box from the pool, waiting for the filler if it is empty.
    #[instrument(skip_all, err(Debug))]
    pub async fn get(&self) -> Result<PreParamsBox> {
        let mut receiver = self.receiver.lock().await;
        let params = receiver.recv().await.ok_or(InternalError::Cancelled)?;
        let _ = self.size.fetch_sub(1, Ordering::SeqCst);
        Ok(PreParamsBox::new(params))
    }

    /// Number of pre-parameters currently ready.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }
}

async fn fill(
    config: PreParamsConfig,
    generator: Arc<dyn PreParamsGenerator>,
    sender: mpsc::Sender<PreParams>,
    size: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return,
            permit = sender.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let started = Instant::now();
        let deadline = started + config.generation_timeout();
        let worker = generator.clone();
        let generated = tokio::select! {
            _ = cancel.cancelled() => return,
            generated = tokio::task::spawn_blocking(move || worker.generate(deadline)) => generated,
        };
        match generated {
            Ok(Some(params)) => {
                let current = size.fetch_add(1, Ordering::SeqCst) + 1;
                permit.send(params);
                info!(
                    "Generated pre-parameters in {:?}; pool size is {current}",
                    started.elapsed()
                );
            }
            Ok(None) => {
                warn!(
                    "Pre-parameters generation timed out after {:?}; retrying",
                    config.generation_timeout()
                );
                drop(permit);
            }
            Err(e) => {
                error!("Pre-parameters generation worker failed: {e}");
                drop(permit);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(config.generation_delay()) => {}
        }
    }
}
