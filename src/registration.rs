// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Keeps this operator registered as a member candidate for every sanctioned
//! application, and its pool status current.

use crate::{
    chain::{ChainHandle, Subscription},
    errors::{InternalError, Result},
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Watch every sanctioned application until `cancel` fires.
pub async fn monitor_registrations(
    chain: Arc<dyn ChainHandle>,
    retry_delay: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    for application in chain.sanctioned_applications().await? {
        let _handle = tokio::spawn(monitor_application(
            chain.clone(),
            application,
            retry_delay,
            cancel.child_token(),
        ));
    }
    Ok(())
}

/// Run the registration cycle for `application`, restarting it from scratch
/// whenever a call or subscription fails.
#[instrument(skip(chain, cancel))]
async fn monitor_application(
    chain: Arc<dyn ChainHandle>,
    application: String,
    retry_delay: Duration,
    cancel: CancellationToken,
) {
    loop {
        match run_application(chain.as_ref(), &application, &cancel).await {
            Err(InternalError::Cancelled) => return,
            Err(e) => warn!("Registration monitoring failed: {e}; restarting"),
            Ok(()) => return,
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(retry_delay) => {}
        }
    }
}

async fn next_block(blocks: &mut Subscription<u64>, cancel: &CancellationToken) -> Result<u64> {
    tokio::select! {
        _ = cancel.cancelled() => Err(InternalError::Cancelled),
        block = blocks.recv() => block.ok_or_else(|| InternalError::Chain("block subscription ended".into())),
    }
}

async fn register(
    chain: &dyn ChainHandle,
    application: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut blocks = chain.on_new_block().await?;
    while !chain.is_eligible_for_application(application).await? {
        let _ = next_block(&mut blocks, cancel).await?;
    }
    info!("Operator is eligible; registering as member candidate");
    chain.register_as_member_candidate(application).await?;
    while !chain.is_registered_for_application(application).await? {
        let _ = next_block(&mut blocks, cancel).await?;
    }
    info!("Operator registered as member candidate");
    Ok(())
}

async fn run_application(
    chain: &dyn ChainHandle,
    application: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    if !chain.is_registered_for_application(application).await? {
        register(chain, application, cancel).await?;
    }

    let mut status_changes = chain.on_operator_status_changed().await?;
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Err(InternalError::Cancelled),
            event = status_changes.recv() => event
                .ok_or_else(|| InternalError::Chain("status subscription ended".into()))?,
        };
        if !chain.is_status_up_to_date_for_application(application).await? {
            info!("Pool status is outdated after {event:?}; updating");
            chain.update_status_for_application(application).await?;
        }
    }
}
