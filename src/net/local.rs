// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! An in-process [`Provider`] connecting every client sharing one instance.

use crate::{
    errors::Result,
    net::{Envelope, Provider},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc;
use tracing::trace;

/// Routes envelopes between subscribers of the same topic in memory.
#[derive(Debug, Clone, Default)]
pub struct LocalProvider {
    subscribers: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Envelope>>>>>,
}

impl LocalProvider {
    /// A provider with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Provider for LocalProvider {
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        let mut subscribers = self.subscribers.lock();
        if let Some(topic) = subscribers.get_mut(envelope.topic()) {
            // Dropped receivers are pruned as we go.
            topic.retain(|subscriber| subscriber.send(envelope.clone()).is_ok());
            trace!(
                "Delivered envelope from {} to {} subscribers",
                envelope.sender(),
                topic.len()
            );
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<Envelope>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(sender);
        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        net::{NetMessage, OperatorKey, SignerReady},
        protocol::KeepId,
    };
    use rand::rngs::OsRng;
    use test_log::test;

    #[test(tokio::test)]
    async fn envelopes_reach_every_subscriber_of_the_topic() -> Result<()> {
        let provider = LocalProvider::new();
        let key = OperatorKey::random(&mut OsRng);
        let message = NetMessage::Ready(SignerReady {
            keep_id: KeepId::new("0xkeep"),
            member_id: key.member_id().clone(),
            tag: "dkg".into(),
        });

        let mut first = provider.subscribe("keep/a").await?;
        let mut second = provider.subscribe("keep/a").await?;
        let mut other = provider.subscribe("keep/b").await?;
        let dropped = provider.subscribe("keep/a").await?;
        drop(dropped);

        provider
            .publish(Envelope::seal(&key, "keep/a", &message)?)
            .await?;
        assert_eq!(first.recv().await.unwrap().topic(), "keep/a");
        assert_eq!(second.recv().await.unwrap().topic(), "keep/a");
        assert!(other.try_recv().is_err());
        assert_eq!(provider.subscribers.lock()["keep/a"].len(), 2);
        Ok(())
    }
}
