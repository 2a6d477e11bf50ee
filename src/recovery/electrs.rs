// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Access to the Bitcoin network through an Electrs (Esplora) HTTP API.

use crate::errors::{InternalError, Result};
use async_trait::async_trait;
use bitcoin::Address;
use std::{collections::HashMap, time::Duration};
use tracing::{debug, instrument};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// What liquidation recovery needs from the Bitcoin network.
#[async_trait]
pub trait BitcoinConnection: Send + Sync {
    /// Relay a signed transaction given as hex.
    async fn broadcast(&self, transaction_hex: &str) -> Result<()>;

    /// Fee rate (satoshi per vbyte) to confirm within `blocks` blocks, if
    /// the relay has an estimate.
    async fn fee_estimate(&self, blocks: u32) -> Result<Option<f64>>;

    /// Whether no transaction ever involved `address`.
    async fn is_address_unused(&self, address: &Address) -> Result<bool>;
}

/// An Electrs HTTP client.
#[derive(Debug, Clone)]
pub struct ElectrsConnection {
    client: reqwest::Client,
    base_url: String,
}

fn electrs_error(e: reqwest::Error) -> InternalError {
    InternalError::Electrs(e.to_string())
}

impl ElectrsConnection {
    /// A client of the API at `base_url`.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(electrs_error)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

#[async_trait]
impl BitcoinConnection for ElectrsConnection {
    #[instrument(skip_all, err(Debug))]
    async fn broadcast(&self, transaction_hex: &str) -> Result<()> {
        let txid = self
            .client
            .post(self.url("tx"))
            .body(transaction_hex.to_string())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(electrs_error)?
            .text()
            .await
            .map_err(electrs_error)?;
        debug!("Relay accepted transaction {txid}");
        Ok(())
    }

    async fn fee_estimate(&self, blocks: u32) -> Result<Option<f64>> {
        let estimates: HashMap<String, f64> = self
            .client
            .get(self.url("fee-estimates"))
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(electrs_error)?
            .json()
            .await
            .map_err(electrs_error)?;
        Ok(estimates.get(&blocks.to_string()).copied())
    }

    async fn is_address_unused(&self, address: &Address) -> Result<bool> {
        let transactions: Vec<serde_json::Value> = self
            .client
            .get(self.url(&format!("address/{address}/txs")))
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(electrs_error)?
            .json()
            .await
            .map_err(electrs_error)?;
        Ok(transactions.is_empty())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicUsize, Ordering},
    };
    use test_log::test;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::oneshot,
    };

    /// An in-memory relay.
    #[derive(Default)]
    pub(crate) struct MockBitcoin {
        used: Mutex<HashSet<String>>,
        broadcasts: Mutex<Vec<String>>,
        failing_broadcasts: AtomicUsize,
        fee: Mutex<Option<f64>>,
    }

    impl MockBitcoin {
        pub(crate) fn mark_used(&self, address: &str) {
            let _ = self.used.lock().insert(address.to_string());
        }

        pub(crate) fn set_fee_estimate(&self, fee: Option<f64>) {
            *self.fee.lock() = fee;
        }

        pub(crate) fn fail_next_broadcasts(&self, count: usize) {
            self.failing_broadcasts.store(count, Ordering::SeqCst);
        }

        pub(crate) fn broadcasts(&self) -> Vec<String> {
            self.broadcasts.lock().clone()
        }
    }

    #[async_trait]
    impl BitcoinConnection for MockBitcoin {
        async fn broadcast(&self, transaction_hex: &str) -> Result<()> {
            let failing = self
                .failing_broadcasts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(InternalError::Electrs("relay unavailable".into()));
            }
            self.broadcasts.lock().push(transaction_hex.to_string());
            Ok(())
        }

        async fn fee_estimate(&self, _blocks: u32) -> Result<Option<f64>> {
            Ok(*self.fee.lock())
        }

        async fn is_address_unused(&self, address: &Address) -> Result<bool> {
            Ok(!self.used.lock().contains(&address.to_string()))
        }
    }

    /// Answer a single HTTP request with `body`; yields the request line.
    async fn serve_once(status: u16, body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let (sender, receiver) = oneshot::channel();
        let _handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = vec![0u8; 8192];
            let read = stream.read(&mut buffer).await.unwrap();
            let request = String::from_utf8_lossy(&buffer[..read]).to_string();
            let _ = sender.send(request.lines().next().unwrap_or_default().to_string());
            let response = format!(
                "HTTP/1.1 {status} Status\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
        });
        (url, receiver)
    }

    #[test(tokio::test)]
    async fn fee_estimates_are_read_by_target() -> Result<()> {
        let (url, request) = serve_once(200, r#"{"1": 87.9, "6": 12.5, "144": 1.0}"#).await;
        let electrs = ElectrsConnection::new(&url)?;
        assert_eq!(electrs.fee_estimate(6).await?, Some(12.5));
        assert_eq!(request.await.unwrap(), "GET /fee-estimates HTTP/1.1");
        Ok(())
    }

    #[test(tokio::test)]
    async fn address_history_decides_usage() -> Result<()> {
        let address = Address::p2pkh(
            <bitcoin::PubkeyHash as bitcoin::hashes::Hash>::all_zeros(),
            bitcoin::Network::Bitcoin,
        );
        let (url, request) = serve_once(200, "[]").await;
        assert!(ElectrsConnection::new(&url)?.is_address_unused(&address).await?);
        assert_eq!(
            request.await.unwrap(),
            format!("GET /address/{address}/txs HTTP/1.1")
        );

        let (url, _) = serve_once(200, r#"[{"txid": "00"}]"#).await;
        assert!(!ElectrsConnection::new(&url)?.is_address_unused(&address).await?);
        Ok(())
    }

    #[test(tokio::test)]
    async fn rejected_broadcast_is_an_error() -> Result<()> {
        let (url, request) = serve_once(400, "bad-txns-inputs-missingorspent").await;
        let result = ElectrsConnection::new(&url)?.broadcast("0100").await;
        assert!(matches!(result, Err(InternalError::Electrs(_))));
        assert_eq!(request.await.unwrap(), "POST /tx HTTP/1.1");
        Ok(())
    }
}
