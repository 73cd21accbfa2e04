//! REST client for an esplora-compatible block explorer.
//!
//! All calls carry per-request deadlines from configuration and a bounded
//! internal retry for transport faults; anything the retry loop cannot
//! absorb is surfaced as a classified [`ExplorerError`] for the caller's
//! own retry policy. Broadcasts try the primary endpoint first and fall
//! back to the secondary.

use std::time::Duration;

use bitcoin::{blockdata::constants::genesis_block, Network, Txid};
use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tracing::*;

use crate::{
    config::{Config, Profile},
    error::{ConfigError, ExplorerError},
};

use super::{
    types::{AddressStats, TxInfo, Utxo},
    Broadcaster, ChainReader,
};

/// This is an alias for the result type returned by the [`ExplorerClient`].
pub type ExplorerResult<T> = Result<T, ExplorerError>;

/// The maximum number of attempts for a transport-level fault.
const MAX_ATTEMPTS: u32 = 3;

/// Interval between attempts.
const RETRY_INTERVAL_MS: u64 = 1_000;

/// An `async` client for the explorer's REST surface.
#[derive(Clone, Debug)]
pub struct ExplorerClient {
    http: HttpClient,
    /// Primary REST endpoint (mempool-style API).
    primary: String,
    /// Secondary REST endpoint used when the primary fails a broadcast.
    secondary: String,
    broadcast_timeout: Duration,
    network: Network,
    require_network_match: bool,
}

impl ExplorerClient {
    pub fn new(config: &Config) -> ExplorerResult<Self> {
        let http = HttpClient::builder()
            .timeout(config.api_request_timeout)
            .build()
            .map_err(|e| ExplorerError::Other(format!("could not create http client: {e}")))?;
        Ok(ExplorerClient {
            http,
            primary: config.mempool_api.trim_end_matches('/').to_owned(),
            secondary: config.blockstream_api.trim_end_matches('/').to_owned(),
            broadcast_timeout: config.broadcast_timeout,
            network: config.network,
            require_network_match: config.profile == Profile::Production,
        })
    }

    /// Verifies at startup that the explorer serves the configured chain.
    ///
    /// In production mode a mismatch is fatal: it is the guard against
    /// signing mainnet funds against a testnet index. Outside production a
    /// mismatch is logged and tolerated (local explorers often report
    /// regtest genesis).
    pub async fn assert_network(&self) -> Result<(), ConfigError> {
        let genesis = match self.get_text(format!("{}/block-height/0", self.primary)).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!(error = %e, "could not fetch genesis block for network check");
                return Ok(());
            }
        };
        let expected = genesis_block(self.network).block_hash().to_string();
        if genesis.trim() != expected {
            let actual = [
                Network::Bitcoin,
                Network::Testnet,
                Network::Signet,
                Network::Regtest,
            ]
            .into_iter()
            .find(|n| genesis_block(*n).block_hash().to_string() == genesis.trim())
            .unwrap_or(Network::Regtest);
            if self.require_network_match {
                return Err(ConfigError::NetworkMismatch {
                    expected: self.network,
                    actual,
                });
            }
            warn!(
                configured = %self.network,
                genesis = %genesis.trim(),
                "explorer genesis does not match configured network"
            );
        }
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> ExplorerResult<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            trace!(%url, %attempt, "explorer GET");
            let result = async {
                let resp = self.http.get(&url).send().await?;
                let resp = check_status(resp).await?;
                resp.json::<T>()
                    .await
                    .map_err(|e| ExplorerError::MalformedResponse(e.to_string()))
            }
            .await;

            match result {
                Ok(value) => return Ok(value),
                Err(e) if transport_fault(&e) && attempt < MAX_ATTEMPTS => {
                    warn!(error = %e, %url, "explorer request failed, retrying");
                    sleep(Duration::from_millis(RETRY_INTERVAL_MS)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_text(&self, url: String) -> ExplorerResult<String> {
        let resp = self.http.get(&url).send().await?;
        let resp = check_status(resp).await?;
        resp.text()
            .await
            .map_err(|e| ExplorerError::MalformedResponse(e.to_string()))
    }

    async fn broadcast_via(&self, endpoint: &str, raw_hex: &str) -> ExplorerResult<Txid> {
        let resp = self
            .http
            .post(format!("{endpoint}/tx"))
            .timeout(self.broadcast_timeout)
            .body(raw_hex.to_owned())
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let text = resp
            .text()
            .await
            .map_err(|e| ExplorerError::MalformedResponse(e.to_string()))?;
        text.trim()
            .parse()
            .map_err(|_| ExplorerError::MalformedResponse(format!("bad broadcast ack: {text}")))
    }
}

impl ChainReader for ExplorerClient {
    async fn tx_details(&self, txid: &Txid) -> ExplorerResult<Option<TxInfo>> {
        match self.get_json(format!("{}/tx/{txid}", self.primary)).await {
            Ok(tx) => Ok(Some(tx)),
            Err(ExplorerError::Status(404, _)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn utxos_of(&self, address: &str) -> ExplorerResult<Vec<Utxo>> {
        self.get_json(format!("{}/address/{address}/utxo", self.primary))
            .await
    }

    async fn address_txs(&self, address: &str) -> ExplorerResult<Vec<TxInfo>> {
        self.get_json(format!("{}/address/{address}/txs", self.primary))
            .await
    }

    async fn address_stats(&self, address: &str) -> ExplorerResult<AddressStats> {
        self.get_json(format!("{}/address/{address}", self.primary))
            .await
    }

    async fn tip_height(&self) -> ExplorerResult<u32> {
        let text = self
            .get_text(format!("{}/blocks/tip/height", self.primary))
            .await?;
        text.trim()
            .parse()
            .map_err(|_| ExplorerError::MalformedResponse(format!("bad tip height: {text}")))
    }
}

impl Broadcaster for ExplorerClient {
    /// Tries the primary endpoint, then the secondary. The returned txid
    /// is the explorer's acknowledgement.
    async fn broadcast(&self, raw_hex: &str) -> ExplorerResult<Txid> {
        match self.broadcast_via(&self.primary, raw_hex).await {
            Ok(txid) => {
                debug!(%txid, "broadcast accepted by primary endpoint");
                Ok(txid)
            }
            Err(primary_err) => {
                warn!(error = %primary_err, "primary broadcast failed, trying secondary");
                match self.broadcast_via(&self.secondary, raw_hex).await {
                    Ok(txid) => {
                        debug!(%txid, "broadcast accepted by secondary endpoint");
                        Ok(txid)
                    }
                    Err(secondary_err) => {
                        error!(
                            primary = %primary_err,
                            secondary = %secondary_err,
                            "both broadcast endpoints failed"
                        );
                        // Transport faults and 5xx stay retryable; an
                        // explicit rejection from both endpoints is
                        // structural.
                        if primary_err.is_retryable() || secondary_err.is_retryable() {
                            Err(secondary_err)
                        } else {
                            Err(ExplorerError::BroadcastRejected(secondary_err.to_string()))
                        }
                    }
                }
            }
        }
    }
}

async fn check_status(resp: reqwest::Response) -> ExplorerResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let reason = resp
        .text()
        .await
        .unwrap_or_else(|_| status.canonical_reason().unwrap_or("unknown").to_owned());
    Err(ExplorerError::Status(status.as_u16(), reason))
}

/// Faults worth re-sending the same request for.
fn transport_fault(e: &ExplorerError) -> bool {
    matches!(
        e,
        ExplorerError::Connection(_) | ExplorerError::Timeout | ExplorerError::MalformedResponse(_)
    )
}
