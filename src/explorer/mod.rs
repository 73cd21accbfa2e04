//! I/O boundary to the public block explorer: REST client, live
//! WebSocket feed, and the trait seam the settlement pipeline is generic
//! over (so scenario tests can substitute a deterministic chain source).

pub mod client;
pub mod types;
pub mod ws;

pub use client::{ExplorerClient, ExplorerResult};
pub use ws::{MonitoredAddresses, WsClient};

use std::future::Future;

use bitcoin::Txid;

use types::{AddressStats, TxInfo, Utxo};

/// Read access to chain state as the explorer sees it.
///
/// # Note
///
/// This is a fully `async` trait in return-position-impl form, matching
/// how the pipeline awaits it from spawned tasks; every future must be
/// `Send`.
pub trait ChainReader {
    /// Full details of a transaction, or `None` when the explorer does
    /// not know the txid (yet).
    fn tx_details(&self, txid: &Txid)
        -> impl Future<Output = ExplorerResult<Option<TxInfo>>> + Send;

    /// Unspent outputs of an address.
    fn utxos_of(&self, address: &str) -> impl Future<Output = ExplorerResult<Vec<Utxo>>> + Send;

    /// Recent transactions touching an address (fallback polling path).
    fn address_txs(&self, address: &str)
        -> impl Future<Output = ExplorerResult<Vec<TxInfo>>> + Send;

    /// Funded/spent tallies for an address.
    fn address_stats(
        &self,
        address: &str,
    ) -> impl Future<Output = ExplorerResult<AddressStats>> + Send;

    /// Height of the current chain tip.
    fn tip_height(&self) -> impl Future<Output = ExplorerResult<u32>> + Send;
}

/// Ability to submit raw transactions to the network.
pub trait Broadcaster {
    /// Broadcasts serialized transaction hex and returns the accepted
    /// txid.
    fn broadcast(&self, raw_hex: &str) -> impl Future<Output = ExplorerResult<Txid>> + Send;
}
