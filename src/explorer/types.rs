//! Wire shapes returned by the explorer's REST surface.
//!
//! These mirror the esplora address/tx/utxo endpoints, reduced to the
//! fields the settlement pipeline consumes.

use bitcoin::{BlockHash, Txid};
use serde::{Deserialize, Serialize};

/// Confirmation status attached to transactions and UTXOs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TxStatus {
    pub confirmed: bool,
    pub block_height: Option<u32>,
    pub block_hash: Option<BlockHash>,
    pub block_time: Option<u64>,
}

impl TxStatus {
    /// Confirmation count relative to the current tip; zero while the
    /// transaction sits in the mempool.
    pub fn confirmations(&self, tip_height: u32) -> u32 {
        match (self.confirmed, self.block_height) {
            (true, Some(height)) if tip_height >= height => tip_height - height + 1,
            (true, Some(_)) | (true, None) => 1,
            (false, _) => 0,
        }
    }
}

/// The previous output an input spends, carrying the sender address.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PrevOut {
    pub value: u64,
    #[serde(default)]
    pub scriptpubkey_address: Option<String>,
}

/// A transaction input as the explorer reports it.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Vin {
    pub txid: Txid,
    pub vout: u32,
    #[serde(default)]
    pub prevout: Option<PrevOut>,
}

/// A transaction output as the explorer reports it.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Vout {
    pub value: u64,
    #[serde(default)]
    pub scriptpubkey_address: Option<String>,
}

/// A transaction in the explorer's JSON format.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TxInfo {
    pub txid: Txid,
    #[serde(default)]
    pub vin: Vec<Vin>,
    #[serde(default)]
    pub vout: Vec<Vout>,
    #[serde(default)]
    pub status: TxStatus,
    #[serde(default)]
    pub fee: u64,
}

impl TxInfo {
    /// Total value this transaction pays to `address`.
    pub fn value_to(&self, address: &str) -> u64 {
        self.vout
            .iter()
            .filter(|out| out.scriptpubkey_address.as_deref() == Some(address))
            .map(|out| out.value)
            .sum()
    }

    /// Sender attribution: the address behind the first input, when the
    /// explorer exposes it.
    pub fn first_input_address(&self) -> Option<String> {
        self.vin
            .first()
            .and_then(|vin| vin.prevout.as_ref())
            .and_then(|prev| prev.scriptpubkey_address.clone())
    }
}

/// An unspent output of a vault address.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    pub value: u64,
    #[serde(default)]
    pub status: TxStatus,
}

/// Funded/spent tallies for one side of an address's history.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TxoStats {
    pub funded_txo_sum: u64,
    pub spent_txo_sum: u64,
    #[serde(default)]
    pub tx_count: u64,
}

/// `GET /address/{a}` response; used for live balance lookups.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct AddressStats {
    pub address: String,
    pub chain_stats: TxoStats,
    #[serde(default)]
    pub mempool_stats: TxoStats,
}

impl AddressStats {
    /// Confirmed balance in satoshis.
    pub fn confirmed_balance(&self) -> u64 {
        self.chain_stats
            .funded_txo_sum
            .saturating_sub(self.chain_stats.spent_txo_sum)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_explorer_tx_json() {
        let raw = r#"{
            "txid": "2222222222222222222222222222222222222222222222222222222222222222",
            "version": 2,
            "locktime": 0,
            "vin": [{
                "txid": "1111111111111111111111111111111111111111111111111111111111111111",
                "vout": 0,
                "prevout": {"value": 50000, "scriptpubkey_address": "tb1qsender"}
            }],
            "vout": [
                {"value": 10000, "scriptpubkey_address": "tb1qvault"},
                {"value": 39000, "scriptpubkey_address": "tb1qchange"}
            ],
            "size": 222,
            "weight": 561,
            "status": {"confirmed": true, "block_height": 100, "block_time": 1700000000},
            "fee": 1000
        }"#;
        let tx: TxInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(tx.value_to("tb1qvault"), 10_000);
        assert_eq!(tx.value_to("tb1qnobody"), 0);
        assert_eq!(tx.first_input_address().as_deref(), Some("tb1qsender"));
        assert_eq!(tx.fee, 1000);
        assert_eq!(tx.status.confirmations(100), 1);
        assert_eq!(tx.status.confirmations(105), 6);
    }

    #[test]
    fn unconfirmed_status_has_zero_confirmations() {
        let status = TxStatus::default();
        assert_eq!(status.confirmations(1_000_000), 0);
    }

    #[test]
    fn address_stats_balance() {
        let raw = r#"{
            "address": "tb1qvault",
            "chain_stats": {"funded_txo_sum": 90000, "spent_txo_sum": 20000, "tx_count": 4},
            "mempool_stats": {"funded_txo_sum": 0, "spent_txo_sum": 0, "tx_count": 0}
        }"#;
        let stats: AddressStats = serde_json::from_str(raw).unwrap();
        assert_eq!(stats.confirmed_balance(), 70_000);
    }
}
