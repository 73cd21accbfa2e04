//! Mempool ingestion.
//!
//! Consumes parsed frames from the explorer feed, filters them against
//! the monitored vault addresses, and emits [`DepositEvent`]s downstream.
//! The ingester never calls business logic directly; the bet pipeline
//! consumes the channel. Detection tolerates duplicate delivery and
//! late-arriving confirmations; persistence is what makes it idempotent.

use std::collections::{HashSet, VecDeque};

use bitcoin::Txid;
use serde_json::{value::RawValue, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::{
    explorer::{
        types::{TxInfo, TxStatus},
        ChainReader, MonitoredAddresses,
    },
    store::models::DetectionSource,
};

/// A deposit observed paying a monitored vault address.
#[derive(Clone, Debug)]
pub struct DepositEvent {
    pub txid: Txid,
    pub to_address: String,
    pub amount: u64,
    pub from_address: Option<String>,
    pub fee: u64,
    pub status: TxStatus,
    pub detected_by: DetectionSource,
    pub raw: Option<Box<RawValue>>,
}

/// Bounded set of recently processed txids, evicting oldest-first.
/// Suppresses duplicate emissions from overlapping frame types; the
/// unique index on detected transactions is the durable guard.
struct SeenTxids {
    set: HashSet<Txid>,
    order: VecDeque<Txid>,
    cap: usize,
}

impl SeenTxids {
    fn new(cap: usize) -> Self {
        SeenTxids {
            set: HashSet::with_capacity(cap),
            order: VecDeque::with_capacity(cap),
            cap,
        }
    }

    fn contains(&self, txid: &Txid) -> bool {
        self.set.contains(txid)
    }

    fn insert(&mut self, txid: Txid) {
        if !self.set.insert(txid) {
            return;
        }
        self.order.push_back(txid);
        while self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }
}

pub struct Ingester<C> {
    chain: C,
    monitored: MonitoredAddresses,
    seen: SeenTxids,
    deposits: mpsc::Sender<DepositEvent>,
    /// Live track-address requests for the WebSocket session.
    track_tx: mpsc::Sender<String>,
}

impl<C: ChainReader> Ingester<C> {
    pub fn new(
        chain: C,
        monitored: MonitoredAddresses,
        deposits: mpsc::Sender<DepositEvent>,
        track_tx: mpsc::Sender<String>,
        seen_capacity: usize,
    ) -> Self {
        Ingester {
            chain,
            monitored,
            seen: SeenTxids::new(seen_capacity),
            deposits,
            track_tx,
        }
    }

    /// Adds an address to the monitored set and asks the live feed to
    /// track it. Safe to call for already-monitored addresses.
    pub fn monitor_address(&self, address: &str) {
        let inserted = self
            .monitored
            .write()
            .expect("monitored set lock poisoned")
            .insert(address.to_owned());
        if inserted {
            info!(%address, "monitoring vault address");
            // Best effort: a full queue just means the next reconnect
            // re-tracks the whole set anyway.
            let _ = self.track_tx.try_send(address.to_owned());
        }
    }

    /// Frame dispatch. Unknown frame shapes are ignored.
    pub async fn handle_frame(&mut self, frame: Value) {
        if let Some(address_txs) = frame.get("address-transactions") {
            self.handle_address_transactions(address_txs.clone()).await;
        } else if let Some(txs) = frame.get("transactions").and_then(Value::as_array) {
            // Bulk txid list, common on some networks instead of
            // address-specific frames.
            for item in txs.clone() {
                if let Some(txid) = parse_txid(item.get("txid")) {
                    self.process_txid(txid, DetectionSource::MempoolFeed).await;
                }
            }
        } else if frame.get("txid").is_some() && frame.get("vout").is_some() {
            self.inspect_tx_value(&frame, DetectionSource::MempoolFeed)
                .await;
        } else if ["blocks", "mempool-blocks", "mempoolInfo", "live-2h-chart"]
            .iter()
            .any(|key| frame.get(key).is_some())
        {
            // Control frames carry no per-address information.
        } else if let Some(object) = frame.as_object() {
            trace!(keys = ?object.keys().collect::<Vec<_>>(), "ignoring frame");
        }
    }

    /// `address-transactions` arrives as an object, a list, or txid
    /// strings depending on the explorer version.
    async fn handle_address_transactions(&mut self, payload: Value) {
        match payload {
            Value::Array(items) => {
                for item in items {
                    self.handle_address_tx_item(item).await;
                }
            }
            other => self.handle_address_tx_item(other).await,
        }
    }

    async fn handle_address_tx_item(&mut self, item: Value) {
        match &item {
            Value::Object(object) => {
                if object.contains_key("vout") {
                    self.inspect_tx_value(&item, DetectionSource::AddressFeed)
                        .await;
                } else if let Some(txid) = parse_txid(object.get("txid")) {
                    self.process_txid(txid, DetectionSource::AddressFeed).await;
                }
            }
            Value::String(_) => {
                if let Some(txid) = parse_txid(Some(&item)) {
                    self.process_txid(txid, DetectionSource::AddressFeed).await;
                }
            }
            _ => {}
        }
    }

    /// Fetches details for a txid seen without outputs and inspects them.
    async fn process_txid(&mut self, txid: Txid, source: DetectionSource) {
        if self.seen.contains(&txid) {
            return;
        }
        match self.chain.tx_details(&txid).await {
            Ok(Some(tx)) => self.check_outputs(tx, None, source).await,
            Ok(None) => debug!(%txid, "announced transaction unknown to explorer"),
            Err(e) => warn!(%txid, error = %e, "failed to fetch transaction details"),
        }
    }

    /// Parses an inline transaction object and inspects its outputs.
    async fn inspect_tx_value(&mut self, value: &Value, source: DetectionSource) {
        match serde_json::from_value::<TxInfo>(value.clone()) {
            Ok(tx) => self.check_outputs(tx, Some(value), source).await,
            Err(_) => {
                // Partial object; fall back to fetching by txid.
                if let Some(txid) = parse_txid(value.get("txid")) {
                    self.process_txid(txid, source).await;
                }
            }
        }
    }

    /// Emits a deposit event for the first monitored address this
    /// transaction pays, and marks the txid seen.
    async fn check_outputs(&mut self, tx: TxInfo, raw: Option<&Value>, source: DetectionSource) {
        if self.seen.contains(&tx.txid) {
            return;
        }
        let monitored: Vec<String> = {
            let guard = self.monitored.read().expect("monitored set lock poisoned");
            guard.iter().cloned().collect()
        };

        for address in monitored {
            let amount = tx.value_to(&address);
            if amount == 0 {
                continue;
            }
            info!(
                txid = %tx.txid,
                %address,
                amount,
                source = ?source,
                "deposit detected"
            );
            let event = DepositEvent {
                txid: tx.txid,
                to_address: address,
                amount,
                from_address: tx.first_input_address(),
                fee: tx.fee,
                status: tx.status.clone(),
                detected_by: source,
                raw: raw.and_then(|v| serde_json::value::to_raw_value(v).ok()),
            };
            self.seen.insert(tx.txid);
            if self.deposits.send(event).await.is_err() {
                warn!("deposit channel closed; dropping event");
            }
            return; // one bet per deposit txid
        }
    }

    /// REST fallback: polls `address_txs` for every monitored address and
    /// runs the same emission rules as the live path. Returns how many
    /// deposits were emitted.
    pub async fn poll_addresses(&mut self) -> usize {
        let monitored: Vec<String> = {
            let guard = self.monitored.read().expect("monitored set lock poisoned");
            guard.iter().cloned().collect()
        };
        let mut emitted = 0;
        for address in monitored {
            let txs = match self.chain.address_txs(&address).await {
                Ok(txs) => txs,
                Err(e) => {
                    warn!(%address, error = %e, "address poll failed");
                    continue;
                }
            };
            for tx in txs {
                if self.seen.contains(&tx.txid) || tx.value_to(&address) == 0 {
                    continue;
                }
                self.check_outputs(tx, None, DetectionSource::RestPoll).await;
                emitted += 1;
            }
        }
        emitted
    }

    /// Frame pump: runs until the feed channel closes or shutdown. When
    /// the live feed stays quiet past `fallback_after`, the REST polling
    /// path covers for it until frames resume.
    pub async fn run(
        mut self,
        mut frames: mpsc::Receiver<Value>,
        fallback_after: std::time::Duration,
        cancel: CancellationToken,
    ) {
        let mut poll_tick = tokio::time::interval(fallback_after);
        poll_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_frame = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("ingester shutting down");
                    return;
                }
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        last_frame = tokio::time::Instant::now();
                        self.handle_frame(frame).await;
                    }
                    None => {
                        info!("frame channel closed; ingester exiting");
                        return;
                    }
                },
                _ = poll_tick.tick() => {
                    if last_frame.elapsed() >= fallback_after {
                        let emitted = self.poll_addresses().await;
                        if emitted > 0 {
                            info!(emitted, "REST fallback found deposits the feed missed");
                        }
                    }
                }
            }
        }
    }
}

fn parse_txid(value: Option<&Value>) -> Option<Txid> {
    value.and_then(Value::as_str).and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::explorer::{
        types::{AddressStats, Utxo, Vout},
        ExplorerResult,
    };
    use bitcoin::hashes::Hash;
    use serde_json::json;
    use std::{
        collections::HashMap,
        sync::{Arc, RwLock},
    };

    struct MockChain {
        txs: HashMap<Txid, TxInfo>,
    }

    impl ChainReader for MockChain {
        async fn tx_details(&self, txid: &Txid) -> ExplorerResult<Option<TxInfo>> {
            Ok(self.txs.get(txid).cloned())
        }

        async fn utxos_of(&self, _address: &str) -> ExplorerResult<Vec<Utxo>> {
            Ok(Vec::new())
        }

        async fn address_txs(&self, address: &str) -> ExplorerResult<Vec<TxInfo>> {
            Ok(self
                .txs
                .values()
                .filter(|tx| tx.value_to(address) > 0)
                .cloned()
                .collect())
        }

        async fn address_stats(&self, address: &str) -> ExplorerResult<AddressStats> {
            Ok(AddressStats {
                address: address.to_owned(),
                chain_stats: Default::default(),
                mempool_stats: Default::default(),
            })
        }

        async fn tip_height(&self) -> ExplorerResult<u32> {
            Ok(100)
        }
    }

    fn txid(n: u8) -> Txid {
        Txid::from_byte_array([n; 32])
    }

    fn tx_paying(n: u8, address: &str, amount: u64) -> TxInfo {
        TxInfo {
            txid: txid(n),
            vin: Vec::new(),
            vout: vec![Vout {
                value: amount,
                scriptpubkey_address: Some(address.to_owned()),
            }],
            status: TxStatus::default(),
            fee: 120,
        }
    }

    fn harness(
        txs: Vec<TxInfo>,
    ) -> (Ingester<MockChain>, mpsc::Receiver<DepositEvent>) {
        let chain = MockChain {
            txs: txs.into_iter().map(|tx| (tx.txid, tx)).collect(),
        };
        let monitored: MonitoredAddresses = Arc::new(RwLock::new(HashSet::new()));
        let (deposit_tx, deposit_rx) = mpsc::channel(16);
        let (track_tx, _track_rx) = mpsc::channel(16);
        let ingester = Ingester::new(chain, monitored, deposit_tx, track_tx, 64);
        ingester.monitor_address("tb1qvault");
        (ingester, deposit_rx)
    }

    #[tokio::test]
    async fn full_tx_frame_emits_deposit() {
        let (mut ingester, mut rx) = harness(vec![]);
        let frame = json!({
            "txid": txid(1).to_string(),
            "vout": [{"value": 10_000u64, "scriptpubkey_address": "tb1qvault"}],
            "vin": [{"txid": txid(9).to_string(), "vout": 0,
                     "prevout": {"value": 20_000u64, "scriptpubkey_address": "tb1quser"}}],
            "status": {"confirmed": false},
            "fee": 120
        });
        ingester.handle_frame(frame).await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.txid, txid(1));
        assert_eq!(event.to_address, "tb1qvault");
        assert_eq!(event.amount, 10_000);
        assert_eq!(event.from_address.as_deref(), Some("tb1quser"));
        assert_eq!(event.detected_by, DetectionSource::MempoolFeed);
        assert!(event.raw.is_some());
    }

    #[tokio::test]
    async fn address_transactions_list_fetches_details() {
        let (mut ingester, mut rx) = harness(vec![tx_paying(2, "tb1qvault", 5_000)]);
        let frame = json!({
            "address-transactions": [{"txid": txid(2).to_string()}]
        });
        ingester.handle_frame(frame).await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.txid, txid(2));
        assert_eq!(event.detected_by, DetectionSource::AddressFeed);
    }

    #[tokio::test]
    async fn bulk_txid_list_is_checked_against_monitored() {
        let (mut ingester, mut rx) = harness(vec![
            tx_paying(3, "tb1qvault", 7_000),
            tx_paying(4, "tb1qother", 9_000),
        ]);
        let frame = json!({
            "transactions": [
                {"txid": txid(3).to_string()},
                {"txid": txid(4).to_string()}
            ]
        });
        ingester.handle_frame(frame).await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.txid, txid(3));
        // The tx paying an unmonitored address is not emitted.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_frames_emit_once() {
        let (mut ingester, mut rx) = harness(vec![tx_paying(5, "tb1qvault", 8_000)]);
        let frame = json!({"address-transactions": [{"txid": txid(5).to_string()}]});
        ingester.handle_frame(frame.clone()).await;
        ingester.handle_frame(frame).await;

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn control_frames_are_ignored() {
        let (mut ingester, mut rx) = harness(vec![]);
        ingester.handle_frame(json!({"blocks": []})).await;
        ingester.handle_frame(json!({"mempool-blocks": []})).await;
        ingester.handle_frame(json!({"mempoolInfo": {"size": 12}})).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rest_poll_uses_the_same_rules() {
        let (mut ingester, mut rx) = harness(vec![tx_paying(6, "tb1qvault", 6_000)]);
        let emitted = ingester.poll_addresses().await;
        assert_eq!(emitted, 1);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.detected_by, DetectionSource::RestPoll);

        // A second poll is a no-op thanks to the seen set.
        assert_eq!(ingester.poll_addresses().await, 0);
    }

    #[test]
    fn seen_set_is_bounded() {
        let mut seen = SeenTxids::new(4);
        for n in 0..8u8 {
            seen.insert(txid(n));
        }
        assert!(!seen.contains(&txid(0)));
        assert!(seen.contains(&txid(7)));
        assert_eq!(seen.set.len(), 4);
    }
}
