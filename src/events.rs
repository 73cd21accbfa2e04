//! In-process event bus.
//!
//! Fan-out of settled bets and seed-hash rotations to live subscribers.
//! Delivery is best-effort: a subscriber that is gone or cannot keep up
//! has its subscription dropped; publishers never block on a slow
//! consumer.

use std::sync::Mutex;

use bitcoin::Txid;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::*;

use crate::store::models::{Bet, BetId, BetStatus};

/// Wire message pushed to subscribers, tagged for the frontend.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A bet finished settling; any payout txid it will ever have is
    /// already durable.
    NewBet { bet: BetResult },
    /// First bet of a day committed to a fresh server seed.
    SeedHashUpdate {
        server_seed_hash: String,
        seed_date: NaiveDate,
    },
}

/// Public projection of a settled bet.
#[derive(Clone, Debug, Serialize)]
pub struct BetResult {
    pub bet_id: BetId,
    pub bet_number: u64,
    pub user_address: String,
    pub bet_amount: u64,
    pub multiplier: u32,
    pub chance: f64,
    pub roll_result: Option<f64>,
    pub is_win: Option<bool>,
    pub payout_amount: Option<u64>,
    pub profit: Option<i64>,
    pub nonce: u64,
    pub deposit_txid: Txid,
    pub payout_txid: Option<Txid>,
    pub server_seed: String,
    pub server_seed_hash: String,
    pub client_seed: String,
    pub status: BetStatus,
    pub created_at: DateTime<Utc>,
    pub rolled_at: Option<DateTime<Utc>>,
}

impl BetResult {
    pub fn from_bet(bet: &Bet, user_address: &str) -> Self {
        BetResult {
            bet_id: bet.id,
            bet_number: bet.bet_number,
            user_address: user_address.to_owned(),
            bet_amount: bet.bet_amount,
            multiplier: bet.multiplier,
            chance: bet.chance,
            roll_result: bet.roll_result,
            is_win: bet.is_win,
            payout_amount: bet.payout_amount,
            profit: bet.profit,
            nonce: bet.nonce,
            deposit_txid: bet.deposit_txid,
            payout_txid: bet.payout_txid,
            server_seed: bet.server_seed.clone(),
            server_seed_hash: bet.server_seed_hash.clone(),
            client_seed: bet.client_seed.clone(),
            status: bet.status,
            created_at: bet.created_at,
            rolled_at: bet.rolled_at,
        }
    }
}

/// Best-effort fan-out to per-subscriber bounded channels.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber; the returned receiver is typically drained
    /// by one writer task per live connection.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .push(tx);
        rx
    }

    /// Attempts delivery to every subscriber; any failed send (closed or
    /// full channel) drops that subscription.
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        let before = subscribers.len();
        subscribers.retain(|tx| tx.try_send(event.clone()).is_ok());
        let dropped = before - subscribers.len();
        if dropped > 0 {
            debug!(dropped, remaining = subscribers.len(), "dropped dead subscriptions");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::NaiveDate;

    fn seed_event() -> Event {
        Event::SeedHashUpdate {
            server_seed_hash: "ab".repeat(32),
            seed_date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
        }
    }

    #[tokio::test]
    async fn delivers_to_live_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(8);
        bus.publish(seed_event());
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::SeedHashUpdate { .. }));
    }

    #[tokio::test]
    async fn drops_closed_subscriptions() {
        let bus = EventBus::new();
        let rx = bus.subscribe(8);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 1);
        bus.publish(seed_event());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn full_subscriber_is_dropped_not_blocked() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(1);
        bus.publish(seed_event());
        bus.publish(seed_event()); // channel full: subscription dropped
        assert_eq!(bus.subscriber_count(), 0);
        // The first event is still there for the slow reader.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn seed_hash_update_wire_shape() {
        let json = serde_json::to_value(seed_event()).unwrap();
        assert_eq!(json["type"], "seed_hash_update");
        assert_eq!(json["seed_date"], "2025-06-01");
    }
}
