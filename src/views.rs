//! Read-side projections.
//!
//! The shapes consumed by the history, stats, and verification
//! endpoints. Handlers outside the core call these and serialize the
//! results verbatim; nothing here mutates state.

use std::sync::Arc;

use bitcoin::Txid;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    error::Result,
    fair::{self, RollVerification},
    store::{
        models::{Bet, BetId, BetStatus, Payout, PayoutStatus},
        Store,
    },
};

/// One bet as shown in history listings.
#[derive(Clone, Debug, Serialize)]
pub struct BetHistoryItem {
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
    pub target_address: String,
    pub deposit_txid: Txid,
    pub payout_txid: Option<Txid>,
    pub server_seed_hash: String,
    pub client_seed: String,
    pub status: BetStatus,
    pub created_at: DateTime<Utc>,
}

impl BetHistoryItem {
    fn from_bet(bet: &Bet, user_address: String) -> Self {
        BetHistoryItem {
            bet_id: bet.id,
            bet_number: bet.bet_number,
            user_address,
            bet_amount: bet.bet_amount,
            multiplier: bet.multiplier,
            chance: bet.chance,
            roll_result: bet.roll_result,
            is_win: bet.is_win,
            payout_amount: bet.payout_amount,
            profit: bet.profit,
            nonce: bet.nonce,
            target_address: bet.target_address.clone(),
            deposit_txid: bet.deposit_txid,
            payout_txid: bet.payout_txid,
            server_seed_hash: bet.server_seed_hash.clone(),
            client_seed: bet.client_seed.clone(),
            status: bet.status,
            created_at: bet.created_at,
        }
    }
}

/// A user's bet history together with their lifetime aggregates.
#[derive(Clone, Debug, Serialize)]
pub struct BetHistory {
    pub bets: Vec<BetHistoryItem>,
    pub total_bets: u64,
    pub total_wagered: u64,
    pub total_won: u64,
    pub total_lost: u64,
}

/// Latest bets across all users.
#[derive(Clone, Debug, Serialize)]
pub struct RecentBets {
    pub bets: Vec<BetHistoryItem>,
    pub count: usize,
}

/// Lifetime aggregates for one bettor.
#[derive(Clone, Debug, Serialize)]
pub struct UserStats {
    pub address: String,
    pub total_bets: u64,
    pub total_wagered: u64,
    pub total_won: u64,
    pub total_lost: u64,
    pub net_profit: i64,
    /// Share of settled bets that won, in percent.
    pub win_rate: f64,
}

/// Payout details for one bet.
#[derive(Clone, Debug, Serialize)]
pub struct PayoutView {
    pub payout_id: crate::store::models::PayoutId,
    pub bet_id: BetId,
    pub amount: u64,
    pub to_address: String,
    pub txid: Option<Txid>,
    pub status: PayoutStatus,
    pub error_message: Option<String>,
    pub network_fee: Option<u64>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub broadcast_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl From<Payout> for PayoutView {
    fn from(payout: Payout) -> Self {
        PayoutView {
            payout_id: payout.id,
            bet_id: payout.bet,
            amount: payout.amount,
            to_address: payout.to_address,
            txid: payout.txid,
            status: payout.status,
            error_message: payout.error_message,
            network_fee: payout.network_fee,
            retry_count: payout.retry_count,
            created_at: payout.created_at,
            broadcast_at: payout.broadcast_at,
            confirmed_at: payout.confirmed_at,
        }
    }
}

/// Full provably-fair audit of one settled bet.
#[derive(Clone, Debug, Serialize)]
pub struct BetVerification {
    pub is_valid: bool,
    pub bet_id: BetId,
    pub bet_number: u64,
    pub nonce: u64,
    pub roll: f64,
    pub server_seed: String,
    pub server_seed_hash: String,
    pub client_seed: String,
    pub verification: RollVerification,
}

/// Query facade over the store for the read APIs.
pub struct Views {
    store: Arc<Store>,
}

impl Views {
    pub fn new(store: Arc<Store>) -> Self {
        Views { store }
    }

    pub fn user_stats(&self, address: &str) -> Result<Option<UserStats>> {
        let Some(user) = self.store.user_by_address(address)? else {
            return Ok(None);
        };
        let net_profit = user.total_won as i64 - user.total_lost as i64;
        let wins = self
            .store
            .user_bets(user.id, usize::MAX)?
            .iter()
            .filter(|b| b.is_win == Some(true))
            .count() as f64;
        let win_rate = if user.total_bets == 0 {
            0.0
        } else {
            (wins / user.total_bets as f64 * 10_000.0).round() / 100.0
        };
        Ok(Some(UserStats {
            address: user.address,
            total_bets: user.total_bets,
            total_wagered: user.total_wagered,
            total_won: user.total_won,
            total_lost: user.total_lost,
            net_profit,
            win_rate,
        }))
    }

    /// A user's bets, newest first, plus their aggregates. An unknown
    /// address yields an empty history.
    pub fn user_history(&self, address: &str, limit: usize) -> Result<BetHistory> {
        let Some(user) = self.store.user_by_address(address)? else {
            return Ok(BetHistory {
                bets: Vec::new(),
                total_bets: 0,
                total_wagered: 0,
                total_won: 0,
                total_lost: 0,
            });
        };
        let bets = self
            .store
            .user_bets(user.id, limit)?
            .iter()
            .map(|bet| BetHistoryItem::from_bet(bet, user.address.clone()))
            .collect();
        Ok(BetHistory {
            bets,
            total_bets: user.total_bets,
            total_wagered: user.total_wagered,
            total_won: user.total_won,
            total_lost: user.total_lost,
        })
    }

    /// Latest bets across all users, newest first.
    pub fn recent_bets(&self, limit: usize) -> Result<RecentBets> {
        let mut items = Vec::new();
        for bet in self.store.recent_bets(limit)? {
            let address = self.store.user(bet.user)?.address;
            items.push(BetHistoryItem::from_bet(&bet, address));
        }
        Ok(RecentBets {
            count: items.len(),
            bets: items,
        })
    }

    pub fn payout_for_bet(&self, bet: BetId) -> Result<Option<PayoutView>> {
        Ok(self.store.payout_by_bet(bet)?.map(PayoutView::from))
    }

    /// Re-derives the roll of a settled bet from its own snapshots.
    /// `None` when the bet number is unknown or the bet has not rolled.
    pub fn verify_bet(&self, bet_number: u64) -> Result<Option<BetVerification>> {
        let Some(bet) = self.store.bet_by_number(bet_number)? else {
            return Ok(None);
        };
        let Some(roll) = bet.roll_result else {
            return Ok(None);
        };
        let verification = fair::verify(
            &bet.server_seed,
            &bet.server_seed_hash,
            &bet.client_seed,
            bet.nonce,
            roll,
        );
        Ok(Some(BetVerification {
            is_valid: verification.valid,
            bet_id: bet.id,
            bet_number: bet.bet_number,
            nonce: bet.nonce,
            roll,
            server_seed: bet.server_seed,
            server_seed_hash: bet.server_seed_hash,
            client_seed: bet.client_seed,
            verification,
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::models::{UserSeedId, WalletId};
    use bitcoin::hashes::Hash;

    fn txid(n: u8) -> Txid {
        Txid::from_byte_array([n; 32])
    }

    fn rolled_bet(store: &Store, user: crate::store::models::UserId, n: u8, win: bool) -> Bet {
        let server_seed = format!("view-seed-{n}");
        let nonce = u64::from(n);
        let roll = fair::roll(&server_seed, "tb1qviewer", nonce);
        Bet {
            id: BetId(store.alloc_id().unwrap()),
            bet_number: store.next_bet_number().unwrap(),
            user,
            vault_wallet: WalletId(1),
            user_seed: UserSeedId(1),
            deposit_txid: txid(n),
            target_address: "tb1qvault".into(),
            bet_amount: 10_000,
            multiplier: 2,
            chance: if win { 100.0 } else { 0.0 },
            nonce,
            server_seed_hash: fair::seed_hash(&server_seed),
            server_seed,
            client_seed: "tb1qviewer".into(),
            roll_result: Some(roll),
            is_win: Some(win),
            payout_amount: Some(if win { 20_000 } else { 0 }),
            profit: Some(if win { 10_000 } else { -10_000 }),
            payout_txid: None,
            status: BetStatus::Paid,
            created_at: Utc::now(),
            confirmed_at: None,
            rolled_at: Some(Utc::now()),
            paid_at: Some(Utc::now()),
        }
    }

    #[test]
    fn history_and_stats_reflect_the_user() {
        let store = Arc::new(Store::open_temporary().unwrap());
        let user = store.get_or_create_user("tb1qviewer").unwrap();
        for n in 0..4u8 {
            let bet = rolled_bet(&store, user.id, n, n % 2 == 0);
            store.insert_bet(bet).unwrap();
        }
        store
            .update_user(user.id, |u| {
                u.total_bets = 4;
                u.total_wagered = 40_000;
                u.total_won = 20_000;
                u.total_lost = 20_000;
            })
            .unwrap();

        let views = Views::new(store);
        let history = views.user_history("tb1qviewer", 3).unwrap();
        assert_eq!(history.bets.len(), 3);
        assert_eq!(history.total_bets, 4);
        assert!(history
            .bets
            .windows(2)
            .all(|w| w[0].bet_number > w[1].bet_number));

        let stats = views.user_stats("tb1qviewer").unwrap().unwrap();
        assert_eq!(stats.net_profit, 0);
        assert_eq!(stats.win_rate, 50.0);

        assert!(views.user_stats("tb1qnobody").unwrap().is_none());
        assert!(views.user_history("tb1qnobody", 10).unwrap().bets.is_empty());
    }

    #[test]
    fn verification_rederives_the_roll() {
        let store = Arc::new(Store::open_temporary().unwrap());
        let user = store.get_or_create_user("tb1qviewer").unwrap();
        let bet = store
            .insert_bet(rolled_bet(&store, user.id, 1, true))
            .unwrap()
            .into_inner();

        let views = Views::new(store);
        let verification = views.verify_bet(bet.bet_number).unwrap().unwrap();
        assert!(verification.is_valid);
        assert_eq!(verification.roll, bet.roll_result.unwrap());
        assert!(verification.verification.hash_valid);

        assert!(views.verify_bet(9_999).unwrap().is_none());
    }
}
