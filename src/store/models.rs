//! Document schemas for the persistence layer.
//!
//! Every entity is a tagged record with explicit optionality; the status
//! and source strings of the wire protocol are closed enums here. Records
//! are stored as JSON under sled-allocated ids.

use bitcoin::{BlockHash, Network, Txid};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

macro_rules! impl_id {
    ($name:ident) => {
        /// Opaque document id.
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

impl_id!(UserId);
impl_id!(WalletId);
impl_id!(SeedId);
impl_id!(UserSeedId);
impl_id!(BetId);
impl_id!(TxRecordId);
impl_id!(PayoutId);

/// Lifecycle of a bet from detection to settlement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    /// Deposit detected, waiting for confirmations.
    Pending,
    /// Deposit confirmed to the payout threshold, not yet rolled.
    Confirmed,
    /// Roll result durable; a winning bet is waiting on its payout.
    Rolled,
    /// Terminal: losses immediately, wins once the payout broadcast.
    Paid,
    /// Terminal failure recorded by an operator.
    Failed,
}

/// Lifecycle of a payout transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Broadcast,
    Confirmed,
    Failed,
}

/// Which observation path produced a detected transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    /// `address-transactions` frame for a tracked address.
    AddressFeed,
    /// Full transaction or bulk txid frame from the live mempool feed.
    MempoolFeed,
    /// REST polling fallback over `GET /address/{a}/txs`.
    RestPoll,
}

/// Script kind of a vault address; drives the payout witness type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    Legacy,
    Segwit,
    Taproot,
}

/// A bettor, identified by the Bitcoin address their deposits come from.
/// Created on first observed deposit; never deleted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub address: String,
    pub total_bets: u64,
    pub total_wagered: u64,
    pub total_won: u64,
    pub total_lost: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One vault wallet per (multiplier, active) pair. The deposit address
/// uniquely determines the multiplier and chance of the resulting bet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VaultWallet {
    pub id: WalletId,
    pub multiplier: u32,
    /// Win threshold in percent, strictly inside `(0, 100)`. Authoritative
    /// for win determination; the multiplier only sizes the payout.
    pub chance: f64,
    pub address: String,
    pub address_kind: AddressKind,
    pub network: Network,
    /// AES-256-GCM blob produced by the key vault.
    pub encrypted_private_key: String,
    pub is_active: bool,
    pub is_depleted: bool,
    pub total_received: u64,
    pub total_sent: u64,
    pub bet_count: u64,
    /// Cached on-chain balance, refreshed by the admin listing.
    pub balance_sats: u64,
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The house-committed seed for one calendar day. The hash is public from
/// creation; the seed itself is revealed once the day has passed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerSeed {
    pub id: SeedId,
    pub seed_date: NaiveDate,
    pub server_seed: String,
    pub server_seed_hash: String,
    pub bet_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Per-user roll parameters: the client seed (the user's address) and the
/// monotonically increasing nonce. One active record per user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserSeed {
    pub id: UserSeedId,
    pub user: UserId,
    pub client_seed: String,
    pub nonce: u64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// The central record linking one deposit to one roll and, for wins, one
/// payout. Seeds, chance, and multiplier are snapshots taken at creation
/// so the bet stays verifiable even if the wallet changes later.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bet {
    pub id: BetId,
    /// Globally monotonic sequence from the durable counter.
    pub bet_number: u64,
    pub user: UserId,
    pub vault_wallet: WalletId,
    pub user_seed: UserSeedId,
    pub deposit_txid: Txid,
    /// Vault address the deposit paid, snapshotted.
    pub target_address: String,
    pub bet_amount: u64,
    pub multiplier: u32,
    pub chance: f64,
    pub nonce: u64,
    pub server_seed: String,
    pub server_seed_hash: String,
    pub client_seed: String,
    pub roll_result: Option<f64>,
    pub is_win: Option<bool>,
    pub payout_amount: Option<u64>,
    pub profit: Option<i64>,
    pub payout_txid: Option<Txid>,
    pub status: BetStatus,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub rolled_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Bet {
    /// Whether the roll has been settled (never mutated once set).
    pub fn is_rolled(&self) -> bool {
        self.roll_result.is_some()
    }
}

/// A transaction observed paying a vault address. Observed any number of
/// times, recorded exactly once; re-observations bump `detection_count`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectedTransaction {
    pub id: TxRecordId,
    pub txid: Txid,
    pub from_address: Option<String>,
    pub to_address: String,
    pub amount: u64,
    pub fee: u64,
    pub detected_by: DetectionSource,
    pub detection_count: u32,
    pub confirmations: u32,
    pub block_height: Option<u32>,
    pub block_hash: Option<BlockHash>,
    /// Flips true when a bet is attached or the tx is rejected as unusable.
    pub is_processed: bool,
    pub bet: Option<BetId>,
    pub detected_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Raw explorer payload kept for audit.
    pub raw: Option<Box<RawValue>>,
}

/// The on-chain return of winnings for a single bet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payout {
    pub id: PayoutId,
    pub bet: BetId,
    pub amount: u64,
    pub to_address: String,
    pub status: PayoutStatus,
    pub txid: Option<Txid>,
    pub retry_count: u32,
    /// Snapshot of the configured retry bound at creation.
    pub max_retries: u32,
    pub network_fee: Option<u64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub broadcast_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl Payout {
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn statuses_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&BetStatus::Rolled).unwrap(),
            "\"rolled\""
        );
        assert_eq!(
            serde_json::to_string(&PayoutStatus::Broadcast).unwrap(),
            "\"broadcast\""
        );
        assert_eq!(
            serde_json::to_string(&DetectionSource::RestPoll).unwrap(),
            "\"rest_poll\""
        );
    }

    #[test]
    fn ids_are_transparent_in_json() {
        let id = BetId(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        let back: BetId = serde_json::from_str("42").unwrap();
        assert_eq!(back, id);
    }
}
