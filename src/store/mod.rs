//! Embedded document store.
//!
//! One sled tree per collection, JSON documents keyed by store-allocated
//! u64 ids. Uniqueness constraints live in dedicated index trees and are
//! enforced with `compare_and_swap`; the bet-number sequence is a single
//! counter key mutated through `update_and_fetch`. All state transitions
//! are single-document updates; cross-document coherency comes from the
//! idempotency rules in the bet and payout services, not multi-tree
//! transactions.

pub mod models;

use std::path::Path;

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use sled::{CompareAndSwapError, Tree};

use crate::error::{Error, Result};
use models::*;

/// Outcome of an insert guarded by a uniqueness constraint: either our
/// document went in, or a racing writer's document was already there.
#[derive(Debug)]
pub enum Inserted<T> {
    Created(T),
    Existing(T),
}

impl<T> Inserted<T> {
    pub fn into_inner(self) -> T {
        match self {
            Inserted::Created(doc) | Inserted::Existing(doc) => doc,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Inserted::Created(_))
    }
}

pub struct Store {
    db: sled::Db,
    users: Tree,
    users_by_address: Tree,
    user_seeds: Tree,
    user_seeds_by_user: Tree,
    server_seeds: Tree,
    server_seeds_by_date: Tree,
    wallets: Tree,
    wallets_by_address: Tree,
    bets: Tree,
    bets_by_deposit_txid: Tree,
    bets_by_number: Tree,
    bets_by_user: Tree,
    roll_claims: Tree,
    transactions: Tree,
    transactions_by_txid: Tree,
    payouts: Tree,
    payouts_by_bet: Tree,
    payouts_by_txid: Tree,
    counters: Tree,
}

fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Composite key `user id || bet number`, both big-endian, so a prefix
/// scan walks one user's bets in creation order.
fn user_bet_key(user: UserId, bet_number: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&user.0.to_be_bytes());
    key[8..].copy_from_slice(&bet_number.to_be_bytes());
    key
}

fn ser<T: Serialize>(doc: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(doc)?)
}

fn de<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// An ephemeral store for tests; dropped with the process.
    pub fn open_temporary() -> Result<Self> {
        Self::from_db(
            sled::Config::new()
                .temporary(true)
                .flush_every_ms(None)
                .open()?,
        )
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        // Roll claims only serialize settlers within one process; a claim
        // left behind by a crash must not strand its bet, so the next
        // start gets a clean slate and the sweeper re-drives the roll.
        let roll_claims = db.open_tree("roll_claims")?;
        roll_claims.clear()?;

        Ok(Store {
            users: db.open_tree("users")?,
            users_by_address: db.open_tree("users_by_address")?,
            user_seeds: db.open_tree("user_seeds")?,
            user_seeds_by_user: db.open_tree("user_seeds_by_user")?,
            server_seeds: db.open_tree("server_seeds")?,
            server_seeds_by_date: db.open_tree("server_seeds_by_date")?,
            wallets: db.open_tree("wallets")?,
            wallets_by_address: db.open_tree("wallets_by_address")?,
            bets: db.open_tree("bets")?,
            bets_by_deposit_txid: db.open_tree("bets_by_deposit_txid")?,
            bets_by_number: db.open_tree("bets_by_number")?,
            bets_by_user: db.open_tree("bets_by_user")?,
            roll_claims,
            transactions: db.open_tree("transactions")?,
            transactions_by_txid: db.open_tree("transactions_by_txid")?,
            payouts: db.open_tree("payouts")?,
            payouts_by_bet: db.open_tree("payouts_by_bet")?,
            payouts_by_txid: db.open_tree("payouts_by_txid")?,
            counters: db.open_tree("counters")?,
            db,
        })
    }

    pub fn alloc_id(&self) -> Result<u64> {
        Ok(self.db.generate_id()?)
    }

    // ---- generic internals ------------------------------------------------

    fn put<T: Serialize>(&self, tree: &Tree, id: u64, doc: &T) -> Result<()> {
        tree.insert(id_key(id), ser(doc)?)?;
        Ok(())
    }

    fn fetch<T: DeserializeOwned>(&self, tree: &Tree, id: u64) -> Result<Option<T>> {
        tree.get(id_key(id))?.map(|bytes| de(&bytes)).transpose()
    }

    fn require<T: DeserializeOwned>(&self, tree: &Tree, id: u64, what: &str) -> Result<T> {
        self.fetch(tree, id)?
            .ok_or_else(|| Error::integrity(format!("{what} {id} missing from store")))
    }

    /// Atomic read-modify-write of one document. The closure may run more
    /// than once under contention; it must be a pure transformation.
    fn modify<T, F>(&self, tree: &Tree, id: u64, what: &str, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&mut T),
    {
        let bytes = tree.update_and_fetch(id_key(id), |prev| {
            let prev = prev?;
            match serde_json::from_slice::<T>(prev) {
                Ok(mut doc) => {
                    f(&mut doc);
                    // An unencodable document is left untouched; the decode
                    // below surfaces the corruption to the caller.
                    serde_json::to_vec(&doc).ok().or_else(|| Some(prev.to_vec()))
                }
                Err(_) => Some(prev.to_vec()),
            }
        })?;
        match bytes {
            Some(bytes) => de(&bytes),
            None => Err(Error::integrity(format!("{what} {id} missing from store"))),
        }
    }

    /// Reserves `key -> id` in an index tree. Returns the holder's id if
    /// another writer got there first.
    fn reserve(&self, index: &Tree, key: &[u8], id: u64) -> Result<Option<u64>> {
        match index.compare_and_swap(key, None::<&[u8]>, Some(id_key(id).to_vec()))? {
            Ok(()) => Ok(None),
            Err(CompareAndSwapError { current, .. }) => {
                let holder = current
                    .as_deref()
                    .and_then(|b| <[u8; 8]>::try_from(b).ok())
                    .map(u64::from_be_bytes)
                    .ok_or_else(|| Error::integrity("index entry holds malformed id"))?;
                Ok(Some(holder))
            }
        }
    }

    fn lookup(&self, index: &Tree, key: &[u8]) -> Result<Option<u64>> {
        Ok(index
            .get(key)?
            .as_deref()
            .and_then(|b| <[u8; 8]>::try_from(b).ok())
            .map(u64::from_be_bytes))
    }

    fn all<T: DeserializeOwned>(&self, tree: &Tree) -> Result<Vec<T>> {
        tree.iter()
            .map(|item| {
                let (_, value) = item?;
                de(&value)
            })
            .collect()
    }

    // ---- counters ---------------------------------------------------------

    /// Next value of the global bet-number sequence; strictly increasing,
    /// starting at 1, durable across restarts.
    pub fn next_bet_number(&self) -> Result<u64> {
        let bytes = self
            .counters
            .update_and_fetch(b"bet_number", |prev| {
                let next = match prev.and_then(|b| <[u8; 8]>::try_from(b).ok()) {
                    Some(raw) => u64::from_be_bytes(raw) + 1,
                    None => 1,
                };
                Some(next.to_be_bytes().to_vec())
            })?
            .ok_or_else(|| Error::integrity("counter update returned nothing"))?;
        let raw = <[u8; 8]>::try_from(bytes.as_ref())
            .map_err(|_| Error::integrity("bet_number counter is malformed"))?;
        Ok(u64::from_be_bytes(raw))
    }

    // ---- users ------------------------------------------------------------

    pub fn user(&self, id: UserId) -> Result<User> {
        self.require(&self.users, id.0, "user")
    }

    pub fn user_by_address(&self, address: &str) -> Result<Option<User>> {
        match self.lookup(&self.users_by_address, address.as_bytes())? {
            Some(id) => Ok(Some(self.require(&self.users, id, "user")?)),
            None => Ok(None),
        }
    }

    /// Upserts a user by address; concurrent creations race harmlessly and
    /// the loser adopts the winner's record.
    pub fn get_or_create_user(&self, address: &str) -> Result<User> {
        if let Some(user) = self.user_by_address(address)? {
            return Ok(user);
        }
        let now = Utc::now();
        let user = User {
            id: UserId(self.alloc_id()?),
            address: address.to_owned(),
            total_bets: 0,
            total_wagered: 0,
            total_won: 0,
            total_lost: 0,
            created_at: now,
            updated_at: now,
        };
        self.put(&self.users, user.id.0, &user)?;
        match self.reserve(&self.users_by_address, address.as_bytes(), user.id.0)? {
            None => Ok(user),
            Some(winner) => {
                self.users.remove(id_key(user.id.0))?;
                self.require(&self.users, winner, "user")
            }
        }
    }

    pub fn all_users(&self) -> Result<Vec<User>> {
        self.all(&self.users)
    }

    pub fn update_user(&self, id: UserId, f: impl Fn(&mut User)) -> Result<User> {
        self.modify(&self.users, id.0, "user", |user: &mut User| {
            f(user);
            user.updated_at = Utc::now();
        })
    }

    // ---- user seeds -------------------------------------------------------

    pub fn user_seed(&self, id: UserSeedId) -> Result<UserSeed> {
        self.require(&self.user_seeds, id.0, "user seed")
    }

    /// The user's active seed record, created on first use with
    /// `client_seed = address` and `nonce = 0`.
    pub fn get_or_create_user_seed(&self, user: &User) -> Result<UserSeed> {
        if let Some(id) = self.lookup(&self.user_seeds_by_user, &id_key(user.id.0))? {
            return self.require(&self.user_seeds, id, "user seed");
        }
        let seed = UserSeed {
            id: UserSeedId(self.alloc_id()?),
            user: user.id,
            client_seed: user.address.clone(),
            nonce: 0,
            is_active: true,
            created_at: Utc::now(),
        };
        self.put(&self.user_seeds, seed.id.0, &seed)?;
        match self.reserve(&self.user_seeds_by_user, &id_key(user.id.0), seed.id.0)? {
            None => Ok(seed),
            Some(winner) => {
                self.user_seeds.remove(id_key(seed.id.0))?;
                self.require(&self.user_seeds, winner, "user seed")
            }
        }
    }

    /// Increments the nonce and returns the updated record. Couples with
    /// roll settlement: exactly one increment per settled roll.
    pub fn increment_nonce(&self, id: UserSeedId) -> Result<UserSeed> {
        self.modify(&self.user_seeds, id.0, "user seed", |seed: &mut UserSeed| {
            seed.nonce += 1;
        })
    }

    // ---- server seeds -----------------------------------------------------

    pub fn server_seed(&self, id: SeedId) -> Result<ServerSeed> {
        self.require(&self.server_seeds, id.0, "server seed")
    }

    pub fn server_seed_by_date(&self, date: chrono::NaiveDate) -> Result<Option<ServerSeed>> {
        match self.lookup(&self.server_seeds_by_date, date.to_string().as_bytes())? {
            Some(id) => Ok(Some(self.require(&self.server_seeds, id, "server seed")?)),
            None => Ok(None),
        }
    }

    /// Inserts a seed for its date unless one exists; the uniqueness index
    /// on the date guarantees at-most-one concurrent creation.
    pub fn insert_server_seed(&self, seed: ServerSeed) -> Result<Inserted<ServerSeed>> {
        let date_key = seed.seed_date.to_string();
        self.put(&self.server_seeds, seed.id.0, &seed)?;
        match self.reserve(&self.server_seeds_by_date, date_key.as_bytes(), seed.id.0)? {
            None => Ok(Inserted::Created(seed)),
            Some(winner) => {
                self.server_seeds.remove(id_key(seed.id.0))?;
                Ok(Inserted::Existing(self.require(
                    &self.server_seeds,
                    winner,
                    "server seed",
                )?))
            }
        }
    }

    pub fn update_server_seed(
        &self,
        id: SeedId,
        f: impl Fn(&mut ServerSeed),
    ) -> Result<ServerSeed> {
        self.modify(&self.server_seeds, id.0, "server seed", f)
    }

    pub fn delete_server_seed(&self, id: SeedId) -> Result<bool> {
        match self.fetch::<ServerSeed>(&self.server_seeds, id.0)? {
            None => Ok(false),
            Some(seed) => {
                self.server_seeds_by_date
                    .remove(seed.seed_date.to_string().as_bytes())?;
                self.server_seeds.remove(id_key(id.0))?;
                Ok(true)
            }
        }
    }

    pub fn all_server_seeds(&self) -> Result<Vec<ServerSeed>> {
        self.all(&self.server_seeds)
    }

    // ---- wallets ----------------------------------------------------------

    pub fn wallet(&self, id: WalletId) -> Result<VaultWallet> {
        self.require(&self.wallets, id.0, "vault wallet")
    }

    pub fn wallet_by_address(&self, address: &str) -> Result<Option<VaultWallet>> {
        match self.lookup(&self.wallets_by_address, address.as_bytes())? {
            Some(id) => Ok(Some(self.require(&self.wallets, id, "vault wallet")?)),
            None => Ok(None),
        }
    }

    pub fn insert_wallet(&self, wallet: VaultWallet) -> Result<Inserted<VaultWallet>> {
        self.put(&self.wallets, wallet.id.0, &wallet)?;
        match self.reserve(
            &self.wallets_by_address,
            wallet.address.as_bytes(),
            wallet.id.0,
        )? {
            None => Ok(Inserted::Created(wallet)),
            Some(winner) => {
                self.wallets.remove(id_key(wallet.id.0))?;
                Ok(Inserted::Existing(self.require(
                    &self.wallets,
                    winner,
                    "vault wallet",
                )?))
            }
        }
    }

    pub fn update_wallet(
        &self,
        id: WalletId,
        f: impl Fn(&mut VaultWallet),
    ) -> Result<VaultWallet> {
        self.modify(&self.wallets, id.0, "vault wallet", |w: &mut VaultWallet| {
            f(w);
            w.updated_at = Utc::now();
        })
    }

    pub fn delete_wallet(&self, id: WalletId) -> Result<bool> {
        match self.fetch::<VaultWallet>(&self.wallets, id.0)? {
            None => Ok(false),
            Some(wallet) => {
                self.wallets_by_address.remove(wallet.address.as_bytes())?;
                self.wallets.remove(id_key(id.0))?;
                Ok(true)
            }
        }
    }

    pub fn all_wallets(&self) -> Result<Vec<VaultWallet>> {
        self.all(&self.wallets)
    }

    // ---- bets -------------------------------------------------------------

    pub fn bet(&self, id: BetId) -> Result<Bet> {
        self.require(&self.bets, id.0, "bet")
    }

    pub fn bet_by_deposit_txid(&self, txid: &bitcoin::Txid) -> Result<Option<Bet>> {
        match self.lookup(&self.bets_by_deposit_txid, txid.to_string().as_bytes())? {
            Some(id) => Ok(Some(self.require(&self.bets, id, "bet")?)),
            None => Ok(None),
        }
    }

    /// Inserts a bet, enforcing at most one bet per deposit txid. A racing
    /// ingester loses the reservation and adopts the existing bet.
    pub fn insert_bet(&self, bet: Bet) -> Result<Inserted<Bet>> {
        let txid_key = bet.deposit_txid.to_string();
        self.put(&self.bets, bet.id.0, &bet)?;
        match self.reserve(&self.bets_by_deposit_txid, txid_key.as_bytes(), bet.id.0)? {
            None => {
                self.bets_by_number
                    .insert(id_key(bet.bet_number), id_key(bet.id.0).to_vec())?;
                self.bets_by_user
                    .insert(user_bet_key(bet.user, bet.bet_number), id_key(bet.id.0).to_vec())?;
                Ok(Inserted::Created(bet))
            }
            Some(winner) => {
                self.bets.remove(id_key(bet.id.0))?;
                Ok(Inserted::Existing(self.require(&self.bets, winner, "bet")?))
            }
        }
    }

    pub fn update_bet(&self, id: BetId, f: impl Fn(&mut Bet)) -> Result<Bet> {
        self.modify(&self.bets, id.0, "bet", f)
    }

    /// One-shot claim preventing two settlers from rolling the same bet.
    /// The claim is permanent; it is taken immediately before the roll is
    /// computed and persisted.
    pub fn claim_roll(&self, id: BetId) -> Result<bool> {
        Ok(self
            .roll_claims
            .compare_and_swap(id_key(id.0), None::<&[u8]>, Some(&[1][..]))?
            .is_ok())
    }

    /// Bets awaiting settlement (`pending`/`confirmed`, roll unset), in
    /// bet-number order, bounded by `limit`.
    pub fn unsettled_bets(&self, limit: usize) -> Result<Vec<Bet>> {
        let mut out = Vec::new();
        for item in self.bets_by_number.iter() {
            let (_, id_bytes) = item?;
            let id = <[u8; 8]>::try_from(id_bytes.as_ref())
                .map(u64::from_be_bytes)
                .map_err(|_| Error::integrity("bet number index holds malformed id"))?;
            let bet: Bet = self.require(&self.bets, id, "bet")?;
            if matches!(bet.status, BetStatus::Pending | BetStatus::Confirmed) && !bet.is_rolled()
            {
                out.push(bet);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Looks a bet up by its public sequence number.
    pub fn bet_by_number(&self, bet_number: u64) -> Result<Option<Bet>> {
        match self.lookup(&self.bets_by_number, &id_key(bet_number))? {
            Some(id) => Ok(Some(self.require(&self.bets, id, "bet")?)),
            None => Ok(None),
        }
    }

    /// One user's bets, most recent first, bounded by `limit`.
    pub fn user_bets(&self, user: UserId, limit: usize) -> Result<Vec<Bet>> {
        let mut out = Vec::new();
        for item in self.bets_by_user.scan_prefix(id_key(user.0)).rev() {
            let (_, id_bytes) = item?;
            let id = <[u8; 8]>::try_from(id_bytes.as_ref())
                .map(u64::from_be_bytes)
                .map_err(|_| Error::integrity("user bet index holds malformed id"))?;
            out.push(self.require(&self.bets, id, "bet")?);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Most recent bets first, bounded by `limit`.
    pub fn recent_bets(&self, limit: usize) -> Result<Vec<Bet>> {
        let mut out = Vec::new();
        for item in self.bets_by_number.iter().rev() {
            let (_, id_bytes) = item?;
            let id = <[u8; 8]>::try_from(id_bytes.as_ref())
                .map(u64::from_be_bytes)
                .map_err(|_| Error::integrity("bet number index holds malformed id"))?;
            out.push(self.require(&self.bets, id, "bet")?);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    pub fn all_bets(&self) -> Result<Vec<Bet>> {
        self.all(&self.bets)
    }

    /// Winning bets stuck at `rolled` with no payout reference; the retry
    /// sweeper re-drives these after a crash between roll and payout.
    pub fn rolled_unpaid_wins(&self, limit: usize) -> Result<Vec<Bet>> {
        let mut out = Vec::new();
        for bet in self.all::<Bet>(&self.bets)? {
            if bet.status == BetStatus::Rolled
                && bet.is_win == Some(true)
                && bet.payout_txid.is_none()
            {
                out.push(bet);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    // ---- detected transactions --------------------------------------------

    pub fn detected_tx(&self, id: TxRecordId) -> Result<DetectedTransaction> {
        self.require(&self.transactions, id.0, "detected transaction")
    }

    pub fn detected_tx_by_txid(
        &self,
        txid: &bitcoin::Txid,
    ) -> Result<Option<DetectedTransaction>> {
        match self.lookup(&self.transactions_by_txid, txid.to_string().as_bytes())? {
            Some(id) => Ok(Some(self.require(
                &self.transactions,
                id,
                "detected transaction",
            )?)),
            None => Ok(None),
        }
    }

    /// Records an observation of a deposit. A transaction may be observed
    /// many times; exactly one record exists, and re-observations bump the
    /// detection count and refresh confirmation state.
    pub fn upsert_detected_tx(
        &self,
        tx: DetectedTransaction,
    ) -> Result<Inserted<DetectedTransaction>> {
        let txid_key = tx.txid.to_string();
        if let Some(existing) = self.lookup(&self.transactions_by_txid, txid_key.as_bytes())? {
            return Ok(Inserted::Existing(self.absorb_reobservation(existing, &tx)?));
        }
        self.put(&self.transactions, tx.id.0, &tx)?;
        match self.reserve(&self.transactions_by_txid, txid_key.as_bytes(), tx.id.0)? {
            None => Ok(Inserted::Created(tx)),
            Some(winner) => {
                self.transactions.remove(id_key(tx.id.0))?;
                Ok(Inserted::Existing(self.absorb_reobservation(winner, &tx)?))
            }
        }
    }

    fn absorb_reobservation(
        &self,
        existing_id: u64,
        observed: &DetectedTransaction,
    ) -> Result<DetectedTransaction> {
        self.modify(
            &self.transactions,
            existing_id,
            "detected transaction",
            |record: &mut DetectedTransaction| {
                record.detection_count += 1;
                if observed.confirmations > record.confirmations {
                    record.confirmations = observed.confirmations;
                    record.block_height = observed.block_height;
                    record.block_hash = observed.block_hash;
                    if record.confirmed_at.is_none() {
                        record.confirmed_at = Some(Utc::now());
                    }
                }
            },
        )
    }

    pub fn update_detected_tx(
        &self,
        id: TxRecordId,
        f: impl Fn(&mut DetectedTransaction),
    ) -> Result<DetectedTransaction> {
        self.modify(&self.transactions, id.0, "detected transaction", f)
    }

    // ---- payouts ----------------------------------------------------------

    pub fn payout(&self, id: PayoutId) -> Result<Payout> {
        self.require(&self.payouts, id.0, "payout")
    }

    pub fn payout_by_bet(&self, bet: BetId) -> Result<Option<Payout>> {
        match self.lookup(&self.payouts_by_bet, &id_key(bet.0))? {
            Some(id) => Ok(Some(self.require(&self.payouts, id, "payout")?)),
            None => Ok(None),
        }
    }

    /// At most one payout per bet; a second creation returns the first.
    pub fn insert_payout(&self, payout: Payout) -> Result<Inserted<Payout>> {
        self.put(&self.payouts, payout.id.0, &payout)?;
        match self.reserve(&self.payouts_by_bet, &id_key(payout.bet.0), payout.id.0)? {
            None => Ok(Inserted::Created(payout)),
            Some(winner) => {
                self.payouts.remove(id_key(payout.id.0))?;
                Ok(Inserted::Existing(self.require(
                    &self.payouts,
                    winner,
                    "payout",
                )?))
            }
        }
    }

    pub fn update_payout(&self, id: PayoutId, f: impl Fn(&mut Payout)) -> Result<Payout> {
        self.modify(&self.payouts, id.0, "payout", f)
    }

    /// Registers the broadcast txid under the unique-sparse txid index.
    pub fn index_payout_txid(&self, id: PayoutId, txid: &bitcoin::Txid) -> Result<()> {
        self.payouts_by_txid
            .insert(txid.to_string().as_bytes(), id_key(id.0).to_vec())?;
        Ok(())
    }

    /// Payouts eligible for another broadcast attempt, bounded by `limit`.
    pub fn payouts_to_retry(&self, limit: usize) -> Result<Vec<Payout>> {
        let mut out = Vec::new();
        for payout in self.all::<Payout>(&self.payouts)? {
            if matches!(payout.status, PayoutStatus::Pending | PayoutStatus::Failed)
                && !payout.retries_exhausted()
            {
                out.push(payout);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Broadcast payouts whose confirmation is still unknown.
    pub fn payouts_awaiting_confirmation(&self, limit: usize) -> Result<Vec<Payout>> {
        let mut out = Vec::new();
        for payout in self.all::<Payout>(&self.payouts)? {
            if payout.status == PayoutStatus::Broadcast && payout.txid.is_some() {
                out.push(payout);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    pub fn all_payouts(&self) -> Result<Vec<Payout>> {
        self.all(&self.payouts)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::hashes::Hash;
    use chrono::NaiveDate;

    fn txid(n: u8) -> bitcoin::Txid {
        bitcoin::Txid::from_byte_array([n; 32])
    }

    fn store() -> Store {
        Store::open_temporary().unwrap()
    }

    fn sample_bet(store: &Store, deposit: bitcoin::Txid) -> Bet {
        Bet {
            id: BetId(store.alloc_id().unwrap()),
            bet_number: store.next_bet_number().unwrap(),
            user: UserId(1),
            vault_wallet: WalletId(1),
            user_seed: UserSeedId(1),
            deposit_txid: deposit,
            target_address: "tb1qvault".into(),
            bet_amount: 10_000,
            multiplier: 2,
            chance: 49.5,
            nonce: 0,
            server_seed: "seed".into(),
            server_seed_hash: "hash".into(),
            client_seed: "tb1quser".into(),
            roll_result: None,
            is_win: None,
            payout_amount: None,
            profit: None,
            payout_txid: None,
            status: BetStatus::Pending,
            created_at: Utc::now(),
            confirmed_at: None,
            rolled_at: None,
            paid_at: None,
        }
    }

    #[test]
    fn bet_numbers_are_strictly_increasing() {
        let store = store();
        let numbers: Vec<u64> = (0..100).map(|_| store.next_bet_number().unwrap()).collect();
        assert_eq!(numbers[0], 1);
        assert!(numbers.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn one_bet_per_deposit_txid() {
        let store = store();
        let first = sample_bet(&store, txid(7));
        let second = sample_bet(&store, txid(7));

        let created = store.insert_bet(first).unwrap();
        assert!(created.was_created());
        let duplicate = store.insert_bet(second).unwrap();
        assert!(!duplicate.was_created());
        assert_eq!(
            duplicate.into_inner().id,
            store.bet_by_deposit_txid(&txid(7)).unwrap().unwrap().id
        );
        // The loser's orphan document is gone.
        assert_eq!(store.all_bets().unwrap().len(), 1);
    }

    #[test]
    fn user_upsert_is_idempotent() {
        let store = store();
        let a = store.get_or_create_user("tb1qsame").unwrap();
        let b = store.get_or_create_user("tb1qsame").unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.all::<User>(&store.users).unwrap().len(), 1);
    }

    #[test]
    fn roll_claim_is_exclusive() {
        let store = store();
        let bet = store.insert_bet(sample_bet(&store, txid(1))).unwrap().into_inner();
        assert!(store.claim_roll(bet.id).unwrap());
        assert!(!store.claim_roll(bet.id).unwrap());
    }

    #[test]
    fn server_seed_unique_per_date() {
        let store = store();
        let date = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let make = |seed: &str| ServerSeed {
            id: SeedId(store.alloc_id().unwrap()),
            seed_date: date,
            server_seed: seed.into(),
            server_seed_hash: crate::fair::seed_hash(seed),
            bet_count: 0,
            created_at: Utc::now(),
        };
        let winner = store.insert_server_seed(make("first")).unwrap();
        assert!(winner.was_created());
        let loser = store.insert_server_seed(make("second")).unwrap();
        assert!(!loser.was_created());
        // The loser reads the winner's seed value.
        assert_eq!(loser.into_inner().server_seed, "first");
    }

    #[test]
    fn reobservation_updates_one_record() {
        let store = store();
        let make = |confs: u32| DetectedTransaction {
            id: TxRecordId(store.alloc_id().unwrap()),
            txid: txid(3),
            from_address: Some("tb1qfrom".into()),
            to_address: "tb1qvault".into(),
            amount: 10_000,
            fee: 120,
            detected_by: DetectionSource::MempoolFeed,
            detection_count: 1,
            confirmations: confs,
            block_height: (confs > 0).then_some(100),
            block_hash: None,
            is_processed: false,
            bet: None,
            detected_at: Utc::now(),
            confirmed_at: None,
            processed_at: None,
            raw: None,
        };
        assert!(store.upsert_detected_tx(make(0)).unwrap().was_created());
        let second = store.upsert_detected_tx(make(1)).unwrap();
        assert!(!second.was_created());
        let record = second.into_inner();
        assert_eq!(record.detection_count, 2);
        assert_eq!(record.confirmations, 1);
        assert!(record.confirmed_at.is_some());
    }

    #[test]
    fn payout_unique_per_bet() {
        let store = store();
        let make = || Payout {
            id: PayoutId(store.alloc_id().unwrap()),
            bet: BetId(9),
            amount: 20_000,
            to_address: "tb1qwinner".into(),
            status: PayoutStatus::Pending,
            txid: None,
            retry_count: 0,
            max_retries: 3,
            network_fee: None,
            error_message: None,
            created_at: Utc::now(),
            broadcast_at: None,
            confirmed_at: None,
        };
        assert!(store.insert_payout(make()).unwrap().was_created());
        assert!(!store.insert_payout(make()).unwrap().was_created());
        assert_eq!(store.all_payouts().unwrap().len(), 1);
    }

    #[test]
    fn user_bets_scan_is_scoped_and_newest_first() {
        let store = store();
        for n in 0..6u8 {
            let mut bet = sample_bet(&store, txid(n));
            bet.user = UserId(u64::from(n % 2)); // two users interleaved
            store.insert_bet(bet).unwrap();
        }
        let bets = store.user_bets(UserId(0), 10).unwrap();
        assert_eq!(bets.len(), 3);
        assert!(bets.iter().all(|b| b.user == UserId(0)));
        assert!(bets.windows(2).all(|w| w[0].bet_number > w[1].bet_number));

        let page = store.user_bets(UserId(1), 2).unwrap();
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn bet_lookup_by_number() {
        let store = store();
        let bet = store.insert_bet(sample_bet(&store, txid(9))).unwrap().into_inner();
        let found = store.bet_by_number(bet.bet_number).unwrap().unwrap();
        assert_eq!(found.id, bet.id);
        assert!(store.bet_by_number(bet.bet_number + 100).unwrap().is_none());
    }

    #[test]
    fn unsettled_scan_is_ordered_and_bounded() {
        let store = store();
        for n in 0..10u8 {
            store.insert_bet(sample_bet(&store, txid(n))).unwrap();
        }
        let page = store.unsettled_bets(4).unwrap();
        assert_eq!(page.len(), 4);
        assert!(page.windows(2).all(|w| w[0].bet_number < w[1].bet_number));
    }
}
