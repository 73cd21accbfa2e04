//! Bet materialization and settlement.
//!
//! Turns detected deposits into bets exactly once, rolls them when their
//! deposit is sufficiently confirmed, and hands winning bets to the
//! payout engine. The `BetResult` broadcast happens only after payout
//! processing has terminated, so observers never see a winning bet
//! without the payout txid it will carry.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::{
    config::Config,
    error::{Error, Result},
    events::{BetResult, Event, EventBus},
    explorer::{Broadcaster, ChainReader},
    fair,
    ingest::DepositEvent,
    payout::PayoutEngine,
    seeds::SeedRegistry,
    store::{
        models::{
            Bet, BetId, BetStatus, DetectedTransaction, TxRecordId, VaultWallet,
        },
        Inserted, Store,
    },
    wallets::WalletVault,
};

/// Shared handle to the winning-bet queue drained by the payout workers.
pub type PayoutQueue = Arc<Mutex<mpsc::Receiver<Bet>>>;

pub struct BetMaterializer<C> {
    store: Arc<Store>,
    wallets: Arc<WalletVault>,
    seeds: Arc<SeedRegistry>,
    payouts: PayoutEngine<C>,
    bus: Arc<EventBus>,
    /// Winning bets waiting for a payout worker. When no pool is
    /// attached the materializer settles the payout inline.
    payout_queue: mpsc::Sender<Bet>,
    min_bet: u64,
    max_bet: u64,
    min_multiplier: f64,
    max_multiplier: f64,
    min_confirmations: u32,
    sweep_page: usize,
    chain: C,
}

impl<C> BetMaterializer<C>
where
    C: ChainReader + Broadcaster + Clone + Send + Sync,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        wallets: Arc<WalletVault>,
        seeds: Arc<SeedRegistry>,
        bus: Arc<EventBus>,
        chain: C,
        payout_queue: mpsc::Sender<Bet>,
        config: &Config,
    ) -> Self {
        let payouts = PayoutEngine::new(store.clone(), wallets.clone(), chain.clone(), config);
        BetMaterializer {
            store,
            wallets,
            seeds,
            payouts,
            bus,
            payout_queue,
            min_bet: config.min_bet_sats,
            max_bet: config.max_bet_sats,
            min_multiplier: config.min_multiplier,
            max_multiplier: config.max_multiplier,
            min_confirmations: config.min_confirmations_payout,
            sweep_page: config.sweep_page_size,
            chain,
        }
    }

    pub fn payout_engine(&self) -> &PayoutEngine<C> {
        &self.payouts
    }

    /// Idempotent materialization of one detected deposit.
    ///
    /// Replaying the same event any number of times yields one bet and
    /// one transaction record; re-observations only bump the record's
    /// detection count.
    pub async fn process_deposit(&self, event: DepositEvent) -> Result<Option<Bet>> {
        let confirmations = u32::from(event.status.confirmed);
        let now = Utc::now();
        let record = DetectedTransaction {
            id: TxRecordId(self.store.alloc_id()?),
            txid: event.txid,
            from_address: event.from_address.clone(),
            to_address: event.to_address.clone(),
            amount: event.amount,
            fee: event.fee,
            detected_by: event.detected_by,
            detection_count: 1,
            confirmations,
            block_height: event.status.block_height,
            block_hash: event.status.block_hash,
            is_processed: false,
            bet: None,
            detected_at: now,
            confirmed_at: event.status.confirmed.then_some(now),
            processed_at: None,
            raw: event.raw.clone(),
        };
        let record = self.store.upsert_detected_tx(record)?.into_inner();

        // Deduplicate against an existing bet for this deposit.
        if let Some(existing) = self.store.bet_by_deposit_txid(&record.txid)? {
            debug!(txid = %record.txid, bet = %existing.id, "bet already exists for deposit");
            if !record.is_processed {
                self.mark_processed(record.id, Some(existing.id))?;
            }
            return Ok(Some(existing));
        }
        if record.is_processed {
            // Either a deposit previously absorbed as invalid, or an
            // attachment that lost its bet. No new side effects.
            warn!(txid = %record.txid, "transaction processed but no bet exists; ignoring");
            return Ok(None);
        }

        // The bettor is whoever funded the deposit.
        let Some(from_address) = record.from_address.clone() else {
            warn!(txid = %record.txid, "deposit has no attributable sender");
            self.mark_processed(record.id, None)?;
            return Ok(None);
        };
        let user = self.store.get_or_create_user(&from_address)?;

        // The deposit address fixes multiplier and chance.
        let Some(wallet) = self.wallets.wallet_for_address(&record.to_address)? else {
            error!(
                to = %record.to_address,
                txid = %record.txid,
                "no vault wallet for detected address"
            );
            return Ok(None);
        };

        let user_seed = self.store.get_or_create_user_seed(&user)?;

        let server_seed = self.seeds.get_or_create_today()?.into_inner();
        let server_seed = self.seeds.record_bet(server_seed.id)?;
        if server_seed.bet_count == 1 {
            // First bet committed to a fresh daily seed.
            self.bus.publish(Event::SeedHashUpdate {
                server_seed_hash: server_seed.server_seed_hash.clone(),
                seed_date: server_seed.seed_date,
            });
        }

        if let Err(reason) = self.validate_bet(record.amount, &wallet) {
            // Invalid deposits are absorbed: marked processed, no bet,
            // no refund.
            warn!(txid = %record.txid, %reason, "absorbing invalid deposit");
            self.mark_processed(record.id, None)?;
            return Ok(None);
        }

        let bet_number = self.store.next_bet_number()?;
        let bet = Bet {
            id: BetId(self.store.alloc_id()?),
            bet_number,
            user: user.id,
            vault_wallet: wallet.id,
            user_seed: user_seed.id,
            deposit_txid: record.txid,
            target_address: record.to_address.clone(),
            bet_amount: record.amount,
            multiplier: wallet.multiplier,
            chance: wallet.chance,
            nonce: user_seed.nonce,
            server_seed: server_seed.server_seed.clone(),
            server_seed_hash: server_seed.server_seed_hash.clone(),
            client_seed: user_seed.client_seed.clone(),
            roll_result: None,
            is_win: None,
            payout_amount: None,
            profit: None,
            payout_txid: None,
            status: BetStatus::Pending,
            created_at: now,
            confirmed_at: None,
            rolled_at: None,
            paid_at: None,
        };
        let bet = match self.store.insert_bet(bet)? {
            Inserted::Created(bet) => {
                info!(
                    bet = %bet.id,
                    number = bet.bet_number,
                    amount = bet.bet_amount,
                    multiplier = bet.multiplier,
                    txid = %bet.deposit_txid,
                    "bet created"
                );
                bet
            }
            Inserted::Existing(bet) => {
                // A racing detection inserted first; adopt its bet.
                self.mark_processed(record.id, Some(bet.id))?;
                return Ok(Some(bet));
            }
        };

        self.mark_processed(record.id, Some(bet.id))?;
        self.wallets.record_deposit(wallet.id, record.amount)?;

        if record.confirmations >= self.min_confirmations {
            let bet = self.roll_and_settle(bet).await?;
            return Ok(Some(bet));
        }
        debug!(
            bet = %bet.id,
            confirmations = record.confirmations,
            required = self.min_confirmations,
            "bet pending confirmations"
        );
        Ok(Some(bet))
    }

    fn validate_bet(&self, amount: u64, wallet: &VaultWallet) -> std::result::Result<(), String> {
        if amount < self.min_bet {
            return Err(format!("amount {amount} below minimum {}", self.min_bet));
        }
        if amount > self.max_bet {
            return Err(format!("amount {amount} above maximum {}", self.max_bet));
        }
        let multiplier = f64::from(wallet.multiplier);
        if multiplier < self.min_multiplier || multiplier > self.max_multiplier {
            return Err(format!(
                "multiplier {multiplier} outside [{}, {}]",
                self.min_multiplier, self.max_multiplier
            ));
        }
        if wallet.chance * multiplier > 100.0 + 1e-9 {
            return Err(format!(
                "chance {} x multiplier {multiplier} exceeds 100",
                wallet.chance
            ));
        }
        Ok(())
    }

    fn mark_processed(&self, id: TxRecordId, bet: Option<BetId>) -> Result<()> {
        self.store.update_detected_tx(id, |tx| {
            tx.is_processed = true;
            tx.bet = bet.or(tx.bet);
            tx.processed_at.get_or_insert_with(Utc::now);
        })?;
        Ok(())
    }

    /// Rolls a bet once and drives settlement.
    ///
    /// Guarded against double-rolls: a roll result is never overwritten,
    /// and a one-shot claim serializes racing settlers. The nonce
    /// increment is coupled to the roll.
    pub async fn roll_and_settle(&self, bet: Bet) -> Result<Bet> {
        if bet.is_rolled() {
            return Ok(bet);
        }
        if !self.store.claim_roll(bet.id)? {
            debug!(bet = %bet.id, "roll already claimed");
            return self.store.bet(bet.id);
        }

        let roll = fair::roll(&bet.server_seed, &bet.client_seed, bet.nonce);
        let is_win = fair::is_winning_roll(roll, bet.chance);
        let payout_amount = fair::payout_amount(bet.bet_amount, bet.multiplier, is_win);
        let profit = fair::profit(bet.bet_amount, payout_amount, is_win);

        let bet = self.store.update_bet(bet.id, |b| {
            b.roll_result = Some(roll);
            b.is_win = Some(is_win);
            b.payout_amount = Some(payout_amount);
            b.profit = Some(profit);
            b.status = BetStatus::Rolled;
            b.rolled_at = Some(Utc::now());
        })?;
        info!(
            bet = %bet.id,
            number = bet.bet_number,
            roll,
            is_win,
            profit,
            "bet rolled"
        );

        self.store.increment_nonce(bet.user_seed)?;
        self.store.update_user(bet.user, |u| {
            u.total_bets += 1;
            u.total_wagered += bet.bet_amount;
            if is_win {
                u.total_won += profit.max(0) as u64;
            } else {
                u.total_lost += bet.bet_amount;
            }
        })?;

        if is_win && payout_amount > 0 {
            // Hand off to the payout pool; with no pool attached, settle
            // inline so the result event still trails the payout.
            if self.payout_queue.send(bet.clone()).await.is_err() {
                return self.finish_win(bet).await;
            }
            Ok(bet)
        } else {
            let bet = self.store.update_bet(bet.id, |b| {
                b.status = BetStatus::Paid;
                b.paid_at = Some(Utc::now());
            })?;
            self.publish_result(&bet)?;
            Ok(bet)
        }
    }

    /// Payout stage for a winning bet, then the single result broadcast.
    /// Payout failures are terminal on the payout record, not here; the
    /// event goes out either way with whatever txid is durable.
    pub async fn finish_win(&self, bet: Bet) -> Result<Bet> {
        if let Err(e) = self.payouts.process_winning_bet(&bet).await {
            error!(bet = %bet.id, error = %e, "payout processing failed");
        }
        let settled = self.store.bet(bet.id)?;
        self.publish_result(&settled)?;
        Ok(settled)
    }

    fn publish_result(&self, bet: &Bet) -> Result<()> {
        let user = self.store.user(bet.user)?;
        self.bus.publish(Event::NewBet {
            bet: BetResult::from_bet(bet, &user.address),
        });
        Ok(())
    }

    /// Pending-bet sweeper: promotes bets whose deposits have reached the
    /// confirmation threshold and settles them. Bounded by the sweep page
    /// size per invocation. Returns how many bets were settled.
    pub async fn sweep_pending(&self) -> Result<usize> {
        let mut settled = 0;
        for bet in self.store.unsettled_bets(self.sweep_page)? {
            let Some(record) = self.store.detected_tx_by_txid(&bet.deposit_txid)? else {
                continue;
            };
            let mut confirmations = record.confirmations;
            if confirmations < self.min_confirmations {
                confirmations = self.refresh_confirmations(&record).await.unwrap_or(confirmations);
            }
            if confirmations < self.min_confirmations {
                continue;
            }
            let bet = if bet.status == BetStatus::Pending {
                self.store.update_bet(bet.id, |b| {
                    b.status = BetStatus::Confirmed;
                    b.confirmed_at.get_or_insert_with(Utc::now);
                })?
            } else {
                bet
            };
            self.roll_and_settle(bet).await?;
            settled += 1;
        }
        Ok(settled)
    }

    /// Re-queries the explorer for a deposit's confirmation count and
    /// updates the record when it moved.
    async fn refresh_confirmations(&self, record: &DetectedTransaction) -> Option<u32> {
        let tx = self.chain.tx_details(&record.txid).await.ok()??;
        let tip = self.chain.tip_height().await.ok()?;
        let confirmations = tx.status.confirmations(tip);
        if confirmations != record.confirmations {
            let status = tx.status.clone();
            let updated = self.store.update_detected_tx(record.id, move |t| {
                t.confirmations = confirmations;
                t.block_height = status.block_height;
                t.block_hash = status.block_hash;
                if status.confirmed && t.confirmed_at.is_none() {
                    t.confirmed_at = Some(Utc::now());
                }
            });
            if let Err(e) = updated {
                warn!(txid = %record.txid, error = %e, "failed to refresh confirmations");
            }
        }
        Some(confirmations)
    }

    /// Deposit pump: single consumer of the ingestion channel, which
    /// serializes per-user nonce handling by construction.
    pub async fn run(
        self: Arc<Self>,
        mut deposits: mpsc::Receiver<DepositEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("bet materializer shutting down");
                    return;
                }
                event = deposits.recv() => match event {
                    Some(event) => {
                        let txid = event.txid;
                        if let Err(e) = self.process_deposit(event).await {
                            match e {
                                Error::User(reason) => debug!(%txid, %reason, "deposit rejected"),
                                e => error!(%txid, error = %e, "failed to process deposit"),
                            }
                        }
                    }
                    None => {
                        info!("deposit channel closed; materializer exiting");
                        return;
                    }
                }
            }
        }
    }

    /// One payout worker: drains the winning-bet queue. Several of these
    /// run concurrently over the same queue.
    pub async fn run_payout_worker(
        self: Arc<Self>,
        queue: PayoutQueue,
        cancel: CancellationToken,
    ) {
        loop {
            let bet = {
                let mut rx = queue.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    bet = rx.recv() => bet,
                }
            };
            match bet {
                Some(bet) => {
                    if let Err(e) = self.finish_win(bet).await {
                        error!(error = %e, "payout worker failed to settle win");
                    }
                }
                None => return,
            }
        }
    }
}
