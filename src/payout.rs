//! Payout engine.
//!
//! Turns a winning bet into an on-chain payment from the vault that
//! received the deposit. Each payout walks
//! `pending → broadcast → confirmed`; a failed attempt returns to
//! `pending` while retries remain and lands on `failed` once they are
//! exhausted. Error classification decides retry behavior: integrity
//! faults (bad ciphertext, bad WIF) and structural rejections are
//! terminal, transport faults and thin UTXO indexes are not.

use std::{sync::Arc, time::Duration};

use bitcoin::{Network, Txid};
use chrono::Utc;
use tokio::time::sleep;
use tracing::*;

use crate::{
    config::Config,
    error::{Error, Result},
    explorer::{Broadcaster, ChainReader},
    store::{
        models::{Bet, BetStatus, Payout, PayoutId, PayoutStatus},
        Inserted, Store,
    },
    txbuild::{self, PayoutParams},
    wallets::WalletVault,
};

pub struct PayoutEngine<C> {
    store: Arc<Store>,
    wallets: Arc<WalletVault>,
    chain: C,
    network: Network,
    settle_delay: Duration,
    fee_buffer: u64,
    default_fee: u64,
    dust_limit: u64,
    min_confirmations: u32,
    max_retries: u32,
    sweep_page: usize,
}

impl<C: ChainReader + Broadcaster + Send + Sync> PayoutEngine<C> {
    pub fn new(store: Arc<Store>, wallets: Arc<WalletVault>, chain: C, config: &Config) -> Self {
        PayoutEngine {
            store,
            wallets,
            chain,
            network: config.network,
            settle_delay: config.settle_delay,
            fee_buffer: config.fee_buffer_sats,
            default_fee: config.default_tx_fee_sats,
            dust_limit: config.dust_limit_sats,
            min_confirmations: config.min_confirmations_payout,
            max_retries: config.max_payout_retries,
            sweep_page: config.sweep_page_size,
        }
    }

    /// Creates (or finds) the payout for a winning bet and drives
    /// broadcast attempts until success or the retry bound.
    ///
    /// Returns `None` when the bet is not eligible. Attempt failures are
    /// recorded on the payout document rather than propagated; only
    /// store-level faults surface as errors.
    pub async fn process_winning_bet(&self, bet: &Bet) -> Result<Option<Payout>> {
        if !self.eligible(bet)? {
            warn!(bet = %bet.id, status = ?bet.status, "bet not eligible for payout");
            return Ok(None);
        }

        if let Some(existing) = self.store.payout_by_bet(bet.id)? {
            debug!(bet = %bet.id, payout = %existing.id, "payout already exists");
            return Ok(Some(existing));
        }

        let recipient = self.recipient_for(bet)?;
        let amount = bet
            .payout_amount
            .ok_or_else(|| Error::integrity("eligible bet has no payout amount"))?;

        let payout = Payout {
            id: PayoutId(self.store.alloc_id()?),
            bet: bet.id,
            amount,
            to_address: recipient,
            status: PayoutStatus::Pending,
            txid: None,
            retry_count: 0,
            max_retries: self.max_retries,
            network_fee: None,
            error_message: None,
            created_at: Utc::now(),
            broadcast_at: None,
            confirmed_at: None,
        };
        let payout = match self.store.insert_payout(payout)? {
            Inserted::Created(payout) => {
                info!(
                    payout = %payout.id,
                    bet = %bet.id,
                    amount = payout.amount,
                    to = %payout.to_address,
                    "created payout"
                );
                payout
            }
            Inserted::Existing(payout) => return Ok(Some(payout)),
        };

        let payout = self.drive_attempts(payout, bet).await?;
        Ok(Some(payout))
    }

    fn eligible(&self, bet: &Bet) -> Result<bool> {
        if bet.is_win != Some(true) {
            return Ok(false);
        }
        if bet.payout_amount.unwrap_or(0) == 0 {
            return Ok(false);
        }
        if !matches!(bet.status, BetStatus::Confirmed | BetStatus::Rolled) {
            return Ok(false);
        }
        if self.min_confirmations > 0 {
            let confirmations = self
                .store
                .detected_tx_by_txid(&bet.deposit_txid)?
                .map(|tx| tx.confirmations)
                .unwrap_or(0);
            if confirmations < self.min_confirmations {
                info!(
                    bet = %bet.id,
                    confirmations,
                    required = self.min_confirmations,
                    "bet waiting for confirmations"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Recipient priority: sender address of the deposit, then the user's
    /// address. Neither existing is a non-retryable error.
    fn recipient_for(&self, bet: &Bet) -> Result<String> {
        if let Some(tx) = self.store.detected_tx_by_txid(&bet.deposit_txid)? {
            if let Some(from) = tx.from_address {
                return Ok(from);
            }
        }
        let user = self.store.user(bet.user)?;
        if !user.address.is_empty() {
            return Ok(user.address);
        }
        Err(Error::user("cannot determine payout recipient"))
    }

    /// Runs broadcast attempts until success, a terminal error, or the
    /// retry bound. `retry_count` never exceeds `max_retries`.
    async fn drive_attempts(&self, mut payout: Payout, bet: &Bet) -> Result<Payout> {
        while !payout.retries_exhausted() {
            payout = self
                .store
                .update_payout(payout.id, |p| p.retry_count += 1)?;

            match self.build_and_broadcast(&payout, bet).await {
                Ok((txid, fee)) => {
                    payout = self.store.update_payout(payout.id, |p| {
                        p.txid = Some(txid);
                        p.status = PayoutStatus::Broadcast;
                        p.broadcast_at = Some(Utc::now());
                        p.network_fee = Some(fee);
                        p.error_message = None;
                    })?;
                    self.store.index_payout_txid(payout.id, &txid)?;
                    self.store.update_bet(bet.id, |b| {
                        b.payout_txid = Some(txid);
                        b.status = BetStatus::Paid;
                        b.paid_at = Some(Utc::now());
                    })?;
                    self.wallets
                        .record_sent(bet.vault_wallet, payout.amount + fee)?;
                    info!(payout = %payout.id, %txid, "payout broadcast");
                    return Ok(payout);
                }
                Err(e) => {
                    let terminal = !e.is_retryable();
                    warn!(
                        payout = %payout.id,
                        attempt = payout.retry_count,
                        terminal,
                        error = %e,
                        "payout attempt failed"
                    );
                    payout = self.store.update_payout(payout.id, |p| {
                        p.error_message = Some(e.to_string());
                        if terminal || p.retries_exhausted() {
                            p.status = PayoutStatus::Failed;
                        } else {
                            p.status = PayoutStatus::Pending;
                        }
                    })?;
                    if payout.status == PayoutStatus::Failed {
                        return Ok(payout);
                    }
                }
            }
        }
        Ok(payout)
    }

    /// One build-and-broadcast attempt: settle delay, UTXO fetch and
    /// selection, scoped key decrypt, sign, broadcast.
    async fn build_and_broadcast(&self, payout: &Payout, bet: &Bet) -> Result<(Txid, u64)> {
        let wallet = self.store.wallet(bet.vault_wallet)?;

        // Give the explorer's UTXO index time to absorb the deposit this
        // payout is funded by; skipping this loses the first attempt to a
        // well-known race.
        if !self.settle_delay.is_zero() {
            sleep(self.settle_delay).await;
        }

        let utxos = self.chain.utxos_of(&wallet.address).await.map_err(Error::from)?;
        let needed = payout.amount + self.fee_buffer;
        if utxos.is_empty() {
            self.wallets.mark_depleted(wallet.id, true)?;
            return Err(Error::InsufficientFunds {
                needed,
                available: 0,
            });
        }

        let selection = match txbuild::select_utxos(&utxos, needed) {
            Ok(selection) => selection,
            Err(e @ Error::InsufficientFunds { .. }) => {
                self.wallets.mark_depleted(wallet.id, true)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let wif = self.wallets.decrypt_key(&wallet)?;
        let built = txbuild::build_signed_payout(&PayoutParams {
            wif: &wif,
            vault_address: &wallet.address,
            address_kind: wallet.address_kind,
            recipient: &payout.to_address,
            amount: payout.amount,
            fee: self.default_fee,
            dust_limit: self.dust_limit,
            network: self.network,
            utxos: &selection.utxos,
        })?;
        drop(wif);

        let txid = self.chain.broadcast(&built.raw_hex).await.map_err(Error::from)?;
        Ok((txid, built.fee))
    }

    /// Retry sweeper. Re-drives payouts sitting at `pending`/`failed`
    /// with retries left, then picks up winning bets that crashed between
    /// roll and payout creation. Returns how many payouts broadcast.
    pub async fn retry_failed(&self) -> Result<usize> {
        let mut recovered = 0;

        for payout in self.store.payouts_to_retry(self.sweep_page)? {
            let bet = self.store.bet(payout.bet)?;
            if bet.payout_txid.is_some() {
                continue;
            }
            info!(payout = %payout.id, bet = %bet.id, "retrying payout");
            let done = self.drive_attempts(payout, &bet).await?;
            if done.status == PayoutStatus::Broadcast {
                recovered += 1;
            }
        }

        for bet in self.store.rolled_unpaid_wins(self.sweep_page)? {
            if self.store.payout_by_bet(bet.id)?.is_some() {
                continue; // handled (or exhausted) above
            }
            info!(bet = %bet.id, "recovering payout for rolled win");
            if let Some(payout) = self.process_winning_bet(&bet).await? {
                if payout.status == PayoutStatus::Broadcast {
                    recovered += 1;
                }
            }
        }
        Ok(recovered)
    }

    /// Confirmation sweeper: promotes `broadcast` payouts whose txid has
    /// confirmed on-chain. Returns how many were promoted.
    pub async fn check_confirmations(&self) -> Result<usize> {
        let mut confirmed = 0;
        for payout in self.store.payouts_awaiting_confirmation(self.sweep_page)? {
            let Some(txid) = payout.txid else { continue };
            match self.chain.tx_details(&txid).await {
                Ok(Some(tx)) if tx.status.confirmed => {
                    self.store.update_payout(payout.id, |p| {
                        p.status = PayoutStatus::Confirmed;
                        p.confirmed_at = Some(Utc::now());
                    })?;
                    info!(payout = %payout.id, %txid, "payout confirmed");
                    confirmed += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(payout = %payout.id, error = %e, "confirmation check failed"),
            }
        }
        Ok(confirmed)
    }
}
