//! Admin surface.
//!
//! The operations behind the administrative API: vault wallet CRUD, the
//! seed calendar, treasury withdrawals, and summary statistics. This is
//! the contract layer only; the HTTP handlers that expose it live
//! outside the core and every call passes through [`AdminApi::authorize`]
//! first.

use std::{net::IpAddr, sync::Arc};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::*;

use crate::{
    config::Config,
    error::{Error, Result},
    explorer::{Broadcaster, ChainReader},
    seeds::{FairnessView, SeedRegistry},
    store::{
        models::{PayoutStatus, SeedId, ServerSeed, VaultWallet, WalletId},
        Store,
    },
    txbuild::{self, PayoutParams},
    wallets::{NewWallet, WalletVault},
};

pub struct AdminApi<C> {
    store: Arc<Store>,
    wallets: Arc<WalletVault>,
    seeds: Arc<SeedRegistry>,
    chain: C,
    api_key: String,
    ip_whitelist: Vec<IpAddr>,
    cold_storage_address: Option<String>,
    default_fee: u64,
    dust_limit: u64,
    fairness_window_days: i64,
    network: bitcoin::Network,
}

/// Result of a destructive wallet deletion.
#[derive(Clone, Debug, Serialize)]
pub struct WalletDeletion {
    pub deleted: bool,
    /// Present when the wallet had received funds; the caller was warned.
    pub warning: Option<String>,
}

/// A withdrawal broadcast to cold storage.
#[derive(Clone, Debug, Serialize)]
pub struct Withdrawal {
    pub txid: bitcoin::Txid,
    pub from_address: String,
    pub to_address: String,
    pub amount: u64,
    pub fee: u64,
}

/// Wallet listing entry with an optionally refreshed live balance.
#[derive(Clone, Debug, Serialize)]
pub struct WalletSummary {
    #[serde(flatten)]
    pub wallet: VaultWallet,
    pub live_balance_sats: Option<u64>,
}

/// Aggregates over bets and payouts.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SummaryStats {
    pub total_users: usize,
    pub total_wallets: usize,
    pub total_bets: usize,
    pub total_wins: usize,
    pub total_losses: usize,
    pub total_wagered: u64,
    pub total_paid_out: u64,
    pub house_profit: i64,
    pub payouts_pending: usize,
    pub payouts_broadcast: usize,
    pub payouts_confirmed: usize,
    pub payouts_failed: usize,
}

impl<C> AdminApi<C> {
    pub fn new(
        store: Arc<Store>,
        wallets: Arc<WalletVault>,
        seeds: Arc<SeedRegistry>,
        chain: C,
        config: &Config,
    ) -> Self {
        AdminApi {
            store,
            wallets,
            seeds,
            chain,
            api_key: config.admin_api_key.clone(),
            ip_whitelist: config.admin_ip_whitelist.clone(),
            cold_storage_address: config.cold_storage_address.clone(),
            default_fee: config.default_tx_fee_sats,
            dust_limit: config.dust_limit_sats,
            fairness_window_days: config.fairness_window_days,
            network: config.network,
        }
    }

    /// Every admin call requires the API key and a whitelisted source IP.
    pub fn authorize(&self, api_key: &str, remote_ip: IpAddr) -> Result<()> {
        if api_key != self.api_key {
            warn!(%remote_ip, "admin call with bad API key");
            return Err(Error::user("unauthorized"));
        }
        if !self.ip_whitelist.contains(&remote_ip) {
            warn!(%remote_ip, "admin call from non-whitelisted address");
            return Err(Error::user("unauthorized"));
        }
        Ok(())
    }

    // ---- wallets ----------------------------------------------------------

    pub fn create_wallet(&self, req: NewWallet) -> Result<VaultWallet> {
        self.wallets.create_wallet(req)
    }

    pub fn set_wallet_active(&self, id: WalletId, active: bool) -> Result<VaultWallet> {
        self.wallets.set_active(id, active)
    }

    pub fn set_wallet_label(&self, id: WalletId, label: Option<String>) -> Result<VaultWallet> {
        self.store.update_wallet(id, |w| w.label = label.clone())
    }

    /// Destructive. A funded wallet is only deleted with `force`, and the
    /// response still carries the warning.
    pub fn delete_wallet(&self, id: WalletId, force: bool) -> Result<WalletDeletion> {
        let wallet = self.store.wallet(id)?;
        let warning = (wallet.total_received > 0).then(|| {
            format!(
                "wallet {} received {} sat over its lifetime; its key is destroyed with it",
                wallet.address, wallet.total_received
            )
        });
        if warning.is_some() && !force {
            return Ok(WalletDeletion {
                deleted: false,
                warning,
            });
        }
        let deleted = self.store.delete_wallet(id)?;
        if deleted {
            warn!(wallet = %id, address = %wallet.address, "vault wallet deleted");
        }
        Ok(WalletDeletion { deleted, warning })
    }

    // ---- seed calendar ----------------------------------------------------

    pub fn create_seed(&self, date: NaiveDate) -> Result<ServerSeed> {
        self.seeds.admin_create(date)
    }

    pub fn delete_seed(&self, id: SeedId) -> Result<bool> {
        self.seeds.admin_delete(id)
    }

    pub fn fairness_view(&self) -> Result<FairnessView> {
        self.seeds.public_view(self.fairness_window_days)
    }

    // ---- statistics -------------------------------------------------------

    pub fn summary_stats(&self) -> Result<SummaryStats> {
        let mut stats = SummaryStats::default();

        stats.total_wallets = self.store.all_wallets()?.len();

        for bet in self.store.all_bets()? {
            stats.total_bets += 1;
            stats.total_wagered += bet.bet_amount;
            match bet.is_win {
                Some(true) => {
                    stats.total_wins += 1;
                    stats.total_paid_out += bet.payout_amount.unwrap_or(0);
                }
                Some(false) => stats.total_losses += 1,
                None => {}
            }
            if let Some(profit) = bet.profit {
                stats.house_profit -= profit;
            }
        }

        for payout in self.store.all_payouts()? {
            match payout.status {
                PayoutStatus::Pending => stats.payouts_pending += 1,
                PayoutStatus::Broadcast => stats.payouts_broadcast += 1,
                PayoutStatus::Confirmed => stats.payouts_confirmed += 1,
                PayoutStatus::Failed => stats.payouts_failed += 1,
            }
        }

        stats.total_users = self.store.all_users()?.len();
        Ok(stats)
    }
}

impl<C: ChainReader + Broadcaster + Send + Sync> AdminApi<C> {
    /// All wallets, optionally with live balances from the explorer. The
    /// cached `balance_sats` is refreshed for each balance fetched.
    pub async fn list_wallets(&self, with_balances: bool) -> Result<Vec<WalletSummary>> {
        let mut wallets = self.store.all_wallets()?;
        wallets.sort_by_key(|w| (w.multiplier, w.id));

        let mut out = Vec::with_capacity(wallets.len());
        for wallet in wallets {
            let live_balance_sats = if with_balances {
                match self.chain.address_stats(&wallet.address).await {
                    Ok(stats) => {
                        let balance = stats.confirmed_balance();
                        self.store
                            .update_wallet(wallet.id, |w| w.balance_sats = balance)?;
                        Some(balance)
                    }
                    Err(e) => {
                        warn!(address = %wallet.address, error = %e, "balance lookup failed");
                        None
                    }
                }
            } else {
                None
            };
            out.push(WalletSummary {
                wallet,
                live_balance_sats,
            });
        }
        Ok(out)
    }

    // ---- treasury ---------------------------------------------------------

    /// Withdraws part or all of a vault's balance to the configured
    /// cold-storage address, reusing the payout signing path with a flat
    /// fee. `amount` of `None` sweeps everything above the fee.
    pub async fn withdraw_to_cold_storage(
        &self,
        wallet_id: WalletId,
        amount: Option<u64>,
        fee: Option<u64>,
    ) -> Result<Withdrawal> {
        let cold_storage = self
            .cold_storage_address
            .clone()
            .ok_or_else(|| Error::user("no cold storage address configured"))?;
        let wallet = self.store.wallet(wallet_id)?;
        let fee = fee.unwrap_or(self.default_fee);

        let utxos = self
            .chain
            .utxos_of(&wallet.address)
            .await
            .map_err(Error::from)?;
        let total: u64 = utxos.iter().map(|u| u.value).sum();
        if total == 0 {
            return Err(Error::InsufficientFunds {
                needed: fee,
                available: 0,
            });
        }

        let gross = amount.unwrap_or(total);
        if gross > total {
            return Err(Error::InsufficientFunds {
                needed: gross,
                available: total,
            });
        }
        let send = gross.saturating_sub(fee);
        if send <= self.dust_limit {
            return Err(Error::user(format!(
                "amount after fee ({send} sat) is at or below the dust limit"
            )));
        }

        let wif = self.wallets.decrypt_key(&wallet)?;
        let built = txbuild::build_signed_payout(&PayoutParams {
            wif: &wif,
            vault_address: &wallet.address,
            address_kind: wallet.address_kind,
            recipient: &cold_storage,
            amount: send,
            fee,
            dust_limit: self.dust_limit,
            network: self.network,
            utxos: &utxos,
        })?;
        drop(wif);

        let txid = self.chain.broadcast(&built.raw_hex).await.map_err(Error::from)?;
        self.wallets.record_sent(wallet.id, send + built.fee)?;
        info!(
            wallet = %wallet.id,
            %txid,
            amount = send,
            fee = built.fee,
            "treasury withdrawal broadcast"
        );

        Ok(Withdrawal {
            txid,
            from_address: wallet.address,
            to_address: cold_storage,
            amount: send,
            fee: built.fee,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{keyvault::KeyVault, store::models::AddressKind};

    /// Chain-free admin instance; `()` stands in for the explorer since
    /// none of the exercised calls touch it.
    fn api() -> AdminApi<()> {
        let config = Config::for_tests();
        let store = Arc::new(Store::open_temporary().unwrap());
        let keyvault =
            Arc::new(KeyVault::from_base64_key(&KeyVault::generate_master_key()).unwrap());
        let wallets = Arc::new(WalletVault::new(store.clone(), keyvault, &config));
        let seeds = Arc::new(SeedRegistry::new(store.clone()));
        AdminApi::new(store, wallets, seeds, (), &config)
    }

    fn new_wallet(multiplier: u32) -> NewWallet {
        NewWallet {
            multiplier,
            chance: None,
            address_kind: AddressKind::Segwit,
            label: None,
        }
    }

    #[test]
    fn authorize_requires_key_and_ip() {
        let api = api();
        let ok: IpAddr = "127.0.0.1".parse().unwrap();
        let bad: IpAddr = "203.0.113.7".parse().unwrap();
        assert!(api
            .authorize("test-admin-key-test-admin-key-test", ok)
            .is_ok());
        assert!(api.authorize("wrong-key", ok).is_err());
        assert!(api
            .authorize("test-admin-key-test-admin-key-test", bad)
            .is_err());
    }

    #[test]
    fn funded_wallet_deletion_needs_force() {
        let api = api();
        let wallet = api.create_wallet(new_wallet(2)).unwrap();
        api.wallets.record_deposit(wallet.id, 10_000).unwrap();

        let refused = api.delete_wallet(wallet.id, false).unwrap();
        assert!(!refused.deleted);
        assert!(refused.warning.is_some());

        let forced = api.delete_wallet(wallet.id, true).unwrap();
        assert!(forced.deleted);
        assert!(forced.warning.is_some());
        assert!(api
            .wallets
            .wallet_for_address(&wallet.address)
            .unwrap()
            .is_none());
    }

    #[test]
    fn unfunded_wallet_deletes_without_warning() {
        let api = api();
        let wallet = api.create_wallet(new_wallet(3)).unwrap();
        let outcome = api.delete_wallet(wallet.id, false).unwrap();
        assert!(outcome.deleted);
        assert!(outcome.warning.is_none());
    }

    #[test]
    fn summary_stats_start_empty() {
        let api = api();
        let stats = api.summary_stats().unwrap();
        assert_eq!(stats.total_bets, 0);
        assert_eq!(stats.house_profit, 0);
        assert_eq!(stats.payouts_failed, 0);
    }
}
