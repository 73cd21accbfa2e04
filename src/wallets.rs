//! Encrypted wallet vault service.
//!
//! Each vault wallet binds a fixed payout multiplier to one Bitcoin
//! address; deposits to that address become bets at that multiplier, and
//! payouts are signed with the same wallet's key. Private keys exist in
//! plaintext only inside a signing attempt; at rest they are AES-GCM
//! blobs under the process master key.

use std::sync::Arc;

use bitcoin::{Address, CompressedPublicKey, Network, PrivateKey};
use chrono::Utc;
use secp256k1::{Keypair, Secp256k1, SecretKey};
use tracing::*;
use zeroize::Zeroizing;

use crate::{
    config::Config,
    error::{Error, Result},
    fair,
    keyvault::KeyVault,
    store::{
        models::{AddressKind, VaultWallet, WalletId},
        Inserted, Store,
    },
};

/// Parameters for creating a vault wallet. When `chance` is omitted the
/// default derived from the house edge is used.
#[derive(Clone, Debug)]
pub struct NewWallet {
    pub multiplier: u32,
    pub chance: Option<f64>,
    pub address_kind: AddressKind,
    pub label: Option<String>,
}

pub struct WalletVault {
    store: Arc<Store>,
    keyvault: Arc<KeyVault>,
    network: Network,
    house_edge: f64,
    min_multiplier: f64,
    max_multiplier: f64,
}

impl WalletVault {
    pub fn new(store: Arc<Store>, keyvault: Arc<KeyVault>, config: &Config) -> Self {
        WalletVault {
            store,
            keyvault,
            network: config.network,
            house_edge: config.house_edge,
            min_multiplier: config.min_multiplier,
            max_multiplier: config.max_multiplier,
        }
    }

    /// Generates a fresh key, encrypts it, and stores the wallet.
    ///
    /// Enforces the creation invariant
    /// `chance × multiplier ≤ 100 − house_edge_percent`: no wallet may
    /// offer a positive-expected-value bet.
    pub fn create_wallet(&self, req: NewWallet) -> Result<VaultWallet> {
        let multiplier = f64::from(req.multiplier);
        if req.multiplier == 0
            || multiplier < self.min_multiplier
            || multiplier > self.max_multiplier
        {
            return Err(Error::user(format!(
                "multiplier {} outside [{}, {}]",
                req.multiplier, self.min_multiplier, self.max_multiplier
            )));
        }

        let chance = req
            .chance
            .unwrap_or_else(|| fair::win_chance_for_multiplier(multiplier, self.house_edge));
        if !(chance > 0.0 && chance < 100.0) {
            return Err(Error::user(format!("chance {chance} outside (0, 100)")));
        }
        let ceiling = 100.0 - self.house_edge * 100.0;
        if chance * multiplier > ceiling + 1e-9 {
            return Err(Error::user(format!(
                "chance {chance} x multiplier {} exceeds {ceiling}",
                req.multiplier
            )));
        }

        let secp = Secp256k1::new();
        let secret = SecretKey::new(&mut secp256k1::rand::thread_rng());
        let private_key = PrivateKey::new(secret, self.network);
        let address = derive_address(&secp, &private_key, req.address_kind, self.network)?;

        let wif = Zeroizing::new(private_key.to_wif());
        let encrypted_private_key = self.keyvault.encrypt_wif(&wif)?;
        drop(wif);

        let now = Utc::now();
        let wallet = VaultWallet {
            id: WalletId(self.store.alloc_id()?),
            multiplier: req.multiplier,
            chance,
            address: address.to_string(),
            address_kind: req.address_kind,
            network: self.network,
            encrypted_private_key,
            is_active: true,
            is_depleted: false,
            total_received: 0,
            total_sent: 0,
            bet_count: 0,
            balance_sats: 0,
            label: req
                .label
                .or_else(|| Some(format!("{}x multiplier wallet", req.multiplier))),
            created_at: now,
            updated_at: now,
        };

        match self.store.insert_wallet(wallet)? {
            Inserted::Created(wallet) => {
                info!(
                    multiplier = wallet.multiplier,
                    address = %wallet.address,
                    "created vault wallet"
                );
                Ok(wallet)
            }
            // A fresh key colliding with an existing address means the
            // store is lying or the RNG is broken.
            Inserted::Existing(_) => Err(Error::integrity("fresh wallet address already exists")),
        }
    }

    /// Active wallet for a multiplier, if any.
    pub fn wallet_for_multiplier(&self, multiplier: u32) -> Result<Option<VaultWallet>> {
        let mut candidates: Vec<VaultWallet> = self
            .store
            .all_wallets()?
            .into_iter()
            .filter(|w| w.is_active && w.multiplier == multiplier && w.network == self.network)
            .collect();
        candidates.sort_by_key(|w| w.id);
        Ok(candidates.into_iter().next())
    }

    pub fn wallet_for_address(&self, address: &str) -> Result<Option<VaultWallet>> {
        self.store.wallet_by_address(address)
    }

    /// Active wallets ordered by multiplier.
    pub fn list_active(&self) -> Result<Vec<VaultWallet>> {
        let mut wallets: Vec<VaultWallet> = self
            .store
            .all_wallets()?
            .into_iter()
            .filter(|w| w.is_active && w.network == self.network)
            .collect();
        wallets.sort_by_key(|w| (w.multiplier, w.id));
        Ok(wallets)
    }

    /// Sorted distinct multipliers with an active wallet.
    pub fn list_multipliers(&self) -> Result<Vec<u32>> {
        let mut multipliers: Vec<u32> = self
            .list_active()?
            .into_iter()
            .map(|w| w.multiplier)
            .collect();
        multipliers.dedup();
        Ok(multipliers)
    }

    /// Decrypts the wallet's signing key. Scope the result tightly and
    /// never log anything derived from it.
    pub fn decrypt_key(&self, wallet: &VaultWallet) -> Result<Zeroizing<String>> {
        self.keyvault.decrypt_wif(&wallet.encrypted_private_key)
    }

    /// Records a deposit against the wallet's lifetime stats.
    pub fn record_deposit(&self, id: WalletId, amount: u64) -> Result<VaultWallet> {
        self.store.update_wallet(id, |w| {
            w.total_received += amount;
            w.bet_count += 1;
        })
    }

    /// Records an outgoing payout (amount plus network fee).
    pub fn record_sent(&self, id: WalletId, amount: u64) -> Result<VaultWallet> {
        self.store.update_wallet(id, |w| {
            w.total_sent += amount;
        })
    }

    pub fn mark_depleted(&self, id: WalletId, depleted: bool) -> Result<VaultWallet> {
        if depleted {
            warn!(wallet = %id, "marking vault wallet depleted");
        }
        self.store.update_wallet(id, |w| w.is_depleted = depleted)
    }

    pub fn set_active(&self, id: WalletId, active: bool) -> Result<VaultWallet> {
        self.store.update_wallet(id, |w| w.is_active = active)
    }
}

fn derive_address(
    secp: &Secp256k1<secp256k1::All>,
    private_key: &PrivateKey,
    kind: AddressKind,
    network: Network,
) -> Result<Address> {
    let address = match kind {
        AddressKind::Legacy => Address::p2pkh(private_key.public_key(secp), network),
        AddressKind::Segwit => {
            let compressed = CompressedPublicKey::from_private_key(secp, private_key)
                .map_err(|_| Error::integrity("generated key is not compressed"))?;
            Address::p2wpkh(&compressed, network)
        }
        AddressKind::Taproot => {
            let keypair = Keypair::from_secret_key(secp, &private_key.inner);
            let (xonly, _) = keypair.x_only_public_key();
            Address::p2tr(secp, xonly, None, network)
        }
    };
    Ok(address)
}

#[cfg(test)]
mod test {
    use super::*;

    fn vault() -> WalletVault {
        let store = Arc::new(Store::open_temporary().unwrap());
        let keyvault =
            Arc::new(KeyVault::from_base64_key(&KeyVault::generate_master_key()).unwrap());
        WalletVault::new(store, keyvault, &Config::for_tests())
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
    fn create_and_look_up_by_address_and_multiplier() {
        let vault = vault();
        let wallet = vault.create_wallet(new_wallet(2)).unwrap();
        assert_eq!(wallet.chance, 49.0); // (100 - 2) / 2
        assert!(wallet.address.starts_with("tb1q"));

        let by_addr = vault.wallet_for_address(&wallet.address).unwrap().unwrap();
        assert_eq!(by_addr.id, wallet.id);
        let by_mult = vault.wallet_for_multiplier(2).unwrap().unwrap();
        assert_eq!(by_mult.id, wallet.id);
        assert!(vault.wallet_for_multiplier(3).unwrap().is_none());
    }

    #[test]
    fn rejects_positive_ev_chance() {
        let vault = vault();
        // 60% at 2x pays out 120% of stake on expectation.
        let err = vault
            .create_wallet(NewWallet {
                chance: Some(60.0),
                ..new_wallet(2)
            })
            .unwrap_err();
        assert!(matches!(err, Error::User(_)));
    }

    #[test]
    fn rejects_out_of_bounds_multiplier() {
        let vault = vault();
        assert!(vault.create_wallet(new_wallet(0)).is_err());
        assert!(vault.create_wallet(new_wallet(500)).is_err());
    }

    #[test]
    fn key_round_trips_through_the_vault() {
        let vault = vault();
        let wallet = vault.create_wallet(new_wallet(2)).unwrap();
        let wif = vault.decrypt_key(&wallet).unwrap();
        let key = PrivateKey::from_wif(&wif).unwrap();
        let secp = Secp256k1::new();
        let compressed = CompressedPublicKey::from_private_key(&secp, &key).unwrap();
        assert_eq!(
            Address::p2wpkh(&compressed, Network::Testnet).to_string(),
            wallet.address
        );
    }

    #[test]
    fn address_kinds_derive_distinct_scripts() {
        let vault = vault();
        let legacy = vault
            .create_wallet(NewWallet {
                address_kind: AddressKind::Legacy,
                ..new_wallet(2)
            })
            .unwrap();
        let taproot = vault
            .create_wallet(NewWallet {
                address_kind: AddressKind::Taproot,
                ..new_wallet(3)
            })
            .unwrap();
        assert!(legacy.address.starts_with('m') || legacy.address.starts_with('n'));
        assert!(taproot.address.starts_with("tb1p"));
    }

    #[test]
    fn multiplier_listing_is_sorted_and_distinct() {
        let vault = vault();
        vault.create_wallet(new_wallet(10)).unwrap();
        vault.create_wallet(new_wallet(2)).unwrap();
        vault.create_wallet(new_wallet(10)).unwrap(); // second 10x wallet
        let active = vault.list_active().unwrap();
        assert_eq!(active.len(), 3);
        assert_eq!(vault.list_multipliers().unwrap(), vec![2, 10]);
    }

    #[test]
    fn deactivated_wallets_leave_the_lookup() {
        let vault = vault();
        let wallet = vault.create_wallet(new_wallet(2)).unwrap();
        vault.set_active(wallet.id, false).unwrap();
        assert!(vault.wallet_for_multiplier(2).unwrap().is_none());
        // Address lookup still resolves (deposits to a retired address
        // must still find their wallet).
        assert!(vault.wallet_for_address(&wallet.address).unwrap().is_some());
    }
}
