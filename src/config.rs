use std::{env, net::IpAddr, path::PathBuf, str::FromStr, time::Duration};

use bitcoin::Network;

use crate::error::ConfigError;

/// Deployment profile selected by `ENV_CURRENT`.
///
/// The profile fixes the database location, the Bitcoin network, and the
/// explorer endpoint set; nothing else is allowed to disagree with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Profile {
    Production,
    Test,
}

/// Typed service configuration, loaded once at startup.
///
/// Every external knob is enumerated here; components receive the values
/// they need through constructors and never read the environment
/// themselves.
#[derive(Clone, Debug)]
pub struct Config {
    pub profile: Profile,
    /// Derived from the profile; must match what the explorer serves.
    pub network: Network,
    pub db_path: PathBuf,
    /// Base64-encoded 32-byte master key for the wallet vault.
    pub master_encryption_key: String,

    pub min_bet_sats: u64,
    pub max_bet_sats: u64,
    pub min_multiplier: f64,
    pub max_multiplier: f64,
    /// House edge as a fraction in `[0, 1)`.
    pub house_edge: f64,
    pub min_confirmations_payout: u32,

    pub default_tx_fee_sats: u64,
    pub fee_buffer_sats: u64,
    pub dust_limit_sats: u64,

    pub api_request_timeout: Duration,
    pub broadcast_timeout: Duration,

    pub ws_ping_interval: Duration,
    pub ws_ping_timeout: Duration,
    pub ws_reconnect_delay: Duration,
    pub ws_max_reconnect_delay: Duration,

    /// Primary explorer REST endpoint.
    pub mempool_api: String,
    /// Explorer live WebSocket endpoint.
    pub mempool_ws: String,
    /// Secondary REST endpoint used when the primary fails a broadcast.
    pub blockstream_api: String,

    pub admin_api_key: String,
    pub admin_ip_whitelist: Vec<IpAddr>,
    pub cold_storage_address: Option<String>,

    /// Delay before the first UTXO fetch of a payout attempt, letting the
    /// explorer index the just-received deposit.
    pub settle_delay: Duration,
    pub max_payout_retries: u32,
    pub payout_workers: usize,
    pub sweep_interval: Duration,
    pub sweep_page_size: usize,
    /// How many seed-calendar days back the public fairness view reaches.
    pub fairness_window_days: i64,
}

fn var(key: &'static str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_owned()).filter(|v| !v.is_empty())
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
    }
}

fn secs(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_var(key, default)?))
}

impl Config {
    /// Loads the configuration from the environment and validates it.
    ///
    /// Missing or malformed critical values are fatal; the caller is
    /// expected to abort the process.
    pub fn from_env() -> Result<Self, ConfigError> {
        let profile = if parse_var("ENV_CURRENT", false)? {
            Profile::Production
        } else {
            Profile::Test
        };
        let network = match profile {
            Profile::Production => Network::Bitcoin,
            Profile::Test => Network::Testnet,
        };
        let (default_api, default_ws, default_secondary, default_db) = match profile {
            Profile::Production => (
                "https://mempool.space/api",
                "wss://mempool.space/api/v1/ws",
                "https://blockstream.info/api",
                "dicevault.sled",
            ),
            Profile::Test => (
                "https://mempool.space/testnet/api",
                "wss://mempool.space/testnet/api/v1/ws",
                "https://blockstream.info/testnet/api",
                "dicevault-test.sled",
            ),
        };

        let admin_ip_whitelist = var("ADMIN_IP_WHITELIST")
            .unwrap_or_else(|| "127.0.0.1,::1".to_owned())
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                s.trim().parse().map_err(|_| ConfigError::Invalid {
                    key: "ADMIN_IP_WHITELIST",
                    reason: format!("{} is not an IP address", s.trim()),
                })
            })
            .collect::<Result<Vec<IpAddr>, _>>()?;

        let config = Config {
            profile,
            network,
            db_path: PathBuf::from(var("DB_PATH").unwrap_or_else(|| default_db.to_owned())),
            master_encryption_key: var("MASTER_ENCRYPTION_KEY")
                .ok_or(ConfigError::Missing("MASTER_ENCRYPTION_KEY"))?,

            min_bet_sats: parse_var("MIN_BET_SATOSHIS", 600)?,
            max_bet_sats: parse_var("MAX_BET_SATOSHIS", 1_000_000)?,
            min_multiplier: parse_var("MIN_MULTIPLIER", 1.1)?,
            max_multiplier: parse_var("MAX_MULTIPLIER", 98.0)?,
            house_edge: parse_var("HOUSE_EDGE", 0.02)?,
            min_confirmations_payout: parse_var("MIN_CONFIRMATIONS_PAYOUT", 0)?,

            default_tx_fee_sats: parse_var("DEFAULT_TX_FEE_SATOSHIS", 250)?,
            fee_buffer_sats: parse_var("FEE_BUFFER_SATOSHIS", 1_000)?,
            dust_limit_sats: parse_var("DUST_LIMIT_SATOSHIS", 546)?,

            api_request_timeout: secs("API_REQUEST_TIMEOUT", 10)?,
            broadcast_timeout: secs("BROADCAST_TIMEOUT", 15)?,

            ws_ping_interval: secs("WS_PING_INTERVAL", 30)?,
            ws_ping_timeout: secs("WS_PING_TIMEOUT", 20)?,
            ws_reconnect_delay: secs("WS_RECONNECT_DELAY", 5)?,
            ws_max_reconnect_delay: secs("WS_MAX_RECONNECT_DELAY", 60)?,

            mempool_api: var("MEMPOOL_API").unwrap_or_else(|| default_api.to_owned()),
            mempool_ws: var("MEMPOOL_WS").unwrap_or_else(|| default_ws.to_owned()),
            blockstream_api: var("BLOCKSTREAM_API")
                .unwrap_or_else(|| default_secondary.to_owned()),

            admin_api_key: var("ADMIN_API_KEY").ok_or(ConfigError::Missing("ADMIN_API_KEY"))?,
            admin_ip_whitelist,
            cold_storage_address: var("COLD_STORAGE_ADDRESS"),

            settle_delay: secs("PAYOUT_SETTLE_DELAY", 3)?,
            max_payout_retries: parse_var("PAYOUT_MAX_RETRIES", 3)?,
            payout_workers: parse_var("PAYOUT_WORKERS", 4)?,
            sweep_interval: secs("SWEEP_INTERVAL", 60)?,
            sweep_page_size: parse_var("SWEEP_PAGE_SIZE", 100)?,
            fairness_window_days: parse_var("FAIRNESS_WINDOW_DAYS", 30)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the cross-field invariants the loaders cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.house_edge) {
            return Err(ConfigError::Invalid {
                key: "HOUSE_EDGE",
                reason: "must be in [0, 1)".into(),
            });
        }
        if self.min_bet_sats == 0 {
            return Err(ConfigError::Invalid {
                key: "MIN_BET_SATOSHIS",
                reason: "must be positive".into(),
            });
        }
        if self.max_bet_sats < self.min_bet_sats {
            return Err(ConfigError::Invalid {
                key: "MAX_BET_SATOSHIS",
                reason: "must be >= MIN_BET_SATOSHIS".into(),
            });
        }
        if self.min_multiplier < 1.0 || self.max_multiplier < self.min_multiplier {
            return Err(ConfigError::Invalid {
                key: "MIN_MULTIPLIER",
                reason: "multiplier bounds must satisfy 1.0 <= min <= max".into(),
            });
        }
        if self.admin_api_key.len() < 32 {
            return Err(ConfigError::Invalid {
                key: "ADMIN_API_KEY",
                reason: "must be at least 32 characters".into(),
            });
        }
        if self.payout_workers == 0 || self.sweep_page_size == 0 {
            return Err(ConfigError::Invalid {
                key: "PAYOUT_WORKERS",
                reason: "worker pool and sweep page size must be positive".into(),
            });
        }
        Ok(())
    }

    /// A baseline configuration for tests: testnet profile, permissive
    /// bounds, zero settle delay so scenario tests run without sleeping.
    pub fn for_tests() -> Self {
        Config {
            profile: Profile::Test,
            network: Network::Testnet,
            db_path: PathBuf::from("unused"),
            master_encryption_key: String::new(),
            min_bet_sats: 600,
            max_bet_sats: 1_000_000,
            min_multiplier: 1.1,
            max_multiplier: 98.0,
            house_edge: 0.02,
            min_confirmations_payout: 0,
            default_tx_fee_sats: 250,
            fee_buffer_sats: 1_000,
            dust_limit_sats: 546,
            api_request_timeout: Duration::from_secs(10),
            broadcast_timeout: Duration::from_secs(15),
            ws_ping_interval: Duration::from_secs(30),
            ws_ping_timeout: Duration::from_secs(20),
            ws_reconnect_delay: Duration::from_secs(5),
            ws_max_reconnect_delay: Duration::from_secs(60),
            mempool_api: "http://127.0.0.1:3000".into(),
            mempool_ws: "ws://127.0.0.1:3000/ws".into(),
            blockstream_api: "http://127.0.0.1:3001".into(),
            admin_api_key: "test-admin-key-test-admin-key-test".into(),
            admin_ip_whitelist: vec!["127.0.0.1".parse().expect("valid literal")],
            cold_storage_address: None,
            settle_delay: Duration::ZERO,
            max_payout_retries: 3,
            payout_workers: 4,
            sweep_interval: Duration::from_secs(60),
            sweep_page_size: 100,
            fairness_window_days: 30,
        }
    }
}
