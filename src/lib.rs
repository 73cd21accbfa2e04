//! `dicevault` — a provably-fair Bitcoin dice settlement service.
//!
//! Deposits to per-multiplier vault addresses become bets; a committed
//! daily server seed and the bettor's address-derived client seed drive a
//! deterministic HMAC-SHA-512 roll; winning bets are paid back on-chain
//! from the vault that received them. Every outcome is publicly
//! verifiable once the day's seed is revealed.

pub mod admin;
pub mod bets;
pub mod config;
pub mod error;
pub mod events;
pub mod explorer;
pub mod fair;
pub mod ingest;
pub mod keyvault;
pub mod payout;
pub mod seeds;
pub mod store;
pub mod txbuild;
pub mod views;
pub mod wallets;

pub use config::Config;
pub use error::{Error, Result};
