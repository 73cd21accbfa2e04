//! Provably-fair roll derivation.
//!
//! A roll is a pure function of `(server_seed, client_seed, nonce)`:
//!
//! 1. `H = HMAC-SHA-512(key = server_seed, msg = "{client_seed}:{nonce}")`
//! 2. The first 8 hex characters of `H` (the first four bytes, big-endian)
//!    form an unsigned 32-bit integer `n`.
//! 3. `roll = (n mod 10_000) / 100`, a value in `[0.00, 99.99]`.
//!
//! The server seed is committed in advance by publishing
//! `SHA-256(server_seed)`; after the seed's calendar day has passed the
//! seed itself is revealed and anyone can re-run the derivation.

use hex::DisplayHex;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256, Sha512};

type HmacSha512 = Hmac<Sha512>;

/// Number of distinct roll outcomes (`0.00` through `99.99`).
const ROLL_STEPS: u32 = 10_000;

/// Bytes of entropy behind each daily server seed.
const SERVER_SEED_BYTES: usize = 128;

/// Computes the roll for a seed triple. Deterministic; the same inputs
/// always produce the same value in `[0.00, 99.99]`.
pub fn roll(server_seed: &str, client_seed: &str, nonce: u64) -> f64 {
    let digest = roll_hmac(server_seed, client_seed, nonce);
    let lead = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    f64::from(lead % ROLL_STEPS) / 100.0
}

fn roll_hmac(server_seed: &str, client_seed: &str, nonce: u64) -> [u8; 64] {
    let mut mac = HmacSha512::new_from_slice(server_seed.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(format!("{client_seed}:{nonce}").as_bytes());
    mac.finalize().into_bytes().into()
}

/// SHA-256 commitment of a server seed, published before any roll uses it.
pub fn seed_hash(server_seed: &str) -> String {
    Sha256::digest(server_seed.as_bytes()).as_slice().to_lower_hex_string()
}

/// Generates a fresh server seed from OS randomness, hex-encoded.
pub fn generate_server_seed() -> String {
    let mut bytes = [0u8; SERVER_SEED_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.as_slice().to_lower_hex_string()
}

/// A roll wins when it lands strictly below the wallet's chance threshold.
///
/// With `chance = 50.0`, rolls `0.00..=49.99` win and `50.00..=99.99` lose.
pub fn is_winning_roll(roll: f64, chance: f64) -> bool {
    roll < chance
}

/// Payout for a settled bet: `bet_amount × multiplier` on a win, zero on a
/// loss.
pub fn payout_amount(bet_amount: u64, multiplier: u32, is_win: bool) -> u64 {
    if is_win {
        bet_amount.saturating_mul(u64::from(multiplier))
    } else {
        0
    }
}

/// Signed profit: `payout − bet_amount` on a win, `−bet_amount` on a loss.
pub fn profit(bet_amount: u64, payout: u64, is_win: bool) -> i64 {
    if is_win {
        payout as i64 - bet_amount as i64
    } else {
        -(bet_amount as i64)
    }
}

/// Default win chance for a multiplier under the configured house edge:
/// `(100 − edge%) / multiplier`, rounded to two decimals.
///
/// Advisory only. The chance stored on a vault wallet is authoritative for
/// win determination; this exists to suggest a value at wallet creation.
pub fn win_chance_for_multiplier(multiplier: f64, house_edge: f64) -> f64 {
    let edge_percent = house_edge * 100.0;
    round2((100.0 - edge_percent) / multiplier)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Full audit record for a claimed roll, with every intermediate value a
/// verifier needs to reproduce the derivation by hand.
#[derive(Clone, Debug, Serialize)]
pub struct RollVerification {
    pub server_seed: String,
    pub server_seed_hash: String,
    pub hash_valid: bool,
    pub client_seed: String,
    pub nonce: u64,
    pub hmac_sha512: String,
    pub hmac_first_8: String,
    pub hmac_decimal: u32,
    pub recomputed_roll: f64,
    pub claimed_roll: f64,
    pub roll_valid: bool,
    pub valid: bool,
}

/// Recomputes a roll from a revealed seed and checks both the seed
/// commitment and the claimed outcome.
pub fn verify(
    server_seed: &str,
    server_seed_hash: &str,
    client_seed: &str,
    nonce: u64,
    claimed_roll: f64,
) -> RollVerification {
    let digest = roll_hmac(server_seed, client_seed, nonce);
    let hmac_hex = digest.as_slice().to_lower_hex_string();
    let lead = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let recomputed = f64::from(lead % ROLL_STEPS) / 100.0;

    let hash_valid = seed_hash(server_seed) == server_seed_hash;
    // Rolls are quantized to hundredths; anything closer than half a step
    // is the same outcome.
    let roll_valid = (recomputed - claimed_roll).abs() < 0.005;

    RollVerification {
        server_seed: server_seed.to_owned(),
        server_seed_hash: server_seed_hash.to_owned(),
        hash_valid,
        client_seed: client_seed.to_owned(),
        nonce,
        hmac_first_8: hmac_hex[..8].to_owned(),
        hmac_sha512: hmac_hex,
        hmac_decimal: lead,
        recomputed_roll: recomputed,
        claimed_roll,
        roll_valid,
        valid: hash_valid && roll_valid,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roll_is_deterministic_and_in_range() {
        let seeds = [
            ("a", "tb1qclientseed", 0u64),
            ("0xdeadbeef", "tb1qclientseed", 1),
            ("another server seed", "bc1quser", 41),
            ("", "", 0),
        ];
        for (server, client, nonce) in seeds {
            let first = roll(server, client, nonce);
            for _ in 0..8 {
                assert_eq!(first, roll(server, client, nonce));
            }
            assert!((0.0..=99.99).contains(&first), "roll {first} out of range");
            // Quantized to hundredths.
            assert_eq!(first, (first * 100.0).round() / 100.0);
        }
    }

    #[test]
    fn distinct_nonces_change_the_roll_somewhere() {
        // Not a guarantee for any single pair, but over 100 nonces a
        // constant output would mean the nonce is ignored.
        let rolls: Vec<f64> = (0..100).map(|n| roll("seed", "client", n)).collect();
        assert!(rolls.windows(2).any(|w| w[0] != w[1]));
    }

    #[test]
    fn seed_hash_binds_the_seed() {
        let seed = generate_server_seed();
        assert_eq!(seed.len(), 256); // 128 bytes, hex-encoded
        let hash = seed_hash(&seed);
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, seed_hash(&seed));
        assert_ne!(hash, seed_hash(&generate_server_seed()));
    }

    #[test]
    fn win_predicate_is_strict() {
        assert!(is_winning_roll(49.99, 50.0));
        assert!(!is_winning_roll(50.0, 50.0));
        assert!(!is_winning_roll(99.99, 50.0));
        assert!(is_winning_roll(0.0, 0.01));
    }

    #[test]
    fn payout_arithmetic() {
        assert_eq!(payout_amount(10_000, 2, true), 20_000);
        assert_eq!(payout_amount(10_000, 2, false), 0);
        assert_eq!(profit(10_000, 20_000, true), 10_000);
        assert_eq!(profit(10_000, 0, false), -10_000);
    }

    #[test]
    fn chance_derivation_applies_house_edge() {
        assert_eq!(win_chance_for_multiplier(2.0, 0.02), 49.0);
        assert_eq!(win_chance_for_multiplier(2.0, 0.0), 50.0);
        assert_eq!(win_chance_for_multiplier(10.0, 0.02), 9.8);
    }

    #[test]
    fn verify_accepts_honest_rolls_and_rejects_forgeries() {
        let server = generate_server_seed();
        let hash = seed_hash(&server);
        let outcome = roll(&server, "tb1qclient", 7);

        let honest = verify(&server, &hash, "tb1qclient", 7, outcome);
        assert!(honest.hash_valid);
        assert!(honest.roll_valid);
        assert!(honest.valid);
        assert_eq!(honest.recomputed_roll, outcome);
        assert_eq!(honest.hmac_first_8.len(), 8);

        // A different claimed outcome fails roll verification.
        let forged_roll = verify(&server, &hash, "tb1qclient", 7, (outcome + 1.0) % 100.0);
        assert!(!forged_roll.valid);

        // A swapped seed fails the hash commitment.
        let forged_seed = verify(&generate_server_seed(), &hash, "tb1qclient", 7, outcome);
        assert!(!forged_seed.hash_valid);
        assert!(!forged_seed.valid);
    }
}
