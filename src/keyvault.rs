//! Envelope encryption for the wallet vault.
//!
//! Per-multiplier private keys are stored only as AES-256-GCM ciphertext;
//! the master key lives in the environment and is never persisted next to
//! the blobs it protects. Decrypted key material is handed out in
//! [`Zeroizing`] buffers and must never be logged.

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use base64::{engine::general_purpose, Engine};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{ConfigError, Error, Result};

/// AES-GCM nonce length in bytes, prepended to each ciphertext.
const NONCE_LEN: usize = 12;

/// Process-wide envelope cipher for private key material.
pub struct KeyVault {
    cipher: Aes256Gcm,
}

impl KeyVault {
    /// Builds the vault from the base64-encoded 32-byte master key.
    ///
    /// A missing or malformed key is a [`ConfigError`] and fatal at
    /// startup.
    pub fn from_base64_key(master_key: &str) -> std::result::Result<Self, ConfigError> {
        let key_bytes = Zeroizing::new(
            general_purpose::STANDARD
                .decode(master_key)
                .map_err(|e| ConfigError::Invalid {
                    key: "MASTER_ENCRYPTION_KEY",
                    reason: format!("not valid base64: {e}"),
                })?,
        );
        let cipher =
            Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| ConfigError::Invalid {
                key: "MASTER_ENCRYPTION_KEY",
                reason: format!("expected 32 bytes, got {}", key_bytes.len()),
            })?;
        Ok(KeyVault { cipher })
    }

    /// Generates a fresh master key suitable for `MASTER_ENCRYPTION_KEY`.
    pub fn generate_master_key() -> String {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        general_purpose::STANDARD.encode(key)
    }

    /// Encrypts a WIF-format private key into a self-contained blob
    /// (`base64(nonce || ciphertext)`), authenticated by the master key.
    pub fn encrypt_wif(&self, wif: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, wif.as_bytes())
            .map_err(|_| Error::integrity("private key encryption failed"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(blob))
    }

    /// Decrypts a blob produced by [`encrypt_wif`](Self::encrypt_wif).
    ///
    /// Returns the plaintext in a [`Zeroizing`] buffer; the caller uses it
    /// to construct a signing key and drops it immediately. Tampered
    /// ciphertext fails authentication and surfaces as an integrity error
    /// (payout-fatal, never retried).
    pub fn decrypt_wif(&self, blob: &str) -> Result<Zeroizing<String>> {
        let raw = general_purpose::STANDARD
            .decode(blob)
            .map_err(|_| Error::integrity("encrypted key blob is not valid base64"))?;
        if raw.len() <= NONCE_LEN {
            return Err(Error::integrity("encrypted key blob is truncated"));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);

        let plaintext = Zeroizing::new(
            self.cipher
                .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
                .map_err(|_| Error::integrity("ciphertext failed authentication"))?,
        );
        String::from_utf8(plaintext.to_vec())
            .map(Zeroizing::new)
            .map_err(|_| Error::integrity("decrypted key is not valid UTF-8"))
    }
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose cipher state.
        f.debug_struct("KeyVault").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn vault() -> KeyVault {
        KeyVault::from_base64_key(&KeyVault::generate_master_key()).expect("fresh key is valid")
    }

    #[test]
    fn round_trip() {
        let vault = vault();
        let wif = "cVt4o7BGAig1UXywgGSmARhxMdzP5qvQsxKkSsc1XEkw3tDTQFpy";
        let blob = vault.encrypt_wif(wif).unwrap();
        assert_ne!(blob, wif);
        let decrypted = vault.decrypt_wif(&blob).unwrap();
        assert_eq!(decrypted.as_str(), wif);
    }

    #[test]
    fn nonces_are_unique_per_encryption() {
        let vault = vault();
        let a = vault.encrypt_wif("same plaintext").unwrap();
        let b = vault.encrypt_wif("same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let vault = vault();
        let blob = vault.encrypt_wif("secret").unwrap();
        let mut raw = general_purpose::STANDARD.decode(&blob).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = general_purpose::STANDARD.encode(raw);

        let err = vault.decrypt_wif(&tampered).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn wrong_master_key_cannot_decrypt() {
        let blob = vault().encrypt_wif("secret").unwrap();
        let other = vault();
        assert!(matches!(
            other.decrypt_wif(&blob),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn malformed_master_key_is_config_fatal() {
        assert!(KeyVault::from_base64_key("not base64 at all!").is_err());
        // Valid base64 but wrong length.
        let short = general_purpose::STANDARD.encode([0u8; 16]);
        assert!(KeyVault::from_base64_key(&short).is_err());
    }
}
