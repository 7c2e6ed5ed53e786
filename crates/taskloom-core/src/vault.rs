//! Symmetric secret vault for user-supplied API keys.
//!
//! The contract is a byte-for-byte round trip: `decrypt(encrypt(x)) == x`.
//! The default implementation derives an AES-256-GCM key from a master key
//! with PBKDF2-HMAC-SHA256 and prepends the random nonce to the ciphertext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use sha2::Sha256;

use crate::error::TaskloomError;

const KDF_ITERATIONS: u32 = 100_000;
const KDF_SALT: &[u8] = b"taskloom_vault_salt";
const NONCE_LEN: usize = 12;

pub trait Vault: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, TaskloomError>;
    fn decrypt(&self, token: &str) -> Result<Vec<u8>, TaskloomError>;
}

pub struct AesGcmVault {
    cipher: Aes256Gcm,
}

impl AesGcmVault {
    pub fn new(master_key: &str) -> Self {
        let mut key_bytes = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            master_key.as_bytes(),
            KDF_SALT,
            KDF_ITERATIONS,
            &mut key_bytes,
        );
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Master key from `TASKLOOM_MASTER_KEY`; refuses to run without one so
    /// a deployment cannot silently fall back to a known key.
    pub fn from_env() -> Result<Self, TaskloomError> {
        let master_key = std::env::var("TASKLOOM_MASTER_KEY")
            .map_err(|_| TaskloomError::Vault("TASKLOOM_MASTER_KEY is not set".to_string()))?;
        if master_key.trim().is_empty() {
            return Err(TaskloomError::Vault(
                "TASKLOOM_MASTER_KEY is empty".to_string(),
            ));
        }
        Ok(Self::new(&master_key))
    }
}

impl Vault for AesGcmVault {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, TaskloomError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| TaskloomError::Vault("encryption failed".to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    fn decrypt(&self, token: &str) -> Result<Vec<u8>, TaskloomError> {
        let combined = BASE64
            .decode(token)
            .map_err(|err| TaskloomError::Vault(format!("invalid token encoding: {err}")))?;
        if combined.len() <= NONCE_LEN {
            return Err(TaskloomError::Vault("token too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| TaskloomError::Vault("invalid token or master key mismatch".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_bytes() {
        let vault = AesGcmVault::new("test-master-key");
        for payload in [
            b"".as_slice(),
            b"sk-abc123".as_slice(),
            b"\x00\x01\xff\xfe binary".as_slice(),
        ] {
            let token = vault.encrypt(payload).unwrap();
            assert_eq!(vault.decrypt(&token).unwrap(), payload);
        }
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let vault = AesGcmVault::new("test-master-key");
        let a = vault.encrypt(b"same input").unwrap();
        let b = vault.encrypt(b"same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_master_key_fails_closed() {
        let vault = AesGcmVault::new("key-one");
        let other = AesGcmVault::new("key-two");
        let token = vault.encrypt(b"secret").unwrap();
        assert!(other.decrypt(&token).is_err());
    }

    #[test]
    fn tampered_token_is_rejected() {
        let vault = AesGcmVault::new("test-master-key");
        let token = vault.encrypt(b"secret").unwrap();
        let mut bytes = BASE64.decode(&token).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = BASE64.encode(bytes);
        assert!(vault.decrypt(&tampered).is_err());
    }
}
