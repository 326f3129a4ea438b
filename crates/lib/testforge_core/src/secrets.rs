//! Provider access tokens at rest.
//!
//! Sealed with AES-256-GCM under a key derived from `TOKEN_ENCRYPTION_KEY`.
//! The account's provider user ID is bound in as associated data, so a sealed
//! token copied onto another account row fails to open. Stored form is
//! base64 of `nonce || ciphertext || tag`.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Encryption error: {0}")]
    Encrypt(String),

    #[error("Decryption error: {0}")]
    Decrypt(String),
}

/// Key material for sealing provider tokens.
#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; 32],
}

impl TokenCipher {
    /// Derive the AES key from a passphrase (SHA-256).
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }

    /// Seal `token` for the account identified by `provider_user_id`.
    pub fn seal(&self, token: &str, provider_user_id: &str) -> Result<String, SecretError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let sealed = self
            .cipher()
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: token.as_bytes(),
                    aad: provider_user_id.as_bytes(),
                },
            )
            .map_err(|e| SecretError::Encrypt(e.to_string()))?;

        let mut out = nonce.to_vec();
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }

    /// Open a token sealed by [`TokenCipher::seal`] for the same account.
    pub fn open(&self, sealed_b64: &str, provider_user_id: &str) -> Result<String, SecretError> {
        let raw = STANDARD
            .decode(sealed_b64)
            .map_err(|e| SecretError::Decrypt(format!("base64: {e}")))?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(SecretError::Decrypt("sealed token too short".into()));
        }
        let (nonce, body) = raw.split_at(NONCE_LEN);
        let plain = self
            .cipher()
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: body,
                    aad: provider_user_id.as_bytes(),
                },
            )
            .map_err(|_| SecretError::Decrypt("authentication failed".into()))?;
        String::from_utf8(plain).map_err(|e| SecretError::Decrypt(format!("utf-8: {e}")))
    }
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCipher(<redacted>)")
    }
}
