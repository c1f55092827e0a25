//! Token encryption at rest.
//!
//! A [`TokenCipher`] seals each token with AES-256-GCM under a key derived
//! from the configured passphrase. The owning `server_id` is bound in as
//! associated data, so a ciphertext copied onto another credential row no
//! longer opens. Stored form: base64 of `nonce || ciphertext || tag`.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::StoreError;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AES-256-GCM cipher for credential tokens.
#[derive(Clone)]
pub struct TokenCipher {
    aead: Aes256Gcm,
}

impl TokenCipher {
    /// Derive the key as SHA-256 of `passphrase`.
    pub fn new(passphrase: &str) -> Self {
        // SHA-256 output is exactly the AES-256 key length.
        let digest = Sha256::digest(passphrase.as_bytes());
        Self {
            aead: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&digest)),
        }
    }

    /// Encrypt `token` for the row of `server_id`.
    pub fn seal(&self, server_id: &str, token: &str) -> Result<String, StoreError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let sealed = self
            .aead
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: token.as_bytes(),
                    aad: server_id.as_bytes(),
                },
            )
            .map_err(|_| StoreError::Encryption(format!("{server_id}: cannot seal token")))?;

        let mut stored = Vec::with_capacity(NONCE_LEN + sealed.len());
        stored.extend_from_slice(&nonce);
        stored.extend_from_slice(&sealed);
        Ok(BASE64.encode(stored))
    }

    /// Decrypt a value [`Self::seal`]ed for the same `server_id`.
    ///
    /// Fails on a wrong key, on tampering, and on a ciphertext that belongs
    /// to another server.
    pub fn open(&self, server_id: &str, stored: &str) -> Result<String, StoreError> {
        let raw = BASE64
            .decode(stored)
            .map_err(|e| StoreError::Encryption(format!("{server_id}: bad base64: {e}")))?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(StoreError::Encryption(format!(
                "{server_id}: ciphertext too short"
            )));
        }

        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let token = self
            .aead
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: server_id.as_bytes(),
                },
            )
            .map_err(|_| {
                StoreError::Encryption(format!(
                    "{server_id}: token does not authenticate for this server"
                ))
            })?;

        String::from_utf8(token)
            .map_err(|e| StoreError::Encryption(format!("{server_id}: token is not UTF-8: {e}")))
    }
}
