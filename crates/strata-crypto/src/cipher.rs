//! Passphrase-keyed AEAD sealing using ChaCha20-Poly1305

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};

use strata_core::{StrataError, StrataResult};

/// Key size for ChaCha20-Poly1305
pub const KEY_SIZE: usize = 32;

/// Nonce size for ChaCha20-Poly1305
pub const NONCE_SIZE: usize = 12;

/// Secret cipher keyed by a scope passphrase
pub struct SecretCipher {
    cipher: ChaCha20Poly1305,
}

impl SecretCipher {
    /// Derive a fixed-length key by hashing the passphrase.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&digest);
        SecretCipher::from_key(&key)
    }

    /// Create a cipher from raw key bytes.
    pub fn from_key(key: &[u8; KEY_SIZE]) -> Self {
        SecretCipher {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Encrypt plaintext into a `base64(nonce || ciphertext)` envelope with
    /// a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> StrataResult<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| StrataError::Envelope("encryption failed".into()))?;

        let mut framed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        framed.extend_from_slice(&nonce_bytes);
        framed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(framed))
    }

    /// Decrypt an envelope produced by [`seal`](SecretCipher::seal).
    ///
    /// Malformed envelopes fail with [`StrataError::Envelope`]; an
    /// authentication failure (wrong passphrase, tampered bytes) fails with
    /// [`StrataError::DecryptionFailed`].
    pub fn open(&self, envelope: &str) -> StrataResult<Vec<u8>> {
        let framed = BASE64
            .decode(envelope)
            .map_err(|e| StrataError::Envelope(e.to_string()))?;

        if framed.len() < NONCE_SIZE {
            return Err(StrataError::Envelope(format!(
                "envelope too short: {} bytes",
                framed.len()
            )));
        }

        let (nonce_bytes, ciphertext) = framed.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StrataError::DecryptionFailed)
    }
}
