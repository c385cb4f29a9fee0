//! Strata Crypto - Secret-value encryption
//!
//! Secrets are sealed with ChaCha20-Poly1305 under a key derived by hashing
//! the scope passphrase. Each seal draws a fresh random nonce; the envelope
//! is `base64(nonce || ciphertext)`. There is no key rotation: changing the
//! passphrase invalidates every previously persisted secret.

pub mod cipher;

pub use cipher::*;
