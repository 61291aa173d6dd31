//! Cryptographic primitives for WolfTun
//!
//! Keys are derived from an operator-supplied secret with SHA-256 and every
//! datagram is sealed with ChaCha20-Poly1305 under a fresh random nonce.
//!
//! Sealed layout: `[12: nonce] [N: ciphertext] [16: tag]`

use chacha20poly1305::{aead::{Aead, KeyInit}, ChaCha20Poly1305, Key, Nonce};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

/// Symmetric key length in bytes
pub const KEY_LEN: usize = 32;
/// Nonce length in bytes
pub const NONCE_LEN: usize = 12;
/// Poly1305 tag length in bytes
pub const TAG_LEN: usize = 16;
/// Bytes added to every sealed message
pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Derive a 32-byte key from a human secret
pub fn derive_key(secret: &str) -> [u8; KEY_LEN] {
    let hash = Sha256::digest(secret.as_bytes());
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&hash[..KEY_LEN]);
    key
}

/// Shared cipher for all datagrams of a tunnel
#[derive(Clone)]
pub struct Cipher {
    aead: ChaCha20Poly1305,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher(..)")
    }
}

impl Cipher {
    /// Create a cipher from a raw key, which must be exactly 32 bytes
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(Error::Crypto(format!(
                "invalid key length {} (expected {})",
                key.len(),
                KEY_LEN
            )));
        }
        let aead = ChaCha20Poly1305::new(Key::from_slice(key));
        debug!("Cipher initialised");
        Ok(Self { aead })
    }

    /// Create a cipher keyed from a secret string
    pub fn from_secret(secret: &str) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(&derive_key(secret))),
        }
    }

    /// Seal a message
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .aead
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::Crypto("encryption failed".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a sealed message
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < OVERHEAD {
            return Err(Error::Decrypt);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        self.aead
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Decrypt)
    }
}
