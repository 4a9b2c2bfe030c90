//! Extent encryption and the key-management boundary.
//!
//! The engine never derives or stores keys. It asks a [`KeyProvider`] to
//! unlock the filesystem at mount and checks the returned key against the
//! key check stored in the superblock.

use chacha20poly1305::aead::Aead as _;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit as _};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{EngineError, EngineResult};

/// Nonce length for ChaCha20-Poly1305.
pub const NONCE_LEN: usize = 12;

const KEY_CHECK_CONTEXT: &str = "tierfs 2026-01 superblock key check";

/// 256-bit filesystem key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub [u8; 32]);

impl EncryptionKey {
    /// Random key, for formatting new filesystems and tests.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        EncryptionKey(bytes)
    }

    /// Value stored in the superblock to recognise this key.
    pub fn key_check(&self) -> [u8; 32] {
        blake3::derive_key(KEY_CHECK_CONTEXT, &self.0)
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// External collaborator that unlocks encrypted filesystems.
pub trait KeyProvider: Send + Sync {
    /// Returns the key for filesystem `fs`, or [`EngineError::KeyDenied`].
    fn unlock(&self, fs: Uuid) -> EngineResult<EncryptionKey>;
}

/// Provider holding a single key in memory.
#[derive(Debug, Clone)]
pub struct StaticKeyProvider {
    key: EncryptionKey,
}

impl StaticKeyProvider {
    /// Wraps `key`.
    pub fn new(key: EncryptionKey) -> Self {
        Self { key }
    }
}

impl KeyProvider for StaticKeyProvider {
    fn unlock(&self, _fs: Uuid) -> EngineResult<EncryptionKey> {
        Ok(self.key.clone())
    }
}

/// Provider that refuses every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKeyProvider;

impl KeyProvider for NoKeyProvider {
    fn unlock(&self, fs: Uuid) -> EngineResult<EncryptionKey> {
        Err(EngineError::KeyDenied {
            reason: format!("no key available for {fs}"),
        })
    }
}

/// Fresh random nonce.
pub fn random_nonce() -> [u8; NONCE_LEN] {
    use rand::RngCore;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Encrypts `plaintext`; the 16-byte tag is appended.
pub fn encrypt(key: &EncryptionKey, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> EngineResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(&key.0).map_err(|e| EngineError::Crypto {
        reason: e.to_string(),
    })?;
    cipher
        .encrypt(chacha20poly1305::Nonce::from_slice(nonce), plaintext)
        .map_err(|e| EngineError::Crypto {
            reason: e.to_string(),
        })
}

/// Decrypts and authenticates `ciphertext`.
pub fn decrypt(key: &EncryptionKey, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> EngineResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(&key.0).map_err(|e| EngineError::Crypto {
        reason: e.to_string(),
    })?;
    cipher
        .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| EngineError::Crypto {
            reason: "authentication failed".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let key = EncryptionKey::generate();
        let nonce = random_nonce();
        let ct = encrypt(&key, &nonce, b"extent payload").unwrap();
        assert_eq!(ct.len(), b"extent payload".len() + 16);
        assert_eq!(decrypt(&key, &nonce, &ct).unwrap(), b"extent payload");
    }

    #[test]
    fn test_wrong_key_fails() {
        let nonce = random_nonce();
        let ct = encrypt(&EncryptionKey::generate(), &nonce, b"secret").unwrap();
        assert!(decrypt(&EncryptionKey::generate(), &nonce, &ct).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = EncryptionKey::generate();
        let nonce = random_nonce();
        let mut ct = encrypt(&key, &nonce, b"secret").unwrap();
        ct[0] ^= 0xff;
        assert!(decrypt(&key, &nonce, &ct).is_err());
    }

    #[test]
    fn test_key_check_is_stable_and_distinct() {
        let key = EncryptionKey([3u8; 32]);
        assert_eq!(key.key_check(), key.clone().key_check());
        assert_ne!(key.key_check(), EncryptionKey([4u8; 32]).key_check());
    }

    #[test]
    fn test_providers() {
        let fs = Uuid::new_v4();
        assert!(matches!(
            NoKeyProvider.unlock(fs),
            Err(EngineError::KeyDenied { .. })
        ));
        let key = EncryptionKey([9u8; 32]);
        let got = StaticKeyProvider::new(key.clone()).unlock(fs).unwrap();
        assert_eq!(got.0, key.0);
    }

    #[test]
    fn test_debug_redacts() {
        let key = EncryptionKey([1u8; 32]);
        assert_eq!(format!("{key:?}"), "EncryptionKey([REDACTED])");
    }
}
