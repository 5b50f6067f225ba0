//! Per-file chunk encryption with AES-256-GCM
//!
//! One random key is generated per file. Each chunk is sealed under that key
//! with a nonce derived from its index, so a nonce is never reused under a key
//! as long as indices are unique within the file.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::ZeroizeOnDrop;

use super::error::{ChunkError, Result};

pub const NONCE_LEN: usize = 12;

/// Authentication tag appended by AES-GCM to every ciphertext.
pub const TAG_LEN: usize = 16;

const NONCE_PREFIX: [u8; 8] = *b"mswarm\x00\x01";

/// Symmetric key for every chunk of a single file.
/// Zeroed when dropped.
#[derive(Clone, PartialEq, Eq, ZeroizeOnDrop)]
pub struct FileKey {
    key: [u8; 32],
}

impl FileKey {
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FileKey(..)")
    }
}

/// Nonce for the chunk at `index`: fixed prefix followed by the big-endian index.
pub fn chunk_nonce(index: u32) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..8].copy_from_slice(&NONCE_PREFIX);
    nonce[8..].copy_from_slice(&index.to_be_bytes());
    nonce
}

/// Seals and opens chunk payloads. `Plain` passes bytes through unchanged
/// when encryption is disabled.
#[derive(Clone)]
pub enum ChunkCipher {
    Aes256Gcm(Aes256Gcm),
    Plain,
}

impl ChunkCipher {
    pub fn new(key: Option<&FileKey>) -> Self {
        match key {
            Some(key) => {
                ChunkCipher::Aes256Gcm(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes())))
            }
            None => ChunkCipher::Plain,
        }
    }

    pub fn is_encrypting(&self) -> bool {
        matches!(self, ChunkCipher::Aes256Gcm(_))
    }

    pub fn encrypt(&self, index: u32, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self {
            ChunkCipher::Aes256Gcm(cipher) => {
                let nonce = chunk_nonce(index);
                cipher
                    .encrypt(Nonce::from_slice(&nonce), plaintext)
                    .map_err(|_| ChunkError::Encryption { index })
            }
            ChunkCipher::Plain => Ok(plaintext.to_vec()),
        }
    }

    pub fn decrypt(&self, index: u32, ciphertext: &[u8]) -> Result<Vec<u8>> {
        match self {
            ChunkCipher::Aes256Gcm(cipher) => {
                if ciphertext.len() < TAG_LEN {
                    return Err(ChunkError::Decryption { index });
                }
                let nonce = chunk_nonce(index);
                cipher
                    .decrypt(Nonce::from_slice(&nonce), ciphertext)
                    .map_err(|_| ChunkError::Decryption { index })
            }
            ChunkCipher::Plain => Ok(ciphertext.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = FileKey::generate();
        let cipher = ChunkCipher::new(Some(&key));

        let plaintext = b"chunk payload";
        let ciphertext = cipher.encrypt(3, plaintext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_LEN);
        assert_ne!(&ciphertext[..plaintext.len()], plaintext);

        let decrypted = cipher.decrypt(3, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_index_fails() {
        let key = FileKey::generate();
        let cipher = ChunkCipher::new(Some(&key));

        let ciphertext = cipher.encrypt(0, b"secret").unwrap();
        assert!(matches!(
            cipher.decrypt(1, &ciphertext),
            Err(ChunkError::Decryption { index: 1 })
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let ciphertext = ChunkCipher::new(Some(&FileKey::generate()))
            .encrypt(0, b"secret")
            .unwrap();
        let other = ChunkCipher::new(Some(&FileKey::generate()));
        assert!(other.decrypt(0, &ciphertext).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = ChunkCipher::new(Some(&FileKey::generate()));
        let mut ciphertext = cipher.encrypt(7, b"some bytes").unwrap();
        ciphertext[0] ^= 0x01;
        assert!(cipher.decrypt(7, &ciphertext).is_err());
    }

    #[test]
    fn test_nonces_unique_per_index() {
        let nonces: HashSet<_> = (0..10_000u32).map(chunk_nonce).collect();
        assert_eq!(nonces.len(), 10_000);
    }

    #[test]
    fn test_plain_cipher_passthrough() {
        let cipher = ChunkCipher::new(None);
        assert!(!cipher.is_encrypting());
        assert_eq!(cipher.encrypt(0, b"abc").unwrap(), b"abc");
        assert_eq!(cipher.decrypt(0, b"abc").unwrap(), b"abc");
    }

    #[test]
    fn test_empty_plaintext() {
        let cipher = ChunkCipher::new(Some(&FileKey::generate()));
        let ciphertext = cipher.encrypt(0, &[]).unwrap();
        assert_eq!(ciphertext.len(), TAG_LEN);
        assert!(cipher.decrypt(0, &ciphertext).unwrap().is_empty());
    }
}
