//! AES-256-GCM encryption barrier keyed by the reconstructed master key.
//!
//! Everything persisted behind the seal (credential history, CA state) is wrapped
//! in a [`SealedBlob`]: a random 12-byte nonce plus ciphertext with the GCM tag
//! appended. The blob's context label is bound as associated data so a blob cannot
//! be swapped into a different file.

use base64::Engine;
use ring::aead::{self, Aad, BoundKey, Nonce, NonceSequence, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, error, instrument};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::{Error, Result};

/// Size of the master key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of AES-256-GCM nonce in bytes
const NONCE_SIZE: usize = 12;

/// Size of AES-256-GCM tag in bytes
const TAG_SIZE: usize = 16;

/// The 256-bit master key. Only ever held in memory while unsealed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    /// Generate a fresh random key
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; KEY_SIZE];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| Error::crypto("Failed to generate master key"))?;
        Ok(Self(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(Error::crypto(format!(
                "master key must be {} bytes, got {} bytes",
                KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Encrypted envelope as persisted on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBlob {
    pub context: String,
    pub nonce: String,
    pub ciphertext: String,
}

/// Single-use nonce sequence for AES-GCM
struct SingleNonce {
    nonce: Option<[u8; NONCE_SIZE]>,
}

impl SingleNonce {
    fn new(nonce_bytes: [u8; NONCE_SIZE]) -> Self {
        Self { nonce: Some(nonce_bytes) }
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.nonce.take().map(Nonce::assume_unique_for_key).ok_or(ring::error::Unspecified)
    }
}

/// Encrypts and decrypts state with the master key.
#[derive(Clone)]
pub struct Barrier {
    key: MasterKey,
    rng: SystemRandom,
}

impl Barrier {
    pub fn new(key: MasterKey) -> Self {
        Self { key, rng: SystemRandom::new() }
    }

    /// Encrypt `plaintext`, binding `context` as associated data.
    #[instrument(skip(self, plaintext), fields(plaintext_len = plaintext.len()))]
    pub fn encrypt(&self, context: &str, plaintext: &[u8]) -> Result<SealedBlob> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        self.rng.fill(&mut nonce_bytes).map_err(|_| {
            error!("Failed to generate random nonce");
            Error::crypto("Failed to generate random nonce for encryption")
        })?;

        let unbound_key = UnboundKey::new(&AES_256_GCM, self.key.as_bytes())
            .map_err(|_| Error::crypto("Failed to create encryption key"))?;
        let mut sealing_key = aead::SealingKey::new(unbound_key, SingleNonce::new(nonce_bytes));

        let mut ciphertext = plaintext.to_vec();
        ciphertext.reserve(TAG_SIZE);
        sealing_key
            .seal_in_place_append_tag(Aad::from(context.as_bytes()), &mut ciphertext)
            .map_err(|_| Error::crypto("Failed to encrypt state"))?;

        debug!(ciphertext_len = ciphertext.len(), "sealed state blob");

        let engine = &base64::engine::general_purpose::STANDARD;
        Ok(SealedBlob {
            context: context.to_string(),
            nonce: engine.encode(nonce_bytes),
            ciphertext: engine.encode(ciphertext),
        })
    }

    /// Decrypt a blob. Fails with `Crypto` on a wrong key or tampered data.
    #[instrument(skip(self, blob), fields(context = %blob.context))]
    pub fn decrypt(&self, blob: &SealedBlob) -> Result<Vec<u8>> {
        let engine = &base64::engine::general_purpose::STANDARD;
        let nonce = engine
            .decode(&blob.nonce)
            .map_err(|e| Error::crypto(format!("Invalid nonce encoding: {}", e)))?;
        let mut buffer = engine
            .decode(&blob.ciphertext)
            .map_err(|e| Error::crypto(format!("Invalid ciphertext encoding: {}", e)))?;

        if nonce.len() != NONCE_SIZE {
            return Err(Error::crypto(format!(
                "Invalid nonce length: expected {} bytes, got {} bytes",
                NONCE_SIZE,
                nonce.len()
            )));
        }
        if buffer.len() < TAG_SIZE {
            return Err(Error::crypto("Ciphertext too short (missing authentication tag)"));
        }

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes.copy_from_slice(&nonce);

        let unbound_key = UnboundKey::new(&AES_256_GCM, self.key.as_bytes())
            .map_err(|_| Error::crypto("Failed to create decryption key"))?;
        let mut opening_key = aead::OpeningKey::new(unbound_key, SingleNonce::new(nonce_bytes));

        let plaintext = opening_key
            .open_in_place(Aad::from(blob.context.as_bytes()), &mut buffer)
            .map_err(|_| {
                error!("Decryption failed - possible tampering or wrong key");
                Error::crypto("Failed to decrypt state - authentication failed")
            })?;
        Ok(plaintext.to_vec())
    }

    pub fn seal_json<T: Serialize>(&self, context: &str, value: &T) -> Result<SealedBlob> {
        let mut bytes = serde_json::to_vec(value)?;
        let blob = self.encrypt(context, &bytes);
        bytes.zeroize();
        blob
    }

    pub fn open_json<T: DeserializeOwned>(&self, blob: &SealedBlob) -> Result<T> {
        let mut bytes = self.decrypt(blob)?;
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| Error::serialization(e, format!("decoding sealed {}", blob.context)));
        bytes.zeroize();
        value
    }
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier").field("key", &"[REDACTED]").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_barrier() -> Barrier {
        Barrier::new(MasterKey::from_slice(&[0x42u8; KEY_SIZE]).unwrap())
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let barrier = test_barrier();
        let blob = barrier.encrypt("credentials", b"db-password").unwrap();
        assert_eq!(barrier.decrypt(&blob).unwrap(), b"db-password");
    }

    #[test]
    fn test_nonces_are_unique() {
        let barrier = test_barrier();
        let a = barrier.encrypt("pki", b"same").unwrap();
        let b = barrier.encrypt("pki", b"same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = test_barrier().encrypt("credentials", b"secret").unwrap();
        let other = Barrier::new(MasterKey::generate().unwrap());
        assert!(matches!(other.decrypt(&blob), Err(Error::Crypto(_))));
    }

    #[test]
    fn test_context_is_authenticated() {
        let barrier = test_barrier();
        let mut blob = barrier.encrypt("credentials", b"secret").unwrap();
        blob.context = "pki".to_string();
        assert!(barrier.decrypt(&blob).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let barrier = test_barrier();
        let mut blob = barrier.encrypt("credentials", b"secret").unwrap();
        let engine = &base64::engine::general_purpose::STANDARD;
        let mut raw = engine.decode(&blob.ciphertext).unwrap();
        raw[0] ^= 0xFF;
        blob.ciphertext = engine.encode(raw);
        assert!(barrier.decrypt(&blob).is_err());
    }

    #[test]
    fn test_json_helpers() {
        let barrier = test_barrier();
        let blob = barrier.seal_json("state", &vec![1u32, 2, 3]).unwrap();
        let value: Vec<u32> = barrier.open_json(&blob).unwrap();
        assert_eq!(value, vec![1, 2, 3]);
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(MasterKey::from_slice(&[0u8; 16]).is_err());
        assert_eq!(format!("{:?}", MasterKey::generate().unwrap()), "MasterKey([REDACTED])");
    }
}
