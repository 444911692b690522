//! AES-256-GCM sealing of file content.
//!
//! Blob layout on disk and on the wire: `nonce (12 bytes) || ciphertext+tag`.
//! The nonce is also mirrored into the metadata store so remote objects can
//! carry it as `x-amz-meta-vh-iv` without reading the blob.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;

use crate::crypto::keys::VaultKey;
use crate::error::{Result, VaultError};

/// AES-GCM nonce length.
pub const NONCE_LEN: usize = 12;

/// An encrypted blob: nonce + ciphertext (tag appended by GCM).
#[derive(Debug, Clone)]
pub struct SealedBlob {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl SealedBlob {
    /// Serialize as `nonce || ciphertext` for the backing store.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse the backing-store layout.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < NONCE_LEN {
            return Err(VaultError::Integrity(format!(
                "sealed blob truncated: {} bytes",
                raw.len()
            )));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&raw[..NONCE_LEN]);
        Ok(Self {
            nonce,
            ciphertext: raw[NONCE_LEN..].to_vec(),
        })
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let raw = BASE64
            .decode(encoded)
            .map_err(|e| VaultError::Integrity(format!("sealed blob is not base64: {e}")))?;
        Self::from_bytes(&raw)
    }

    /// Base64 nonce as stored in `fs_entry.encryption_iv`.
    pub fn nonce_b64(&self) -> String {
        BASE64.encode(self.nonce)
    }
}

/// Encrypt plaintext under a vault key with a fresh random nonce.
pub fn seal(key: &VaultKey, plaintext: &[u8]) -> Result<SealedBlob> {
    let cipher = Aes256Gcm::new_from_slice(key.material())
        .map_err(|e| VaultError::Fatal(format!("invalid AEAD key: {e}")))?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload::from(plaintext))
        .map_err(|_| VaultError::Io("AEAD encryption failed".into()))?;

    Ok(SealedBlob { nonce, ciphertext })
}

/// Decrypt a sealed blob. GCM tag validation is mandatory; a mismatch is
/// an integrity failure, never silent plaintext.
pub fn open(key: &VaultKey, blob: &SealedBlob) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.material())
        .map_err(|e| VaultError::Fatal(format!("invalid AEAD key: {e}")))?;

    cipher
        .decrypt(
            Nonce::from_slice(&blob.nonce),
            Payload::from(blob.ciphertext.as_slice()),
        )
        .map_err(|_| {
            VaultError::Integrity("AEAD tag mismatch: blob corrupted or wrong key version".into())
        })
}

/// Decode a base64 nonce from the metadata store.
pub fn nonce_from_b64(encoded: &str) -> Result<[u8; NONCE_LEN]> {
    let raw = BASE64
        .decode(encoded)
        .map_err(|e| VaultError::Integrity(format!("stored IV is not base64: {e}")))?;
    raw.try_into()
        .map_err(|_| VaultError::Integrity("stored IV is not 12 bytes".into()))
}
