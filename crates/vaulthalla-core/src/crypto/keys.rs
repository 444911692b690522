//! Versioned per-vault key material.
//!
//! The daemon holds one 32-byte master key (from the config, or generated
//! for ephemeral setups). Per-vault keys derive deterministically from it
//! with HMAC-SHA256 over the vault id and key version, so rotating a vault
//! is a metadata operation: bump `key_version`, re-encrypt at leisure.
//! Files remember the version they were sealed with.

use zeroize::Zeroize;

use crate::crypto::hash::hmac_sha256;
use crate::error::{Result, VaultError};

pub const KEY_LEN: usize = 32;

/// A derived AES-256 key for one `(vault, version)` pair.
///
/// Zeroized on drop; never serialized.
pub struct VaultKey {
    material: [u8; KEY_LEN],
    pub version: i64,
}

impl VaultKey {
    pub fn material(&self) -> &[u8; KEY_LEN] {
        &self.material
    }
}

impl Drop for VaultKey {
    fn drop(&mut self) {
        self.material.zeroize();
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultKey")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Derives and hands out vault keys.
pub struct KeyRing {
    master: [u8; KEY_LEN],
}

impl Drop for KeyRing {
    fn drop(&mut self) {
        self.master.zeroize();
    }
}

impl KeyRing {
    /// Build from a hex-encoded 32-byte master key.
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key)
            .map_err(|e| VaultError::InvalidArgument(format!("master key is not hex: {e}")))?;
        let master: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            VaultError::InvalidArgument("master key must be exactly 32 bytes".into())
        })?;
        Ok(Self { master })
    }

    /// Generate an ephemeral master key. Data encrypted under it is
    /// unreadable after restart; only suitable for tests and scratch runs.
    pub fn ephemeral() -> Self {
        use rand::RngCore;
        let mut master = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut master);
        Self { master }
    }

    /// Derive the key for a vault at a specific version.
    pub fn vault_key(&self, vault_id: i64, version: i64) -> VaultKey {
        let info = format!("vaulthalla/vault/{vault_id}/v{version}");
        let derived = hmac_sha256(&self.master, info.as_bytes());
        let mut material = [0u8; KEY_LEN];
        material.copy_from_slice(&derived);
        VaultKey { material, version }
    }

    /// Seal a small secret (API-key secrets at rest) under the master key.
    pub fn seal_secret(&self, plaintext: &[u8]) -> Result<String> {
        let key = self.master_as_key();
        let blob = super::aead::seal(&key, plaintext)?;
        Ok(blob.to_base64())
    }

    /// Reverse of [`KeyRing::seal_secret`].
    pub fn open_secret(&self, encoded: &str) -> Result<Vec<u8>> {
        let key = self.master_as_key();
        let blob = super::aead::SealedBlob::from_base64(encoded)?;
        super::aead::open(&key, &blob)
    }

    fn master_as_key(&self) -> VaultKey {
        VaultKey {
            material: self.master,
            version: 0,
        }
    }
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyRing(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let ring = KeyRing::from_hex(&"11".repeat(32)).unwrap();
        let a = ring.vault_key(1, 1);
        let b = ring.vault_key(1, 1);
        assert_eq!(a.material(), b.material());
    }

    #[test]
    fn test_derivation_varies_by_vault_and_version() {
        let ring = KeyRing::from_hex(&"11".repeat(32)).unwrap();
        let v1 = ring.vault_key(1, 1);
        let v2 = ring.vault_key(2, 1);
        let v1k2 = ring.vault_key(1, 2);
        assert_ne!(v1.material(), v2.material());
        assert_ne!(v1.material(), v1k2.material());
        assert_eq!(v1k2.version, 2);
    }

    #[test]
    fn test_bad_hex_rejected() {
        assert!(KeyRing::from_hex("zz").is_err());
        assert!(KeyRing::from_hex(&"11".repeat(16)).is_err());
    }

    #[test]
    fn test_secret_round_trip() {
        let ring = KeyRing::ephemeral();
        let sealed = ring.seal_secret(b"super-secret-access-key").unwrap();
        assert_eq!(ring.open_secret(&sealed).unwrap(), b"super-secret-access-key");
    }
}
