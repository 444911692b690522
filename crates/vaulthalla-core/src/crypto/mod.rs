//! Content encryption and hashing primitives.
//!
//! Every file blob is sealed with AES-256-GCM under a versioned per-vault
//! key before it touches the backing tree or the remote. Content identity
//! is the SHA-256 of the plaintext.

pub mod aead;
pub mod hash;
pub mod keys;

pub use aead::{open, seal, SealedBlob, NONCE_LEN};
pub use hash::{hmac_sha256, sha256_hex};
pub use keys::{KeyRing, VaultKey};

use rand::RngCore;

use data_encoding::BASE32_NOPAD;

/// Length of a base32 alias assigned to every entry at creation.
const ALIAS_BYTES: usize = 10;

/// Generate a fresh opaque base32 alias for an entry.
///
/// 10 random bytes -> 16 base32 characters; uniqueness within a vault is
/// enforced by the store's unique index, callers retry on collision.
pub fn new_base32_alias() -> String {
    let mut buf = [0u8; ALIAS_BYTES];
    rand::rng().fill_bytes(&mut buf);
    BASE32_NOPAD.encode(&buf).to_ascii_lowercase()
}
