//! Cryptographic primitives for master key custody.
//!
//! # Algorithms
//!
//! - **Key Wrapping**: ChaCha20-Poly1305 (authenticated encryption), fresh random
//!   96-bit nonce per call
//! - **Storage Key Derivation**: Argon2id over the storage secret
//! - **Key Identifiers**: truncated SHA-256 of the raw key bytes
//!
//! # Security Parameters
//!
//! Default Argon2id parameters for sealing the key material file:
//! - 64 MB memory
//! - 3 iterations
//! - 4 parallelism threads

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::types::{CustodyError, Result};

// =============================================================================
// Constants
// =============================================================================

/// Algorithm identifier recorded in envelopes and key metadata
pub const WRAP_ALGORITHM: &str = "CHACHA20-POLY1305";

/// Master key length (256 bits)
pub const MASTER_KEY_LEN: usize = 32;

/// Salt length for storage key derivation (16 bytes)
pub const SALT_LEN: usize = 16;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// ChaCha20-Poly1305 auth tag length (16 bytes)
pub const AUTH_TAG_LEN: usize = 16;

/// Argon2id memory cost in KiB (64 MB)
pub const ARGON2_MEMORY_KB: u32 = 65536;

/// Argon2id iteration count
pub const ARGON2_ITERATIONS: u32 = 3;

/// Argon2id parallelism (threads)
pub const ARGON2_PARALLELISM: u32 = 4;

// =============================================================================
// Randomness
// =============================================================================

/// Generate cryptographically secure random bytes.
pub fn generate_random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Generate a fresh 256-bit master key.
pub fn generate_master_key() -> Zeroizing<[u8; MASTER_KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; MASTER_KEY_LEN]);
    OsRng.fill_bytes(&mut key[..]);
    key
}

/// Stable identifier for a key: first 16 bytes of SHA-256, hex encoded.
pub fn derive_key_id(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    hex::encode(&digest[..16])
}

// =============================================================================
// Storage Key Derivation
// =============================================================================

/// Argon2id cost parameters. Persisted next to the sealed key material so a
/// file is always opened with the parameters it was sealed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: ARGON2_MEMORY_KB,
            iterations: ARGON2_ITERATIONS,
            parallelism: ARGON2_PARALLELISM,
        }
    }
}

/// Derive the 256-bit storage key from the storage secret using Argon2id.
///
/// The storage key only ever seals the key material file; it is never the
/// master key itself.
pub fn derive_storage_key(
    secret: &[u8],
    salt: &[u8],
    params: KdfParams,
) -> Result<Zeroizing<[u8; 32]>> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| CustodyError::Internal(format!("Invalid Argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(secret, salt, &mut key[..])
        .map_err(|e| CustodyError::Internal(format!("Key derivation failed: {e}")))?;

    Ok(key)
}

// =============================================================================
// Sealing
// =============================================================================

/// Encrypt `plaintext` under `key` with the given nonce and associated data.
///
/// Returns ciphertext with the 16-byte auth tag appended.
pub fn seal(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CustodyError::Internal(format!("Encryption failed: {e}")))
}

/// Decrypt `ciphertext` (with appended tag) under `key`.
///
/// A tag mismatch is reported as `IntegrityViolation`: either the data was
/// altered or the wrong key was used.
pub fn open(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| CustodyError::IntegrityViolation("authentication tag mismatch".into()))
}

// =============================================================================
// Tests
// =============================================================================
