//! Durable storage for master key material.
//!
//! # Layout
//!
//! ```text
//! <data_dir>/            mode 0700
//!   keyring.sealed.json  mode 0600, every key version sealed under the storage key
//!   rotation.log         mode 0600, append-only, one JSON record per rotation
//! ```
//!
//! The keyring file is sealed with ChaCha20-Poly1305 under a key derived from
//! the storage secret (Argon2id). A fresh salt and nonce are drawn on every
//! write. Writes go to a temp file that is renamed into place.
//!
//! Loading fails closed: if the file exists but cannot be opened with the
//! configured secret the store reports `StartupAborted` and never offers to
//! regenerate, since a new key would orphan everything wrapped so far.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

use super::crypto::{
    derive_storage_key, generate_random_bytes, open, seal, KdfParams, NONCE_LEN, SALT_LEN,
};
use crate::types::{CustodyError, Result};

/// Sealed keyring file name
pub const KEYRING_FILE: &str = "keyring.sealed.json";

/// Rotation log file name
pub const ROTATION_LOG_FILE: &str = "rotation.log";

const KEYRING_FORMAT_VERSION: u32 = 1;
const KEYRING_AAD: &[u8] = b"kacls:keyring:v1";

// =============================================================================
// Persisted Types
// =============================================================================

/// One key version as persisted (inside the sealed document).
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredKey {
    pub version: u32,
    /// Raw key bytes, base64. Zeroized on drop.
    pub key: String,
    pub algorithm: String,
    pub key_id: String,
    pub created_at: DateTime<Utc>,
}

impl Drop for StoredKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for StoredKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredKey")
            .field("version", &self.version)
            .field("algorithm", &self.algorithm)
            .field("key_id", &self.key_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Every retained key version plus which one is current.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKeyRing {
    pub current_version: u32,
    pub keys: Vec<StoredKey>,
}

/// On-disk envelope around the sealed keyring.
#[derive(Debug, Serialize, Deserialize)]
struct SealedKeyFile {
    format: u32,
    kdf: KdfParams,
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// Why a key version came into existence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationReason {
    /// First key generated at boot
    Initial,
    /// Age threshold exceeded
    Scheduled,
    /// Operator request
    Manual,
}

impl std::fmt::Display for RotationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RotationReason::Initial => write!(f, "initial"),
            RotationReason::Scheduled => write!(f, "scheduled"),
            RotationReason::Manual => write!(f, "manual"),
        }
    }
}

/// One line of the rotation log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationLogEntry {
    pub version: u32,
    pub previous_version: Option<u32>,
    pub key_id: String,
    pub algorithm: String,
    pub reason: RotationReason,
    pub rotated_at: DateTime<Utc>,
}

// =============================================================================
// Key Material Store
// =============================================================================

/// File-backed, permission-restricted store for the master keyring.
pub struct KeyMaterialStore {
    dir: PathBuf,
    secret: Zeroizing<Vec<u8>>,
    kdf: KdfParams,
}

impl KeyMaterialStore {
    /// Open (creating if needed) the store directory.
    pub fn open(dir: impl AsRef<Path>, storage_secret: &str) -> Result<Self> {
        if storage_secret.is_empty() {
            return Err(CustodyError::Config("Storage secret must not be empty".into()));
        }

        let dir = dir.as_ref().to_path_buf();
        create_private_dir(&dir)?;

        Ok(Self {
            dir,
            secret: Zeroizing::new(storage_secret.as_bytes().to_vec()),
            kdf: KdfParams::default(),
        })
    }

    /// Override the Argon2id parameters used for future writes.
    pub fn with_kdf_params(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    /// Directory holding the key material
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn keyring_path(&self) -> PathBuf {
        self.dir.join(KEYRING_FILE)
    }

    fn rotation_log_path(&self) -> PathBuf {
        self.dir.join(ROTATION_LOG_FILE)
    }

    /// Whether a sealed keyring already exists on disk
    pub fn exists(&self) -> bool {
        self.keyring_path().exists()
    }

    /// Load and open the sealed keyring.
    ///
    /// Returns `Ok(None)` only when no keyring file exists (first boot).
    pub fn load(&self) -> Result<Option<StoredKeyRing>> {
        let path = self.keyring_path();
        if !path.exists() {
            return Ok(None);
        }

        let raw = fs::read(&path)
            .map_err(|e| abort(format!("cannot read {}: {e}", path.display())))?;
        let sealed: SealedKeyFile = serde_json::from_slice(&raw)
            .map_err(|e| abort(format!("keyring file is not valid JSON: {e}")))?;

        if sealed.format != KEYRING_FORMAT_VERSION {
            return Err(abort(format!("unsupported keyring format {}", sealed.format)));
        }

        let salt = BASE64
            .decode(&sealed.salt)
            .map_err(|e| abort(format!("invalid salt encoding: {e}")))?;
        let nonce: [u8; NONCE_LEN] = BASE64
            .decode(&sealed.nonce)
            .map_err(|e| abort(format!("invalid nonce encoding: {e}")))?
            .try_into()
            .map_err(|_| abort("invalid nonce length".to_string()))?;
        let ciphertext = BASE64
            .decode(&sealed.ciphertext)
            .map_err(|e| abort(format!("invalid ciphertext encoding: {e}")))?;

        let storage_key = derive_storage_key(&self.secret, &salt, sealed.kdf)?;
        let plaintext = open(&storage_key, &nonce, KEYRING_AAD, &ciphertext).map_err(|_| {
            abort("keyring could not be decrypted with the configured storage secret".to_string())
        })?;

        let ring: StoredKeyRing = serde_json::from_slice(&plaintext)
            .map_err(|e| abort(format!("decrypted keyring is malformed: {e}")))?;

        debug!(
            versions = ring.keys.len(),
            current_version = ring.current_version,
            "Loaded sealed keyring"
        );

        Ok(Some(ring))
    }

    /// Seal and atomically replace the keyring file.
    pub fn save(&self, ring: &StoredKeyRing) -> Result<()> {
        let salt: [u8; SALT_LEN] = generate_random_bytes();
        let nonce: [u8; NONCE_LEN] = generate_random_bytes();

        let plaintext = Zeroizing::new(
            serde_json::to_vec(ring)
                .map_err(|e| CustodyError::Internal(format!("Keyring serialization failed: {e}")))?,
        );
        let storage_key = derive_storage_key(&self.secret, &salt, self.kdf)?;
        let ciphertext = seal(&storage_key, &nonce, KEYRING_AAD, &plaintext)?;

        let sealed = SealedKeyFile {
            format: KEYRING_FORMAT_VERSION,
            kdf: self.kdf,
            salt: BASE64.encode(salt),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(&ciphertext),
        };
        let bytes = serde_json::to_vec_pretty(&sealed)
            .map_err(|e| CustodyError::Internal(format!("Keyring serialization failed: {e}")))?;

        let path = self.keyring_path();
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = private_file_options()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        debug!(
            path = %path.display(),
            current_version = ring.current_version,
            "Persisted sealed keyring"
        );
        Ok(())
    }

    /// Append one record to the rotation log.
    pub fn append_rotation(&self, entry: &RotationLogEntry) -> Result<()> {
        let line = serde_json::to_string(entry).map_err(|e| {
            CustodyError::Internal(format!("Rotation log serialization failed: {e}"))
        })?;

        let path = self.rotation_log_path();
        let mut file = private_file_options().create(true).append(true).open(&path)?;
        writeln!(file, "{}", line)?;
        file.sync_data()?;

        info!(
            version = entry.version,
            previous_version = ?entry.previous_version,
            reason = %entry.reason,
            "Rotation log entry appended"
        );
        Ok(())
    }

    /// Read back every rotation log entry, oldest first.
    pub fn read_rotation_log(&self) -> Result<Vec<RotationLogEntry>> {
        let path = self.rotation_log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line)
                .map_err(|e| CustodyError::Storage(format!("Corrupt rotation log line: {e}")))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

fn abort(message: String) -> CustodyError {
    CustodyError::StartupAborted(message)
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    if dir.exists() {
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    } else {
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(unix)]
fn private_file_options() -> OpenOptions {
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = OpenOptions::new();
    options.mode(0o600);
    options
}

#[cfg(not(unix))]
fn private_file_options() -> OpenOptions {
    OpenOptions::new()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custody::crypto::{derive_key_id, generate_master_key, WRAP_ALGORITHM};
    use tempfile::TempDir;

    fn light_params() -> KdfParams {
        KdfParams {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn test_ring() -> StoredKeyRing {
        let key = generate_master_key();
        StoredKeyRing {
            current_version: 1,
            keys: vec![StoredKey {
                version: 1,
                key: BASE64.encode(&key[..]),
                algorithm: WRAP_ALGORITHM.to_string(),
                key_id: derive_key_id(&key[..]),
                created_at: Utc::now(),
            }],
        }
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = KeyMaterialStore::open(dir.path(), "secret").unwrap();
        assert!(!store.exists());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = KeyMaterialStore::open(dir.path(), "secret")
            .unwrap()
            .with_kdf_params(light_params());
        let ring = test_ring();

        store.save(&ring).unwrap();
        let loaded = store.load().unwrap().unwrap();

        assert_eq!(loaded.current_version, 1);
        assert_eq!(loaded.keys[0].key, ring.keys[0].key);
        assert_eq!(loaded.keys[0].key_id, ring.keys[0].key_id);
    }

    #[test]
    fn test_wrong_secret_aborts_startup() {
        let dir = TempDir::new().unwrap();
        let store = KeyMaterialStore::open(dir.path(), "secret")
            .unwrap()
            .with_kdf_params(light_params());
        store.save(&test_ring()).unwrap();

        let other = KeyMaterialStore::open(dir.path(), "another-secret").unwrap();
        assert!(matches!(other.load(), Err(CustodyError::StartupAborted(_))));
    }

    #[test]
    fn test_corrupt_file_aborts_startup() {
        let dir = TempDir::new().unwrap();
        let store = KeyMaterialStore::open(dir.path(), "secret").unwrap();
        fs::write(dir.path().join(KEYRING_FILE), b"not json").unwrap();

        assert!(matches!(store.load(), Err(CustodyError::StartupAborted(_))));
    }

    #[test]
    fn test_key_material_never_written_in_clear() {
        let dir = TempDir::new().unwrap();
        let store = KeyMaterialStore::open(dir.path(), "secret")
            .unwrap()
            .with_kdf_params(light_params());
        let ring = test_ring();
        store.save(&ring).unwrap();

        let on_disk = fs::read_to_string(dir.path().join(KEYRING_FILE)).unwrap();
        assert!(!on_disk.contains(&ring.keys[0].key));
        assert!(!on_disk.contains(&ring.keys[0].key_id));
    }

    #[cfg(unix)]
    #[test]
    fn test_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("keys");
        let store = KeyMaterialStore::open(&data_dir, "secret")
            .unwrap()
            .with_kdf_params(light_params());
        store.save(&test_ring()).unwrap();

        let dir_mode = fs::metadata(&data_dir).unwrap().permissions().mode() & 0o777;
        let file_mode = fs::metadata(data_dir.join(KEYRING_FILE))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
        assert_eq!(file_mode, 0o600);
    }

    #[test]
    fn test_rotation_log_appends() {
        let dir = TempDir::new().unwrap();
        let store = KeyMaterialStore::open(dir.path(), "secret").unwrap();

        for version in 1..=3 {
            store
                .append_rotation(&RotationLogEntry {
                    version,
                    previous_version: version.checked_sub(1).filter(|v| *v > 0),
                    key_id: format!("id-{version}"),
                    algorithm: WRAP_ALGORITHM.to_string(),
                    reason: RotationReason::Manual,
                    rotated_at: Utc::now(),
                })
                .unwrap();
        }

        let entries = store.read_rotation_log().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].previous_version, None);
        assert_eq!(entries[2].previous_version, Some(2));
    }

    #[test]
    fn test_empty_secret_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(KeyMaterialStore::open(dir.path(), "").is_err());
    }
}
