//! Master key lifecycle: load or generate, wrap, unwrap, rotate.
//!
//! The active keyring is an immutable value behind a read-write lock. Readers
//! clone an `Arc` and release the lock immediately; rotation builds a new
//! keyring, persists it, then swaps the reference. A wrap racing a rotation
//! uses whichever version it observed and records that version in the
//! envelope, so unwrap stays correct either way.
//!
//! Versions are never destroyed, only archived.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use super::crypto::{
    derive_key_id, generate_master_key, generate_random_bytes, open, seal, MASTER_KEY_LEN,
    NONCE_LEN, WRAP_ALGORITHM,
};
use super::envelope::{associated_data, WrappedKeyEnvelope};
use super::store::{
    KeyMaterialStore, RotationLogEntry, RotationReason, StoredKey, StoredKeyRing,
};
use crate::types::{CustodyError, Result};

/// Largest data-encryption key accepted for wrapping
pub const MAX_WRAP_INPUT: usize = 1024;

// =============================================================================
// Master Key
// =============================================================================

/// One master key version. Immutable once created; bytes zeroized on drop.
pub struct MasterKey {
    key: Zeroizing<[u8; MASTER_KEY_LEN]>,
    version: u32,
    algorithm: String,
    created_at: DateTime<Utc>,
    key_id: String,
}

impl MasterKey {
    fn generate(version: u32) -> Self {
        let key = generate_master_key();
        let key_id = derive_key_id(&key[..]);
        Self {
            key,
            version,
            algorithm: WRAP_ALGORITHM.to_string(),
            created_at: Utc::now(),
            key_id,
        }
    }

    fn from_stored(stored: &StoredKey) -> Result<Self> {
        let raw = BASE64.decode(&stored.key).map(Zeroizing::new).map_err(|e| {
            CustodyError::StartupAborted(format!(
                "key v{} has invalid encoding: {e}",
                stored.version
            ))
        })?;
        let key: [u8; MASTER_KEY_LEN] = raw.as_slice().try_into().map_err(|_| {
            CustodyError::StartupAborted(format!("key v{} has invalid length", stored.version))
        })?;
        let key = Zeroizing::new(key);

        if derive_key_id(&key[..]) != stored.key_id {
            return Err(CustodyError::StartupAborted(format!(
                "key v{} does not match its recorded identifier",
                stored.version
            )));
        }

        Ok(Self {
            key,
            version: stored.version,
            algorithm: stored.algorithm.clone(),
            created_at: stored.created_at,
            key_id: stored.key_id.clone(),
        })
    }

    fn to_stored(&self) -> StoredKey {
        StoredKey {
            version: self.version,
            key: BASE64.encode(&self.key[..]),
            algorithm: self.algorithm.clone(),
            key_id: self.key_id.clone(),
            created_at: self.created_at,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Stable identifier derived from the key bytes
    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("version", &self.version)
            .field("algorithm", &self.algorithm)
            .field("created_at", &self.created_at)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Status of a retained key version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Current,
    Archived,
}

/// Non-secret description of one key version
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyVersionInfo {
    pub version: u32,
    pub status: KeyStatus,
    pub algorithm: String,
    pub key_id: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Key Ring
// =============================================================================

struct KeyRing {
    current: Arc<MasterKey>,
    versions: BTreeMap<u32, Arc<MasterKey>>,
}

impl KeyRing {
    fn to_stored(&self) -> StoredKeyRing {
        StoredKeyRing {
            current_version: self.current.version,
            keys: self.versions.values().map(|k| k.to_stored()).collect(),
        }
    }

    fn from_stored(stored: &StoredKeyRing) -> Result<Self> {
        let mut versions = BTreeMap::new();
        for stored_key in &stored.keys {
            let key = MasterKey::from_stored(stored_key)?;
            versions.insert(key.version, Arc::new(key));
        }

        let current = versions
            .get(&stored.current_version)
            .cloned()
            .ok_or_else(|| {
                CustodyError::StartupAborted(format!(
                    "current version v{} missing from keyring",
                    stored.current_version
                ))
            })?;

        Ok(Self { current, versions })
    }
}

// =============================================================================
// Rotation Policy
// =============================================================================

/// When the current key is considered too old.
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    /// Maximum age of the current key before it is rotated
    pub threshold: chrono::Duration,

    /// How often the background task checks the threshold
    pub check_interval: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            threshold: chrono::Duration::days(90),
            check_interval: Duration::from_secs(3600),
        }
    }
}

// =============================================================================
// Master Key Manager
// =============================================================================

/// Owns the current master key and every archived version.
pub struct MasterKeyManager {
    store: KeyMaterialStore,
    policy: RotationPolicy,
    ring: RwLock<Option<Arc<KeyRing>>>,
    /// Serializes initialize/rotate so two writers never race on the file.
    rotation: Mutex<()>,
}

impl MasterKeyManager {
    /// Create an uninitialized manager. Call [`initialize`](Self::initialize)
    /// before use.
    pub fn new(store: KeyMaterialStore, policy: RotationPolicy) -> Self {
        Self {
            store,
            policy,
            ring: RwLock::new(None),
            rotation: Mutex::new(()),
        }
    }

    /// Load the keyring from storage, or generate version 1 on first boot.
    ///
    /// Rotates immediately if the loaded current key is past the threshold.
    /// A missing keyring next to a non-empty rotation log is not a first boot
    /// and aborts with `StartupAborted`.
    pub fn initialize(&self) -> Result<Arc<MasterKey>> {
        let _guard = self.rotation.lock().unwrap_or_else(PoisonError::into_inner);

        let ring = match self.store.load()? {
            Some(stored) => {
                let ring = KeyRing::from_stored(&stored)?;
                info!(
                    current_version = ring.current.version,
                    versions = ring.versions.len(),
                    key_id = %ring.current.key_id,
                    "Loaded master keyring"
                );
                ring
            }
            None => {
                self.ensure_first_boot()?;
                let key = Arc::new(MasterKey::generate(1));
                let ring = KeyRing {
                    current: Arc::clone(&key),
                    versions: BTreeMap::from([(1, Arc::clone(&key))]),
                };
                self.store.save(&ring.to_stored())?;
                self.log_rotation(&key, None, RotationReason::Initial);
                info!(key_id = %key.key_id, "Generated initial master key v1");
                ring
            }
        };

        let current = Arc::clone(&ring.current);
        self.swap(ring);

        if self.is_due(&current, Utc::now()) {
            info!(
                version = current.version,
                created_at = %current.created_at,
                "Master key past rotation threshold at startup"
            );
            return self.rotate_locked(RotationReason::Scheduled);
        }

        Ok(current)
    }

    /// Whether a keyring is loaded
    pub fn is_initialized(&self) -> bool {
        self.snapshot().is_ok()
    }

    /// The key new wraps use by default
    pub fn current_key(&self) -> Result<Arc<MasterKey>> {
        Ok(Arc::clone(&self.snapshot()?.current))
    }

    /// Describe every retained version, newest first.
    pub fn key_versions(&self) -> Result<Vec<KeyVersionInfo>> {
        let ring = self.snapshot()?;
        Ok(ring
            .versions
            .values()
            .rev()
            .map(|key| KeyVersionInfo {
                version: key.version,
                status: if key.version == ring.current.version {
                    KeyStatus::Current
                } else {
                    KeyStatus::Archived
                },
                algorithm: key.algorithm.clone(),
                key_id: key.key_id.clone(),
                created_at: key.created_at,
            })
            .collect())
    }

    /// Wrap a data-encryption key under `version`, or the current key if `None`.
    ///
    /// Every call draws a fresh random nonce.
    pub fn wrap(&self, version: Option<u32>, plaintext: &[u8]) -> Result<WrappedKeyEnvelope> {
        if plaintext.is_empty() {
            return Err(CustodyError::InvalidInput("key to wrap is empty".into()));
        }
        if plaintext.len() > MAX_WRAP_INPUT {
            return Err(CustodyError::InvalidInput(format!(
                "key to wrap exceeds {MAX_WRAP_INPUT} bytes"
            )));
        }

        let ring = self.snapshot()?;
        let key = match version {
            Some(v) => ring
                .versions
                .get(&v)
                .cloned()
                .ok_or(CustodyError::UnknownKeyVersion(v))?,
            None => Arc::clone(&ring.current),
        };

        let nonce: [u8; NONCE_LEN] = generate_random_bytes();
        let aad = associated_data(key.version, &key.algorithm);
        let sealed = seal(&key.key, &nonce, &aad, plaintext)?;

        debug!(key_version = key.version, "Wrapped data key");
        WrappedKeyEnvelope::from_sealed(&sealed, &nonce, key.version, &key.algorithm)
    }

    /// Unwrap an envelope with the version it names, current or archived.
    pub fn unwrap(&self, envelope: &WrappedKeyEnvelope) -> Result<Zeroizing<Vec<u8>>> {
        if envelope.algorithm != WRAP_ALGORITHM {
            return Err(CustodyError::MalformedEnvelope(format!(
                "unsupported algorithm {}",
                envelope.algorithm
            )));
        }

        let ring = self.snapshot()?;
        let key = ring
            .versions
            .get(&envelope.key_version)
            .cloned()
            .ok_or(CustodyError::UnknownKeyVersion(envelope.key_version))?;

        let (sealed, nonce) = envelope.decode_sealed()?;
        let aad = associated_data(key.version, &key.algorithm);

        match open(&key.key, &nonce, &aad, &sealed) {
            Ok(plaintext) => {
                debug!(key_version = key.version, "Unwrapped data key");
                Ok(plaintext)
            }
            Err(e) => {
                error!(
                    key_version = key.version,
                    key_id = %key.key_id,
                    "Integrity violation while unwrapping - envelope tampered or corrupted"
                );
                Err(e)
            }
        }
    }

    /// Generate a new current key and archive the previous one.
    pub fn rotate(&self, reason: RotationReason) -> Result<Arc<MasterKey>> {
        let _guard = self.rotation.lock().unwrap_or_else(PoisonError::into_inner);
        self.rotate_locked(reason)
    }

    /// Rotate if the current key is older than the policy threshold.
    pub fn rotate_if_due(&self) -> Result<Option<Arc<MasterKey>>> {
        let _guard = self.rotation.lock().unwrap_or_else(PoisonError::into_inner);
        let current = Arc::clone(&self.snapshot()?.current);
        if !self.is_due(&current, Utc::now()) {
            return Ok(None);
        }
        self.rotate_locked(RotationReason::Scheduled).map(Some)
    }

    /// Whether the current key is past the threshold at `now`.
    pub fn rotation_due_at(&self, now: DateTime<Utc>) -> Result<bool> {
        let current = self.current_key()?;
        Ok(self.is_due(&current, now))
    }

    /// Rotation history as recorded in the rotation log
    pub fn rotation_history(&self) -> Result<Vec<RotationLogEntry>> {
        self.store.read_rotation_log()
    }

    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    fn is_due(&self, key: &MasterKey, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(key.created_at) > self.policy.threshold
    }

    /// Caller must hold `self.rotation`.
    fn ensure_first_boot(&self) -> Result<()> {
        let history = self.store.read_rotation_log().map_err(|e| {
            CustodyError::StartupAborted(format!("keyring missing, rotation log unreadable: {e}"))
        })?;
        let Some(last) = history.last() else {
            return Ok(());
        };

        error!(
            dir = %self.store.dir().display(),
            entries = history.len(),
            last_version = last.version,
            "Keyring file missing but rotation log shows prior keys"
        );
        Err(CustodyError::StartupAborted(format!(
            "keyring missing but rotation log records {} entries up to v{}",
            history.len(),
            last.version
        )))
    }

    fn rotate_locked(&self, reason: RotationReason) -> Result<Arc<MasterKey>> {
        let ring = self.snapshot()?;
        let previous = Arc::clone(&ring.current);
        let version = previous
            .version
            .checked_add(1)
            .ok_or_else(|| CustodyError::Internal("key version space exhausted".into()))?;

        let key = Arc::new(MasterKey::generate(version));
        let mut versions = ring.versions.clone();
        versions.insert(version, Arc::clone(&key));
        let next = KeyRing {
            current: Arc::clone(&key),
            versions,
        };

        // Persist before publishing; a failed write leaves the old ring in place.
        self.store.save(&next.to_stored())?;
        self.swap(next);
        self.log_rotation(&key, Some(previous.version), reason);

        info!(
            version,
            previous_version = previous.version,
            key_id = %key.key_id,
            reason = %reason,
            "Master key rotated"
        );
        Ok(key)
    }

    fn log_rotation(&self, key: &MasterKey, previous_version: Option<u32>, reason: RotationReason) {
        let entry = RotationLogEntry {
            version: key.version,
            previous_version,
            key_id: key.key_id.clone(),
            algorithm: key.algorithm.clone(),
            reason,
            rotated_at: Utc::now(),
        };
        // Key material is already durable at this point; the log is a record of it.
        if let Err(e) = self.store.append_rotation(&entry) {
            error!(version = key.version, "Failed to append rotation log entry: {}", e);
        }
    }

    fn snapshot(&self) -> Result<Arc<KeyRing>> {
        self.ring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(CustodyError::NotInitialized)
    }

    fn swap(&self, ring: KeyRing) {
        *self.ring.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(ring));
    }
}

/// Spawn the periodic rotation check.
pub fn spawn_rotation_task(manager: Arc<MasterKeyManager>) -> JoinHandle<()> {
    let interval = manager.policy.check_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately; startup already checked.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let manager = Arc::clone(&manager);
            match tokio::task::spawn_blocking(move || manager.rotate_if_due()).await {
                Ok(Ok(Some(key))) => {
                    info!(version = key.version(), "Scheduled master key rotation completed");
                }
                Ok(Ok(None)) => debug!("Master key within rotation threshold"),
                Ok(Err(e)) => error!("Scheduled master key rotation failed: {}", e),
                Err(e) => warn!("Rotation check task panicked: {}", e),
            }
        }
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custody::crypto::KdfParams;
    use tempfile::TempDir;

    fn light_params() -> KdfParams {
        KdfParams {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn manager_in(dir: &TempDir, secret: &str) -> MasterKeyManager {
        let store = KeyMaterialStore::open(dir.path(), secret)
            .unwrap()
            .with_kdf_params(light_params());
        MasterKeyManager::new(store, RotationPolicy::default())
    }

    fn initialized(dir: &TempDir) -> MasterKeyManager {
        let manager = manager_in(dir, "storage-secret");
        manager.initialize().unwrap();
        manager
    }

    fn flip_byte(encoded: &str, index: usize) -> String {
        let mut bytes = BASE64.decode(encoded).unwrap();
        bytes[index] ^= 0x01;
        BASE64.encode(bytes)
    }

    #[test]
    fn test_not_initialized() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir, "storage-secret");

        assert!(!manager.is_initialized());
        assert!(matches!(manager.current_key(), Err(CustodyError::NotInitialized)));
        assert!(matches!(
            manager.wrap(None, b"dek"),
            Err(CustodyError::NotInitialized)
        ));
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let dir = TempDir::new().unwrap();
        let manager = initialized(&dir);
        let dek: [u8; 32] = generate_random_bytes();

        let envelope = manager.wrap(None, &dek).unwrap();
        assert_eq!(envelope.key_version, 1);
        assert_eq!(envelope.algorithm, WRAP_ALGORITHM);

        let unwrapped = manager.unwrap(&envelope).unwrap();
        assert_eq!(unwrapped.as_slice(), &dek);
    }

    #[test]
    fn test_same_key_wraps_differently() {
        let dir = TempDir::new().unwrap();
        let manager = initialized(&dir);
        let dek = [9u8; 32];

        let first = manager.wrap(None, &dek).unwrap();
        let second = manager.wrap(None, &dek).unwrap();

        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn test_tampered_ciphertext_is_integrity_violation() {
        let dir = TempDir::new().unwrap();
        let manager = initialized(&dir);
        let mut envelope = manager.wrap(None, &[1u8; 32]).unwrap();
        envelope.ciphertext = flip_byte(&envelope.ciphertext, 0);

        assert!(matches!(
            manager.unwrap(&envelope),
            Err(CustodyError::IntegrityViolation(_))
        ));
    }

    #[test]
    fn test_tampered_tag_is_integrity_violation() {
        let dir = TempDir::new().unwrap();
        let manager = initialized(&dir);
        let mut envelope = manager.wrap(None, &[1u8; 32]).unwrap();
        envelope.tag = flip_byte(&envelope.tag, 15);

        assert!(matches!(
            manager.unwrap(&envelope),
            Err(CustodyError::IntegrityViolation(_))
        ));
    }

    #[test]
    fn test_relabelled_version_is_integrity_violation() {
        let dir = TempDir::new().unwrap();
        let manager = initialized(&dir);
        let mut envelope = manager.wrap(None, &[1u8; 32]).unwrap();
        manager.rotate(RotationReason::Manual).unwrap();

        envelope.key_version = 2;
        assert!(matches!(
            manager.unwrap(&envelope),
            Err(CustodyError::IntegrityViolation(_))
        ));
    }

    #[test]
    fn test_unknown_version() {
        let dir = TempDir::new().unwrap();
        let manager = initialized(&dir);
        let mut envelope = manager.wrap(None, &[1u8; 32]).unwrap();
        envelope.key_version = 42;

        assert!(matches!(
            manager.unwrap(&envelope),
            Err(CustodyError::UnknownKeyVersion(42))
        ));
        assert!(matches!(
            manager.wrap(Some(42), &[1u8; 32]),
            Err(CustodyError::UnknownKeyVersion(42))
        ));
    }

    #[test]
    fn test_rejects_empty_and_oversized_input() {
        let dir = TempDir::new().unwrap();
        let manager = initialized(&dir);

        assert!(matches!(manager.wrap(None, &[]), Err(CustodyError::InvalidInput(_))));
        assert!(matches!(
            manager.wrap(None, &vec![0u8; MAX_WRAP_INPUT + 1]),
            Err(CustodyError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_rotation_keeps_old_versions_unwrappable() {
        let dir = TempDir::new().unwrap();
        let manager = initialized(&dir);
        let dek = [5u8; 32];

        let before = manager.wrap(None, &dek).unwrap();
        let rotated = manager.rotate(RotationReason::Manual).unwrap();
        assert_eq!(rotated.version(), 2);

        let after = manager.wrap(None, &dek).unwrap();
        assert_eq!(before.key_version, 1);
        assert_eq!(after.key_version, 2);
        assert_eq!(manager.unwrap(&before).unwrap().as_slice(), &dek);
        assert_eq!(manager.unwrap(&after).unwrap().as_slice(), &dek);

        // Explicitly wrapping under an archived version still works
        let archived = manager.wrap(Some(1), &dek).unwrap();
        assert_eq!(archived.key_version, 1);

        let versions = manager.key_versions().unwrap();
        assert_eq!(versions[0].version, 2);
        assert_eq!(versions[0].status, KeyStatus::Current);
        assert_eq!(versions[1].status, KeyStatus::Archived);
    }

    #[test]
    fn test_reload_preserves_all_versions() {
        let dir = TempDir::new().unwrap();
        let envelope = {
            let manager = initialized(&dir);
            let envelope = manager.wrap(None, &[3u8; 32]).unwrap();
            manager.rotate(RotationReason::Manual).unwrap();
            envelope
        };

        let reloaded = manager_in(&dir, "storage-secret");
        let current = reloaded.initialize().unwrap();
        assert_eq!(current.version(), 2);
        assert_eq!(reloaded.unwrap(&envelope).unwrap().as_slice(), &[3u8; 32]);
    }

    #[test]
    fn test_wrong_storage_secret_aborts_instead_of_regenerating() {
        let dir = TempDir::new().unwrap();
        initialized(&dir);

        let intruder = manager_in(&dir, "not-the-secret");
        assert!(matches!(
            intruder.initialize(),
            Err(CustodyError::StartupAborted(_))
        ));
        assert!(!intruder.is_initialized());
    }

    #[test]
    fn test_rotation_log_records_history() {
        let dir = TempDir::new().unwrap();
        let manager = initialized(&dir);
        manager.rotate(RotationReason::Manual).unwrap();

        let history = manager.rotation_history().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].reason, RotationReason::Initial);
        assert_eq!(history[1].version, 2);
        assert_eq!(history[1].previous_version, Some(1));
        assert_eq!(history[1].reason, RotationReason::Manual);
    }

    #[test]
    fn test_rotation_due_after_threshold() {
        let dir = TempDir::new().unwrap();
        let manager = initialized(&dir);

        assert!(!manager.rotation_due_at(Utc::now()).unwrap());
        assert!(manager
            .rotation_due_at(Utc::now() + chrono::Duration::days(91))
            .unwrap());
        assert!(manager.rotate_if_due().unwrap().is_none());
    }

    #[test]
    fn test_zero_threshold_rotates_on_check() {
        let dir = TempDir::new().unwrap();
        let store = KeyMaterialStore::open(dir.path(), "storage-secret")
            .unwrap()
            .with_kdf_params(light_params());
        let manager = MasterKeyManager::new(
            store,
            RotationPolicy {
                threshold: chrono::Duration::zero(),
                check_interval: Duration::from_secs(1),
            },
        );
        manager.initialize().unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let rotated = manager.rotate_if_due().unwrap();
        assert!(rotated.is_some());
        assert!(manager.current_key().unwrap().version() >= 2);
    }

    #[test]
    fn test_missing_keyring_with_history_aborts() {
        let dir = TempDir::new().unwrap();
        {
            let manager = initialized(&dir);
            manager.rotate(RotationReason::Manual).unwrap();
        }
        std::fs::remove_file(dir.path().join(crate::custody::store::KEYRING_FILE)).unwrap();

        let reloaded = manager_in(&dir, "storage-secret");
        assert!(matches!(
            reloaded.initialize(),
            Err(CustodyError::StartupAborted(_))
        ));
        assert!(!reloaded.is_initialized());
        assert!(!dir.path().join(crate::custody::store::KEYRING_FILE).exists());
        assert_eq!(reloaded.rotation_history().unwrap().len(), 2);
    }

    #[test]
    fn test_stale_keyring_rotates_on_initialize() {
        let dir = TempDir::new().unwrap();
        let envelope = {
            let manager = initialized(&dir);
            manager.wrap(None, &[6u8; 32]).unwrap()
        };

        // Age the stored v1 past the default 90 day threshold
        let store = KeyMaterialStore::open(dir.path(), "storage-secret")
            .unwrap()
            .with_kdf_params(light_params());
        let mut stored = store.load().unwrap().unwrap();
        for key in stored.keys.iter_mut() {
            key.created_at = Utc::now() - chrono::Duration::days(120);
        }
        store.save(&stored).unwrap();

        let reloaded = manager_in(&dir, "storage-secret");
        let current = reloaded.initialize().unwrap();
        assert_eq!(current.version(), 2);

        let history = reloaded.rotation_history().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].reason, RotationReason::Scheduled);
        assert_eq!(history[1].previous_version, Some(1));
        assert_eq!(reloaded.unwrap(&envelope).unwrap().as_slice(), &[6u8; 32]);

        // The rotated keyring is what the next boot sees
        let again = manager_in(&dir, "storage-secret");
        assert_eq!(again.initialize().unwrap().version(), 2);
    }

    #[test]
    fn test_wraps_racing_rotation_all_unwrap() {
        let dir = TempDir::new().unwrap();
        let manager = initialized(&dir);

        let envelopes: Vec<(u8, WrappedKeyEnvelope)> = std::thread::scope(|scope| {
            let wrappers: Vec<_> = (0..4u8)
                .map(|worker| {
                    let manager = &manager;
                    scope.spawn(move || {
                        (0..25u8)
                            .map(|i| {
                                let tag = worker * 25 + i;
                                (tag, manager.wrap(None, &[tag; 32]).unwrap())
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            let rotator = scope.spawn(|| {
                for _ in 0..5 {
                    manager.rotate(RotationReason::Manual).unwrap();
                }
            });

            rotator.join().unwrap();
            wrappers
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        });

        assert_eq!(envelopes.len(), 100);
        assert_eq!(manager.current_key().unwrap().version(), 6);
        for (tag, envelope) in &envelopes {
            assert!((1..=6).contains(&envelope.key_version));
            assert_eq!(manager.unwrap(envelope).unwrap().as_slice(), &[*tag; 32]);
        }
    }
}
