//! Revocation Ledger
//!
//! Durable record of revoked token ids with a positive-only in-memory cache.
//! The durable store is authoritative: a cache miss always falls through to
//! the store, never to "not revoked".

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::types::{CustodyError, Result};

/// Table: revoked
/// Key: jti bytes
/// Value: JSON-encoded RevocationRecord
const REVOKED: TableDefinition<&[u8], &[u8]> = TableDefinition::new("revoked");

/// Table: revoked_by_expiry
/// Key: expires_at seconds (8 bytes BE) + jti bytes
/// Value: empty
const BY_EXPIRY: TableDefinition<&[u8], &[u8]> = TableDefinition::new("revoked_by_expiry");

/// One revoked token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevocationRecord {
    pub jti: String,
    pub subject: String,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: DateTime<Utc>,
}

/// Errors from a revocation store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for CustodyError {
    fn from(err: StoreError) -> Self {
        Self::Storage(format!("revocation store: {err}"))
    }
}

fn io_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Io(e.to_string())
}

// =============================================================================
// Store Trait
// =============================================================================

/// Durable storage for revocation records.
///
/// Synchronous; implementations are expected to be fast local lookups.
pub trait RevocationStore: Send + Sync {
    /// Insert a record. Returns `false` if the jti was already present.
    fn insert(&self, record: &RevocationRecord) -> std::result::Result<bool, StoreError>;

    fn contains(&self, jti: &str) -> std::result::Result<bool, StoreError>;

    fn get(&self, jti: &str) -> std::result::Result<Option<RevocationRecord>, StoreError>;

    /// Remove every record whose expiry is at or before `cutoff`.
    fn prune_expired(&self, cutoff: DateTime<Utc>) -> std::result::Result<usize, StoreError>;

    fn len(&self) -> std::result::Result<usize, StoreError>;
}

// =============================================================================
// Redb Store
// =============================================================================

/// Revocation records in a redb database.
#[derive(Clone)]
pub struct RedbRevocationStore {
    db: Arc<Database>,
}

impl RedbRevocationStore {
    /// Open or create the database at `path`, creating tables if missing.
    pub fn open(path: impl AsRef<Path>) -> std::result::Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(io_err)?;

        let txn = db.begin_write().map_err(io_err)?;
        {
            let _ = txn.open_table(REVOKED).map_err(io_err)?;
            let _ = txn.open_table(BY_EXPIRY).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;

        Ok(Self { db: Arc::new(db) })
    }
}

fn expiry_key(expires_at: DateTime<Utc>, jti: &str) -> Vec<u8> {
    let secs = u64::try_from(expires_at.timestamp()).unwrap_or(0);
    let mut key = Vec::with_capacity(8 + jti.len());
    key.extend_from_slice(&secs.to_be_bytes());
    key.extend_from_slice(jti.as_bytes());
    key
}

impl RevocationStore for RedbRevocationStore {
    fn insert(&self, record: &RevocationRecord) -> std::result::Result<bool, StoreError> {
        let value =
            serde_json::to_vec(record).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let txn = self.db.begin_write().map_err(io_err)?;
        let inserted = {
            let mut revoked = txn.open_table(REVOKED).map_err(io_err)?;
            if revoked.get(record.jti.as_bytes()).map_err(io_err)?.is_some() {
                false
            } else {
                revoked
                    .insert(record.jti.as_bytes(), value.as_slice())
                    .map_err(io_err)?;

                let mut by_expiry = txn.open_table(BY_EXPIRY).map_err(io_err)?;
                let index_key = expiry_key(record.expires_at, &record.jti);
                let empty: &[u8] = &[];
                by_expiry.insert(index_key.as_slice(), empty).map_err(io_err)?;
                true
            }
        };
        txn.commit().map_err(io_err)?;

        Ok(inserted)
    }

    fn contains(&self, jti: &str) -> std::result::Result<bool, StoreError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(REVOKED).map_err(io_err)?;
        Ok(table.get(jti.as_bytes()).map_err(io_err)?.is_some())
    }

    fn get(&self, jti: &str) -> std::result::Result<Option<RevocationRecord>, StoreError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(REVOKED).map_err(io_err)?;

        match table.get(jti.as_bytes()).map_err(io_err)? {
            Some(value) => serde_json::from_slice(value.value())
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn prune_expired(&self, cutoff: DateTime<Utc>) -> std::result::Result<usize, StoreError> {
        // Every index key with expiry <= cutoff sorts below this bound
        let upper = (u64::try_from(cutoff.timestamp()).unwrap_or(0) + 1).to_be_bytes();
        let lower = [0u8; 8];

        let txn = self.db.begin_write().map_err(io_err)?;
        let pruned = {
            let mut by_expiry = txn.open_table(BY_EXPIRY).map_err(io_err)?;
            let mut expired_keys = Vec::new();
            for entry in by_expiry
                .range(lower.as_slice()..upper.as_slice())
                .map_err(io_err)?
            {
                let (key, _) = entry.map_err(io_err)?;
                expired_keys.push(key.value().to_vec());
            }

            let mut revoked = txn.open_table(REVOKED).map_err(io_err)?;
            for key in &expired_keys {
                by_expiry.remove(key.as_slice()).map_err(io_err)?;
                revoked.remove(&key[8..]).map_err(io_err)?;
            }
            expired_keys.len()
        };
        txn.commit().map_err(io_err)?;

        Ok(pruned)
    }

    fn len(&self) -> std::result::Result<usize, StoreError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(REVOKED).map_err(io_err)?;
        let mut count = 0;
        for entry in table.iter().map_err(io_err)? {
            entry.map_err(io_err)?;
            count += 1;
        }
        Ok(count)
    }
}

// =============================================================================
// Memory Store
// =============================================================================

/// In-memory store for dev mode and tests. Lost on restart.
#[derive(Default)]
pub struct MemoryRevocationStore {
    records: RwLock<HashMap<String, RevocationRecord>>,
}

impl MemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RevocationStore for MemoryRevocationStore {
    fn insert(&self, record: &RevocationRecord) -> std::result::Result<bool, StoreError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if records.contains_key(&record.jti) {
            return Ok(false);
        }
        records.insert(record.jti.clone(), record.clone());
        Ok(true)
    }

    fn contains(&self, jti: &str) -> std::result::Result<bool, StoreError> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.contains_key(jti))
    }

    fn get(&self, jti: &str) -> std::result::Result<Option<RevocationRecord>, StoreError> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(jti).cloned())
    }

    fn prune_expired(&self, cutoff: DateTime<Utc>) -> std::result::Result<usize, StoreError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, record| record.expires_at > cutoff);
        Ok(before - records.len())
    }

    fn len(&self) -> std::result::Result<usize, StoreError> {
        Ok(self.records.read().unwrap_or_else(PoisonError::into_inner).len())
    }
}

// =============================================================================
// Ledger
// =============================================================================

/// Revocation checks for every token verification.
pub struct RevocationLedger {
    store: Arc<dyn RevocationStore>,
    /// jti -> expires_at, for known-revoked tokens only
    cache: DashMap<String, DateTime<Utc>>,
    /// Records are kept this long past expiry, matching verifier clock skew
    prune_grace: chrono::Duration,
    cache_hits: AtomicU64,
    store_lookups: AtomicU64,
    revocations: AtomicU64,
    pruned: AtomicU64,
}

impl RevocationLedger {
    pub fn new(store: Arc<dyn RevocationStore>, prune_grace: chrono::Duration) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            prune_grace,
            cache_hits: AtomicU64::new(0),
            store_lookups: AtomicU64::new(0),
            revocations: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
        }
    }

    /// In-memory ledger
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryRevocationStore::new()),
            chrono::Duration::seconds(30),
        )
    }

    /// Revoke a token id. Revoking an already-revoked id succeeds.
    pub fn revoke(&self, jti: &str, subject: &str, expires_at: DateTime<Utc>) -> Result<()> {
        if jti.is_empty() {
            return Err(CustodyError::InvalidInput("jti is empty".into()));
        }

        let record = RevocationRecord {
            jti: jti.to_string(),
            subject: subject.to_string(),
            expires_at,
            revoked_at: Utc::now(),
        };
        let inserted = self.store.insert(&record)?;
        self.cache.insert(record.jti, expires_at);

        if inserted {
            self.revocations.fetch_add(1, Ordering::Relaxed);
            info!(jti = %jti, subject = %subject, expires_at = %expires_at, "Token revoked");
        } else {
            debug!(jti = %jti, "Token already revoked");
        }
        Ok(())
    }

    /// Whether `jti` has been revoked. Store errors propagate; they are never
    /// read as "not revoked".
    pub fn is_revoked(&self, jti: &str) -> Result<bool> {
        if self.cache.contains_key(jti) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }

        self.store_lookups.fetch_add(1, Ordering::Relaxed);
        match self.store.get(jti)? {
            Some(record) => {
                self.cache.insert(record.jti, record.expires_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove records whose token is past expiry plus the grace period.
    pub fn prune_expired(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.prune_grace;
        let pruned = self.store.prune_expired(cutoff)?;
        self.cache.retain(|_, expires_at| *expires_at > cutoff);

        if pruned > 0 {
            self.pruned.fetch_add(pruned as u64, Ordering::Relaxed);
            info!(pruned, "Pruned expired revocation records");
        }
        Ok(pruned)
    }

    pub fn stats(&self) -> RevocationStats {
        RevocationStats {
            records: self.store.len().ok(),
            cache_entries: self.cache.len(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            store_lookups: self.store_lookups.load(Ordering::Relaxed),
            revocations: self.revocations.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
        }
    }
}

/// Spawn the periodic prune.
pub fn spawn_prune_task(ledger: Arc<RevocationLedger>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;

            let ledger = Arc::clone(&ledger);
            match tokio::task::spawn_blocking(move || ledger.prune_expired()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("Revocation prune failed: {}", e),
                Err(e) => warn!("Revocation prune task panicked: {}", e),
            }
        }
    })
}

/// Ledger statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevocationStats {
    pub records: Option<usize>,
    pub cache_entries: usize,
    pub cache_hits: u64,
    pub store_lookups: u64,
    pub revocations: u64,
    pub pruned: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(jti: &str, expires_at: DateTime<Utc>) -> RevocationRecord {
        RevocationRecord {
            jti: jti.into(),
            subject: "user-1".into(),
            expires_at,
            revoked_at: Utc::now(),
        }
    }

    #[test]
    fn test_redb_insert_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = RedbRevocationStore::open(dir.path().join("revocations.redb")).unwrap();
        let exp = Utc::now() + chrono::Duration::hours(1);

        assert!(store.insert(&record("a", exp)).unwrap());
        assert!(!store.insert(&record("a", exp)).unwrap());
        assert!(store.contains("a").unwrap());
        assert!(!store.contains("b").unwrap());
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.get("a").unwrap().unwrap().subject, "user-1");
    }

    #[test]
    fn test_redb_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("revocations.redb");
        let exp = Utc::now() + chrono::Duration::hours(1);
        {
            let store = RedbRevocationStore::open(&path).unwrap();
            store.insert(&record("persisted", exp)).unwrap();
        }

        let store = RedbRevocationStore::open(&path).unwrap();
        assert!(store.contains("persisted").unwrap());
    }

    #[test]
    fn test_redb_prune_uses_expiry_index() {
        let dir = TempDir::new().unwrap();
        let store = RedbRevocationStore::open(dir.path().join("revocations.redb")).unwrap();
        let now = Utc::now();

        store.insert(&record("old", now - chrono::Duration::hours(2))).unwrap();
        store.insert(&record("older", now - chrono::Duration::hours(3))).unwrap();
        store.insert(&record("live", now + chrono::Duration::hours(1))).unwrap();

        assert_eq!(store.prune_expired(now).unwrap(), 2);
        assert!(!store.contains("old").unwrap());
        assert!(!store.contains("older").unwrap());
        assert!(store.contains("live").unwrap());
        assert_eq!(store.prune_expired(now).unwrap(), 0);
    }

    #[test]
    fn test_cache_miss_falls_through_to_store() {
        let store = Arc::new(MemoryRevocationStore::new());
        let exp = Utc::now() + chrono::Duration::hours(1);
        // Written directly to the store, never seen by this ledger's cache
        store.insert(&record("elsewhere", exp)).unwrap();

        let ledger = RevocationLedger::new(store, chrono::Duration::seconds(30));
        assert!(ledger.is_revoked("elsewhere").unwrap());
        assert!(ledger.is_revoked("elsewhere").unwrap());

        let stats = ledger.stats();
        assert_eq!(stats.store_lookups, 1);
        assert_eq!(stats.cache_hits, 1);
    }

    #[test]
    fn test_revoke_twice_is_not_an_error() {
        let ledger = RevocationLedger::in_memory();
        let exp = Utc::now() + chrono::Duration::hours(1);

        ledger.revoke("jti-1", "user-1", exp).unwrap();
        ledger.revoke("jti-1", "user-1", exp).unwrap();
        assert!(ledger.is_revoked("jti-1").unwrap());
        assert!(!ledger.is_revoked("jti-2").unwrap());
        assert_eq!(ledger.stats().revocations, 1);
    }

    #[test]
    fn test_prune_keeps_records_within_grace() {
        let ledger = RevocationLedger::in_memory();
        let now = Utc::now();

        ledger.revoke("just-expired", "u", now - chrono::Duration::seconds(5)).unwrap();
        ledger.revoke("long-expired", "u", now - chrono::Duration::hours(1)).unwrap();

        assert_eq!(ledger.prune_expired().unwrap(), 1);
        assert!(ledger.is_revoked("just-expired").unwrap());
        assert!(!ledger.is_revoked("long-expired").unwrap());
    }

    #[test]
    fn test_empty_jti_rejected() {
        let ledger = RevocationLedger::in_memory();
        assert!(matches!(
            ledger.revoke("", "u", Utc::now()),
            Err(CustodyError::InvalidInput(_))
        ));
    }
}
