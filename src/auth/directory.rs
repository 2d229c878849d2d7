//! Identity Key Directory
//!
//! Fetches and caches the identity issuer's signature-verification key.
//!
//! Request paths never wait on the network while a usable key is cached:
//! a lapsed TTL triggers a background refresh and the cached key keeps
//! serving. A synchronous fetch happens only when nothing is cached, or when
//! the cached key is older than the optional max-staleness bound.
//!
//! On fetch failure the last-known-good key is returned (degraded mode).
//! With no key ever fetched, every caller gets `KeyUnavailable`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use jsonwebtoken::DecodingKey;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::custody::crypto::derive_key_id;
use crate::types::{CustodyError, Result};

/// Algorithm identifier the directory accepts
pub const SIGNING_KEY_ALGORITHM: &str = "EdDSA";

/// Ed25519 public key length
const ED25519_PUBLIC_KEY_LEN: usize = 32;

// =============================================================================
// Public Signing Key
// =============================================================================

/// An issuer's public verification key.
#[derive(Clone)]
pub struct PublicSigningKey {
    key_id: String,
    algorithm: String,
    /// Raw key, base64url without padding
    public_key: String,
    decoding: DecodingKey,
}

impl PublicSigningKey {
    /// Build from raw Ed25519 public key bytes.
    ///
    /// The key id defaults to the truncated SHA-256 of the key bytes.
    pub fn from_ed25519(bytes: &[u8], key_id: Option<String>) -> Result<Self> {
        if bytes.len() != ED25519_PUBLIC_KEY_LEN {
            return Err(DirectoryError::InvalidKey(format!(
                "expected {ED25519_PUBLIC_KEY_LEN} byte Ed25519 key, got {}",
                bytes.len()
            ))
            .into());
        }

        let public_key = URL_SAFE_NO_PAD.encode(bytes);
        let decoding = DecodingKey::from_ed_components(&public_key)
            .map_err(|e| DirectoryError::InvalidKey(e.to_string()))?;

        Ok(Self {
            key_id: key_id.unwrap_or_else(|| derive_key_id(bytes)),
            algorithm: SIGNING_KEY_ALGORITHM.to_string(),
            public_key,
            decoding,
        })
    }

    /// Build from the issuer's published document.
    pub fn from_published(published: PublishedSigningKey) -> Result<Self> {
        if !published.algorithm.eq_ignore_ascii_case(SIGNING_KEY_ALGORITHM)
            && !published.algorithm.eq_ignore_ascii_case("Ed25519")
        {
            return Err(DirectoryError::InvalidKey(format!(
                "unsupported algorithm {}",
                published.algorithm
            ))
            .into());
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(published.public_key.trim_end_matches('='))
            .or_else(|_| STANDARD.decode(&published.public_key))
            .map_err(|e| DirectoryError::InvalidKey(format!("public key encoding: {e}")))?;

        Self::from_ed25519(&bytes, published.key_id)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Raw key bytes, base64url without padding
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }

    /// The document form an issuer publishes at `GET /signing-key`.
    pub fn to_published(&self) -> PublishedSigningKey {
        PublishedSigningKey {
            public_key: self.public_key.clone(),
            algorithm: self.algorithm.clone(),
            key_id: Some(self.key_id.clone()),
        }
    }
}

impl std::fmt::Debug for PublicSigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicSigningKey")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Response body of the issuer's `GET /signing-key`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedSigningKey {
    pub public_key: String,
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

// =============================================================================
// Key Sources
// =============================================================================

/// Where the directory gets its key from.
#[async_trait]
pub trait SigningKeySource: Send + Sync {
    async fn fetch(&self) -> std::result::Result<PublicSigningKey, DirectoryError>;

    /// Human-readable origin, for logs
    fn describe(&self) -> String;
}

/// Fetches `GET {base_url}/signing-key` from the identity issuer.
pub struct HttpSigningKeySource {
    url: String,
    http_client: reqwest::Client,
}

impl HttpSigningKeySource {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent("kacls/1.0")
            .build()
            .unwrap_or_default();

        Self {
            url: format!("{}/signing-key", base_url.trim_end_matches('/')),
            http_client,
        }
    }
}

#[async_trait]
impl SigningKeySource for HttpSigningKeySource {
    async fn fetch(&self) -> std::result::Result<PublicSigningKey, DirectoryError> {
        debug!(url = %self.url, "Fetching issuer signing key");

        let response = self
            .http_client
            .get(&self.url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DirectoryError::Timeout(self.url.clone())
                } else {
                    DirectoryError::Network(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(DirectoryError::FetchFailed(format!(
                "HTTP {} from {}",
                response.status(),
                self.url
            )));
        }

        let published: PublishedSigningKey = response
            .json()
            .await
            .map_err(|e| DirectoryError::InvalidKey(e.to_string()))?;

        PublicSigningKey::from_published(published)
            .map_err(|e| DirectoryError::InvalidKey(e.to_string()))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// A fixed key, used when the issuer runs in-process.
pub struct StaticSigningKeySource {
    key: PublicSigningKey,
}

impl StaticSigningKeySource {
    pub fn new(key: PublicSigningKey) -> Self {
        Self { key }
    }
}

#[async_trait]
impl SigningKeySource for StaticSigningKeySource {
    async fn fetch(&self) -> std::result::Result<PublicSigningKey, DirectoryError> {
        Ok(self.key.clone())
    }

    fn describe(&self) -> String {
        format!("static:{}", self.key.key_id)
    }
}

// =============================================================================
// Directory
// =============================================================================

/// Directory tuning
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// How long a fetched key counts as fresh (default: 5 minutes)
    pub ttl: Duration,

    /// Oldest cached key still served when the issuer is unreachable.
    /// `None` serves the last-known-good key indefinitely.
    pub max_staleness: Option<Duration>,

    /// Minimum spacing between refreshes triggered by an unknown `kid`
    pub kid_refresh_interval: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_staleness: None,
            kid_refresh_interval: Duration::from_secs(30),
        }
    }
}

/// A cached key with the time it was fetched
#[derive(Debug)]
pub struct CachedSigningKey {
    pub key: PublicSigningKey,
    pub fetched_at: Instant,
    pub ttl: Duration,
}

impl CachedSigningKey {
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    pub fn is_fresh(&self) -> bool {
        self.age() < self.ttl
    }
}

struct DirectoryInner {
    name: String,
    source: Box<dyn SigningKeySource>,
    config: DirectoryConfig,
    cache: RwLock<Option<Arc<CachedSigningKey>>>,
    refreshing: AtomicBool,
    last_kid_refresh: Mutex<Option<Instant>>,
    fetches_ok: AtomicU64,
    fetches_failed: AtomicU64,
    stale_served: AtomicU64,
}

/// Shared handle to one issuer's signing key cache. Clones share state.
#[derive(Clone)]
pub struct IdentityKeyDirectory {
    inner: Arc<DirectoryInner>,
}

impl IdentityKeyDirectory {
    /// Create an empty directory. `name` labels log lines and stats.
    pub fn new(
        name: impl Into<String>,
        source: impl SigningKeySource + 'static,
        config: DirectoryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DirectoryInner {
                name: name.into(),
                source: Box::new(source),
                config,
                cache: RwLock::new(None),
                refreshing: AtomicBool::new(false),
                last_kid_refresh: Mutex::new(None),
                fetches_ok: AtomicU64::new(0),
                fetches_failed: AtomicU64::new(0),
                stale_served: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Key to verify against right now.
    pub async fn current_signing_key(&self) -> Result<PublicSigningKey> {
        match self.cached().await {
            Some(cached) if cached.is_fresh() => Ok(cached.key.clone()),
            Some(cached) if self.within_max_staleness(&cached) => {
                self.spawn_background_refresh();
                Ok(cached.key.clone())
            }
            _ => self.refresh().await,
        }
    }

    /// Fetch from the issuer, replacing the cache on success.
    ///
    /// On failure falls back to the cached key if one exists and is within
    /// the staleness bound; otherwise `KeyUnavailable`.
    pub async fn refresh(&self) -> Result<PublicSigningKey> {
        match self.inner.source.fetch().await {
            Ok(key) => {
                self.inner.fetches_ok.fetch_add(1, Ordering::Relaxed);
                let previous = self.cache_key(key.clone()).await;
                if previous.as_deref() != Some(key.key_id()) {
                    info!(
                        directory = %self.inner.name,
                        key_id = %key.key_id(),
                        previous = ?previous,
                        "Issuer signing key loaded"
                    );
                }
                Ok(key)
            }
            Err(e) => {
                self.inner.fetches_failed.fetch_add(1, Ordering::Relaxed);
                self.fallback(e).await
            }
        }
    }

    /// A token named a key id the cache does not hold and failed to verify
    /// against the cached key. Schedules a background refresh so an issuer-side
    /// rotation is picked up without holding the request on the network.
    ///
    /// Rate-limited so a stream of forged `kid`s cannot hammer the issuer.
    /// Returns whether a refresh was scheduled.
    pub fn note_unknown_kid(&self, kid: &str) -> bool {
        let due = {
            let mut last = self
                .inner
                .last_kid_refresh
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let due = last
                .map(|at| at.elapsed() >= self.inner.config.kid_refresh_interval)
                .unwrap_or(true);
            if due {
                *last = Some(Instant::now());
            }
            due
        };

        if due {
            debug!(directory = %self.inner.name, kid = %kid, "Unknown key id, refreshing");
            self.spawn_background_refresh();
        }
        due
    }

    /// Drop the cached key. The next caller fetches synchronously.
    pub async fn invalidate(&self) {
        *self.inner.cache.write().await = None;
        info!(directory = %self.inner.name, "Signing key cache invalidated");
    }

    /// The cached entry, fresh or not
    pub async fn cached(&self) -> Option<Arc<CachedSigningKey>> {
        self.inner.cache.read().await.clone()
    }

    /// Whether a key is cached at all
    pub async fn has_key(&self) -> bool {
        self.inner.cache.read().await.is_some()
    }

    /// Periodic refresh on a timer.
    pub fn spawn_refresh_task(&self, interval: Duration) -> JoinHandle<()> {
        let directory = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                // Failures are logged in refresh/fallback
                let _ = directory.refresh().await;
            }
        })
    }

    pub async fn stats(&self) -> DirectoryStats {
        let cached = self.cached().await;
        DirectoryStats {
            name: self.inner.name.clone(),
            source: self.inner.source.describe(),
            key_id: cached.as_ref().map(|c| c.key.key_id().to_string()),
            key_age_secs: cached.as_ref().map(|c| c.age().as_secs()),
            fresh: cached.as_ref().map(|c| c.is_fresh()).unwrap_or(false),
            fetches_ok: self.inner.fetches_ok.load(Ordering::Relaxed),
            fetches_failed: self.inner.fetches_failed.load(Ordering::Relaxed),
            stale_served: self.inner.stale_served.load(Ordering::Relaxed),
        }
    }

    fn within_max_staleness(&self, cached: &CachedSigningKey) -> bool {
        self.inner
            .config
            .max_staleness
            .map(|bound| cached.age() <= bound)
            .unwrap_or(true)
    }

    async fn cache_key(&self, key: PublicSigningKey) -> Option<String> {
        let entry = Arc::new(CachedSigningKey {
            key,
            fetched_at: Instant::now(),
            ttl: self.inner.config.ttl,
        });
        let mut cache = self.inner.cache.write().await;
        cache
            .replace(entry)
            .map(|previous| previous.key.key_id().to_string())
    }

    async fn fallback(&self, error: DirectoryError) -> Result<PublicSigningKey> {
        match self.cached().await {
            Some(cached) if self.within_max_staleness(&cached) => {
                self.inner.stale_served.fetch_add(1, Ordering::Relaxed);
                warn!(
                    directory = %self.inner.name,
                    source = %self.inner.source.describe(),
                    key_id = %cached.key.key_id(),
                    age_secs = cached.age().as_secs(),
                    "Signing key refresh failed, serving last-known-good key (degraded): {}",
                    error
                );
                Ok(cached.key.clone())
            }
            Some(cached) => {
                warn!(
                    directory = %self.inner.name,
                    age_secs = cached.age().as_secs(),
                    "Signing key refresh failed and cached key exceeds max staleness: {}",
                    error
                );
                Err(CustodyError::KeyUnavailable(format!(
                    "{} key stale beyond bound: {error}",
                    self.inner.name
                )))
            }
            None => {
                warn!(
                    directory = %self.inner.name,
                    source = %self.inner.source.describe(),
                    "No signing key available, authorization fails closed: {}",
                    error
                );
                Err(error.into())
            }
        }
    }

    fn spawn_background_refresh(&self) {
        if self
            .inner
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let directory = self.clone();
        tokio::spawn(async move {
            let _ = directory.refresh().await;
            directory.inner.refreshing.store(false, Ordering::Release);
        });
    }
}

/// Directory statistics, exposed on `/metrics`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryStats {
    pub name: String,
    pub source: String,
    pub key_id: Option<String>,
    pub key_age_secs: Option<u64>,
    pub fresh: bool,
    pub fetches_ok: u64,
    pub fetches_failed: u64,
    pub stale_served: u64,
}

/// Errors from fetching an issuer key
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out fetching {0}")]
    Timeout(String),

    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    #[error("Invalid signing key: {0}")]
    InvalidKey(String),
}

impl From<DirectoryError> for CustodyError {
    fn from(err: DirectoryError) -> Self {
        Self::KeyUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// A source whose availability the test controls
    struct SwitchableSource {
        key: PublicSigningKey,
        up: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SigningKeySource for SwitchableSource {
        async fn fetch(&self) -> std::result::Result<PublicSigningKey, DirectoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.up.load(Ordering::SeqCst) {
                Ok(self.key.clone())
            } else {
                Err(DirectoryError::Network("connection refused".into()))
            }
        }

        fn describe(&self) -> String {
            "switchable".into()
        }
    }

    fn test_key() -> PublicSigningKey {
        PublicSigningKey::from_ed25519(&[7u8; 32], None).unwrap()
    }

    fn directory(
        up: bool,
        config: DirectoryConfig,
    ) -> (IdentityKeyDirectory, Arc<AtomicBool>, Arc<AtomicUsize>) {
        let up = Arc::new(AtomicBool::new(up));
        let calls = Arc::new(AtomicUsize::new(0));
        let source = SwitchableSource {
            key: test_key(),
            up: Arc::clone(&up),
            calls: Arc::clone(&calls),
        };
        (IdentityKeyDirectory::new("test", source, config), up, calls)
    }

    #[test]
    fn test_published_key_roundtrip() {
        let key = test_key();
        let published = key.to_published();
        assert_eq!(published.algorithm, "EdDSA");

        let parsed = PublicSigningKey::from_published(published).unwrap();
        assert_eq!(parsed.key_id(), key.key_id());
        assert_eq!(parsed.public_key(), key.public_key());
    }

    #[test]
    fn test_rejects_wrong_algorithm_and_length() {
        let published = PublishedSigningKey {
            public_key: URL_SAFE_NO_PAD.encode([1u8; 32]),
            algorithm: "RS256".into(),
            key_id: None,
        };
        assert!(PublicSigningKey::from_published(published).is_err());
        assert!(PublicSigningKey::from_ed25519(&[1u8; 16], None).is_err());
    }

    #[tokio::test]
    async fn test_no_cache_and_issuer_down_fails_closed() {
        let (directory, _, _) = directory(false, DirectoryConfig::default());

        let result = directory.current_signing_key().await;
        assert!(matches!(result, Err(CustodyError::KeyUnavailable(_))));
        assert!(!directory.has_key().await);
    }

    #[tokio::test]
    async fn test_fresh_cache_does_not_refetch() {
        let (directory, _, calls) = directory(true, DirectoryConfig::default());

        directory.current_signing_key().await.unwrap();
        directory.current_signing_key().await.unwrap();
        directory.current_signing_key().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_serves_stale_key() {
        let (directory, up, _) = directory(true, DirectoryConfig::default());
        let key = directory.refresh().await.unwrap();

        up.store(false, Ordering::SeqCst);
        let stale = directory.refresh().await.unwrap();
        assert_eq!(stale.key_id(), key.key_id());

        let stats = directory.stats().await;
        assert_eq!(stats.fetches_failed, 1);
        assert_eq!(stats.stale_served, 1);
    }

    #[tokio::test]
    async fn test_expired_ttl_serves_cached_key_without_waiting() {
        let config = DirectoryConfig {
            ttl: Duration::ZERO,
            ..Default::default()
        };
        let (directory, up, _) = directory(true, config);
        directory.refresh().await.unwrap();

        up.store(false, Ordering::SeqCst);
        let key = directory.current_signing_key().await.unwrap();
        assert_eq!(key.key_id(), test_key().key_id());
    }

    #[tokio::test]
    async fn test_max_staleness_bound_fails_closed() {
        let config = DirectoryConfig {
            ttl: Duration::ZERO,
            max_staleness: Some(Duration::ZERO),
            ..Default::default()
        };
        let (directory, up, _) = directory(true, config);
        directory.refresh().await.unwrap();

        up.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(matches!(
            directory.current_signing_key().await,
            Err(CustodyError::KeyUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_kid_refresh_is_rate_limited() {
        let config = DirectoryConfig {
            kid_refresh_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let (directory, _, calls) = directory(true, config);
        directory.refresh().await.unwrap();

        assert!(directory.note_unknown_kid("unknown"));
        assert!(!directory.note_unknown_kid("unknown"));
        assert!(!directory.note_unknown_kid("other"));

        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_fetch() {
        let (directory, up, _) = directory(true, DirectoryConfig::default());
        directory.refresh().await.unwrap();
        directory.invalidate().await;

        up.store(false, Ordering::SeqCst);
        assert!(directory.current_signing_key().await.is_err());
    }
}
