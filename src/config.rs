//! Configuration for kacls
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::DirectoryConfig;
use crate::custody::RotationPolicy;
use crate::logging::LogFormat;

/// Storage secret used when DEV_MODE is set and none is configured
const DEV_STORAGE_SECRET: &str = "dev-only-insecure-storage-secret-do-not-deploy";

/// Minimum storage secret length outside dev mode
pub const MIN_STORAGE_SECRET_LEN: usize = 32;

/// kacls - key access control list service
///
/// Wraps and unwraps data-encryption keys under a versioned master key,
/// only for callers holding two valid tokens for the same subject.
#[derive(Parser, Debug, Clone)]
#[command(name = "kacls")]
#[command(about = "Separation-of-duties key custody service")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8090")]
    pub listen: SocketAddr,

    /// Directory for the sealed keyring, rotation log and revocation database
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Secret the keyring file is sealed under (required in production)
    #[arg(long, env = "STORAGE_SECRET", hide_env_values = true)]
    pub storage_secret: Option<String>,

    /// Identity issuer configuration
    #[command(flatten)]
    pub issuer: IssuerArgs,

    /// Key and revocation policy
    #[command(flatten)]
    pub policy: PolicyArgs,

    /// Audit log path (JSONL). Defaults to DATA_DIR/audit.jsonl
    #[arg(long, env = "AUDIT_LOG")]
    pub audit_log: Option<PathBuf>,

    /// API key for /admin endpoints. Admin endpoints are disabled when unset.
    #[arg(long, env = "ADMIN_API_KEY", hide_env_values = true)]
    pub admin_api_key: Option<String>,

    /// Enable development mode (in-process token issuer, insecure storage secret)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

/// Identity issuer and signing key cache configuration
#[derive(Parser, Debug, Clone)]
pub struct IssuerArgs {
    /// Base URL of the identity issuer (serves GET /signing-key)
    #[arg(long, env = "IDENTITY_ISSUER_URL")]
    pub identity_issuer_url: Option<String>,

    /// Separate issuer for identity tokens. When unset, both tokens are
    /// verified against IDENTITY_ISSUER_URL.
    #[arg(long, env = "IDENTITY_TOKEN_ISSUER_URL")]
    pub identity_token_issuer_url: Option<String>,

    /// Timeout for issuer requests in milliseconds
    #[arg(long, env = "ISSUER_TIMEOUT_MS", default_value = "3000")]
    pub issuer_timeout_ms: u64,

    /// How long a fetched signing key counts as fresh
    #[arg(long, env = "SIGNING_KEY_TTL_SECS", default_value = "300")]
    pub signing_key_ttl_secs: u64,

    /// Oldest signing key still served while the issuer is unreachable.
    /// Unset serves the last-known-good key indefinitely.
    #[arg(long, env = "SIGNING_KEY_MAX_STALENESS_SECS")]
    pub signing_key_max_staleness_secs: Option<u64>,

    /// Background signing key refresh interval
    #[arg(long, env = "SIGNING_KEY_REFRESH_SECS", default_value = "60")]
    pub signing_key_refresh_secs: u64,

    /// Clock-skew tolerance applied to token expiry
    #[arg(long, env = "CLOCK_SKEW_SECS", default_value = "30")]
    pub clock_skew_secs: u64,

    /// Lifetime of tokens minted by the dev-mode issuer
    #[arg(long, env = "DEV_TOKEN_TTL_SECS", default_value = "3600")]
    pub dev_token_ttl_secs: i64,
}

/// Master key rotation and revocation housekeeping
#[derive(Parser, Debug, Clone)]
pub struct PolicyArgs {
    /// Rotate the master key once it is older than this many days
    #[arg(long, env = "ROTATION_THRESHOLD_DAYS", default_value = "90")]
    pub rotation_threshold_days: u32,

    /// How often to check the rotation threshold
    #[arg(long, env = "ROTATION_CHECK_INTERVAL_SECS", default_value = "3600")]
    pub rotation_check_interval_secs: u64,

    /// How often to prune expired revocation records
    #[arg(long, env = "REVOCATION_PRUNE_INTERVAL_SECS", default_value = "300")]
    pub revocation_prune_interval_secs: u64,
}

impl Args {
    /// Effective storage secret (falls back to an insecure default in dev mode)
    pub fn storage_secret(&self) -> Option<String> {
        match (&self.storage_secret, self.dev_mode) {
            (Some(secret), _) => Some(secret.clone()),
            (None, true) => Some(DEV_STORAGE_SECRET.to_string()),
            (None, false) => None,
        }
    }

    /// Whether tokens are minted in-process instead of by an external issuer
    pub fn uses_dev_issuer(&self) -> bool {
        self.dev_mode && self.issuer.identity_issuer_url.is_none()
    }

    pub fn issuer_timeout(&self) -> Duration {
        Duration::from_millis(self.issuer.issuer_timeout_ms)
    }

    pub fn directory_config(&self) -> DirectoryConfig {
        DirectoryConfig {
            ttl: Duration::from_secs(self.issuer.signing_key_ttl_secs),
            max_staleness: self
                .issuer
                .signing_key_max_staleness_secs
                .map(Duration::from_secs),
            ..Default::default()
        }
    }

    pub fn signing_key_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.issuer.signing_key_refresh_secs)
    }

    pub fn rotation_policy(&self) -> RotationPolicy {
        RotationPolicy {
            threshold: chrono::Duration::days(i64::from(self.policy.rotation_threshold_days)),
            check_interval: Duration::from_secs(self.policy.rotation_check_interval_secs),
        }
    }

    pub fn revocation_prune_interval(&self) -> Duration {
        Duration::from_secs(self.policy.revocation_prune_interval_secs)
    }

    pub fn revocation_db_path(&self) -> PathBuf {
        self.data_dir.join("revocations.redb")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.audit_log
            .clone()
            .unwrap_or_else(|| self.data_dir.join("audit.jsonl"))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode {
            match &self.storage_secret {
                None => return Err("STORAGE_SECRET is required in production mode".to_string()),
                Some(secret) if secret.len() < MIN_STORAGE_SECRET_LEN => {
                    return Err(format!(
                        "STORAGE_SECRET must be at least {MIN_STORAGE_SECRET_LEN} characters"
                    ));
                }
                Some(_) => {}
            }

            if self.issuer.identity_issuer_url.is_none() {
                return Err("IDENTITY_ISSUER_URL is required in production mode".to_string());
            }
        }

        if self.issuer.identity_token_issuer_url.is_some()
            && self.issuer.identity_issuer_url.is_none()
        {
            return Err("IDENTITY_TOKEN_ISSUER_URL requires IDENTITY_ISSUER_URL".to_string());
        }

        if self.issuer.issuer_timeout_ms == 0 {
            return Err("ISSUER_TIMEOUT_MS must be greater than zero".to_string());
        }

        if self.issuer.signing_key_refresh_secs == 0 {
            return Err("SIGNING_KEY_REFRESH_SECS must be greater than zero".to_string());
        }

        if let Some(bound) = self.issuer.signing_key_max_staleness_secs {
            if bound < self.issuer.signing_key_ttl_secs {
                return Err(
                    "SIGNING_KEY_MAX_STALENESS_SECS must not be shorter than SIGNING_KEY_TTL_SECS"
                        .to_string(),
                );
            }
        }

        if self.policy.rotation_threshold_days == 0 {
            return Err("ROTATION_THRESHOLD_DAYS must be greater than zero".to_string());
        }

        if self.policy.rotation_check_interval_secs == 0
            || self.policy.revocation_prune_interval_secs == 0
        {
            return Err("Background task intervals must be greater than zero".to_string());
        }

        if let Some(key) = &self.admin_api_key {
            if key.len() < 16 {
                return Err("ADMIN_API_KEY must be at least 16 characters".to_string());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse_from(std::iter::once("kacls").chain(args.iter().copied()))
    }

    #[test]
    fn test_production_requires_secret_and_issuer() {
        let args = parse(&[]);
        assert!(args.validate().is_err());

        let args = parse(&["--storage-secret", "too-short"]);
        assert!(args.validate().unwrap_err().contains("at least 32"));

        let args = parse(&["--storage-secret", &"s".repeat(32)]);
        assert!(args.validate().unwrap_err().contains("IDENTITY_ISSUER_URL"));

        let args = parse(&[
            "--storage-secret",
            &"s".repeat(32),
            "--identity-issuer-url",
            "https://id.example.com",
        ]);
        assert!(args.validate().is_ok());
        assert!(!args.uses_dev_issuer());
    }

    #[test]
    fn test_dev_mode_defaults() {
        let args = parse(&["--dev-mode"]);
        assert!(args.validate().is_ok());
        assert!(args.uses_dev_issuer());
        assert_eq!(args.storage_secret().as_deref(), Some(DEV_STORAGE_SECRET));
        assert_eq!(args.audit_log_path(), PathBuf::from("./data/audit.jsonl"));
    }

    #[test]
    fn test_policy_conversion() {
        let args = parse(&["--dev-mode", "--rotation-threshold-days", "30"]);
        let policy = args.rotation_policy();
        assert_eq!(policy.threshold, chrono::Duration::days(30));
        assert_eq!(policy.check_interval, Duration::from_secs(3600));

        let directory = args.directory_config();
        assert_eq!(directory.ttl, Duration::from_secs(300));
        assert!(directory.max_staleness.is_none());
    }

    #[test]
    fn test_staleness_shorter_than_ttl_rejected() {
        let args = parse(&[
            "--dev-mode",
            "--signing-key-ttl-secs",
            "300",
            "--signing-key-max-staleness-secs",
            "60",
        ]);
        assert!(args.validate().is_err());
    }
}
