//! Health check endpoints
//!
//! - /health - liveness, 200 whenever the process serves requests
//! - /ready - readiness, 200 only once a master key is loaded and every
//!   issuer directory holds a signing key
//! - /info - non-secret capability metadata
//! - /metrics - operation counters

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;

use super::json_response;
use crate::auth::{DirectoryStats, RevocationStats, SIGNING_KEY_ALGORITHM};
use crate::custody::{KeyVersionInfo, RotationLogEntry, WRAP_ALGORITHM};
use crate::logging::AuditStats;
use crate::server::AppState;

/// Liveness response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    /// Uptime in seconds
    pub uptime: u64,
    pub timestamp: String,
    pub dev_mode: bool,
}

/// Readiness response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessResponse {
    pub ready: bool,
    pub master_key_loaded: bool,
    pub directories: Vec<DirectoryReadiness>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryReadiness {
    pub name: String,
    pub has_key: bool,
}

/// Liveness probe
pub fn health_check(state: Arc<AppState>) -> Response<Full<Bytes>> {
    let response = HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        timestamp: Utc::now().to_rfc3339(),
        dev_mode: state.args.dev_mode,
    };

    json_response(StatusCode::OK, &response)
}

/// Readiness probe
pub async fn readiness_check(state: Arc<AppState>) -> Response<Full<Bytes>> {
    let master_key_loaded = state.service.key_manager().is_initialized();

    let mut directories = Vec::with_capacity(state.directories.len());
    for directory in &state.directories {
        directories.push(DirectoryReadiness {
            name: directory.name().to_string(),
            has_key: directory.has_key().await,
        });
    }

    let reason = if !master_key_loaded {
        Some("Master key not loaded".to_string())
    } else {
        directories
            .iter()
            .find(|d| !d.has_key)
            .map(|d| format!("No signing key for issuer '{}'", d.name))
    };

    let ready = reason.is_none();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    json_response(
        status,
        &ReadinessResponse {
            ready,
            master_key_loaded,
            directories,
            reason,
        },
    )
}

// =============================================================================
// Info
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub wrap_algorithm: &'static str,
    pub token_algorithm: &'static str,
    pub current_key_version: Option<u32>,
    pub key_versions: Vec<KeyVersionInfo>,
    pub next_rotation_at: Option<DateTime<Utc>>,
    pub last_rotation: Option<RotationLogEntry>,
    pub issuers: Vec<IssuerInfo>,
    /// Whether resource and identity tokens come from separate issuers
    pub separate_issuers: bool,
    pub clock_skew_secs: u64,
    pub dev_mode: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerInfo {
    pub name: String,
    pub key_id: Option<String>,
    pub fresh: bool,
}

/// Non-secret metadata: algorithms, key versions, issuers.
pub async fn info(state: Arc<AppState>) -> Response<Full<Bytes>> {
    let keys = state.service.key_manager();
    let current = keys.current_key().ok();
    let next_rotation_at = current
        .as_ref()
        .map(|key| key.created_at() + keys.policy().threshold);

    let mut issuers = Vec::with_capacity(state.directories.len());
    for directory in &state.directories {
        let stats = directory.stats().await;
        issuers.push(IssuerInfo {
            name: stats.name,
            key_id: stats.key_id,
            fresh: stats.fresh,
        });
    }

    let response = InfoResponse {
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        wrap_algorithm: WRAP_ALGORITHM,
        token_algorithm: SIGNING_KEY_ALGORITHM,
        current_key_version: current.map(|key| key.version()),
        key_versions: keys.key_versions().unwrap_or_default(),
        next_rotation_at,
        last_rotation: keys
            .rotation_history()
            .ok()
            .and_then(|history| history.into_iter().last()),
        separate_issuers: state.directories.len() > 1,
        issuers,
        clock_skew_secs: state.args.issuer.clock_skew_secs,
        dev_mode: state.args.dev_mode,
    };

    json_response(StatusCode::OK, &response)
}

// =============================================================================
// Metrics
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResponse {
    pub uptime: u64,
    pub current_key_version: Option<u32>,
    pub key_version_count: usize,
    pub audit: AuditStats,
    pub revocation: RevocationStats,
    pub directories: Vec<DirectoryStats>,
}

pub async fn metrics(state: Arc<AppState>) -> Response<Full<Bytes>> {
    let keys = state.service.key_manager();

    let mut directories = Vec::with_capacity(state.directories.len());
    for directory in &state.directories {
        directories.push(directory.stats().await);
    }

    let response = MetricsResponse {
        uptime: state.started_at.elapsed().as_secs(),
        current_key_version: keys.current_key().ok().map(|key| key.version()),
        key_version_count: keys.key_versions().map(|v| v.len()).unwrap_or(0),
        audit: state.service.audit().stats(),
        revocation: state.service.ledger().stats(),
        directories,
    };

    json_response(StatusCode::OK, &response)
}
