//! Operator endpoints
//!
//! - POST /admin/rotate - rotate the master key now
//! - POST /admin/revoke - revoke a token id before it expires
//!
//! Both require `X-Api-Key` to match ADMIN_API_KEY. With no key configured the
//! endpoints answer 404.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::{
    error_response, header_value, json_response, not_found_response, parse_json_body,
    API_KEY_HEADER,
};
use crate::custody::RotationReason;
use crate::server::AppState;
use crate::types::CustodyError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeRequest {
    pub jti: String,
    pub subject: String,
    /// Expiry of the revoked token; the record is pruned after it
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateResponse {
    pub version: u32,
    pub key_id: String,
    pub algorithm: String,
    pub created_at: DateTime<Utc>,
}

/// Why an admin request was refused
enum AdminRejection {
    Disabled,
    BadKey,
}

fn check_api_key(state: &AppState, req: &Request<Incoming>) -> Result<(), AdminRejection> {
    let Some(expected) = state.args.admin_api_key.as_deref().filter(|k| !k.is_empty()) else {
        return Err(AdminRejection::Disabled);
    };

    match header_value(req, API_KEY_HEADER) {
        Some(presented) if constant_time_compare(presented, expected) => Ok(()),
        _ => Err(AdminRejection::BadKey),
    }
}

fn rejection_response(rejection: AdminRejection, path: &str) -> Response<Full<Bytes>> {
    match rejection {
        AdminRejection::Disabled => not_found_response(path),
        AdminRejection::BadKey => {
            warn!(path, "Admin request with missing or invalid API key");
            json_response(
                StatusCode::UNAUTHORIZED,
                &serde_json::json!({ "error": "Invalid API key" }),
            )
        }
    }
}

/// POST /admin/rotate
pub async fn handle_rotate(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    if let Err(rejection) = check_api_key(&state, &req) {
        return rejection_response(rejection, "/admin/rotate");
    }

    match state.service.rotate(RotationReason::Manual).await {
        Ok(key) => {
            info!(version = key.version(), "Master key rotated by operator");
            json_response(
                StatusCode::OK,
                &RotateResponse {
                    version: key.version(),
                    key_id: key.key_id().to_string(),
                    algorithm: key.algorithm().to_string(),
                    created_at: key.created_at(),
                },
            )
        }
        Err(e) => error_response(&e),
    }
}

/// POST /admin/revoke
pub async fn handle_revoke(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    if let Err(rejection) = check_api_key(&state, &req) {
        return rejection_response(rejection, "/admin/revoke");
    }

    let result = async {
        let body: RevokeRequest = parse_json_body(req).await?;
        if body.subject.is_empty() {
            return Err(CustodyError::InvalidInput("subject is required".into()));
        }
        state
            .service
            .revoke(&body.jti, &body.subject, body.expires_at)
            .await?;
        Ok(body.jti)
    }
    .await;

    match result {
        Ok(jti) => {
            info!(jti = %jti, "Token revoked by operator");
            json_response(
                StatusCode::OK,
                &serde_json::json!({ "revoked": true, "jti": jti }),
            )
        }
        Err(e) => error_response(&e),
    }
}

/// Constant-time string comparison
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("admin-key-123456", "admin-key-123456"));
        assert!(!constant_time_compare("admin-key-123456", "admin-key-123457"));
        assert!(!constant_time_compare("short", "longer-value"));
    }
}
