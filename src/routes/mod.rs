//! HTTP route handlers
//!
//! ## Endpoints
//!
//! - `GET /health`, `GET /ready` - liveness and readiness probes
//! - `GET /info` - non-secret capability metadata
//! - `GET /metrics` - audit, revocation and directory counters
//! - `POST /wrap`, `POST /unwrap` - key operations behind the dual gate
//! - `POST /logout` - revoke the presented token
//! - `POST /admin/rotate`, `POST /admin/revoke` - operator actions
//! - `POST /dev/token` - dev mode only, mint a token

pub mod admin;
pub mod health;
pub mod keys;

pub use admin::{handle_revoke, handle_rotate};
pub use health::{health_check, info, metrics, readiness_check};
pub use keys::{handle_dev_token, handle_logout, handle_unwrap, handle_wrap};

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::types::CustodyError;

/// Header carrying the identity token. The resource token uses `Authorization`.
pub const IDENTITY_TOKEN_HEADER: &str = "x-identity-authorization";

/// Header carrying the admin API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Largest request body accepted
const MAX_BODY_BYTES: usize = 16 * 1024;

/// Build a JSON response
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());

    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        hyper::header::CACHE_CONTROL,
        hyper::header::HeaderValue::from_static("no-store"),
    );
    response
}

/// Error body. Authorization failures all read the same.
pub fn error_response(err: &CustodyError) -> Response<Full<Bytes>> {
    json_response(
        err.status_code(),
        &serde_json::json!({ "error": err.public_message() }),
    )
}

pub fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::NOT_FOUND,
        &serde_json::json!({ "error": "Not Found", "path": path }),
    )
}

/// Read and parse a JSON body, bounded in size.
pub async fn parse_json_body<T: for<'de> Deserialize<'de>>(
    req: Request<Incoming>,
) -> Result<T, CustodyError> {
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| CustodyError::BadRequest(format!("Failed to read body: {}", e)))?;

    serde_json::from_slice(&body.to_bytes())
        .map_err(|e| CustodyError::BadRequest(format!("Invalid JSON: {}", e)))
}

/// Value of a header, if present and valid UTF-8
pub fn header_value<'a, B>(req: &'a Request<B>, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}
