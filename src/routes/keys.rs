//! Key operation endpoints
//!
//! - POST /wrap - wrap a data-encryption key under the current or a named version
//! - POST /unwrap - unwrap an envelope produced by /wrap
//! - POST /logout - revoke the presented token
//! - POST /dev/token - mint a token (dev mode only)
//!
//! Wrap and unwrap need both tokens: the resource token in `Authorization`
//! and the identity token in `X-Identity-Authorization`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use zeroize::Zeroizing;

use super::{error_response, header_value, json_response, parse_json_body, IDENTITY_TOKEN_HEADER};
use crate::auth::extract_token_from_header;
use crate::custody::{WrappedKeyEnvelope, MAX_WRAP_INPUT};
use crate::logging::AuditOperation;
use crate::server::AppState;
use crate::types::{CustodyError, Result};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrapRequest {
    /// Data-encryption key, base64
    pub key: String,
    /// Wrap under this version instead of the current one
    #[serde(default)]
    pub key_version: Option<u32>,
    /// Caller reference recorded in the audit trail
    #[serde(default)]
    pub resource: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnwrapRequest {
    pub envelope: WrappedKeyEnvelope,
    #[serde(default)]
    pub resource: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnwrapResponse {
    /// Data-encryption key, base64
    pub key: String,
    pub key_version: u32,
}

#[derive(Debug, Deserialize)]
pub struct DevTokenRequest {
    pub sub: String,
    pub username: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DevTokenResponse {
    pub token: String,
    pub jti: String,
    pub expires_at: i64,
}

/// Both presented tokens, owned so the request body can be consumed.
struct PresentedTokens {
    resource: Option<String>,
    identity: Option<String>,
}

impl PresentedTokens {
    fn from_request(req: &Request<Incoming>) -> Self {
        let token = |name: &str| {
            extract_token_from_header(header_value(req, name)).map(str::to_string)
        };
        Self {
            resource: token("authorization"),
            identity: token(IDENTITY_TOKEN_HEADER),
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /wrap
pub async fn handle_wrap(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    match wrap(state, req).await {
        Ok(response) => response,
        Err(e) => error_response(&e),
    }
}

async fn wrap(state: Arc<AppState>, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
    let tokens = PresentedTokens::from_request(&req);
    let body: WrapRequest = parse_json_body(req).await?;

    let plaintext = Zeroizing::new(
        BASE64
            .decode(body.key.as_bytes())
            .map_err(|e| CustodyError::InvalidInput(format!("key is not valid base64: {e}")))?,
    );
    if plaintext.is_empty() || plaintext.len() > MAX_WRAP_INPUT {
        return Err(CustodyError::InvalidInput(format!(
            "key must be 1..={MAX_WRAP_INPUT} bytes"
        )));
    }

    let resource = body.resource.as_deref();
    let ctx = state
        .service
        .authorize(
            AuditOperation::Wrap,
            tokens.resource.as_deref(),
            tokens.identity.as_deref(),
            resource,
        )
        .await?;

    let envelope = state
        .service
        .wrap_key(&ctx, &plaintext, body.key_version, resource)
        .await?;

    Ok(json_response(StatusCode::OK, &envelope))
}

/// POST /unwrap
pub async fn handle_unwrap(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    match unwrap(state, req).await {
        Ok(response) => response,
        Err(e) => error_response(&e),
    }
}

async fn unwrap(state: Arc<AppState>, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
    let tokens = PresentedTokens::from_request(&req);
    let body: UnwrapRequest = parse_json_body(req).await?;

    let resource = body.resource.as_deref();
    let ctx = state
        .service
        .authorize(
            AuditOperation::Unwrap,
            tokens.resource.as_deref(),
            tokens.identity.as_deref(),
            resource,
        )
        .await?;

    let plaintext = state
        .service
        .unwrap_key(&ctx, &body.envelope, resource)
        .await?;

    Ok(json_response(
        StatusCode::OK,
        &UnwrapResponse {
            key: BASE64.encode(plaintext.as_slice()),
            key_version: body.envelope.key_version,
        },
    ))
}

/// POST /logout
///
/// Revokes the token in `Authorization`, or in `X-Identity-Authorization`
/// when that is the only one sent.
pub async fn handle_logout(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let tokens = PresentedTokens::from_request(&req);
    let token = tokens.resource.or(tokens.identity);

    match state.service.logout(token.as_deref()).await {
        Ok(()) => json_response(StatusCode::OK, &serde_json::json!({ "loggedOut": true })),
        Err(e) => error_response(&e),
    }
}

/// POST /dev/token
pub async fn handle_dev_token(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let Some(issuer) = state.dev_issuer.as_ref() else {
        return super::not_found_response("/dev/token");
    };

    let result = async {
        let body: DevTokenRequest = parse_json_body(req).await?;
        if body.sub.is_empty() || body.username.is_empty() {
            return Err(CustodyError::InvalidInput(
                "sub and username are required".into(),
            ));
        }
        issuer.issue(&body.sub, &body.username)
    }
    .await;

    match result {
        Ok(issued) => json_response(
            StatusCode::OK,
            &DevTokenResponse {
                token: issued.token,
                jti: issued.claims.jti,
                expires_at: issued.claims.exp,
            },
        ),
        Err(e) => error_response(&e),
    }
}
