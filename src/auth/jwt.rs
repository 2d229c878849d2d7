//! Token issuing and verification
//!
//! Tokens are EdDSA (Ed25519) signed JWTs carrying `{jti, sub, username, iat,
//! exp}` with the signing key id in the `kid` header.
//!
//! Verification order is fixed: signature, then expiry (with clock-skew
//! leeway), then revocation. Each failure has its own error kind.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ed25519_dalek::pkcs8::EncodePrivateKey;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, encode, Algorithm, EncodingKey, Header, Validation};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::directory::{IdentityKeyDirectory, PublicSigningKey};
use super::revocation::RevocationLedger;
use crate::types::{CustodyError, Result};

/// Default token lifetime in seconds (1 hour)
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

/// Default clock-skew tolerance in seconds
pub const DEFAULT_LEEWAY_SECS: u64 = 30;

/// Payload stored in a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Token id, the revocation handle
    pub jti: String,
    /// Subject id
    pub sub: String,
    pub username: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

/// A token that passed signature, expiry and revocation checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedToken {
    pub subject: String,
    pub username: String,
    pub jti: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TryFrom<Claims> for VerifiedToken {
    type Error = CustodyError;

    fn try_from(claims: Claims) -> Result<Self> {
        let timestamp = |secs: i64, name: &str| {
            DateTime::from_timestamp(secs, 0)
                .ok_or_else(|| CustodyError::BadSignature(format!("{name} out of range")))
        };

        Ok(Self {
            issued_at: timestamp(claims.iat, "iat")?,
            expires_at: timestamp(claims.exp, "exp")?,
            subject: claims.sub,
            username: claims.username,
            jti: claims.jti,
        })
    }
}

// =============================================================================
// Issuer
// =============================================================================

/// A freshly minted token and its claims
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: Claims,
}

/// Mints signed tokens. Runs in-process in dev mode; production tokens come
/// from the external identity issuer.
pub struct TokenIssuer {
    encoding: EncodingKey,
    public_key: PublicSigningKey,
    ttl_secs: i64,
}

impl TokenIssuer {
    /// Issuer with a freshly generated Ed25519 key.
    pub fn generate(ttl_secs: i64) -> Result<Self> {
        Self::from_signing_key(&ed25519_dalek::SigningKey::generate(&mut OsRng), ttl_secs)
    }

    pub fn from_signing_key(
        signing_key: &ed25519_dalek::SigningKey,
        ttl_secs: i64,
    ) -> Result<Self> {
        let der = signing_key
            .to_pkcs8_der()
            .map_err(|e| CustodyError::Internal(format!("Failed to encode signing key: {e}")))?;
        let encoding = EncodingKey::from_ed_der(der.as_bytes());
        let public_key =
            PublicSigningKey::from_ed25519(signing_key.verifying_key().as_bytes(), None)?;

        Ok(Self {
            encoding,
            public_key,
            ttl_secs,
        })
    }

    /// Verification key matching this issuer
    pub fn public_key(&self) -> &PublicSigningKey {
        &self.public_key
    }

    /// Issue a token for a subject with the default lifetime.
    pub fn issue(&self, subject: &str, username: &str) -> Result<IssuedToken> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            jti: Uuid::new_v4().to_string(),
            sub: subject.to_string(),
            username: username.to_string(),
            iat: now,
            exp: now + self.ttl_secs,
        };
        let token = self.sign(&claims)?;
        Ok(IssuedToken { token, claims })
    }

    /// Sign arbitrary claims.
    pub fn sign(&self, claims: &Claims) -> Result<String> {
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(self.public_key.key_id().to_string());

        encode(&header, claims, &self.encoding)
            .map_err(|e| CustodyError::Internal(format!("Failed to sign token: {e}")))
    }
}

// =============================================================================
// Verifier
// =============================================================================

/// Verifies tokens against one issuer directory and the revocation ledger.
#[derive(Clone)]
pub struct TokenVerifier {
    directory: IdentityKeyDirectory,
    ledger: Arc<RevocationLedger>,
    leeway_secs: u64,
}

impl TokenVerifier {
    pub fn new(
        directory: IdentityKeyDirectory,
        ledger: Arc<RevocationLedger>,
        leeway_secs: u64,
    ) -> Self {
        Self {
            directory,
            ledger,
            leeway_secs,
        }
    }

    pub fn directory(&self) -> &IdentityKeyDirectory {
        &self.directory
    }

    /// Verify signature, expiry and revocation status.
    ///
    /// Always checked against the cached key. A signature failure under an
    /// unknown `kid` schedules a background refresh and still fails.
    /// A directory with no key fails with `KeyUnavailable`: nothing can be
    /// verified so nothing is trusted.
    pub async fn verify(&self, token: &str) -> Result<VerifiedToken> {
        let header = decode_header(token)
            .map_err(|e| CustodyError::BadSignature(format!("malformed token: {e}")))?;
        if header.alg != Algorithm::EdDSA {
            return Err(CustodyError::BadSignature(format!(
                "unexpected algorithm {:?}",
                header.alg
            )));
        }

        let key = self.directory.current_signing_key().await?;
        let claims = match self.decode_claims(token, &key) {
            Ok(claims) => claims,
            Err(e @ CustodyError::BadSignature(_)) => {
                if let Some(kid) = header.kid.as_deref().filter(|kid| *kid != key.key_id()) {
                    self.directory.note_unknown_kid(kid);
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if self.ledger.is_revoked(&claims.jti)? {
            return Err(CustodyError::Revoked(claims.jti));
        }

        debug!(jti = %claims.jti, sub = %claims.sub, "Token verified");
        VerifiedToken::try_from(claims)
    }

    fn decode_claims(&self, token: &str, key: &PublicSigningKey) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.leeway = self.leeway_secs;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let claims = decode::<Claims>(token, key.decoding_key(), &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => CustodyError::Expired,
                kind => CustodyError::BadSignature(format!("{kind:?}")),
            })?;

        if claims.jti.is_empty() || claims.sub.is_empty() {
            return Err(CustodyError::BadSignature("missing jti or sub".into()));
        }
        let leeway = i64::try_from(self.leeway_secs).unwrap_or(i64::MAX);
        if claims.iat > Utc::now().timestamp().saturating_add(leeway) {
            return Err(CustodyError::BadSignature("issued in the future".into()));
        }

        Ok(claims)
    }
}

/// Extract token from an Authorization-style header.
/// Supports "Bearer <token>" format and raw tokens.
pub fn extract_token_from_header(auth_header: Option<&str>) -> Option<&str> {
    let header = auth_header?;

    if let Some(token) = header.strip_prefix("Bearer ") {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    if !header.contains(' ') {
        let token = header.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    None
}
