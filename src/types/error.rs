//! Error types for the key access control list service
//!
//! One enum carries the whole taxonomy. Authorization failures collapse into a
//! uniform external response (see [`CustodyError::public_message`]) while the
//! precise variant stays available to the audit trail.

use hyper::StatusCode;

/// Main error type for custody operations
#[derive(Debug, thiserror::Error)]
pub enum CustodyError {
    /// No master key has been generated or loaded yet
    #[error("Master key not initialized")]
    NotInitialized,

    #[error("Unknown master key version: {0}")]
    UnknownKeyVersion(u32),

    /// Authentication tag did not verify. Tamper evidence, never retried.
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Bad token signature: {0}")]
    BadSignature(String),

    #[error("Token expired")]
    Expired,

    #[error("Token revoked: {0}")]
    Revoked(String),

    #[error("Resource and identity tokens name different subjects")]
    SubjectMismatch,

    #[error("Missing token: {0}")]
    MissingToken(&'static str),

    /// Identity directory has nothing to verify against
    #[error("Signing key unavailable: {0}")]
    KeyUnavailable(String),

    /// Stored key material exists but could not be opened
    #[error("Startup aborted: {0}")]
    StartupAborted(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CustodyError {
    /// Whether this error is a token/authorization failure that must not be
    /// distinguished to external callers.
    pub fn is_authorization_failure(&self) -> bool {
        matches!(
            self,
            Self::BadSignature(_)
                | Self::Expired
                | Self::Revoked(_)
                | Self::SubjectMismatch
                | Self::MissingToken(_)
        )
    }

    /// Errors that are logged at high severity and never retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::IntegrityViolation(_) | Self::StartupAborted(_))
    }

    /// Process exit code when this error stops startup: 2 for untrusted
    /// stored key material, 1 otherwise.
    pub fn startup_exit_code(&self) -> i32 {
        if self.is_fatal() {
            2
        } else {
            1
        }
    }

    /// Short machine-readable kind, used by the audit trail
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotInitialized => "not_initialized",
            Self::UnknownKeyVersion(_) => "unknown_key_version",
            Self::IntegrityViolation(_) => "integrity_violation",
            Self::MalformedEnvelope(_) => "malformed_envelope",
            Self::BadSignature(_) => "bad_signature",
            Self::Expired => "expired",
            Self::Revoked(_) => "revoked",
            Self::SubjectMismatch => "subject_mismatch",
            Self::MissingToken(_) => "missing_token",
            Self::KeyUnavailable(_) => "key_unavailable",
            Self::StartupAborted(_) => "startup_aborted",
            Self::InvalidInput(_) => "invalid_input",
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
            Self::BadRequest(_) => "bad_request",
            Self::Internal(_) => "internal",
        }
    }

    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadSignature(_)
            | Self::Expired
            | Self::Revoked(_)
            | Self::SubjectMismatch
            | Self::MissingToken(_) => StatusCode::FORBIDDEN,
            Self::KeyUnavailable(_) | Self::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
            Self::UnknownKeyVersion(_) => StatusCode::NOT_FOUND,
            Self::IntegrityViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::MalformedEnvelope(_) | Self::InvalidInput(_) | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::StartupAborted(_) | Self::Storage(_) | Self::Config(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to return to an external caller.
    ///
    /// Every authorization failure reads the same so the response cannot be
    /// used as an oracle for which check failed.
    pub fn public_message(&self) -> String {
        match self {
            e if e.is_authorization_failure() => "Access denied".to_string(),
            Self::KeyUnavailable(_) => "Authorization temporarily unavailable".to_string(),
            Self::StartupAborted(_) | Self::Storage(_) | Self::Config(_) | Self::Internal(_) => {
                "Internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for CustodyError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for CustodyError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for CustodyError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

/// Result type alias for custody operations
pub type Result<T> = std::result::Result<T, CustodyError>;
