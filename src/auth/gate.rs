//! Dual Authorization Gate
//!
//! Two independently issued tokens, both valid and naming the same subject,
//! before any key operation proceeds:
//!
//! ```text
//! Start -> ResourceTokenChecked -> IdentityTokenChecked -> SubjectsMatched -> Authorized
//!   \______________________________________________________________________/
//!                              any failure -> Denied(reason)
//! ```
//!
//! The gate never touches key material. It hands an [`AuthContext`] to the
//! envelope key service, and only the gate can construct one.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::jwt::{TokenVerifier, VerifiedToken};
use crate::types::CustodyError;

/// Where a request is in the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStage {
    Start,
    ResourceTokenChecked,
    IdentityTokenChecked,
    SubjectsMatched,
    Authorized,
    /// Denied, with the error kind
    Denied(&'static str),
}

/// Proof that both tokens verified and agree on the subject.
#[derive(Debug, Clone)]
pub struct AuthContext {
    resource: VerifiedToken,
    identity: VerifiedToken,
    authorized_at: DateTime<Utc>,
}

impl AuthContext {
    pub fn subject(&self) -> &str {
        &self.resource.subject
    }

    pub fn username(&self) -> &str {
        &self.resource.username
    }

    pub fn resource_token(&self) -> &VerifiedToken {
        &self.resource
    }

    pub fn identity_token(&self) -> &VerifiedToken {
        &self.identity
    }

    pub fn authorized_at(&self) -> DateTime<Utc> {
        self.authorized_at
    }
}

/// A denied request: the last stage passed and the precise reason.
#[derive(Debug)]
pub struct GateDenial {
    pub reached: GateStage,
    pub error: CustodyError,
}

impl GateDenial {
    pub fn stage(&self) -> GateStage {
        GateStage::Denied(self.error.kind())
    }
}

impl From<GateDenial> for CustodyError {
    fn from(denial: GateDenial) -> Self {
        denial.error
    }
}

/// Verifies the resource token and the identity token independently.
#[derive(Clone)]
pub struct DualAuthorizationGate {
    resource_verifier: TokenVerifier,
    identity_verifier: TokenVerifier,
}

impl DualAuthorizationGate {
    /// Both token kinds verified against the same issuer.
    pub fn new(verifier: TokenVerifier) -> Self {
        Self {
            resource_verifier: verifier.clone(),
            identity_verifier: verifier,
        }
    }

    /// Each token kind verified against its own issuer.
    pub fn with_verifiers(
        resource_verifier: TokenVerifier,
        identity_verifier: TokenVerifier,
    ) -> Self {
        Self {
            resource_verifier,
            identity_verifier,
        }
    }

    pub fn resource_verifier(&self) -> &TokenVerifier {
        &self.resource_verifier
    }

    pub fn identity_verifier(&self) -> &TokenVerifier {
        &self.identity_verifier
    }

    /// Run both tokens through the gate.
    pub async fn authorize(
        &self,
        resource_token: Option<&str>,
        identity_token: Option<&str>,
    ) -> Result<AuthContext, GateDenial> {
        let mut stage = GateStage::Start;

        let outcome = self.run(resource_token, identity_token, &mut stage).await;
        let result = outcome.map_err(|error| GateDenial {
            reached: stage,
            error,
        });

        match &result {
            Ok(ctx) => debug!(sub = %ctx.subject(), "Dual authorization granted"),
            Err(denial) if denial.error.is_authorization_failure() => warn!(
                reached = ?denial.reached,
                reason = denial.error.kind(),
                "Dual authorization denied: {}",
                denial.error
            ),
            Err(denial) => warn!(
                reached = ?denial.reached,
                reason = denial.error.kind(),
                "Dual authorization unresolvable: {}",
                denial.error
            ),
        }
        result
    }

    async fn run(
        &self,
        resource_token: Option<&str>,
        identity_token: Option<&str>,
        stage: &mut GateStage,
    ) -> Result<AuthContext, CustodyError> {
        let resource_token = resource_token.ok_or(CustodyError::MissingToken("resource"))?;
        let identity_token = identity_token.ok_or(CustodyError::MissingToken("identity"))?;

        let resource = self.resource_verifier.verify(resource_token).await?;
        *stage = GateStage::ResourceTokenChecked;

        let identity = self.identity_verifier.verify(identity_token).await?;
        *stage = GateStage::IdentityTokenChecked;

        if resource.subject != identity.subject || resource.username != identity.username {
            return Err(CustodyError::SubjectMismatch);
        }
        *stage = GateStage::SubjectsMatched;

        if resource.jti == identity.jti {
            // One token presented twice is one factor, not two
            return Err(CustodyError::BadSignature(
                "resource and identity token are the same token".into(),
            ));
        }

        *stage = GateStage::Authorized;
        Ok(AuthContext {
            resource,
            identity,
            authorized_at: Utc::now(),
        })
    }
}
