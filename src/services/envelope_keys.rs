//! Envelope Key Service
//!
//! The public operation surface. Every wrap and unwrap runs behind the dual
//! authorization gate and leaves exactly one audit record, whatever the
//! outcome. Key material is only returned once its audit record is written.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use zeroize::Zeroizing;

use crate::auth::{AuthContext, DualAuthorizationGate, RevocationLedger, VerifiedToken};
use crate::custody::{MasterKey, MasterKeyManager, RotationReason, WrappedKeyEnvelope};
use crate::logging::{AuditLog, AuditOperation, AuditOutcome, AuditRecord};
use crate::types::{CustodyError, Result};

/// Wrap/unwrap behind the gate, plus session and key administration.
pub struct EnvelopeKeyService {
    keys: Arc<MasterKeyManager>,
    gate: DualAuthorizationGate,
    ledger: Arc<RevocationLedger>,
    audit: Arc<AuditLog>,
}

impl EnvelopeKeyService {
    pub fn new(
        keys: Arc<MasterKeyManager>,
        gate: DualAuthorizationGate,
        ledger: Arc<RevocationLedger>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            keys,
            gate,
            ledger,
            audit,
        }
    }

    pub fn key_manager(&self) -> &Arc<MasterKeyManager> {
        &self.keys
    }

    pub fn gate(&self) -> &DualAuthorizationGate {
        &self.gate
    }

    pub fn ledger(&self) -> &Arc<RevocationLedger> {
        &self.ledger
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    // =========================================================================
    // Gate
    // =========================================================================

    /// Run the gate for `operation`. Denials are audited with their precise
    /// reason before the error is returned.
    pub async fn authorize(
        &self,
        operation: AuditOperation,
        resource_token: Option<&str>,
        identity_token: Option<&str>,
        resource: Option<&str>,
    ) -> Result<AuthContext> {
        match self.gate.authorize(resource_token, identity_token).await {
            Ok(ctx) => Ok(ctx),
            Err(denial) => {
                let record = AuditRecord::failed(operation, &denial.error).with_resource(resource);
                // Denied either way; the write failure is already counted and logged.
                let _ = self.audit.record(record).await;
                Err(denial.into())
            }
        }
    }

    // =========================================================================
    // Key Operations
    // =========================================================================

    /// Wrap a data-encryption key under `version`, or the current key.
    pub async fn wrap_key(
        &self,
        ctx: &AuthContext,
        plaintext: &[u8],
        version: Option<u32>,
        resource: Option<&str>,
    ) -> Result<WrappedKeyEnvelope> {
        let result = self.keys.wrap(version, plaintext);

        let record = match &result {
            Ok(envelope) => AuditRecord::new(AuditOperation::Wrap, AuditOutcome::Success)
                .with_key_version(envelope.key_version),
            Err(e) => {
                let record = AuditRecord::failed(AuditOperation::Wrap, e);
                match version {
                    Some(v) => record.with_key_version(v),
                    None => record,
                }
            }
        };
        self.audit
            .record(record.with_subject(ctx.subject()).with_resource(resource))
            .await
            .map_err(audit_unavailable)?;

        result
    }

    /// Unwrap an envelope. A tag failure is audited as an integrity violation,
    /// never as an ordinary failure.
    pub async fn unwrap_key(
        &self,
        ctx: &AuthContext,
        envelope: &WrappedKeyEnvelope,
        resource: Option<&str>,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let result = self.keys.unwrap(envelope);

        let record = match &result {
            Ok(_) => AuditRecord::new(AuditOperation::Unwrap, AuditOutcome::Success),
            Err(e) => AuditRecord::failed(AuditOperation::Unwrap, e),
        };
        self.audit
            .record(
                record
                    .with_key_version(envelope.key_version)
                    .with_subject(ctx.subject())
                    .with_resource(resource),
            )
            .await
            .map_err(audit_unavailable)?;

        result
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Rotate the master key now.
    pub async fn rotate(&self, reason: RotationReason) -> Result<Arc<MasterKey>> {
        let keys = Arc::clone(&self.keys);
        let result = tokio::task::spawn_blocking(move || keys.rotate(reason))
            .await
            .map_err(|e| CustodyError::Internal(format!("rotation task failed: {e}")))?;

        let record = match &result {
            Ok(key) => AuditRecord::new(AuditOperation::Rotate, AuditOutcome::Success)
                .with_key_version(key.version())
                .with_reason(reason.to_string()),
            Err(e) => AuditRecord::failed(AuditOperation::Rotate, e),
        };
        // The new key is already live; a lost record does not undo it.
        let _ = self.audit.record(record).await;

        result
    }

    /// Revoke the presented token itself. Accepts either a resource or an
    /// identity token; the token must still verify.
    pub async fn logout(&self, token: Option<&str>) -> Result<()> {
        let result = self.revoke_presented(token).await;

        let record = match &result {
            Ok(verified) => AuditRecord::new(AuditOperation::Logout, AuditOutcome::Success)
                .with_subject(verified.subject.clone()),
            Err(e) => AuditRecord::failed(AuditOperation::Logout, e),
        };
        let _ = self.audit.record(record).await;

        result.map(|_| ())
    }

    /// Forced revocation of a token id.
    pub async fn revoke(&self, jti: &str, subject: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let result = self.ledger.revoke(jti, subject, expires_at);

        let record = match &result {
            Ok(()) => AuditRecord::new(AuditOperation::Revoke, AuditOutcome::Success),
            Err(e) => AuditRecord::failed(AuditOperation::Revoke, e),
        };
        let _ = self.audit.record(record.with_subject(subject)).await;

        result
    }

    async fn revoke_presented(&self, token: Option<&str>) -> Result<VerifiedToken> {
        let token = token.ok_or(CustodyError::MissingToken("logout"))?;

        let verified = match self.gate.resource_verifier().verify(token).await {
            Err(CustodyError::BadSignature(_)) => {
                self.gate.identity_verifier().verify(token).await
            }
            other => other,
        }?;

        self.ledger
            .revoke(&verified.jti, &verified.subject, verified.expires_at)?;
        info!(sub = %verified.subject, jti = %verified.jti, "Session logged out");
        Ok(verified)
    }
}

fn audit_unavailable(e: std::io::Error) -> CustodyError {
    CustodyError::Storage(format!("audit write failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::directory::{DirectoryConfig, IdentityKeyDirectory, StaticSigningKeySource};
    use crate::auth::jwt::{TokenIssuer, TokenVerifier, DEFAULT_LEEWAY_SECS};
    use crate::custody::{KdfParams, KeyMaterialStore, RotationPolicy};
    use crate::logging::{AuditSink, MemoryAuditSink};
    use async_trait::async_trait;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        issuer: TokenIssuer,
        service: EnvelopeKeyService,
        sink: MemoryAuditSink,
    }

    /// Sink whose every write fails, as on a full disk
    struct FullDiskSink;

    #[async_trait]
    impl AuditSink for FullDiskSink {
        async fn write(&self, _record: &AuditRecord) -> std::io::Result<()> {
            Err(std::io::Error::other("disk full"))
        }

        async fn flush(&self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn fixture() -> Fixture {
        let sink = MemoryAuditSink::new();
        fixture_with_sink(sink.clone(), Arc::new(sink))
    }

    fn fixture_with_sink(sink: MemoryAuditSink, audit_sink: Arc<dyn AuditSink>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = KeyMaterialStore::open(dir.path(), "storage-secret")
            .unwrap()
            .with_kdf_params(KdfParams {
                memory_kib: 1024,
                iterations: 1,
                parallelism: 1,
            });
        let keys = Arc::new(MasterKeyManager::new(store, RotationPolicy::default()));
        keys.initialize().unwrap();

        let issuer = TokenIssuer::generate(3600).unwrap();
        let directory = IdentityKeyDirectory::new(
            "test",
            StaticSigningKeySource::new(issuer.public_key().clone()),
            DirectoryConfig::default(),
        );
        let ledger = Arc::new(RevocationLedger::in_memory());
        let gate = DualAuthorizationGate::new(TokenVerifier::new(
            directory,
            Arc::clone(&ledger),
            DEFAULT_LEEWAY_SECS,
        ));

        let audit = Arc::new(AuditLog::new(audit_sink));
        let service = EnvelopeKeyService::new(keys, gate, ledger, audit);

        Fixture {
            _dir: dir,
            issuer,
            service,
            sink,
        }
    }

    async fn authorized(f: &Fixture, op: AuditOperation) -> AuthContext {
        let resource = f.issuer.issue("user-1", "alice").unwrap();
        let identity = f.issuer.issue("user-1", "alice").unwrap();
        f.service
            .authorize(op, Some(&resource.token), Some(&identity.token), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_wrap_and_unwrap_are_audited() {
        let f = fixture();
        let ctx = authorized(&f, AuditOperation::Wrap).await;

        let envelope = f
            .service
            .wrap_key(&ctx, &[4u8; 32], None, Some("room-1"))
            .await
            .unwrap();
        let dek = f.service.unwrap_key(&ctx, &envelope, Some("room-1")).await.unwrap();
        assert_eq!(dek.as_slice(), &[4u8; 32]);

        let records = f.sink.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].operation, AuditOperation::Wrap);
        assert_eq!(records[0].outcome, AuditOutcome::Success);
        assert_eq!(records[0].subject.as_deref(), Some("user-1"));
        assert_eq!(records[0].resource.as_deref(), Some("room-1"));
        assert_eq!(records[1].operation, AuditOperation::Unwrap);
        assert_eq!(records[1].key_version, Some(1));
    }

    #[tokio::test]
    async fn test_failed_wrap_is_audited() {
        let f = fixture();
        let ctx = authorized(&f, AuditOperation::Wrap).await;

        let result = f.service.wrap_key(&ctx, &[1u8; 32], Some(99), None).await;
        assert!(matches!(result, Err(CustodyError::UnknownKeyVersion(99))));

        let records = f.sink.records().await;
        assert_eq!(records[0].outcome, AuditOutcome::Failure);
        assert_eq!(records[0].reason.as_deref(), Some("unknown_key_version"));
    }

    #[tokio::test]
    async fn test_tampered_unwrap_audited_as_integrity_violation() {
        let f = fixture();
        let ctx = authorized(&f, AuditOperation::Unwrap).await;
        let mut envelope = f.service.wrap_key(&ctx, &[4u8; 32], None, None).await.unwrap();

        let mut ciphertext = BASE64.decode(&envelope.ciphertext).unwrap();
        ciphertext[3] ^= 0xff;
        envelope.ciphertext = BASE64.encode(ciphertext);

        let result = f.service.unwrap_key(&ctx, &envelope, None).await;
        assert!(matches!(result, Err(CustodyError::IntegrityViolation(_))));

        let records = f.sink.records().await;
        assert_eq!(records[1].outcome, AuditOutcome::IntegrityViolation);
        assert_eq!(f.service.audit().stats().integrity_violations, 1);
        assert_eq!(f.service.audit().stats().denied, 0);
    }

    #[tokio::test]
    async fn test_denial_is_audited_with_reason() {
        let f = fixture();
        let resource = f.issuer.issue("user-1", "alice").unwrap();
        let identity = f.issuer.issue("user-2", "bob").unwrap();

        let result = f
            .service
            .authorize(
                AuditOperation::Unwrap,
                Some(&resource.token),
                Some(&identity.token),
                Some("room-1"),
            )
            .await;
        assert!(matches!(result, Err(CustodyError::SubjectMismatch)));

        let records = f.sink.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AuditOutcome::Denied);
        assert_eq!(records[0].reason.as_deref(), Some("subject_mismatch"));
    }

    #[tokio::test]
    async fn test_logout_revokes_presented_token() {
        let f = fixture();
        let resource = f.issuer.issue("user-1", "alice").unwrap();
        let identity = f.issuer.issue("user-1", "alice").unwrap();

        f.service.logout(Some(&resource.token)).await.unwrap();
        assert!(f.service.ledger().is_revoked(&resource.claims.jti).unwrap());

        let result = f
            .service
            .authorize(
                AuditOperation::Wrap,
                Some(&resource.token),
                Some(&identity.token),
                None,
            )
            .await;
        assert!(matches!(result, Err(CustodyError::Revoked(_))));
    }

    #[tokio::test]
    async fn test_rotate_is_audited() {
        let f = fixture();
        let key = f.service.rotate(RotationReason::Manual).await.unwrap();
        assert_eq!(key.version(), 2);

        let records = f.sink.records().await;
        assert_eq!(records[0].operation, AuditOperation::Rotate);
        assert_eq!(records[0].key_version, Some(2));
        assert_eq!(records[0].reason.as_deref(), Some("manual"));
    }

    #[tokio::test]
    async fn test_key_withheld_when_audit_write_fails() {
        let f = fixture_with_sink(MemoryAuditSink::new(), Arc::new(FullDiskSink));
        let ctx = authorized(&f, AuditOperation::Wrap).await;

        let wrapped = f.service.wrap_key(&ctx, &[7u8; 32], None, None).await;
        assert!(matches!(wrapped, Err(CustodyError::Storage(_))));

        let envelope = f.service.key_manager().wrap(None, &[9u8; 32]).unwrap();
        let unwrapped = f.service.unwrap_key(&ctx, &envelope, None).await;
        assert!(matches!(unwrapped, Err(CustodyError::Storage(_))));

        let stats = f.service.audit().stats();
        assert_eq!(stats.write_failures, 2);
        assert_eq!(stats.success, 2);
    }
}
