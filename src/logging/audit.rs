//! Audit trail for key operations
//!
//! One append-only JSONL record per attempted operation, successful or not.
//! The record keeps the precise failure reason even when the external
//! response does not.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::types::CustodyError;

/// Audited operation kinds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Wrap,
    Unwrap,
    Rotate,
    Revoke,
    Logout,
}

/// Result of an attempted operation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    /// Authorized, but the operation itself failed
    Failure,
    /// Refused at the authorization gate
    Denied,
    /// Authentication tag did not verify; possible tampering
    IntegrityViolation,
}

impl AuditOutcome {
    /// Classify an error into an outcome.
    pub fn from_error(err: &CustodyError) -> Self {
        match err {
            CustodyError::IntegrityViolation(_) => Self::IntegrityViolation,
            e if e.is_authorization_failure() => Self::Denied,
            _ => Self::Failure,
        }
    }
}

/// One audit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub operation: AuditOperation,
    pub outcome: AuditOutcome,
    /// Subject id, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Caller-supplied resource reference (e.g. room or message id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Error kind for non-success outcomes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_version: Option<u32>,
}

impl AuditRecord {
    pub fn new(operation: AuditOperation, outcome: AuditOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            operation,
            outcome,
            subject: None,
            resource: None,
            reason: None,
            key_version: None,
        }
    }

    /// Record for a failed attempt, outcome and reason taken from the error.
    pub fn failed(operation: AuditOperation, err: &CustodyError) -> Self {
        Self::new(operation, AuditOutcome::from_error(err)).with_reason(err.kind())
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_resource(mut self, resource: Option<&str>) -> Self {
        self.resource = resource.map(str::to_string);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_key_version(mut self, version: u32) -> Self {
        self.key_version = Some(version);
        self
    }

    /// Convert to JSONL line
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Destination for audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, record: &AuditRecord) -> std::io::Result<()>;

    async fn flush(&self) -> std::io::Result<()>;
}

/// Appends records to a JSONL file
#[derive(Clone)]
pub struct JsonlAuditSink {
    inner: Arc<Mutex<BufWriter<File>>>,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(&path)?;

        info!("Audit logging initialized to {}", path.display());
        Ok(Self {
            inner: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn write(&self, record: &AuditRecord) -> std::io::Result<()> {
        let line = record.to_jsonl()?;
        let mut writer = self.inner.lock().await;
        writeln!(writer, "{}", line)?;
        writer.flush()
    }

    async fn flush(&self) -> std::io::Result<()> {
        let mut writer = self.inner.lock().await;
        writer.flush()?;
        writer.get_ref().sync_data()
    }
}

/// Keeps records in memory. Used by tests.
#[derive(Clone, Default)]
pub struct MemoryAuditSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn write(&self, record: &AuditRecord) -> std::io::Result<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn flush(&self) -> std::io::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Audit Log
// =============================================================================

/// Counts outcomes, mirrors records into tracing, and writes them to a sink.
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    success: AtomicU64,
    failure: AtomicU64,
    denied: AtomicU64,
    integrity_violations: AtomicU64,
    write_failures: AtomicU64,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            integrity_violations: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    /// Count, log and persist one record. A failed sink write is counted and
    /// returned.
    pub async fn record(&self, record: AuditRecord) -> std::io::Result<()> {
        let counter = match record.outcome {
            AuditOutcome::Success => &self.success,
            AuditOutcome::Failure => &self.failure,
            AuditOutcome::Denied => &self.denied,
            AuditOutcome::IntegrityViolation => &self.integrity_violations,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let subject = record.subject.as_deref().unwrap_or("-");
        let reason = record.reason.as_deref().unwrap_or("-");
        match record.outcome {
            AuditOutcome::IntegrityViolation => error!(
                audit_id = %record.id,
                operation = ?record.operation,
                subject,
                key_version = ?record.key_version,
                "AUDIT integrity violation - possible tampering"
            ),
            AuditOutcome::Denied => warn!(
                audit_id = %record.id,
                operation = ?record.operation,
                subject,
                reason,
                "AUDIT denied"
            ),
            AuditOutcome::Failure => warn!(
                audit_id = %record.id,
                operation = ?record.operation,
                subject,
                reason,
                "AUDIT failure"
            ),
            AuditOutcome::Success => debug!(
                audit_id = %record.id,
                operation = ?record.operation,
                subject,
                key_version = ?record.key_version,
                "AUDIT success"
            ),
        }

        self.sink.write(&record).await.map_err(|e| {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            error!(audit_id = %record.id, "Failed to write audit record: {}", e);
            e
        })
    }

    pub async fn flush(&self) {
        if let Err(e) = self.sink.flush().await {
            error!("Failed to flush audit log: {}", e);
        }
    }

    pub fn stats(&self) -> AuditStats {
        AuditStats {
            success: self.success.load(Ordering::Relaxed),
            failure: self.failure.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            integrity_violations: self.integrity_violations.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

/// Outcome counters, exposed on `/metrics`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStats {
    pub success: u64,
    pub failure: u64,
    pub denied: u64,
    pub integrity_violations: u64,
    pub write_failures: u64,
}
