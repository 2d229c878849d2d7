//! Logging infrastructure
//!
//! Tracing subscriber setup and the audit trail for key operations.

pub mod audit;

pub use audit::{
    AuditLog, AuditOperation, AuditOutcome, AuditRecord, AuditSink, AuditStats, JsonlAuditSink,
    MemoryAuditSink,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Output format for the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Install the global tracing subscriber.
pub fn init_tracing(log_level: &str, format: LogFormat) {
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| format!("kacls={},info", log_level).into()),
    );

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
