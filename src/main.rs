//! kacls - key access control list service

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use kacls::{config::Args, logging, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    logging::init_tracing(&args.log_level, args.log_format);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  kacls - key access control list service");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Data dir: {}", args.data_dir.display());
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    match &args.issuer.identity_issuer_url {
        Some(url) => info!("Identity issuer: {}", url),
        None => info!("Identity issuer: in-process (dev)"),
    }
    if let Some(url) = &args.issuer.identity_token_issuer_url {
        info!("Identity token issuer: {}", url);
    }
    info!(
        "Rotation threshold: {} days",
        args.policy.rotation_threshold_days
    );
    info!("Audit log: {}", args.audit_log_path().display());
    info!("======================================");

    let state = match server::AppState::initialize(args).await {
        Ok(state) => Arc::new(state),
        Err(e) if e.is_fatal() => {
            error!("Refusing to start, stored key material untrusted: {}", e);
            std::process::exit(e.startup_exit_code());
        }
        Err(e) => {
            error!("Initialization failed: {}", e);
            std::process::exit(e.startup_exit_code());
        }
    };

    server::run(state).await?;
    Ok(())
}
