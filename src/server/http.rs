//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::{
    spawn_prune_task, DualAuthorizationGate, HttpSigningKeySource, IdentityKeyDirectory,
    RedbRevocationStore, RevocationLedger, StaticSigningKeySource, TokenIssuer, TokenVerifier,
};
use crate::config::Args;
use crate::custody::{spawn_rotation_task, KdfParams, KeyMaterialStore, MasterKeyManager};
use crate::logging::{AuditLog, JsonlAuditSink};
use crate::routes;
use crate::services::EnvelopeKeyService;
use crate::types::{CustodyError, Result};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Shared application state
pub struct AppState {
    pub args: Args,
    /// Gate, key manager, ledger and audit log behind one surface
    pub service: Arc<EnvelopeKeyService>,
    /// Issuer directories: one, or resource then identity when separate
    pub directories: Vec<IdentityKeyDirectory>,
    /// In-process issuer, dev mode only
    pub dev_issuer: Option<TokenIssuer>,
    pub started_at: Instant,
}

impl AppState {
    /// Build every component from configuration.
    ///
    /// Fails with `StartupAborted` when stored key material exists but cannot
    /// be opened; the caller must not serve in that case.
    pub async fn initialize(args: Args) -> Result<Self> {
        Self::initialize_with_kdf(args, KdfParams::default()).await
    }

    /// As [`AppState::initialize`], with explicit Argon2id parameters for
    /// newly sealed key material.
    pub async fn initialize_with_kdf(args: Args, kdf: KdfParams) -> Result<Self> {
        let secret = args
            .storage_secret()
            .ok_or_else(|| CustodyError::Config("STORAGE_SECRET is not set".into()))?;

        // Master key
        let store = KeyMaterialStore::open(&args.data_dir, &secret)?.with_kdf_params(kdf);
        let keys = Arc::new(MasterKeyManager::new(store, args.rotation_policy()));
        let current = {
            let keys = Arc::clone(&keys);
            tokio::task::spawn_blocking(move || keys.initialize())
                .await
                .map_err(|e| CustodyError::Internal(format!("key load task failed: {e}")))??
        };
        info!(
            version = current.version(),
            key_id = current.key_id(),
            "Master key ready"
        );

        // Revocation ledger
        let revocation_store = RedbRevocationStore::open(args.revocation_db_path())?;
        let prune_grace = chrono::Duration::seconds(args.issuer.clock_skew_secs as i64);
        let ledger = Arc::new(RevocationLedger::new(Arc::new(revocation_store), prune_grace));

        // Audit trail
        let audit_path = args.audit_log_path();
        if let Some(parent) = audit_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let audit = Arc::new(AuditLog::new(Arc::new(JsonlAuditSink::open(&audit_path)?)));

        // Issuer directories
        let (directories, dev_issuer) = build_directories(&args)?;
        for directory in &directories {
            if let Err(e) = directory.refresh().await {
                warn!(
                    issuer = directory.name(),
                    "Initial signing key fetch failed, not ready until it succeeds: {}", e
                );
            }
        }

        let leeway = args.issuer.clock_skew_secs;
        let verifier = |directory: &IdentityKeyDirectory| {
            TokenVerifier::new(directory.clone(), Arc::clone(&ledger), leeway)
        };
        let gate = match directories.as_slice() {
            [resource, identity] => {
                DualAuthorizationGate::with_verifiers(verifier(resource), verifier(identity))
            }
            [shared] => DualAuthorizationGate::new(verifier(shared)),
            _ => return Err(CustodyError::Config("No identity issuer configured".into())),
        };

        let service = Arc::new(EnvelopeKeyService::new(keys, gate, ledger, audit));

        Ok(Self {
            args,
            service,
            directories,
            dev_issuer,
            started_at: Instant::now(),
        })
    }

    /// Start rotation, prune and signing key refresh timers.
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![
            spawn_rotation_task(Arc::clone(self.service.key_manager())),
            spawn_prune_task(
                Arc::clone(self.service.ledger()),
                self.args.revocation_prune_interval(),
            ),
        ];

        let refresh_interval = self.args.signing_key_refresh_interval();
        tasks.extend(
            self.directories
                .iter()
                .map(|directory| directory.spawn_refresh_task(refresh_interval)),
        );
        tasks
    }
}

fn build_directories(args: &Args) -> Result<(Vec<IdentityKeyDirectory>, Option<TokenIssuer>)> {
    let config = args.directory_config();

    if args.uses_dev_issuer() {
        let issuer = TokenIssuer::generate(args.issuer.dev_token_ttl_secs)?;
        let directory = IdentityKeyDirectory::new(
            "dev",
            StaticSigningKeySource::new(issuer.public_key().clone()),
            config,
        );
        warn!("Using in-process dev token issuer - tokens are minted at POST /dev/token");
        return Ok((vec![directory], Some(issuer)));
    }

    let url = args
        .issuer
        .identity_issuer_url
        .as_deref()
        .ok_or_else(|| CustodyError::Config("IDENTITY_ISSUER_URL is not set".into()))?;
    let timeout = args.issuer_timeout();

    let mut directories = vec![IdentityKeyDirectory::new(
        "resource",
        HttpSigningKeySource::new(url, timeout),
        config.clone(),
    )];
    if let Some(identity_url) = args.issuer.identity_token_issuer_url.as_deref() {
        directories.push(IdentityKeyDirectory::new(
            "identity",
            HttpSigningKeySource::new(identity_url, timeout),
            config,
        ));
    }

    Ok((directories, None))
}

// =============================================================================
// Server
// =============================================================================

/// Bind the configured address and serve until Ctrl-C.
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;
    serve(listener, state, shutdown_signal()).await
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    info!("kacls listening on {}", listener.local_addr()?);

    if state.args.dev_mode {
        warn!("Development mode enabled - do not use with real key material");
    }
    if state.args.admin_api_key.is_none() {
        info!("ADMIN_API_KEY not set - /admin endpoints disabled");
    }

    let tasks = state.spawn_background_tasks();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);

                        let service = service_fn(move |req| {
                            let state = Arc::clone(&state);
                            async move { handle_request(state, addr, req).await }
                        });

                        if let Err(err) = http1::Builder::new()
                            .serve_connection(io, service)
                            .await
                        {
                            error!("Error serving connection from {}: {:?}", addr, err);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {:?}", e);
                }
            },
            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping listener");
                break;
            }
        }
    }

    for task in tasks {
        task.abort();
    }
    state.service.audit().flush().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("[{}] {} {}", addr, method, path);

    let response = match (method, path.as_str()) {
        (Method::GET, "/health") => routes::health_check(Arc::clone(&state)),
        (Method::GET, "/ready") => routes::readiness_check(Arc::clone(&state)).await,
        (Method::GET, "/info") => routes::info(Arc::clone(&state)).await,
        (Method::GET, "/metrics") => routes::metrics(Arc::clone(&state)).await,

        (Method::POST, "/wrap") => routes::handle_wrap(state, req).await,
        (Method::POST, "/unwrap") => routes::handle_unwrap(state, req).await,
        (Method::POST, "/logout") => routes::handle_logout(state, req).await,

        (Method::POST, "/admin/rotate") => routes::handle_rotate(state, req).await,
        (Method::POST, "/admin/revoke") => routes::handle_revoke(state, req).await,

        (Method::POST, "/dev/token") => routes::handle_dev_token(state, req).await,

        _ => routes::not_found_response(&path),
    };

    Ok(to_boxed(response))
}

/// Convert a Full<Bytes> body to BoxBody
fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}
