//! Authorization for key operations
//!
//! - [`directory`]: issuer signing key cache with stale fallback
//! - [`revocation`]: revoked token ids, durable and cached
//! - [`jwt`]: token issuing and verification
//! - [`gate`]: the dual-token gate in front of every key operation

pub mod directory;
pub mod gate;
pub mod jwt;
pub mod revocation;

pub use directory::{
    DirectoryConfig, DirectoryError, DirectoryStats, HttpSigningKeySource, IdentityKeyDirectory,
    PublicSigningKey, PublishedSigningKey, SigningKeySource, StaticSigningKeySource,
    SIGNING_KEY_ALGORITHM,
};
pub use gate::{AuthContext, DualAuthorizationGate, GateDenial, GateStage};
pub use jwt::{
    extract_token_from_header, Claims, IssuedToken, TokenIssuer, TokenVerifier, VerifiedToken,
};
pub use revocation::{
    spawn_prune_task, MemoryRevocationStore, RedbRevocationStore, RevocationLedger,
    RevocationRecord, RevocationStats, RevocationStore, StoreError,
};
