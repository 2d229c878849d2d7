//! Master key custody
//!
//! Envelope encryption of data-encryption keys under a versioned master key.
//!
//! ## Layout
//!
//! - [`crypto`]: AEAD sealing and storage key derivation
//! - [`envelope`]: the wrapped key format handed back to callers
//! - [`store`]: sealed key material file and rotation log on disk
//! - [`master_key`]: keyring lifecycle, wrap/unwrap, rotation

pub mod crypto;
pub mod envelope;
pub mod master_key;
pub mod store;

pub use crypto::{KdfParams, WRAP_ALGORITHM};
pub use envelope::WrappedKeyEnvelope;
pub use master_key::{
    spawn_rotation_task, KeyStatus, KeyVersionInfo, MasterKey, MasterKeyManager, RotationPolicy,
    MAX_WRAP_INPUT,
};
pub use store::{KeyMaterialStore, RotationLogEntry, RotationReason};
