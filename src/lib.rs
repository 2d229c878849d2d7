//! kacls - key access control list service
//!
//! Custody of a versioned master key that wraps and unwraps data-encryption
//! keys for a message store. Every key operation needs two independently
//! issued tokens naming the same subject.
//!
//! ## Components
//!
//! - **Custody**: sealed master key ring, AEAD wrap/unwrap, rotation
//! - **Auth**: issuer key directory, token verification, revocation, dual gate
//! - **Logging**: tracing setup and the operation audit trail
//! - **Server**: hyper HTTP surface over the envelope key service

pub mod auth;
pub mod config;
pub mod custody;
pub mod logging;
pub mod routes;
pub mod server;
pub mod services;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{CustodyError, Result};
