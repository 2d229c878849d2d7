//! Services layer
//!
//! Coordinates the gate, the master key manager, the revocation ledger and
//! the audit log into the operations the HTTP routes expose.

pub mod envelope_keys;

pub use envelope_keys::EnvelopeKeyService;
