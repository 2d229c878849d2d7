//! Shared types

pub mod error;

pub use error::{CustodyError, Result};
