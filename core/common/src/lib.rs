//! Common utilities and types shared across the twinsync crates.
//!
//! This module provides the error type and the small value types (replica
//! sides, relative sync paths) that every other crate builds on.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ReplicaSide, SyncPath};
