//! Typed errors surfaced across component boundaries.

use thiserror::Error;

/// Errors raised to API callers for missing entities and wrapped service failures.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("package {0} does not exist")]
    PackageDoesNotExists(u64),
    #[error("file {0} does not exist")]
    FileDoesNotExists(u64),
    /// Wraps any underlying failure from an addon-exposed service call.
    #[error("service error: {0}")]
    ServiceError(String),
}

/// Error returned when a transfer is stopped by user request (pause/cancel).
#[derive(Debug)]
pub struct Aborted;

impl std::fmt::Display for Aborted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "download aborted by user")
    }
}

impl std::error::Error for Aborted {}
