//! Error types for the knowledge engine.
//!
//! This module defines the canonical error type used throughout the engine.
//! All subsystems return `Result<T, EngineError>` for error handling.

use rusqlite;
use std::io;
use thiserror::Error;

/// Canonical error type for all engine operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
/// Storage and I/O variants auto-convert from their library errors via `#[from]`.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed or out-of-contract input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Constitution denied the (actor, action, resource) triple
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A required capability probe failed or is configured to deny
    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// A filesystem path resolved outside the project write area
    #[error("Path escape: {0}")]
    PathEscape(String),

    /// Resource not found (recipe, candidate, file, session, ...)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate id or illegal state transition
    #[error("Conflict: {0}")]
    Conflict(String),

    /// SQLite database error (auto-converts from `rusqlite::Error`)
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// I/O error (auto-converts from `std::io::Error`)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Stats file lock could not be acquired within the retry budget
    #[error("Lock contention: {0}")]
    LockContention(String),

    /// AI provider call failed, timed out, or is unconfigured
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Corrupted JSON/YAML in a stored column or document
    #[error("Schema error: {0}")]
    Schema(String),

    /// Operation cancelled by the caller's deadline or context
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Invariant breach that has no better classification
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable code for protocol and audit surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "ValidationError",
            EngineError::PermissionDenied(_) => "PermissionDenied",
            EngineError::CapabilityUnavailable(_) => "CapabilityUnavailable",
            EngineError::PathEscape(_) => "PathEscape",
            EngineError::NotFound(_) => "NotFound",
            EngineError::Conflict(_) => "Conflict",
            EngineError::Storage(_) => "StorageError",
            EngineError::Io(_) => "IoError",
            EngineError::LockContention(_) => "LockContention",
            EngineError::ProviderUnavailable(_) => "ProviderUnavailable",
            EngineError::Schema(_) => "SchemaError",
            EngineError::Cancelled(_) => "Cancelled",
            EngineError::Internal(_) => "Internal",
        }
    }

    /// Map a storage-layer error to a domain error where the SQL state is
    /// meaningful (unique violation becomes `Conflict`).
    pub fn from_storage(err: rusqlite::Error, context: &str) -> EngineError {
        if let rusqlite::Error::SqliteFailure(ref failure, _) = err {
            if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                return EngineError::Conflict(format!("{}: {}", context, err));
            }
        }
        EngineError::Storage(err)
    }
}
