//! Error types for Canary operations.
//!
//! This module defines the canonical error type used throughout Canary.
//! All subsystems return `Result<T, CanaryError>` for error handling.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Canonical error type for all Canary operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
/// Many variants auto-convert from standard library / dependency errors via `#[from]`.
#[derive(Error, Debug)]
pub enum CanaryError {
    /// SQLite database error (auto-converts from `rusqlite::Error`)
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),

    /// I/O error (auto-converts from `std::io::Error`)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// JSON (de)serialization error (auto-converts from `serde_json::Error`)
    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Two or more drafts share the same spec id.
    #[error("Duplicate test IDs in test suite: {0:?}")]
    DuplicateIds(Vec<(String, PathBuf)>),

    /// A `DependencyPatterns` entry failed its arity check.
    #[error("Unresolved dependencies: {0:?}")]
    UnresolvedDependencies(Vec<String>),

    /// Topological sort could not make progress: the dependency graph has a cycle.
    #[error("Dependency cycle detected among spec(s): {0:?}")]
    DependencyCycle(Vec<String>),

    /// An asset's source file was missing at setup time.
    #[error("Missing asset for spec {spec_id}: {path}")]
    MissingAsset { spec_id: String, path: PathBuf },

    /// Child process could not be launched.
    #[error("Failed to launch test: {0}")]
    LaunchFailed(String),

    /// Generic validation failure (malformed pathspec, invalid expression, …).
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A requested resource (spec, session, selection tag) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A spec-id prefix matched more than one spec.
    #[error("Ambiguous spec ID: {0}")]
    AmbiguousId(String),

    /// Directory already tagged as a workspace or session.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = CanaryError::ValidationError("bad expr".to_string());
        assert_eq!(format!("{}", err), "Validation error: bad expr");
    }

    #[test]
    fn test_not_found_error_display() {
        let err = CanaryError::NotFound("session 2024 not found".to_string());
        assert_eq!(format!("{}", err), "Not found: session 2024 not found");
    }

    #[test]
    fn test_ambiguous_id_display() {
        let err = CanaryError::AmbiguousId("ab12".to_string());
        assert_eq!(format!("{}", err), "Ambiguous spec ID: ab12");
    }

    #[test]
    fn test_missing_asset_display() {
        let err = CanaryError::MissingAsset {
            spec_id: "deadbeef".into(),
            path: PathBuf::from("data.txt"),
        };
        assert_eq!(
            format!("{}", err),
            "Missing asset for spec deadbeef: data.txt"
        );
    }
}
