//! Error taxonomy for `beads_core`.
//!
//! Errors fall into three layers: validation (rejected before any state
//! change), operational (I/O, locks, parsing; sometimes retried), and
//! invariant (detected during import or bulk operations; always abort the
//! surrounding transaction).

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Kinds of conflict surfaced by the sync pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Version-control merge markers found in the stream file.
    MergeMarkers,
    /// Two incoming records claim the same external reference.
    DuplicateExternalRef,
    /// A record was modified locally and deleted remotely (or vice versa).
    DeleteVsModify,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MergeMarkers => "merge_markers",
            Self::DuplicateExternalRef => "duplicate_external_ref",
            Self::DeleteVsModify => "delete_vs_modify",
        };
        f.write_str(s)
    }
}

/// Primary error type for all engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No issue matches the given ID.
    #[error("issue not found: {id}")]
    NotFound { id: String },

    /// A partial ID matched more than one issue.
    #[error("ambiguous ID '{input}': matches {candidates:?}")]
    AmbiguousId {
        input: String,
        candidates: Vec<String>,
    },

    /// The ID does not parse as `<prefix>-<base36>` with optional child path.
    #[error("invalid issue ID: {id}")]
    InvalidId { id: String },

    /// A field failed validation; no state was changed.
    #[error("validation failed: {field}: {reason}")]
    Validation { field: String, reason: String },

    /// Adding the edge would close a cycle in the blocking subgraph.
    #[error("dependency cycle: {path}")]
    CycleDetected { path: String },

    /// Sync-level conflict.
    #[error("conflict: {kind}")]
    Conflict {
        kind: ConflictKind,
        detail: Option<String>,
    },

    /// Close was refused because unresolved blockers remain.
    #[error("issue {id} is blocked by {blockers:?}")]
    Blocked { id: String, blockers: Vec<String> },

    /// Underlying `SQLite` failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line of the stream file failed to parse.
    #[error("parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// Workspace is held by another process.
    #[error("workspace locked: {path}")]
    Locked { path: PathBuf },

    /// The caller's cancellation token was observed.
    #[error("operation cancelled")]
    Cancelled,

    /// Workspace directory missing or not initialized.
    #[error("no workspace found at '{path}'")]
    WorkspaceNotFound { path: PathBuf },

    /// Configuration file or value problem.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Shorthand for a validation error.
    #[must_use]
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a conflict without detail text.
    #[must_use]
    pub const fn conflict(kind: ConflictKind) -> Self {
        Self::Conflict { kind, detail: None }
    }

    /// Process exit code for CLI shells wrapping the engine.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound { .. } => 3,
            Self::Validation { .. } | Self::AmbiguousId { .. } | Self::InvalidId { .. } => 4,
            Self::Database(_) => 5,
            Self::CycleDetected { .. } => 6,
            Self::Conflict { .. } => 7,
            _ => 1,
        }
    }

    /// One-line hint a caller may show next to the message.
    #[must_use]
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::NotFound { .. } => Some("try `list` to see known issues"),
            Self::AmbiguousId { .. } => Some("provide more characters of the ID"),
            Self::CycleDetected { .. } => Some("remove one dependency to break the cycle"),
            Self::Blocked { .. } => Some("close the blockers first, or force the close"),
            Self::Locked { .. } => Some("another process holds the workspace; retry later"),
            _ => None,
        }
    }

    /// True when retrying the same call may succeed without user action.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Self::Io(_) => true,
            _ => false,
        }
    }
}
