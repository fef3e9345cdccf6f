//! Synchronization through the line-oriented JSONL stream.
//!
//! Export serializes issues to `.beads/issues.jsonl`; import parses the
//! stream back, resolves collisions, and reconciles divergent histories.
//! Neither side ever runs version-control commands; the stream file is the
//! only interchange.

pub mod export;
pub mod import;
pub mod merge;

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::error::{ConflictKind, Error, Result};
use crate::model::Issue;
use crate::util::Cancel;

/// Metadata keys maintained by the sync pipelines.
pub const META_STREAM_HASH: &str = "jsonl_content_hash";
pub const META_LAST_EXPORT: &str = "last_export_time";
pub const META_LAST_IMPORT: &str = "last_import_time";
/// JSON object `{issue_id: rfc3339}`; local wins over any incoming record
/// older than the recorded timestamp.
pub const META_PROTECTED_IDS: &str = "protect_local_export_ids";

/// Stream reader/writer buffer size.
pub(crate) const STREAM_BUFFER: usize = 2 * 1024 * 1024;

/// Export failure handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportErrorPolicy {
    /// Any failure fails the export.
    #[default]
    Strict,
    /// Log failures and keep going.
    BestEffort,
    /// Retry transient failures with backoff before giving up.
    Partial,
    /// Issue and dependency failures are fatal; label and comment failures
    /// are tolerated.
    RequiredCore,
}

impl FromStr for ExportErrorPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "strict" => Ok(Self::Strict),
            "best-effort" => Ok(Self::BestEffort),
            "partial" => Ok(Self::Partial),
            "required-core" => Ok(Self::RequiredCore),
            other => Err(Error::Config(format!("unknown export policy '{other}'"))),
        }
    }
}

impl std::fmt::Display for ExportErrorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Strict => "strict",
            Self::BestEffort => "best-effort",
            Self::Partial => "partial",
            Self::RequiredCore => "required-core",
        };
        f.write_str(s)
    }
}

/// What to do with dependency edges whose target is missing after import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrphanMode {
    /// Accept the dangling edge.
    #[default]
    Allow,
    /// Drop the edge.
    Skip,
    /// Fail the import.
    Strict,
    /// Create a placeholder issue for the missing target.
    Resurrect,
}

impl FromStr for OrphanMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "allow" => Ok(Self::Allow),
            "skip" => Ok(Self::Skip),
            "strict" => Ok(Self::Strict),
            "resurrect" => Ok(Self::Resurrect),
            other => Err(Error::Config(format!("unknown orphan mode '{other}'"))),
        }
    }
}

/// Options for an export run.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub policy: ExportErrorPolicy,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub write_manifest: bool,
    /// Bypass the empty-database and would-lose-issues guards.
    pub force: bool,
    pub cancel: Cancel,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            policy: ExportErrorPolicy::Strict,
            retry_attempts: 3,
            retry_backoff_ms: 100,
            write_manifest: false,
            force: false,
            cancel: Cancel::new(),
        }
    }
}

impl ExportOptions {
    /// Assemble from configuration; `auto` selects the background-export
    /// policy override.
    pub fn from_config(config: &crate::config::Config, auto: bool) -> Result<Self> {
        let policy_key = if auto {
            config.auto_export_error_policy()
        } else {
            config.export_error_policy()
        };
        Ok(Self {
            policy: policy_key.parse()?,
            retry_attempts: config.export_retry_attempts(),
            retry_backoff_ms: config.export_retry_backoff_ms(),
            write_manifest: config.write_manifest(),
            force: false,
            cancel: Cancel::new(),
        })
    }
}

/// Options for an import run.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub orphans: OrphanMode,
    /// When set, cross-prefix content-hash matches are skipped and incoming
    /// IDs are checked against this prefix.
    pub expected_prefix: Option<String>,
    pub cancel: Cancel,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            orphans: OrphanMode::Allow,
            expected_prefix: None,
            cancel: Cancel::new(),
        }
    }
}

/// Outcome counters for an export run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportReport {
    /// IDs written to the stream this run.
    pub exported: Vec<String>,
    /// Dirty IDs whose content already matched the export ledger.
    pub unchanged: usize,
    /// Dirty IDs that no longer exist in the store.
    pub vanished: usize,
    /// Per-entity failures tolerated by the policy.
    pub soft_errors: Vec<String>,
    /// Digest of the written stream.
    pub stream_hash: Option<String>,
}

/// Outcome counters for an import run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub inserted: usize,
    pub updated: usize,
    pub renamed: usize,
    pub skipped: usize,
    pub tombstone_protected: usize,
    pub protected_local: usize,
    pub cross_prefix_skipped: usize,
    /// IDs tombstoned by a three-way merge decision.
    pub deleted: Vec<String>,
    /// Dangling edges dropped under `OrphanMode::Skip`.
    pub orphan_edges_dropped: usize,
    /// Placeholders created under `OrphanMode::Resurrect`.
    pub placeholders_created: usize,
}

/// SHA-256 of a file's bytes, hex-encoded.
pub fn digest_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Abort with `Conflict(merge_markers)` when the file carries unresolved
/// version-control merge markers.
pub fn ensure_no_merge_markers(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let reader = BufReader::with_capacity(STREAM_BUFFER, File::open(path)?);
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.starts_with("<<<<<<< ") || line == "=======" || line.starts_with(">>>>>>> ") {
            return Err(Error::Conflict {
                kind: ConflictKind::MergeMarkers,
                detail: Some(format!("line {}", idx + 1)),
            });
        }
    }
    Ok(())
}

/// Parse the stream file into issues. Blank lines are ignored; a malformed
/// line is a [`Error::Parse`] carrying its 1-based line number.
pub fn read_stream(path: &Path) -> Result<Vec<Issue>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::with_capacity(STREAM_BUFFER, File::open(path)?);
    let mut issues = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let issue: Issue = serde_json::from_str(&line).map_err(|e| Error::Parse {
            line: idx + 1,
            reason: e.to_string(),
        })?;
        issues.push(issue);
    }
    Ok(issues)
}
