//! Import pipeline: parse the stream, resolve collisions, apply updates.
//!
//! Collision resolution runs four phases per incoming record, after the
//! standing guards (tombstone protection, timestamp protection,
//! cross-prefix hash matches):
//!
//! 0. external-reference match - update when incoming is newer
//! 1. content-hash match - no-op on same ID; rename on same-prefix ID;
//!    skip on cross-prefix ID
//! 2. ID match - update when incoming is newer
//! 3. no match - insert

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::model::{Dependency, Issue, Status};
use crate::storage::{self, SqliteStore};
use crate::sync::{
    digest_file, ensure_no_merge_markers, read_stream, ImportOptions, ImportReport, OrphanMode,
    META_LAST_IMPORT, META_PROTECTED_IDS, META_STREAM_HASH,
};
use crate::util::hash::content_hash;
use crate::util::{id, time};
use crate::validation;

/// Is the store stale relative to the stream file?
///
/// Uses the symlink's own mtime (`lstat`, not `stat`) against the recorded
/// last-import time; on a newer file, compares digests to rule out
/// timestamp-only churn.
pub fn stream_is_stale(store: &SqliteStore, stream_path: &Path) -> Result<bool> {
    let Ok(meta) = fs::symlink_metadata(stream_path) else {
        return Ok(false);
    };
    let mtime: DateTime<Utc> = meta.modified()?.into();

    if let Some(last_import) = store.get_metadata(META_LAST_IMPORT)? {
        let last_import = time::parse_stored(&last_import)?;
        if mtime <= last_import {
            return Ok(false);
        }
    }

    let current = digest_file(stream_path)?;
    let stored = store.get_metadata(META_STREAM_HASH)?;
    Ok(stored.as_deref() != Some(current.as_str()))
}

/// Normalize an incoming record before collision resolution: flag wisps as
/// ephemeral, repair the closed-at/tombstone invariants, canonicalize the
/// external reference, and recompute the content hash (the stream is not
/// trusted to carry one).
pub fn normalize_incoming(issue: &mut Issue) {
    if issue.id.contains("-wisp-") {
        issue.ephemeral = true;
    }

    match issue.status {
        Status::Closed => {
            if issue.closed_at.is_none() {
                issue.closed_at = Some(issue.updated_at);
            }
        }
        Status::Tombstone => {
            if issue.deleted_at.is_none() {
                issue.deleted_at = Some(issue.updated_at);
            }
        }
        _ => issue.closed_at = None,
    }

    if let Some(ext) = issue.external_ref.take() {
        issue.external_ref = Some(canonicalize_external_ref(&ext));
    }

    issue.content_hash = Some(content_hash(issue));
}

/// Canonicalize the well-known external reference shapes: GitHub issue URLs
/// become `gh:owner/repo#N`, bare Jira keys become `jira:KEY-N`. Anything
/// already tagged (or unrecognized) passes through.
#[must_use]
pub fn canonicalize_external_ref(raw: &str) -> String {
    let raw = raw.trim();

    if let Ok(github) =
        Regex::new(r"^https?://github\.com/([^/\s]+)/([^/\s]+)/(?:issues|pull)/(\d+)$")
    {
        if let Some(caps) = github.captures(raw) {
            return format!("gh:{}/{}#{}", &caps[1], &caps[2], &caps[3]);
        }
    }

    if Regex::new(r"^[A-Z][A-Z0-9]+-\d+$").is_ok_and(|jira| jira.is_match(raw)) {
        return format!("jira:{raw}");
    }

    raw.to_string()
}

/// Timestamp-protected local IDs, from metadata.
fn protected_ids(store: &SqliteStore) -> Result<HashMap<String, DateTime<Utc>>> {
    let Some(json) = store.get_metadata(META_PROTECTED_IDS)? else {
        return Ok(HashMap::new());
    };
    let raw: HashMap<String, String> = serde_json::from_str(&json).unwrap_or_default();
    let mut out = HashMap::new();
    for (issue_id, stamp) in raw {
        if let Ok(parsed) = time::parse_stored(&stamp) {
            out.insert(issue_id, parsed);
        }
    }
    Ok(out)
}

/// Resolution outcome for one incoming record.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    /// Phase 1a: identical content under the same ID.
    Noop,
    /// Phase 3: brand new.
    Insert,
    /// Phases 0 and 2: overwrite the existing row.
    Update { existing_id: String },
    /// Phase 1b: same content, same prefix, new ID.
    Rename { old_id: String },
    Skip { counter: SkipCounter },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipCounter {
    Plain,
    Tombstone,
    ProtectedLocal,
    CrossPrefix,
}

fn plan_action(
    store: &SqliteStore,
    incoming: &Issue,
    protected: &HashMap<String, DateTime<Utc>>,
    prefix_validation: bool,
) -> Result<Action> {
    // Guard: a local tombstone under this ID is never overwritten, not even
    // by another tombstone.
    if store.is_tombstone(&incoming.id)? {
        return Ok(Action::Skip {
            counter: SkipCounter::Tombstone,
        });
    }

    // Guard: timestamp protection wins over everything that follows.
    if let Some(protected_at) = protected.get(&incoming.id) {
        if *protected_at > incoming.updated_at {
            return Ok(Action::Skip {
                counter: SkipCounter::ProtectedLocal,
            });
        }
    }

    let incoming_hash = incoming
        .content_hash
        .clone()
        .unwrap_or_else(|| content_hash(incoming));

    // Phase 0: external reference.
    if let Some(ext) = &incoming.external_ref {
        if let Some(existing) = store.find_by_external_ref(ext)? {
            if existing.status == Status::Tombstone {
                return Ok(Action::Skip {
                    counter: SkipCounter::Tombstone,
                });
            }
            if incoming.updated_at > existing.updated_at {
                return Ok(Action::Update {
                    existing_id: existing.id,
                });
            }
            return Ok(Action::Skip {
                counter: SkipCounter::Plain,
            });
        }
    }

    // Phase 1: content hash.
    if let Some(existing) = store.find_by_content_hash(&incoming_hash)? {
        if existing.id == incoming.id {
            return Ok(Action::Noop);
        }
        if existing.status == Status::Tombstone {
            return Ok(Action::Skip {
                counter: SkipCounter::Tombstone,
            });
        }
        let same_prefix = match (id::parse_id(&existing.id), id::parse_id(&incoming.id)) {
            (Ok(a), Ok(b)) => a.prefix == b.prefix,
            _ => false,
        };
        if same_prefix {
            return Ok(Action::Rename {
                old_id: existing.id,
            });
        }
        if prefix_validation {
            return Ok(Action::Skip {
                counter: SkipCounter::CrossPrefix,
            });
        }
        // Cross-project duplicate; leave both sides alone.
        return Ok(Action::Skip {
            counter: SkipCounter::Plain,
        });
    }

    // Phase 2: ID.
    if let Some(existing) = store.get_issue(&incoming.id)? {
        if incoming.updated_at > existing.updated_at {
            return Ok(Action::Update {
                existing_id: existing.id,
            });
        }
        return Ok(Action::Skip {
            counter: SkipCounter::Plain,
        });
    }

    // Phase 3: new.
    Ok(Action::Insert)
}

/// Import the stream file into the store.
///
/// Aborts before touching state when the file carries merge markers or any
/// record fails validation. New records apply parents-first (hierarchy
/// depth 0 to 3); the whole application is one transaction that also clears
/// every export hash. The blocked cache is rebuilt after commit, then the
/// import metadata is updated and the WAL checkpointed best-effort.
pub fn import_stream(
    store: &SqliteStore,
    stream_path: &Path,
    options: &ImportOptions,
) -> Result<ImportReport> {
    ensure_no_merge_markers(stream_path)?;
    let mut incoming = read_stream(stream_path)?;

    let mut report = ImportReport::default();

    for issue in &mut incoming {
        normalize_incoming(issue);
    }
    // Wisps never travel; drop any that sneaked into the stream.
    incoming.retain(|issue| {
        if issue.ephemeral {
            report.skipped += 1;
            false
        } else {
            true
        }
    });

    for issue in &incoming {
        validation::validate_issue(issue).map_err(|e| {
            Error::validation("import", format!("record {}: {e}", issue.id))
        })?;
    }

    // Duplicate external refs inside one stream are a conflict.
    let mut seen_refs: HashSet<&str> = HashSet::new();
    for issue in &incoming {
        if let Some(ext) = issue.external_ref.as_deref() {
            if !seen_refs.insert(ext) {
                return Err(Error::Conflict {
                    kind: crate::error::ConflictKind::DuplicateExternalRef,
                    detail: Some(ext.to_string()),
                });
            }
        }
    }

    let protected = protected_ids(store)?;
    let prefix_validation = options.expected_prefix.is_some();

    let mut planned: Vec<(Issue, Action)> = Vec::new();
    let mut renames: HashMap<String, String> = HashMap::new();
    for issue in incoming {
        options.cancel.check()?;
        let action = plan_action(store, &issue, &protected, prefix_validation)?;
        if let Action::Rename { old_id } = &action {
            renames.insert(old_id.clone(), issue.id.clone());
        }
        if let Action::Update { existing_id } = &action {
            if *existing_id != issue.id {
                renames.insert(issue.id.clone(), existing_id.clone());
            }
        }
        planned.push((issue, action));
    }

    // Point dependencies at resolved IDs before applying.
    if !renames.is_empty() {
        for (issue, _) in &mut planned {
            for dep in &mut issue.dependencies {
                if let Some(new_id) = renames.get(&dep.depends_on_id) {
                    dep.depends_on_id.clone_from(new_id);
                }
                if let Some(new_id) = renames.get(&dep.issue_id) {
                    dep.issue_id.clone_from(new_id);
                }
            }
        }
    }

    // Parents before children so child rows never precede their parent.
    planned.sort_by_key(|(issue, _)| id::id_depth(&issue.id));

    // Orphan pass: every dependency target must exist in the store, in the
    // batch, or be external.
    let incoming_ids: HashSet<String> = planned.iter().map(|(i, _)| i.id.clone()).collect();
    let mut placeholders: Vec<Issue> = Vec::new();
    for (issue, action) in &mut planned {
        if matches!(action, Action::Skip { .. } | Action::Noop) {
            continue;
        }
        let mut kept = Vec::with_capacity(issue.dependencies.len());
        for dep in std::mem::take(&mut issue.dependencies) {
            if dep.is_external()
                || incoming_ids.contains(&dep.depends_on_id)
                || store.id_exists(&dep.depends_on_id)?
                || placeholders.iter().any(|p| p.id == dep.depends_on_id)
            {
                kept.push(dep);
                continue;
            }
            match options.orphans {
                OrphanMode::Allow => kept.push(dep),
                OrphanMode::Skip => {
                    tracing::warn!(
                        issue_id = %issue.id,
                        target = %dep.depends_on_id,
                        "dropping orphaned dependency edge"
                    );
                    report.orphan_edges_dropped += 1;
                }
                OrphanMode::Strict => {
                    return Err(Error::validation(
                        "dependency",
                        format!(
                            "{} depends on missing issue {}",
                            issue.id, dep.depends_on_id
                        ),
                    ));
                }
                OrphanMode::Resurrect => {
                    placeholders.push(placeholder_issue(&dep.depends_on_id));
                    report.placeholders_created += 1;
                    kept.push(dep);
                }
            }
        }
        issue.dependencies = kept;
    }

    // Transactional application.
    store.mutate("import", &options.cancel, |tx, _ctx| {
        // Every export hash is invalidated by definition.
        tx.execute("DELETE FROM export_hashes", [])?;

        for placeholder in &placeholders {
            if !storage::issue_exists_tx(tx, &placeholder.id)? {
                storage::insert_issue_tx(tx, placeholder)?;
            }
        }

        for (issue, action) in &planned {
            match action {
                Action::Noop => {}
                Action::Insert => {
                    upsert_issue_tx(tx, issue)?;
                    sync_relations_tx(tx, issue)?;
                    report.inserted += 1;
                }
                Action::Update { existing_id } => {
                    let mut updated = issue.clone();
                    updated.id.clone_from(existing_id);
                    upsert_issue_tx(tx, &updated)?;
                    sync_relations_tx(tx, &updated)?;
                    report.updated += 1;
                }
                Action::Rename { old_id } => {
                    rename_issue_tx(tx, old_id, &issue.id)?;
                    upsert_issue_tx(tx, issue)?;
                    sync_relations_tx(tx, issue)?;
                    report.renamed += 1;
                }
                Action::Skip { counter } => match counter {
                    SkipCounter::Plain => report.skipped += 1,
                    SkipCounter::Tombstone => report.tombstone_protected += 1,
                    SkipCounter::ProtectedLocal => report.protected_local += 1,
                    SkipCounter::CrossPrefix => report.cross_prefix_skipped += 1,
                },
            }
        }
        Ok(())
    })?;

    // Rebuild after commit, then record what we imported.
    crate::graph::rebuild_blocked_cache(store, &options.cancel)?;
    store.set_metadata(
        META_LAST_IMPORT,
        &time::to_rfc3339(Utc::now()),
        &options.cancel,
    )?;
    store.set_metadata(META_STREAM_HASH, &digest_file(stream_path)?, &options.cancel)?;
    store.checkpoint();

    tracing::debug!(
        inserted = report.inserted,
        updated = report.updated,
        renamed = report.renamed,
        skipped = report.skipped,
        "import finished"
    );
    Ok(report)
}

/// Import only when the staleness check says the store is behind.
pub fn import_if_stale(
    store: &SqliteStore,
    stream_path: &Path,
    options: &ImportOptions,
) -> Result<Option<ImportReport>> {
    if !stream_is_stale(store, stream_path)? {
        return Ok(None);
    }
    import_stream(store, stream_path, options).map(Some)
}

fn placeholder_issue(issue_id: &str) -> Issue {
    let now = Utc::now();
    let mut issue = Issue {
        id: issue_id.to_string(),
        title: format!("[placeholder] {issue_id}"),
        created_at: now,
        updated_at: now,
        ..Issue::default()
    };
    issue.content_hash = Some(content_hash(&issue));
    issue
}

/// Update-or-insert without deleting the row (a REPLACE would cascade away
/// comments and events).
fn upsert_issue_tx(conn: &Connection, issue: &Issue) -> Result<()> {
    match storage::update_issue_row_tx(conn, issue) {
        Ok(()) => Ok(()),
        Err(Error::NotFound { .. }) => storage::insert_issue_tx(conn, issue),
        Err(e) => Err(e),
    }
}

/// Re-point every table at a new issue ID. Foreign-key checks defer to
/// commit so the cascade order doesn't matter.
fn rename_issue_tx(conn: &Connection, old_id: &str, new_id: &str) -> Result<()> {
    conn.execute_batch("PRAGMA defer_foreign_keys = ON")?;
    conn.execute(
        "UPDATE issues SET id = ?2 WHERE id = ?1",
        rusqlite::params![old_id, new_id],
    )?;
    for sql in [
        "UPDATE dependencies SET issue_id = ?2 WHERE issue_id = ?1",
        "UPDATE dependencies SET depends_on_id = ?2 WHERE depends_on_id = ?1",
        "UPDATE labels SET issue_id = ?2 WHERE issue_id = ?1",
        "UPDATE comments SET issue_id = ?2 WHERE issue_id = ?1",
        "UPDATE events SET issue_id = ?2 WHERE issue_id = ?1",
        "UPDATE dirty_issues SET issue_id = ?2 WHERE issue_id = ?1",
        "UPDATE child_counters SET parent_id = ?2 WHERE parent_id = ?1",
    ] {
        conn.execute(sql, rusqlite::params![old_id, new_id])?;
    }
    tracing::debug!(old_id, new_id, "renamed issue");
    Ok(())
}

/// Delete-then-insert resync of labels, dependencies, and comments.
pub(crate) fn sync_relations_tx(conn: &Connection, issue: &Issue) -> Result<()> {
    conn.execute("DELETE FROM labels WHERE issue_id = ?", [&issue.id])?;
    for label in &issue.labels {
        conn.execute(
            "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?, ?)",
            rusqlite::params![issue.id, label],
        )?;
    }

    conn.execute("DELETE FROM dependencies WHERE issue_id = ?", [&issue.id])?;
    let mut seen_targets: HashSet<&str> = HashSet::new();
    for dep in &issue.dependencies {
        if dep.issue_id != issue.id || dep.depends_on_id == issue.id {
            continue;
        }
        if !seen_targets.insert(dep.depends_on_id.as_str()) {
            continue;
        }
        let normalized = Dependency {
            issue_id: issue.id.clone(),
            ..dep.clone()
        };
        storage::insert_dependency_tx(conn, &normalized)?;
    }

    conn.execute("DELETE FROM comments WHERE issue_id = ?", [&issue.id])?;
    for comment in &issue.comments {
        conn.execute(
            "INSERT INTO comments (issue_id, author, text, created_at) VALUES (?, ?, ?, ?)",
            rusqlite::params![
                issue.id,
                comment.author,
                comment.body,
                time::to_rfc3339(comment.created_at)
            ],
        )?;
    }
    Ok(())
}
