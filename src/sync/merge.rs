//! Three-way merge against a sync-base snapshot.
//!
//! When `sync_base.jsonl` (the state at the last successful sync) is
//! available, divergent histories reconcile per record: Base (snapshot),
//! Local (store), Remote (incoming stream). Equality is content-hash
//! equality; when both sides changed, last write wins by `updated_at`.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;

use crate::error::Result;
use crate::model::{Issue, Status};
use crate::storage::{self, SqliteStore};
use crate::sync::export::atomic_write;
use crate::sync::import::normalize_incoming;
use crate::sync::{
    digest_file, ensure_no_merge_markers, read_stream, ImportOptions, ImportReport,
    META_LAST_IMPORT, META_PROTECTED_IDS, META_STREAM_HASH,
};
use crate::util::hash::content_hash;
use crate::util::time;

/// Per-record merge outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision {
    /// Apply the remote version.
    TakeRemote(Box<Issue>),
    /// Leave the local version in place.
    KeepLocal,
    /// The record was deleted on the surviving side; tombstone it locally.
    Delete(String),
    /// Nothing to do (identical, or absent everywhere).
    Skip,
}

fn hashes_equal(a: &Issue, b: &Issue) -> bool {
    content_hash(a) == content_hash(b)
}

/// Decide one record from its three states.
#[must_use]
pub fn merge_issue(
    base: Option<&Issue>,
    local: Option<&Issue>,
    remote: Option<&Issue>,
) -> MergeDecision {
    match (base, local, remote) {
        (_, None, None) => match base {
            // Gone on both sides; make the deletion explicit.
            Some(b) => MergeDecision::Delete(b.id.clone()),
            None => MergeDecision::Skip,
        },

        // Only in remote: import it.
        (None, None, Some(r)) => MergeDecision::TakeRemote(Box::new(r.clone())),

        // Only in local: keep it.
        (None, Some(_), None) => MergeDecision::KeepLocal,

        // No base: converged creation; identical content is a no-op,
        // otherwise last write wins.
        (None, Some(l), Some(r)) => {
            if hashes_equal(l, r) {
                MergeDecision::Skip
            } else if r.updated_at > l.updated_at {
                MergeDecision::TakeRemote(Box::new(r.clone()))
            } else {
                MergeDecision::KeepLocal
            }
        }

        // Deleted remotely. An untouched local copy follows the deletion; a
        // locally-modified copy survives.
        (Some(b), Some(l), None) => {
            if hashes_equal(l, b) {
                MergeDecision::Delete(l.id.clone())
            } else {
                tracing::debug!(id = %l.id, "kept local over remote deletion");
                MergeDecision::KeepLocal
            }
        }

        // Deleted locally. An unchanged remote copy stays deleted; a
        // remotely-modified copy comes back.
        (Some(b), None, Some(r)) => {
            if hashes_equal(r, b) {
                MergeDecision::Skip
            } else {
                tracing::debug!(id = %r.id, "took remote over local deletion");
                MergeDecision::TakeRemote(Box::new(r.clone()))
            }
        }

        // Present everywhere.
        (Some(b), Some(l), Some(r)) => {
            if hashes_equal(l, r) {
                MergeDecision::Skip
            } else if hashes_equal(l, b) {
                MergeDecision::TakeRemote(Box::new(r.clone()))
            } else if hashes_equal(r, b) {
                MergeDecision::KeepLocal
            } else if r.updated_at > l.updated_at {
                MergeDecision::TakeRemote(Box::new(r.clone()))
            } else {
                MergeDecision::KeepLocal
            }
        }
    }
}

/// Merge the stream into the store using the snapshot at `base_path`, then
/// refresh the snapshot to the post-merge state.
///
/// Guards run before merge decisions: local tombstones always win, and
/// timestamp-protected IDs keep their local version regardless of what the
/// merge would have chosen.
pub fn merge_stream(
    store: &SqliteStore,
    stream_path: &Path,
    base_path: &Path,
    options: &ImportOptions,
) -> Result<ImportReport> {
    ensure_no_merge_markers(stream_path)?;

    let mut remote_issues = read_stream(stream_path)?;
    for issue in &mut remote_issues {
        normalize_incoming(issue);
    }
    remote_issues.retain(|i| !i.ephemeral);

    let base_issues = {
        let mut issues = read_stream(base_path)?;
        for issue in &mut issues {
            normalize_incoming(issue);
        }
        issues
    };
    let local_issues = store.exportable_issues()?;

    let remote: HashMap<&str, &Issue> =
        remote_issues.iter().map(|i| (i.id.as_str(), i)).collect();
    let base: HashMap<&str, &Issue> = base_issues.iter().map(|i| (i.id.as_str(), i)).collect();
    let local: HashMap<&str, &Issue> = local_issues.iter().map(|i| (i.id.as_str(), i)).collect();

    let protected: HashMap<String, chrono::DateTime<Utc>> = store
        .get_metadata(META_PROTECTED_IDS)?
        .and_then(|json| serde_json::from_str::<HashMap<String, String>>(&json).ok())
        .map(|raw| {
            raw.into_iter()
                .filter_map(|(k, v)| time::parse_stored(&v).ok().map(|t| (k, t)))
                .collect()
        })
        .unwrap_or_default();

    let mut all_ids: Vec<&str> = remote
        .keys()
        .chain(base.keys())
        .chain(local.keys())
        .copied()
        .collect();
    all_ids.sort_unstable();
    all_ids.dedup();

    let mut report = ImportReport::default();
    let mut take: Vec<Issue> = Vec::new();
    let mut delete: Vec<String> = Vec::new();

    for issue_id in all_ids {
        options.cancel.check()?;
        let local_issue = local.get(issue_id).copied();
        let remote_issue = remote.get(issue_id).copied();

        // Tombstone guard: never resurrect.
        if local_issue.is_some_and(|l| l.status == Status::Tombstone) {
            if remote_issue.is_some() {
                report.tombstone_protected += 1;
            }
            continue;
        }

        // Timestamp protection precedes merge logic entirely.
        if let (Some(protected_at), Some(r)) = (protected.get(issue_id), remote_issue) {
            if *protected_at > r.updated_at {
                report.protected_local += 1;
                continue;
            }
        }

        match merge_issue(base.get(issue_id).copied(), local_issue, remote_issue) {
            MergeDecision::TakeRemote(issue) => take.push(*issue),
            MergeDecision::Delete(issue_id) => {
                if local.contains_key(issue_id.as_str()) {
                    delete.push(issue_id);
                }
            }
            MergeDecision::KeepLocal | MergeDecision::Skip => {}
        }
    }

    // Apply imports in one transaction (parents first), like a plain import.
    take.sort_by_key(|issue| crate::util::id::id_depth(&issue.id));
    let inserted_ids: Vec<bool> = take
        .iter()
        .map(|i| !local.contains_key(i.id.as_str()))
        .collect();
    drop((remote, base, local));

    store.mutate("merge", &options.cancel, |tx, _ctx| {
        tx.execute("DELETE FROM export_hashes", [])?;
        for (issue, inserted) in take.iter().zip(&inserted_ids) {
            if *inserted {
                storage::insert_issue_tx(tx, issue)?;
                report.inserted += 1;
            } else {
                storage::update_issue_row_tx(tx, issue)?;
                report.updated += 1;
            }
            super::import::sync_relations_tx(tx, issue)?;
        }
        Ok(())
    })?;

    for issue_id in &delete {
        store.delete_issue(issue_id, Some("removed by sync merge"), "merge", &options.cancel)?;
        report.deleted.push(issue_id.clone());
    }

    crate::graph::rebuild_blocked_cache(store, &options.cancel)?;
    store.set_metadata(META_LAST_IMPORT, &time::to_rfc3339(Utc::now()), &options.cancel)?;
    store.set_metadata(META_STREAM_HASH, &digest_file(stream_path)?, &options.cancel)?;
    store.checkpoint();

    // The post-merge store is the next sync's base.
    save_snapshot(store, base_path)?;

    Ok(report)
}

/// Write the current exportable state as the sync-base snapshot.
pub fn save_snapshot(store: &SqliteStore, base_path: &Path) -> Result<()> {
    let issues = store.exportable_issues()?;
    let body = issues
        .iter()
        .map(serde_json::to_string)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| crate::error::Error::Config(format!("snapshot serialization: {e}")))?
        .join("\n");
    atomic_write(base_path, body.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;
    use crate::storage::{NewIssue, SqliteStore};
    use crate::sync::export::export_incremental;
    use crate::sync::ExportOptions;
    use crate::util::Cancel;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn issue(issue_id: &str, title: &str) -> Issue {
        let now = Utc::now();
        let mut issue = Issue {
            id: issue_id.to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
            ..Issue::default()
        };
        issue.content_hash = Some(content_hash(&issue));
        issue
    }

    #[test]
    fn decision_table() {
        let base = issue("bd-a", "base");
        let mut local = issue("bd-a", "base");
        local.content_hash = Some(content_hash(&local));
        let mut remote = issue("bd-a", "remote change");
        remote.updated_at = local.updated_at + chrono::Duration::hours(1);

        // Only in remote.
        assert!(matches!(
            merge_issue(None, None, Some(&remote)),
            MergeDecision::TakeRemote(_)
        ));
        // Only in local.
        assert_eq!(merge_issue(None, Some(&local), None), MergeDecision::KeepLocal);
        // Only in base.
        assert_eq!(
            merge_issue(Some(&base), None, None),
            MergeDecision::Delete("bd-a".to_string())
        );
        // Local equals remote.
        assert_eq!(
            merge_issue(Some(&base), Some(&local), Some(&local.clone())),
            MergeDecision::Skip
        );
        // Local untouched, remote changed: take remote.
        assert!(matches!(
            merge_issue(Some(&base), Some(&local), Some(&remote)),
            MergeDecision::TakeRemote(_)
        ));
        // Remote untouched, local changed: keep local.
        let mut changed_local = issue("bd-a", "local change");
        changed_local.updated_at = base.updated_at + chrono::Duration::hours(2);
        assert_eq!(
            merge_issue(Some(&base), Some(&changed_local), Some(&base.clone())),
            MergeDecision::KeepLocal
        );
        // Both changed: last write wins.
        assert!(matches!(
            merge_issue(Some(&base), Some(&changed_local), Some(&remote)),
            MergeDecision::KeepLocal
        ));
        let mut newer_remote = remote.clone();
        newer_remote.updated_at = changed_local.updated_at + chrono::Duration::hours(1);
        assert!(matches!(
            merge_issue(Some(&base), Some(&changed_local), Some(&newer_remote)),
            MergeDecision::TakeRemote(_)
        ));
        // No base, both present, divergent: last write wins.
        assert!(matches!(
            merge_issue(None, Some(&changed_local), Some(&newer_remote)),
            MergeDecision::TakeRemote(_)
        ));
    }

    #[test]
    fn remote_deletion_of_untouched_local() {
        let base = issue("bd-a", "same");
        let local = issue("bd-a", "same");
        assert_eq!(
            merge_issue(Some(&base), Some(&local), None),
            MergeDecision::Delete("bd-a".to_string())
        );

        let mut modified = issue("bd-a", "modified since base");
        modified.updated_at = base.updated_at + chrono::Duration::hours(1);
        assert_eq!(
            merge_issue(Some(&base), Some(&modified), None),
            MergeDecision::KeepLocal
        );
    }

    fn setup() -> (TempDir, SqliteStore, PathBuf, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open(&tmp.path().join("b.db")).unwrap();
        let stream = tmp.path().join("issues.jsonl");
        let base = tmp.path().join("sync_base.jsonl");
        (tmp, store, stream, base)
    }

    #[test]
    fn merge_applies_remote_and_refreshes_snapshot() {
        let (_tmp, store, stream, base) = setup();
        let cancel = Cancel::new();

        // Shared history: one issue, exported and snapshotted.
        let shared = store
            .create_issue(
                &NewIssue {
                    title: "Shared".to_string(),
                    ..NewIssue::default()
                },
                "t",
                &cancel,
            )
            .unwrap();
        export_incremental(&store, &stream, &ExportOptions::default()).unwrap();
        save_snapshot(&store, &base).unwrap();

        // Remote modified the shared issue and added a new one.
        let mut remote_shared = store.require_issue(&shared.id).unwrap();
        remote_shared.title = "Shared (remote edit)".to_string();
        remote_shared.updated_at = Utc::now() + chrono::Duration::hours(1);
        let mut remote_new = issue("bd-remote1", "Remote only");
        remote_new.priority = Priority::HIGH;
        let body = [&remote_shared, &remote_new]
            .iter()
            .map(|i| serde_json::to_string(i).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        atomic_write(&stream, body.as_bytes()).unwrap();

        let report = merge_stream(&store, &stream, &base, &ImportOptions::default()).unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.inserted, 1);
        assert_eq!(
            store.require_issue(&shared.id).unwrap().title,
            "Shared (remote edit)"
        );
        assert!(store.get_issue("bd-remote1").unwrap().is_some());

        // Snapshot now reflects the merged state.
        let snapshot = read_stream(&base).unwrap();
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn merge_deletes_what_remote_removed() {
        let (_tmp, store, stream, base) = setup();
        let cancel = Cancel::new();
        let kept = store
            .create_issue(
                &NewIssue {
                    title: "Kept".to_string(),
                    ..NewIssue::default()
                },
                "t",
                &cancel,
            )
            .unwrap();
        let removed = store
            .create_issue(
                &NewIssue {
                    title: "Removed remotely".to_string(),
                    ..NewIssue::default()
                },
                "t",
                &cancel,
            )
            .unwrap();
        export_incremental(&store, &stream, &ExportOptions::default()).unwrap();
        save_snapshot(&store, &base).unwrap();

        // Remote stream now carries only the kept issue.
        let kept_line =
            serde_json::to_string(&store.exportable_issue(&kept.id).unwrap().unwrap()).unwrap();
        atomic_write(&stream, kept_line.as_bytes()).unwrap();

        let report = merge_stream(&store, &stream, &base, &ImportOptions::default()).unwrap();
        assert_eq!(report.deleted, vec![removed.id.clone()]);
        assert_eq!(
            store.require_issue(&removed.id).unwrap().status,
            Status::Tombstone
        );
        assert_eq!(store.require_issue(&kept.id).unwrap().status, Status::Open);
    }

    #[test]
    fn merge_respects_local_modifications_over_deletion() {
        let (_tmp, store, stream, base) = setup();
        let cancel = Cancel::new();
        let local = store
            .create_issue(
                &NewIssue {
                    title: "Edited here".to_string(),
                    ..NewIssue::default()
                },
                "t",
                &cancel,
            )
            .unwrap();
        export_incremental(&store, &stream, &ExportOptions::default()).unwrap();
        save_snapshot(&store, &base).unwrap();

        // Local edit after the snapshot; remote deleted the issue.
        store
            .update_issue(
                &local.id,
                &crate::storage::IssueUpdate {
                    title: Some("Edited here v2".to_string()),
                    ..Default::default()
                },
                "t",
                &cancel,
            )
            .unwrap();
        atomic_write(&stream, b"").unwrap();

        let report = merge_stream(&store, &stream, &base, &ImportOptions::default()).unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(store.require_issue(&local.id).unwrap().title, "Edited here v2");
    }

    #[test]
    fn merge_never_resurrects_local_tombstones() {
        let (_tmp, store, stream, base) = setup();
        let cancel = Cancel::new();
        let doomed = store
            .create_issue(
                &NewIssue {
                    title: "Doomed".to_string(),
                    ..NewIssue::default()
                },
                "t",
                &cancel,
            )
            .unwrap();
        export_incremental(&store, &stream, &ExportOptions::default()).unwrap();
        save_snapshot(&store, &base).unwrap();
        store.delete_issue(&doomed.id, None, "t", &cancel).unwrap();

        // Remote still carries the live version, even newer.
        let mut remote = issue(&doomed.id, "Back from the dead");
        remote.updated_at = Utc::now() + chrono::Duration::hours(2);
        atomic_write(&stream, serde_json::to_string(&remote).unwrap().as_bytes()).unwrap();

        let report = merge_stream(&store, &stream, &base, &ImportOptions::default()).unwrap();
        assert_eq!(report.tombstone_protected, 1);
        assert_eq!(
            store.require_issue(&doomed.id).unwrap().status,
            Status::Tombstone
        );
    }

    #[test]
    fn protection_takes_precedence_over_merge() {
        let (_tmp, store, stream, base) = setup();
        let cancel = Cancel::new();
        let guarded = store
            .create_issue(
                &NewIssue {
                    title: "Guarded".to_string(),
                    ..NewIssue::default()
                },
                "t",
                &cancel,
            )
            .unwrap();
        export_incremental(&store, &stream, &ExportOptions::default()).unwrap();
        save_snapshot(&store, &base).unwrap();

        let guard_time = Utc::now() + chrono::Duration::hours(3);
        let protected = serde_json::json!({ guarded.id.clone(): time::to_rfc3339(guard_time) });
        store
            .set_metadata(META_PROTECTED_IDS, &protected.to_string(), &cancel)
            .unwrap();

        // Remote change that the merge itself would take (local untouched).
        let mut remote = store.require_issue(&guarded.id).unwrap();
        remote.title = "Overwritten".to_string();
        remote.updated_at = Utc::now() + chrono::Duration::hours(1);
        atomic_write(&stream, serde_json::to_string(&remote).unwrap().as_bytes()).unwrap();

        let report = merge_stream(&store, &stream, &base, &ImportOptions::default()).unwrap();
        assert_eq!(report.protected_local, 1);
        assert_eq!(store.require_issue(&guarded.id).unwrap().title, "Guarded");
    }
}
