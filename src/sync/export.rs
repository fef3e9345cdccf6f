//! Export pipeline: serialize issues to the JSONL stream.
//!
//! The stream is one JSON object per line, UTF-8, no trailing newline.
//! Tombstones are exported so peers learn of deletions; ephemeral issues
//! never leave the store. Writes are atomic: a sibling temp file is
//! flushed, fsynced, then renamed over the target.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::model::Issue;
use crate::storage::SqliteStore;
use crate::sync::{
    read_stream, ExportErrorPolicy, ExportOptions, ExportReport, META_LAST_EXPORT,
    META_STREAM_HASH, STREAM_BUFFER,
};
use crate::util::hash::content_hash;
use crate::util::time;

/// Export only what changed: walk the dirty queue, drop entries whose
/// content already matches the export ledger, merge the rest into the
/// existing stream, and settle the ledger.
pub fn export_incremental(
    store: &SqliteStore,
    stream_path: &Path,
    options: &ExportOptions,
) -> Result<ExportReport> {
    let mut report = ExportReport::default();

    // Step 1: dirty IDs in FIFO order.
    let dirty = store.dirty_ids()?;
    if dirty.is_empty() {
        tracing::debug!("nothing dirty; export is a no-op");
        return Ok(report);
    }

    // Step 2: keep only issues whose content differs from the ledger.
    let mut to_write: Vec<Issue> = Vec::new();
    let mut settled: Vec<String> = Vec::new();
    for issue_id in &dirty {
        options.cancel.check()?;
        let loaded = load_with_policy(store, issue_id, options, &mut report)?;
        let Some(issue) = loaded else {
            // Vanished (hard-deleted) or tolerated failure; nothing to write.
            settled.push(issue_id.clone());
            continue;
        };
        let current = content_hash(&issue);
        if store.export_hash(issue_id)?.as_deref() == Some(current.as_str()) {
            report.unchanged += 1;
            settled.push(issue_id.clone());
            continue;
        }
        to_write.push(issue);
    }

    if to_write.is_empty() {
        store.clear_dirty(&settled, &options.cancel)?;
        return Ok(report);
    }

    // Step 3: merge the deltas into the existing stream.
    let existing = read_stream(stream_path)?;
    let mut replacements: HashMap<String, Issue> = to_write
        .iter()
        .map(|i| (i.id.clone(), i.clone()))
        .collect();
    let mut merged: Vec<Issue> = Vec::with_capacity(existing.len() + to_write.len());
    for line_issue in existing {
        match replacements.remove(&line_issue.id) {
            Some(updated) => merged.push(updated),
            None => merged.push(line_issue),
        }
    }
    // Append the genuinely new ones in dirty order.
    for issue in &to_write {
        if replacements.remove(&issue.id).is_some() {
            merged.push(issue.clone());
        }
    }

    let stream_hash = write_stream_with_retry(stream_path, &merged, options)?;

    // Step 4: settle the ledger and the dirty queue.
    let entries: Vec<(String, String)> = to_write
        .iter()
        .map(|i| (i.id.clone(), content_hash(i)))
        .collect();
    store.set_export_hashes(&entries, &options.cancel)?;
    let mut cleared: Vec<String> = settled;
    cleared.extend(to_write.iter().map(|i| i.id.clone()));
    store.clear_dirty(&cleared, &options.cancel)?;

    // Step 5: stream metadata.
    store.set_metadata(META_STREAM_HASH, &stream_hash, &options.cancel)?;
    store.set_metadata(
        META_LAST_EXPORT,
        &time::to_rfc3339(Utc::now()),
        &options.cancel,
    )?;

    if options.write_manifest {
        write_manifest(stream_path, merged.len(), &stream_hash)?;
    }

    report.exported = to_write.into_iter().map(|i| i.id).collect();
    report.stream_hash = Some(stream_hash);
    tracing::debug!(
        exported = report.exported.len(),
        unchanged = report.unchanged,
        "incremental export finished"
    );
    Ok(report)
}

/// Export the whole store, replacing the stream file.
pub fn export_full(
    store: &SqliteStore,
    stream_path: &Path,
    options: &ExportOptions,
) -> Result<ExportReport> {
    let mut report = ExportReport::default();
    let issues = store.exportable_issues()?;

    if !options.force {
        guard_against_data_loss(&issues, stream_path)?;
    }

    let stream_hash = write_stream_with_retry(stream_path, &issues, options)?;

    let entries: Vec<(String, String)> = issues
        .iter()
        .map(|i| (i.id.clone(), content_hash(i)))
        .collect();
    store.set_export_hashes(&entries, &options.cancel)?;
    let dirty = store.dirty_ids()?;
    store.clear_dirty(&dirty, &options.cancel)?;
    store.set_metadata(META_STREAM_HASH, &stream_hash, &options.cancel)?;
    store.set_metadata(
        META_LAST_EXPORT,
        &time::to_rfc3339(Utc::now()),
        &options.cancel,
    )?;

    if options.write_manifest {
        write_manifest(stream_path, issues.len(), &stream_hash)?;
    }

    report.exported = issues.into_iter().map(|i| i.id).collect();
    report.stream_hash = Some(stream_hash);
    Ok(report)
}

/// Refuse exports that would silently lose data: an empty store over a
/// non-empty stream, or a store missing IDs the stream still carries.
fn guard_against_data_loss(issues: &[Issue], stream_path: &Path) -> Result<()> {
    if !stream_path.exists() {
        return Ok(());
    }
    let existing = read_stream(stream_path)?;
    if existing.is_empty() {
        return Ok(());
    }
    if issues.is_empty() {
        return Err(Error::Config(format!(
            "refusing to export an empty store over {} issues in {}; import first or force",
            existing.len(),
            stream_path.display()
        )));
    }
    let db_ids: HashSet<&str> = issues.iter().map(|i| i.id.as_str()).collect();
    let mut missing: Vec<&str> = existing
        .iter()
        .map(|i| i.id.as_str())
        .filter(|id| !db_ids.contains(id))
        .collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        missing.truncate(10);
        return Err(Error::Config(format!(
            "refusing to export: {} stream issue(s) missing from the store (e.g. {}); import first or force",
            missing.len(),
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Load an issue for export, applying the error policy to failures.
fn load_with_policy(
    store: &SqliteStore,
    issue_id: &str,
    options: &ExportOptions,
    report: &mut ExportReport,
) -> Result<Option<Issue>> {
    let mut attempt = 0;
    let mut backoff = Duration::from_millis(options.retry_backoff_ms);
    loop {
        match store.exportable_issue(issue_id) {
            Ok(Some(issue)) => return Ok(Some(issue)),
            Ok(None) => {
                report.vanished += 1;
                return Ok(None);
            }
            Err(e) => {
                match options.policy {
                    ExportErrorPolicy::BestEffort => {
                        tracing::warn!(issue_id, error = %e, "skipping issue after load failure");
                        report.soft_errors.push(format!("{issue_id}: {e}"));
                        return Ok(None);
                    }
                    ExportErrorPolicy::Partial if e.is_transient() && attempt + 1 < options.retry_attempts => {
                        tracing::debug!(issue_id, attempt, "retrying transient export failure");
                        std::thread::sleep(backoff);
                        backoff *= 2;
                        attempt += 1;
                    }
                    // Issues are core entities under every remaining policy.
                    _ => return Err(e),
                }
            }
        }
    }
}

/// Serialize and atomically write the stream, retrying transient I/O
/// failures under the `partial` policy.
fn write_stream_with_retry(
    stream_path: &Path,
    issues: &[Issue],
    options: &ExportOptions,
) -> Result<String> {
    let body = render_stream(issues)?;
    let mut attempt = 0;
    let mut backoff = Duration::from_millis(options.retry_backoff_ms);
    loop {
        options.cancel.check()?;
        match atomic_write(stream_path, body.as_bytes()) {
            Ok(()) => {
                let mut hasher = Sha256::new();
                hasher.update(body.as_bytes());
                return Ok(format!("{:x}", hasher.finalize()));
            }
            Err(e) => {
                if options.policy == ExportErrorPolicy::Partial
                    && e.is_transient()
                    && attempt + 1 < options.retry_attempts
                {
                    tracing::debug!(attempt, error = %e, "retrying stream write");
                    std::thread::sleep(backoff);
                    backoff *= 2;
                    attempt += 1;
                    continue;
                }
                return Err(e);
            }
        }
    }
}

/// One JSON object per line, newline separators only, no trailing newline.
/// serde keeps `<`, `>`, and `&` literal.
fn render_stream(issues: &[Issue]) -> Result<String> {
    let mut lines = Vec::with_capacity(issues.len());
    for issue in issues {
        let line = serde_json::to_string(issue).map_err(|e| {
            Error::Config(format!("failed to serialize {}: {e}", issue.id))
        })?;
        lines.push(line);
    }
    Ok(lines.join("\n"))
}

/// Write-to-temp, flush, fsync, rename. The temp file is removed on error.
pub fn atomic_write(target: &Path, bytes: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| Error::Config(format!("no parent directory for {}", target.display())))?;
    fs::create_dir_all(parent)?;

    let temp = temp_path_for(target);
    let result = (|| -> Result<()> {
        let file = File::create(&temp)?;
        let mut writer = BufWriter::with_capacity(STREAM_BUFFER, file);
        writer.write_all(bytes)?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?
            .sync_all()?;
        fs::rename(&temp, target)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stream".to_string());
    name.push_str(".tmp");
    target.with_file_name(name)
}

/// `.manifest.json` next to the stream: line count, digest, timestamp.
fn write_manifest(stream_path: &Path, issue_count: usize, stream_hash: &str) -> Result<()> {
    let manifest = serde_json::json!({
        "issues": issue_count,
        "sha256": stream_hash,
        "exported_at": time::to_rfc3339(Utc::now()),
    });
    let path = stream_path.with_file_name(".manifest.json");
    atomic_write(&path, manifest.to_string().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NewIssue;
    use crate::sync::digest_file;
    use crate::util::Cancel;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SqliteStore, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open(&tmp.path().join("b.db")).unwrap();
        let stream = tmp.path().join("issues.jsonl");
        (tmp, store, stream)
    }

    fn make(store: &SqliteStore, title: &str) -> Issue {
        store
            .create_issue(
                &NewIssue {
                    title: title.to_string(),
                    ..NewIssue::default()
                },
                "t",
                &Cancel::new(),
            )
            .unwrap()
    }

    #[test]
    fn incremental_export_writes_dirty_and_settles_ledger() {
        let (_tmp, store, stream) = setup();
        let issue = make(&store, "Exported");
        let options = ExportOptions::default();

        let report = export_incremental(&store, &stream, &options).unwrap();
        assert_eq!(report.exported, vec![issue.id.clone()]);
        assert!(store.dirty_ids().unwrap().is_empty());
        assert_eq!(
            store.export_hash(&issue.id).unwrap().as_deref(),
            store.require_issue(&issue.id).unwrap().content_hash.as_deref()
        );
        assert_eq!(
            store.get_metadata(crate::sync::META_STREAM_HASH).unwrap().as_deref(),
            Some(digest_file(&stream).unwrap().as_str())
        );
    }

    #[test]
    fn export_has_no_trailing_newline() {
        let (_tmp, store, stream) = setup();
        make(&store, "One");
        make(&store, "Two");
        export_incremental(&store, &stream, &ExportOptions::default()).unwrap();
        let bytes = fs::read(&stream).unwrap();
        assert!(!bytes.ends_with(b"\n"));
        assert_eq!(bytes.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn html_unsafe_characters_stay_literal() {
        let (_tmp, store, stream) = setup();
        store
            .create_issue(
                &NewIssue {
                    title: "a < b && c > d".to_string(),
                    ..NewIssue::default()
                },
                "t",
                &Cancel::new(),
            )
            .unwrap();
        export_incremental(&store, &stream, &ExportOptions::default()).unwrap();
        let text = fs::read_to_string(&stream).unwrap();
        assert!(text.contains("a < b && c > d"));
        assert!(!text.contains("\\u003c"));
    }

    #[test]
    fn export_twice_is_byte_identical() {
        let (_tmp, store, stream) = setup();
        make(&store, "Stable");
        export_incremental(&store, &stream, &ExportOptions::default()).unwrap();
        let first = fs::read(&stream).unwrap();

        // Nothing dirty: second run must not touch the file.
        let report = export_incremental(&store, &stream, &ExportOptions::default()).unwrap();
        assert!(report.exported.is_empty());
        assert_eq!(fs::read(&stream).unwrap(), first);

        // Full export of the same content is also byte-identical.
        export_full(&store, &stream, &ExportOptions::default()).unwrap();
        assert_eq!(fs::read(&stream).unwrap(), first);
    }

    #[test]
    fn unchanged_dirty_ids_are_settled_without_rewrite() {
        let (_tmp, store, stream) = setup();
        let issue = make(&store, "Same");
        let cancel = Cancel::new();
        export_incremental(&store, &stream, &ExportOptions::default()).unwrap();

        // Touch the issue with a no-op label cycle: add then remove changes
        // the hash twice, ending at the exported value, but leaves a mark.
        store.add_label(&issue.id, "tmp", "t", &cancel).unwrap();
        store.remove_label(&issue.id, "tmp", "t", &cancel).unwrap();
        assert!(!store.dirty_ids().unwrap().is_empty());

        let report = export_incremental(&store, &stream, &ExportOptions::default()).unwrap();
        assert!(report.exported.is_empty());
        assert_eq!(report.unchanged, 1);
        assert!(store.dirty_ids().unwrap().is_empty());
    }

    #[test]
    fn incremental_merge_preserves_unaffected_lines() {
        let (_tmp, store, stream) = setup();
        let a = make(&store, "A");
        let b = make(&store, "B");
        export_incremental(&store, &stream, &ExportOptions::default()).unwrap();

        // Mutate only B; A's line must survive byte-identically in place.
        let before: Vec<String> = fs::read_to_string(&stream)
            .unwrap()
            .lines()
            .map(String::from)
            .collect();
        store
            .update_issue(
                &b.id,
                &crate::storage::IssueUpdate {
                    title: Some("B2".to_string()),
                    ..Default::default()
                },
                "t",
                &Cancel::new(),
            )
            .unwrap();
        export_incremental(&store, &stream, &ExportOptions::default()).unwrap();

        let after: Vec<String> = fs::read_to_string(&stream)
            .unwrap()
            .lines()
            .map(String::from)
            .collect();
        assert_eq!(after.len(), 2);
        let a_before = before.iter().find(|l| l.contains(&a.id)).unwrap();
        let a_after = after.iter().find(|l| l.contains(&a.id)).unwrap();
        assert_eq!(a_before, a_after);
        assert!(after.iter().any(|l| l.contains("B2")));
    }

    #[test]
    fn tombstones_are_exported_ephemerals_are_not() {
        let (_tmp, store, stream) = setup();
        let cancel = Cancel::new();
        let doomed = make(&store, "Doomed");
        store.delete_issue(&doomed.id, None, "t", &cancel).unwrap();
        store
            .create_issue(
                &NewIssue {
                    title: "Wisp".to_string(),
                    ephemeral: true,
                    ..NewIssue::default()
                },
                "t",
                &cancel,
            )
            .unwrap();

        export_incremental(&store, &stream, &ExportOptions::default()).unwrap();
        let text = fs::read_to_string(&stream).unwrap();
        assert!(text.contains("tombstone"));
        assert!(!text.contains("Wisp"));
    }

    #[test]
    fn full_export_guards_refuse_data_loss() {
        let (_tmp, store, stream) = setup();
        fs::write(
            &stream,
            "{\"id\":\"bd-zzz\",\"title\":\"Foreign\",\"created_at\":\"2026-01-01T00:00:00Z\",\"updated_at\":\"2026-01-01T00:00:00Z\"}",
        )
        .unwrap();

        // Empty store over non-empty stream.
        let err = export_full(&store, &stream, &ExportOptions::default());
        assert!(err.is_err());

        // Store with issues but missing a stream ID.
        make(&store, "Local only");
        let err = export_full(&store, &stream, &ExportOptions::default());
        assert!(err.is_err());

        // Force overrides both guards.
        let forced = export_full(
            &store,
            &stream,
            &ExportOptions {
                force: true,
                ..ExportOptions::default()
            },
        );
        assert!(forced.is_ok());
        assert!(!fs::read_to_string(&stream).unwrap().contains("bd-zzz"));
    }

    #[test]
    fn manifest_written_when_enabled() {
        let (tmp, store, stream) = setup();
        make(&store, "With manifest");
        export_incremental(
            &store,
            &stream,
            &ExportOptions {
                write_manifest: true,
                ..ExportOptions::default()
            },
        )
        .unwrap();

        let manifest_path = tmp.path().join(".manifest.json");
        let manifest: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(manifest_path).unwrap()).unwrap();
        assert_eq!(manifest["issues"], 1);
        assert_eq!(
            manifest["sha256"].as_str().unwrap(),
            digest_file(&stream).unwrap()
        );
    }

    #[test]
    fn cancelled_export_leaves_no_temp_file() {
        let (tmp, store, stream) = setup();
        make(&store, "Never exported");
        let options = ExportOptions::default();
        options.cancel.cancel();
        let result = export_incremental(&store, &stream, &options);
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!stream.exists());
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn atomic_write_replaces_existing_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.jsonl");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        assert!(!path.with_file_name("out.jsonl.tmp").exists());
    }
}
