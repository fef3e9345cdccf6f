//! Workspace layout and ownership.
//!
//! All engine state lives under a `.beads/` directory: the database, the
//! JSONL export stream, the optional three-way-merge snapshot, and the
//! project config file. The engine is non-invasive: it writes only inside
//! this directory and only when asked.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{Error, Result};

/// Directory name holding all engine state.
pub const WORKSPACE_DIR: &str = ".beads";

/// Database file name.
pub const DB_FILENAME: &str = "beads.db";

/// Preferred export stream name.
pub const STREAM_FILENAME: &str = "issues.jsonl";

/// Legacy export stream name, read but not preferred.
pub const LEGACY_STREAM_FILENAME: &str = "beads.jsonl";

/// Snapshot used as the base of three-way merges.
pub const SYNC_BASE_FILENAME: &str = "sync_base.jsonl";

/// Stream names that must never be chosen as the export stream.
const EXCLUDED_STREAM_NAMES: &[&str] = &["deletions.jsonl", "interactions.jsonl"];

/// A located `.beads/` workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    /// Wrap an existing `.beads/` directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(Error::WorkspaceNotFound { path: dir });
        }
        Ok(Self { dir })
    }

    /// Walk up from `start` looking for a `.beads/` directory.
    pub fn discover(start: &Path) -> Result<Self> {
        let mut current = Some(start);
        while let Some(dir) = current {
            let candidate = dir.join(WORKSPACE_DIR);
            if candidate.is_dir() {
                return Ok(Self { dir: candidate });
            }
            current = dir.parent();
        }
        Err(Error::WorkspaceNotFound {
            path: start.to_path_buf(),
        })
    }

    /// Create a fresh workspace under `parent`, including a `.gitignore`
    /// that keeps the database and transient files out of version control.
    pub fn init(parent: &Path) -> Result<Self> {
        let dir = parent.join(WORKSPACE_DIR);
        fs::create_dir_all(&dir)?;

        let gitignore = dir.join(".gitignore");
        if !gitignore.exists() {
            fs::write(
                &gitignore,
                "beads.db\nbeads.db-wal\nbeads.db-shm\n*.lock\n*.tmp\nsync_base.jsonl\n",
            )?;
        }

        Ok(Self { dir })
    }

    /// The `.beads/` directory itself.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.dir.join(DB_FILENAME)
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.dir.join("config.yaml")
    }

    #[must_use]
    pub fn sync_base_path(&self) -> PathBuf {
        self.dir.join(SYNC_BASE_FILENAME)
    }

    /// Resolve the export stream: prefer `issues.jsonl`, fall back to the
    /// legacy `beads.jsonl`, and default to `issues.jsonl` for new files.
    /// Deletion logs, interaction logs, and merge artifacts are never chosen.
    #[must_use]
    pub fn stream_path(&self) -> PathBuf {
        let preferred = self.dir.join(STREAM_FILENAME);
        if preferred.exists() {
            return preferred;
        }
        let legacy = self.dir.join(LEGACY_STREAM_FILENAME);
        if legacy.exists() {
            return legacy;
        }
        preferred
    }

    /// Whether a file name is eligible to act as the export stream.
    #[must_use]
    pub fn is_stream_candidate(name: &str) -> bool {
        if !name.ends_with(".jsonl") {
            return false;
        }
        if EXCLUDED_STREAM_NAMES.contains(&name) || name == SYNC_BASE_FILENAME {
            return false;
        }
        // Merge artifacts: foo.base.jsonl / foo.left.jsonl / foo.right.jsonl
        let stem = name.trim_end_matches(".jsonl");
        !(stem.ends_with(".base") || stem.ends_with(".left") || stem.ends_with(".right"))
    }

    /// Take the per-database advisory lock. One process owns the workspace
    /// at a time; drop the guard to release.
    pub fn lock(&self, timeout: Duration) -> Result<WorkspaceLock> {
        WorkspaceLock::acquire(&self.dir.join(format!("{DB_FILENAME}.lock")), timeout)
    }

    /// Open this workspace's store with ID parameters from its config.
    pub fn open_store(&self, config: &crate::config::Config) -> Result<crate::storage::SqliteStore> {
        crate::storage::SqliteStore::open_with_ids(&self.db_path(), config.id_config())
    }
}

/// Advisory exclusive lock on the workspace database.
///
/// Held for the lifetime of the value; released on drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    })
                }
                Err(_) if start.elapsed() < timeout => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(_) => {
                    return Err(Error::Locked {
                        path: path.to_path_buf(),
                    })
                }
            }
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn init_creates_dir_and_gitignore() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::init(tmp.path()).unwrap();
        assert!(ws.dir().is_dir());
        let gitignore = std::fs::read_to_string(ws.dir().join(".gitignore")).unwrap();
        assert!(gitignore.contains("beads.db"));
        assert!(gitignore.contains("sync_base.jsonl"));
    }

    #[test]
    fn discover_walks_up() {
        let tmp = TempDir::new().unwrap();
        Workspace::init(tmp.path()).unwrap();
        let nested = tmp.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        let found = Workspace::discover(&nested).unwrap();
        assert_eq!(found.dir(), tmp.path().join(WORKSPACE_DIR));
    }

    #[test]
    fn discover_fails_without_workspace() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            Workspace::discover(tmp.path()),
            Err(Error::WorkspaceNotFound { .. })
        ));
    }

    #[test]
    fn stream_prefers_issues_then_legacy() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::init(tmp.path()).unwrap();

        // Nothing on disk: default to issues.jsonl.
        assert_eq!(ws.stream_path(), ws.dir().join(STREAM_FILENAME));

        std::fs::write(ws.dir().join(LEGACY_STREAM_FILENAME), "").unwrap();
        assert_eq!(ws.stream_path(), ws.dir().join(LEGACY_STREAM_FILENAME));

        std::fs::write(ws.dir().join(STREAM_FILENAME), "").unwrap();
        assert_eq!(ws.stream_path(), ws.dir().join(STREAM_FILENAME));
    }

    #[test]
    fn excluded_names_are_never_streams() {
        assert!(Workspace::is_stream_candidate("issues.jsonl"));
        assert!(Workspace::is_stream_candidate("beads.jsonl"));
        assert!(!Workspace::is_stream_candidate("deletions.jsonl"));
        assert!(!Workspace::is_stream_candidate("interactions.jsonl"));
        assert!(!Workspace::is_stream_candidate("sync_base.jsonl"));
        assert!(!Workspace::is_stream_candidate("issues.base.jsonl"));
        assert!(!Workspace::is_stream_candidate("issues.left.jsonl"));
        assert!(!Workspace::is_stream_candidate("issues.right.jsonl"));
        assert!(!Workspace::is_stream_candidate("notes.txt"));
    }

    #[test]
    fn open_store_uses_configured_prefix() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::init(tmp.path()).unwrap();
        std::fs::write(ws.config_path(), "issue_prefix: qa\n").unwrap();
        let config =
            crate::config::Config::load(ws.dir(), &std::collections::HashMap::new()).unwrap();
        let store = ws.open_store(&config).unwrap();
        assert_eq!(store.id_prefix(), "qa");
        assert!(ws.db_path().exists());
    }

    #[test]
    fn lock_excludes_second_holder() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::init(tmp.path()).unwrap();
        let guard = ws.lock(Duration::from_millis(100)).unwrap();
        let second = ws.lock(Duration::from_millis(100));
        assert!(matches!(second, Err(Error::Locked { .. })));
        drop(guard);
        assert!(ws.lock(Duration::from_millis(100)).is_ok());
    }
}
