//! Schema definition and forward-only migrations.
//!
//! The schema is created on first open and evolved by an ordered sequence of
//! idempotent migrations. `schema_migrations(version)` records what has been
//! applied; on open, every version greater than the current maximum runs in
//! its own transaction.

use rusqlite::Connection;

use crate::error::Result;

/// Highest migration version this build knows about.
pub const SCHEMA_VERSION: i32 = 3;

struct Migration {
    version: i32,
    sql: &'static str,
}

/// v1: the core entity tables and their invariant checks.
const V1_CORE_TABLES: &str = r"
    CREATE TABLE IF NOT EXISTS issues (
        id TEXT PRIMARY KEY,
        content_hash TEXT,
        title TEXT NOT NULL,
        description TEXT,
        design TEXT,
        acceptance_criteria TEXT,
        notes TEXT,
        status TEXT NOT NULL DEFAULT 'open',
        priority INTEGER NOT NULL DEFAULT 2,
        issue_type TEXT NOT NULL DEFAULT 'task',
        assignee TEXT,
        owner TEXT,
        estimated_minutes INTEGER,
        created_by TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        closed_at TEXT,
        close_reason TEXT,
        closed_by_session TEXT,
        due_at TEXT,
        defer_until TEXT,
        external_ref TEXT,
        source_system TEXT,
        deleted_at TEXT,
        deleted_by TEXT,
        delete_reason TEXT,
        original_type TEXT,
        sender TEXT,
        ephemeral INTEGER NOT NULL DEFAULT 0,
        pinned INTEGER NOT NULL DEFAULT 0,
        is_template INTEGER NOT NULL DEFAULT 0,
        CHECK (length(title) BETWEEN 1 AND 500),
        CHECK (priority BETWEEN 0 AND 4),
        CHECK (
            CASE status
                WHEN 'closed' THEN closed_at IS NOT NULL
                WHEN 'tombstone' THEN 1
                ELSE closed_at IS NULL
            END
        )
    );

    CREATE INDEX IF NOT EXISTS idx_issues_status ON issues(status);
    CREATE INDEX IF NOT EXISTS idx_issues_priority ON issues(priority);
    CREATE INDEX IF NOT EXISTS idx_issues_type ON issues(issue_type);
    CREATE INDEX IF NOT EXISTS idx_issues_assignee ON issues(assignee);
    CREATE INDEX IF NOT EXISTS idx_issues_updated_at ON issues(updated_at);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_issues_external_ref
        ON issues(external_ref) WHERE external_ref IS NOT NULL;

    CREATE TABLE IF NOT EXISTS dependencies (
        issue_id TEXT NOT NULL,
        depends_on_id TEXT NOT NULL,
        type TEXT NOT NULL,
        created_at TEXT NOT NULL,
        created_by TEXT,
        metadata TEXT,
        thread_id TEXT,
        PRIMARY KEY (issue_id, depends_on_id),
        CHECK (issue_id <> depends_on_id)
    );
    CREATE INDEX IF NOT EXISTS idx_dependencies_depends_on
        ON dependencies(depends_on_id);
    CREATE INDEX IF NOT EXISTS idx_dependencies_type ON dependencies(type);

    CREATE TABLE IF NOT EXISTS labels (
        issue_id TEXT NOT NULL,
        label TEXT NOT NULL,
        PRIMARY KEY (issue_id, label),
        FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_labels_label ON labels(label);

    CREATE TABLE IF NOT EXISTS comments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        issue_id TEXT NOT NULL,
        author TEXT NOT NULL,
        text TEXT NOT NULL,
        created_at TEXT NOT NULL,
        FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_comments_issue_id ON comments(issue_id);

    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        issue_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        actor TEXT NOT NULL,
        old_value TEXT,
        new_value TEXT,
        comment TEXT,
        created_at TEXT NOT NULL,
        FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_events_issue_id ON events(issue_id);
    CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);

    CREATE TABLE IF NOT EXISTS config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

/// v2: sync machinery (dirty queue, export ledger, blocked cache, child
/// counters).
const V2_SYNC_TABLES: &str = r"
    CREATE TABLE IF NOT EXISTS dirty_issues (
        issue_id TEXT PRIMARY KEY,
        marked_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_dirty_issues_marked_at
        ON dirty_issues(marked_at);

    CREATE TABLE IF NOT EXISTS export_hashes (
        issue_id TEXT PRIMARY KEY,
        content_hash TEXT NOT NULL,
        exported_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS blocked_cache (
        issue_id TEXT PRIMARY KEY,
        blocked_by TEXT NOT NULL,
        blocked_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS child_counters (
        parent_id TEXT PRIMARY KEY,
        last_child_number INTEGER NOT NULL DEFAULT 0
    );
";

/// v3: hot-path indexes for the ready query and blocking-edge scans.
const V3_HOT_PATH_INDEXES: &str = r"
    CREATE INDEX IF NOT EXISTS idx_issues_ready
        ON issues(status, priority, created_at)
        WHERE status IN ('open', 'in_progress')
          AND ephemeral = 0 AND pinned = 0;

    CREATE INDEX IF NOT EXISTS idx_dependencies_blocking
        ON dependencies(depends_on_id, issue_id)
        WHERE type IN ('blocks', 'parent-child', 'conditional-blocks', 'waits-for');

    CREATE INDEX IF NOT EXISTS idx_issues_due_at ON issues(due_at);
    CREATE INDEX IF NOT EXISTS idx_issues_defer_until ON issues(defer_until);
    CREATE INDEX IF NOT EXISTS idx_issues_content_hash ON issues(content_hash);
";

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: V1_CORE_TABLES,
    },
    Migration {
        version: 2,
        sql: V2_SYNC_TABLES,
    },
    Migration {
        version: 3,
        sql: V3_HOT_PATH_INDEXES,
    },
];

/// Current applied version, 0 for a fresh database.
pub fn applied_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY)",
        [],
    )?;
    let version: Option<i32> = conn.query_row(
        "SELECT MAX(version) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;
    Ok(version.unwrap_or(0))
}

/// Apply all migrations newer than the recorded version, each in its own
/// transaction.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    let current = applied_version(conn)?;

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?)",
            [migration.version],
        )?;
        tx.commit()?;
        tracing::debug!(version = migration.version, "applied schema migration");
    }

    Ok(())
}
