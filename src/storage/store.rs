//! The SQLite-backed store.
//!
//! Every mutation follows the same protocol: validate, stamp `updated_at`,
//! recompute the content hash, append the audit event, upsert the dirty
//! mark, and invalidate the blocked cache when the change could affect
//! blocking. Events and dirty marks land in the same transaction as the
//! mutation itself.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::error::{Error, Result};
use crate::graph;
use crate::model::{
    Comment, Dependency, DependencyType, EpicStatus, Event, EventType, Issue, IssueType, Priority,
    Status,
};
use crate::storage::events;
use crate::storage::pool::{ConnectionPool, StoreLocation};
use crate::util::hash::content_hash;
use crate::util::id::{self, IdConfig, IdGenerator, IdResolver, IdSeed, MAX_CHILD_DEPTH};
use crate::util::{time, Cancel};
use crate::validation;

/// Lock-retry schedule: exponential backoff from 10 ms, doubling, capped at
/// 5 s, for up to 10 attempts.
const TX_RETRY_ATTEMPTS: u32 = 10;
const TX_RETRY_BASE: Duration = Duration::from_millis(10);
const TX_RETRY_CAP: Duration = Duration::from_secs(5);

const ISSUE_COLUMNS: &str = "id, content_hash, title, description, design, acceptance_criteria, \
     notes, status, priority, issue_type, assignee, owner, estimated_minutes, created_by, \
     created_at, updated_at, closed_at, close_reason, closed_by_session, due_at, defer_until, \
     external_ref, source_system, deleted_at, deleted_by, delete_reason, original_type, sender, \
     ephemeral, pinned, is_template";

/// SQLite-backed storage engine.
///
/// Operations take the read side of the reconnect lock; `reset` takes the
/// write side, so a reconnect never races an in-flight query.
#[derive(Debug)]
pub struct SqliteStore {
    pool: ConnectionPool,
    reconnect: RwLock<()>,
    workspace_id: String,
    id_generator: IdGenerator,
}

/// Side effects accumulated by a mutation closure.
pub struct MutationCtx {
    actor: String,
    events: Vec<Event>,
    dirty: HashSet<String>,
    rebuild_cache: bool,
}

impl MutationCtx {
    fn new(actor: &str) -> Self {
        Self {
            actor: actor.to_string(),
            events: Vec::new(),
            dirty: HashSet::new(),
            rebuild_cache: false,
        }
    }

    /// Queue an audit event for the commit.
    pub fn record_event(
        &mut self,
        event_type: EventType,
        issue_id: &str,
        old_value: Option<String>,
        new_value: Option<String>,
        comment: Option<String>,
    ) {
        self.events.push(Event {
            id: 0,
            issue_id: issue_id.to_string(),
            event_type,
            actor: self.actor.clone(),
            old_value,
            new_value,
            comment,
            created_at: Utc::now(),
        });
    }

    /// Queue a dirty mark for the commit.
    pub fn mark_dirty(&mut self, issue_id: &str) {
        self.dirty.insert(issue_id.to_string());
    }

    /// Request a blocked-cache rebuild inside the same transaction.
    pub fn invalidate_blocked_cache(&mut self) {
        self.rebuild_cache = true;
    }
}

/// Fields to create a new issue with. Unset classification fields fall back
/// to the configured defaults at the call site.
#[derive(Debug, Clone, Default)]
pub struct NewIssue {
    pub title: String,
    pub description: Option<String>,
    pub design: Option<String>,
    pub acceptance_criteria: Option<String>,
    pub notes: Option<String>,
    pub priority: Priority,
    pub issue_type: IssueType,
    pub assignee: Option<String>,
    pub owner: Option<String>,
    pub created_by: Option<String>,
    pub estimated_minutes: Option<i32>,
    pub due_at: Option<DateTime<Utc>>,
    pub defer_until: Option<DateTime<Utc>>,
    pub external_ref: Option<String>,
    pub source_system: Option<String>,
    pub sender: Option<String>,
    pub ephemeral: bool,
    pub pinned: bool,
    pub is_template: bool,
    pub labels: Vec<String>,
    /// When set, the new issue becomes the next numbered child of this
    /// parent and gains a `parent-child` edge to it.
    pub parent: Option<String>,
    /// Explicit ID; generated when empty.
    pub id: Option<String>,
}

/// Field updates for an existing issue. `None` leaves a field untouched; the
/// inner `Option` distinguishes "set" from "clear".
#[derive(Debug, Clone, Default)]
pub struct IssueUpdate {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub design: Option<Option<String>>,
    pub acceptance_criteria: Option<Option<String>>,
    pub notes: Option<Option<String>>,
    pub status: Option<Status>,
    pub priority: Option<Priority>,
    pub issue_type: Option<IssueType>,
    pub assignee: Option<Option<String>>,
    pub owner: Option<Option<String>>,
    pub estimated_minutes: Option<Option<i32>>,
    pub due_at: Option<Option<DateTime<Utc>>>,
    pub defer_until: Option<Option<DateTime<Utc>>>,
    pub external_ref: Option<Option<String>>,
    pub source_system: Option<Option<String>>,
}

impl IssueUpdate {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.design.is_none()
            && self.acceptance_criteria.is_none()
            && self.notes.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.issue_type.is_none()
            && self.assignee.is_none()
            && self.owner.is_none()
            && self.estimated_minutes.is_none()
            && self.due_at.is_none()
            && self.defer_until.is_none()
            && self.external_ref.is_none()
            && self.source_system.is_none()
    }
}

/// Filters for listing issues.
#[derive(Debug, Clone, Default)]
pub struct ListFilters {
    pub statuses: Option<Vec<Status>>,
    pub types: Option<Vec<IssueType>>,
    pub priorities: Option<Vec<Priority>>,
    pub assignee: Option<String>,
    pub labels_all: Vec<String>,
    pub labels_any: Vec<String>,
    pub include_tombstones: bool,
    pub include_ephemeral: bool,
    pub limit: Option<usize>,
}

/// Aggregate counts. `blocked` uses the blocked cache (full semantics);
/// `blocked_legacy` counts only `blocks` edges with non-terminal blockers,
/// matching older tooling. The ready count uses the strict predicate.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Stats {
    pub open: usize,
    pub in_progress: usize,
    pub closed: usize,
    pub tombstoned: usize,
    pub ready: usize,
    pub blocked: usize,
    pub blocked_legacy: usize,
}

impl SqliteStore {
    /// Open (or create) a file-backed store.
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_location(StoreLocation::File(path.to_path_buf()), IdConfig::default())
    }

    /// Open a file-backed store with explicit ID parameters.
    pub fn open_with_ids(path: &Path, ids: IdConfig) -> Result<Self> {
        Self::from_location(StoreLocation::File(path.to_path_buf()), ids)
    }

    /// Open an in-memory store (tests, scratch work).
    pub fn open_memory() -> Result<Self> {
        Self::from_location(StoreLocation::Memory, IdConfig::default())
    }

    fn from_location(location: StoreLocation, ids: IdConfig) -> Result<Self> {
        let pool = ConnectionPool::open(location)?;
        let workspace_id = {
            let conn = pool.checkout()?;
            ensure_workspace_id(&conn)?
        };
        Ok(Self {
            pool,
            reconnect: RwLock::new(()),
            workspace_id,
            id_generator: IdGenerator::new(ids),
        })
    }

    /// Stable identifier of this workspace, mixed into ID seeds.
    #[must_use]
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    #[must_use]
    pub fn id_prefix(&self) -> &str {
        self.id_generator.prefix()
    }

    /// Run a read-only closure against a pooled connection.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let _guard = self
            .reconnect
            .read()
            .map_err(|_| Error::Config("reconnect lock poisoned".into()))?;
        let conn = self.pool.checkout()?;
        f(&conn)
    }

    /// Run a mutation under the four-step protocol: the closure performs its
    /// writes and records side effects; the store then persists events and
    /// dirty marks and rebuilds the blocked cache when requested, all inside
    /// one immediate transaction.
    pub fn mutate<R>(
        &self,
        actor: &str,
        cancel: &Cancel,
        f: impl FnOnce(&Transaction<'_>, &mut MutationCtx) -> Result<R>,
    ) -> Result<R> {
        let _guard = self
            .reconnect
            .read()
            .map_err(|_| Error::Config("reconnect lock poisoned".into()))?;
        let mut conn = self.pool.checkout()?;
        let tx = begin_immediate(&mut conn, cancel)?;
        let mut ctx = MutationCtx::new(actor);

        let result = f(&tx, &mut ctx)?;

        for event in &ctx.events {
            events::insert_event(&tx, event)?;
        }
        let now = time::to_rfc3339(Utc::now());
        for issue_id in &ctx.dirty {
            tx.execute(
                "INSERT OR REPLACE INTO dirty_issues (issue_id, marked_at) VALUES (?, ?)",
                rusqlite::params![issue_id, now],
            )?;
        }
        if ctx.rebuild_cache {
            graph::rebuild_blocked_cache_tx(&tx)?;
        }

        tx.commit()?;
        Ok(result)
    }

    /// Drop and reopen the connection pool after a fatal error. Exclusive
    /// with every other operation.
    pub fn reset_connections(&self) -> Result<()> {
        let _guard = self
            .reconnect
            .write()
            .map_err(|_| Error::Config("reconnect lock poisoned".into()))?;
        self.pool.reset()
    }

    // ========================================================================
    // Issue CRUD
    // ========================================================================

    /// Create an issue, generating its ID unless one is supplied.
    pub fn create_issue(&self, new: &NewIssue, actor: &str, cancel: &Cancel) -> Result<Issue> {
        let now = Utc::now();
        let mut issue = Issue {
            id: new.id.clone().unwrap_or_default(),
            title: new.title.clone(),
            description: new.description.clone(),
            design: new.design.clone(),
            acceptance_criteria: new.acceptance_criteria.clone(),
            notes: new.notes.clone(),
            priority: new.priority,
            issue_type: new.issue_type,
            assignee: new.assignee.clone(),
            owner: new.owner.clone(),
            created_by: new.created_by.clone(),
            estimated_minutes: new.estimated_minutes,
            created_at: now,
            updated_at: now,
            due_at: new.due_at,
            defer_until: new.defer_until,
            external_ref: new.external_ref.clone(),
            source_system: new.source_system.clone(),
            sender: new.sender.clone(),
            ephemeral: new.ephemeral,
            pinned: new.pinned,
            is_template: new.is_template,
            labels: new.labels.clone(),
            ..Issue::default()
        };

        let parent = new.parent.clone();
        self.mutate(actor, cancel, |tx, ctx| {
            if let Some(parent_id) = &parent {
                if !issue_exists_tx(tx, parent_id)? {
                    return Err(Error::NotFound {
                        id: parent_id.clone(),
                    });
                }
                if id::id_depth(parent_id) >= MAX_CHILD_DEPTH {
                    return Err(Error::validation(
                        "parent",
                        format!("child depth limit is {MAX_CHILD_DEPTH}"),
                    ));
                }
                let n = next_child_number(tx, parent_id)?;
                issue.id = id::child_id(parent_id, n);
            } else if issue.id.is_empty() {
                let count = count_issues_tx(tx)?;
                let seed = IdSeed {
                    title: &issue.title,
                    description: issue.description.as_deref(),
                    creator: issue.created_by.as_deref(),
                    created_at: issue.created_at,
                    workspace_id: &self.workspace_id,
                };
                issue.id = self.id_generator.generate(&seed, count, |candidate| {
                    issue_exists_tx(tx, candidate).unwrap_or(false)
                });
            }

            validation::validate_issue(&issue)?;
            issue.content_hash = Some(content_hash(&issue));

            insert_issue_tx(tx, &issue)?;
            for label in &issue.labels {
                tx.execute(
                    "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?, ?)",
                    rusqlite::params![issue.id, label],
                )?;
            }
            if let Some(parent_id) = &parent {
                let dep = Dependency::new(&issue.id, parent_id, DependencyType::ParentChild);
                insert_dependency_tx(tx, &dep)?;
                ctx.invalidate_blocked_cache();
            }

            ctx.record_event(
                EventType::Created,
                &issue.id,
                None,
                None,
                Some(format!("created: {}", issue.title)),
            );
            ctx.mark_dirty(&issue.id);
            Ok(())
        })?;

        self.get_issue_full(&issue.id)?
            .ok_or(Error::NotFound { id: issue.id })
    }

    /// Fetch an issue by exact ID.
    pub fn get_issue(&self, issue_id: &str) -> Result<Option<Issue>> {
        self.read(|conn| get_issue_conn(conn, issue_id))
    }

    /// Fetch an issue with its labels, dependencies, and comments attached.
    pub fn get_issue_full(&self, issue_id: &str) -> Result<Option<Issue>> {
        self.read(|conn| {
            let Some(mut issue) = get_issue_conn(conn, issue_id)? else {
                return Ok(None);
            };
            issue.labels = labels_conn(conn, issue_id)?;
            issue.dependencies = dependencies_conn(conn, issue_id)?;
            issue.comments = comments_conn(conn, issue_id)?;
            Ok(Some(issue))
        })
    }

    /// Fetch by exact ID, erroring when absent.
    pub fn require_issue(&self, issue_id: &str) -> Result<Issue> {
        self.get_issue(issue_id)?.ok_or_else(|| Error::NotFound {
            id: issue_id.to_string(),
        })
    }

    /// Resolve user input (full ID, bare hash, substring) to a known ID.
    pub fn resolve_id(&self, input: &str) -> Result<String> {
        let all_ids = self.all_ids()?;
        let resolver = IdResolver::new(self.id_generator.prefix());
        resolver.resolve(
            input,
            |candidate| all_ids.iter().any(|id| id == candidate),
            |pattern| id::ids_matching_hash(&all_ids, pattern),
        )
    }

    pub fn id_exists(&self, issue_id: &str) -> Result<bool> {
        self.read(|conn| issue_exists_tx(conn, issue_id))
    }

    pub fn all_ids(&self) -> Result<Vec<String>> {
        self.read(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM issues ORDER BY id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
    }

    pub fn count_issues(&self) -> Result<usize> {
        self.read(|conn| count_issues_tx(conn))
    }

    /// Apply field updates; stamps `updated_at`, recomputes the hash, and
    /// emits per-field events. Transitions into or out of terminal states
    /// must use `close_issue`, `reopen_issue`, or `delete_issue`.
    pub fn update_issue(
        &self,
        issue_id: &str,
        updates: &IssueUpdate,
        actor: &str,
        cancel: &Cancel,
    ) -> Result<Issue> {
        let mut issue = self.require_issue(issue_id)?;
        if updates.is_empty() {
            return Ok(issue);
        }

        if let Some(status) = updates.status {
            if status.is_terminal() || issue.status.is_terminal() {
                return Err(Error::validation(
                    "status",
                    "terminal transitions go through close/reopen/delete",
                ));
            }
        }

        self.mutate(actor, cancel, |tx, ctx| {
            if let Some(title) = &updates.title {
                if title != &issue.title {
                    ctx.record_event(
                        EventType::Updated,
                        issue_id,
                        Some(issue.title.clone()),
                        Some(title.clone()),
                        Some("title".to_string()),
                    );
                }
                issue.title.clone_from(title);
            }
            if let Some(value) = &updates.description {
                issue.description.clone_from(value);
            }
            if let Some(value) = &updates.design {
                issue.design.clone_from(value);
            }
            if let Some(value) = &updates.acceptance_criteria {
                issue.acceptance_criteria.clone_from(value);
            }
            if let Some(value) = &updates.notes {
                issue.notes.clone_from(value);
            }
            if let Some(status) = updates.status {
                if status != issue.status {
                    ctx.record_event(
                        EventType::StatusChanged,
                        issue_id,
                        Some(issue.status.as_str().to_string()),
                        Some(status.as_str().to_string()),
                        None,
                    );
                    ctx.invalidate_blocked_cache();
                }
                issue.status = status;
            }
            if let Some(priority) = updates.priority {
                if priority != issue.priority {
                    ctx.record_event(
                        EventType::PriorityChanged,
                        issue_id,
                        Some(issue.priority.0.to_string()),
                        Some(priority.0.to_string()),
                        None,
                    );
                }
                issue.priority = priority;
            }
            if let Some(issue_type) = updates.issue_type {
                issue.issue_type = issue_type;
            }
            if let Some(assignee) = &updates.assignee {
                if assignee != &issue.assignee {
                    ctx.record_event(
                        EventType::AssigneeChanged,
                        issue_id,
                        issue.assignee.clone(),
                        assignee.clone(),
                        None,
                    );
                }
                issue.assignee.clone_from(assignee);
            }
            if let Some(owner) = &updates.owner {
                issue.owner.clone_from(owner);
            }
            if let Some(minutes) = updates.estimated_minutes {
                issue.estimated_minutes = minutes;
            }
            if let Some(due) = updates.due_at {
                issue.due_at = due;
            }
            if let Some(defer) = updates.defer_until {
                issue.defer_until = defer;
            }
            if let Some(external_ref) = &updates.external_ref {
                issue.external_ref.clone_from(external_ref);
            }
            if let Some(source) = &updates.source_system {
                issue.source_system.clone_from(source);
            }

            issue.updated_at = Utc::now();
            validation::validate_issue(&issue)?;
            issue.labels = labels_conn(tx, issue_id)?;
            issue.dependencies = dependencies_conn(tx, issue_id)?;
            issue.content_hash = Some(content_hash(&issue));

            update_issue_row_tx(tx, &issue)?;
            ctx.mark_dirty(issue_id);
            Ok(())
        })?;

        self.require_issue(issue_id)
    }

    /// Close an issue. Fails with [`Error::Blocked`] when unresolved
    /// blockers remain and `force` is not set.
    pub fn close_issue(
        &self,
        issue_id: &str,
        reason: Option<&str>,
        session: Option<&str>,
        force: bool,
        actor: &str,
        cancel: &Cancel,
    ) -> Result<Issue> {
        let issue = self.require_issue(issue_id)?;
        if issue.status.is_terminal() {
            return Err(Error::validation(
                "status",
                format!("{issue_id} is already {}", issue.status),
            ));
        }

        self.mutate(actor, cancel, |tx, ctx| {
            if !force {
                let blockers = graph::blockers_of(tx, issue_id)?;
                if !blockers.is_empty() {
                    return Err(Error::Blocked {
                        id: issue_id.to_string(),
                        blockers,
                    });
                }
            }

            let now = Utc::now();
            let mut closed = issue.clone();
            closed.status = Status::Closed;
            closed.closed_at = Some(now);
            closed.close_reason = reason.map(ToString::to_string);
            closed.closed_by_session = session.map(ToString::to_string);
            closed.updated_at = now;
            closed.labels = labels_conn(tx, issue_id)?;
            closed.dependencies = dependencies_conn(tx, issue_id)?;
            closed.content_hash = Some(content_hash(&closed));

            update_issue_row_tx(tx, &closed)?;
            ctx.record_event(
                EventType::Closed,
                issue_id,
                Some(issue.status.as_str().to_string()),
                Some("closed".to_string()),
                reason.map(ToString::to_string),
            );
            ctx.mark_dirty(issue_id);
            ctx.invalidate_blocked_cache();
            Ok(())
        })?;

        self.require_issue(issue_id)
    }

    /// Reopen a closed issue. Refuses to resurrect tombstones.
    pub fn reopen_issue(&self, issue_id: &str, actor: &str, cancel: &Cancel) -> Result<Issue> {
        let issue = self.require_issue(issue_id)?;
        if issue.status == Status::Tombstone {
            return Err(Error::validation(
                "status",
                format!("{issue_id} is tombstoned and cannot be reopened"),
            ));
        }
        if issue.status != Status::Closed {
            return Err(Error::validation(
                "status",
                format!("{issue_id} is not closed"),
            ));
        }

        self.mutate(actor, cancel, |tx, ctx| {
            let mut reopened = issue.clone();
            reopened.status = Status::Open;
            reopened.closed_at = None;
            reopened.close_reason = None;
            reopened.closed_by_session = None;
            reopened.updated_at = Utc::now();
            reopened.labels = labels_conn(tx, issue_id)?;
            reopened.dependencies = dependencies_conn(tx, issue_id)?;
            reopened.content_hash = Some(content_hash(&reopened));

            update_issue_row_tx(tx, &reopened)?;
            ctx.record_event(
                EventType::Reopened,
                issue_id,
                Some("closed".to_string()),
                Some("open".to_string()),
                None,
            );
            ctx.mark_dirty(issue_id);
            ctx.invalidate_blocked_cache();
            Ok(())
        })?;

        self.require_issue(issue_id)
    }

    /// Soft-delete: transition to tombstone, preserve the original type, and
    /// rewrite plain-text references in connected issues' prose fields to
    /// `[deleted:<id>]`.
    pub fn delete_issue(
        &self,
        issue_id: &str,
        reason: Option<&str>,
        actor: &str,
        cancel: &Cancel,
    ) -> Result<Issue> {
        let issue = self.require_issue(issue_id)?;
        if issue.status == Status::Tombstone {
            return Ok(issue);
        }

        self.mutate(actor, cancel, |tx, ctx| {
            let now = Utc::now();
            let mut tombstone = issue.clone();
            tombstone.original_type = Some(issue.issue_type.as_str().to_string());
            tombstone.status = Status::Tombstone;
            tombstone.deleted_at = Some(now);
            tombstone.deleted_by = Some(ctx.actor.clone());
            tombstone.delete_reason = reason.map(ToString::to_string);
            tombstone.updated_at = now;
            tombstone.labels = labels_conn(tx, issue_id)?;
            tombstone.dependencies = dependencies_conn(tx, issue_id)?;
            tombstone.content_hash = Some(content_hash(&tombstone));

            update_issue_row_tx(tx, &tombstone)?;

            for connected_id in connected_issue_ids(tx, issue_id)? {
                if rewrite_deleted_references(tx, &connected_id, issue_id)? {
                    ctx.mark_dirty(&connected_id);
                }
            }

            ctx.record_event(
                EventType::Deleted,
                issue_id,
                None,
                None,
                reason.map(ToString::to_string),
            );
            ctx.mark_dirty(issue_id);
            ctx.invalidate_blocked_cache();
            Ok(())
        })?;

        self.require_issue(issue_id)
    }

    /// Hard-delete an ephemeral record that was never exported. Anything
    /// else must go through the tombstone path.
    pub fn hard_delete_issue(&self, issue_id: &str, actor: &str, cancel: &Cancel) -> Result<()> {
        let issue = self.require_issue(issue_id)?;
        let exported = self.export_hash(issue_id)?.is_some();
        if !issue.ephemeral || exported {
            return Err(Error::validation(
                "id",
                format!("{issue_id} is not an unexported ephemeral; use delete"),
            ));
        }

        self.mutate(actor, cancel, |tx, ctx| {
            tx.execute("DELETE FROM dependencies WHERE issue_id = ? OR depends_on_id = ?",
                rusqlite::params![issue_id, issue_id])?;
            tx.execute("DELETE FROM dirty_issues WHERE issue_id = ?", [issue_id])?;
            tx.execute("DELETE FROM issues WHERE id = ?", [issue_id])?;
            ctx.invalidate_blocked_cache();
            Ok(())
        })
    }

    /// List issues matching the filters, ordered by priority then age.
    pub fn list_issues(&self, filters: &ListFilters) -> Result<Vec<Issue>> {
        self.read(|conn| {
            let mut sql = format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE 1=1");
            let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(statuses) = &filters.statuses {
                push_in_clause(&mut sql, &mut params, "status", statuses.iter().map(|s| s.as_str().to_string()));
            } else if !filters.include_tombstones {
                sql.push_str(" AND status <> 'tombstone'");
            }
            if let Some(types) = &filters.types {
                push_in_clause(&mut sql, &mut params, "issue_type", types.iter().map(|t| t.as_str().to_string()));
            }
            if let Some(priorities) = &filters.priorities {
                push_in_clause(&mut sql, &mut params, "priority", priorities.iter().map(|p| p.0.to_string()));
            }
            if let Some(assignee) = &filters.assignee {
                sql.push_str(" AND assignee = ?");
                params.push(Box::new(assignee.clone()));
            }
            if !filters.include_ephemeral {
                sql.push_str(" AND ephemeral = 0");
            }
            sql.push_str(" ORDER BY priority ASC, created_at ASC");

            let mut stmt = conn.prepare(&sql)?;
            let refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(AsRef::as_ref).collect();
            let mut issues = stmt
                .query_map(refs.as_slice(), issue_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            if !filters.labels_all.is_empty() || !filters.labels_any.is_empty() {
                let by_issue = all_labels_conn(conn)?;
                let empty = Vec::new();
                issues.retain(|issue| {
                    let labels = by_issue.get(&issue.id).unwrap_or(&empty);
                    filters.labels_all.iter().all(|l| labels.contains(l))
                        && (filters.labels_any.is_empty()
                            || filters.labels_any.iter().any(|l| labels.contains(l)))
                });
            }
            if let Some(limit) = filters.limit {
                issues.truncate(limit);
            }
            Ok(issues)
        })
    }

    /// Active issues not updated in the last `days` days.
    pub fn stale_issues(&self, days: i64) -> Result<Vec<Issue>> {
        let cutoff = time::to_rfc3339(Utc::now() - chrono::Duration::days(days));
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ISSUE_COLUMNS} FROM issues
                 WHERE status IN ('open', 'in_progress') AND updated_at < ?
                 ORDER BY updated_at ASC"
            ))?;
            let issues = stmt
                .query_map([cutoff], issue_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(issues)
        })
    }

    // ========================================================================
    // Dependencies
    // ========================================================================

    /// Add a dependency edge. Cycle-relevant types are checked for cycles
    /// before the write; a detected cycle leaves the edge set unchanged.
    pub fn add_dependency(
        &self,
        dep: &Dependency,
        actor: &str,
        cancel: &Cancel,
    ) -> Result<()> {
        validation::validate_dependency(dep)?;

        self.mutate(actor, cancel, |tx, ctx| {
            if !issue_exists_tx(tx, &dep.issue_id)? {
                return Err(Error::NotFound {
                    id: dep.issue_id.clone(),
                });
            }
            if !dep.is_external() && !issue_exists_tx(tx, &dep.depends_on_id)? {
                return Err(Error::NotFound {
                    id: dep.depends_on_id.clone(),
                });
            }
            let duplicate: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM dependencies WHERE issue_id = ? AND depends_on_id = ?",
                    rusqlite::params![dep.issue_id, dep.depends_on_id],
                    |row| row.get(0),
                )
                .optional()?;
            if duplicate.is_some() {
                return Err(Error::validation(
                    "dependency",
                    format!("edge {} -> {} already exists", dep.issue_id, dep.depends_on_id),
                ));
            }

            if dep.dep_type.cycle_relevant() && !dep.is_external() {
                if let Some(path) = graph::find_cycle_path(tx, &dep.issue_id, &dep.depends_on_id)? {
                    return Err(Error::CycleDetected { path });
                }
            }

            insert_dependency_tx(tx, dep)?;
            ctx.record_event(
                EventType::DependencyAdded,
                &dep.issue_id,
                None,
                Some(dep.depends_on_id.clone()),
                Some(dep.dep_type.as_str().to_string()),
            );
            ctx.mark_dirty(&dep.issue_id);
            if dep.dep_type.affects_ready() {
                ctx.invalidate_blocked_cache();
            }
            Ok(())
        })
    }

    /// Remove a dependency edge; returns whether one was removed.
    pub fn remove_dependency(
        &self,
        issue_id: &str,
        depends_on_id: &str,
        actor: &str,
        cancel: &Cancel,
    ) -> Result<bool> {
        self.mutate(actor, cancel, |tx, ctx| {
            let dep_type: Option<String> = tx
                .query_row(
                    "SELECT type FROM dependencies WHERE issue_id = ? AND depends_on_id = ?",
                    rusqlite::params![issue_id, depends_on_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(dep_type) = dep_type else {
                return Ok(false);
            };

            tx.execute(
                "DELETE FROM dependencies WHERE issue_id = ? AND depends_on_id = ?",
                rusqlite::params![issue_id, depends_on_id],
            )?;
            ctx.record_event(
                EventType::DependencyRemoved,
                issue_id,
                Some(depends_on_id.to_string()),
                None,
                Some(dep_type.clone()),
            );
            ctx.mark_dirty(issue_id);
            if dep_type
                .parse::<DependencyType>()
                .map(|t| t.affects_ready())
                .unwrap_or(true)
            {
                ctx.invalidate_blocked_cache();
            }
            Ok(true)
        })
    }

    /// Outgoing edges of an issue.
    pub fn dependencies_of(&self, issue_id: &str) -> Result<Vec<Dependency>> {
        self.read(|conn| dependencies_conn(conn, issue_id))
    }

    /// Incoming edges (who depends on this issue).
    pub fn dependents_of(&self, issue_id: &str) -> Result<Vec<Dependency>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT issue_id, depends_on_id, type, created_at, created_by, metadata, thread_id
                 FROM dependencies WHERE depends_on_id = ? ORDER BY issue_id",
            )?;
            let deps = stmt
                .query_map([issue_id], dependency_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(deps)
        })
    }

    // ========================================================================
    // Labels
    // ========================================================================

    pub fn add_label(&self, issue_id: &str, label: &str, actor: &str, cancel: &Cancel) -> Result<bool> {
        validation::validate_label(label)?;
        self.touch_labels(issue_id, actor, cancel, |tx, ctx| {
            let added = tx.execute(
                "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?, ?)",
                rusqlite::params![issue_id, label],
            )? > 0;
            if added {
                ctx.record_event(EventType::LabelAdded, issue_id, None, Some(label.to_string()), None);
            }
            Ok(added)
        })
    }

    pub fn remove_label(&self, issue_id: &str, label: &str, actor: &str, cancel: &Cancel) -> Result<bool> {
        self.touch_labels(issue_id, actor, cancel, |tx, ctx| {
            let removed = tx.execute(
                "DELETE FROM labels WHERE issue_id = ? AND label = ?",
                rusqlite::params![issue_id, label],
            )? > 0;
            if removed {
                ctx.record_event(EventType::LabelRemoved, issue_id, Some(label.to_string()), None, None);
            }
            Ok(removed)
        })
    }

    /// Replace the whole label set for an issue.
    pub fn set_labels(&self, issue_id: &str, labels: &[String], actor: &str, cancel: &Cancel) -> Result<()> {
        for label in labels {
            validation::validate_label(label)?;
        }
        self.touch_labels(issue_id, actor, cancel, |tx, _ctx| {
            tx.execute("DELETE FROM labels WHERE issue_id = ?", [issue_id])?;
            for label in labels {
                tx.execute(
                    "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?, ?)",
                    rusqlite::params![issue_id, label],
                )?;
            }
            Ok(())
        })
    }

    /// Shared wrapper: label mutations re-hash the issue and mark it dirty.
    fn touch_labels<R>(
        &self,
        issue_id: &str,
        actor: &str,
        cancel: &Cancel,
        f: impl FnOnce(&Transaction<'_>, &mut MutationCtx) -> Result<R>,
    ) -> Result<R> {
        let _ = self.require_issue(issue_id)?;
        self.mutate(actor, cancel, |tx, ctx| {
            let result = f(tx, ctx)?;
            refresh_hash_tx(tx, issue_id)?;
            ctx.mark_dirty(issue_id);
            Ok(result)
        })
    }

    pub fn labels_of(&self, issue_id: &str) -> Result<Vec<String>> {
        self.read(|conn| labels_conn(conn, issue_id))
    }

    /// Distinct labels with usage counts, most used first.
    pub fn labels_with_counts(&self) -> Result<Vec<(String, i64)>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT label, COUNT(*) FROM labels GROUP BY label ORDER BY COUNT(*) DESC, label",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Rename a label across every issue; returns how many rows moved.
    pub fn rename_label(&self, old: &str, new: &str, actor: &str, cancel: &Cancel) -> Result<usize> {
        validation::validate_label(new)?;
        self.mutate(actor, cancel, |tx, ctx| {
            let affected: Vec<String> = {
                let mut stmt = tx.prepare("SELECT issue_id FROM labels WHERE label = ?")?;
                let ids = stmt
                    .query_map([old], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                ids
            };
            for issue_id in &affected {
                tx.execute(
                    "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?, ?)",
                    rusqlite::params![issue_id, new],
                )?;
                tx.execute(
                    "DELETE FROM labels WHERE issue_id = ? AND label = ?",
                    rusqlite::params![issue_id, old],
                )?;
                refresh_hash_tx(tx, issue_id)?;
                ctx.mark_dirty(issue_id);
            }
            Ok(affected.len())
        })
    }

    // ========================================================================
    // Comments
    // ========================================================================

    pub fn add_comment(&self, issue_id: &str, author: &str, body: &str, cancel: &Cancel) -> Result<Comment> {
        validation::validate_comment(author, body)?;
        let _ = self.require_issue(issue_id)?;
        let created_at = Utc::now();
        let comment_id = self.mutate(author, cancel, |tx, ctx| {
            tx.execute(
                "INSERT INTO comments (issue_id, author, text, created_at) VALUES (?, ?, ?, ?)",
                rusqlite::params![issue_id, author, body, time::to_rfc3339(created_at)],
            )?;
            let comment_id = tx.last_insert_rowid();
            ctx.record_event(EventType::Commented, issue_id, None, None, Some(body.to_string()));
            ctx.mark_dirty(issue_id);
            Ok(comment_id)
        })?;
        Ok(Comment {
            id: comment_id,
            issue_id: issue_id.to_string(),
            author: author.to_string(),
            body: body.to_string(),
            created_at,
        })
    }

    pub fn comments_of(&self, issue_id: &str) -> Result<Vec<Comment>> {
        self.read(|conn| comments_conn(conn, issue_id))
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn events_for(&self, issue_id: &str, limit: usize) -> Result<Vec<Event>> {
        self.read(|conn| events::events_for(conn, issue_id, limit))
    }

    pub fn recent_events(&self, limit: usize) -> Result<Vec<Event>> {
        self.read(|conn| events::recent_events(conn, limit))
    }

    // ========================================================================
    // Config and metadata tables
    // ========================================================================

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        self.read(|conn| kv_get(conn, "config", key))
    }

    pub fn set_config(&self, key: &str, value: &str, cancel: &Cancel) -> Result<()> {
        self.mutate("config", cancel, |tx, _| kv_set(tx, "config", key, value))
    }

    pub fn delete_config(&self, key: &str, cancel: &Cancel) -> Result<bool> {
        self.mutate("config", cancel, |tx, _| {
            Ok(tx.execute("DELETE FROM config WHERE key = ?", [key])? > 0)
        })
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        self.read(|conn| kv_get(conn, "metadata", key))
    }

    pub fn set_metadata(&self, key: &str, value: &str, cancel: &Cancel) -> Result<()> {
        self.mutate("engine", cancel, |tx, _| kv_set(tx, "metadata", key, value))
    }

    // ========================================================================
    // Dirty tracking and the export-hash ledger
    // ========================================================================

    /// Dirty issue IDs in FIFO order (oldest mark first).
    pub fn dirty_ids(&self) -> Result<Vec<String>> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT issue_id FROM dirty_issues ORDER BY marked_at ASC, issue_id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }

    pub fn clear_dirty(&self, issue_ids: &[String], cancel: &Cancel) -> Result<usize> {
        if issue_ids.is_empty() {
            return Ok(0);
        }
        self.mutate("engine", cancel, |tx, _| {
            let mut cleared = 0;
            for issue_id in issue_ids {
                cleared += tx.execute("DELETE FROM dirty_issues WHERE issue_id = ?", [issue_id])?;
            }
            Ok(cleared)
        })
    }

    /// Mark every non-ephemeral issue dirty (used before a full export).
    pub fn mark_all_dirty(&self, cancel: &Cancel) -> Result<usize> {
        self.mutate("engine", cancel, |tx, _| {
            let now = time::to_rfc3339(Utc::now());
            let count = tx.execute(
                "INSERT OR REPLACE INTO dirty_issues (issue_id, marked_at)
                 SELECT id, ? FROM issues WHERE ephemeral = 0",
                [now],
            )?;
            Ok(count)
        })
    }

    pub fn export_hash(&self, issue_id: &str) -> Result<Option<String>> {
        self.read(|conn| {
            let hash = conn
                .query_row(
                    "SELECT content_hash FROM export_hashes WHERE issue_id = ?",
                    [issue_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(hash)
        })
    }

    pub fn set_export_hashes(&self, entries: &[(String, String)], cancel: &Cancel) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.mutate("engine", cancel, |tx, _| {
            let now = time::to_rfc3339(Utc::now());
            for (issue_id, hash) in entries {
                tx.execute(
                    "INSERT OR REPLACE INTO export_hashes (issue_id, content_hash, exported_at)
                     VALUES (?, ?, ?)",
                    rusqlite::params![issue_id, hash, now],
                )?;
            }
            Ok(())
        })
    }

    pub fn clear_all_export_hashes(&self, cancel: &Cancel) -> Result<usize> {
        self.mutate("engine", cancel, |tx, _| {
            Ok(tx.execute("DELETE FROM export_hashes", [])?)
        })
    }

    // ========================================================================
    // Import support
    // ========================================================================

    pub fn find_by_external_ref(&self, external_ref: &str) -> Result<Option<Issue>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ISSUE_COLUMNS} FROM issues WHERE external_ref = ?"
            ))?;
            let issue = stmt.query_row([external_ref], issue_from_row).optional()?;
            Ok(issue)
        })
    }

    pub fn find_by_content_hash(&self, hash: &str) -> Result<Option<Issue>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ISSUE_COLUMNS} FROM issues WHERE content_hash = ? LIMIT 1"
            ))?;
            let issue = stmt.query_row([hash], issue_from_row).optional()?;
            Ok(issue)
        })
    }

    pub fn is_tombstone(&self, issue_id: &str) -> Result<bool> {
        self.read(|conn| {
            let status: Option<String> = conn
                .query_row("SELECT status FROM issues WHERE id = ?", [issue_id], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(status.as_deref() == Some("tombstone"))
        })
    }

    /// Issues eligible for export (everything non-ephemeral, tombstones
    /// included), relations attached, ordered by ID.
    pub fn exportable_issues(&self) -> Result<Vec<Issue>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ISSUE_COLUMNS} FROM issues WHERE ephemeral = 0 ORDER BY id"
            ))?;
            let mut issues = stmt
                .query_map([], issue_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut labels = all_labels_conn(conn)?;
            let mut deps = all_dependencies_conn(conn)?;
            let mut comments = all_comments_conn(conn)?;
            for issue in &mut issues {
                issue.labels = labels.remove(&issue.id).unwrap_or_default();
                issue.dependencies = deps.remove(&issue.id).unwrap_or_default();
                issue.comments = comments.remove(&issue.id).unwrap_or_default();
            }
            Ok(issues)
        })
    }

    /// Load one issue with relations for export; `None` when it vanished or
    /// is ephemeral.
    pub fn exportable_issue(&self, issue_id: &str) -> Result<Option<Issue>> {
        let Some(mut issue) = self.get_issue_full(issue_id)? else {
            return Ok(None);
        };
        if issue.ephemeral {
            return Ok(None);
        }
        issue.comments.sort_by_key(|c| c.id);
        Ok(Some(issue))
    }

    // ========================================================================
    // Rollups
    // ========================================================================

    /// Per-epic child counts and close eligibility.
    pub fn epic_status(&self) -> Result<Vec<EpicStatus>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ISSUE_COLUMNS} FROM issues
                 WHERE issue_type = 'epic' AND status <> 'tombstone' ORDER BY id"
            ))?;
            let epics = stmt
                .query_map([], issue_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut out = Vec::with_capacity(epics.len());
            for epic in epics {
                let (total, closed): (i64, i64) = conn.query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(CASE WHEN i.status = 'closed' THEN 1 ELSE 0 END), 0)
                     FROM dependencies d JOIN issues i ON i.id = d.issue_id
                     WHERE d.depends_on_id = ? AND d.type = 'parent-child'",
                    [&epic.id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                let total = usize::try_from(total).unwrap_or(0);
                let closed = usize::try_from(closed).unwrap_or(0);
                let eligible_for_close = total > 0 && total == closed && !epic.status.is_terminal();
                out.push(EpicStatus {
                    epic,
                    total_children: total,
                    closed_children: closed,
                    eligible_for_close,
                });
            }
            Ok(out)
        })
    }

    /// Aggregate counts; see [`Stats`] for the two blocked variants.
    pub fn stats(&self) -> Result<Stats> {
        let ready = graph::ready_issues(self, &graph::ReadyFilters::default())?.len();
        self.read(|conn| {
            let count_status = |status: &str| -> Result<usize> {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM issues WHERE status = ? AND ephemeral = 0",
                    [status],
                    |row| row.get(0),
                )?;
                Ok(usize::try_from(n).unwrap_or(0))
            };

            let blocked: i64 =
                conn.query_row("SELECT COUNT(*) FROM blocked_cache", [], |row| row.get(0))?;
            let blocked_legacy: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT d.issue_id)
                 FROM dependencies d
                 JOIN issues blocker ON blocker.id = d.depends_on_id
                 JOIN issues blocked ON blocked.id = d.issue_id
                 WHERE d.type = 'blocks'
                   AND blocker.status NOT IN ('closed', 'tombstone')
                   AND blocked.status NOT IN ('closed', 'tombstone')",
                [],
                |row| row.get(0),
            )?;

            Ok(Stats {
                open: count_status("open")?,
                in_progress: count_status("in_progress")?,
                closed: count_status("closed")?,
                tombstoned: count_status("tombstone")?,
                ready,
                blocked: usize::try_from(blocked).unwrap_or(0),
                blocked_legacy: usize::try_from(blocked_legacy).unwrap_or(0),
            })
        })
    }

    /// Best-effort WAL checkpoint; failures are logged, not surfaced.
    pub fn checkpoint(&self) {
        let result = self.read(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
            Ok(())
        });
        if let Err(e) = result {
            tracing::debug!(error = %e, "WAL checkpoint skipped");
        }
    }
}

// ============================================================================
// Transaction helpers (shared with the sync pipelines)
// ============================================================================

/// BEGIN IMMEDIATE with exponential backoff on lock contention.
pub(crate) fn begin_immediate<'a>(
    conn: &'a mut Connection,
    cancel: &Cancel,
) -> Result<Transaction<'a>> {
    let mut delay = TX_RETRY_BASE;
    for attempt in 0..TX_RETRY_ATTEMPTS {
        cancel.check()?;
        let err = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
            Ok(_) => None,
            Err(e) => Some(e),
        };
        match err {
            None => break,
            Some(e) if is_busy(&e) && attempt + 1 < TX_RETRY_ATTEMPTS => {
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "write lock busy");
                std::thread::sleep(delay);
                delay = (delay * 2).min(TX_RETRY_CAP);
            }
            Some(e) => return Err(e.into()),
        }
    }
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(Into::into)
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(inner, _) if matches!(
            inner.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        )
    )
}

pub(crate) fn issue_exists_tx(conn: &Connection, issue_id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM issues WHERE id = ?", [issue_id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

fn count_issues_tx(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM issues", [], |row| row.get(0))?;
    Ok(usize::try_from(n).unwrap_or(0))
}

/// Atomic per-parent child numbering.
fn next_child_number(conn: &Connection, parent_id: &str) -> Result<i64> {
    let n: i64 = conn.query_row(
        "INSERT INTO child_counters (parent_id, last_child_number) VALUES (?, 1)
         ON CONFLICT(parent_id) DO UPDATE SET last_child_number = last_child_number + 1
         RETURNING last_child_number",
        [parent_id],
        |row| row.get(0),
    )?;
    Ok(n)
}

pub(crate) fn get_issue_conn(conn: &Connection, issue_id: &str) -> Result<Option<Issue>> {
    let mut stmt = conn.prepare(&format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = ?"))?;
    let issue = stmt.query_row([issue_id], issue_from_row).optional()?;
    Ok(issue)
}

pub(crate) fn insert_issue_tx(conn: &Connection, issue: &Issue) -> Result<()> {
    let params = issue_params(issue);
    let refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(AsRef::as_ref).collect();
    conn.execute(
        "INSERT INTO issues (
            id, content_hash, title, description, design, acceptance_criteria, notes,
            status, priority, issue_type, assignee, owner, estimated_minutes, created_by,
            created_at, updated_at, closed_at, close_reason, closed_by_session, due_at,
            defer_until, external_ref, source_system, deleted_at, deleted_by, delete_reason,
            original_type, sender, ephemeral, pinned, is_template
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        refs.as_slice(),
    )?;
    Ok(())
}

pub(crate) fn update_issue_row_tx(conn: &Connection, issue: &Issue) -> Result<()> {
    let params = issue_params(issue);
    let refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(AsRef::as_ref).collect();
    let changed = conn.execute(
        "UPDATE issues SET
            content_hash = ?2, title = ?3, description = ?4, design = ?5,
            acceptance_criteria = ?6, notes = ?7, status = ?8, priority = ?9,
            issue_type = ?10, assignee = ?11, owner = ?12, estimated_minutes = ?13,
            created_by = ?14, created_at = ?15, updated_at = ?16, closed_at = ?17,
            close_reason = ?18, closed_by_session = ?19, due_at = ?20, defer_until = ?21,
            external_ref = ?22, source_system = ?23, deleted_at = ?24, deleted_by = ?25,
            delete_reason = ?26, original_type = ?27, sender = ?28, ephemeral = ?29,
            pinned = ?30, is_template = ?31
         WHERE id = ?1",
        refs.as_slice(),
    )?;
    if changed == 0 {
        return Err(Error::NotFound {
            id: issue.id.clone(),
        });
    }
    Ok(())
}

fn issue_params(issue: &Issue) -> Vec<Box<dyn rusqlite::ToSql>> {
    vec![
        Box::new(issue.id.clone()),
        Box::new(issue.content_hash.clone()),
        Box::new(issue.title.clone()),
        Box::new(issue.description.clone()),
        Box::new(issue.design.clone()),
        Box::new(issue.acceptance_criteria.clone()),
        Box::new(issue.notes.clone()),
        Box::new(issue.status.as_str()),
        Box::new(issue.priority.0),
        Box::new(issue.issue_type.as_str()),
        Box::new(issue.assignee.clone()),
        Box::new(issue.owner.clone()),
        Box::new(issue.estimated_minutes),
        Box::new(issue.created_by.clone()),
        Box::new(time::to_rfc3339(issue.created_at)),
        Box::new(time::to_rfc3339(issue.updated_at)),
        Box::new(issue.closed_at.map(time::to_rfc3339)),
        Box::new(issue.close_reason.clone()),
        Box::new(issue.closed_by_session.clone()),
        Box::new(issue.due_at.map(time::to_rfc3339)),
        Box::new(issue.defer_until.map(time::to_rfc3339)),
        Box::new(issue.external_ref.clone()),
        Box::new(issue.source_system.clone()),
        Box::new(issue.deleted_at.map(time::to_rfc3339)),
        Box::new(issue.deleted_by.clone()),
        Box::new(issue.delete_reason.clone()),
        Box::new(issue.original_type.clone()),
        Box::new(issue.sender.clone()),
        Box::new(i32::from(issue.ephemeral)),
        Box::new(i32::from(issue.pinned)),
        Box::new(i32::from(issue.is_template)),
    ]
}

pub(crate) fn insert_dependency_tx(conn: &Connection, dep: &Dependency) -> Result<()> {
    conn.execute(
        "INSERT INTO dependencies (issue_id, depends_on_id, type, created_at, created_by, metadata, thread_id)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            dep.issue_id,
            dep.depends_on_id,
            dep.dep_type.as_str(),
            time::to_rfc3339(dep.created_at),
            dep.created_by,
            dep.metadata,
            dep.thread_id,
        ],
    )?;
    Ok(())
}

pub(crate) fn labels_conn(conn: &Connection, issue_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT label FROM labels WHERE issue_id = ? ORDER BY label")?;
    let labels = stmt
        .query_map([issue_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(labels)
}

pub(crate) fn dependencies_conn(conn: &Connection, issue_id: &str) -> Result<Vec<Dependency>> {
    let mut stmt = conn.prepare(
        "SELECT issue_id, depends_on_id, type, created_at, created_by, metadata, thread_id
         FROM dependencies WHERE issue_id = ? ORDER BY depends_on_id",
    )?;
    let deps = stmt
        .query_map([issue_id], dependency_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(deps)
}

pub(crate) fn comments_conn(conn: &Connection, issue_id: &str) -> Result<Vec<Comment>> {
    let mut stmt = conn.prepare(
        "SELECT id, issue_id, author, text, created_at
         FROM comments WHERE issue_id = ? ORDER BY id",
    )?;
    let comments = stmt
        .query_map([issue_id], comment_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(comments)
}

fn all_labels_conn(conn: &Connection) -> Result<HashMap<String, Vec<String>>> {
    let mut stmt = conn.prepare("SELECT issue_id, label FROM labels ORDER BY issue_id, label")?;
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (issue_id, label) = row?;
        out.entry(issue_id).or_default().push(label);
    }
    Ok(out)
}

fn all_dependencies_conn(conn: &Connection) -> Result<HashMap<String, Vec<Dependency>>> {
    let mut stmt = conn.prepare(
        "SELECT issue_id, depends_on_id, type, created_at, created_by, metadata, thread_id
         FROM dependencies ORDER BY issue_id, depends_on_id",
    )?;
    let mut out: HashMap<String, Vec<Dependency>> = HashMap::new();
    let rows = stmt.query_map([], dependency_from_row)?;
    for row in rows {
        let dep = row?;
        out.entry(dep.issue_id.clone()).or_default().push(dep);
    }
    Ok(out)
}

fn all_comments_conn(conn: &Connection) -> Result<HashMap<String, Vec<Comment>>> {
    let mut stmt = conn.prepare(
        "SELECT id, issue_id, author, text, created_at FROM comments ORDER BY issue_id, id",
    )?;
    let mut out: HashMap<String, Vec<Comment>> = HashMap::new();
    let rows = stmt.query_map([], comment_from_row)?;
    for row in rows {
        let comment = row?;
        out.entry(comment.issue_id.clone()).or_default().push(comment);
    }
    Ok(out)
}

/// Recompute and store an issue's content hash after a relation change, and
/// stamp `updated_at`.
fn refresh_hash_tx(conn: &Connection, issue_id: &str) -> Result<()> {
    let Some(mut issue) = get_issue_conn(conn, issue_id)? else {
        return Err(Error::NotFound {
            id: issue_id.to_string(),
        });
    };
    issue.labels = labels_conn(conn, issue_id)?;
    issue.dependencies = dependencies_conn(conn, issue_id)?;
    issue.updated_at = Utc::now();
    let hash = content_hash(&issue);
    conn.execute(
        "UPDATE issues SET content_hash = ?, updated_at = ? WHERE id = ?",
        rusqlite::params![hash, time::to_rfc3339(issue.updated_at), issue_id],
    )?;
    Ok(())
}

/// Issues connected to `issue_id` by an edge in either direction.
fn connected_issue_ids(conn: &Connection, issue_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT other FROM (
            SELECT issue_id AS other FROM dependencies WHERE depends_on_id = ?1
            UNION
            SELECT depends_on_id AS other FROM dependencies WHERE issue_id = ?1
         ) WHERE other NOT LIKE 'external:%'",
    )?;
    let ids = stmt
        .query_map([issue_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

/// Token-boundary rewrite of `deleted_id` to `[deleted:<id>]` in the prose
/// fields of `issue_id`. Returns whether anything changed.
fn rewrite_deleted_references(conn: &Connection, issue_id: &str, deleted_id: &str) -> Result<bool> {
    let Some(issue) = get_issue_conn(conn, issue_id)? else {
        return Ok(false);
    };

    let pattern = format!(
        r"(^|[^A-Za-z0-9._-]){}([^A-Za-z0-9._-]|$)",
        regex::escape(deleted_id)
    );
    let re = Regex::new(&pattern)
        .map_err(|e| Error::Config(format!("reference rewrite pattern: {e}")))?;
    let replacement = format!("[deleted:{deleted_id}]");

    let rewrite = |text: Option<&str>| -> Option<String> {
        let text = text?;
        if !re.is_match(text) {
            return None;
        }
        Some(
            re.replace_all(text, |caps: &regex::Captures<'_>| {
                format!("{}{}{}", &caps[1], replacement, &caps[2])
            })
            .into_owned(),
        )
    };

    let mut changed = false;
    let mut apply = |column: &str, updated: Option<String>| -> Result<()> {
        if let Some(new_text) = updated {
            conn.execute(
                &format!("UPDATE issues SET {column} = ? WHERE id = ?"),
                rusqlite::params![new_text, issue_id],
            )?;
            changed = true;
        }
        Ok(())
    };

    apply("description", rewrite(issue.description.as_deref()))?;
    apply("design", rewrite(issue.design.as_deref()))?;
    apply(
        "acceptance_criteria",
        rewrite(issue.acceptance_criteria.as_deref()),
    )?;
    apply("notes", rewrite(issue.notes.as_deref()))?;

    if changed {
        refresh_hash_tx(conn, issue_id)?;
    }
    Ok(changed)
}

fn kv_get(conn: &Connection, table: &str, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            &format!("SELECT value FROM {table} WHERE key = ?"),
            [key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

fn kv_set(conn: &Connection, table: &str, key: &str, value: &str) -> Result<()> {
    conn.execute(
        &format!("INSERT OR REPLACE INTO {table} (key, value) VALUES (?, ?)"),
        rusqlite::params![key, value],
    )?;
    Ok(())
}

fn ensure_workspace_id(conn: &Connection) -> Result<String> {
    if let Some(existing) = kv_get(conn, "metadata", "workspace_id")? {
        return Ok(existing);
    }
    let seed = format!(
        "workspace|{}|{}",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or(0)
    );
    let workspace_id = format!("ws-{}", id::base36_hash(&seed, 10));
    kv_set(conn, "metadata", "workspace_id", &workspace_id)?;
    Ok(workspace_id)
}

fn push_in_clause(
    sql: &mut String,
    params: &mut Vec<Box<dyn rusqlite::ToSql>>,
    column: &str,
    values: impl Iterator<Item = String>,
) {
    let values: Vec<String> = values.collect();
    if values.is_empty() {
        return;
    }
    let placeholders = vec!["?"; values.len()].join(", ");
    let _ = write!(sql, " AND {column} IN ({placeholders})");
    for value in values {
        params.push(Box::new(value));
    }
}

pub(crate) fn issue_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Issue> {
    let parse_dt = |idx: usize| -> rusqlite::Result<Option<DateTime<Utc>>> {
        let value: Option<String> = row.get(idx)?;
        Ok(value.and_then(|s| time::parse_stored(&s).ok()))
    };
    let status: String = row.get(7)?;
    let issue_type: String = row.get(9)?;
    let created_at: String = row.get(14)?;
    let updated_at: String = row.get(15)?;

    Ok(Issue {
        id: row.get(0)?,
        content_hash: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        design: row.get(4)?,
        acceptance_criteria: row.get(5)?,
        notes: row.get(6)?,
        status: status.parse().unwrap_or(Status::Open),
        priority: Priority(row.get(8)?),
        issue_type: issue_type.parse().unwrap_or(IssueType::Task),
        assignee: row.get(10)?,
        owner: row.get(11)?,
        estimated_minutes: row.get(12)?,
        created_by: row.get(13)?,
        created_at: time::parse_stored(&created_at)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        updated_at: time::parse_stored(&updated_at)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        closed_at: parse_dt(16)?,
        close_reason: row.get(17)?,
        closed_by_session: row.get(18)?,
        due_at: parse_dt(19)?,
        defer_until: parse_dt(20)?,
        external_ref: row.get(21)?,
        source_system: row.get(22)?,
        deleted_at: parse_dt(23)?,
        deleted_by: row.get(24)?,
        delete_reason: row.get(25)?,
        original_type: row.get(26)?,
        sender: row.get(27)?,
        ephemeral: row.get::<_, i32>(28)? != 0,
        pinned: row.get::<_, i32>(29)? != 0,
        is_template: row.get::<_, i32>(30)? != 0,
        labels: Vec::new(),
        dependencies: Vec::new(),
        comments: Vec::new(),
    })
}

fn dependency_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Dependency> {
    let dep_type: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    Ok(Dependency {
        issue_id: row.get(0)?,
        depends_on_id: row.get(1)?,
        dep_type: dep_type.parse().unwrap_or(DependencyType::Related),
        created_at: time::parse_stored(&created_at)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        created_by: row.get(4)?,
        metadata: row.get(5)?,
        thread_id: row.get(6)?,
    })
}

fn comment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Comment> {
    let created_at: String = row.get(4)?;
    Ok(Comment {
        id: row.get(0)?,
        issue_id: row.get(1)?,
        author: row.get(2)?,
        body: row.get(3)?,
        created_at: time::parse_stored(&created_at)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
    })
}
