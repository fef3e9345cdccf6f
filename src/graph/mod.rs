//! The ready/blocked engine.
//!
//! A materialized cache maps each blocked issue to the set of issues
//! blocking it. The cache is rebuilt in two phases inside one transaction:
//! phase 1 evaluates each blocking-type edge against its blocker's state;
//! phase 2 propagates blocked status down `parent-child` edges. Invalidation
//! happens on status changes and blocking-edge changes; `related`-style
//! edges never invalidate.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;
use crate::model::{DependencyNode, DependencyType, Issue, WaitGate};
use crate::storage::SqliteStore;
use crate::util::{time, Cancel};

/// Close reasons containing any of these (case-insensitively) count as a
/// failed outcome for `conditional-blocks` edges.
pub const FAILURE_KEYWORDS: &[&str] = &[
    "failed", "rejected", "wontfix", "won't fix", "cancelled", "canceled", "abandoned", "blocked",
    "error", "timeout", "aborted",
];

/// Phase-2 propagation depth cap.
const TRANSITIVE_DEPTH_CAP: usize = 50;

/// Cycle-search depth cap.
const CYCLE_DEPTH_CAP: usize = 100;

/// Default dependency-tree depth.
pub const TREE_DEPTH_DEFAULT: usize = 10;

/// Whether a close reason marks a failed outcome.
#[must_use]
pub fn is_failure_reason(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    FAILURE_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Sort policy for the ready queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadySort {
    /// P0/P1 first (by age), then everything else (by age).
    #[default]
    Hybrid,
    /// Strictly by priority, ties broken by age.
    Priority,
    /// Oldest first regardless of priority.
    Oldest,
}

/// Filters for the ready query.
#[derive(Debug, Clone, Default)]
pub struct ReadyFilters {
    pub assignee: Option<String>,
    pub types: Option<Vec<crate::model::IssueType>>,
    pub priorities: Option<Vec<crate::model::Priority>>,
    pub limit: Option<usize>,
    pub sort: ReadySort,
}

// ============================================================================
// Blocked cache
// ============================================================================

/// Rebuild the blocked cache in its own transaction.
pub fn rebuild_blocked_cache(store: &SqliteStore, cancel: &Cancel) -> Result<usize> {
    store.mutate("engine", cancel, |tx, _ctx| rebuild_blocked_cache_tx(tx))
}

/// Rebuild the blocked cache inside an existing transaction.
pub(crate) fn rebuild_blocked_cache_tx(conn: &Connection) -> Result<usize> {
    conn.execute("DELETE FROM blocked_cache", [])?;

    // Blocker state: status string and close reason, keyed by ID.
    let mut states: HashMap<String, (String, Option<String>)> = HashMap::new();
    {
        let mut stmt = conn.prepare("SELECT id, status, close_reason FROM issues")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;
        for row in rows {
            let (id, status, reason) = row?;
            states.insert(id, (status, reason));
        }
    }

    // Children of each issue, via parent-child edges, for waits-for gates.
    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    // Parent-child pairs for phase-2 propagation: (child, parent).
    let mut parent_edges: Vec<(String, String)> = Vec::new();
    {
        let mut stmt = conn.prepare(
            "SELECT issue_id, depends_on_id FROM dependencies WHERE type = 'parent-child'",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (child, parent) = row?;
            children.entry(parent.clone()).or_default().push(child.clone());
            parent_edges.push((child, parent));
        }
    }

    // Phase 1: direct blocking, one decision per blocking-type edge.
    let mut blocked: HashMap<String, HashSet<String>> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT issue_id, depends_on_id, type, metadata FROM dependencies
             WHERE type IN ('blocks', 'conditional-blocks', 'waits-for')
               AND depends_on_id NOT LIKE 'external:%'",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        for row in rows {
            let (issue_id, blocker_id, dep_type, metadata) = row?;
            let blocker_state = states.get(&blocker_id);
            let holds = match dep_type.as_str() {
                "blocks" => blocker_holds_plain(blocker_state),
                // parent-child blocks only transitively (phase 2): a child
                // under a merely-open parent is workable.
                "conditional-blocks" => blocker_holds_conditional(blocker_state),
                "waits-for" => {
                    let gate = metadata
                        .as_deref()
                        .and_then(|m| serde_json::from_str::<serde_json::Value>(m).ok())
                        .and_then(|v| v.get("gate").and_then(|g| g.as_str().map(WaitGate::parse)))
                        .unwrap_or_default();
                    blocker_holds_gate(gate, children.get(&blocker_id), &states)
                }
                _ => false,
            };
            if holds {
                blocked.entry(issue_id).or_default().insert(blocker_id);
            }
        }
    }

    // Phase 2: blocked status flows down parent-child edges.
    let mut depth = 0;
    loop {
        if depth >= TRANSITIVE_DEPTH_CAP {
            tracing::warn!(cap = TRANSITIVE_DEPTH_CAP, "transitive propagation hit depth cap");
            break;
        }
        let mut added = false;
        for (child, parent) in &parent_edges {
            if blocked.contains_key(parent) && !blocked.contains_key(child) {
                blocked
                    .entry(child.clone())
                    .or_default()
                    .insert(parent.clone());
                added = true;
            }
        }
        if !added {
            break;
        }
        depth += 1;
    }

    // Store the union, deduplicated, with sorted blocker lists.
    let now = time::to_rfc3339(Utc::now());
    let mut count = 0;
    {
        let mut insert = conn.prepare(
            "INSERT INTO blocked_cache (issue_id, blocked_by, blocked_at) VALUES (?, ?, ?)",
        )?;
        for (issue_id, blockers) in &blocked {
            let mut list: Vec<&String> = blockers.iter().collect();
            list.sort();
            let json = serde_json::to_string(&list)
                .map_err(|e| crate::error::Error::Config(format!("blocked_by encoding: {e}")))?;
            insert.execute(rusqlite::params![issue_id, json, now])?;
            count += 1;
        }
    }

    tracing::debug!(blocked_count = count, "rebuilt blocked cache");
    Ok(count)
}

/// `blocks`: the blocker holds while it is in a state with work remaining.
/// A missing blocker (dangling edge) is treated as blocking.
fn blocker_holds_plain(state: Option<&(String, Option<String>)>) -> bool {
    match state {
        Some((status, _)) => {
            matches!(status.as_str(), "open" | "in_progress" | "blocked" | "deferred" | "hooked")
        }
        None => true,
    }
}

/// `conditional-blocks`: holds until the blocker is explicitly resolved as a
/// failure (closed with a failure keyword) or removed outright (tombstone).
fn blocker_holds_conditional(state: Option<&(String, Option<String>)>) -> bool {
    match state {
        Some((status, reason)) => match status.as_str() {
            "tombstone" => false,
            "closed" => !reason.as_deref().map(is_failure_reason).unwrap_or(false),
            _ => true,
        },
        None => true,
    }
}

/// `waits-for`: gate over the blocker's children.
fn blocker_holds_gate(
    gate: WaitGate,
    child_ids: Option<&Vec<String>>,
    states: &HashMap<String, (String, Option<String>)>,
) -> bool {
    let empty = Vec::new();
    let child_ids = child_ids.unwrap_or(&empty);
    let closed = |id: &String| {
        states
            .get(id)
            .map(|(status, _)| status == "closed")
            .unwrap_or(false)
    };
    match gate {
        // Holds while any child remains unclosed.
        WaitGate::AllChildren => child_ids.iter().any(|c| !closed(c)),
        // Holds while no child has closed yet.
        WaitGate::AnyChildren => !child_ids.iter().any(closed),
    }
}

/// IDs blocking `issue_id`, from the cache; empty when not blocked.
pub(crate) fn blockers_of(conn: &Connection, issue_id: &str) -> Result<Vec<String>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT blocked_by FROM blocked_cache WHERE issue_id = ?",
            [issue_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(json) = json else {
        return Ok(Vec::new());
    };
    Ok(serde_json::from_str(&json).unwrap_or_default())
}

/// All blocked IDs currently in the cache.
pub(crate) fn blocked_ids(conn: &Connection) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT issue_id FROM blocked_cache")?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<HashSet<String>>>()?;
    Ok(ids)
}

/// Whether the cache holds an entry for this issue.
pub fn is_blocked(store: &SqliteStore, issue_id: &str) -> Result<bool> {
    store.read(|conn| Ok(!blockers_of(conn, issue_id)?.is_empty()))
}

/// Blocked issues with their blocker lists, active issues only, by priority
/// then age.
pub fn blocked_issues(store: &SqliteStore) -> Result<Vec<(Issue, Vec<String>)>> {
    store.read(|conn| {
        let ids = blocked_ids(conn)?;
        let mut out = Vec::new();
        for id in ids {
            let Some(issue) = crate::storage::get_issue_conn(conn, &id)? else {
                continue;
            };
            if !issue.status.is_active() {
                continue;
            }
            let blockers = blockers_of(conn, &id)?;
            out.push((issue, blockers));
        }
        out.sort_by(|(a, _), (b, _)| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(out)
    })
}

// ============================================================================
// Ready query
// ============================================================================

/// Issues ready to work on: active, unblocked, past any deferral, not
/// pinned, not ephemeral. Sorted by the requested policy.
pub fn ready_issues(store: &SqliteStore, filters: &ReadyFilters) -> Result<Vec<Issue>> {
    let now = time::to_rfc3339(Utc::now());
    store.read(|conn| {
        let blocked = blocked_ids(conn)?;

        let mut sql = String::from(
            "SELECT id FROM issues
             WHERE status IN ('open', 'in_progress')
               AND (defer_until IS NULL OR defer_until <= ?)
               AND pinned = 0
               AND ephemeral = 0",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now.clone())];

        if let Some(assignee) = &filters.assignee {
            sql.push_str(" AND assignee = ?");
            params.push(Box::new(assignee.clone()));
        }
        if let Some(types) = &filters.types {
            if !types.is_empty() {
                let placeholders = vec!["?"; types.len()].join(", ");
                sql.push_str(&format!(" AND issue_type IN ({placeholders})"));
                for t in types {
                    params.push(Box::new(t.as_str()));
                }
            }
        }
        if let Some(priorities) = &filters.priorities {
            if !priorities.is_empty() {
                let placeholders = vec!["?"; priorities.len()].join(", ");
                sql.push_str(&format!(" AND priority IN ({placeholders})"));
                for p in priorities {
                    params.push(Box::new(p.0));
                }
            }
        }

        match filters.sort {
            ReadySort::Hybrid => {
                sql.push_str(
                    " ORDER BY CASE WHEN priority <= 1 THEN 0 ELSE 1 END, created_at ASC",
                );
            }
            ReadySort::Priority => sql.push_str(" ORDER BY priority ASC, created_at ASC"),
            ReadySort::Oldest => sql.push_str(" ORDER BY created_at ASC"),
        }

        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(AsRef::as_ref).collect();
        let ids = stmt
            .query_map(refs.as_slice(), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut issues = Vec::new();
        for id in ids {
            if blocked.contains(&id) {
                continue;
            }
            if let Some(issue) = crate::storage::get_issue_conn(conn, &id)? {
                issues.push(issue);
            }
            if let Some(limit) = filters.limit {
                if issues.len() >= limit {
                    break;
                }
            }
        }
        Ok(issues)
    })
}

// ============================================================================
// Cycle detection
// ============================================================================

/// Would adding the edge `from -> to` close a cycle? Searches outgoing
/// cycle-relevant edges from `to`; returns the offending path when `from` is
/// reachable. Performs no writes.
pub(crate) fn find_cycle_path(
    conn: &Connection,
    from: &str,
    to: &str,
) -> Result<Option<String>> {
    let mut stmt = conn.prepare(
        "SELECT depends_on_id FROM dependencies
         WHERE issue_id = ?
           AND type IN ('blocks', 'parent-child', 'conditional-blocks', 'waits-for')
           AND depends_on_id NOT LIKE 'external:%'",
    )?;

    // Iterative DFS carrying the path for the error message.
    let mut visited: HashSet<String> = HashSet::new();
    let mut stack: Vec<(String, Vec<String>, usize)> =
        vec![(to.to_string(), vec![from.to_string(), to.to_string()], 1)];

    while let Some((current, path, depth)) = stack.pop() {
        if depth > CYCLE_DEPTH_CAP {
            tracing::warn!(cap = CYCLE_DEPTH_CAP, "cycle search hit depth cap");
            continue;
        }
        if !visited.insert(current.clone()) {
            continue;
        }
        let nexts = stmt
            .query_map([&current], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for next in nexts {
            if next == from {
                let mut full = path.clone();
                full.push(from.to_string());
                return Ok(Some(full.join(" -> ")));
            }
            let mut next_path = path.clone();
            next_path.push(next.clone());
            stack.push((next, next_path, depth + 1));
        }
    }
    Ok(None)
}

// ============================================================================
// Dependency tree
// ============================================================================

/// Build the dependency tree below `root`, following the depends-on
/// direction. A visited set flattens DAGs by first visit; `max_depth` bounds
/// recursion (see [`TREE_DEPTH_DEFAULT`]).
pub fn dependency_tree(
    store: &SqliteStore,
    root_id: &str,
    max_depth: usize,
) -> Result<DependencyNode> {
    store.read(|conn| {
        let root = crate::storage::get_issue_conn(conn, root_id)?.ok_or(
            crate::error::Error::NotFound {
                id: root_id.to_string(),
            },
        )?;
        let mut visited = HashSet::new();
        visited.insert(root_id.to_string());
        let children = tree_children(conn, root_id, 1, max_depth, &mut visited)?;
        Ok(DependencyNode {
            issue: root,
            depth: 0,
            incoming_type: None,
            children,
        })
    })
}

fn tree_children(
    conn: &Connection,
    issue_id: &str,
    depth: usize,
    max_depth: usize,
    visited: &mut HashSet<String>,
) -> Result<Vec<DependencyNode>> {
    if depth > max_depth {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT depends_on_id, type FROM dependencies
         WHERE issue_id = ? AND depends_on_id NOT LIKE 'external:%'
         ORDER BY depends_on_id",
    )?;
    let edges = stmt
        .query_map([issue_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut nodes = Vec::new();
    for (target, type_str) in edges {
        if !visited.insert(target.clone()) {
            continue;
        }
        let Some(issue) = crate::storage::get_issue_conn(conn, &target)? else {
            continue;
        };
        let children = tree_children(conn, &target, depth + 1, max_depth, visited)?;
        nodes.push(DependencyNode {
            issue,
            depth,
            incoming_type: type_str.parse::<DependencyType>().ok(),
            children,
        });
    }
    Ok(nodes)
}

/// Ready predicate applied to a single issue against the current cache.
pub fn is_ready(store: &SqliteStore, issue: &Issue) -> Result<bool> {
    if !issue.is_ready_candidate(Utc::now()) {
        return Ok(false);
    }
    Ok(!is_blocked(store, &issue.id)?)
}
