//! Core engine of the beads issue tracker.
//!
//! A local-first issue store: work items live in an embedded SQLite
//! database under `.beads/` and synchronize across collaborators through a
//! line-oriented JSONL file checked into version control. The engine never
//! runs version-control commands; it writes only inside the workspace
//! directory and only when asked.
//!
//! The load-bearing pieces:
//!
//! - [`storage`] - CRUD with transactional side effects (audit events,
//!   dirty marks, cache invalidation land in the same transaction as the
//!   mutation they describe)
//! - [`graph`] - the ready/blocked engine: a materialized blocked cache,
//!   cycle detection on blocking edges, dependency trees
//! - [`sync`] - content-addressed export/import over the JSONL stream,
//!   with four-phase collision resolution and optional three-way merge
//!
//! # Example
//!
//! ```no_run
//! use beads_core::storage::{NewIssue, SqliteStore};
//! use beads_core::util::Cancel;
//!
//! # fn main() -> beads_core::Result<()> {
//! let store = SqliteStore::open(std::path::Path::new(".beads/beads.db"))?;
//! let cancel = Cancel::new();
//! let issue = store.create_issue(
//!     &NewIssue {
//!         title: "Wire up the frobnicator".to_string(),
//!         ..NewIssue::default()
//!     },
//!     "alice",
//!     &cancel,
//! )?;
//! let ready = beads_core::graph::ready_issues(&store, &Default::default())?;
//! assert!(ready.iter().any(|i| i.id == issue.id));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod model;
pub mod storage;
pub mod sync;
pub mod util;
pub mod validation;
pub mod workspace;

pub use error::{ConflictKind, Error, Result};
pub use model::{
    Comment, Dependency, DependencyNode, DependencyType, EpicStatus, Event, EventType, Issue,
    IssueType, Priority, Status, WaitGate,
};
pub use storage::{IssueUpdate, ListFilters, NewIssue, SqliteStore, Stats};
pub use workspace::Workspace;
