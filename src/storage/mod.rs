//! Persistent storage: schema, connection pool, store, audit events.

pub mod events;
pub mod pool;
pub mod schema;
mod store;

pub use pool::{ConnectionPool, PooledConn, StoreLocation};
pub use store::{
    IssueUpdate, ListFilters, MutationCtx, NewIssue, SqliteStore, Stats,
};

pub(crate) use store::{
    get_issue_conn, insert_dependency_tx, insert_issue_tx, issue_exists_tx, update_issue_row_tx,
};
