//! Connection management: pooling, pragmas, and the reconnect lock.
//!
//! File-backed stores hold up to CPU+1 connections with two kept idle and a
//! five-minute idle timeout. In-memory stores hold exactly one connection
//! (dropping it would drop the data). Every connection gets the same pragma
//! set on open.

use std::path::PathBuf;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::storage::schema;

const IDLE_TARGET: usize = 2;
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    Memory,
}

impl StoreLocation {
    #[must_use]
    pub const fn is_memory(&self) -> bool {
        matches!(self, Self::Memory)
    }
}

struct IdleConn {
    conn: Connection,
    parked_at: Instant,
}

struct PoolState {
    idle: Vec<IdleConn>,
    /// Connections currently alive, checked out or idle.
    total: usize,
}

/// A small blocking connection pool over rusqlite.
pub struct ConnectionPool {
    location: StoreLocation,
    max_connections: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("location", &self.location)
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Open a pool, running migrations on the first connection.
    pub fn open(location: StoreLocation) -> Result<Self> {
        let max_connections = if location.is_memory() {
            1
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
                + 1
        };

        let mut first = open_connection(&location)?;
        schema::migrate(&mut first)?;

        Ok(Self {
            location,
            max_connections,
            state: Mutex::new(PoolState {
                idle: vec![IdleConn {
                    conn: first,
                    parked_at: Instant::now(),
                }],
                total: 1,
            }),
            available: Condvar::new(),
        })
    }

    #[must_use]
    pub const fn location(&self) -> &StoreLocation {
        &self.location
    }

    #[must_use]
    pub const fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Check a connection out, opening a new one when under the cap and
    /// blocking (up to the busy timeout) when at it.
    pub fn checkout(&self) -> Result<PooledConn<'_>> {
        let deadline = Instant::now() + CHECKOUT_TIMEOUT;
        let mut state = self.state.lock().map_err(|_| poisoned())?;

        loop {
            if let Some(idle) = state.idle.pop() {
                return Ok(PooledConn {
                    conn: Some(idle.conn),
                    pool: self,
                });
            }
            if state.total < self.max_connections {
                state.total += 1;
                drop(state);
                // Open outside the lock; undo the reservation on failure.
                match open_connection(&self.location) {
                    Ok(conn) => {
                        return Ok(PooledConn {
                            conn: Some(conn),
                            pool: self,
                        })
                    }
                    Err(e) => {
                        if let Ok(mut state) = self.state.lock() {
                            state.total -= 1;
                        }
                        self.available.notify_one();
                        return Err(e);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Locked {
                    path: match &self.location {
                        StoreLocation::File(p) => p.clone(),
                        StoreLocation::Memory => PathBuf::from(":memory:"),
                    },
                });
            }
            let (next, _timeout) = self
                .available
                .wait_timeout(state, deadline - now)
                .map_err(|_| poisoned())?;
            state = next;
        }
    }

    fn checkin(&self, conn: Connection) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.idle.push(IdleConn {
            conn,
            parked_at: Instant::now(),
        });
        self.prune_locked(&mut state);
        drop(state);
        self.available.notify_one();
    }

    /// Drop idle file connections beyond the idle target once they exceed
    /// the idle timeout. Memory connections are never pruned.
    fn prune_locked(&self, state: &mut PoolState) {
        if self.location.is_memory() {
            return;
        }
        while state.idle.len() > IDLE_TARGET {
            let oldest = state
                .idle
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| c.parked_at)
                .map(|(i, c)| (i, c.parked_at));
            match oldest {
                Some((i, parked_at)) if parked_at.elapsed() >= IDLE_TIMEOUT => {
                    state.idle.remove(i);
                    state.total -= 1;
                }
                _ => break,
            }
        }
    }

    /// Discard every idle connection and reopen one. The caller must hold
    /// the store's reconnect write lock, which excludes all other
    /// operations; connections still checked out are abandoned to their
    /// holders.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let dropped = state.idle.len();
        state.total -= dropped;
        state.idle.clear();

        let conn = open_connection(&self.location)?;
        state.idle.push(IdleConn {
            conn,
            parked_at: Instant::now(),
        });
        state.total += 1;
        tracing::warn!(dropped, "reset connection pool");
        Ok(())
    }
}

fn poisoned() -> Error {
    Error::Config("connection pool mutex poisoned".into())
}

fn open_connection(location: &StoreLocation) -> Result<Connection> {
    let conn = match location {
        StoreLocation::File(path) => Connection::open(path)?,
        StoreLocation::Memory => Connection::open_in_memory()?,
    };
    apply_pragmas(&conn, location)?;
    Ok(conn)
}

/// Pragmas applied to every connection: foreign keys on, 30 s busy timeout,
/// WAL journaling (delete-mode fallback where WAL is unsupported), normal
/// sync, 64 MiB page cache, memory temp store, 256 MiB mmap.
fn apply_pragmas(conn: &Connection, location: &StoreLocation) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_secs(30))?;

    if location.is_memory() {
        conn.pragma_update(None, "journal_mode", "MEMORY")?;
    } else {
        // WAL fails on some network filesystems; fall back to rollback
        // journaling rather than refusing to open.
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(mode = %mode, "WAL unavailable, using delete journal");
            conn.pragma_update(None, "journal_mode", "DELETE")?;
        }
    }

    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", "-65536")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "mmap_size", "268435456")?;
    Ok(())
}

/// A checked-out connection; returns to the pool on drop.
pub struct PooledConn<'a> {
    conn: Option<Connection>,
    pool: &'a ConnectionPool,
}

impl std::ops::Deref for PooledConn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl std::ops::DerefMut for PooledConn<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConn<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn);
        }
    }
}
