//! A small blocking connection pool.
//!
//! Connections are opened lazily up to `max_size`. A checkout that finds
//! the pool drained waits on a condvar bounded by the caller's deadline.

use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use capbridge_core::sync::lock;
use capbridge_core::{Deadline, Error, Result};
use rusqlite::Connection;

use crate::convert::sql_error;

/// How long SQLite retries a locked database when the caller has no deadline.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where connections come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteTarget {
    Memory,
    File(PathBuf),
}

impl SqliteTarget {
    pub fn parse(connection: &str) -> Self {
        match connection.trim() {
            "" | ":memory:" => SqliteTarget::Memory,
            path => SqliteTarget::File(PathBuf::from(path)),
        }
    }

    fn open(&self) -> Result<Connection> {
        let conn = match self {
            SqliteTarget::Memory => Connection::open_in_memory(),
            SqliteTarget::File(path) => Connection::open(path),
        };
        conn.map_err(|e| sql_error("open sqlite connection", e))
    }
}

struct PoolState {
    idle: Vec<Connection>,
    created: usize,
}

pub struct ConnectionPool {
    target: SqliteTarget,
    max_size: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.target)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// An in-memory target always gets a single connection so every
    /// statement sees the same database.
    pub fn new(target: SqliteTarget, max_size: usize) -> Self {
        let max_size = match target {
            SqliteTarget::Memory => max_size.min(1),
            SqliteTarget::File(_) => max_size,
        };
        Self {
            target,
            max_size,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                created: 0,
            }),
            available: Condvar::new(),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Connections opened so far.
    pub fn created(&self) -> usize {
        lock(&self.state).created
    }

    pub fn idle(&self) -> usize {
        lock(&self.state).idle.len()
    }

    /// Take a connection, waiting until `deadline` for one to be returned.
    pub fn checkout(&self, deadline: &Deadline) -> Result<PooledConnection<'_>> {
        if self.max_size == 0 {
            return Err(Error::exhausted("database pool has zero connections"));
        }

        let max = self.max_size;
        let (mut state, ready) = deadline.wait_while(&self.available, lock(&self.state), |s| {
            s.idle.is_empty() && s.created >= max
        });
        if !ready {
            return Err(Error::timeout("check out a database connection"));
        }

        let conn = match state.idle.pop() {
            Some(conn) => conn,
            None => {
                state.created += 1;
                let created = state.created;
                drop(state);
                match self.target.open() {
                    Ok(conn) => {
                        tracing::debug!(created, max = self.max_size, "opened pooled connection");
                        conn
                    }
                    Err(e) => {
                        lock(&self.state).created -= 1;
                        self.available.notify_one();
                        return Err(e);
                    }
                }
            }
        };

        let busy = deadline
            .remaining()
            .unwrap_or(DEFAULT_BUSY_TIMEOUT)
            .max(Duration::from_millis(1));
        if let Err(e) = conn.busy_timeout(busy) {
            self.give_back(conn);
            return Err(sql_error("set busy timeout", e));
        }

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self,
        })
    }

    fn give_back(&self, conn: Connection) {
        lock(&self.state).idle.push(conn);
        self.available.notify_one();
    }
}

/// A checked-out connection, returned to the pool on drop.
///
/// A connection dropped mid-transaction (for example while unwinding from a
/// panicking script) is rolled back before it goes back.
pub struct PooledConnection<'a> {
    conn: Option<Connection>,
    pool: &'a ConnectionPool,
}

impl std::fmt::Debug for PooledConnection<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !conn.is_autocommit() {
                tracing::warn!("connection returned inside a transaction, rolling back");
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    tracing::warn!(%e, "rollback on release failed");
                }
            }
            self.pool.give_back(conn);
        }
    }
}
