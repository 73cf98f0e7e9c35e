//! The `database` capability: a pooled handle plus scoped transactions.

use std::fmt;
use std::str::FromStr;

use capbridge_core::{Deadline, Error, Result, Value};
use rusqlite::Connection;

use crate::convert::{collect_rows, sql_error, to_sql};
use crate::isolation::{sqlite_plan, IsolationLevel};
use crate::pool::{ConnectionPool, SqliteTarget};

/// Connections per database when the configuration does not say.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Supported database drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Driver {
    Sqlite,
}

impl Driver {
    pub fn name(self) -> &'static str {
        match self {
            Driver::Sqlite => "sqlite3",
        }
    }
}

impl FromStr for Driver {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite3" | "sqlite" => Ok(Driver::Sqlite),
            other => Err(Error::upstream(
                format!("open database with driver {:?}", other),
                "unsupported database driver",
            )),
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Statements are bounded by the busy timeout set at checkout, so only a
/// cancelled deadline stops one from starting.
fn ensure_live(deadline: &Deadline, operation: &str) -> Result<()> {
    if deadline.is_cancelled() {
        Err(Error::timeout(operation))
    } else {
        Ok(())
    }
}

fn run_query(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare(sql).map_err(|e| sql_error("prepare query", e))?;
    collect_rows(&mut stmt, params)
}

fn run_exec(conn: &Connection, sql: &str, params: &[Value]) -> Result<u64> {
    let affected = conn
        .execute(sql, rusqlite::params_from_iter(params.iter().map(to_sql)))
        .map_err(|e| sql_error("execute statement", e))?;
    Ok(affected as u64)
}

/// A database opened from `(driver, connection)`.
///
/// The registry caches one `Database` per driver and connection string, so
/// every script sharing a connection string shares this pool.
#[derive(Debug)]
pub struct Database {
    driver: Driver,
    connection: String,
    pool: ConnectionPool,
}

impl Database {
    /// Open and ping the database. An unreachable database fails here
    /// rather than on first use.
    pub fn open(driver: &str, connection: &str, pool_size: usize) -> Result<Self> {
        let driver: Driver = driver.parse()?;
        let pool = ConnectionPool::new(SqliteTarget::parse(connection), pool_size);
        let db = Self {
            driver,
            connection: connection.to_string(),
            pool,
        };

        let conn = db.pool.checkout(&Deadline::after(crate::pool::DEFAULT_BUSY_TIMEOUT))?;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| sql_error("ping database", e))?;
        drop(conn);

        tracing::info!(driver = %db.driver, connection, pool_size = db.pool.max_size(), "database opened");
        Ok(db)
    }

    pub fn driver(&self) -> Driver {
        self.driver
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Run a query outside any transaction and return every row.
    pub fn query(&self, sql: &str, params: &[Value], deadline: &Deadline) -> Result<Vec<Value>> {
        let conn = self.pool.checkout(deadline)?;
        ensure_live(deadline, "database query")?;
        run_query(&conn, sql, params)
    }

    /// Run a statement outside any transaction. Returns affected rows.
    pub fn exec(&self, sql: &str, params: &[Value], deadline: &Deadline) -> Result<u64> {
        let conn = self.pool.checkout(deadline)?;
        ensure_live(deadline, "database exec")?;
        run_exec(&conn, sql, params)
    }

    /// Run `body` inside a transaction at `isolation`.
    ///
    /// If `body` fails the transaction is rolled back and the error is
    /// returned unchanged. If `body` returns without committing or rolling
    /// back, the transaction is rolled back. A panic in `body` rolls back
    /// when the connection is released during unwinding.
    pub fn transaction<T, F>(&self, isolation: IsolationLevel, deadline: &Deadline, body: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let plan = sqlite_plan(isolation)?;
        let conn = self.pool.checkout(deadline)?;
        ensure_live(deadline, "begin transaction")?;
        conn.execute_batch(plan.begin)
            .map_err(|e| sql_error("begin transaction", e))?;
        tracing::debug!(isolation = %plan.effective, "transaction started");

        let mut tx = Transaction {
            conn: &conn,
            deadline: deadline.clone(),
            outcome: None,
        };
        let result = body(&mut tx);
        let outcome = tx.outcome;

        match (result, outcome) {
            (Ok(value), Some(_)) => Ok(value),
            (Ok(value), None) => {
                tracing::warn!("transaction finished without commit or rollback, rolling back");
                conn.execute_batch("ROLLBACK")
                    .map_err(|e| sql_error("rollback transaction", e))?;
                Ok(value)
            }
            (Err(e), outcome) => {
                if outcome.is_none() && !conn.is_autocommit() {
                    if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                        tracing::warn!(%rollback, "rollback after failed transaction body failed");
                    }
                }
                tracing::debug!(error = %e, "transaction body failed, rolled back");
                Err(e)
            }
        }
    }
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    RolledBack,
}

/// A transaction in progress, only reachable inside
/// [`Database::transaction`].
pub struct Transaction<'a> {
    conn: &'a Connection,
    deadline: Deadline,
    outcome: Option<Outcome>,
}

impl Transaction<'_> {
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if let Some(outcome) = self.outcome {
            return Err(Error::illegal_state(format!(
                "cannot {} after transaction {}",
                operation,
                match outcome {
                    Outcome::Committed => "committed",
                    Outcome::RolledBack => "rolled back",
                }
            )));
        }
        ensure_live(&self.deadline, operation)
    }

    pub fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Value>> {
        self.ensure_open("query")?;
        run_query(self.conn, sql, params)
    }

    pub fn exec(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open("exec")?;
        run_exec(self.conn, sql, params)
    }

    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open("commit")?;
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| sql_error("commit transaction", e))?;
        self.outcome = Some(Outcome::Committed);
        tracing::debug!("transaction committed");
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        if let Some(outcome) = self.outcome {
            return Err(Error::illegal_state(format!(
                "transaction already ended ({:?})",
                outcome
            )));
        }
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| sql_error("rollback transaction", e))?;
        self.outcome = Some(Outcome::RolledBack);
        tracing::debug!("transaction rolled back");
        Ok(())
    }
}
