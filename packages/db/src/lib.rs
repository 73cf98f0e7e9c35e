//! # capbridge-db
//!
//! The `database` capability. A [`Database`] is opened from a driver name
//! and a connection string, pooled, and shared by every script that names
//! the same pair.
//!
//! Transactions are scoped: [`Database::transaction`] hands the body a
//! [`Transaction`] and guarantees it is finished when the body returns,
//! fails or panics.
//!
//! ```rust
//! use capbridge_core::{Deadline, Value};
//! use capbridge_db::{Database, IsolationLevel};
//!
//! let db = Database::open("sqlite3", ":memory:", 1).unwrap();
//! let deadline = Deadline::from_timeout_ms(1_000);
//! db.exec("CREATE TABLE t (v INTEGER)", &[], &deadline).unwrap();
//! db.transaction(IsolationLevel::Default, &deadline, |tx| {
//!     tx.exec("INSERT INTO t VALUES (?1)", &[Value::from(7)])?;
//!     tx.commit()
//! })
//! .unwrap();
//! assert_eq!(db.query("SELECT v FROM t", &[], &deadline).unwrap().len(), 1);
//! ```

pub mod convert;
pub mod database;
pub mod isolation;
pub mod pool;

pub use database::{Database, Driver, Outcome, Transaction, DEFAULT_POOL_SIZE};
pub use isolation::{sqlite_plan, IsolationLevel, IsolationPlan};
pub use pool::{ConnectionPool, PooledConnection, SqliteTarget};
