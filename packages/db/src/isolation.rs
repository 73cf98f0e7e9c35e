//! Transaction isolation levels and how SQLite provides them.

use std::fmt;

use capbridge_core::{Error, Result};

/// Isolation requested by a script, by ordinal 0 through 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum IsolationLevel {
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    WriteCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
    Linearizable,
}

impl IsolationLevel {
    pub const ALL: [IsolationLevel; 8] = [
        IsolationLevel::Default,
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::WriteCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Snapshot,
        IsolationLevel::Serializable,
        IsolationLevel::Linearizable,
    ];

    pub fn from_ordinal(ordinal: i64) -> Result<Self> {
        usize::try_from(ordinal)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or_else(|| Error::unsupported_isolation(format!("ordinal {}", ordinal)))
    }

    pub fn ordinal(self) -> i64 {
        self as i64
    }

    pub fn name(self) -> &'static str {
        match self {
            IsolationLevel::Default => "Default",
            IsolationLevel::ReadUncommitted => "Read Uncommitted",
            IsolationLevel::ReadCommitted => "Read Committed",
            IsolationLevel::WriteCommitted => "Write Committed",
            IsolationLevel::RepeatableRead => "Repeatable Read",
            IsolationLevel::Snapshot => "Snapshot",
            IsolationLevel::Serializable => "Serializable",
            IsolationLevel::Linearizable => "Linearizable",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a transaction is actually started for a requested level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsolationPlan {
    pub requested: IsolationLevel,
    pub effective: IsolationLevel,
    pub begin: &'static str,
}

impl IsolationPlan {
    pub fn upgraded(&self) -> bool {
        self.requested != self.effective
    }
}

/// SQLite runs every transaction serializably. `Default` starts a deferred
/// transaction; explicit levels up to `Serializable` are upgraded to it and
/// take the write lock up front. Nothing stronger exists.
pub fn sqlite_plan(requested: IsolationLevel) -> Result<IsolationPlan> {
    let plan = match requested {
        IsolationLevel::Default => IsolationPlan {
            requested,
            effective: IsolationLevel::Default,
            begin: "BEGIN DEFERRED",
        },
        IsolationLevel::Linearizable => return Err(Error::unsupported_isolation(requested)),
        _ => IsolationPlan {
            requested,
            effective: IsolationLevel::Serializable,
            begin: "BEGIN IMMEDIATE",
        },
    };
    if plan.upgraded() {
        tracing::warn!(
            requested = %plan.requested,
            effective = %plan.effective,
            "isolation level not supported by sqlite, upgrading"
        );
    }
    Ok(plan)
}
