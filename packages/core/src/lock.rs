//! Process-wide named mutual exclusion.
//!
//! One [`LockTable`] is owned by the capability registry. Every `lock`
//! capability resolves to a [`NamedLock`] pointing into that table, so two
//! request contexts asking for `"x"` contend on the same entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::sync::lock;

/// Identity of a lock holder, one per request context or background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HolderId(Uuid);

impl HolderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for HolderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct LockEntry {
    holder: HolderId,
    acquired_at: Instant,
}

/// Table of held locks keyed by case-sensitive name.
///
/// Locks are not reentrant: a holder that locks a name it already holds
/// waits like any other contender.
#[derive(Debug, Default)]
pub struct LockTable {
    entries: Mutex<HashMap<String, LockEntry>>,
    released: Condvar,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `name` for `holder`, waiting until `deadline`.
    pub fn lock(&self, name: &str, holder: HolderId, deadline: &Deadline) -> Result<()> {
        let (mut entries, free) =
            deadline.wait_while(&self.released, lock(&self.entries), |entries| {
                entries.contains_key(name)
            });
        if !free {
            return Err(Error::timeout(format!("acquire lock {:?}", name)));
        }

        entries.insert(
            name.to_string(),
            LockEntry {
                holder,
                acquired_at: Instant::now(),
            },
        );
        tracing::trace!(lock = name, %holder, "lock acquired");
        Ok(())
    }

    /// Release `name`. Fails without touching the table unless `holder`
    /// currently holds it.
    pub fn unlock(&self, name: &str, holder: HolderId) -> Result<()> {
        let mut entries = lock(&self.entries);
        match entries.get(name) {
            Some(entry) if entry.holder == holder => {
                let held_for = entry.acquired_at.elapsed();
                entries.remove(name);
                drop(entries);
                // Waiters may be on different names; wake all so the right one proceeds.
                self.released.notify_all();
                tracing::trace!(lock = name, %holder, ?held_for, "lock released");
                Ok(())
            }
            Some(_) => {
                tracing::warn!(lock = name, %holder, "unlock by non-holder rejected");
                Err(Error::illegal_state(format!(
                    "lock {:?} is held by another caller",
                    name
                )))
            }
            None => {
                tracing::warn!(lock = name, %holder, "unlock of free lock rejected");
                Err(Error::illegal_state(format!("lock {:?} is not held", name)))
            }
        }
    }

    /// Current holder of `name`.
    pub fn holder(&self, name: &str) -> Option<HolderId> {
        lock(&self.entries).get(name).map(|entry| entry.holder)
    }

    /// How long `name` has been held.
    pub fn held_for(&self, name: &str) -> Option<Duration> {
        lock(&self.entries)
            .get(name)
            .map(|entry| entry.acquired_at.elapsed())
    }

    pub fn held_count(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Host-level cleanup: drop every lock held by `holder`.
    ///
    /// Request timeouts do not call this on their own; a host that wants
    /// crash-style cleanup calls it explicitly. Returns the released names.
    pub fn release_all(&self, holder: HolderId) -> Vec<String> {
        let mut entries = lock(&self.entries);
        let names: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.holder == holder)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            entries.remove(name);
        }
        drop(entries);
        if !names.is_empty() {
            self.released.notify_all();
            tracing::info!(%holder, count = names.len(), "released locks for holder");
        }
        names
    }
}

/// Handle to one named lock in a shared [`LockTable`].
#[derive(Debug, Clone)]
pub struct NamedLock {
    table: Arc<LockTable>,
    name: String,
}

impl NamedLock {
    pub fn new(table: Arc<LockTable>, name: impl Into<String>) -> Self {
        Self {
            table,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock(&self, holder: HolderId, deadline: &Deadline) -> Result<()> {
        self.table.lock(&self.name, holder, deadline)
    }

    pub fn unlock(&self, holder: HolderId) -> Result<()> {
        self.table.unlock(&self.name, holder)
    }

    pub fn holder(&self) -> Option<HolderId> {
        self.table.holder(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn lock_and_unlock() {
        let table = LockTable::new();
        let me = HolderId::new();
        table.lock("x", me, &Deadline::immediate()).unwrap();
        assert_eq!(table.holder("x"), Some(me));
        assert_eq!(table.held_count(), 1);
        table.unlock("x", me).unwrap();
        assert_eq!(table.holder("x"), None);
    }

    #[test]
    fn names_are_case_sensitive() {
        let table = LockTable::new();
        table.lock("x", HolderId::new(), &Deadline::immediate()).unwrap();
        table.lock("X", HolderId::new(), &Deadline::immediate()).unwrap();
        assert_eq!(table.held_count(), 2);
    }

    #[test]
    fn contender_times_out() {
        let table = LockTable::new();
        table.lock("x", HolderId::new(), &Deadline::immediate()).unwrap();
        let start = Instant::now();
        let err = table
            .lock("x", HolderId::new(), &Deadline::from_timeout_ms(50))
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn not_reentrant() {
        let table = LockTable::new();
        let me = HolderId::new();
        table.lock("x", me, &Deadline::immediate()).unwrap();
        let err = table.lock("x", me, &Deadline::from_timeout_ms(20)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn second_holder_waits_for_unlock() {
        let table = Arc::new(LockTable::new());
        let first = HolderId::new();
        let second = HolderId::new();
        table.lock("x", first, &Deadline::immediate()).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                table.lock("x", second, &Deadline::from_timeout_ms(5_000)).unwrap();
                tx.send(Instant::now()).unwrap();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());
        let released_at = Instant::now();
        table.unlock("x", first).unwrap();

        waiter.join().unwrap();
        assert!(rx.recv().unwrap() >= released_at);
        assert_eq!(table.holder("x"), Some(second));
    }

    #[test]
    fn unlock_by_stranger_keeps_entry() {
        let table = LockTable::new();
        let owner = HolderId::new();
        table.lock("x", owner, &Deadline::immediate()).unwrap();

        let err = table.unlock("x", HolderId::new()).unwrap_err();
        assert!(matches!(err, Error::IllegalState { .. }));
        assert_eq!(table.holder("x"), Some(owner));

        let err = table.unlock("free", owner).unwrap_err();
        assert!(matches!(err, Error::IllegalState { .. }));
        table.unlock("x", owner).unwrap();
    }

    #[test]
    fn release_all_frees_only_that_holder() {
        let table = LockTable::new();
        let a = HolderId::new();
        let b = HolderId::new();
        table.lock("a1", a, &Deadline::immediate()).unwrap();
        table.lock("a2", a, &Deadline::immediate()).unwrap();
        table.lock("b1", b, &Deadline::immediate()).unwrap();

        let mut released = table.release_all(a);
        released.sort();
        assert_eq!(released, vec!["a1".to_string(), "a2".to_string()]);
        assert_eq!(table.holder("b1"), Some(b));
    }

    #[test]
    fn named_lock_handles_share_table() {
        let table = Arc::new(LockTable::new());
        let one = NamedLock::new(Arc::clone(&table), "job");
        let two = NamedLock::new(Arc::clone(&table), "job");
        let me = HolderId::new();
        one.lock(me, &Deadline::immediate()).unwrap();
        assert_eq!(two.holder(), Some(me));
        assert!(two
            .lock(HolderId::new(), &Deadline::immediate())
            .unwrap_err()
            .is_timeout());
        two.unlock(me).unwrap();
    }
}
