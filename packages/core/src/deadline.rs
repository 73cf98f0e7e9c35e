//! Deadlines bounding every blocking capability call.
//!
//! A [`Deadline`] is a plain value: an optional absolute instant plus any
//! number of [`CancelToken`]s. It is threaded explicitly through each
//! blocking operation instead of being registered as a timer, so request
//! scoped deadlines and per-call timeouts compose with [`Deadline::min`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Longest a cancellable wait sleeps before re-checking its tokens.
pub const CANCEL_POLL_SLICE: Duration = Duration::from_millis(20);

/// Shared flag that expires every deadline carrying it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// An absolute bound on how long a blocking operation may wait.
#[derive(Clone, Debug, Default)]
pub struct Deadline {
    at: Option<Instant>,
    tokens: Vec<CancelToken>,
}

impl Deadline {
    /// A deadline that never passes on its own.
    pub fn never() -> Self {
        Self::default()
    }

    /// A deadline that has already passed: operations only check, never wait.
    pub fn immediate() -> Self {
        Self::at(Instant::now())
    }

    pub fn after(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(at) => Self::at(at),
            None => Self::never(),
        }
    }

    pub fn at(instant: Instant) -> Self {
        Self {
            at: Some(instant),
            tokens: Vec::new(),
        }
    }

    /// Interpret a script-supplied timeout in milliseconds.
    ///
    /// Zero means a non-blocking check and a negative value means no timeout.
    pub fn from_timeout_ms(timeout_ms: i64) -> Self {
        match timeout_ms {
            t if t < 0 => Self::never(),
            0 => Self::immediate(),
            t => Self::after(Duration::from_millis(t as u64)),
        }
    }

    /// Attach a cancel token.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        if !self.tokens.iter().any(|t| t.same_as(&token)) {
            self.tokens.push(token);
        }
        self
    }

    /// The tighter of two deadlines. Cancel tokens from both sides are kept.
    pub fn min(&self, other: &Deadline) -> Deadline {
        let at = match (self.at, other.at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let mut combined = Deadline {
            at,
            tokens: self.tokens.clone(),
        };
        for token in &other.tokens {
            combined = combined.with_cancel(token.clone());
        }
        combined
    }

    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    pub fn is_cancelled(&self) -> bool {
        self.tokens.iter().any(CancelToken::is_cancelled)
    }

    pub fn is_expired(&self) -> bool {
        self.is_cancelled() || self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left before expiry; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        if self.is_cancelled() {
            return Some(Duration::ZERO);
        }
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// How long one blocking wait may sleep before the deadline must be
    /// re-checked. `None` means wait until woken.
    pub fn wait_slice(&self) -> Option<Duration> {
        let remaining = self.remaining();
        if self.tokens.is_empty() {
            return remaining;
        }
        Some(remaining.map_or(CANCEL_POLL_SLICE, |r| r.min(CANCEL_POLL_SLICE)))
    }

    /// Block on `condvar` while `blocked` holds, or until this deadline expires.
    ///
    /// Returns the guard and whether the condition cleared. The condition is
    /// always evaluated before the deadline, so an immediate deadline still
    /// succeeds when the state is already ready.
    pub fn wait_while<'a, T, F>(
        &self,
        condvar: &Condvar,
        mut guard: MutexGuard<'a, T>,
        mut blocked: F,
    ) -> (MutexGuard<'a, T>, bool)
    where
        F: FnMut(&mut T) -> bool,
    {
        loop {
            if !blocked(&mut guard) {
                return (guard, true);
            }
            if self.is_expired() {
                return (guard, false);
            }
            guard = match self.wait_slice() {
                None => condvar.wait(guard).unwrap_or_else(PoisonError::into_inner),
                Some(slice) => {
                    condvar
                        .wait_timeout(guard, slice)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}
