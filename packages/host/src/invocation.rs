//! Per-request bookkeeping shared between the dispatcher and its caller.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use capbridge_core::sync::lock;
use capbridge_core::{CancelToken, Error, HolderId, Value};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::Result;

/// Unique identifier for one dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvocationId(Uuid);

impl InvocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationState {
    /// Waiting for a worker slot.
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl InvocationState {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            InvocationState::Completed | InvocationState::Failed | InvocationState::TimedOut
        )
    }
}

/// Cheap, cloneable view of a running invocation.
#[derive(Debug, Clone)]
pub struct InvocationHandle {
    id: InvocationId,
    route: Arc<str>,
    holder: HolderId,
    state: Arc<Mutex<InvocationState>>,
    cancel: CancelToken,
    client_cancelled: Arc<AtomicBool>,
}

impl InvocationHandle {
    pub(crate) fn new(route: &str, holder: HolderId, cancel: CancelToken) -> Self {
        Self {
            id: InvocationId::new(),
            route: Arc::from(route),
            holder,
            state: Arc::new(Mutex::new(InvocationState::Queued)),
            cancel,
            client_cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> InvocationId {
        self.id
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    /// Holder identity of the request's context, for lock cleanup.
    pub fn holder(&self) -> HolderId {
        self.holder
    }

    pub fn state(&self) -> InvocationState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, state: InvocationState) {
        *lock(&self.state) = state;
    }

    /// Trip the invocation's cancel token, as on client disconnect.
    /// Blocking capability calls made for the request stop waiting.
    pub fn cancel(&self) {
        self.client_cancelled.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Whether [`cancel`](Self::cancel) was called, as opposed to the token
    /// tripping on a service timeout.
    pub fn is_client_cancelled(&self) -> bool {
        self.client_cancelled.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub(crate) fn finish(&self, state: InvocationState, result: std::result::Result<Value, Error>) -> InvocationOutcome {
        self.set_state(state);
        let (value, error) = match result {
            Ok(value) => (Some(value), None),
            Err(error) => (None, Some(error)),
        };
        InvocationOutcome {
            id: self.id,
            state,
            value,
            error,
        }
    }
}

/// Final report for one invocation.
#[derive(Debug)]
pub struct InvocationOutcome {
    pub id: InvocationId,
    pub state: InvocationState,
    pub value: Option<Value>,
    pub error: Option<Error>,
}

impl InvocationOutcome {
    pub fn is_success(&self) -> bool {
        self.state == InvocationState::Completed
    }
}

/// A submitted request: its handle plus the task producing its outcome.
#[derive(Debug)]
pub struct Invocation {
    handle: InvocationHandle,
    task: JoinHandle<InvocationOutcome>,
}

impl Invocation {
    pub(crate) fn new(handle: InvocationHandle, task: JoinHandle<InvocationOutcome>) -> Self {
        Self { handle, task }
    }

    pub fn handle(&self) -> &InvocationHandle {
        &self.handle
    }

    pub async fn outcome(self) -> Result<InvocationOutcome> {
        Ok(self.task.await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_clones_share_state_and_cancel() {
        let handle = InvocationHandle::new("r", HolderId::new(), CancelToken::new());
        let other = handle.clone();
        assert_eq!(other.state(), InvocationState::Queued);
        handle.set_state(InvocationState::Running);
        assert_eq!(other.state(), InvocationState::Running);
        other.cancel();
        assert!(handle.is_cancelled());
        assert!(handle.is_client_cancelled());
        assert_eq!(handle.id(), other.id());
    }

    #[test]
    fn internal_trip_is_not_a_client_cancel() {
        let handle = InvocationHandle::new("r", HolderId::new(), CancelToken::new());
        handle.cancel_token().cancel();
        assert!(handle.is_cancelled());
        assert!(!handle.is_client_cancelled());
    }

    #[test]
    fn finish_splits_result() {
        let handle = InvocationHandle::new("r", HolderId::new(), CancelToken::new());
        let outcome = handle.finish(InvocationState::Failed, Err(Error::illegal_state("boom")));
        assert_eq!(handle.state(), InvocationState::Failed);
        assert!(outcome.value.is_none());
        assert!(outcome.error.is_some());
        assert!(!outcome.is_success());
        assert!(InvocationState::TimedOut.is_finished());
        assert!(!InvocationState::Queued.is_finished());
    }
}
