//! The request runtime: routing, the worker pool and dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use capbridge_core::{Deadline, Error, HolderId, Result as CapResult, Value};
use capbridge_registry::CapabilityRegistry;
use capbridge_stream::{RequestHead, RequestIo, RequestStreamContext};
use tokio::sync::Semaphore;

use crate::config::RuntimeConfig;
use crate::envelope::Envelope;
use crate::error::{HostError, Result};
use crate::handler::Handler;
use crate::invocation::{Invocation, InvocationHandle, InvocationOutcome, InvocationState};
use crate::router::{RouteMatch, Router};

/// Owns the capability registry and runs handlers on a bounded pool.
///
/// Each request gets its own [`RequestStreamContext`] with the configured
/// service timeout and a cancel token. Handlers run on tokio's blocking
/// pool; at most `workers` of them at once.
pub struct Runtime {
    config: RuntimeConfig,
    registry: Arc<CapabilityRegistry>,
    router: Router,
    handlers: HashMap<String, Arc<dyn Handler>>,
    workers: Arc<Semaphore>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("routes", &self.router.len())
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let mut router = Router::new();
        for route in &config.routes {
            router.add(route.name.clone(), &route.pattern, route.method.as_deref())?;
        }

        let workers = if config.workers == 0 {
            tracing::warn!("worker count of zero raised to one");
            1
        } else {
            config.workers
        };

        Ok(Self {
            registry: Arc::new(CapabilityRegistry::new(config.registry.clone())),
            router,
            handlers: HashMap::new(),
            workers: Arc::new(Semaphore::new(workers)),
            config,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn add_route(&mut self, name: impl Into<String>, pattern: &str, method: Option<&str>) -> Result<()> {
        self.router.add(name, pattern, method)
    }

    /// Register the handler run for route `name`.
    pub fn register<H: Handler + 'static>(&mut self, name: impl Into<String>, handler: H) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Worker slots not currently in use.
    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Drop every lock held by `holder`. Nothing calls this on its own:
    /// locks outlive a timed-out request until the host decides otherwise.
    pub fn release_locks(&self, holder: HolderId) -> Vec<String> {
        self.registry.release_locks(holder)
    }

    fn timeout(&self) -> Option<Duration> {
        u64::try_from(self.config.service_timeout_ms)
            .ok()
            .map(Duration::from_millis)
    }

    /// Start running `route_name` for an already-parsed request.
    ///
    /// Must be called inside a tokio runtime. The returned [`Invocation`]
    /// exposes the handle right away so the caller can cancel it.
    pub fn submit(&self, route_name: &str, head: RequestHead, io: Box<dyn RequestIo>) -> Result<Invocation> {
        let handler = self
            .handlers
            .get(route_name)
            .cloned()
            .ok_or_else(|| HostError::RouteNotFound(route_name.to_string()))?;

        let cancel = capbridge_core::CancelToken::new();
        let ctx = RequestStreamContext::with_cancel(head, io, self.config.service_timeout_ms, cancel.clone());
        let handle = InvocationHandle::new(route_name, ctx.holder(), cancel);
        tracing::debug!(route = route_name, invocation = %handle.id(), "invocation queued");

        let task = tokio::spawn(run(
            handle.clone(),
            handler,
            Arc::clone(&self.registry),
            Arc::clone(&self.workers),
            ctx,
            Slot {
                timeout_ms: self.config.service_timeout_ms,
                timeout: self.timeout(),
            },
        ));
        Ok(Invocation::new(handle, task))
    }

    /// [`submit`](Self::submit) and wait for the outcome.
    pub async fn dispatch(&self, route_name: &str, head: RequestHead, io: Box<dyn RequestIo>) -> Result<InvocationOutcome> {
        self.submit(route_name, head, io)?.outcome().await
    }

    /// Read a request from `io`, route it and dispatch it.
    ///
    /// Paths outside the route prefix or matching no route get a 404, a
    /// route registered for another method a 405; both are also returned
    /// as errors.
    pub async fn serve(&self, io: Box<dyn RequestIo>) -> Result<InvocationOutcome> {
        let head_timeout = self.timeout();
        let (mut head, io) = tokio::task::spawn_blocking(move || read_head(io, head_timeout)).await??;

        let found = self.route(&head);
        let RouteMatch { name, variables } = match found {
            Ok(found) => found,
            Err(err) => {
                let (status, text): (u16, &'static [u8]) = match err {
                    HostError::MethodNotAllowed { .. } => (405, &b"Method not allowed"[..]),
                    _ => (404, &b"Not found"[..]),
                };
                tracing::debug!(path = head.path(), status, "request not routed");
                let timeout_ms = self.config.service_timeout_ms;
                tokio::task::spawn_blocking(move || {
                    RequestStreamContext::new(head, io, timeout_ms).respond(
                        status,
                        "text/plain; charset=utf-8",
                        text,
                    )
                })
                .await??;
                return Err(err);
            }
        };

        head.set_path_variables(variables);
        self.dispatch(&name, head, io).await
    }

    fn route(&self, head: &RequestHead) -> Result<RouteMatch> {
        let path = head
            .path()
            .strip_prefix(self.config.route_prefix.as_str())
            .ok_or_else(|| HostError::RouteNotFound(head.path().to_string()))?;
        self.router.route(head.method(), path)
    }
}

/// The whole head must arrive within the service timeout; zero means no limit.
fn read_head(
    mut io: Box<dyn RequestIo>,
    timeout: Option<Duration>,
) -> Result<(RequestHead, Box<dyn RequestIo>)> {
    let deadline = timeout
        .filter(|t| !t.is_zero())
        .map_or_else(Deadline::never, Deadline::after);
    let head = RequestHead::read_from_within(&mut io, &deadline)?;
    io.set_read_timeout(None)?;
    Ok((head, io))
}

struct Slot {
    timeout_ms: i64,
    timeout: Option<Duration>,
}

async fn run(
    handle: InvocationHandle,
    handler: Arc<dyn Handler>,
    registry: Arc<CapabilityRegistry>,
    workers: Arc<Semaphore>,
    mut ctx: RequestStreamContext,
    slot: Slot,
) -> InvocationOutcome {
    let permit = match workers.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            ctx.abort();
            return handle.finish(
                InvocationState::Failed,
                Err(Error::illegal_state("worker pool closed")),
            );
        }
    };
    if handle.is_cancelled() {
        ctx.abort();
        return handle.finish(
            InvocationState::Failed,
            Err(Error::illegal_state("invocation cancelled before it started")),
        );
    }

    // The service timeout counts from the moment a worker picks the request up.
    ctx.reset_timeout(slot.timeout_ms);
    handle.set_state(InvocationState::Running);
    tracing::debug!(route = handle.route(), invocation = %handle.id(), "invocation running");

    let task = tokio::task::spawn_blocking({
        let handle = handle.clone();
        move || {
            let _permit = permit;
            let result = handler.handle(&mut ctx, &registry);
            let expired = ctx.deadline().is_expired();
            finish_response(&mut ctx, &handle, &result);
            (result, expired)
        }
    });

    let joined = match slot.timeout {
        Some(limit) => match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined,
            Err(_) => {
                let outcome = handle.finish(InvocationState::TimedOut, Err(Error::timeout("run service")));
                handle.cancel_token().cancel();
                tracing::info!(
                    route = handle.route(),
                    invocation = %handle.id(),
                    timeout_ms = slot.timeout_ms,
                    "service timed out"
                );
                return outcome;
            }
        },
        None => task.await,
    };

    match joined {
        Ok((result, true)) if handle.is_client_cancelled() => {
            let err = result
                .err()
                .unwrap_or_else(|| Error::illegal_state("invocation cancelled by client"));
            handle.finish(InvocationState::Failed, Err(err))
        }
        Ok((result, true)) => {
            tracing::info!(route = handle.route(), invocation = %handle.id(), "service timed out");
            let err = match result {
                Err(err) if err.is_timeout() => err,
                _ => Error::timeout("run service"),
            };
            handle.finish(InvocationState::TimedOut, Err(err))
        }
        Ok((Ok(value), false)) => handle.finish(InvocationState::Completed, Ok(value)),
        Ok((Err(err), false)) => {
            tracing::debug!(route = handle.route(), invocation = %handle.id(), error = %err, "handler failed");
            handle.finish(InvocationState::Failed, Err(err))
        }
        Err(join) => {
            tracing::warn!(route = handle.route(), invocation = %handle.id(), "handler panicked");
            handle.finish(InvocationState::Failed, Err(Error::upstream("run handler", join)))
        }
    }
}

/// Write the envelope unless the handler already answered.
///
/// Once the request deadline has passed nothing more is written: a service
/// timeout leaves the context `TimedOut`, a client cancel leaves it
/// `Aborted`, and the transport is dropped.
fn finish_response(ctx: &mut RequestStreamContext, handle: &InvocationHandle, result: &CapResult<Value>) {
    if ctx.deadline().is_expired() {
        if handle.is_client_cancelled() {
            ctx.abort();
        } else {
            ctx.mark_timed_out();
        }
        return;
    }
    if ctx.state().is_terminal() {
        return;
    }
    if ctx.returnless() {
        if let Err(err) = ctx.complete() {
            tracing::debug!(error = %err, "could not complete streamed response");
        }
        return;
    }

    let envelope = match result {
        Ok(value) => Envelope::success(value),
        Err(err) => Envelope::failure(err),
    };
    if let Err(err) = ctx.respond(envelope.status, envelope.content_type, &envelope.body) {
        tracing::debug!(error = %err, "could not write response envelope");
        if !ctx.state().is_terminal() {
            ctx.abort();
        }
    }
}
