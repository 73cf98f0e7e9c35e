//! The seam between the host and script engines.

use capbridge_core::{Result, Value};
use capbridge_registry::CapabilityRegistry;
use capbridge_stream::RequestStreamContext;

/// Runs one request. The returned value becomes the response envelope
/// unless the handler already wrote or upgraded the response itself.
///
/// Handlers run on blocking threads and may block freely; every blocking
/// capability call should use a deadline derived from `ctx` so that a
/// request timeout or client disconnect ends the wait.
pub trait Handler: Send + Sync {
    fn handle(&self, ctx: &mut RequestStreamContext, caps: &CapabilityRegistry) -> Result<Value>;
}

impl<F> Handler for F
where
    F: Fn(&mut RequestStreamContext, &CapabilityRegistry) -> Result<Value> + Send + Sync,
{
    fn handle(&self, ctx: &mut RequestStreamContext, caps: &CapabilityRegistry) -> Result<Value> {
        self(ctx, caps)
    }
}
