//! # capbridge-host
//!
//! The request runtime in front of the capability bridge.
//!
//! A [`Runtime`] owns one [`CapabilityRegistry`](capbridge_registry::CapabilityRegistry)
//! for the life of the process, routes incoming requests by path, and runs
//! the matching [`Handler`] on a bounded worker pool. Handlers receive a
//! [`RequestStreamContext`](capbridge_stream::RequestStreamContext) bounded
//! by the service timeout and return a value the host wraps in its response
//! envelope.
//!
//! ## Example
//!
//! ```rust,no_run
//! use capbridge_core::{Result, Value};
//! use capbridge_host::{Runtime, RuntimeConfig};
//! use capbridge_registry::CapabilityRegistry;
//! use capbridge_stream::RequestStreamContext;
//!
//! # async fn example(stream: std::net::TcpStream) -> capbridge_host::Result<()> {
//! let mut runtime = Runtime::new(RuntimeConfig::default())?;
//! runtime.add_route("hello", "hello/{name}", Some("GET"))?;
//! runtime.register("hello", |ctx: &mut RequestStreamContext, _caps: &CapabilityRegistry| -> Result<Value> {
//!     Ok(Value::from(format!("hello {}", ctx.path_variable("name").unwrap_or("?"))))
//! });
//! let outcome = runtime.serve(Box::new(stream)).await?;
//! println!("{:?}", outcome.state);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod invocation;
pub mod router;
pub mod runtime;

pub use config::{RouteConfig, RuntimeConfig, DEFAULT_SERVICE_TIMEOUT_MS, DEFAULT_WORKERS};
pub use envelope::Envelope;
pub use error::{HostError, Result};
pub use handler::Handler;
pub use invocation::{Invocation, InvocationHandle, InvocationId, InvocationOutcome, InvocationState};
pub use router::{RouteMatch, Router};
pub use runtime::Runtime;
