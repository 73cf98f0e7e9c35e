//! # capbridge-core
//!
//! Concurrency primitives behind the capability bridge.
//!
//! Scripts never touch OS primitives directly. They resolve capabilities by
//! name from a registry and get back handles to the types in this crate,
//! all of which are safe to share across request contexts without any
//! caller-side locking:
//!
//! - [`BoundedBlockingQueue`] - fixed-capacity FIFO with blocking put/poll/drain
//! - [`LockTable`] / [`NamedLock`] - process-wide mutexes keyed by name
//! - [`ExpiringCache`] - key/value store with per-entry TTL
//! - [`TopicEventBus`] - push listeners and pull subscribers per topic
//!
//! Every blocking call takes a [`Deadline`]. A deadline is a value, not a
//! registered timer: a per-call timeout and a request-wide deadline combine
//! with [`Deadline::min`], and a [`CancelToken`] expires it early.
//!
//! ```rust
//! use capbridge_core::{BoundedBlockingQueue, Deadline, Value};
//!
//! let queue = BoundedBlockingQueue::new(2);
//! queue.put(Value::from("A"), &Deadline::from_timeout_ms(1000)).unwrap();
//! assert_eq!(queue.poll(&Deadline::immediate()), Some(Value::from("A")));
//! ```

pub mod bus;
pub mod cache;
pub mod deadline;
pub mod error;
pub mod lock;
pub mod queue;
pub mod sync;
pub mod value;

pub use bus::{Delivery, ListenerHandle, Subscriber, TopicEventBus};
pub use cache::{ExpiringCache, Sweeper};
pub use deadline::{CancelToken, Deadline};
pub use error::{BoxError, Error, ErrorKind, Result};
pub use lock::{HolderId, LockTable, NamedLock};
pub use queue::BoundedBlockingQueue;
pub use value::Value;
