//! # capbridge-stream
//!
//! The per-request side of the bridge. A [`RequestStreamContext`] wraps one
//! inbound request: its parsed [`RequestHead`], the transport it arrived
//! on, and a resettable [`Deadline`](capbridge_core::Deadline) that bounds
//! body reads and every capability call made on the request's behalf.
//!
//! A context moves through [`StreamState`]s:
//!
//! ```text
//! Created -> HeaderRead -> BodyStreaming -> Completed | TimedOut | Aborted
//!                                        \-> Upgraded (WebSocket)
//! ```

pub mod context;
pub mod io;
pub mod request;
pub mod websocket;

pub use context::{BodyReader, RequestStreamContext, StreamState};
pub use io::{duplex, MemoryConnection, RequestIo};
pub use request::{RequestHead, MAX_HEAD_BYTES};
pub use websocket::{accept_key, encode_frame, Message, MessageKind, WebSocket, MAX_MESSAGE_BYTES};
