//! # capbridge-net
//!
//! Network capabilities: a blocking HTTP client and TCP/UDP sockets.
//!
//! Both are bounded by the caller's [`Deadline`](capbridge_core::Deadline).
//! HTTP execution goes through the [`HttpExecutor`] trait so the transport
//! can be replaced in tests.

pub mod client;
pub mod executor;
pub mod socket;
pub mod types;

pub use client::{HttpClient, HttpClientConfig, DEFAULT_HTTP_TIMEOUT_MS};
pub use executor::{HttpExecutor, ReqwestExecutor, TransportOptions};
pub use socket::{
    Datagram, Protocol, SocketConfig, SocketMode, TcpConnection, TcpListenerHandle, UdpConnection,
    DEFAULT_READ_SIZE,
};
pub use types::{HttpRequest, HttpResponse, Method};
