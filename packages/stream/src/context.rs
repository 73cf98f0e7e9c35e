//! One request's streaming context.
//!
//! The context owns the transport for a single request. Script-facing
//! getters, body reads and response writes all go through it, and every
//! blocking step is bounded by the context's current deadline.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;

use capbridge_core::{CancelToken, Deadline, Error, HolderId, Result};

use crate::io::{read_some, write_all_within, RequestIo};
use crate::request::RequestHead;
use crate::websocket::{accept_key, WebSocket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Created,
    HeaderRead,
    BodyStreaming,
    Upgraded,
    Completed,
    TimedOut,
    Aborted,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Upgraded | StreamState::Completed | StreamState::TimedOut | StreamState::Aborted
        )
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Created => "created",
            StreamState::HeaderRead => "header-read",
            StreamState::BodyStreaming => "body-streaming",
            StreamState::Upgraded => "upgraded",
            StreamState::Completed => "completed",
            StreamState::TimedOut => "timed-out",
            StreamState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "",
    }
}

pub struct RequestStreamContext {
    head: RequestHead,
    io: Option<Box<dyn RequestIo>>,
    state: Cell<StreamState>,
    holder: HolderId,
    cancel: CancelToken,
    deadline: Deadline,
    body_remaining: u64,
    status: u16,
    response_headers: Vec<(String, String)>,
    head_sent: bool,
}

impl fmt::Debug for RequestStreamContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestStreamContext")
            .field("method", &self.head.method())
            .field("url", &self.head.url())
            .field("state", &self.state.get())
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl RequestStreamContext {
    /// Build a context over `io`. A negative `timeout_ms` leaves the request
    /// unbounded until [`reset_timeout`](Self::reset_timeout) is called.
    pub fn new(head: RequestHead, io: Box<dyn RequestIo>, timeout_ms: i64) -> Self {
        Self::with_cancel(head, io, timeout_ms, CancelToken::new())
    }

    /// Like [`new`](Self::new) with a token the host can trip, for example
    /// when the client disconnects.
    pub fn with_cancel(head: RequestHead, io: Box<dyn RequestIo>, timeout_ms: i64, cancel: CancelToken) -> Self {
        let body_remaining = head.content_length();
        Self {
            head,
            io: Some(io),
            state: Cell::new(StreamState::Created),
            holder: HolderId::new(),
            deadline: Deadline::from_timeout_ms(timeout_ms).with_cancel(cancel.clone()),
            cancel,
            body_remaining,
            status: 200,
            response_headers: Vec::new(),
            head_sent: false,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state.get()
    }

    /// Lock holder identity for everything this request acquires.
    pub fn holder(&self) -> HolderId {
        self.holder
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// The request-wide deadline.
    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    /// Deadline for one capability call: the caller's timeout, tightened by
    /// the request deadline.
    pub fn deadline_for(&self, timeout_ms: i64) -> Deadline {
        Deadline::from_timeout_ms(timeout_ms).min(&self.deadline)
    }

    /// Restart the request deadline from now. Negative means unbounded.
    pub fn reset_timeout(&mut self, timeout_ms: i64) {
        self.deadline = Deadline::from_timeout_ms(timeout_ms).with_cancel(self.cancel.clone());
        tracing::trace!(timeout_ms, "request deadline reset");
    }

    fn touch_head(&self) -> &RequestHead {
        if self.state.get() == StreamState::Created {
            self.state.set(StreamState::HeaderRead);
        }
        &self.head
    }

    pub fn method(&self) -> &str {
        self.touch_head().method()
    }

    pub fn url(&self) -> &str {
        self.touch_head().url()
    }

    pub fn path(&self) -> &str {
        self.touch_head().path()
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.touch_head().query(name)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.touch_head().header(name)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.touch_head().cookie(name)
    }

    pub fn path_variables(&self) -> &BTreeMap<String, String> {
        self.touch_head().path_variables()
    }

    pub fn path_variable(&self, name: &str) -> Option<&str> {
        self.touch_head().path_variable(name)
    }

    pub fn head(&self) -> &RequestHead {
        self.touch_head()
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        let state = self.state.get();
        if state.is_terminal() {
            return Err(Error::illegal_state(format!(
                "cannot {} once the request is {}",
                operation, state
            )));
        }
        Ok(())
    }

    fn io_mut(&mut self) -> Result<&mut Box<dyn RequestIo>> {
        self.io
            .as_mut()
            .ok_or_else(|| Error::illegal_state("request transport is gone"))
    }

    fn on_io_error(&self, e: &Error) {
        if e.is_timeout() {
            self.state.set(StreamState::TimedOut);
            tracing::info!(url = self.head.url(), "request timed out during i/o");
        }
    }

    /// Stream the request body.
    pub fn reader(&mut self) -> Result<BodyReader<'_>> {
        self.ensure_open("read the body")?;
        self.state.set(StreamState::BodyStreaming);
        Ok(BodyReader { ctx: self })
    }

    /// Read the remaining body into memory.
    pub fn body(&mut self) -> Result<Vec<u8>> {
        let mut reader = self.reader()?;
        let mut body = Vec::new();
        loop {
            let chunk = reader.read(8192)?;
            if chunk.is_empty() {
                return Ok(body);
            }
            body.extend_from_slice(&chunk);
        }
    }

    fn read_body(&mut self, max: usize) -> Result<Vec<u8>> {
        self.ensure_open("read the body")?;
        if self.body_remaining == 0 || max == 0 {
            return Ok(Vec::new());
        }
        let want = max.min(usize::try_from(self.body_remaining).unwrap_or(usize::MAX));
        let mut buf = vec![0u8; want];
        let deadline = self.deadline.clone();
        let result = match self.io_mut() {
            Ok(io) => read_some(io, &mut buf, &deadline, "read request body"),
            Err(e) => Err(e),
        };
        match result {
            Ok(0) => {
                self.body_remaining = 0;
                Ok(Vec::new())
            }
            Ok(n) => {
                self.body_remaining -= n as u64;
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => {
                self.on_io_error(&e);
                Err(e)
            }
        }
    }

    /// Set the response status. Only effective before the first write.
    pub fn set_status(&mut self, status: u16) -> Result<()> {
        if self.head_sent {
            return Err(Error::illegal_state("response head already sent"));
        }
        self.status = status;
        Ok(())
    }

    /// Add a response header. Only effective before the first write.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        if self.head_sent {
            return Err(Error::illegal_state("response head already sent"));
        }
        self.response_headers.push((name.into(), value.into()));
        Ok(())
    }

    fn response_head(&self, content_length: Option<usize>) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status));
        for (name, value) in &self.response_headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        match content_length {
            Some(len) => head.push_str(&format!("Content-Length: {}\r\n", len)),
            None => head.push_str("Connection: close\r\n"),
        }
        head.push_str("\r\n");
        head.into_bytes()
    }

    /// Write response bytes immediately. The first write sends the status
    /// line and headers; the body then runs until the connection closes.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.ensure_open("write")?;
        let mut out = if self.head_sent {
            Vec::with_capacity(data.len())
        } else {
            self.response_head(None)
        };
        out.extend_from_slice(data);
        self.send(&out, "write response")?;
        self.head_sent = true;
        Ok(data.len())
    }

    /// Push bytes to the client under the request deadline. A timeout moves
    /// the request to `TimedOut`.
    fn send(&mut self, bytes: &[u8], operation: &str) -> Result<()> {
        let deadline = self.deadline.clone();
        let result = match self.io_mut() {
            Ok(io) => write_all_within(io, bytes, &deadline, operation),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.on_io_error(e);
        }
        result
    }

    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open("flush")?;
        self.io_mut()?.flush()?;
        Ok(())
    }

    /// Send a complete response with a known length and finish the request.
    /// Used for the host's envelope when the handler wrote nothing itself.
    pub fn respond(&mut self, status: u16, content_type: &str, body: &[u8]) -> Result<()> {
        self.ensure_open("respond")?;
        if self.head_sent {
            return Err(Error::illegal_state("response already started"));
        }
        self.status = status;
        self.response_headers
            .push(("Content-Type".to_string(), content_type.to_string()));
        let mut out = self.response_head(Some(body.len()));
        out.extend_from_slice(body);
        self.send(&out, "write response")?;
        self.head_sent = true;
        self.state.set(StreamState::Completed);
        Ok(())
    }

    /// Whether the handler produced the response itself, so the host must
    /// not add its own.
    pub fn returnless(&self) -> bool {
        self.head_sent || self.state.get() == StreamState::Upgraded
    }

    /// Switch the connection to WebSocket. One-way: afterwards the context
    /// refuses reads and writes.
    pub fn upgrade_to_websocket(&mut self) -> Result<WebSocket> {
        self.ensure_open("upgrade")?;
        if self.head_sent {
            return Err(Error::illegal_state("cannot upgrade after writing a response"));
        }
        let upgrade = self.head.header("upgrade").unwrap_or_default();
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(Error::illegal_state("request is not a websocket upgrade"));
        }
        let key = self
            .head
            .header("sec-websocket-key")
            .ok_or_else(|| Error::illegal_state("missing Sec-WebSocket-Key"))?;

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(key)
        );
        self.send(response.as_bytes(), "write upgrade response")?;
        let io = self
            .io
            .take()
            .ok_or_else(|| Error::illegal_state("request transport is gone"))?;
        self.state.set(StreamState::Upgraded);
        tracing::debug!(url = self.head.url(), "request upgraded to websocket");
        Ok(WebSocket::new(io, self.deadline.clone()))
    }

    /// Finish the request normally, flushing any buffered output.
    pub fn complete(&mut self) -> Result<()> {
        match self.state.get() {
            StreamState::Completed => Ok(()),
            state if state.is_terminal() => Err(Error::illegal_state(format!(
                "cannot complete a request that is {}",
                state
            ))),
            _ => {
                if let Some(io) = self.io.as_mut() {
                    io.flush()?;
                }
                self.state.set(StreamState::Completed);
                Ok(())
            }
        }
    }

    /// Drop the transport without a response.
    pub fn abort(&mut self) {
        if self.state.get() != StreamState::Upgraded {
            self.io = None;
            self.state.set(StreamState::Aborted);
        }
    }

    /// Mark the request as timed out and trip its cancel token so blocking
    /// capability calls made on its behalf stop waiting.
    pub fn mark_timed_out(&mut self) {
        self.cancel.cancel();
        if !self.state.get().is_terminal() {
            self.state.set(StreamState::TimedOut);
        }
    }
}

/// Reads the request body, bounded by `Content-Length` and the request
/// deadline. A timeout moves the request to `TimedOut`.
pub struct BodyReader<'a> {
    ctx: &'a mut RequestStreamContext,
}

impl BodyReader<'_> {
    /// One byte, or `None` at end of body.
    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        Ok(self.ctx.read_body(1)?.first().copied())
    }

    /// Up to `count` bytes; empty at end of body.
    pub fn read(&mut self, count: usize) -> Result<Vec<u8>> {
        self.ctx.read_body(count)
    }

    pub fn remaining(&self) -> u64 {
        self.ctx.body_remaining
    }
}

impl std::io::Read for BodyReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let chunk = self
            .ctx
            .read_body(buf.len())
            .map_err(|e| match e {
                Error::Timeout { .. } => std::io::Error::new(std::io::ErrorKind::TimedOut, e),
                other => std::io::Error::new(std::io::ErrorKind::Other, other),
            })?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }
}
