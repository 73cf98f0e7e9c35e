//! The `socket` capability: TCP and UDP endpoints.
//!
//! Every blocking operation takes a [`Deadline`]. Socket timeouts are set
//! per attempt from [`Deadline::wait_slice`] so a cancelled request stops
//! waiting within one slice even when it has no time bound.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use capbridge_core::sync::lock;
use capbridge_core::{Deadline, Error, Result};
use serde::{Deserialize, Serialize};

/// Bytes read by [`TcpConnection::read`] when the caller gives no size.
pub const DEFAULT_READ_SIZE: usize = 4096;

const MIN_SLICE: Duration = Duration::from_millis(1);
const ACCEPT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketMode {
    Dial,
    Listen,
}

/// What a script asks for: `{"protocol": "tcp", "mode": "dial", "host": "...", "port": 80}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocketConfig {
    pub protocol: Protocol,
    pub mode: SocketMode,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Retry `attempt` until it succeeds, fails for real, or `deadline` expires.
/// Each attempt gets the socket timeout it should use.
fn with_deadline<T>(
    deadline: &Deadline,
    operation: &str,
    mut attempt: impl FnMut(Option<Duration>) -> io::Result<T>,
) -> Result<T> {
    loop {
        if deadline.is_expired() {
            return Err(Error::timeout(operation));
        }
        let slice = deadline.wait_slice().map(|s| s.max(MIN_SLICE));
        match attempt(slice) {
            Ok(value) => return Ok(value),
            Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::upstream(operation.to_string(), e)),
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::upstream(format!("resolve {}:{}", host, port), e))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::upstream(
            format!("resolve {}:{}", host, port),
            "no addresses found",
        ));
    }
    Ok(addrs)
}

/// A connected TCP stream.
#[derive(Debug)]
pub struct TcpConnection {
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<TcpStream>,
    peer: SocketAddr,
    closed: AtomicBool,
}

impl TcpConnection {
    fn from_stream(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: Mutex::new(BufReader::new(stream)),
            writer: Mutex::new(writer),
            peer,
            closed: AtomicBool::new(false),
        })
    }

    /// Connect to `host:port`, trying each resolved address until `deadline`.
    pub fn dial(host: &str, port: u16, deadline: &Deadline) -> Result<Self> {
        let mut last_error = None;
        for addr in resolve(host, port)? {
            let timeout = match deadline.remaining() {
                Some(left) if left.is_zero() => {
                    return Err(Error::timeout(format!("connect to {}:{}", host, port)))
                }
                Some(left) => Some(left),
                None => None,
            };
            let attempt = match timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    tracing::debug!(%addr, "tcp connected");
                    return Self::from_stream(stream);
                }
                Err(e) if is_timeout(&e) => {
                    return Err(Error::timeout(format!("connect to {}:{}", host, port)))
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(match last_error {
            Some(e) => Error::upstream(format!("connect to {}:{}", host, port), e),
            None => Error::timeout(format!("connect to {}:{}", host, port)),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::illegal_state("tcp connection is closed"))
        } else {
            Ok(())
        }
    }

    /// Read at most `size` bytes. An empty result means the peer closed.
    pub fn read(&self, size: usize, deadline: &Deadline) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let mut reader = lock(&self.reader);
        let mut buf = vec![0u8; size.max(1)];
        let n = with_deadline(deadline, "tcp read", |slice| {
            reader.get_ref().set_read_timeout(slice)?;
            reader.read(&mut buf)
        })?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Read through the next `\n` (included). At end of stream the partial
    /// line is returned.
    pub fn read_line(&self, deadline: &Deadline) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let mut reader = lock(&self.reader);
        let mut line = Vec::new();
        with_deadline(deadline, "tcp read line", |slice| {
            reader.get_ref().set_read_timeout(slice)?;
            reader.read_until(b'\n', &mut line)
        })?;
        Ok(line)
    }

    /// Write all of `data`. Returns the number of bytes written.
    pub fn write(&self, data: &[u8], deadline: &Deadline) -> Result<usize> {
        self.ensure_open()?;
        let mut writer = lock(&self.writer);
        let mut written = 0;
        while written < data.len() {
            let n = with_deadline(deadline, "tcp write", |slice| {
                writer.set_write_timeout(slice)?;
                writer.write(&data[written..])
            })?;
            if n == 0 {
                return Err(Error::upstream("tcp write", "connection closed by peer"));
            }
            written += n;
        }
        writer.flush()?;
        Ok(written)
    }

    /// Shut the connection down. Closing twice is a no-op.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = lock(&self.writer).shutdown(Shutdown::Both);
            tracing::debug!(peer = %self.peer, "tcp connection closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A TCP listener shared by every script that listens on the same port.
#[derive(Debug)]
pub struct TcpListenerHandle {
    listener: TcpListener,
    local: SocketAddr,
}

impl TcpListenerHandle {
    pub fn bind(host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port))
            .map_err(|e| Error::upstream(format!("listen on {}:{}", host, port), e))?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        tracing::info!(%local, "tcp listening");
        Ok(Self { listener, local })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Wait for the next inbound connection until `deadline`.
    pub fn accept(&self, deadline: &Deadline) -> Result<TcpConnection> {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    return TcpConnection::from_stream(stream);
                }
                Err(e) if is_timeout(&e) => {
                    if deadline.is_expired() {
                        return Err(Error::timeout("tcp accept"));
                    }
                    let pause = deadline
                        .wait_slice()
                        .map_or(ACCEPT_POLL, |slice| slice.min(ACCEPT_POLL));
                    thread::sleep(pause.max(MIN_SLICE));
                }
                Err(e) => return Err(Error::upstream("tcp accept", e)),
            }
        }
    }
}

/// One received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub from: SocketAddr,
}

/// A UDP socket, either connected to one peer or bound to a local port.
#[derive(Debug)]
pub struct UdpConnection {
    socket: UdpSocket,
    connected: bool,
    closed: AtomicBool,
}

impl UdpConnection {
    pub fn dial(host: &str, port: u16) -> Result<Self> {
        let target = resolve(host, port)?[0];
        let bind: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind)?;
        socket
            .connect(target)
            .map_err(|e| Error::upstream(format!("udp connect to {}", target), e))?;
        Ok(Self {
            socket,
            connected: true,
            closed: AtomicBool::new(false),
        })
    }

    pub fn listen(host: &str, port: u16) -> Result<Self> {
        let socket = UdpSocket::bind((host, port))
            .map_err(|e| Error::upstream(format!("udp listen on {}:{}", host, port), e))?;
        Ok(Self {
            socket,
            connected: false,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::illegal_state("udp socket is closed"))
        } else {
            Ok(())
        }
    }

    /// Receive one datagram of at most `size` bytes.
    pub fn read(&self, size: usize, deadline: &Deadline) -> Result<Datagram> {
        self.ensure_open()?;
        let mut buf = vec![0u8; size.max(1)];
        let (n, from) = with_deadline(deadline, "udp read", |slice| {
            self.socket.set_read_timeout(slice)?;
            self.socket.recv_from(&mut buf)
        })?;
        buf.truncate(n);
        Ok(Datagram { data: buf, from })
    }

    /// Send `data` to `to`, or to the dialed peer when `to` is `None`.
    pub fn write(&self, data: &[u8], to: Option<(&str, u16)>) -> Result<usize> {
        self.ensure_open()?;
        let sent = match to {
            Some((host, port)) => self.socket.send_to(data, resolve(host, port)?[0])?,
            None if self.connected => self.socket.send(data)?,
            None => {
                return Err(Error::illegal_state(
                    "listening udp socket needs a destination",
                ))
            }
        };
        Ok(sent)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn config_from_json() {
        let config: SocketConfig =
            serde_json::from_str(r#"{"protocol":"tcp","mode":"listen","port":9000}"#).unwrap();
        assert_eq!(config.protocol, Protocol::Tcp);
        assert_eq!(config.mode, SocketMode::Listen);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn tcp_dial_accept_echo() {
        let listener = TcpListenerHandle::bind("127.0.0.1", 0).unwrap();
        let port = listener.local_addr().port();

        let server = thread::spawn(move || {
            let conn = listener.accept(&Deadline::from_timeout_ms(5_000)).unwrap();
            let line = conn.read_line(&Deadline::from_timeout_ms(5_000)).unwrap();
            conn.write(&line, &Deadline::from_timeout_ms(5_000)).unwrap();
            conn.close();
        });

        let client = TcpConnection::dial("127.0.0.1", port, &Deadline::from_timeout_ms(5_000)).unwrap();
        assert_eq!(client.write(b"hello\n", &Deadline::never()).unwrap(), 6);
        let echoed = client.read_line(&Deadline::from_timeout_ms(5_000)).unwrap();
        assert_eq!(echoed, b"hello\n");
        server.join().unwrap();

        // Peer closed: reads report end of stream.
        assert!(client.read(16, &Deadline::from_timeout_ms(5_000)).unwrap().is_empty());
        client.close();
        client.close();
        assert!(matches!(
            client.write(b"x", &Deadline::never()).unwrap_err(),
            Error::IllegalState { .. }
        ));
    }

    #[test]
    fn tcp_read_times_out() {
        let listener = TcpListenerHandle::bind("127.0.0.1", 0).unwrap();
        let port = listener.local_addr().port();
        let client = TcpConnection::dial("127.0.0.1", port, &Deadline::from_timeout_ms(5_000)).unwrap();
        let _server_side = listener.accept(&Deadline::from_timeout_ms(5_000)).unwrap();

        let start = Instant::now();
        let err = client.read(8, &Deadline::from_timeout_ms(50)).unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn accept_times_out_without_clients() {
        let listener = TcpListenerHandle::bind("127.0.0.1", 0).unwrap();
        let err = listener.accept(&Deadline::from_timeout_ms(30)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn udp_round_trip() {
        let server = UdpConnection::listen("127.0.0.1", 0).unwrap();
        let port = server.local_addr().unwrap().port();
        let client = UdpConnection::dial("127.0.0.1", port).unwrap();

        client.write(b"ping", None).unwrap();
        let got = server.read(64, &Deadline::from_timeout_ms(5_000)).unwrap();
        assert_eq!(got.data, b"ping");

        let from = got.from;
        server
            .write(b"pong", Some((&from.ip().to_string(), from.port())))
            .unwrap();
        let reply = client.read(64, &Deadline::from_timeout_ms(5_000)).unwrap();
        assert_eq!(reply.data, b"pong");
    }

    #[test]
    fn listening_udp_needs_destination() {
        let server = UdpConnection::listen("127.0.0.1", 0).unwrap();
        assert!(matches!(
            server.write(b"x", None).unwrap_err(),
            Error::IllegalState { .. }
        ));
    }
}
