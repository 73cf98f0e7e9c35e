//! Transports a request context can run over.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use capbridge_core::{Deadline, Error, Result};

/// A bidirectional byte stream with settable read and write timeouts.
pub trait RequestIo: Read + Write + Send {
    /// `None` blocks until data arrives.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// `None` blocks until the peer accepts the bytes.
    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

impl RequestIo for TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }
}

impl<T: RequestIo + ?Sized> RequestIo for Box<T> {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        (**self).set_read_timeout(timeout)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        (**self).set_write_timeout(timeout)
    }
}

/// One end of an in-memory duplex pipe. See [`duplex`].
#[derive(Debug)]
pub struct MemoryConnection {
    tx: Option<Sender<Vec<u8>>>,
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    read_timeout: Option<Duration>,
}

/// Two connected in-memory endpoints. Bytes written to one are read from
/// the other; dropping an end (or [`MemoryConnection::close_write`]) gives
/// the peer end of stream.
pub fn duplex() -> (MemoryConnection, MemoryConnection) {
    let (a_tx, b_rx) = mpsc::channel();
    let (b_tx, a_rx) = mpsc::channel();
    (
        MemoryConnection::new(a_tx, a_rx),
        MemoryConnection::new(b_tx, b_rx),
    )
}

impl MemoryConnection {
    fn new(tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>) -> Self {
        Self {
            tx: Some(tx),
            rx,
            pending: Vec::new(),
            read_timeout: None,
        }
    }

    /// Signal end of stream to the peer while still reading from it.
    pub fn close_write(&mut self) {
        self.tx = None;
    }

    /// Read everything until the peer closes its write side.
    pub fn read_to_close(&mut self) -> Vec<u8> {
        let mut out = std::mem::take(&mut self.pending);
        while let Ok(chunk) = self.rx.recv() {
            out.extend_from_slice(&chunk);
        }
        out
    }
}

impl Read for MemoryConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pending.is_empty() {
            let next = match self.read_timeout {
                Some(timeout) => self.rx.recv_timeout(timeout),
                None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match next {
                Ok(chunk) => self.pending = chunk,
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
                }
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

impl Write for MemoryConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "write side closed"))?;
        if !buf.is_empty() {
            tx.send(buf.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer dropped"))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl RequestIo for MemoryConnection {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.read_timeout = timeout;
        Ok(())
    }

    // Writes into the channel never block.
    fn set_write_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// One `read` bounded by `deadline`. Returns 0 at end of stream.
pub(crate) fn read_some<R: RequestIo + ?Sized>(
    io: &mut R,
    buf: &mut [u8],
    deadline: &Deadline,
    operation: &str,
) -> Result<usize> {
    loop {
        if deadline.is_expired() {
            return Err(Error::timeout(operation));
        }
        let slice = deadline
            .wait_slice()
            .map(|s| s.max(Duration::from_millis(1)));
        io.set_read_timeout(slice)?;
        match io.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::upstream(operation.to_string(), e)),
        }
    }
}

/// Write all of `data` and flush, bounded by `deadline`. A peer that stops
/// reading makes this time out instead of blocking forever.
pub(crate) fn write_all_within<W: RequestIo + ?Sized>(
    io: &mut W,
    mut data: &[u8],
    deadline: &Deadline,
    operation: &str,
) -> Result<()> {
    while !data.is_empty() {
        if deadline.is_expired() {
            return Err(Error::timeout(operation));
        }
        let slice = deadline
            .wait_slice()
            .map(|s| s.max(Duration::from_millis(1)));
        io.set_write_timeout(slice)?;
        match io.write(data) {
            Ok(0) => {
                return Err(Error::upstream(
                    operation.to_string(),
                    io::Error::from(io::ErrorKind::WriteZero),
                ))
            }
            Ok(n) => data = &data[n..],
            Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::upstream(operation.to_string(), e)),
        }
    }
    io.flush()
        .map_err(|e| Error::upstream(operation.to_string(), e))
}

/// Fill `buf` completely. A short stream is an upstream error.
pub(crate) fn read_full<R: RequestIo + ?Sized>(
    io: &mut R,
    buf: &mut [u8],
    deadline: &Deadline,
    operation: &str,
) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = read_some(io, &mut buf[filled..], deadline, operation)?;
        if n == 0 {
            return Err(Error::upstream(
                operation.to_string(),
                io::Error::from(io::ErrorKind::UnexpectedEof),
            ));
        }
        filled += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn bytes_cross_the_pipe() {
        let (mut a, mut b) = duplex();
        a.write_all(b"hello").unwrap();
        a.close_write();
        assert_eq!(b.read_to_close(), b"hello");
    }

    #[test]
    fn partial_reads_keep_remainder() {
        let (mut a, mut b) = duplex();
        a.write_all(b"abcdef").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(b.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[test]
    fn dropped_peer_is_end_of_stream() {
        let (a, mut b) = duplex();
        drop(a);
        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf).unwrap(), 0);
        assert!(b.write(b"x").is_err());
    }

    #[test]
    fn read_some_honours_deadline() {
        let (_a, mut b) = duplex();
        let mut buf = [0u8; 4];
        let start = Instant::now();
        let err = read_some(&mut b, &mut buf, &Deadline::from_timeout_ms(40), "read").unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn write_all_within_stops_at_expired_deadline() {
        let (mut a, mut b) = duplex();
        let err = write_all_within(&mut a, b"late", &Deadline::immediate(), "write").unwrap_err();
        assert!(err.is_timeout());
        write_all_within(&mut a, b"ok", &Deadline::from_timeout_ms(1_000), "write").unwrap();
        a.close_write();
        assert_eq!(b.read_to_close(), b"ok");
    }

    #[test]
    fn write_all_within_times_out_on_stalled_tcp_peer() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut writer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_stalled, _) = listener.accept().unwrap();

        let payload = vec![0u8; 64 * 1024 * 1024];
        let start = Instant::now();
        let err = write_all_within(&mut writer, &payload, &Deadline::from_timeout_ms(100), "write")
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn read_full_across_chunks() {
        let (mut a, mut b) = duplex();
        let writer = thread::spawn(move || {
            a.write_all(b"ab").unwrap();
            thread::sleep(Duration::from_millis(10));
            a.write_all(b"cd").unwrap();
        });
        let mut buf = [0u8; 4];
        read_full(&mut b, &mut buf, &Deadline::from_timeout_ms(5_000), "read").unwrap();
        assert_eq!(&buf, b"abcd");
        writer.join().unwrap();
    }
}
