//! Deadline-bounded blocking transport over a TCP stream.
//!
//! All I/O is synchronous. A single `Deadline` per connection bounds every
//! blocking call; callers re-arm it once per logical operation with
//! `reset_deadline`. When it expires mid-operation the socket is shut down
//! and every later call on the connection fails at once with
//! `ConnectionClosed`.
//!
//! A connection can also fold the bytes passing through it into a write
//! digest and a read digest, independently. The digest scopes in
//! `crate::scope` drive these.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use cinerender_core::descriptor::PayloadSource;
use cinerender_core::digest::Digester;
use cinerender_core::wire::{DigestTrailer, DIGEST_LEN};
use zerocopy::AsBytes;

use crate::error::{ProtocolError, Result};

/// Bytes requested from the kernel per read.
const READ_CHUNK: usize = 64 * 1024;

// ── Deadline ──────────────────────────────────────────────────────────────────

/// One expiry instant, re-armed before each logical operation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expiry: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            expiry: Instant::now() + timeout,
        }
    }

    pub fn reset(&mut self, timeout: Duration) {
        self.expiry = Instant::now() + timeout;
    }

    /// Time left; zero once expired.
    pub fn remaining(&self) -> Duration {
        self.expiry.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

/// One stream socket with its deadline and digest contexts.
///
/// Not shared across threads: one thread drives one connection.
pub struct Connection {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    deadline: Deadline,
    timeout: Duration,
    /// Bytes read from the kernel but not yet handed to a caller.
    buffer: BytesMut,
    scratch: Vec<u8>,
    read_digest: Option<Digester>,
    write_digest: Option<Digester>,
}

impl Connection {
    /// Resolve `address` and connect, trying each resolved address until one
    /// succeeds or `timeout` runs out. `timeout` also becomes the default
    /// per-operation deadline.
    pub fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let started = Instant::now();
        let addrs: Vec<SocketAddr> = address
            .to_socket_addrs()
            .map_err(|source| ProtocolError::ConnectionFailed {
                addr: address.to_string(),
                source,
            })?
            .collect();

        if addrs.is_empty() {
            return Err(ProtocolError::ConnectionFailed {
                addr: address.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
            });
        }

        let mut last_err = None;
        for addr in addrs {
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                last_err = Some(ProtocolError::ConnectTimeout(address.to_string()));
                break;
            }
            tracing::debug!(%addr, timeout_ms = remaining.as_millis() as u64, "connecting");
            match connect_one(addr, remaining) {
                Ok(stream) => {
                    tracing::debug!(%addr, "connected");
                    return Ok(Self::from_stream(stream, timeout));
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "connect attempt failed");
                    last_err = Some(classify_connect_error(address, e));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ProtocolError::ConnectTimeout(address.to_string())))
    }

    /// Wrap an already-connected stream, e.g. one returned by `accept`.
    pub fn from_stream(stream: TcpStream, timeout: Duration) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!(error = %e, "TCP_NODELAY not set");
        }
        Self {
            peer: stream.peer_addr().ok(),
            stream: Some(stream),
            deadline: Deadline::after(timeout),
            timeout,
            buffer: BytesMut::new(),
            scratch: vec![0u8; READ_CHUNK],
            read_digest: None,
            write_digest: None,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Default per-operation timeout given at construction.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Set SO_SNDBUF on the underlying socket.
    pub fn set_send_buffer_size(&mut self, size: usize) -> io::Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        SockRef::from(stream).set_send_buffer_size(size)
    }

    /// Re-arm the deadline `timeout` from now.
    pub fn reset_deadline(&mut self, timeout: Duration) {
        self.deadline.reset(timeout);
    }

    pub fn set_deadline_from_now(&mut self, secs: u64) {
        self.reset_deadline(Duration::from_secs(secs));
    }

    /// Re-arm the deadline with the connection's default timeout.
    pub fn rearm(&mut self) {
        self.deadline.reset(self.timeout);
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Shut the socket down. Idempotent.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            tracing::debug!(peer = ?self.peer, "connection closed");
        }
        self.buffer.clear();
        self.read_digest = None;
        self.write_digest = None;
    }

    // ── Writing ───────────────────────────────────────────────────────────────

    /// Write all of `buf` before the deadline.
    pub fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.write_some(&buf[written..])?;
            if let Some(d) = self.write_digest.as_mut() {
                d.update(&buf[written..written + n]);
            }
            written += n;
        }
        tracing::trace!(bytes = buf.len(), "wrote");
        Ok(())
    }

    /// Fixed 4-byte big-endian integer.
    pub fn write_u32(&mut self, n: u32) -> Result<()> {
        self.write_bytes(&n.to_be_bytes())
    }

    /// u32 length prefix followed by UTF-8 bytes.
    pub fn write_string(&mut self, s: &str) -> Result<()> {
        let len = u32::try_from(s.len())
            .map_err(|_| ProtocolError::ProtocolFormat(format!("string of {} bytes", s.len())))?;
        self.write_u32(len)?;
        self.write_bytes(s.as_bytes())
    }

    fn write_some(&mut self, buf: &[u8]) -> Result<usize> {
        let remaining = self.remaining_or_expire(ProtocolError::WriteTimeout)?;
        let stream = self.stream.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        let outcome = stream.set_write_timeout(Some(remaining)).and_then(|_| loop {
            match stream.write(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        });
        match outcome {
            Ok(0) => {
                self.close();
                Err(ProtocolError::ConnectionClosed)
            }
            Ok(n) => Ok(n),
            Err(e) => Err(self.fail(e, ProtocolError::WriteTimeout)),
        }
    }

    // ── Reading ───────────────────────────────────────────────────────────────

    /// Fill `out` completely, issuing as many reads as it takes.
    pub fn read_into(&mut self, out: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            if self.buffer.is_empty() {
                self.fill()?;
            }
            let n = self.buffer.len().min(out.len() - filled);
            out[filled..filled + n].copy_from_slice(&self.buffer[..n]);
            self.buffer.advance(n);
            filled += n;
        }
        if let Some(d) = self.read_digest.as_mut() {
            d.update(out);
        }
        Ok(())
    }

    /// Exactly `n` bytes, in order.
    pub fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        let mut out = vec![0u8; n];
        self.read_into(&mut out)?;
        Ok(Bytes::from(out))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read_into(&mut raw)?;
        Ok(u32::from_be_bytes(raw))
    }

    /// Length-prefixed UTF-8 string, refusing anything over `max_len` bytes.
    pub fn read_string(&mut self, max_len: usize) -> Result<String> {
        let len = self.read_u32()? as usize;
        if len > max_len {
            return Err(ProtocolError::ProtocolFormat(format!(
                "string length {len} exceeds maximum {max_len}"
            )));
        }
        let raw = self.read_exact(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| ProtocolError::ProtocolFormat(format!("string is not UTF-8: {e}")))
    }

    /// Whatever is already buffered plus one read's worth of fresh data, up
    /// to `max_n` bytes. Blocks (under the deadline) only if nothing is
    /// buffered yet.
    pub fn read_available(&mut self, max_n: usize) -> Result<Bytes> {
        if max_n == 0 {
            return Ok(Bytes::new());
        }
        if self.buffer.is_empty() {
            self.fill()?;
        } else if self.buffer.len() < max_n {
            self.fill_ready();
        }
        let n = self.buffer.len().min(max_n);
        let out = self.buffer.split_to(n).freeze();
        if let Some(d) = self.read_digest.as_mut() {
            d.update(&out);
        }
        Ok(out)
    }

    /// One non-blocking read. Faults and EOF are left for the next blocking
    /// read to report.
    fn fill_ready(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        if stream.set_nonblocking(true).is_err() {
            return;
        }
        let outcome = stream.read(&mut self.scratch[..]);
        let _ = stream.set_nonblocking(false);
        if let Ok(n) = outcome {
            self.buffer.extend_from_slice(&self.scratch[..n]);
        }
    }

    /// One read from the kernel into the read-ahead buffer.
    fn fill(&mut self) -> Result<usize> {
        let remaining = self.remaining_or_expire(ProtocolError::ReadTimeout)?;
        let stream = self.stream.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        let scratch = &mut self.scratch;
        let outcome = stream.set_read_timeout(Some(remaining)).and_then(|_| loop {
            match stream.read(&mut scratch[..]) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        });
        match outcome {
            Ok(0) => {
                tracing::debug!(peer = ?self.peer, "peer closed connection");
                self.close();
                Err(ProtocolError::ConnectionClosed)
            }
            Ok(n) => {
                self.buffer.extend_from_slice(&self.scratch[..n]);
                tracing::trace!(bytes = n, buffered = self.buffer.len(), "read");
                Ok(n)
            }
            Err(e) => Err(self.fail(e, ProtocolError::ReadTimeout)),
        }
    }

    // ── Deadline and failure handling ─────────────────────────────────────────

    fn remaining_or_expire(&mut self, timeout_err: ProtocolError) -> Result<Duration> {
        if !self.is_open() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let remaining = self.deadline.remaining();
        if remaining.is_zero() {
            tracing::warn!(peer = ?self.peer, "deadline expired, closing connection");
            self.close();
            return Err(timeout_err);
        }
        Ok(remaining)
    }

    fn fail(&mut self, e: io::Error, timeout_err: ProtocolError) -> ProtocolError {
        self.close();
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                tracing::warn!(peer = ?self.peer, "socket operation timed out");
                timeout_err
            }
            _ => {
                tracing::warn!(peer = ?self.peer, error = %e, "socket error");
                ProtocolError::ConnectionClosed
            }
        }
    }

    // ── Digest contexts ───────────────────────────────────────────────────────

    /// Start folding every written byte into a fresh digest.
    pub fn start_write_digest(&mut self) {
        self.write_digest = Some(Digester::new());
    }

    pub fn has_write_digest(&self) -> bool {
        self.write_digest.is_some()
    }

    /// Stop digesting and send the digest as a trailer.
    pub fn finish_write_digest(&mut self) -> Result<()> {
        let digester = self.write_digest.take().ok_or_else(|| {
            ProtocolError::ProtocolFormat("no write digest in progress".into())
        })?;
        let covered = digester.len();
        let trailer = DigestTrailer {
            digest: digester.finalize(),
        };
        self.write_bytes(trailer.as_bytes())?;
        tracing::trace!(covered, digest = hex::encode(trailer.digest), "sent digest trailer");
        Ok(())
    }

    /// Drop the write digest without sending anything.
    pub fn abandon_write_digest(&mut self) {
        self.write_digest = None;
    }

    /// Start folding every byte handed to a caller into a fresh digest.
    pub fn start_read_digest(&mut self) {
        self.read_digest = Some(Digester::new());
    }

    pub fn has_read_digest(&self) -> bool {
        self.read_digest.is_some()
    }

    /// Stop digesting, read the trailer and compare. Returns the digest on a
    /// match, `None` on a mismatch.
    pub fn check_read_digest(&mut self) -> Result<Option<[u8; DIGEST_LEN]>> {
        let digester = self.read_digest.take().ok_or_else(|| {
            ProtocolError::ProtocolFormat("no read digest in progress".into())
        })?;
        let covered = digester.len();
        let computed = digester.finalize();

        let mut received = [0u8; DIGEST_LEN];
        self.read_into(&mut received)?;

        if received == computed {
            tracing::trace!(covered, digest = hex::encode(computed), "digest verified");
            Ok(Some(computed))
        } else {
            tracing::warn!(
                covered,
                received = hex::encode(received),
                computed = hex::encode(computed),
                "digest mismatch"
            );
            Ok(None)
        }
    }

    pub fn abandon_read_digest(&mut self) {
        self.read_digest = None;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl PayloadSource for Connection {
    type Error = ProtocolError;

    fn read_payload(&mut self, len: usize) -> Result<Bytes> {
        self.read_exact(len)
    }
}

fn connect_one(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.connect_timeout(&addr.into(), timeout)?;
    Ok(socket.into())
}

fn classify_connect_error(address: &str, e: io::Error) -> ProtocolError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            ProtocolError::ConnectTimeout(address.to_string())
        }
        io::ErrorKind::ConnectionRefused => ProtocolError::ConnectionRefused(address.to_string()),
        _ => ProtocolError::ConnectionFailed {
            addr: address.to_string(),
            source: e,
        },
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
