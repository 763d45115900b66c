//! Digest scopes: bracket one logical message in a rolling digest.
//!
//! A `WriteDigestScope` starts a write digest on the connection and derefs
//! to it, so the message is written through the scope. When the scope ends,
//! by `finish()` or by being dropped on an error path, the digest is sent
//! as a trailer exactly once. If the connection is already closed by then,
//! nothing is sent: the receiver sees a short stream, which is a transport
//! failure rather than an integrity failure.
//!
//! A `ReadDigestScope` starts a read digest; `check()` reads the trailer and
//! reports a mismatch as `Ok(false)` so that callers can tell corrupted data
//! apart from a broken link.
//!
//! Scopes borrow the connection and never outlive it. Before touching the
//! connection they check that it is still open.

use std::ops::{Deref, DerefMut};

use cinerender_core::wire::DIGEST_LEN;

use crate::error::{ProtocolError, Result};
use crate::socket::Connection;

// ── Write ─────────────────────────────────────────────────────────────────────

pub struct WriteDigestScope<'a> {
    conn: &'a mut Connection,
    done: bool,
}

impl<'a> WriteDigestScope<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        conn.start_write_digest();
        Self { conn, done: false }
    }

    /// End the scope now and surface any failure sending the trailer.
    pub fn finish(mut self) -> Result<()> {
        self.emit()
    }

    fn emit(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        if !self.conn.is_open() {
            self.conn.abandon_write_digest();
            return Err(ProtocolError::ConnectionClosed);
        }
        self.conn.finish_write_digest()
    }
}

impl Deref for WriteDigestScope<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl DerefMut for WriteDigestScope<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn
    }
}

impl Drop for WriteDigestScope<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        match self.emit() {
            Ok(()) => tracing::trace!("digest trailer sent on scope exit"),
            Err(ProtocolError::ConnectionClosed) => {
                tracing::debug!("connection gone, digest trailer not sent")
            }
            Err(e) => tracing::warn!(error = %e, "failed to send digest trailer"),
        }
    }
}

// ── Read ──────────────────────────────────────────────────────────────────────

pub struct ReadDigestScope<'a> {
    conn: &'a mut Connection,
    checked: bool,
}

impl<'a> ReadDigestScope<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        conn.start_read_digest();
        Self {
            conn,
            checked: false,
        }
    }

    /// Read the trailer and compare it with everything read since the scope
    /// opened. `Ok(false)` means the bytes arrived but were altered.
    pub fn check(self) -> Result<bool> {
        Ok(self.verify()?.is_some())
    }

    /// Like `check`, but hands back the verified digest.
    pub fn verify(mut self) -> Result<Option<[u8; DIGEST_LEN]>> {
        self.checked = true;
        if !self.conn.is_open() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.conn.check_read_digest()
    }
}

impl Deref for ReadDigestScope<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl DerefMut for ReadDigestScope<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn
    }
}

impl Drop for ReadDigestScope<'_> {
    fn drop(&mut self) {
        if !self.checked {
            self.conn.abandon_read_digest();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
