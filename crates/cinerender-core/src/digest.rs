//! BLAKE3 digests for request and result integrity.
//!
//! Every digest scope on a connection folds the bytes it brackets into a
//! `Digester`; the 32-byte output is what travels in a `DigestTrailer`.

use crate::wire::DIGEST_LEN;

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; DIGEST_LEN] {
    *blake3::hash(data).as_bytes()
}

/// Incremental BLAKE3 hasher for byte spans that pass through in pieces.
///
/// # Example
/// ```
/// use cinerender_core::digest::Digester;
/// let mut d = Digester::new();
/// d.update(b"hello ");
/// d.update(b"world");
/// assert_eq!(d.finalize(), cinerender_core::digest::hash(b"hello world"));
/// ```
#[derive(Clone)]
pub struct Digester {
    inner: blake3::Hasher,
    bytes: u64,
}

impl Digester {
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
            bytes: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes folded in so far.
    pub fn len(&self) -> u64 {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    pub fn finalize(self) -> [u8; DIGEST_LEN] {
        *self.inner.finalize().as_bytes()
    }
}

impl Default for Digester {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Digester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Digester").field("bytes", &self.bytes).finish()
    }
}
