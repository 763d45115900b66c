//! cinerender wire format: fixed-layout types and constants shared by the
//! controlling process and the render worker.
//!
//! The request header is a textual metadata block (see `descriptor`); the
//! types here are the fixed-size pieces around it: the digest trailer and
//! the result header. Changing anything in this module is a breaking change
//! to the protocol.
//!
//! Fixed-size structs use zerocopy derives for allocation-free
//! serialization. There is no unsafe code in this module.

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Size of the BLAKE3 digest carried in every trailer.
pub const DIGEST_LEN: usize = 32;

/// Default TCP port a render worker listens on.
pub const DEFAULT_PORT: u16 = 6192;

/// Default per-operation deadline in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Ticks per second of a job timestamp.
pub const TIME_HZ: i64 = 96_000;

/// Result length sent by a worker that received a request whose digest did
/// not verify. No payload follows; the trailer still does.
pub const RESULT_REJECTED: u32 = u32::MAX;

/// Upper bound on any single binary payload derived from metadata.
/// Anything larger is treated as a malformed header.
pub const MAX_PAYLOAD_BYTES: usize = 1 << 30;

// ── Digest Trailer ────────────────────────────────────────────────────────────

/// Appended once per digest scope, immediately after the bytes it covers.
///
/// Wire size: 32 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct DigestTrailer {
    /// BLAKE3 digest of every byte written inside the scope.
    pub digest: [u8; DIGEST_LEN],
}

assert_eq_size!(DigestTrailer, [u8; 32]);

// ── Result Header ─────────────────────────────────────────────────────────────

/// Precedes the encoded frame returned by a worker.
///
/// Wire size: 4 bytes, big endian.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ResultHeader {
    /// Length of the encoded frame in bytes, or `RESULT_REJECTED`.
    pub length: U32<BigEndian>,
}

assert_eq_size!(ResultHeader, [u8; 4]);

impl ResultHeader {
    pub fn new(length: u32) -> Self {
        Self {
            length: U32::new(length),
        }
    }

    pub fn rejected() -> Self {
        Self::new(RESULT_REJECTED)
    }

    pub fn is_rejected(&self) -> bool {
        self.length.get() == RESULT_REJECTED
    }
}

// ── Selectors ─────────────────────────────────────────────────────────────────

/// Which eye of a stereoscopic pair a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum Eyes {
    /// 2D content; the frame is shown to both eyes.
    Mono = 0,
    Left = 1,
    Right = 2,
}

impl TryFrom<u32> for Eyes {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Eyes::Mono),
            1 => Ok(Eyes::Left),
            2 => Ok(Eyes::Right),
            other => Err(WireError::UnknownEyes(other)),
        }
    }
}

impl From<Eyes> for u32 {
    fn from(e: Eyes) -> u32 {
        e as u32
    }
}

/// Restricts composition to part of the frame, used for side-by-side
/// before/after comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum Part {
    LeftHalf = 0,
    RightHalf = 1,
    TopHalf = 2,
    BottomHalf = 3,
    Whole = 4,
}

impl TryFrom<u32> for Part {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Part::LeftHalf),
            1 => Ok(Part::RightHalf),
            2 => Ok(Part::TopHalf),
            3 => Ok(Part::BottomHalf),
            4 => Ok(Part::Whole),
            other => Err(WireError::UnknownPart(other)),
        }
    }
}

impl From<Part> for u32 {
    fn from(p: Part) -> u32 {
        p as u32
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown eyes selector: {0}")]
    UnknownEyes(u32),

    #[error("unknown part selector: {0}")]
    UnknownPart(u32),

    #[error("unknown YUV to RGB matrix: {0}")]
    UnknownYuvToRgb(u32),

    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD_BYTES)]
    PayloadTooLarge(usize),

    #[error("header length {0} exceeds maximum {1}")]
    HeaderTooLarge(usize, usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
