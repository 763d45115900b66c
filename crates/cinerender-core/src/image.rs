//! Image proxies: opaque input images carried by a render job.
//!
//! The protocol never looks inside an image. A proxy contributes a metadata
//! object to the job header, a binary payload whose length that metadata
//! implies, and an equality predicate used for render-cache hits.
//! `image_proxy_factory` reverses the process on the receiving side,
//! dispatching on the metadata's `"type"` tag.

use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::descriptor::{DescriptorError, PayloadSource};
use crate::geometry::Size;
use crate::wire::{WireError, MAX_PAYLOAD_BYTES};

/// Producer of an input image.
pub trait ImageProxy: std::fmt::Debug + Send + Sync {
    /// Metadata object placed in the job header under `"in"`.
    fn metadata(&self) -> serde_json::Value;

    /// Size of the image this proxy will produce.
    fn size(&self) -> Size;

    /// Raw bytes sent after the header. Their length must be derivable
    /// from `metadata()`.
    fn binary(&self) -> &[u8];

    /// True if `other` will definitely produce the same image.
    fn same(&self, other: &dyn ImageProxy) -> bool;

    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Rgb24,
    Rgba,
    Rgb48Le,
    Xyz12Le,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> u64 {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgba => 4,
            PixelFormat::Rgb48Le | PixelFormat::Xyz12Le => 6,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ProxyMetadata {
    Raw {
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
    },
    J2k {
        width: u32,
        height: u32,
        length: u64,
    },
}

fn payload_len(len: u64) -> Result<usize, DescriptorError> {
    match usize::try_from(len) {
        Ok(n) if n <= MAX_PAYLOAD_BYTES => Ok(n),
        _ => Err(WireError::PayloadTooLarge(len.min(usize::MAX as u64) as usize).into()),
    }
}

/// Byte length of `size` pixels at `bytes_per_pixel`, refusing sizes whose
/// product does not fit in a `u64`.
pub(crate) fn pixel_bytes(size: Size, bytes_per_pixel: u64) -> Result<u64, DescriptorError> {
    size.area()
        .checked_mul(bytes_per_pixel)
        .ok_or_else(|| WireError::PayloadTooLarge(usize::MAX).into())
}

// ── Raw ───────────────────────────────────────────────────────────────────────

/// Uncompressed, packed pixels.
#[derive(Debug, Clone)]
pub struct RawImageProxy {
    size: Size,
    pixel_format: PixelFormat,
    data: Bytes,
}

impl RawImageProxy {
    pub fn new(size: Size, pixel_format: PixelFormat, data: Bytes) -> Result<Self, DescriptorError> {
        let expected = pixel_bytes(size, pixel_format.bytes_per_pixel())?;
        if data.len() as u64 != expected {
            return Err(DescriptorError::PayloadLength {
                expected,
                actual: data.len() as u64,
            });
        }
        Ok(Self {
            size,
            pixel_format,
            data,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }
}

impl ImageProxy for RawImageProxy {
    fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "raw",
            "width": self.size.width,
            "height": self.size.height,
            "pixel_format": self.pixel_format,
        })
    }

    fn size(&self) -> Size {
        self.size
    }

    fn binary(&self) -> &[u8] {
        &self.data
    }

    fn same(&self, other: &dyn ImageProxy) -> bool {
        match other.as_any().downcast_ref::<RawImageProxy>() {
            Some(o) => {
                self.size == o.size && self.pixel_format == o.pixel_format && self.data == o.data
            }
            None => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── JPEG2000 ──────────────────────────────────────────────────────────────────

/// An already-compressed JPEG2000 codestream, decoded by the worker.
#[derive(Debug, Clone)]
pub struct J2kImageProxy {
    size: Size,
    data: Bytes,
}

impl J2kImageProxy {
    pub fn new(size: Size, data: Bytes) -> Self {
        Self { size, data }
    }

    /// The JPEG2000 codestream.
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl ImageProxy for J2kImageProxy {
    fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "j2k",
            "width": self.size.width,
            "height": self.size.height,
            "length": self.data.len() as u64,
        })
    }

    fn size(&self) -> Size {
        self.size
    }

    fn binary(&self) -> &[u8] {
        &self.data
    }

    fn same(&self, other: &dyn ImageProxy) -> bool {
        match other.as_any().downcast_ref::<J2kImageProxy>() {
            Some(o) => self.size == o.size && self.data == o.data,
            None => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── Factory ───────────────────────────────────────────────────────────────────

/// Rebuild a proxy from its header metadata, pulling its payload from
/// `source`.
pub fn image_proxy_factory<S: PayloadSource>(
    metadata: &serde_json::Value,
    source: &mut S,
) -> Result<Arc<dyn ImageProxy>, S::Error> {
    let parsed = ProxyMetadata::deserialize(metadata).map_err(DescriptorError::Json)?;

    match parsed {
        ProxyMetadata::Raw {
            width,
            height,
            pixel_format,
        } => {
            let size = Size::new(width, height);
            let len = payload_len(pixel_bytes(size, pixel_format.bytes_per_pixel())?)?;
            let data = source.read_payload(len)?;
            Ok(Arc::new(RawImageProxy::new(size, pixel_format, data)?))
        }
        ProxyMetadata::J2k {
            width,
            height,
            length,
        } => {
            let len = payload_len(length)?;
            let data = source.read_payload(len)?;
            Ok(Arc::new(J2kImageProxy::new(Size::new(width, height), data)))
        }
    }
}
