//! Render job descriptor and its codec.
//!
//! A `JobDescriptor` describes one frame render: where it sits in time, how
//! the input image is cropped and scaled, which eye and which part of the
//! frame it is for, an optional colour conversion and an optional subtitle
//! overlay.
//!
//! On the wire a descriptor is a JSON metadata block followed immediately by
//! its raw binary payloads, in the order they were declared: input image
//! bytes, then subtitle RGBA bytes if a subtitle is present. Payload lengths
//! are never transmitted; they follow from the metadata.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::colour::ColourConversion;
use crate::geometry::{Crop, Position, Size};
use crate::image::{image_proxy_factory, pixel_bytes, ImageProxy, J2kImageProxy};
use crate::wire::{Eyes, Part, WireError, MAX_PAYLOAD_BYTES, TIME_HZ};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("malformed job metadata: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("{field} out of range: {detail}")]
    OutOfRange { field: &'static str, detail: String },

    #[error("incomplete subtitle block")]
    IncompleteSubtitle,

    #[error("payload is {actual} bytes, metadata implies {expected}")]
    PayloadLength { expected: u64, actual: u64 },

    #[error("payload truncated: wanted {expected} bytes, {available} available")]
    ShortPayload { expected: usize, available: usize },
}

// ── Payload source ────────────────────────────────────────────────────────────

/// Somewhere binary payloads can be pulled from once the metadata block has
/// said how long they are.
pub trait PayloadSource {
    type Error: From<DescriptorError>;

    fn read_payload(&mut self, len: usize) -> Result<Bytes, Self::Error>;
}

/// In-memory payload source.
#[derive(Debug, Clone, Default)]
pub struct BufferSource {
    buf: Bytes,
}

impl BufferSource {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl PayloadSource for BufferSource {
    type Error = DescriptorError;

    fn read_payload(&mut self, len: usize) -> Result<Bytes, DescriptorError> {
        if self.buf.len() < len {
            return Err(DescriptorError::ShortPayload {
                expected: len,
                available: self.buf.len(),
            });
        }
        Ok(self.buf.split_to(len))
    }
}

// ── Subtitle overlay ──────────────────────────────────────────────────────────

/// Packed 8-bit RGBA pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbaImage {
    size: Size,
    data: Bytes,
}

impl RgbaImage {
    pub fn new(size: Size, data: Bytes) -> Result<Self, DescriptorError> {
        let expected = pixel_bytes(size, 4)?;
        if data.len() as u64 != expected {
            return Err(DescriptorError::PayloadLength {
                expected,
                actual: data.len() as u64,
            });
        }
        Ok(Self { size, data })
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// An image placed at a position within the output frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionImage {
    pub image: RgbaImage,
    pub position: Position,
}

impl PositionImage {
    pub fn new(image: RgbaImage, position: Position) -> Self {
        Self { image, position }
    }

    /// Pixel-equal and in the same place.
    pub fn same(&self, other: &PositionImage) -> bool {
        self == other
    }
}

// ── Descriptor ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct JobDescriptor {
    /// Presentation time in `TIME_HZ` ticks.
    pub time: i64,
    pub crop: Crop,
    /// Fade level, 0.0 (black) to 1.0 (untouched).
    pub fade: Option<f32>,
    /// Size the cropped image is scaled to.
    pub inter_size: Size,
    /// Size of the frame the scaled image is centred within.
    pub out_size: Size,
    pub eyes: Eyes,
    pub part: Part,
    pub colour_conversion: Option<ColourConversion>,
    pub input: Arc<dyn ImageProxy>,
    pub subtitle: Option<PositionImage>,
}

/// Header layout. Field order is the wire order.
#[derive(Serialize, Deserialize)]
struct Metadata {
    time: i64,
    crop: Crop,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fade: Option<f32>,
    inter_width: u32,
    inter_height: u32,
    out_width: u32,
    out_height: u32,
    eyes: Eyes,
    part: Part,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    colour_conversion: Option<ColourConversion>,
    #[serde(rename = "in")]
    input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subtitle_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subtitle_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subtitle_x: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subtitle_y: Option<i32>,
}

impl JobDescriptor {
    /// A whole-frame, mono, uncropped job that scales `input` straight to
    /// `out_size`.
    pub fn new(input: Arc<dyn ImageProxy>, out_size: Size) -> Self {
        Self {
            time: 0,
            crop: Crop::default(),
            fade: None,
            inter_size: out_size,
            out_size,
            eyes: Eyes::Mono,
            part: Part::Whole,
            colour_conversion: None,
            input,
            subtitle: None,
        }
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        if let Some(fade) = self.fade {
            if !fade.is_finite() || !(0.0..=1.0).contains(&fade) {
                return Err(DescriptorError::OutOfRange {
                    field: "fade",
                    detail: format!("{fade} not within 0.0..=1.0"),
                });
            }
        }
        for (field, size) in [("inter_size", self.inter_size), ("out_size", self.out_size)] {
            if size.is_empty() {
                return Err(DescriptorError::OutOfRange {
                    field,
                    detail: format!("{}x{}", size.width, size.height),
                });
            }
        }
        if self.inter_size.width > self.out_size.width || self.inter_size.height > self.out_size.height {
            return Err(DescriptorError::OutOfRange {
                field: "inter_size",
                detail: "larger than out_size".into(),
            });
        }
        if let Some(cc) = &self.colour_conversion {
            let finite = [cc.input_gamma, cc.output_gamma]
                .iter()
                .chain(cc.rgb_to_xyz.iter().flatten())
                .all(|v| v.is_finite());
            if !finite {
                return Err(DescriptorError::OutOfRange {
                    field: "colour_conversion",
                    detail: "non-finite coefficient".into(),
                });
            }
        }
        Ok(())
    }

    /// Serialize the metadata block.
    pub fn to_metadata(&self) -> Result<String, DescriptorError> {
        self.validate()?;

        let (subtitle_width, subtitle_height, subtitle_x, subtitle_y) = match &self.subtitle {
            Some(s) => (
                Some(s.image.size().width),
                Some(s.image.size().height),
                Some(s.position.x),
                Some(s.position.y),
            ),
            None => (None, None, None, None),
        };

        let metadata = Metadata {
            time: self.time,
            crop: self.crop,
            fade: self.fade,
            inter_width: self.inter_size.width,
            inter_height: self.inter_size.height,
            out_width: self.out_size.width,
            out_height: self.out_size.height,
            eyes: self.eyes,
            part: self.part,
            colour_conversion: self.colour_conversion.clone(),
            input: self.input.metadata(),
            subtitle_width,
            subtitle_height,
            subtitle_x,
            subtitle_y,
        };

        Ok(serde_json::to_string(&metadata)?)
    }

    /// Raw payloads that follow the metadata block, in wire order.
    pub fn binary_payloads(&self) -> Vec<&[u8]> {
        let mut payloads = vec![self.input.binary()];
        if let Some(s) = &self.subtitle {
            payloads.push(s.image.data());
        }
        payloads
    }

    /// Total bytes of `binary_payloads()`.
    pub fn binary_len(&self) -> usize {
        self.binary_payloads().iter().map(|p| p.len()).sum()
    }

    /// Parse a metadata block, then pull the payloads it declares from
    /// `source`.
    pub fn from_metadata<S: PayloadSource>(text: &str, source: &mut S) -> Result<Self, S::Error> {
        let m: Metadata = serde_json::from_str(text).map_err(DescriptorError::Json)?;

        let input = image_proxy_factory(&m.input, source)?;

        let subtitle = match (m.subtitle_width, m.subtitle_height, m.subtitle_x, m.subtitle_y) {
            (Some(width), Some(height), Some(x), Some(y)) => {
                let size = Size::new(width, height);
                let len = pixel_bytes(size, 4)?;
                if len > MAX_PAYLOAD_BYTES as u64 {
                    return Err(DescriptorError::from(WireError::PayloadTooLarge(len as usize)).into());
                }
                let data = source.read_payload(len as usize)?;
                Some(PositionImage::new(RgbaImage::new(size, data)?, Position::new(x, y)))
            }
            (None, None, None, None) => None,
            _ => return Err(DescriptorError::IncompleteSubtitle.into()),
        };

        let descriptor = Self {
            time: m.time,
            crop: m.crop,
            fade: m.fade,
            inter_size: Size::new(m.inter_width, m.inter_height),
            out_size: Size::new(m.out_width, m.out_height),
            eyes: m.eyes,
            part: m.part,
            colour_conversion: m.colour_conversion,
            input,
            subtitle,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Presentation time in seconds.
    pub fn time_seconds(&self) -> f64 {
        self.time as f64 / TIME_HZ as f64
    }

    /// True if `other` will definitely render to the same frame as this one.
    /// Time is ignored: it says when the frame occurs, not what it shows.
    pub fn same(&self, other: &JobDescriptor) -> bool {
        if self.crop != other.crop
            || self.fade.unwrap_or(0.0) != other.fade.unwrap_or(0.0)
            || self.inter_size != other.inter_size
            || self.out_size != other.out_size
            || self.eyes != other.eyes
            || self.part != other.part
            || self.colour_conversion != other.colour_conversion
        {
            return false;
        }

        match (&self.subtitle, &other.subtitle) {
            (None, None) => {}
            (Some(a), Some(b)) if a.same(b) => {}
            _ => return false,
        }

        self.input.same(other.input.as_ref())
    }

    /// True if the input is already a JPEG2000 codestream that can go out as
    /// the frame without re-encoding: uncropped, not rescaled and with
    /// nothing burnt in.
    pub fn has_j2k(&self) -> bool {
        self.j2k().is_some()
    }

    /// The input codestream, when `has_j2k` holds.
    pub fn j2k(&self) -> Option<&Bytes> {
        let j2k = self.input.as_any().downcast_ref::<J2kImageProxy>()?;
        let untouched = self.crop == Crop::default()
            && self.inter_size == j2k.size()
            && self.subtitle.is_none();
        untouched.then(|| j2k.data())
    }

    /// Crop including the extra half removed by the part selector, for an
    /// input image of `image_size`.
    pub fn effective_crop(&self, image_size: Size) -> Crop {
        let mut crop = self.crop;
        match self.part {
            Part::LeftHalf => crop.right = crop.right.saturating_add(image_size.width / 2),
            Part::RightHalf => crop.left = crop.left.saturating_add(image_size.width / 2),
            Part::TopHalf => crop.bottom = crop.bottom.saturating_add(image_size.height / 2),
            Part::BottomHalf => crop.top = crop.top.saturating_add(image_size.height / 2),
            Part::Whole => {}
        }
        crop
    }

    /// Top-left of the scaled image when centred in the output frame.
    pub fn inter_position(&self) -> Position {
        let dx = (i64::from(self.out_size.width) - i64::from(self.inter_size.width)) / 2;
        let dy = (i64::from(self.out_size.height) - i64::from(self.inter_size.height)) / 2;
        Position::new(dx as i32, dy as i32)
    }
}

/// Exact equality, time and fade included.
impl PartialEq for JobDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.fade == other.fade && self.same(other)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
