//! Colour conversion carried with a render job.
//!
//! The worker applies it when converting the decoded image to XYZ; the
//! protocol only transports it and compares it for render-cache hits.

use serde::{Deserialize, Serialize};

use crate::wire::WireError;

/// Matrix used to turn decoded YUV into RGB before the RGB→XYZ step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum YuvToRgb {
    Rec601 = 0,
    Rec709 = 1,
}

impl TryFrom<u32> for YuvToRgb {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(YuvToRgb::Rec601),
            1 => Ok(YuvToRgb::Rec709),
            other => Err(WireError::UnknownYuvToRgb(other)),
        }
    }
}

impl From<YuvToRgb> for u32 {
    fn from(m: YuvToRgb) -> u32 {
        m as u32
    }
}

/// Input gamma → RGB→XYZ matrix → output gamma.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColourConversion {
    pub input_gamma: f64,
    /// Input gamma curve has a linear segment near black (as sRGB does).
    pub input_gamma_linearised: bool,
    pub yuv_to_rgb: YuvToRgb,
    /// Row-major RGB→XYZ matrix.
    pub rgb_to_xyz: [[f64; 3]; 3],
    pub output_gamma: f64,
}

/// DCI output gamma.
const DCI_GAMMA: f64 = 2.6;

impl ColourConversion {
    pub fn srgb() -> Self {
        Self {
            input_gamma: 2.4,
            input_gamma_linearised: true,
            yuv_to_rgb: YuvToRgb::Rec601,
            rgb_to_xyz: [
                [0.4124564, 0.3575761, 0.1804375],
                [0.2126729, 0.7151522, 0.0721750],
                [0.0193339, 0.1191920, 0.9503041],
            ],
            output_gamma: DCI_GAMMA,
        }
    }

    pub fn rec601() -> Self {
        Self {
            input_gamma: 2.2,
            input_gamma_linearised: false,
            yuv_to_rgb: YuvToRgb::Rec601,
            rgb_to_xyz: [
                [0.3935891, 0.3652497, 0.1916313],
                [0.2124132, 0.7010437, 0.0865432],
                [0.0187423, 0.1119313, 0.9581563],
            ],
            output_gamma: DCI_GAMMA,
        }
    }

    pub fn rec709() -> Self {
        Self {
            input_gamma: 2.2,
            input_gamma_linearised: false,
            yuv_to_rgb: YuvToRgb::Rec709,
            ..Self::srgb()
        }
    }
}
