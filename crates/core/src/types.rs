use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use half::f16;
use half::slice::HalfFloatSliceExt;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// RGB frames always carry three color channels.
pub const CHANNELS: usize = 3;

/// Memory layout of a frame's samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Interleaved RGB. 8-bit frames store one byte per sample, 9..=16-bit
    /// frames store little-endian u16 samples.
    PackedRgb,
    /// Planar CHW float32, values normalized to [0, 1].
    PlanarF32,
    /// Planar CHW float16, values normalized to [0, 1].
    PlanarF16,
}

impl PixelFormat {
    pub fn is_planar(self) -> bool {
        !matches!(self, Self::PackedRgb)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PackedRgb => "packed_rgb",
            Self::PlanarF32 => "planar_f32",
            Self::PlanarF16 => "planar_f16",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMatrix {
    #[default]
    Bt709,
    Bt601,
    Bt2020,
}

impl fmt::Display for ColorMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bt709 => "bt709",
            Self::Bt601 => "bt601",
            Self::Bt2020 => "bt2020",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorRange {
    #[default]
    Full,
    Limited,
}

/// Color metadata carried alongside the samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ColorSpec {
    pub matrix: ColorMatrix,
    pub range: ColorRange,
}

impl ColorSpec {
    pub fn with_range(self, range: ColorRange) -> Self {
        Self { range, ..self }
    }
}

/// Numeric precision of the tensors handed to the inference engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorPrecision {
    #[default]
    F32,
    F16,
}

impl TensorPrecision {
    pub fn pixel_format(self) -> PixelFormat {
        match self {
            Self::F32 => PixelFormat::PlanarF32,
            Self::F16 => PixelFormat::PlanarF16,
        }
    }
}

/// Sample storage of a [`Frame`].
#[derive(Clone, PartialEq)]
pub enum FrameData {
    Bytes(Vec<u8>),
    F32(Vec<f32>),
    F16(Vec<f16>),
}

impl FrameData {
    /// Number of stored elements (bytes for packed data, floats otherwise).
    pub fn len(&self) -> usize {
        match self {
            Self::Bytes(data) => data.len(),
            Self::F32(data) => data.len(),
            Self::F16(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for FrameData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Bytes(_) => "Bytes",
            Self::F32(_) => "F32",
            Self::F16(_) => "F16",
        };
        write!(f, "{kind}[{}]", self.len())
    }
}

/// A single image. Dimensions, layout and sample storage are validated on
/// construction and never change afterwards; stages produce new frames.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    bit_depth: u8,
    color: ColorSpec,
    data: FrameData,
}

/// Frames shared between overlapping windows are reference counted and
/// read-only.
pub type FrameRef = Arc<Frame>;

/// Byte length of a packed RGB frame, or `None` if the bit depth cannot be
/// stored as packed RGB.
pub fn packed_frame_len(width: u32, height: u32, bit_depth: u8) -> Option<usize> {
    let bytes_per_sample = match bit_depth {
        8 => 1,
        9..=16 => 2,
        _ => return None,
    };
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(CHANNELS * bytes_per_sample)
}

impl Frame {
    pub fn packed_rgb(
        width: u32,
        height: u32,
        bit_depth: u8,
        color: ColorSpec,
        data: Vec<u8>,
    ) -> Result<Self, PipelineError> {
        Self::validated(
            width,
            height,
            PixelFormat::PackedRgb,
            bit_depth,
            color,
            FrameData::Bytes(data),
        )
    }

    pub fn planar_f32(
        width: u32,
        height: u32,
        color: ColorSpec,
        data: Vec<f32>,
    ) -> Result<Self, PipelineError> {
        Self::validated(
            width,
            height,
            PixelFormat::PlanarF32,
            32,
            color,
            FrameData::F32(data),
        )
    }

    pub fn planar_f16(
        width: u32,
        height: u32,
        color: ColorSpec,
        data: Vec<f16>,
    ) -> Result<Self, PipelineError> {
        Self::validated(
            width,
            height,
            PixelFormat::PlanarF16,
            16,
            color,
            FrameData::F16(data),
        )
    }

    /// New frame with the same format, bit depth and color as `self` but
    /// different dimensions and samples.
    pub(crate) fn with_data(
        &self,
        width: u32,
        height: u32,
        data: FrameData,
    ) -> Result<Self, PipelineError> {
        Self::validated(width, height, self.format, self.bit_depth, self.color, data)
    }

    fn validated(
        width: u32,
        height: u32,
        format: PixelFormat,
        bit_depth: u8,
        color: ColorSpec,
        data: FrameData,
    ) -> Result<Self, PipelineError> {
        if width == 0 || height == 0 {
            return Err(PipelineError::InvalidGeometry(format!(
                "frame dimensions must be positive, got {width}x{height}"
            )));
        }

        let storage_matches = matches!(
            (format, &data),
            (PixelFormat::PackedRgb, FrameData::Bytes(_))
                | (PixelFormat::PlanarF32, FrameData::F32(_))
                | (PixelFormat::PlanarF16, FrameData::F16(_))
        );
        if !storage_matches {
            return Err(PipelineError::InvalidGeometry(format!(
                "{format} frame cannot hold {data:?} samples"
            )));
        }

        let expected = match format {
            PixelFormat::PackedRgb => packed_frame_len(width, height, bit_depth).ok_or_else(|| {
                PipelineError::InvalidGeometry(format!(
                    "packed RGB frame {width}x{height} with bit depth {bit_depth} is not representable"
                ))
            })?,
            PixelFormat::PlanarF32 | PixelFormat::PlanarF16 => {
                CHANNELS * width as usize * height as usize
            }
        };
        if data.len() != expected {
            return Err(PipelineError::InvalidGeometry(format!(
                "{format} frame {width}x{height} needs {expected} samples, got {}",
                data.len()
            )));
        }

        Ok(Self {
            width,
            height,
            format,
            bit_depth,
            color,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dims(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Bits per stored sample: 8..=16 for packed frames, 32 or 16 for
    /// planar float frames.
    pub fn bit_depth(&self) -> u8 {
        self.bit_depth
    }

    pub fn color(&self) -> ColorSpec {
        self.color
    }

    pub fn data(&self) -> &FrameData {
        &self.data
    }

    pub fn into_data(self) -> FrameData {
        self.data
    }

    /// Raw bytes of a packed frame.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.data {
            FrameData::Bytes(data) => Some(data),
            _ => None,
        }
    }

    /// Planar samples as float32, converting float16 storage on the fly.
    pub fn planar_samples(&self) -> Option<Cow<'_, [f32]>> {
        match &self.data {
            FrameData::F32(data) => Some(Cow::Borrowed(data.as_slice())),
            FrameData::F16(data) => {
                let mut out = vec![0.0f32; data.len()];
                data.as_slice().convert_to_f32_slice(&mut out);
                Some(Cow::Owned(out))
            }
            FrameData::Bytes(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_constructor_checks_length_for_each_bit_depth() {
        let color = ColorSpec::default();
        assert!(Frame::packed_rgb(4, 2, 8, color, vec![0; 24]).is_ok());
        assert!(Frame::packed_rgb(4, 2, 10, color, vec![0; 48]).is_ok());
        assert!(Frame::packed_rgb(4, 2, 16, color, vec![0; 48]).is_ok());

        let short = Frame::packed_rgb(4, 2, 16, color, vec![0; 24]);
        assert!(matches!(short, Err(PipelineError::InvalidGeometry(_))));

        let bad_depth = Frame::packed_rgb(4, 2, 7, color, vec![0; 24]);
        assert!(matches!(bad_depth, Err(PipelineError::InvalidGeometry(_))));
    }

    #[test]
    fn zero_sized_frames_are_rejected() {
        let err = Frame::planar_f32(0, 4, ColorSpec::default(), Vec::new()).unwrap_err();
        assert!(err.to_string().contains("0x4"), "{err}");
    }

    #[test]
    fn f16_frames_expose_f32_samples() {
        let data = vec![f16::from_f32(0.5); 12];
        let frame = Frame::planar_f16(2, 2, ColorSpec::default(), data).unwrap();
        let samples = frame.planar_samples().unwrap();

        assert_eq!(samples.len(), 12);
        assert!(samples.iter().all(|v| (*v - 0.5).abs() < 1e-3));
        assert!(matches!(samples, Cow::Owned(_)));
    }

    #[test]
    fn packed_frames_have_no_planar_view() {
        let frame = Frame::packed_rgb(1, 1, 8, ColorSpec::default(), vec![1, 2, 3]).unwrap();
        assert!(frame.planar_samples().is_none());
        assert_eq!(frame.as_bytes(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn debug_output_does_not_dump_samples() {
        let frame = Frame::planar_f32(8, 8, ColorSpec::default(), vec![0.25; 192]).unwrap();
        let rendered = format!("{frame:?}");
        assert!(rendered.contains("F32[192]"), "{rendered}");
        assert!(!rendered.contains("0.25"), "{rendered}");
    }
}
