//! Pixel format conversion between the source, working and delivery formats.
//!
//! All conversions pass through normalized planar float32: packed samples
//! are divided by `2^bit_depth - 1`, range adjustments happen in normalized
//! space, and the result is written out in the requested layout.

use half::f16;
use half::slice::HalfFloatSliceExt;

use crate::error::ConversionError;
use crate::types::{
    ColorRange, ColorSpec, Frame, FrameData, PixelFormat, TensorPrecision, CHANNELS,
};

/// Normalized black and white levels of limited-range video.
const LIMITED_BLACK: f32 = 16.0 / 255.0;
const LIMITED_WHITE: f32 = 235.0 / 255.0;

const CHUNK: usize = 4096;

/// Layout, bit depth and color a converter should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionTarget {
    pub format: PixelFormat,
    pub bit_depth: u8,
    pub color: ColorSpec,
}

impl ConversionTarget {
    /// Planar tensor format consumed by the engine.
    pub fn working(precision: TensorPrecision, color: ColorSpec) -> Self {
        let bit_depth = match precision {
            TensorPrecision::F32 => 32,
            TensorPrecision::F16 => 16,
        };
        Self {
            format: precision.pixel_format(),
            bit_depth,
            color,
        }
    }

    /// Packed RGB at `bit_depth`, for delivery.
    pub fn packed(bit_depth: u8, color: ColorSpec) -> Self {
        Self {
            format: PixelFormat::PackedRgb,
            bit_depth,
            color,
        }
    }

    fn matches(&self, frame: &Frame) -> bool {
        let depth_matches =
            frame.format() != PixelFormat::PackedRgb || frame.bit_depth() == self.bit_depth;
        frame.format() == self.format && depth_matches && frame.color() == self.color
    }
}

pub trait FormatConverter: Send + Sync {
    fn convert(&self, frame: &Frame, target: &ConversionTarget) -> Result<Frame, ConversionError>;
}

/// RGB converter covering packed 8..=16-bit and planar f32/f16 frames.
/// Color matrices are passed through unchanged; asking for a different
/// matrix is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct RgbConverter;

impl FormatConverter for RgbConverter {
    fn convert(&self, frame: &Frame, target: &ConversionTarget) -> Result<Frame, ConversionError> {
        let source = frame.color();
        if source.matrix != target.color.matrix {
            return Err(ConversionError::UnsupportedMatrix {
                from: source.matrix,
                to: target.color.matrix,
            });
        }
        if target.format == PixelFormat::PackedRgb && !(8..=16).contains(&target.bit_depth) {
            return Err(ConversionError::UnsupportedBitDepth(target.bit_depth));
        }
        if target.matches(frame) {
            return Ok(frame.clone());
        }

        let mut planes = to_normalized_planar(frame)?;
        adjust_range(&mut planes, source.range, target.color.range);

        let (width, height) = frame.dims();
        let data = match target.format {
            PixelFormat::PackedRgb => FrameData::Bytes(planar_to_packed(&planes, target.bit_depth)),
            PixelFormat::PlanarF32 => FrameData::F32(planes),
            PixelFormat::PlanarF16 => FrameData::F16(f32_to_f16(&planes)),
        };
        rebuild(width, height, target, data)
    }
}

fn rebuild(
    width: u32,
    height: u32,
    target: &ConversionTarget,
    data: FrameData,
) -> Result<Frame, ConversionError> {
    let expected = CHANNELS * width as usize * height as usize;
    let actual = data.len();
    let built = match data {
        FrameData::Bytes(bytes) => {
            Frame::packed_rgb(width, height, target.bit_depth, target.color, bytes)
        }
        FrameData::F32(samples) => Frame::planar_f32(width, height, target.color, samples),
        FrameData::F16(samples) => Frame::planar_f16(width, height, target.color, samples),
    };
    built.map_err(|_| ConversionError::BufferLength { expected, actual })
}

fn sample_max(bit_depth: u8) -> Result<f32, ConversionError> {
    match bit_depth {
        8..=16 => Ok(((1u32 << bit_depth) - 1) as f32),
        other => Err(ConversionError::UnsupportedBitDepth(other)),
    }
}

/// HWC packed samples (or planar storage) to CHW float32 in [0, 1].
fn to_normalized_planar(frame: &Frame) -> Result<Vec<f32>, ConversionError> {
    let hw = frame.width() as usize * frame.height() as usize;
    match frame.data() {
        FrameData::F32(samples) => Ok(samples.clone()),
        FrameData::F16(samples) => {
            let mut out = vec![0.0f32; samples.len()];
            for (dst, src) in out.chunks_mut(CHUNK).zip(samples.chunks(CHUNK)) {
                src.convert_to_f32_slice(dst);
            }
            Ok(out)
        }
        FrameData::Bytes(bytes) => {
            let bit_depth = frame.bit_depth();
            let scale = 1.0 / sample_max(bit_depth)?;
            let mut out = vec![0.0f32; CHANNELS * hw];
            if bit_depth == 8 {
                for (pixel, rgb) in bytes.chunks_exact(CHANNELS).enumerate() {
                    for (c, &sample) in rgb.iter().enumerate() {
                        out[c * hw + pixel] = sample as f32 * scale;
                    }
                }
            } else {
                for (pixel, rgb) in bytes.chunks_exact(CHANNELS * 2).enumerate() {
                    for (c, pair) in rgb.chunks_exact(2).enumerate() {
                        let sample = u16::from_le_bytes([pair[0], pair[1]]);
                        out[c * hw + pixel] = sample as f32 * scale;
                    }
                }
            }
            Ok(out)
        }
    }
}

fn adjust_range(planes: &mut [f32], from: ColorRange, to: ColorRange) {
    let span = LIMITED_WHITE - LIMITED_BLACK;
    match (from, to) {
        (ColorRange::Limited, ColorRange::Full) => {
            for value in planes.iter_mut() {
                *value = (*value - LIMITED_BLACK) / span;
            }
        }
        (ColorRange::Full, ColorRange::Limited) => {
            for value in planes.iter_mut() {
                *value = LIMITED_BLACK + *value * span;
            }
        }
        _ => {}
    }
}

/// CHW [0, 1] floats to interleaved samples, clamping out-of-range values.
fn planar_to_packed(planes: &[f32], bit_depth: u8) -> Vec<u8> {
    let hw = planes.len() / CHANNELS;
    let max = ((1u32 << bit_depth) - 1) as f32;
    let quantize = |value: f32| (value.clamp(0.0, 1.0) * max).round() as u16;

    if bit_depth == 8 {
        let mut out = Vec::with_capacity(CHANNELS * hw);
        for pixel in 0..hw {
            for c in 0..CHANNELS {
                out.push(quantize(planes[c * hw + pixel]) as u8);
            }
        }
        out
    } else {
        let mut out = Vec::with_capacity(CHANNELS * hw * 2);
        for pixel in 0..hw {
            for c in 0..CHANNELS {
                out.extend_from_slice(&quantize(planes[c * hw + pixel]).to_le_bytes());
            }
        }
        out
    }
}

fn f32_to_f16(planes: &[f32]) -> Vec<f16> {
    let mut out = vec![f16::ZERO; planes.len()];
    for (dst, src) in out.chunks_mut(CHUNK).zip(planes.chunks(CHUNK)) {
        dst.convert_from_f32_slice(src);
    }
    out
}
