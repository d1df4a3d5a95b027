//! Alignment padding: grows frames to multiples of the model's block size.
//!
//! Padding is only ever added on the right and bottom edges, and the added
//! pixels replicate the nearest edge pixel so the network never sees a hard
//! black border.

use serde::Serialize;

use crate::error::PipelineError;
use crate::types::{Frame, FrameData, PixelFormat, CHANNELS};

pub const DEFAULT_BLOCK_SIZE: u32 = 64;

/// Extra columns (right) and rows (bottom) added to reach alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PaddingSpec {
    pub right: u32,
    pub bottom: u32,
}

impl PaddingSpec {
    pub fn compute(width: u32, height: u32, block_size: u32) -> Result<Self, PipelineError> {
        if block_size == 0 {
            return Err(PipelineError::InvalidGeometry(
                "block size must be positive".to_string(),
            ));
        }
        if width == 0 || height == 0 {
            return Err(PipelineError::InvalidGeometry(format!(
                "frame dimensions must be positive, got {width}x{height}"
            )));
        }

        let spec = Self {
            right: pad_amount(width, block_size),
            bottom: pad_amount(height, block_size),
        };
        if width.checked_add(spec.right).is_none() || height.checked_add(spec.bottom).is_none() {
            return Err(PipelineError::InvalidGeometry(format!(
                "padded size of {width}x{height} overflows at block size {block_size}"
            )));
        }
        Ok(spec)
    }

    pub fn padded_dims(&self, width: u32, height: u32) -> (u32, u32) {
        (width + self.right, height + self.bottom)
    }

    /// Padding expressed in output pixels after `scale`x upscaling; this is
    /// the amount the reconstructor crops away.
    pub fn scaled(&self, scale: u32) -> (usize, usize) {
        (
            self.right as usize * scale as usize,
            self.bottom as usize * scale as usize,
        )
    }

    pub fn is_zero(&self) -> bool {
        self.right == 0 && self.bottom == 0
    }
}

fn pad_amount(dim: u32, block_size: u32) -> u32 {
    (block_size - (dim % block_size)) % block_size
}

/// Pads every frame of a stream to the configured block size.
#[derive(Debug, Clone, Copy)]
pub struct AlignmentPadder {
    block_size: u32,
}

impl AlignmentPadder {
    pub fn new(block_size: u32) -> Result<Self, PipelineError> {
        if block_size == 0 {
            return Err(PipelineError::InvalidGeometry(
                "block size must be positive".to_string(),
            ));
        }
        Ok(Self { block_size })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn spec_for(&self, width: u32, height: u32) -> Result<PaddingSpec, PipelineError> {
        PaddingSpec::compute(width, height, self.block_size)
    }

    pub fn pad(&self, frame: &Frame) -> Result<Frame, PipelineError> {
        let spec = self.spec_for(frame.width(), frame.height())?;
        pad_frame(frame, spec)
    }
}

/// Number of independent planes and elements per pixel within a plane.
fn sample_layout(frame: &Frame) -> (usize, usize) {
    match frame.format() {
        PixelFormat::PackedRgb => {
            let bytes_per_sample = if frame.bit_depth() > 8 { 2 } else { 1 };
            (1, CHANNELS * bytes_per_sample)
        }
        PixelFormat::PlanarF32 | PixelFormat::PlanarF16 => (CHANNELS, 1),
    }
}

/// Pads `frame` by `spec` using edge replication.
pub fn pad_frame(frame: &Frame, spec: PaddingSpec) -> Result<Frame, PipelineError> {
    if spec.is_zero() {
        return Ok(frame.clone());
    }

    let (width, height) = frame.dims();
    let (new_width, new_height) = spec.padded_dims(width, height);
    let geometry = Reshape {
        layout: sample_layout(frame),
        src: (width as usize, height as usize),
        dst: (new_width as usize, new_height as usize),
    };

    let data = match frame.data() {
        FrameData::Bytes(src) => FrameData::Bytes(geometry.pad(src)),
        FrameData::F32(src) => FrameData::F32(geometry.pad(src)),
        FrameData::F16(src) => FrameData::F16(geometry.pad(src)),
    };
    frame.with_data(new_width, new_height, data)
}

/// Keeps the top-left `width`x`height` region of `frame`.
pub fn crop_frame(frame: &Frame, width: u32, height: u32) -> Result<Frame, PipelineError> {
    if width == 0 || height == 0 || width > frame.width() || height > frame.height() {
        return Err(PipelineError::InvalidGeometry(format!(
            "cannot crop {}x{} frame to {width}x{height}",
            frame.width(),
            frame.height()
        )));
    }
    if (width, height) == frame.dims() {
        return Ok(frame.clone());
    }

    let geometry = Reshape {
        layout: sample_layout(frame),
        src: (frame.width() as usize, frame.height() as usize),
        dst: (width as usize, height as usize),
    };

    let data = match frame.data() {
        FrameData::Bytes(src) => FrameData::Bytes(geometry.crop(src)),
        FrameData::F32(src) => FrameData::F32(geometry.crop(src)),
        FrameData::F16(src) => FrameData::F16(geometry.crop(src)),
    };
    frame.with_data(width, height, data)
}

struct Reshape {
    layout: (usize, usize),
    src: (usize, usize),
    dst: (usize, usize),
}

impl Reshape {
    fn pad<T: Copy>(&self, src: &[T]) -> Vec<T> {
        let (planes, px) = self.layout;
        let (w, h) = self.src;
        let (new_w, new_h) = self.dst;
        let row_len = w * px;
        let mut out = Vec::with_capacity(planes * new_w * new_h * px);

        for plane in src.chunks_exact(w * h * px) {
            for y in 0..new_h {
                let src_y = y.min(h - 1);
                let row = &plane[src_y * row_len..(src_y + 1) * row_len];
                out.extend_from_slice(row);
                let edge = &row[row_len - px..];
                for _ in w..new_w {
                    out.extend_from_slice(edge);
                }
            }
        }
        out
    }

    fn crop<T: Copy>(&self, src: &[T]) -> Vec<T> {
        let (planes, px) = self.layout;
        let (w, h) = self.src;
        let (out_w, out_h) = self.dst;
        let row_len = w * px;
        let mut out = Vec::with_capacity(planes * out_w * out_h * px);

        for plane in src.chunks_exact(w * h * px) {
            for y in 0..out_h {
                let start = y * row_len;
                out.extend_from_slice(&plane[start..start + out_w * px]);
            }
        }
        out
    }
}
