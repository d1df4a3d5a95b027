//! Typed errors for the frame pipeline.
//!
//! Every variant is fatal for the stream: each one describes a structural
//! mismatch (geometry, tensor shape, crop bookkeeping) that re-running the
//! same frame would reproduce. Collaborator traits (`FrameSource`,
//! `FrameSink`, `InferenceEngine`) report through `anyhow`; the pipeline folds
//! their diagnostics into the variants below.

use crate::types::ColorMatrix;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("inference failed for window {index}: {diagnostic}")]
    InferenceFailure { index: u64, diagnostic: String },

    #[error(
        "crop of {crop_right}px right / {crop_bottom}px bottom exceeds frame extent {width}x{height}"
    )]
    CropOutOfBounds {
        crop_right: usize,
        crop_bottom: usize,
        width: u32,
        height: u32,
    },

    #[error(transparent)]
    FormatConversion(#[from] ConversionError),

    #[error("source failed to provide frame {index}: {message}")]
    Source { index: u64, message: String },

    #[error("sink rejected frame {index}: {message}")]
    Sink { index: u64, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{stage} task panicked: {message}")]
    TaskPanicked { stage: &'static str, message: String },
}

/// Errors reported by a [`FormatConverter`](crate::convert::FormatConverter).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("unsupported bit depth {0} (expected 8..=16)")]
    UnsupportedBitDepth(u8),

    #[error("color matrix conversion {from} -> {to} is not supported")]
    UnsupportedMatrix { from: ColorMatrix, to: ColorMatrix },

    #[error("sample buffer holds {actual} values, expected {expected}")]
    BufferLength { expected: usize, actual: usize },
}

impl PipelineError {
    /// Short machine-friendly name of the variant, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidGeometry(_) => "invalid_geometry",
            Self::InferenceFailure { .. } => "inference_failure",
            Self::CropOutOfBounds { .. } => "crop_out_of_bounds",
            Self::FormatConversion(_) => "format_conversion",
            Self::Source { .. } => "source",
            Self::Sink { .. } => "sink",
            Self::Config(_) => "config",
            Self::TaskPanicked { .. } => "task_panicked",
        }
    }
}
