//! Inference engine abstraction.
//!
//! An engine consumes a batch of temporal windows shaped
//! `[batch, slots, channels, height, width]` and returns one upscaled frame
//! per window, shaped `[batch, channels, height * scale, width * scale]`.

pub mod backend;
pub mod onnx;

use anyhow::Result;
use ndarray::{Array4, Array5};
use serde::Serialize;

use crate::types::TensorPrecision;

/// Static description of what an engine accepts and produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineContract {
    /// Frames per window (W).
    pub slots: usize,
    pub channels: usize,
    /// Fixed input height, or `None` when the model accepts any height.
    pub height: Option<usize>,
    /// Fixed input width, or `None` when the model accepts any width.
    pub width: Option<usize>,
    pub scale: u32,
    /// Largest batch the model accepts; `None` for a dynamic batch axis.
    pub max_batch: Option<usize>,
    pub precision: TensorPrecision,
}

impl EngineContract {
    /// Checks one window's `[slots, channels, height, width]` shape.
    pub fn check_window_shape(
        &self,
        slots: usize,
        channels: usize,
        height: usize,
        width: usize,
    ) -> std::result::Result<(), String> {
        let height_ok = self.height.map_or(true, |h| h == height);
        let width_ok = self.width.map_or(true, |w| w == width);
        if slots == self.slots && channels == self.channels && height_ok && width_ok {
            return Ok(());
        }

        let dim = |value: Option<usize>| value.map_or_else(|| "?".to_string(), |v| v.to_string());
        Err(format!(
            "engine expects window [{}, {}, {}, {}], got [{slots}, {channels}, {height}, {width}]",
            self.slots,
            self.channels,
            dim(self.height),
            dim(self.width),
        ))
    }

    /// Output frame size for an input of `height`x`width`.
    pub fn output_dims(&self, height: usize, width: usize) -> (usize, usize) {
        let scale = self.scale as usize;
        (height * scale, width * scale)
    }
}

/// A loaded super-resolution model.
///
/// Engines are owned by a single dispatcher at a time and may keep mutable
/// state (sessions, scratch buffers), hence `&mut self`.
pub trait InferenceEngine: Send {
    fn contract(&self) -> &EngineContract;

    fn infer(&mut self, batch: Array5<f32>) -> Result<Array4<f32>>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn contract(&self) -> &EngineContract {
        (**self).contract()
    }

    fn infer(&mut self, batch: Array5<f32>) -> Result<Array4<f32>> {
        (**self).infer(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract(height: Option<usize>, width: Option<usize>) -> EngineContract {
        EngineContract {
            slots: 5,
            channels: 3,
            height,
            width,
            scale: 4,
            max_batch: None,
            precision: TensorPrecision::F32,
        }
    }

    #[test]
    fn dynamic_spatial_dims_accept_any_size() {
        assert!(contract(None, None).check_window_shape(5, 3, 540, 1080).is_ok());
    }

    #[test]
    fn fixed_dims_must_match_exactly() {
        let err = contract(Some(544), Some(1088))
            .check_window_shape(5, 3, 540, 1080)
            .unwrap_err();
        assert!(err.contains("[5, 3, 544, 1088]"), "{err}");
        assert!(err.contains("[5, 3, 540, 1080]"), "{err}");
    }

    #[test]
    fn slot_count_mismatch_is_reported() {
        assert!(contract(None, None).check_window_shape(3, 3, 64, 64).is_err());
    }

    #[test]
    fn output_dims_apply_scale() {
        assert_eq!(contract(None, None).output_dims(544, 1088), (2176, 4352));
    }
}
