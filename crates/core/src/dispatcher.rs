//! Packs temporal windows into engine batches and splits the results back
//! into per-window frames.

use ndarray::{s, Array5, ArrayView3, Axis};
use tracing::{debug, info};

use crate::engine::{EngineContract, InferenceEngine};
use crate::error::PipelineError;
use crate::types::{ColorSpec, Frame, CHANNELS};
use crate::window::TemporalWindow;

pub struct InferenceDispatcher {
    engine: Box<dyn InferenceEngine>,
    stream_count: usize,
    submitted: u64,
}

impl InferenceDispatcher {
    /// `stream_count` is the number of windows submitted per engine call.
    pub fn new(
        engine: Box<dyn InferenceEngine>,
        stream_count: usize,
    ) -> Result<Self, PipelineError> {
        if stream_count == 0 {
            return Err(PipelineError::Config(
                "stream count must be at least 1".to_string(),
            ));
        }
        if let Some(max_batch) = engine.contract().max_batch {
            if stream_count > max_batch {
                return Err(PipelineError::Config(format!(
                    "stream count {stream_count} exceeds the engine's batch size {max_batch}"
                )));
            }
        }
        Ok(Self {
            engine,
            stream_count,
            submitted: 0,
        })
    }

    pub fn contract(&self) -> &EngineContract {
        self.engine.contract()
    }

    pub fn scale(&self) -> u32 {
        self.engine.contract().scale
    }

    pub fn stream_count(&self) -> usize {
        self.stream_count
    }

    /// Windows submitted to the engine so far.
    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Runs one throwaway batch so lazy engine initialization (kernel
    /// selection, TensorRT engine builds) happens before the first real frame.
    pub fn warmup(&mut self, width: usize, height: usize) -> Result<(), PipelineError> {
        let contract = self.engine.contract();
        let shape = (1, contract.slots, contract.channels, height, width);
        debug!(?shape, "Running warmup inference");

        let output = self
            .engine
            .infer(Array5::<f32>::zeros(shape))
            .map_err(|e| PipelineError::InferenceFailure {
                index: 0,
                diagnostic: format!("warmup failed: {e:#}"),
            })?;
        info!(output_shape = ?output.shape(), "Warmup inference complete");
        Ok(())
    }

    pub fn dispatch_one(&mut self, window: &TemporalWindow) -> Result<Frame, PipelineError> {
        let mut frames = self.run_batch(std::slice::from_ref(window))?;
        frames.pop().ok_or_else(|| PipelineError::InferenceFailure {
            index: window.center() as u64,
            diagnostic: "engine returned no frames".to_string(),
        })
    }

    /// Infers every window, `stream_count` at a time. Results are returned
    /// in input order.
    pub fn dispatch(&mut self, windows: &[TemporalWindow]) -> Result<Vec<Frame>, PipelineError> {
        let mut frames = Vec::with_capacity(windows.len());
        for batch in windows.chunks(self.stream_count) {
            frames.extend(self.run_batch(batch)?);
        }
        Ok(frames)
    }

    fn run_batch(&mut self, windows: &[TemporalWindow]) -> Result<Vec<Frame>, PipelineError> {
        let Some(first) = windows.first() else {
            return Ok(Vec::new());
        };
        let first_index = first.center() as u64;
        let failure = |index: u64, diagnostic: String| PipelineError::InferenceFailure {
            index,
            diagnostic,
        };

        let (width, height) = window_dims(first)?;
        let slots = first.len();
        let mut batch = Array5::<f32>::zeros((windows.len(), slots, CHANNELS, height, width));

        for (b, window) in windows.iter().enumerate() {
            let index = window.center() as u64;
            let (w, h) = window_dims(window)?;
            if (w, h) != (width, height) || window.len() != slots {
                return Err(failure(
                    index,
                    format!(
                        "batched windows disagree: [{slots}, {height}, {width}] vs [{}, {h}, {w}]",
                        window.len()
                    ),
                ));
            }
            self.contract()
                .check_window_shape(window.len(), CHANNELS, h, w)
                .map_err(|diagnostic| failure(index, diagnostic))?;

            for (slot, frame) in window.frames().iter().enumerate() {
                let samples = frame.planar_samples().ok_or_else(|| {
                    failure(
                        index,
                        format!("slot {slot} holds a {} frame, expected planar", frame.format()),
                    )
                })?;
                let plane = ArrayView3::from_shape((CHANNELS, h, w), &*samples)
                    .map_err(|e| failure(index, format!("slot {slot}: {e}")))?;
                batch.slice_mut(s![b, slot, .., .., ..]).assign(&plane);
            }
        }

        let output = self
            .engine
            .infer(batch)
            .map_err(|e| failure(first_index, format!("{e:#}")))?;

        let (out_h, out_w) = self.contract().output_dims(height, width);
        let expected = [windows.len(), CHANNELS, out_h, out_w];
        if output.shape() != expected {
            return Err(failure(
                first_index,
                format!(
                    "engine returned shape {:?}, expected {expected:?} for x{} upscaling",
                    output.shape(),
                    self.scale()
                ),
            ));
        }

        let mut frames = Vec::with_capacity(windows.len());
        for (window, upscaled) in windows.iter().zip(output.axis_iter(Axis(0))) {
            let color = window_color(window);
            let data: Vec<f32> = upscaled.iter().copied().collect();
            frames.push(Frame::planar_f32(out_w as u32, out_h as u32, color, data)?);
        }

        self.submitted += windows.len() as u64;
        Ok(frames)
    }
}

fn window_dims(window: &TemporalWindow) -> Result<(usize, usize), PipelineError> {
    let index = window.center() as u64;
    let Some(first) = window.frames().first() else {
        return Err(PipelineError::InferenceFailure {
            index,
            diagnostic: "window is empty".to_string(),
        });
    };
    if let Some(other) = window.frames().iter().find(|f| f.dims() != first.dims()) {
        return Err(PipelineError::InferenceFailure {
            index,
            diagnostic: format!(
                "window mixes frame sizes {}x{} and {}x{}",
                first.width(),
                first.height(),
                other.width(),
                other.height()
            ),
        });
    }
    Ok((first.width() as usize, first.height() as usize))
}

/// Color of the window's center slot, falling back to the first slot.
fn window_color(window: &TemporalWindow) -> ColorSpec {
    window
        .indices()
        .iter()
        .position(|&index| index == window.center())
        .and_then(|slot| window.frames().get(slot))
        .or_else(|| window.frames().first())
        .map(|frame| frame.color())
        .unwrap_or_default()
}
