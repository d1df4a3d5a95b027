//! Temporal windows: for each center frame, the ordered neighbor frames the
//! model consumes. Indices past either end of the stream clamp to the
//! nearest valid frame, so the first and last frames repeat.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::types::FrameRef;

pub const DEFAULT_WINDOW_OFFSETS: [i64; 5] = [-2, -1, 0, 1, 2];

/// Largest accepted `|offset|`. Keeps span and index arithmetic in range.
pub const MAX_WINDOW_OFFSET: i64 = 1 << 16;

/// Ordered relative offsets of a window. The order is the order the engine
/// expects its input slots in and is never re-sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<i64>", into = "Vec<i64>")]
pub struct WindowOffsets(Vec<i64>);

impl WindowOffsets {
    pub fn new(offsets: Vec<i64>) -> Result<Self, PipelineError> {
        if offsets.is_empty() {
            return Err(PipelineError::Config(
                "window offsets must not be empty".to_string(),
            ));
        }
        if let Some(offset) = offsets
            .iter()
            .find(|offset| offset.unsigned_abs() > MAX_WINDOW_OFFSET as u64)
        {
            return Err(PipelineError::Config(format!(
                "window offset {offset} exceeds the limit of +/-{MAX_WINDOW_OFFSET}"
            )));
        }
        Ok(Self(offsets))
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    /// Window size W.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn min(&self) -> i64 {
        self.0.iter().copied().min().unwrap_or(0)
    }

    pub fn max(&self) -> i64 {
        self.0.iter().copied().max().unwrap_or(0)
    }

    /// Number of distinct frames a single window can touch.
    pub fn span(&self) -> usize {
        (self.max() - self.min()) as usize + 1
    }
}

impl Default for WindowOffsets {
    fn default() -> Self {
        Self(DEFAULT_WINDOW_OFFSETS.to_vec())
    }
}

impl TryFrom<Vec<i64>> for WindowOffsets {
    type Error = PipelineError;

    fn try_from(offsets: Vec<i64>) -> Result<Self, Self::Error> {
        Self::new(offsets)
    }
}

impl From<WindowOffsets> for Vec<i64> {
    fn from(offsets: WindowOffsets) -> Self {
        offsets.0
    }
}

/// Clamps `center + offset` into `0..len`. `len` must be positive.
pub fn clamp_index(center: usize, offset: i64, len: usize) -> usize {
    debug_assert!(len > 0);
    let last = len.saturating_sub(1) as i64;
    (center as i64).saturating_add(offset).clamp(0, last) as usize
}

/// Source indices of the window centered on `center`, in offset order.
pub fn resolve_indices(
    offsets: &WindowOffsets,
    center: usize,
    len: usize,
) -> Result<Vec<usize>, PipelineError> {
    if len == 0 {
        return Err(PipelineError::InvalidGeometry(
            "frame sequence is empty".to_string(),
        ));
    }
    if center >= len {
        return Err(PipelineError::InvalidGeometry(format!(
            "window center {center} is outside a sequence of {len} frames"
        )));
    }
    Ok(offsets
        .as_slice()
        .iter()
        .map(|&offset| clamp_index(center, offset, len))
        .collect())
}

/// Frames for one center index, ordered like the configured offsets.
#[derive(Debug, Clone)]
pub struct TemporalWindow {
    center: usize,
    indices: Vec<usize>,
    frames: Vec<FrameRef>,
}

impl TemporalWindow {
    pub fn center(&self) -> usize {
        self.center
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn frames(&self) -> &[FrameRef] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Builds windows over a stream of `len` frames.
///
/// Recently fetched frames are kept in a small history so overlapping
/// windows share one prepared copy instead of fetching it W times. The
/// history never holds more than `offsets.span()` frames.
pub struct TemporalWindowBuilder {
    offsets: WindowOffsets,
    len: usize,
    history: VecDeque<(usize, FrameRef)>,
    capacity: usize,
}

impl TemporalWindowBuilder {
    pub fn new(offsets: WindowOffsets, len: usize) -> Result<Self, PipelineError> {
        if len == 0 {
            return Err(PipelineError::InvalidGeometry(
                "frame sequence is empty".to_string(),
            ));
        }
        let capacity = offsets.span().min(len);
        Ok(Self {
            offsets,
            len,
            history: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    pub fn offsets(&self) -> &WindowOffsets {
        &self.offsets
    }

    pub fn stream_len(&self) -> usize {
        self.len
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn resolve(&self, center: usize) -> Result<Vec<usize>, PipelineError> {
        resolve_indices(&self.offsets, center, self.len)
    }

    /// Builds the window for `center`, calling `fetch` for every frame not
    /// already in the history.
    pub fn build<F, E>(&mut self, center: usize, mut fetch: F) -> Result<TemporalWindow, E>
    where
        F: FnMut(usize) -> Result<FrameRef, E>,
        E: From<PipelineError>,
    {
        let indices = self.resolve(center)?;
        let oldest_needed = clamp_index(center, self.offsets.min(), self.len);
        self.history.retain(|(index, _)| *index >= oldest_needed);

        let mut frames = Vec::with_capacity(indices.len());
        for &index in &indices {
            let frame = match self.cached(index) {
                Some(frame) => frame,
                None => {
                    let frame = fetch(index)?;
                    self.remember(index, frame.clone());
                    frame
                }
            };
            frames.push(frame);
        }

        Ok(TemporalWindow {
            center,
            indices,
            frames,
        })
    }

    fn cached(&self, index: usize) -> Option<FrameRef> {
        self.history
            .iter()
            .find(|(cached, _)| *cached == index)
            .map(|(_, frame)| frame.clone())
    }

    fn remember(&mut self, index: usize, frame: FrameRef) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back((index, frame));
    }
}
