//! Frame sources and sinks.
//!
//! Decoding and encoding live outside the pipeline; it only needs random
//! access to decoded frames and an ordered place to put results. The raw
//! video implementations read and write headerless packed RGB, the format
//! `ffmpeg -f rawvideo -pix_fmt rgb24|rgb48le` produces and consumes.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::types::{packed_frame_len, ColorSpec, Frame, PixelFormat};

/// Geometry and length of a frame stream. Every frame of a stream shares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub bit_depth: u8,
    pub color: ColorSpec,
    pub frame_count: usize,
}

pub trait FrameSource: Send {
    fn info(&self) -> SourceInfo;

    /// Frame at `index`, `0 <= index < info().frame_count`.
    fn frame(&mut self, index: usize) -> Result<Frame>;
}

pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Called once after the last frame of a completed run.
    fn finish(&mut self) -> Result<()>;
}

/// In-memory source over already decoded frames.
pub struct VecSource {
    info: SourceInfo,
    frames: Vec<Frame>,
}

impl VecSource {
    pub fn new(frames: Vec<Frame>) -> Result<Self> {
        let first = frames.first().context("frame sequence is empty")?;
        let info = SourceInfo {
            width: first.width(),
            height: first.height(),
            format: first.format(),
            bit_depth: first.bit_depth(),
            color: first.color(),
            frame_count: frames.len(),
        };
        Ok(Self { info, frames })
    }
}

impl FrameSource for VecSource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn frame(&mut self, index: usize) -> Result<Frame> {
        self.frames
            .get(index)
            .cloned()
            .with_context(|| format!("frame {index} is out of range"))
    }
}

/// In-memory sink. Clones share the collected frames, so a caller can keep
/// one handle while the pipeline consumes another.
#[derive(Clone, Default)]
pub struct VecSink {
    state: Arc<Mutex<VecSinkState>>,
}

#[derive(Default)]
struct VecSinkState {
    frames: Vec<Frame>,
    finished: bool,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.lock().frames.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecSinkState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FrameSink for VecSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let mut state = self.lock();
        if state.finished {
            bail!("sink already finished");
        }
        state.frames.push(frame.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.lock().finished = true;
        Ok(())
    }
}

/// Headerless packed RGB file with random frame access.
pub struct RawVideoSource {
    path: PathBuf,
    file: File,
    info: SourceInfo,
    frame_len: usize,
}

impl RawVideoSource {
    pub fn open(
        path: &Path,
        width: u32,
        height: u32,
        bit_depth: u8,
        color: ColorSpec,
    ) -> Result<Self> {
        let frame_len = packed_frame_len(width, height, bit_depth)
            .filter(|len| *len > 0)
            .with_context(|| {
                format!("unsupported raw frame geometry {width}x{height} at {bit_depth}-bit")
            })?;
        let file = File::open(path)
            .with_context(|| format!("failed to open raw video: {}", path.display()))?;
        let total = file
            .metadata()
            .with_context(|| format!("failed to stat raw video: {}", path.display()))?
            .len();

        let frame_len_u64 = frame_len as u64;
        if total % frame_len_u64 != 0 {
            bail!(
                "{} is {total} bytes, not a whole number of {width}x{height} {bit_depth}-bit frames ({frame_len} bytes each)",
                path.display()
            );
        }
        let frame_count = (total / frame_len_u64) as usize;
        if frame_count == 0 {
            bail!("{} contains no frames", path.display());
        }

        debug!(
            path = %path.display(),
            width,
            height,
            bit_depth,
            frame_count,
            "Opened raw video source"
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            info: SourceInfo {
                width,
                height,
                format: PixelFormat::PackedRgb,
                bit_depth,
                color,
                frame_count,
            },
            frame_len,
        })
    }
}

impl FrameSource for RawVideoSource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn frame(&mut self, index: usize) -> Result<Frame> {
        if index >= self.info.frame_count {
            bail!(
                "frame {index} is past the end of {} ({} frames)",
                self.path.display(),
                self.info.frame_count
            );
        }

        let offset = index as u64 * self.frame_len as u64;
        self.file
            .seek(SeekFrom::Start(offset))
            .with_context(|| format!("failed to seek to frame {index}"))?;
        let mut data = vec![0u8; self.frame_len];
        self.file
            .read_exact(&mut data)
            .with_context(|| format!("failed to read frame {index}"))?;

        let info = self.info;
        Ok(Frame::packed_rgb(
            info.width,
            info.height,
            info.bit_depth,
            info.color,
            data,
        )?)
    }
}

/// Appends packed RGB frames to a headerless file.
pub struct RawVideoSink {
    path: PathBuf,
    writer: BufWriter<File>,
    frames_written: u64,
}

impl RawVideoSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create output directory: {}", parent.display())
            })?;
        }
        let file = File::create(path)
            .with_context(|| format!("failed to create raw video: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            frames_written: 0,
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl FrameSink for RawVideoSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let bytes = frame
            .as_bytes()
            .with_context(|| format!("raw video sink needs packed RGB, got {}", frame.format()))?;
        self.writer
            .write_all(bytes)
            .with_context(|| format!("failed to write frame to {}", self.path.display()))?;
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))?;
        debug!(
            path = %self.path.display(),
            frames = self.frames_written,
            "Raw video sink finished"
        );
        Ok(())
    }
}
