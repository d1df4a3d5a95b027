//! Core crate for the vsrpipe video super-resolution frame pipeline.

pub mod config;
pub mod convert;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod io;
pub mod logging;
pub mod padding;
pub mod pipeline;
pub mod reconstruct;
pub mod runtime;
pub mod types;
pub mod window;

pub use error::{ConversionError, PipelineError};
pub use pipeline::{Pipeline, PipelineFailure, PipelineState, RunPlan, RunSummary};
pub use types::{Frame, FrameRef};
