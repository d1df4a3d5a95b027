//! Frame pipeline: pad, window, convert, infer, reconstruct, emit.
//!
//! Two drivers share the same stages. [`Pipeline::run`] processes windows
//! one batch at a time on the calling thread. [`Pipeline::run_streaming`]
//! runs preparation, inference and emission as three blocking tasks joined
//! by bounded channels, so decoding and encoding overlap with inference
//! while output order is preserved.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::convert::{ConversionTarget, FormatConverter};
use crate::dispatcher::InferenceDispatcher;
use crate::engine::InferenceEngine;
use crate::error::PipelineError;
use crate::io::{FrameSink, FrameSource, SourceInfo};
use crate::padding::{AlignmentPadder, PaddingSpec};
use crate::reconstruct::OutputReconstructor;
use crate::types::{Frame, FrameRef};
use crate::window::{resolve_indices, TemporalWindow, TemporalWindowBuilder, WindowOffsets};

/// Called after every emitted frame with `(emitted, total)`.
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Init,
    Padding,
    Windowing,
    Converting,
    Inferring,
    Reconstructing,
    Emitting,
    Done,
    Cancelled,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Padding => "padding",
            Self::Windowing => "windowing",
            Self::Converting => "converting",
            Self::Inferring => "inferring",
            Self::Reconstructing => "reconstructing",
            Self::Emitting => "emitting",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A fatal pipeline error together with the stage and frame it hit.
#[derive(Debug)]
pub struct PipelineFailure {
    pub state: PipelineState,
    pub frame_index: Option<u64>,
    pub error: PipelineError,
}

impl PipelineFailure {
    pub fn new(state: PipelineState, frame_index: Option<u64>, error: PipelineError) -> Self {
        Self {
            state,
            frame_index,
            error,
        }
    }

    fn at(state: PipelineState, index: usize, error: PipelineError) -> Self {
        Self::new(state, Some(index as u64), error)
    }

    fn init(error: PipelineError) -> Self {
        Self::new(PipelineState::Init, None, error)
    }

    /// Inference errors already name the window they failed on.
    fn inference(error: PipelineError, fallback_index: usize) -> Self {
        let index = match &error {
            PipelineError::InferenceFailure { index, .. } => *index,
            _ => fallback_index as u64,
        };
        Self::new(PipelineState::Inferring, Some(index), error)
    }

    fn or_frame(mut self, index: usize) -> Self {
        self.frame_index.get_or_insert(index as u64);
        self
    }
}

impl From<PipelineError> for PipelineFailure {
    fn from(error: PipelineError) -> Self {
        Self::new(PipelineState::Windowing, None, error)
    }
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frame_index {
            Some(index) => write!(f, "{} stage failed at frame {index}: {}", self.state, self.error),
            None => write!(f, "{} stage failed: {}", self.state, self.error),
        }
    }
}

impl std::error::Error for PipelineFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Geometry of a run, fixed before the first frame is touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunPlan {
    pub frame_count: usize,
    pub input_dims: (u32, u32),
    pub padding: PaddingSpec,
    pub padded_dims: (u32, u32),
    pub scale: u32,
    pub output_dims: (u32, u32),
    pub window_offsets: WindowOffsets,
}

impl RunPlan {
    pub fn compute(
        info: &SourceInfo,
        config: &PipelineConfig,
        scale: u32,
    ) -> Result<Self, PipelineError> {
        if info.frame_count == 0 {
            return Err(PipelineError::InvalidGeometry(
                "source has no frames".to_string(),
            ));
        }
        if scale == 0 {
            return Err(PipelineError::Config("scale must be positive".to_string()));
        }

        let padding = PaddingSpec::compute(info.width, info.height, config.block_size)?;
        let output_dims = info
            .width
            .checked_mul(scale)
            .zip(info.height.checked_mul(scale))
            .ok_or_else(|| {
                PipelineError::InvalidGeometry(format!(
                    "{}x{} upscaled x{scale} overflows",
                    info.width, info.height
                ))
            })?;
        Ok(Self {
            frame_count: info.frame_count,
            input_dims: (info.width, info.height),
            padding,
            padded_dims: padding.padded_dims(info.width, info.height),
            scale,
            output_dims,
            window_offsets: config.window_offsets.clone(),
        })
    }

    /// Source indices feeding the window centered on `center`.
    pub fn window_indices(&self, center: usize) -> Result<Vec<usize>, PipelineError> {
        resolve_indices(&self.window_offsets, center, self.frame_count)
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub plan: RunPlan,
    pub frames_emitted: u64,
    pub total_frames: u64,
    pub cancelled: bool,
    pub final_state: PipelineState,
    pub elapsed: Duration,
}

pub struct Pipeline {
    config: PipelineConfig,
    padder: AlignmentPadder,
    dispatcher: InferenceDispatcher,
    converter: Arc<dyn FormatConverter>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        engine: Box<dyn InferenceEngine>,
        converter: Arc<dyn FormatConverter>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let contract = engine.contract();
        if contract.slots != config.window_offsets.len() {
            return Err(PipelineError::InferenceFailure {
                index: 0,
                diagnostic: format!(
                    "engine takes {} frames per window but {} window offsets are configured",
                    contract.slots,
                    config.window_offsets.len()
                ),
            });
        }
        if let Some(scale) = config.scale {
            if scale != contract.scale {
                return Err(PipelineError::Config(format!(
                    "configured scale x{scale} disagrees with the engine's x{}",
                    contract.scale
                )));
            }
        }

        let padder = AlignmentPadder::new(config.block_size)?;
        let dispatcher = InferenceDispatcher::new(engine, config.stream_count)?;
        Ok(Self {
            config,
            padder,
            dispatcher,
            converter,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn scale(&self) -> u32 {
        self.dispatcher.scale()
    }

    pub fn plan(&self, info: &SourceInfo) -> Result<RunPlan, PipelineError> {
        RunPlan::compute(info, &self.config, self.scale())
    }

    /// Runs the whole stream on the calling thread.
    ///
    /// Setting `cancel` stops the run before the next batch; a cancelled
    /// run never calls `sink.finish()`.
    pub fn run<S, K>(
        self,
        source: S,
        mut sink: K,
        cancel: &AtomicBool,
        progress: Option<ProgressCallback>,
    ) -> Result<RunSummary, PipelineFailure>
    where
        S: FrameSource,
        K: FrameSink,
    {
        let started = Instant::now();
        let Stages {
            plan,
            mut preparer,
            mut dispatcher,
            reconstructor,
            warmup,
        } = self.into_stages(source)?;
        let total = plan.frame_count;

        if let Some((width, height)) = warmup {
            dispatcher
                .warmup(width, height)
                .map_err(PipelineFailure::init)?;
        }

        let mut clocks = StageClocks::default();
        let mut emitted = 0_u64;
        let mut next = 0_usize;

        while next < total {
            if cancel.load(Ordering::SeqCst) {
                info!(emitted, total, "Pipeline cancelled");
                return Ok(summary(plan, emitted, true, started));
            }

            let batch_end = (next + dispatcher.stream_count()).min(total);
            let mut windows = Vec::with_capacity(batch_end - next);
            for center in next..batch_end {
                let t = Instant::now();
                windows.push(preparer.prepare(center)?);
                clocks.prepare.record(t);
            }

            let t = Instant::now();
            let outputs = dispatcher
                .dispatch(&windows)
                .map_err(|e| PipelineFailure::inference(e, next))?;
            clocks.infer.record(t);
            drop(windows);

            for (index, upscaled) in (next..batch_end).zip(outputs) {
                let t = Instant::now();
                let delivered = reconstructor
                    .reconstruct(&upscaled)
                    .map_err(|e| PipelineFailure::at(PipelineState::Reconstructing, index, e))?;
                clocks.reconstruct.record(t);

                let t = Instant::now();
                emit(&mut sink, index, &delivered)?;
                clocks.emit.record(t);

                emitted += 1;
                if let Some(callback) = progress.as_ref() {
                    callback(emitted, total as u64);
                }
            }
            next = batch_end;
        }

        sink.finish()
            .map_err(|e| sink_failure(total.saturating_sub(1), e))?;
        clocks.log();

        Ok(summary(plan, emitted, false, started))
    }

    /// Runs the stream as three concurrent blocking stages.
    ///
    /// Sending `true` on `cancel` stops every stage promptly; frames already
    /// emitted stay emitted and `sink.finish()` is not called. A cancel that
    /// lands after the last frame was emitted still finishes the sink.
    ///
    /// On a stage failure the downstream stages drain what was already
    /// produced, so the sink receives the same frames as in [`Pipeline::run`].
    pub async fn run_streaming<S, K>(
        self,
        source: S,
        sink: K,
        cancel: watch::Receiver<bool>,
        progress: Option<ProgressCallback>,
    ) -> Result<RunSummary, PipelineFailure>
    where
        S: FrameSource + 'static,
        K: FrameSink + 'static,
    {
        let started = Instant::now();
        let buffer_size = self.config.buffer_size.max(1);
        let Stages {
            plan,
            preparer,
            dispatcher,
            reconstructor,
            warmup,
        } = self.into_stages(source)?;

        if *cancel.borrow() {
            return Ok(summary(plan, 0, true, started));
        }

        let total = plan.frame_count;
        let emitted = Arc::new(AtomicU64::new(0));
        let finished = Arc::new(AtomicBool::new(false));
        let (error_tx, mut error_rx) = mpsc::unbounded_channel::<PipelineFailure>();
        let (cancel_tx, _) = watch::channel(false);
        let cancel_state = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));
        let external_cancel_handle =
            spawn_external_cancel_watcher(cancel, cancel_state.clone(), cancel_tx.clone());

        let (window_tx, window_rx) = mpsc::channel::<TemporalWindow>(buffer_size);
        let (output_tx, output_rx) = mpsc::channel::<(usize, Frame)>(buffer_size);
        let ctl = StageControl {
            cancel_state: cancel_state.clone(),
            cancel_tx: cancel_tx.clone(),
            failed: failed.clone(),
            error_tx,
        };

        let emit_progress = EmitProgress {
            emitted: emitted.clone(),
            finished: finished.clone(),
        };
        let handles = vec![
            (
                "prepare",
                spawn_stage(ctl.clone(), move |ctl| {
                    run_prepare_loop(preparer, total, window_tx, ctl)
                }),
            ),
            (
                "inference",
                spawn_stage(ctl.clone(), move |ctl| {
                    run_inference_loop(dispatcher, warmup, window_rx, output_tx, ctl)
                }),
            ),
            (
                "emit",
                spawn_stage(ctl, move |ctl| {
                    run_emit_loop(reconstructor, sink, output_rx, total, emit_progress, progress, ctl)
                }),
            ),
        ];

        let mut first_error: Option<PipelineFailure> = None;
        for (stage, handle) in handles {
            if let Err(join_error) = handle.await {
                failed.store(true, Ordering::SeqCst);
                signal_cancel(&cancel_state, &cancel_tx);
                first_error.get_or_insert(PipelineFailure::new(
                    PipelineState::Failed,
                    None,
                    PipelineError::TaskPanicked {
                        stage,
                        message: join_error.to_string(),
                    },
                ));
            }
        }

        while let Some(failure) = error_rx.recv().await {
            first_error.get_or_insert(failure);
        }

        signal_cancel(&cancel_state, &cancel_tx);
        external_cancel_handle.abort();
        let _ = external_cancel_handle.await;

        if let Some(failure) = first_error {
            return Err(failure);
        }

        let emitted = emitted.load(Ordering::SeqCst);
        let cancelled = !finished.load(Ordering::SeqCst);
        if cancelled {
            info!(emitted, total, "Pipeline cancelled");
        }
        Ok(summary(plan, emitted, cancelled, started))
    }

    fn into_stages<S: FrameSource>(self, source: S) -> Result<Stages<S>, PipelineFailure> {
        let info = source.info();
        let plan = self.plan(&info).map_err(PipelineFailure::init)?;
        let Self {
            config,
            padder,
            dispatcher,
            converter,
        } = self;

        info!(
            frames = plan.frame_count,
            input = ?plan.input_dims,
            padded = ?plan.padded_dims,
            output = ?plan.output_dims,
            scale = plan.scale,
            streams = dispatcher.stream_count(),
            "Pipeline plan"
        );

        let builder = TemporalWindowBuilder::new(config.window_offsets.clone(), plan.frame_count)
            .map_err(PipelineFailure::init)?;
        let reconstructor = OutputReconstructor::new(
            plan.padding,
            plan.scale,
            plan.input_dims,
            config.delivery_target(info.color),
            converter.clone(),
        );
        let warmup = config.warmup.then(|| {
            let contract = dispatcher.contract();
            (
                contract.width.unwrap_or(plan.padded_dims.0 as usize),
                contract.height.unwrap_or(plan.padded_dims.1 as usize),
            )
        });
        let preparer = WindowPreparer {
            source,
            info,
            padder,
            converter,
            target: config.working_target(info.color),
            builder,
        };

        Ok(Stages {
            plan,
            preparer,
            dispatcher,
            reconstructor,
            warmup,
        })
    }
}

struct Stages<S> {
    plan: RunPlan,
    preparer: WindowPreparer<S>,
    dispatcher: InferenceDispatcher,
    reconstructor: OutputReconstructor,
    warmup: Option<(usize, usize)>,
}

/// Fetches, pads and converts source frames into temporal windows.
struct WindowPreparer<S> {
    source: S,
    info: SourceInfo,
    padder: AlignmentPadder,
    converter: Arc<dyn FormatConverter>,
    target: ConversionTarget,
    builder: TemporalWindowBuilder,
}

impl<S: FrameSource> WindowPreparer<S> {
    fn prepare(&mut self, center: usize) -> Result<TemporalWindow, PipelineFailure> {
        let Self {
            source,
            info,
            padder,
            converter,
            target,
            builder,
        } = self;

        builder
            .build(center, |index| -> Result<FrameRef, PipelineFailure> {
                let raw = source.frame(index).map_err(|e| {
                    PipelineFailure::at(
                        PipelineState::Windowing,
                        index,
                        PipelineError::Source {
                            index: index as u64,
                            message: format!("{e:#}"),
                        },
                    )
                })?;
                if raw.dims() != (info.width, info.height) {
                    return Err(PipelineFailure::at(
                        PipelineState::Padding,
                        index,
                        PipelineError::InvalidGeometry(format!(
                            "frame is {}x{}, stream is {}x{}",
                            raw.width(),
                            raw.height(),
                            info.width,
                            info.height
                        )),
                    ));
                }

                let padded = padder
                    .pad(&raw)
                    .map_err(|e| PipelineFailure::at(PipelineState::Padding, index, e))?;
                let converted = converter
                    .convert(&padded, target)
                    .map_err(|e| PipelineFailure::at(PipelineState::Converting, index, e.into()))?;
                Ok(Arc::new(converted))
            })
            .map_err(|failure| failure.or_frame(center))
    }
}

fn emit<K: FrameSink>(sink: &mut K, index: usize, frame: &Frame) -> Result<(), PipelineFailure> {
    sink.write_frame(frame).map_err(|e| sink_failure(index, e))
}

fn sink_failure(index: usize, error: anyhow::Error) -> PipelineFailure {
    PipelineFailure::at(
        PipelineState::Emitting,
        index,
        PipelineError::Sink {
            index: index as u64,
            message: format!("{error:#}"),
        },
    )
}

fn summary(plan: RunPlan, emitted: u64, cancelled: bool, started: Instant) -> RunSummary {
    RunSummary {
        total_frames: plan.frame_count as u64,
        plan,
        frames_emitted: emitted,
        cancelled,
        final_state: if cancelled {
            PipelineState::Cancelled
        } else {
            PipelineState::Done
        },
        elapsed: started.elapsed(),
    }
}

#[derive(Default)]
struct StageClock {
    frames: u64,
    busy_ms: f64,
}

impl StageClock {
    fn record(&mut self, started: Instant) {
        self.frames += 1;
        self.busy_ms += started.elapsed().as_secs_f64() * 1000.0;
    }

    fn avg_ms(&self) -> String {
        format!("{:.1}", self.busy_ms / self.frames.max(1) as f64)
    }
}

#[derive(Default)]
struct StageClocks {
    prepare: StageClock,
    infer: StageClock,
    reconstruct: StageClock,
    emit: StageClock,
}

impl StageClocks {
    fn log(&self) {
        if self.emit.frames == 0 {
            return;
        }
        info!(
            frames = self.emit.frames,
            batches = self.infer.frames,
            avg_prepare_ms = self.prepare.avg_ms(),
            avg_infer_batch_ms = self.infer.avg_ms(),
            avg_reconstruct_ms = self.reconstruct.avg_ms(),
            avg_emit_ms = self.emit.avg_ms(),
            "Pipeline stage summary"
        );
    }
}

#[derive(Clone)]
struct StageControl {
    cancel_state: Arc<AtomicBool>,
    cancel_tx: watch::Sender<bool>,
    failed: Arc<AtomicBool>,
    error_tx: mpsc::UnboundedSender<PipelineFailure>,
}

impl StageControl {
    /// Set by an external cancel and by any stage failure.
    fn cancelled(&self) -> bool {
        self.cancel_state.load(Ordering::SeqCst)
    }

    fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Cancelled from outside rather than by a failing stage.
    fn interrupted(&self) -> bool {
        self.cancelled() && !self.failed()
    }

    /// `failed` is stored before the cancel so `interrupted()` never sees a
    /// failure as an external cancel.
    fn report(&self, failure: PipelineFailure) {
        self.failed.store(true, Ordering::SeqCst);
        signal_cancel(&self.cancel_state, &self.cancel_tx);
        let _ = self.error_tx.send(failure);
    }
}

/// Shared with the emit stage: frames written so far and whether the sink
/// was finished.
struct EmitProgress {
    emitted: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
}

fn spawn_stage<F>(ctl: StageControl, body: F) -> tokio::task::JoinHandle<()>
where
    F: FnOnce(&StageControl) -> Result<(), PipelineFailure> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        if let Err(failure) = body(&ctl) {
            ctl.report(failure);
        }
    })
}

fn spawn_external_cancel_watcher(
    mut cancel: watch::Receiver<bool>,
    cancel_state: Arc<AtomicBool>,
    cancel_tx: watch::Sender<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *cancel.borrow_and_update() {
                signal_cancel(&cancel_state, &cancel_tx);
                return;
            }
            if cancel.changed().await.is_err() {
                return;
            }
        }
    })
}

fn run_prepare_loop<S: FrameSource>(
    mut preparer: WindowPreparer<S>,
    total: usize,
    output: mpsc::Sender<TemporalWindow>,
    ctl: &StageControl,
) -> Result<(), PipelineFailure> {
    let mut clock = StageClock::default();
    let mut send_wait_ms = 0.0_f64;

    for center in 0..total {
        if ctl.cancelled() {
            break;
        }

        let t = Instant::now();
        let window = match preparer.prepare(center) {
            Ok(window) => window,
            Err(failure) => {
                // Reported while `output` is still open, so inference knows
                // the trailing partial batch is incomplete.
                ctl.report(failure);
                break;
            }
        };
        clock.record(t);

        let t_send = Instant::now();
        if output.blocking_send(window).is_err() {
            break;
        }
        send_wait_ms += t_send.elapsed().as_secs_f64() * 1000.0;
    }

    if clock.frames > 0 {
        info!(
            windows = clock.frames,
            avg_prepare_ms = clock.avg_ms(),
            total_send_wait_ms = format!("{send_wait_ms:.0}"),
            "Prepare stage summary"
        );
    }
    Ok(())
}

fn run_inference_loop(
    mut dispatcher: InferenceDispatcher,
    warmup: Option<(usize, usize)>,
    mut input: mpsc::Receiver<TemporalWindow>,
    output: mpsc::Sender<(usize, Frame)>,
    ctl: &StageControl,
) -> Result<(), PipelineFailure> {
    if let Some((width, height)) = warmup {
        dispatcher
            .warmup(width, height)
            .map_err(PipelineFailure::init)?;
    }

    let stream_count = dispatcher.stream_count();
    let mut clock = StageClock::default();
    let mut recv_wait_ms = 0.0_f64;

    'batches: loop {
        if ctl.interrupted() {
            break;
        }

        let t_recv = Instant::now();
        let mut batch = Vec::with_capacity(stream_count);
        while batch.len() < stream_count {
            match input.blocking_recv() {
                Some(window) => batch.push(window),
                None => break,
            }
        }
        recv_wait_ms += t_recv.elapsed().as_secs_f64() * 1000.0;
        let Some(first_center) = batch.first().map(TemporalWindow::center) else {
            break;
        };
        if batch.len() < stream_count && ctl.failed() {
            // The window that failed to prepare belongs to this batch.
            break;
        }

        let t = Instant::now();
        let frames = dispatcher
            .dispatch(&batch)
            .map_err(|e| PipelineFailure::inference(e, first_center))?;
        clock.record(t);
        debug!(
            first = first_center,
            windows = batch.len(),
            state = %PipelineState::Inferring,
            "Batch inferred"
        );

        for (window, frame) in batch.iter().zip(frames) {
            if output.blocking_send((window.center(), frame)).is_err() {
                break 'batches;
            }
        }
    }

    if clock.frames > 0 {
        info!(
            batches = clock.frames,
            windows = dispatcher.submitted(),
            avg_batch_ms = clock.avg_ms(),
            total_recv_wait_ms = format!("{recv_wait_ms:.0}"),
            "Inference stage summary"
        );
    }
    Ok(())
}

fn run_emit_loop<K: FrameSink>(
    reconstructor: OutputReconstructor,
    mut sink: K,
    mut input: mpsc::Receiver<(usize, Frame)>,
    total: usize,
    shared: EmitProgress,
    progress: Option<ProgressCallback>,
    ctl: &StageControl,
) -> Result<(), PipelineFailure> {
    let mut reconstruct_clock = StageClock::default();
    let mut emit_clock = StageClock::default();
    let mut expected = 0_usize;

    loop {
        if ctl.interrupted() {
            break;
        }
        let Some((index, upscaled)) = input.blocking_recv() else {
            break;
        };
        debug_assert_eq!(index, expected, "windows must arrive in order");

        let t = Instant::now();
        let delivered = reconstructor
            .reconstruct(&upscaled)
            .map_err(|e| PipelineFailure::at(PipelineState::Reconstructing, index, e))?;
        reconstruct_clock.record(t);

        let t = Instant::now();
        emit(&mut sink, index, &delivered)?;
        emit_clock.record(t);

        expected += 1;
        shared.emitted.store(expected as u64, Ordering::SeqCst);
        if let Some(callback) = progress.as_ref() {
            callback(expected as u64, total as u64);
        }
    }

    if emit_clock.frames > 0 {
        info!(
            frames = emit_clock.frames,
            avg_reconstruct_ms = reconstruct_clock.avg_ms(),
            avg_emit_ms = emit_clock.avg_ms(),
            "Emit stage summary"
        );
    }

    if expected == total && !ctl.failed() {
        sink.finish()
            .map_err(|e| sink_failure(total.saturating_sub(1), e))?;
        shared.finished.store(true, Ordering::SeqCst);
    }
    Ok(())
}

fn signal_cancel(cancel_state: &Arc<AtomicBool>, cancel_tx: &watch::Sender<bool>) {
    cancel_state.store(true, Ordering::SeqCst);
    let _ = cancel_tx.send(true);
}
