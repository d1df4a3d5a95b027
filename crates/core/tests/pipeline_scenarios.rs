use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use ndarray::{Array4, Array5};
use tokio::sync::watch;

use vsrpipe_core::config::PipelineConfig;
use vsrpipe_core::convert::RgbConverter;
use vsrpipe_core::engine::{EngineContract, InferenceEngine};
use vsrpipe_core::io::{FrameSink, FrameSource, SourceInfo, VecSink, VecSource};
use vsrpipe_core::types::{ColorSpec, Frame, TensorPrecision};
use vsrpipe_core::{Pipeline, PipelineError, PipelineFailure, PipelineState};

/// Every pixel of source frame `i` is `i`, so the engine can tell which
/// source frames a window holds.
fn clip(count: usize, width: u32, height: u32) -> Vec<Frame> {
    (0..count)
        .map(|i| {
            let data = vec![i as u8; (width * height * 3) as usize];
            Frame::packed_rgb(width, height, 8, ColorSpec::default(), data).unwrap()
        })
        .collect()
}

/// Nearest-neighbour upscaler of the center slot that records the source
/// indices it saw in every window.
struct ScriptedEngine {
    contract: EngineContract,
    seen: Arc<Mutex<Vec<Vec<usize>>>>,
    fail_on_center: Option<usize>,
}

impl ScriptedEngine {
    fn new(scale: u32) -> Self {
        Self {
            contract: EngineContract {
                slots: 5,
                channels: 3,
                height: None,
                width: None,
                scale,
                max_batch: None,
                precision: TensorPrecision::F32,
            },
            seen: Arc::default(),
            fail_on_center: None,
        }
    }
}

impl InferenceEngine for ScriptedEngine {
    fn contract(&self) -> &EngineContract {
        &self.contract
    }

    fn infer(&mut self, batch: Array5<f32>) -> Result<Array4<f32>> {
        let (n, slots, c, h, w) = batch.dim();
        for b in 0..n {
            let indices: Vec<usize> = (0..slots)
                .map(|slot| (batch[[b, slot, 0, 0, 0]] * 255.0).round() as usize)
                .collect();
            if Some(indices[slots / 2]) == self.fail_on_center {
                bail!("CUDA error: an illegal memory access was encountered");
            }
            self.seen.lock().unwrap().push(indices);
        }

        let s = self.contract.scale as usize;
        let center = slots / 2;
        Ok(Array4::from_shape_fn((n, c, h * s, w * s), |(b, ch, y, x)| {
            batch[[b, center, ch, y / s, x / s]]
        }))
    }
}

fn config(block_size: u32) -> PipelineConfig {
    PipelineConfig {
        block_size,
        warmup: false,
        ..PipelineConfig::default()
    }
}

fn first_sample(frame: &Frame) -> u16 {
    let bytes = frame.as_bytes().unwrap();
    u16::from_le_bytes([bytes[0], bytes[1]])
}

struct FailingSink {
    inner: VecSink,
    fail_at: usize,
}

impl FrameSink for FailingSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if self.inner.len() == self.fail_at {
            bail!("disk full");
        }
        self.inner.write_frame(frame)
    }

    fn finish(&mut self) -> Result<()> {
        self.inner.finish()
    }
}

struct BrokenSource {
    inner: VecSource,
    broken: usize,
}

impl FrameSource for BrokenSource {
    fn info(&self) -> SourceInfo {
        self.inner.info()
    }

    fn frame(&mut self, index: usize) -> Result<Frame> {
        if index == self.broken {
            bail!("corrupt packet");
        }
        self.inner.frame(index)
    }
}

#[test]
fn ten_frames_emit_in_order_with_clamped_edges() {
    let engine = ScriptedEngine::new(2);
    let seen = engine.seen.clone();
    let pipeline = Pipeline::new(config(4), Box::new(engine), Arc::new(RgbConverter)).unwrap();
    let sink = VecSink::new();

    let summary = pipeline
        .run(
            VecSource::new(clip(10, 6, 3)).unwrap(),
            sink.clone(),
            &AtomicBool::new(false),
            None,
        )
        .unwrap();

    assert_eq!(summary.frames_emitted, 10);
    assert_eq!(summary.final_state, PipelineState::Done);
    assert!(sink.is_finished());

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 10);
    assert_eq!(seen[0], [0, 0, 0, 1, 2]);
    assert_eq!(seen[1], [0, 0, 1, 2, 3]);
    assert_eq!(seen[5], [3, 4, 5, 6, 7]);
    assert_eq!(seen[9], [7, 8, 9, 9, 9]);

    for (i, frame) in sink.frames().iter().enumerate() {
        assert_eq!(frame.dims(), (12, 6));
        assert_eq!(first_sample(frame), i as u16 * 257);
    }
}

#[test]
fn single_frame_stream_repeats_frame_zero() {
    let engine = ScriptedEngine::new(1);
    let seen = engine.seen.clone();
    let pipeline = Pipeline::new(config(8), Box::new(engine), Arc::new(RgbConverter)).unwrap();
    let sink = VecSink::new();

    pipeline
        .run(
            VecSource::new(clip(1, 3, 3)).unwrap(),
            sink.clone(),
            &AtomicBool::new(false),
            None,
        )
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), [vec![0; 5]]);
    assert_eq!(sink.len(), 1);
}

#[test]
fn unaligned_frames_are_padded_then_cropped_back() {
    let pipeline = Pipeline::new(
        config(64),
        Box::new(ScriptedEngine::new(1)),
        Arc::new(RgbConverter),
    )
    .unwrap();
    let source = VecSource::new(clip(1, 1000, 500)).unwrap();

    let plan = pipeline.plan(&source.info()).unwrap();
    assert_eq!((plan.padding.right, plan.padding.bottom), (24, 12));
    assert_eq!(plan.padded_dims, (1024, 512));

    let sink = VecSink::new();
    pipeline
        .run(source, sink.clone(), &AtomicBool::new(false), None)
        .unwrap();
    assert_eq!(sink.frames()[0].dims(), (1000, 500));
}

#[test]
fn upscaled_output_drops_scaled_padding() {
    let pipeline = Pipeline::new(
        config(64),
        Box::new(ScriptedEngine::new(4)),
        Arc::new(RgbConverter),
    )
    .unwrap();
    let sink = VecSink::new();

    let summary = pipeline
        .run(
            VecSource::new(clip(2, 100, 50)).unwrap(),
            sink.clone(),
            &AtomicBool::new(false),
            None,
        )
        .unwrap();

    assert_eq!(summary.plan.output_dims, (400, 200));
    assert!(sink.frames().iter().all(|f| f.dims() == (400, 200)));
}

#[test]
fn fixed_engine_shape_mismatch_emits_nothing() {
    let mut engine = ScriptedEngine::new(1);
    engine.contract.height = Some(544);
    engine.contract.width = Some(1088);
    // 1080x540 is already a multiple of 4, so padding leaves it short of 1088x544.
    let pipeline = Pipeline::new(config(4), Box::new(engine), Arc::new(RgbConverter)).unwrap();
    let sink = VecSink::new();

    let failure = pipeline
        .run(
            VecSource::new(clip(3, 1080, 540)).unwrap(),
            sink.clone(),
            &AtomicBool::new(false),
            None,
        )
        .unwrap_err();

    assert_eq!(failure.state, PipelineState::Inferring);
    assert_eq!(failure.frame_index, Some(0));
    match &failure.error {
        PipelineError::InferenceFailure { diagnostic, .. } => {
            assert!(diagnostic.contains("544"), "{diagnostic}");
        }
        other => panic!("expected InferenceFailure, got {other:?}"),
    }
    assert!(sink.is_empty());
    assert!(!sink.is_finished());
}

#[test]
fn engine_error_names_the_failing_window() {
    let mut engine = ScriptedEngine::new(1);
    engine.fail_on_center = Some(4);
    let pipeline = Pipeline::new(config(4), Box::new(engine), Arc::new(RgbConverter)).unwrap();
    let sink = VecSink::new();

    let failure = pipeline
        .run(
            VecSource::new(clip(8, 4, 4)).unwrap(),
            sink.clone(),
            &AtomicBool::new(false),
            None,
        )
        .unwrap_err();

    assert_eq!(failure.state, PipelineState::Inferring);
    assert!(matches!(
        failure.error,
        PipelineError::InferenceFailure { index: 4, .. }
    ));
    assert_eq!(sink.len(), 4);
    assert!(failure.to_string().contains("illegal memory access"));
}

#[test]
fn sink_failure_stops_the_run() {
    let pipeline = Pipeline::new(
        config(4),
        Box::new(ScriptedEngine::new(1)),
        Arc::new(RgbConverter),
    )
    .unwrap();
    let inner = VecSink::new();

    let failure = pipeline
        .run(
            VecSource::new(clip(6, 4, 4)).unwrap(),
            FailingSink {
                inner: inner.clone(),
                fail_at: 3,
            },
            &AtomicBool::new(false),
            None,
        )
        .unwrap_err();

    assert_eq!(failure.state, PipelineState::Emitting);
    assert_eq!(failure.frame_index, Some(3));
    assert!(matches!(failure.error, PipelineError::Sink { index: 3, .. }));
    assert_eq!(inner.len(), 3);
    assert!(!inner.is_finished());
}

#[test]
fn source_failure_reports_the_missing_frame() {
    let pipeline = Pipeline::new(
        config(4),
        Box::new(ScriptedEngine::new(1)),
        Arc::new(RgbConverter),
    )
    .unwrap();
    let source = BrokenSource {
        inner: VecSource::new(clip(6, 4, 4)).unwrap(),
        broken: 5,
    };

    let failure = pipeline
        .run(source, VecSink::new(), &AtomicBool::new(false), None)
        .unwrap_err();

    // Window 3 is the first to reach frame 5.
    assert_eq!(failure.state, PipelineState::Windowing);
    assert_eq!(failure.frame_index, Some(5));
    assert!(matches!(failure.error, PipelineError::Source { index: 5, .. }));
}

#[test]
fn progress_reports_every_frame() {
    let pipeline = Pipeline::new(
        config(4),
        Box::new(ScriptedEngine::new(1)),
        Arc::new(RgbConverter),
    )
    .unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let recorded = calls.clone();

    pipeline
        .run(
            VecSource::new(clip(4, 2, 2)).unwrap(),
            VecSink::new(),
            &AtomicBool::new(false),
            Some(Box::new(move |done, total| {
                recorded.lock().unwrap().push((done, total))
            })),
        )
        .unwrap();

    assert_eq!(*calls.lock().unwrap(), [(1, 4), (2, 4), (3, 4), (4, 4)]);
}

#[test]
fn cancelling_mid_run_keeps_emitted_frames_and_skips_finish() {
    let pipeline = Pipeline::new(
        config(4),
        Box::new(ScriptedEngine::new(1)),
        Arc::new(RgbConverter),
    )
    .unwrap();
    let sink = VecSink::new();
    let cancel = Arc::new(AtomicBool::new(false));
    let trigger = cancel.clone();

    let summary = pipeline
        .run(
            VecSource::new(clip(10, 2, 2)).unwrap(),
            sink.clone(),
            &cancel,
            Some(Box::new(move |done, _| {
                if done == 3 {
                    trigger.store(true, std::sync::atomic::Ordering::SeqCst);
                }
            })),
        )
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.final_state, PipelineState::Cancelled);
    assert_eq!(summary.frames_emitted, 3);
    assert_eq!(sink.len(), 3);
    assert!(!sink.is_finished());
}

#[tokio::test]
async fn streaming_run_preserves_order() {
    let engine = ScriptedEngine::new(2);
    let seen = engine.seen.clone();
    let config = PipelineConfig {
        stream_count: 2,
        buffer_size: 2,
        ..config(4)
    };
    let pipeline = Pipeline::new(config, Box::new(engine), Arc::new(RgbConverter)).unwrap();
    let sink = VecSink::new();
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let summary = pipeline
        .run_streaming(
            VecSource::new(clip(9, 5, 5)).unwrap(),
            sink.clone(),
            cancel_rx,
            None,
        )
        .await
        .unwrap();

    assert_eq!(summary.frames_emitted, 9);
    assert!(!summary.cancelled);
    assert!(sink.is_finished());
    assert_eq!(seen.lock().unwrap()[8], [6, 7, 8, 8, 8]);
    for (i, frame) in sink.frames().iter().enumerate() {
        assert_eq!(frame.dims(), (10, 10));
        assert_eq!(first_sample(frame), i as u16 * 257);
    }
}

#[tokio::test]
async fn streaming_inference_failure_is_reported() {
    let mut engine = ScriptedEngine::new(1);
    engine.fail_on_center = Some(6);
    let pipeline = Pipeline::new(config(4), Box::new(engine), Arc::new(RgbConverter)).unwrap();
    let sink = VecSink::new();
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let failure = pipeline
        .run_streaming(
            VecSource::new(clip(12, 4, 4)).unwrap(),
            sink.clone(),
            cancel_rx,
            None,
        )
        .await
        .unwrap_err();

    assert_eq!(failure.state, PipelineState::Inferring);
    assert_eq!(failure.frame_index, Some(6));
    // Every window inferred before the failure still reaches the sink.
    assert_eq!(sink.len(), 6);
    for (i, frame) in sink.frames().iter().enumerate() {
        assert_eq!(first_sample(frame), i as u16 * 257);
    }
    assert!(!sink.is_finished());
}

fn batched_config() -> PipelineConfig {
    PipelineConfig {
        stream_count: 2,
        buffer_size: 1,
        ..config(4)
    }
}

fn sequential_prefix(engine: ScriptedEngine, source: impl FrameSource) -> (PipelineFailure, VecSink) {
    let pipeline =
        Pipeline::new(batched_config(), Box::new(engine), Arc::new(RgbConverter)).unwrap();
    let sink = VecSink::new();
    let failure = pipeline
        .run(source, sink.clone(), &AtomicBool::new(false), None)
        .unwrap_err();
    (failure, sink)
}

async fn streaming_prefix(
    engine: ScriptedEngine,
    source: impl FrameSource + 'static,
) -> (PipelineFailure, VecSink) {
    let pipeline =
        Pipeline::new(batched_config(), Box::new(engine), Arc::new(RgbConverter)).unwrap();
    let sink = VecSink::new();
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let failure = pipeline
        .run_streaming(source, sink.clone(), cancel_rx, None)
        .await
        .unwrap_err();
    (failure, sink)
}

fn failing_engine(center: usize) -> ScriptedEngine {
    let mut engine = ScriptedEngine::new(1);
    engine.fail_on_center = Some(center);
    engine
}

fn broken_source(broken: usize) -> BrokenSource {
    BrokenSource {
        inner: VecSource::new(clip(10, 4, 4)).unwrap(),
        broken,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streaming_failures_emit_the_sequential_prefix() {
    for _ in 0..5 {
        // Window 5 fails inside the batch [4, 5].
        let (seq_failure, seq_sink) =
            sequential_prefix(failing_engine(5), VecSource::new(clip(10, 4, 4)).unwrap());
        let (str_failure, str_sink) =
            streaming_prefix(failing_engine(5), VecSource::new(clip(10, 4, 4)).unwrap()).await;
        assert_eq!(seq_sink.len(), 4);
        assert_eq!(str_sink.frames(), seq_sink.frames());
        assert_eq!(str_failure.state, seq_failure.state);
        assert_eq!(str_failure.frame_index, seq_failure.frame_index);

        // Window 5 is the first to need the broken frame 7.
        let (seq_failure, seq_sink) =
            sequential_prefix(ScriptedEngine::new(1), broken_source(7));
        let (str_failure, str_sink) =
            streaming_prefix(ScriptedEngine::new(1), broken_source(7)).await;
        assert_eq!(seq_sink.len(), 4);
        assert_eq!(str_sink.frames(), seq_sink.frames());
        assert_eq!(str_failure.state, PipelineState::Windowing);
        assert_eq!(str_failure.frame_index, seq_failure.frame_index);
        assert!(!str_sink.is_finished());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_after_last_frame_still_finishes_the_sink() {
    let pipeline = Pipeline::new(
        config(4),
        Box::new(ScriptedEngine::new(1)),
        Arc::new(RgbConverter),
    )
    .unwrap();
    let sink = VecSink::new();
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let summary = pipeline
        .run_streaming(
            VecSource::new(clip(3, 2, 2)).unwrap(),
            sink.clone(),
            cancel_rx,
            Some(Box::new(move |done, total| {
                if done == total {
                    let _ = cancel_tx.send(true);
                    // Let the cancel watcher observe it before the emit stage moves on.
                    std::thread::sleep(Duration::from_millis(50));
                }
            })),
        )
        .await
        .unwrap();

    assert_eq!(summary.frames_emitted, 3);
    assert!(!summary.cancelled);
    assert_eq!(summary.final_state, PipelineState::Done);
    assert!(sink.is_finished());
}

#[tokio::test]
async fn streaming_cancelled_before_start_emits_nothing() {
    let pipeline = Pipeline::new(
        config(4),
        Box::new(ScriptedEngine::new(1)),
        Arc::new(RgbConverter),
    )
    .unwrap();
    let sink = VecSink::new();
    let (_cancel_tx, cancel_rx) = watch::channel(true);

    let summary = pipeline
        .run_streaming(
            VecSource::new(clip(5, 2, 2)).unwrap(),
            sink.clone(),
            cancel_rx,
            None,
        )
        .await
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.final_state, PipelineState::Cancelled);
    assert_eq!(summary.frames_emitted, 0);
    assert!(sink.is_empty());
    assert!(!sink.is_finished());
}

/// Stalls on one frame long enough for a cancel request to land.
struct SlowSource {
    inner: VecSource,
    slow_index: usize,
}

impl FrameSource for SlowSource {
    fn info(&self) -> SourceInfo {
        self.inner.info()
    }

    fn frame(&mut self, index: usize) -> Result<Frame> {
        if index == self.slow_index {
            std::thread::sleep(Duration::from_millis(300));
        }
        self.inner.frame(index)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streaming_cancel_mid_run_skips_finish() {
    let pipeline = Pipeline::new(
        config(4),
        Box::new(ScriptedEngine::new(1)),
        Arc::new(RgbConverter),
    )
    .unwrap();
    let sink = VecSink::new();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let source = SlowSource {
        inner: VecSource::new(clip(20, 2, 2)).unwrap(),
        slow_index: 8,
    };

    let summary = pipeline
        .run_streaming(
            source,
            sink.clone(),
            cancel_rx,
            Some(Box::new(move |done, _| {
                if done == 2 {
                    let _ = cancel_tx.send(true);
                }
            })),
        )
        .await
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.final_state, PipelineState::Cancelled);
    assert!(summary.frames_emitted >= 2);
    assert!(summary.frames_emitted < 20);
    assert_eq!(sink.len() as u64, summary.frames_emitted);
    assert!(!sink.is_finished());
}
