use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use vsrpipe_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig, PipelineConfig,
};
use vsrpipe_core::convert::RgbConverter;
use vsrpipe_core::engine::backend::{
    model_hash, resolve_trt_cache_dir, trt_cache_key, InferenceBackend, SessionConfig,
};
use vsrpipe_core::engine::onnx::OnnxEngine;
use vsrpipe_core::engine::InferenceEngine;
use vsrpipe_core::io::{FrameSource, RawVideoSink, RawVideoSource, SourceInfo};
use vsrpipe_core::logging::{self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan};
use vsrpipe_core::padding::PaddingSpec;
use vsrpipe_core::pipeline::{Pipeline, ProgressCallback, RunPlan, RunSummary};
use vsrpipe_core::runtime;
use vsrpipe_core::types::{ColorSpec, PixelFormat};
use vsrpipe_core::window::WindowOffsets;

#[derive(Parser)]
#[command(name = "vsrpipe", about = "Multi-frame video super-resolution pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upscale a raw RGB video file.
    Run(RunArgs),
    /// Print padding, output size and window indices without running a model.
    Plan(PlanArgs),
    /// Print the engine contract a model declares.
    Inspect(InspectArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, help = "ONNX model (defaults to inference.model_path in config.toml)")]
    model: Option<PathBuf>,
    #[arg(short = 'i', long, help = "Headerless packed RGB input")]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Headerless packed RGB output")]
    output: PathBuf,
    #[arg(long)]
    width: u32,
    #[arg(long)]
    height: u32,
    #[arg(long, default_value_t = 8, help = "Input bits per sample")]
    bit_depth: u8,
    #[arg(long, help = "Output bits per sample (8..=16)")]
    depth: Option<u8>,
    #[arg(long)]
    block_size: Option<u32>,
    #[arg(long, help = "Expected upscale factor; checked against the model")]
    scale: Option<u32>,
    #[arg(long, help = "Windows submitted per engine call")]
    streams: Option<usize>,
    #[arg(long, value_parser = parse_backend)]
    backend: Option<InferenceBackend>,
    #[arg(long)]
    no_warmup: bool,
    #[arg(long, help = "Run all stages on one thread")]
    sequential: bool,
}

#[derive(Args)]
struct PlanArgs {
    #[arg(long)]
    width: u32,
    #[arg(long)]
    height: u32,
    #[arg(long, default_value_t = 1)]
    frames: usize,
    #[arg(long)]
    block_size: Option<u32>,
    #[arg(long, default_value_t = 1)]
    scale: u32,
}

#[derive(Args)]
struct InspectArgs {
    #[arg(long)]
    model: PathBuf,
    #[arg(long, value_parser = parse_backend)]
    backend: Option<InferenceBackend>,
    #[arg(long)]
    scale: Option<u32>,
}

fn parse_backend(value: &str) -> Result<InferenceBackend, String> {
    value.parse().map_err(|e: anyhow::Error| e.to_string())
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let lib_report = runtime::setup_runtime_libs();
    if let Err(e) = initialize_data_dir(&resolved_data_dir) {
        eprintln!("Warning: failed to initialize data directory: {e:#}");
    }
    let config = load_config(&resolved_data_dir);

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
        config.logging.retention_files,
    );
    runtime::log_runtime_lib_status(&lib_report);
    log_startup_metadata(&resolved_data_dir);

    match cli.command {
        Commands::Run(args) => run_video(args, config, &resolved_data_dir).await,
        Commands::Plan(args) => print_plan(args, &config.pipeline),
        Commands::Inspect(args) => inspect_model(args, &config),
    }
}

fn load_config(data_dir: &Path) -> AppConfig {
    let cfg_path = config_path(data_dir);
    match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Warning: failed to load config file, using defaults: {err:#}");
            AppConfig::default()
        }
    }
}

fn init_logging(
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
    retention_files: usize,
) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);

    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        retention_files,
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = parse_env_filter_with_fallback(&init_plan.filters.console_filter, "console");

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let (installed, disabled) = match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let file_filter = parse_env_filter_with_fallback(&init_plan.filters.file_filter, "file");
            let subscriber = tracing_subscriber::registry().with(console_layer).with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender)
                    .with_filter(file_filter),
            );
            (tracing::subscriber::set_global_default(subscriber), None)
        }
        FileSinkPlan::Disabled {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            (
                tracing::subscriber::set_global_default(subscriber),
                Some((attempted_log_dir, reason)),
            )
        }
    };

    if let Err(error) = installed {
        eprintln!("Failed to initialize tracing subscriber: {error}. Continuing without structured tracing.");
        return;
    }
    if let Some((attempted_log_dir, reason)) = disabled {
        warn!(
            attempted_log_dir = ?attempted_log_dir,
            reason = %reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
    if let PanicHookInstallPlan::Skipped {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Crash report hook unavailable; panics will not be persisted"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{}'.",
            logging::DEFAULT_LOG_FILTER
        );
        tracing_subscriber::EnvFilter::new(logging::DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

/// Folds command-line overrides into the pipeline section of the config.
fn apply_run_overrides(pipeline: &mut PipelineConfig, args: &RunArgs) -> Result<()> {
    if let Some(block_size) = args.block_size {
        pipeline.block_size = block_size;
    }
    if let Some(depth) = args.depth {
        pipeline.delivery.bit_depth = depth;
    }
    if let Some(scale) = args.scale {
        pipeline.scale = Some(scale);
    }
    if let Some(streams) = args.streams {
        pipeline.stream_count = streams;
    }
    if args.no_warmup {
        pipeline.warmup = false;
    }
    pipeline.validate().context("invalid pipeline settings")?;
    Ok(())
}

fn resolve_model_path(
    cli_model: Option<&Path>,
    config: &AppConfig,
    data_dir: &Path,
) -> Result<PathBuf> {
    let models_dir = resolve_relative_to(data_dir, &config.paths.models_dir);
    let model = match (cli_model, config.inference.model_path.as_deref()) {
        (Some(path), _) => path.to_path_buf(),
        (None, Some(path)) => resolve_relative_to(&models_dir, path),
        (None, None) => bail!("no model given; pass --model or set inference.model_path"),
    };
    if !model.is_file() {
        bail!("model file does not exist: {}", model.display());
    }
    Ok(model)
}

async fn run_video(args: RunArgs, mut config: AppConfig, data_dir: &Path) -> Result<()> {
    apply_run_overrides(&mut config.pipeline, &args)?;
    let backend = args.backend.unwrap_or(config.inference.backend);
    let model_path = resolve_model_path(args.model.as_deref(), &config, data_dir)?;

    let source = RawVideoSource::open(
        &args.input,
        args.width,
        args.height,
        args.bit_depth,
        ColorSpec::default(),
    )?;
    let info = source.info();
    let padded = PaddingSpec::compute(info.width, info.height, config.pipeline.block_size)?
        .padded_dims(info.width, info.height);

    let trt_cache_dir = if backend == InferenceBackend::Tensorrt {
        let hash = model_hash(&model_path)?;
        let base = resolve_relative_to(data_dir, &config.paths.trt_cache_dir);
        let key = trt_cache_key(&hash, padded.1 as usize, padded.0 as usize);
        Some(resolve_trt_cache_dir(&base, Some(&key)))
    } else {
        None
    };

    let load_started = Instant::now();
    let engine = OnnxEngine::load(
        &SessionConfig {
            model_path: &model_path,
            backend,
            trt_cache_dir: trt_cache_dir.as_deref(),
        },
        config.pipeline.scale,
    )?;
    config.pipeline.working.precision = engine.contract().precision;
    info!(
        model = %model_path.display(),
        %backend,
        scale = engine.contract().scale,
        precision = ?engine.contract().precision,
        load_ms = load_started.elapsed().as_millis() as u64,
        "Model loaded"
    );

    let pipeline = Pipeline::new(
        config.pipeline.clone(),
        Box::new(engine),
        Arc::new(RgbConverter),
    )?;
    let plan = pipeline.plan(&info)?;
    info!(
        input = %args.input.display(),
        output = %args.output.display(),
        frames = plan.frame_count,
        width = plan.output_dims.0,
        height = plan.output_dims.1,
        "Starting upscale"
    );
    let sink = RawVideoSink::create(&args.output)?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let cancel_flag = Arc::new(AtomicBool::new(false));
    let ctrl_c = tokio::spawn({
        let cancel_flag = cancel_flag.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!();
                warn!("Interrupt received, stopping after the current frame");
                cancel_flag.store(true, Ordering::SeqCst);
                let _ = cancel_tx.send(true);
            }
        }
    });

    let progress = make_progress_callback();
    let outcome = if args.sequential {
        tokio::task::spawn_blocking(move || pipeline.run(source, sink, &cancel_flag, Some(progress)))
            .await
            .context("pipeline task panicked")?
    } else {
        pipeline
            .run_streaming(source, sink, cancel_rx, Some(progress))
            .await
    };
    ctrl_c.abort();
    eprintln!();

    let summary = outcome?;
    log_summary(&summary);
    if summary.cancelled {
        bail!(
            "interrupted after {} of {} frames; {} is incomplete",
            summary.frames_emitted,
            summary.total_frames,
            args.output.display()
        );
    }
    Ok(())
}

fn log_summary(summary: &RunSummary) {
    let secs = summary.elapsed.as_secs_f64();
    let fps = if secs > 0.0 {
        summary.frames_emitted as f64 / secs
    } else {
        0.0
    };
    info!(
        frames = summary.frames_emitted,
        total = summary.total_frames,
        elapsed = %format_duration(secs),
        fps = format!("{fps:.2}"),
        output = ?summary.plan.output_dims,
        cancelled = summary.cancelled,
        state = %summary.final_state,
        "Run summary"
    );
}

fn plan_report(plan: &RunPlan) -> Result<serde_json::Value> {
    let last = plan.frame_count.saturating_sub(1);
    let mut windows = Vec::new();
    let head = plan.window_offsets.span().min(plan.frame_count);
    for center in (0..head).chain(last.saturating_sub(head - 1).max(head)..=last) {
        windows.push(json!({ "center": center, "indices": plan.window_indices(center)? }));
    }
    Ok(json!({ "plan": plan, "windows": windows }))
}

fn print_plan(args: PlanArgs, pipeline: &PipelineConfig) -> Result<()> {
    let mut config = pipeline.clone();
    if let Some(block_size) = args.block_size {
        config.block_size = block_size;
    }
    config.validate()?;

    let info = SourceInfo {
        width: args.width,
        height: args.height,
        format: PixelFormat::PackedRgb,
        bit_depth: 8,
        color: ColorSpec::default(),
        frame_count: args.frames,
    };
    let plan = RunPlan::compute(&info, &config, args.scale)?;
    println!("{}", serde_json::to_string_pretty(&plan_report(&plan)?)?);
    Ok(())
}

fn inspect_model(args: InspectArgs, config: &AppConfig) -> Result<()> {
    let engine = OnnxEngine::load(
        &SessionConfig {
            model_path: &args.model,
            backend: args.backend.unwrap_or(InferenceBackend::Cpu),
            trt_cache_dir: None,
        },
        args.scale.or(config.pipeline.scale),
    )?;
    let contract = engine.contract();
    let configured = config.pipeline.window_offsets.len();
    println!("{}", serde_json::to_string_pretty(contract)?);
    if contract.slots != configured {
        warn!(
            slots = contract.slots,
            configured,
            default = ?WindowOffsets::default().as_slice(),
            "Model window size differs from the configured window offsets"
        );
    }
    Ok(())
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;
/// Frames excluded from fps so warmup and engine builds do not skew the ETA.
const FPS_WARMUP_FRAMES: u64 = 2;

fn compute_fps(done: u64, elapsed: f64) -> f64 {
    if elapsed <= 0.0 || done <= FPS_WARMUP_FRAMES {
        return 0.0;
    }
    (done - FPS_WARMUP_FRAMES) as f64 / elapsed
}

fn progress_line(done: u64, total: u64, total_elapsed: f64, fps_elapsed: f64) -> String {
    let fps = compute_fps(done, fps_elapsed);
    let fraction = if total > 0 {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let bar = "█".repeat(filled) + &"░".repeat(PROGRESS_BAR_WIDTH.saturating_sub(filled));
    let eta = if fps > 0.0 {
        format!(
            " | ETA: {}",
            format_duration(total.saturating_sub(done) as f64 / fps)
        )
    } else {
        String::new()
    };
    format!(
        "[{bar}] {:5.1}% | Frame {done}/{total} | {fps:.1} fps | Elapsed: {}{eta}",
        fraction * 100.0,
        format_duration(total_elapsed),
    )
}

fn make_progress_callback() -> ProgressCallback {
    let start = Instant::now();
    let fps_start = Mutex::new(None::<Instant>);
    Box::new(move |done, total| {
        let fps_elapsed = {
            let mut fps_start = fps_start.lock().unwrap_or_else(|p| p.into_inner());
            if fps_start.is_none() && done > FPS_WARMUP_FRAMES {
                *fps_start = Some(Instant::now());
            }
            fps_start.map(|s| s.elapsed().as_secs_f64()).unwrap_or(0.0)
        };
        eprint!(
            "\r{}    ",
            progress_line(done, total, start.elapsed().as_secs_f64(), fps_elapsed)
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut argv = vec![
            "vsrpipe", "run", "-i", "in.rgb", "-o", "out.rgb", "--width", "64", "--height", "32",
        ];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Run(args) => args,
            _ => panic!("expected run subcommand"),
        }
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "vsrpipe", "plan", "--width", "10", "--height", "10", "-vv", "--data-dir", "/tmp/x",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/x")));
    }

    #[test]
    fn backend_flag_accepts_aliases() {
        assert_eq!(run_args(&["--backend", "trt"]).backend, Some(InferenceBackend::Tensorrt));
        assert!(Cli::try_parse_from([
            "vsrpipe", "inspect", "--model", "m.onnx", "--backend", "vulkan"
        ])
        .is_err());
    }

    #[test]
    fn run_overrides_replace_config_values() {
        let mut pipeline = PipelineConfig::default();
        let args = run_args(&["--depth", "8", "--streams", "2", "--scale", "4", "--no-warmup"]);

        apply_run_overrides(&mut pipeline, &args).unwrap();
        assert_eq!(pipeline.delivery.bit_depth, 8);
        assert_eq!(pipeline.stream_count, 2);
        assert_eq!(pipeline.scale, Some(4));
        assert!(!pipeline.warmup);
    }

    #[test]
    fn invalid_override_is_rejected() {
        let mut pipeline = PipelineConfig::default();
        let args = run_args(&["--depth", "4"]);
        assert!(apply_run_overrides(&mut pipeline, &args).is_err());
    }

    #[test]
    fn plan_report_lists_edge_windows() {
        let info = SourceInfo {
            width: 1000,
            height: 500,
            format: PixelFormat::PackedRgb,
            bit_depth: 8,
            color: ColorSpec::default(),
            frame_count: 20,
        };
        let plan = RunPlan::compute(&info, &PipelineConfig::default(), 4).unwrap();
        let report = plan_report(&plan).unwrap();

        let windows = report["windows"].as_array().unwrap();
        assert_eq!(windows.len(), 10);
        assert_eq!(windows[0]["indices"], json!([0, 0, 0, 1, 2]));
        assert_eq!(windows[9]["center"], 19);
        assert_eq!(windows[9]["indices"], json!([17, 18, 19, 19, 19]));
        assert_eq!(report["plan"]["padding"]["right"], 24);
    }

    #[test]
    fn plan_report_for_single_frame_has_one_window() {
        let info = SourceInfo {
            width: 8,
            height: 8,
            format: PixelFormat::PackedRgb,
            bit_depth: 8,
            color: ColorSpec::default(),
            frame_count: 1,
        };
        let plan = RunPlan::compute(&info, &PipelineConfig::default(), 2).unwrap();
        let windows = plan_report(&plan).unwrap()["windows"].clone();
        assert_eq!(windows, json!([{ "center": 0, "indices": [0, 0, 0, 0, 0] }]));
    }

    #[test]
    fn model_path_falls_back_to_models_dir() {
        let data = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.paths.models_dir = PathBuf::from("models");
        config.inference.model_path = Some(PathBuf::from("vsr.onnx"));

        assert!(resolve_model_path(None, &config, data.path()).is_err());
        std::fs::create_dir_all(data.path().join("models")).unwrap();
        std::fs::write(data.path().join("models/vsr.onnx"), b"").unwrap();
        assert_eq!(
            resolve_model_path(None, &config, data.path()).unwrap(),
            data.path().join("models/vsr.onnx")
        );

        config.inference.model_path = None;
        assert!(resolve_model_path(None, &config, data.path()).is_err());
    }

    #[test]
    fn duration_and_fps_formatting() {
        assert_eq!(format_duration(0.0), "00:00:00");
        assert_eq!(format_duration(3725.4), "01:02:05");
        assert_eq!(compute_fps(2, 10.0), 0.0);
        assert_eq!(compute_fps(12, 5.0), 2.0);
    }

    #[test]
    fn progress_line_shows_eta_once_fps_is_known() {
        let warming = progress_line(1, 10, 1.0, 0.0);
        assert!(warming.contains("Frame 1/10"));
        assert!(!warming.contains("ETA"));

        let running = progress_line(6, 10, 3.0, 2.0);
        assert!(running.contains(" 60.0%"), "{running}");
        assert!(running.contains("2.0 fps"), "{running}");
        assert!(running.contains("ETA: 00:00:02"), "{running}");
    }
}
