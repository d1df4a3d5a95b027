//! Log filter selection, the rolling file sink and the crash-artifact panic hook.
//!
//! Subscriber assembly itself happens in the binary; this module only decides
//! which filters apply and where files go, so it stays testable.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    io::Write,
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::config::DEFAULT_LOG_RETENTION_FILES;

pub const DEFAULT_LOG_FILTER: &str = "info";
/// ONNX Runtime logs every graph optimization at info level.
pub const DEFAULT_NOISE_FILTER: &str = "ort=error";
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_CRASH_DIR_NAME: &str = "crash";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "vsrpipe";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

/// Targets whose level is relaxed to `warn` in the file sink, where the extra
/// lines help with provider fallback reports.
const FILE_RELAXED_TARGETS: [&str; 1] = ["ort"];

static PANIC_HOOK_INSTALL_LOCK: Mutex<()> = Mutex::new(());
static PANIC_HOOK_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static PANIC_HOOK_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static PANIC_ARTIFACT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        retention_files: usize,
        appender: RollingFileAppender,
    },
    Disabled {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn log_dir(&self) -> Option<&Path> {
        match self {
            Self::Ready { log_dir, .. } => Some(log_dir.as_path()),
            Self::Disabled {
                attempted_log_dir, ..
            } => attempted_log_dir.as_deref(),
        }
    }

    pub fn disabled_reason(&self) -> Option<&str> {
        match self {
            Self::Ready { .. } => None,
            Self::Disabled { reason, .. } => Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookInstallPlan {
    Installed {
        crash_dir: PathBuf,
    },
    AlreadyInstalled {
        crash_dir: PathBuf,
    },
    Skipped {
        attempted_crash_dir: Option<PathBuf>,
        reason: String,
    },
}

#[derive(Debug)]
struct CrashReport {
    timestamp: chrono::DateTime<chrono::Utc>,
    thread_name: String,
    location: String,
    payload: String,
    backtrace_policy: String,
    backtrace: String,
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

/// Picks the user filter by precedence: `--log-filter`, then `-v`/`-vv`,
/// then `RUST_LOG`, then the default. The noise filter is prepended only when
/// the user did not choose a filter explicitly on the command line.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = select_user_filter(options);
    let implicit = options.cli_log_filter.is_none() && options.verbose == 0;

    let console_filter = prepend_noise(&options.noise_filter, &user_filter, implicit);
    let file_filter = if implicit {
        let relaxed = relax_noise_for_file(&options.noise_filter);
        prepend_noise(&relaxed, &user_filter, true)
    } else {
        user_filter.clone()
    };

    LoggingFilterPlan {
        user_filter,
        console_filter,
        file_filter,
    }
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Disabled {
            attempted_log_dir: None,
            reason: "file logging disabled: no data directory".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Disabled {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };
    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSinkPlan::Ready {
            log_dir,
            retention_files,
            appender,
        },
        Err(error) => FileSinkPlan::Disabled {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to open rolling log file: {error}"),
        },
    }
}

/// Installs a process-wide hook that writes a crash report under
/// `<data_dir>/logs/crash` before delegating to the previous hook.
/// Installing twice keeps the first directory.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookInstallPlan {
    if let Some(crash_dir) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: crash_dir.clone(),
        };
    }

    let Some(data_dir) = data_dir else {
        return PanicHookInstallPlan::Skipped {
            attempted_crash_dir: None,
            reason: "crash reports disabled: no data directory".to_string(),
        };
    };

    let crash_dir = data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return PanicHookInstallPlan::Skipped {
            attempted_crash_dir: Some(crash_dir),
            reason: format!("failed to create crash directory: {error}"),
        };
    }

    let _guard = PANIC_HOOK_INSTALL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let previous = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_crash(&hook_dir, info);
        previous(info);
    }));

    let _ = PANIC_HOOK_CRASH_DIR.set(crash_dir.clone());
    PanicHookInstallPlan::Installed { crash_dir }
}

fn select_user_filter(options: &LoggingInitOptions) -> String {
    if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    }
}

fn prepend_noise(noise_filter: &str, user_filter: &str, include: bool) -> String {
    if include && !noise_filter.trim().is_empty() {
        format!("{noise_filter},{user_filter}")
    } else {
        user_filter.to_string()
    }
}

fn relax_noise_for_file(noise_filter: &str) -> String {
    noise_filter
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .map(|directive| match directive.split_once('=') {
            Some((target, _)) if FILE_RELAXED_TARGETS.contains(&target.trim()) => {
                format!("{}=warn", target.trim())
            }
            _ => directive.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn record_crash(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic inside the hook must not recurse into another report.
    if PANIC_HOOK_WRITE_IN_PROGRESS
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        write_crash_report(crash_dir, &CrashReport::capture(info))
    }));
    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write crash report under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook failed while writing a crash report under '{}'.",
            crash_dir.display()
        ),
    }

    PANIC_HOOK_WRITE_IN_PROGRESS.store(false, Ordering::Release);
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let backtrace = Backtrace::capture();
        let (backtrace_policy, backtrace) = match backtrace.status() {
            BacktraceStatus::Captured => ("captured".to_string(), backtrace.to_string()),
            BacktraceStatus::Disabled => (
                "disabled (set RUST_BACKTRACE=1 to enable)".to_string(),
                "<disabled>".to_string(),
            ),
            _ => ("unsupported".to_string(), "<unavailable>".to_string()),
        };

        Self {
            timestamp: chrono::Utc::now(),
            thread_name: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            payload: payload_text(info.payload()),
            backtrace_policy,
            backtrace,
        }
    }
}

fn write_crash_report(crash_dir: &Path, report: &CrashReport) -> std::io::Result<PathBuf> {
    fs::create_dir_all(crash_dir)?;

    let sequence = PANIC_ARTIFACT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let path = crash_dir.join(format!(
        "panic-{}-{sequence:06}.log",
        report.timestamp.format("%Y%m%d-%H%M%S-%f")
    ));

    let mut file = fs::File::create(&path)?;
    writeln!(file, "timestamp_utc={}", report.timestamp.to_rfc3339())?;
    writeln!(file, "thread={}", report.thread_name)?;
    writeln!(file, "location={}", report.location)?;
    writeln!(file, "payload={}", report.payload)?;
    writeln!(file, "backtrace_policy={}", report.backtrace_policy)?;
    writeln!(file, "backtrace:")?;
    writeln!(file, "{}", report.backtrace)?;
    file.flush()?;

    Ok(path)
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
