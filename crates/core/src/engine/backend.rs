//! Execution provider selection and `ort::Session` construction.
//!
//! TensorRT sessions register CUDA as a fallback provider and keep their
//! compiled engines in a per-model cache directory keyed by
//! [`trt_cache_key`].

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

const TRT_HEARTBEAT: Duration = Duration::from_secs(15);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cuda,
    #[serde(alias = "trt")]
    Tensorrt,
    Cpu,
}

impl FromStr for InferenceBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "cuda" => Ok(Self::Cuda),
            "tensorrt" | "trt" => Ok(Self::Tensorrt),
            "cpu" => Ok(Self::Cpu),
            other => bail!("unknown inference backend '{other}' (expected cuda, tensorrt or cpu)"),
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct CacheStats {
    file_count: u64,
    total_bytes: u64,
}

fn cache_stats(root: &Path) -> CacheStats {
    let mut stats = CacheStats::default();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                stats.file_count += 1;
                stats.total_bytes += meta.len();
            }
        }
    }

    stats
}

/// Builds a session for `config.backend`.
///
/// TensorRT engine builds can take minutes on first use, so a background
/// thread logs a heartbeat until the session is committed.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let load_context = || format!("Failed to load ONNX model: {}", config.model_path.display());

    match config.backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));
            if let Err(e) = fs::create_dir_all(cache_dir) {
                warn!(dir = %cache_dir.display(), error = %e, "Failed to create TRT cache directory");
            }

            let before = cache_stats(cache_dir);
            let started = Instant::now();
            info!(
                cache_dir = %cache_dir.display(),
                cache_files = before.file_count,
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let (stop_tx, stop_rx) = channel::<()>();
            let heartbeat = thread::spawn(move || {
                let started = Instant::now();
                while let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(TRT_HEARTBEAT) {
                    info!(
                        elapsed_secs = started.elapsed().as_secs(),
                        "TensorRT session initialization still in progress"
                    );
                }
            });

            let cache_path = cache_dir.to_string_lossy().to_string();
            let result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(config.model_path)
                .with_context(load_context);

            let _ = stop_tx.send(());
            let _ = heartbeat.join();

            let after = cache_stats(cache_dir);
            let elapsed_secs = started.elapsed().as_secs_f64();
            match &result {
                Ok(_) if after != before => info!(
                    elapsed_secs,
                    cache_files = after.file_count,
                    cache_bytes = after.total_bytes,
                    "TensorRT session ready; engine cache updated"
                ),
                Ok(_) => info!(elapsed_secs, "TensorRT session ready; using existing cache"),
                Err(e) => error!(elapsed_secs, error = %e, "TensorRT session initialization failed"),
            }
            result
        }
        InferenceBackend::Cuda => {
            if !CUDAExecutionProvider::default()
                .is_available()
                .unwrap_or(false)
            {
                warn!("CUDA EP is not available; inference will fall back to CPU");
            }
            debug!(backend = "cuda", "Building session with CUDA EP");

            builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .build()
                    .error_on_failure()])?
                .commit_from_file(config.model_path)
                .with_context(load_context)
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session on the default CPU provider");
            builder
                .commit_from_file(config.model_path)
                .with_context(load_context)
        }
    }
}

/// Hex SHA-256 of the model file, used to key engine caches.
pub fn model_hash(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_all(&buf[..n])?;
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Format: `{model_hash[..16]}_{input_h}x{input_w}`
pub fn trt_cache_key(model_hash: &str, input_h: usize, input_w: usize) -> String {
    let short = &model_hash[..model_hash.len().min(16)];
    format!("{short}_{input_h}x{input_w}")
}

pub fn resolve_trt_cache_dir(base_dir: &Path, cache_key: Option<&str>) -> PathBuf {
    match cache_key {
        Some(key) => base_dir.join(key),
        None => base_dir.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_parses_known_names() {
        assert_eq!("CUDA".parse::<InferenceBackend>().unwrap(), InferenceBackend::Cuda);
        assert_eq!("trt".parse::<InferenceBackend>().unwrap(), InferenceBackend::Tensorrt);
        assert_eq!("TensorRT".parse::<InferenceBackend>().unwrap(), InferenceBackend::Tensorrt);
        assert_eq!("cpu".parse::<InferenceBackend>().unwrap(), InferenceBackend::Cpu);
        assert!("vulkan".parse::<InferenceBackend>().is_err());
    }

    #[test]
    fn backend_display_round_trips() {
        for backend in [InferenceBackend::Cuda, InferenceBackend::Tensorrt, InferenceBackend::Cpu] {
            assert_eq!(backend.to_string().parse::<InferenceBackend>().unwrap(), backend);
        }
    }

    #[test]
    fn trt_cache_key_truncates_hash() {
        let hash = "0123456789abcdef0123456789abcdef";
        assert_eq!(trt_cache_key(hash, 544, 960), "0123456789abcdef_544x960");
        assert_eq!(trt_cache_key("abc", 64, 64), "abc_64x64");
    }

    #[test]
    fn resolve_trt_cache_dir_joins_key() {
        let base = PathBuf::from("trt_cache");
        assert_eq!(
            resolve_trt_cache_dir(&base, Some("abc_64x64")),
            PathBuf::from("trt_cache/abc_64x64")
        );
        assert_eq!(resolve_trt_cache_dir(&base, None), base);
    }

    #[test]
    fn model_hash_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        fs::write(&path, b"abc").unwrap();

        assert_eq!(
            model_hash(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn cache_stats_counts_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("engines")).unwrap();
        fs::write(dir.path().join("engines/a.engine"), [0u8; 10]).unwrap();
        fs::write(dir.path().join("b.profile"), [0u8; 5]).unwrap();

        let stats = cache_stats(dir.path());
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.total_bytes, 15);
        assert_eq!(cache_stats(&dir.path().join("missing")), CacheStats::default());
    }
}
