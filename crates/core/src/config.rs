use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::convert::ConversionTarget;
use crate::engine::backend::InferenceBackend;
use crate::error::PipelineError;
use crate::padding::DEFAULT_BLOCK_SIZE;
use crate::types::{ColorRange, ColorSpec, TensorPrecision};
use crate::window::WindowOffsets;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "VSRPIPE_DATA_DIR";

pub const DEFAULT_STREAM_COUNT: usize = 1;
pub const DEFAULT_BUFFER_SIZE: usize = 4;
pub const DEFAULT_DELIVERY_BIT_DEPTH: u8 = 16;
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub pipeline: PipelineConfig,
    pub inference: InferenceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frames are padded up to multiples of this size before inference.
    pub block_size: u32,
    /// Relative frame offsets of each window, in engine slot order.
    pub window_offsets: WindowOffsets,
    /// Upscale factor; required when the model's output size is dynamic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    /// Windows submitted per inference call.
    pub stream_count: usize,
    /// Capacity of the channels between streaming stages.
    pub buffer_size: usize,
    pub warmup: bool,
    pub working: WorkingFormat,
    pub delivery: DeliveryFormat,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            window_offsets: WindowOffsets::default(),
            scale: None,
            stream_count: DEFAULT_STREAM_COUNT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            warmup: true,
            working: WorkingFormat::default(),
            delivery: DeliveryFormat::default(),
        }
    }
}

/// Tensor format the engine consumes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct WorkingFormat {
    pub precision: TensorPrecision,
    pub range: ColorRange,
}

/// Packed format handed to the sink.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeliveryFormat {
    pub bit_depth: u8,
    pub range: ColorRange,
}

impl Default for DeliveryFormat {
    fn default() -> Self {
        Self {
            bit_depth: DEFAULT_DELIVERY_BIT_DEPTH,
            range: ColorRange::Full,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.block_size == 0 {
            return Err(PipelineError::Config(
                "block_size must be positive".to_string(),
            ));
        }
        if self.stream_count == 0 {
            return Err(PipelineError::Config(
                "stream_count must be at least 1".to_string(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(PipelineError::Config(
                "buffer_size must be at least 1".to_string(),
            ));
        }
        if self.scale == Some(0) {
            return Err(PipelineError::Config("scale must be positive".to_string()));
        }
        if !(8..=16).contains(&self.delivery.bit_depth) {
            return Err(PipelineError::Config(format!(
                "delivery bit_depth {} is outside 8..=16",
                self.delivery.bit_depth
            )));
        }
        Ok(())
    }

    /// Working format for a stream; the matrix always follows the source.
    pub fn working_target(&self, source: ColorSpec) -> ConversionTarget {
        ConversionTarget::working(self.working.precision, source.with_range(self.working.range))
    }

    pub fn delivery_target(&self, source: ColorSpec) -> ConversionTarget {
        ConversionTarget::packed(
            self.delivery.bit_depth,
            source.with_range(self.delivery.range),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct InferenceConfig {
    pub backend: InferenceBackend,
    /// Model used when the CLI does not name one. Relative paths resolve
    /// against `paths.models_dir`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub retention_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))?;
        config
            .pipeline
            .validate()
            .with_context(|| format!("invalid pipeline settings in {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. VSRPIPE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates the data directory and writes a default config.toml unless one
/// already exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns `path` unchanged if absolute, otherwise joined onto `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
