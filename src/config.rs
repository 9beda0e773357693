use crate::utils::error::ModelError;
use crate::Result;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address
    pub bind_addr: String,

    /// Directory that model paths are resolved against
    pub models_dir: PathBuf,

    /// Models to load at startup
    pub models: Vec<ModelSpec>,

    /// Worker thread count
    pub workers: usize,

    /// Development mode
    pub dev_mode: bool,

    pub onnx_config: OnnxConfig,

    pub server_config: ServerConfig,

    pub pipeline_config: PipelineConfig,
}

#[derive(Debug, Clone)]
pub struct OnnxConfig {
    /// CPU threads per session
    pub intra_threads: usize,

    /// Graph optimization level (0-3)
    pub optimization_level: i32,

    pub enable_optimization: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Request timeout in seconds
    pub request_timeout: u64,

    /// Maximum request body size in bytes
    pub max_request_size: usize,

    pub max_connections: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upper bound on requests in flight at once
    pub max_async_requests: usize,
}

/// A model to load: `ARCHITECTURE=path/to/model.onnx`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    /// Published wrapper name, e.g. `SSD` or `RetinaFacePyTorch`
    pub architecture: String,
    pub path: PathBuf,
}

impl ModelSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let (architecture, path) = spec.split_once('=').ok_or_else(|| {
            ModelError::Config(format!(
                "Invalid model spec '{}', expected ARCHITECTURE=PATH",
                spec
            ))
        })?;

        let architecture = architecture.trim();
        let path = path.trim();
        if architecture.is_empty() || path.is_empty() {
            return Err(ModelError::Config(format!(
                "Invalid model spec '{}', architecture and path must be non-empty",
                spec
            )));
        }

        Ok(Self {
            architecture: architecture.to_string(),
            path: PathBuf::from(path),
        })
    }

    /// JSON file with per-model parameters, looked up next to the model file.
    pub fn params_path(&self, models_dir: &Path) -> PathBuf {
        self.resolved_path(models_dir).with_extension("json")
    }

    pub fn resolved_path(&self, models_dir: &Path) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            models_dir.join(&self.path)
        }
    }
}

impl Config {
    pub fn new(
        bind_addr: String,
        models_dir: String,
        model_specs: &[String],
        workers: Option<usize>,
        max_async_requests: Option<usize>,
        dev_mode: bool,
    ) -> Result<Self> {
        let cpu_cores = num_cpus::get();
        let workers = workers.unwrap_or(cpu_cores);

        let models = model_specs
            .iter()
            .map(|spec| ModelSpec::parse(spec))
            .collect::<Result<Vec<_>>>()?;

        let onnx_config = OnnxConfig {
            intra_threads: (cpu_cores * 3 / 4).max(1),
            optimization_level: 3,
            enable_optimization: true,
        };

        let server_config = ServerConfig {
            request_timeout: if dev_mode { 300 } else { 60 },
            max_request_size: 50 * 1024 * 1024,
            max_connections: if dev_mode { 10 } else { 1000 },
        };

        let max_async_requests = max_async_requests.unwrap_or(workers).max(1);

        Ok(Self {
            bind_addr,
            models_dir: PathBuf::from(models_dir),
            models,
            workers,
            dev_mode,
            onnx_config,
            server_config,
            pipeline_config: PipelineConfig { max_async_requests },
        })
    }

    /// Absolute or models_dir-relative path of a model file.
    pub fn model_path(&self, spec: &ModelSpec) -> PathBuf {
        spec.resolved_path(&self.models_dir)
    }
}

impl Default for OnnxConfig {
    fn default() -> Self {
        Self {
            intra_threads: 1,
            optimization_level: 3,
            enable_optimization: true,
        }
    }
}
