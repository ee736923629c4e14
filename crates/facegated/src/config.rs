use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Optional TOML layer; every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    engine_workers: Option<usize>,
    request_timeout_secs: Option<u64>,
    system_bus: Option<bool>,
}

/// Daemon configuration: defaults, then the TOML file, then `FACEGATE_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing det_10g.onnx and w600k_r50.onnx.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Engine worker threads, each with its own ONNX sessions.
    pub engine_workers: usize,
    /// Upper bound on any single D-Bus operation.
    pub request_timeout_secs: u64,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Config {
    /// Load from `FACEGATE_CONFIG` (if set) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var_os("FACEGATE_CONFIG") {
            Some(path) => read_file(Path::new(&path))?,
            None => FileConfig::default(),
        };
        let config = Self::resolve(file, |key| std::env::var(key).ok());
        tracing::debug!(?config, "configuration loaded");
        Ok(config)
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = env("FACEGATE_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(facegate_core::default_model_dir);

        let db_path = env("FACEGATE_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| facegate_core::data_dir().join("facegate.db"));

        let engine_workers = parsed(&env, "FACEGATE_ENGINE_WORKERS")
            .or(file.engine_workers)
            .unwrap_or(2)
            .max(1);

        Self {
            model_dir,
            db_path,
            engine_workers,
            request_timeout_secs: parsed(&env, "FACEGATE_REQUEST_TIMEOUT_SECS")
                .or(file.request_timeout_secs)
                .unwrap_or(30),
            system_bus: env("FACEGATE_SYSTEM_BUS")
                .map(|v| v != "0")
                .or(file.system_bus)
                .unwrap_or(false),
        }
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}
