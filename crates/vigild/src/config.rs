use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration.
///
/// Layered as defaults → TOML file (`VIGIL_CONFIG`, else
/// `$XDG_CONFIG_HOME/vigil/vigil.toml` when present) → `VIGIL_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Persisted identity registry.
    pub registry_path: PathBuf,
    /// Fixed embedding dimension for the whole registry.
    pub embedding_dim: usize,
    /// Maximum Euclidean distance for a positive match.
    pub match_threshold: f64,
    /// Default polling interval for presence sessions.
    pub monitor_interval_secs: u64,
    /// Wait after a failed capture before retrying.
    pub monitor_backoff_secs: u64,
    /// Flagged frames and the audit log.
    pub evidence_dir: PathBuf,
    /// Keep accepted enrollment images here, if set.
    pub archive_dir: Option<PathBuf>,
    /// Embedding extractor helper and its leading arguments.
    pub extractor_program: PathBuf,
    pub extractor_args: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    camera_width: Option<u32>,
    camera_height: Option<u32>,
    registry_path: Option<PathBuf>,
    embedding_dim: Option<usize>,
    match_threshold: Option<f64>,
    monitor_interval_secs: Option<u64>,
    monitor_backoff_secs: Option<u64>,
    evidence_dir: Option<PathBuf>,
    archive_dir: Option<PathBuf>,
    extractor_program: Option<PathBuf>,
    extractor_args: Option<Vec<String>>,
}

impl Config {
    /// Load from the process environment and the config file it points at.
    pub fn load() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();
        let file = match env("VIGIL_CONFIG") {
            Some(path) => Some(PathBuf::from(path)),
            None => Some(config_home(&env).join("vigil/vigil.toml")).filter(|p| p.exists()),
        };
        Self::from_sources(file.as_deref(), env)
    }

    /// Build from an optional TOML file and an environment lookup.
    pub fn from_sources(
        file: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::defaults(&data_home(&env).join("vigil"));

        if let Some(path) = file {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let parsed: FileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            config.apply_file(parsed);
            tracing::debug!(path = %path.display(), "config file applied");
        }

        config.apply_env(&env);
        config.validate()?;
        Ok(config)
    }

    fn defaults(data_dir: &Path) -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            registry_path: data_dir.join("registry.json"),
            embedding_dim: vigil_core::DEFAULT_EMBEDDING_DIM,
            match_threshold: vigil_core::DEFAULT_MATCH_THRESHOLD,
            monitor_interval_secs: 60,
            monitor_backoff_secs: 5,
            evidence_dir: data_dir.join("flagged_photos"),
            archive_dir: None,
            extractor_program: PathBuf::from("vigil-extract"),
            extractor_args: Vec::new(),
        }
    }

    fn apply_file(&mut self, file: FileConfig) {
        let FileConfig {
            camera_device,
            camera_width,
            camera_height,
            registry_path,
            embedding_dim,
            match_threshold,
            monitor_interval_secs,
            monitor_backoff_secs,
            evidence_dir,
            archive_dir,
            extractor_program,
            extractor_args,
        } = file;

        overlay(&mut self.camera_device, camera_device);
        overlay(&mut self.camera_width, camera_width);
        overlay(&mut self.camera_height, camera_height);
        overlay(&mut self.registry_path, registry_path);
        overlay(&mut self.embedding_dim, embedding_dim);
        overlay(&mut self.match_threshold, match_threshold);
        overlay(&mut self.monitor_interval_secs, monitor_interval_secs);
        overlay(&mut self.monitor_backoff_secs, monitor_backoff_secs);
        overlay(&mut self.evidence_dir, evidence_dir);
        overlay(&mut self.extractor_program, extractor_program);
        overlay(&mut self.extractor_args, extractor_args);
        if archive_dir.is_some() {
            self.archive_dir = archive_dir;
        }
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) {
        overlay(&mut self.camera_device, env("VIGIL_CAMERA_DEVICE"));
        overlay(&mut self.camera_width, parse_var(env, "VIGIL_CAMERA_WIDTH"));
        overlay(&mut self.camera_height, parse_var(env, "VIGIL_CAMERA_HEIGHT"));
        overlay(&mut self.registry_path, env("VIGIL_REGISTRY_PATH").map(PathBuf::from));
        overlay(&mut self.embedding_dim, parse_var(env, "VIGIL_EMBEDDING_DIM"));
        overlay(&mut self.match_threshold, parse_var(env, "VIGIL_MATCH_THRESHOLD"));
        overlay(&mut self.monitor_interval_secs, parse_var(env, "VIGIL_MONITOR_INTERVAL_SECS"));
        overlay(&mut self.monitor_backoff_secs, parse_var(env, "VIGIL_MONITOR_BACKOFF_SECS"));
        overlay(&mut self.evidence_dir, env("VIGIL_EVIDENCE_DIR").map(PathBuf::from));
        overlay(&mut self.extractor_program, env("VIGIL_EXTRACTOR").map(PathBuf::from));
        overlay(
            &mut self.extractor_args,
            env("VIGIL_EXTRACTOR_ARGS").map(|v| v.split_whitespace().map(String::from).collect()),
        );
        if let Some(dir) = env("VIGIL_ARCHIVE_DIR") {
            self.archive_dir = (!dir.is_empty()).then(|| PathBuf::from(dir));
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding_dim == 0 {
            return Err(ConfigError::Invalid("embedding_dim must be > 0".into()));
        }
        if !self.match_threshold.is_finite() || self.match_threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be a non-negative number, got {}",
                self.match_threshold
            )));
        }
        Ok(())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn monitor_backoff(&self) -> Duration {
        Duration::from_secs(self.monitor_backoff_secs)
    }

    pub fn camera_settings(&self) -> vigil_hw::CameraSettings {
        vigil_hw::CameraSettings {
            device_path: self.camera_device.clone(),
            width: self.camera_width,
            height: self.camera_height,
        }
    }
}

fn overlay<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

/// Unparseable values are ignored with a warning, keeping the lower layer.
fn parse_var<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment variable");
            None
        }
    }
}

fn data_home(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home(env).join(".local/share"))
}

fn config_home(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home(env).join(".config"))
}

fn home(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    PathBuf::from(env("HOME").unwrap_or_else(|| "/tmp".to_string()))
}
