//! Engine configuration
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high → low):
//! 1. CLI arguments
//! 2. Environment variables (TASKFRAME_WORKERS, TASKFRAME_QUEUE_CAPACITY, TASKFRAME_LOG)
//! 3. Project-level (taskframe.toml)
//! 4. Default values
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::path::Path;
//! use taskframe::util::config::load_config;
//!
//! let config = load_config(Path::new("taskframe.toml")).unwrap();
//! let pool = config.pool_config();
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::pool::PoolConfig;
use crate::runtime::simulation::{Bounds, SimulationConfig, MIN_STRIDE};
use crate::util::logger::LogLevel;

/// Project-level config file name.
pub const CONFIG_FILE_NAME: &str = "taskframe.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EngineConfig {
    /// Worker pool settings
    #[serde(default)]
    pub pool: PoolSection,
    /// Simulation settings
    #[serde(default)]
    pub simulation: SimulationSection,
    /// Logging settings
    #[serde(default)]
    pub log: LogSection,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolSection {
    /// Number of workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bounded queue capacity; absent means unbounded
    #[serde(default)]
    pub queue_capacity: Option<usize>,
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: None,
        }
    }
}

/// Simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationSection {
    #[serde(default = "default_entities")]
    pub entities: usize,
    #[serde(default = "default_extent")]
    pub width: f32,
    #[serde(default = "default_extent")]
    pub height: f32,
    /// Floats per entity record
    #[serde(default = "default_stride")]
    pub stride: usize,
    /// Fixed seed for reproducible initial state
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_max_speed")]
    pub max_speed: f32,
    /// Producer tick in milliseconds
    #[serde(default = "default_interval_ms")]
    pub tick_ms: u64,
    /// Consumer cadence in milliseconds
    #[serde(default = "default_interval_ms")]
    pub frame_ms: u64,
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: usize,
}

fn default_entities() -> usize {
    100
}

fn default_extent() -> f32 {
    100.0
}

fn default_stride() -> usize {
    MIN_STRIDE
}

fn default_max_speed() -> f32 {
    1.0
}

fn default_interval_ms() -> u64 {
    16
}

fn default_parallel_threshold() -> usize {
    10_000
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            entities: default_entities(),
            width: default_extent(),
            height: default_extent(),
            stride: default_stride(),
            seed: None,
            max_speed: default_max_speed(),
            tick_ms: default_interval_ms(),
            frame_ms: default_interval_ms(),
            parallel_threshold: default_parallel_threshold(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct LogSection {
    #[serde(default)]
    pub level: LogLevel,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid value `{value}` for {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl EngineConfig {
    /// Apply `TASKFRAME_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary lookup.
    pub fn apply_env_from<F>(
        &mut self,
        lookup: F,
    ) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        const WORKERS: &str = "TASKFRAME_WORKERS";
        const QUEUE: &str = "TASKFRAME_QUEUE_CAPACITY";
        const LOG: &str = "TASKFRAME_LOG";

        if let Some(value) = lookup(WORKERS) {
            self.pool.workers = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: WORKERS,
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(QUEUE) {
            let value = value.trim().to_string();
            self.pool.queue_capacity = if value.is_empty() || value == "unbounded" {
                None
            } else {
                Some(value.parse().map_err(|_| ConfigError::InvalidEnv {
                    var: QUEUE,
                    value: value.clone(),
                })?)
            };
        }
        if let Some(value) = lookup(LOG) {
            self.log.level = value
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { var: LOG, value })?;
        }
        Ok(())
    }

    /// Reject values the runtime cannot use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.workers == 0 {
            return Err(ConfigError::Invalid("pool.workers must be at least 1".into()));
        }
        if self.pool.queue_capacity == Some(0) {
            return Err(ConfigError::Invalid(
                "pool.queue_capacity must be at least 1".into(),
            ));
        }
        self.simulation_config()
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))
    }

    /// Pool settings in runtime form.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            size: self.pool.workers,
            queue_capacity: self.pool.queue_capacity,
        }
    }

    /// Simulation settings in runtime form.
    pub fn simulation_config(&self) -> SimulationConfig {
        let sim = &self.simulation;
        SimulationConfig {
            entity_count: sim.entities,
            bounds: Bounds::new(sim.width, sim.height),
            stride: sim.stride,
            seed: sim.seed,
            max_speed: sim.max_speed,
            tick_interval: Duration::from_millis(sim.tick_ms),
            frame_interval: Duration::from_millis(sim.frame_ms),
            parallel_threshold: sim.parallel_threshold,
        }
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: EngineConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Load `taskframe.toml` from `dir` if present, defaults otherwise
pub fn discover_config(dir: &Path) -> Result<EngineConfig, ConfigError> {
    let path = dir.join(CONFIG_FILE_NAME);
    if path.exists() {
        load_config(&path)
    } else {
        Ok(EngineConfig::default())
    }
}

/// Save configuration as TOML
pub fn save_config(
    config: &EngineConfig,
    path: &Path,
) -> Result<(), ConfigError> {
    let content = config.to_toml()?;
    fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}
