//! Engine configuration types and loading.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the execution engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage backend configuration.
    pub storage: StorageConfig,

    /// Result-reuse cache defaults.
    pub cache: CacheConfig,

    /// Message fabric backend configuration.
    pub fabric: FabricConfig,

    /// Task manager concurrency and pacing.
    pub concurrency: ConcurrencyConfig,

    /// Duration-estimate multipliers.
    pub duration: DurationConfig,
}

impl Config {
    /// Load configuration with fallback chain: explicit path, then
    /// project-local `.taskengine.yml`, then `~/.config/taskengine/config.yml`,
    /// then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".taskengine.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("taskengine").join("config.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Reads only the `logging.level` field, if present, ahead of full
    /// config load so logging can be set up before anything else runs.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let path = config_path.cloned().or_else(|| {
            let local = PathBuf::from(".taskengine.yml");
            local.exists().then_some(local)
        })?;
        let content = fs::read_to_string(path).ok()?;
        let value: serde_yaml::Value = serde_yaml::from_str(&content).ok()?;
        value.get("logging")?.get("level")?.as_str().map(str::to_string)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Which `StateStore` backend to construct. `RemoteKv` stands up a
/// `FallbackStore` over an in-memory `KvClient` stand-in, since a real
/// network driver is out of this crate's scope; it still exercises the
/// connect-then-fall-back-to-local code path end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    LocalFile,
    RemoteKv,
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::LocalFile
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Directory for the local-file store's current/history trees.
    #[serde(rename = "data-dir")]
    pub data_dir: PathBuf,
    /// Directory checkpoints and pause/stop latches live under.
    #[serde(rename = "checkpoint-dir")]
    pub checkpoint_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::LocalFile,
            data_dir: PathBuf::from(".taskengine/data"),
            checkpoint_dir: PathBuf::from(".taskengine/checkpoints"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Seconds the worker waits before splicing in a cache hit, simulating
    /// the skipped computation's latency, lower bound.
    #[serde(rename = "sleep-min-seconds")]
    pub sleep_min_seconds: f64,
    /// Upper bound counterpart to `sleep_min_seconds`.
    #[serde(rename = "sleep-max-seconds")]
    pub sleep_max_seconds: f64,
    /// How often the secondary index is rebuilt from cold storage at boot.
    #[serde(rename = "rebuild-poll-interval-ms")]
    pub rebuild_poll_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sleep_min_seconds: 2.0,
            sleep_max_seconds: 10.0,
            rebuild_poll_interval_ms: 50,
        }
    }
}

impl CacheConfig {
    pub fn rebuild_poll_interval(&self) -> Duration {
        Duration::from_millis(self.rebuild_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FabricBackend {
    InMemory,
    Disabled,
}

impl Default for FabricBackend {
    fn default() -> Self {
        Self::InMemory
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    pub backend: FabricBackend,
    /// Master enable switch, independent of `backend`; publish becomes a
    /// no-op when `false` without changing which backend is constructed.
    pub enabled: bool,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self { backend: FabricBackend::InMemory, enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Maximum number of tasks the manager runs at once.
    #[serde(rename = "max-concurrent-tasks")]
    pub max_concurrent_tasks: usize,
    /// Cadence of pause/stop checks and of the reap-on-tick loop.
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,
    /// How long `shutdown` waits for in-flight workers to reap before
    /// force-aborting stragglers.
    #[serde(rename = "shutdown-timeout-secs")]
    pub shutdown_timeout_secs: u64,
    /// Checkpoints older than this, for tasks no longer registered, are
    /// swept by `ControlManager::gc_checkpoints`.
    #[serde(rename = "checkpoint-gc-age-secs")]
    pub checkpoint_gc_age_secs: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 16,
            poll_interval_ms: 250,
            shutdown_timeout_secs: 30,
            checkpoint_gc_age_secs: 86_400,
        }
    }
}

impl ConcurrencyConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn checkpoint_gc_age(&self) -> Duration {
        Duration::from_secs(self.checkpoint_gc_age_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DurationConfig {
    /// Name fed to `step_plan::provider_multiplier` when estimating total
    /// duration; has no bearing on which agents actually run.
    pub provider: String,
}

impl Default for DurationConfig {
    fn default() -> Self {
        Self { provider: "dashscope".to_string() }
    }
}
