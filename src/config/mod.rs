//! Grid timing configuration.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! The config file is taken from `$GRID_CONFIG` when set, or passed
//! explicitly with [`GridConfig::load_from`]. Every field can be overridden
//! with `GRID_<FIELD>` (upper-case field name).


use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Intervals and ceilings used by every wait loop in the grid.
///
/// Stored as milliseconds so the TOML stays plain integers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Job executor heartbeat broadcast.
    pub job_heartbeat_interval_ms: u64,
    /// Silence after which a job listener reads the durable snapshot.
    pub job_poll_interval_ms: u64,
    /// Worker heartbeat updater for running tasks.
    pub task_heartbeat_interval_ms: u64,
    /// Work coordinator round interval.
    pub task_polling_interval_ms: u64,
    /// Short fixed poll used by aggregation and non-coordinator waits.
    pub wait_poll_interval_ms: u64,
    pub heartbeat_expiry_ms: u64,
    pub max_task_duration_ms: u64,
    /// Bound on a gather RPC.
    pub rpc_timeout_ms: u64,
    /// Grace period before a terminal local progress record is dropped.
    pub progress_cleanup_delay_ms: u64,
    pub stop_monitor_interval_ms: u64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            job_heartbeat_interval_ms: 10_000,
            job_poll_interval_ms: 30_000,
            task_heartbeat_interval_ms: 1_000,
            task_polling_interval_ms: 2_000,
            wait_poll_interval_ms: 500,
            heartbeat_expiry_ms: 30_000,
            max_task_duration_ms: 10 * 60 * 1_000,
            rpc_timeout_ms: 2_000,
            progress_cleanup_delay_ms: 5 * 60 * 1_000,
            stop_monitor_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

impl GridConfig {
    /// Profile with millisecond-scale intervals for in-process clusters.
    pub fn for_tests() -> Self {
        Self {
            job_heartbeat_interval_ms: 50,
            job_poll_interval_ms: 400,
            task_heartbeat_interval_ms: 20,
            task_polling_interval_ms: 25,
            wait_poll_interval_ms: 10,
            heartbeat_expiry_ms: 1_500,
            max_task_duration_ms: 20_000,
            rpc_timeout_ms: 500,
            progress_cleanup_delay_ms: 60_000,
            stop_monitor_interval_ms: 10,
        }
    }

    /// Load config: env vars → `$GRID_CONFIG` file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var("GRID_CONFIG") {
            Ok(path) => Self::load_from(Path::new(&path)),
            Err(_) => {
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }

    /// Load from an explicit file (missing file means defaults), then apply env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies `GRID_*` overrides from an arbitrary lookup. Unparsable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let fields: [(&str, &mut u64); 10] = [
            ("GRID_JOB_HEARTBEAT_INTERVAL_MS", &mut self.job_heartbeat_interval_ms),
            ("GRID_JOB_POLL_INTERVAL_MS", &mut self.job_poll_interval_ms),
            ("GRID_TASK_HEARTBEAT_INTERVAL_MS", &mut self.task_heartbeat_interval_ms),
            ("GRID_TASK_POLLING_INTERVAL_MS", &mut self.task_polling_interval_ms),
            ("GRID_WAIT_POLL_INTERVAL_MS", &mut self.wait_poll_interval_ms),
            ("GRID_HEARTBEAT_EXPIRY_MS", &mut self.heartbeat_expiry_ms),
            ("GRID_MAX_TASK_DURATION_MS", &mut self.max_task_duration_ms),
            ("GRID_RPC_TIMEOUT_MS", &mut self.rpc_timeout_ms),
            ("GRID_PROGRESS_CLEANUP_DELAY_MS", &mut self.progress_cleanup_delay_ms),
            ("GRID_STOP_MONITOR_INTERVAL_MS", &mut self.stop_monitor_interval_ms),
        ];

        for (name, field) in fields {
            if let Some(value) = lookup(name) {
                match value.trim().parse::<u64>() {
                    Ok(parsed) => *field = parsed,
                    Err(_) => tracing::warn!("Ignoring invalid value for {}: {:?}", name, value),
                }
            }
        }
    }

    pub fn job_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.job_heartbeat_interval_ms)
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.job_poll_interval_ms)
    }

    pub fn task_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.task_heartbeat_interval_ms)
    }

    pub fn task_polling_interval(&self) -> Duration {
        Duration::from_millis(self.task_polling_interval_ms)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn progress_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.progress_cleanup_delay_ms)
    }

    pub fn stop_monitor_interval(&self) -> Duration {
        Duration::from_millis(self.stop_monitor_interval_ms)
    }
}
