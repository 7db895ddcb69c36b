use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::core::RetryPolicy;
use crate::orchestration::HealthConfig;
use crate::pipeline::PipelineConfig;
use crate::scheduler::{SchedulerConfig, TierQuotas};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub health: HealthSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub fail_fast: bool,
    pub base_delay_ms: u64,
    pub max_backoff_ms: u64,
    pub max_parallel: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            fail_fast: true,
            base_delay_ms: crate::core::retry::DEFAULT_BASE_DELAY_MS,
            max_backoff_ms: crate::core::retry::DEFAULT_MAX_DELAY_MS,
            max_parallel: crate::pipeline::DEFAULT_MAX_PARALLEL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub max_workers: usize,
    pub poll_interval_ms: u64,
    pub starvation_threshold: u32,
    /// Upper bound on one scheduler-backed workflow run.
    pub workflow_timeout_secs: u64,
    pub quotas: TierQuotas,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_workers: crate::scheduler::DEFAULT_MAX_WORKERS,
            poll_interval_ms: crate::scheduler::DEFAULT_POLL_INTERVAL_MS,
            starvation_threshold: crate::scheduler::DEFAULT_STARVATION_THRESHOLD,
            workflow_timeout_secs: 3600,
            quotas: TierQuotas::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Number of recent workflow outcomes the failure rate is computed over.
    pub failure_window: usize,
    pub failure_rate_threshold: f64,
    pub utilization_warning: f64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        let defaults = HealthConfig::default();
        Self {
            failure_window: defaults.failure_window,
            failure_rate_threshold: defaults.failure_rate_threshold,
            utilization_warning: defaults.utilization_warning,
        }
    }
}

impl Config {
    pub fn flowcore_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".flowcore"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::flowcore_dir()?.join("flowcore.toml"))
    }

    /// Load `~/.flowcore/flowcore.toml`, or defaults when it does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = fs::read_to_string(path)?.parse()?;
        debug!(
            debug = config.debug,
            max_workers = config.scheduler.max_workers,
            fail_fast = config.pipeline.fail_fast,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                debug!(dir = %dir.display(), "creating config directory");
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.pipeline.base_delay_ms),
            Duration::from_millis(self.pipeline.max_backoff_ms),
        )
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            fail_fast: self.pipeline.fail_fast,
            retry: self.retry_policy(),
            max_parallel: self.pipeline.max_parallel.max(1),
            level_parallel: false,
        }
    }

    /// Scheduler workers back off between retries the same way pipeline
    /// stages do.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_workers: self.scheduler.max_workers.max(1),
            poll_interval: Duration::from_millis(self.scheduler.poll_interval_ms),
            quotas: self.scheduler.quotas,
            starvation_threshold: self.scheduler.starvation_threshold,
            retry: self.retry_policy(),
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            failure_window: self.health.failure_window.max(1),
            failure_rate_threshold: self.health.failure_rate_threshold,
            utilization_warning: self.health.utilization_warning,
        }
    }

    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler.workflow_timeout_secs)
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}
