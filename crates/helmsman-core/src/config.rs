//! helmsman.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::{humanize, parse_duration};
use crate::types::WorkloadKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("lock.ttl ({ttl}) must exceed the longest ceiling plus monitor.init_timeout ({episode})")]
    LockTtlTooShort { ttl: String, episode: String },

    #[error("monitor.poll_interval must be greater than zero")]
    ZeroPollInterval,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelmsmanConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub images: Vec<ImageConfig>,
    #[serde(default)]
    pub workloads: Vec<WorkloadConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockConfig {
    /// Safety-net expiry for a crashed lock holder.
    pub ttl: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub poll_interval: Option<String>,
    pub init_timeout: Option<String>,
    #[serde(default)]
    pub ceiling: CeilingConfig,
}

/// Hard wall-clock ceilings per workload kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CeilingConfig {
    pub service: Option<String>,
    pub job: Option<String>,
    pub adhoc: Option<String>,
}

/// Tags known to the static image repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    pub workload: String,
    pub branch: String,
    pub tags: Vec<String>,
}

/// A live workload the local orchestrator starts out with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub env: String,
    pub name: String,
    pub kind: WorkloadKind,
    #[serde(default)]
    pub replicas: u32,
    pub tag: String,
}

/// Resolved engine timings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub lock_ttl: Duration,
    pub poll_interval: Duration,
    pub init_timeout: Duration,
    pub service_ceiling: Duration,
    pub job_ceiling: Duration,
    pub adhoc_ceiling: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(6 * 3600),
            poll_interval: Duration::from_secs(1),
            init_timeout: Duration::from_secs(30),
            service_ceiling: Duration::from_secs(30 * 60),
            job_ceiling: Duration::from_secs(2 * 3600),
            adhoc_ceiling: Duration::from_secs(3600),
        }
    }
}

impl EngineSettings {
    /// The wall-clock ceiling for an episode of the given kind.
    pub fn ceiling(&self, kind: WorkloadKind) -> Duration {
        match kind {
            WorkloadKind::Service => self.service_ceiling,
            WorkloadKind::Job => self.job_ceiling,
            WorkloadKind::AdHoc => self.adhoc_ceiling,
        }
    }

    /// Upper bound on how long one episode can hold its lease.
    pub fn longest_episode(&self) -> Duration {
        let ceiling = self
            .service_ceiling
            .max(self.job_ceiling)
            .max(self.adhoc_ceiling);
        ceiling.saturating_add(self.init_timeout)
    }

    /// Leases are never renewed, so the TTL must outlive any episode.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        let episode = self.longest_episode();
        if self.lock_ttl <= episode {
            return Err(ConfigError::LockTtlTooShort {
                ttl: humanize(self.lock_ttl),
                episode: humanize(episode),
            });
        }
        Ok(())
    }
}

impl HelmsmanConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Resolve duration strings, falling back to defaults for absent keys.
    pub fn settings(&self) -> Result<EngineSettings, ConfigError> {
        let defaults = EngineSettings::default();
        let settings = EngineSettings {
            lock_ttl: resolve("lock.ttl", &self.lock.ttl, defaults.lock_ttl)?,
            poll_interval: resolve(
                "monitor.poll_interval",
                &self.monitor.poll_interval,
                defaults.poll_interval,
            )?,
            init_timeout: resolve(
                "monitor.init_timeout",
                &self.monitor.init_timeout,
                defaults.init_timeout,
            )?,
            service_ceiling: resolve(
                "monitor.ceiling.service",
                &self.monitor.ceiling.service,
                defaults.service_ceiling,
            )?,
            job_ceiling: resolve(
                "monitor.ceiling.job",
                &self.monitor.ceiling.job,
                defaults.job_ceiling,
            )?,
            adhoc_ceiling: resolve(
                "monitor.ceiling.adhoc",
                &self.monitor.ceiling.adhoc,
                defaults.adhoc_ceiling,
            )?,
        };
        settings.validate()?;
        Ok(settings)
    }
}

fn resolve(
    field: &'static str,
    value: &Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => parse_duration(raw).ok_or_else(|| ConfigError::InvalidDuration {
            field,
            value: raw.clone(),
        }),
    }
}
