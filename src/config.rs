//! Layered configuration.
//!
//! Sources, lowest to highest priority:
//! 1. Built-in defaults
//! 2. A TOML file (`study-scheduler.toml` in the working directory, or an
//!    explicit path)
//! 3. Environment variables prefixed `STUDY_SCHEDULER_`, with `__` between
//!    nested keys (`STUDY_SCHEDULER_TRIGGER__RUN_AT=00:05:00`)

use crate::policy::{PolicyError, PolicySettings};
use crate::trigger::TriggerSchedule;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_PREFIX: &str = "STUDY_SCHEDULER_";
pub const DEFAULT_CONFIG_FILE: &str = "study-scheduler.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl From<figment::Error> for ConfigError {
    fn from(value: figment::Error) -> Self {
        Self::Figment(Box::new(value))
    }
}

impl From<PolicyError> for ConfigError {
    fn from(value: PolicyError) -> Self {
        Self::InvalidValue {
            field: "default_policy".to_string(),
            reason: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub database_path: PathBuf,
    pub http_addr: String,
    pub busy_timeout_ms: u64,
    /// Closeout worker threads; 0 lets rayon decide.
    pub workers: usize,
    pub trigger: TriggerSchedule,
    pub default_policy: PolicySettings,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("study-scheduler.db"),
            http_addr: "0.0.0.0:3000".to_string(),
            busy_timeout_ms: 5_000,
            workers: 0,
            trigger: TriggerSchedule::default(),
            default_policy: PolicySettings::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn figment(path: &Path) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if path.exists() {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default_policy.validate()?;
        self.socket_addr()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.http_addr
            .parse()
            .map_err(|err: std::net::AddrParseError| ConfigError::InvalidValue {
                field: "http_addr".to_string(),
                reason: err.to_string(),
            })
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
