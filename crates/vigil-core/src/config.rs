use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LOCATION: &str = "UTC";
pub const DEFAULT_JOB_TYPE: &str = "tcp";
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Top-level config (vigil.toml + VIGIL_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub monitors: Vec<MonitorConfig>,
}

/// Concurrency budgets and time zone for the job scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of task bodies executing at once across all jobs.
    /// `0` disables the global gate.
    #[serde(default)]
    pub limit: usize,
    /// IANA time zone used to evaluate cron expressions (e.g. "Europe/Berlin").
    #[serde(default = "default_location")]
    pub location: String,
    /// Per job-type cap on concurrently admitted runs. A value of `0` means
    /// the type is not gated.
    #[serde(default)]
    pub job_type_limits: HashMap<String, usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            limit: 0,
            location: default_location(),
            job_type_limits: HashMap::new(),
        }
    }
}

/// A single reachability monitor registered by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub name: String,
    /// `@every <duration>` or a cron expression (5 or 6 fields).
    pub schedule: String,
    #[serde(default = "default_job_type")]
    pub job_type: String,
    /// `host:port` pairs; every resolved address is probed.
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_location() -> String {
    DEFAULT_LOCATION.to_string()
}
fn default_job_type() -> String {
    DEFAULT_JOB_TYPE.to_string()
}
fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl VigilConfig {
    /// Load config from a TOML file with VIGIL_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.vigil/vigil.toml
    ///
    /// Nested keys use a double underscore in the environment, e.g.
    /// `VIGIL_SCHEDULER__LIMIT=4`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        tracing::debug!(%path, "loading config");

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("VIGIL_").split("__"))
            .extract()
            .map_err(|e| crate::error::VigilError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.vigil/vigil.toml", home)
}
