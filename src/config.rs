// Scheduler configuration

//! # Configuration
//!
//! Layered with the `config` crate, later layers winning:
//!
//! 1. built-in defaults ([`SchedulerConfig::default`])
//! 2. an optional TOML file (`--config` / `SCHEDULER_CONFIG`)
//! 3. environment variables prefixed `SCHEDULER__`, with `__` between
//!    sections, e.g. `SCHEDULER__DATABASE__URL` or
//!    `SCHEDULER__SCHEDULER__TICK_MILLIS`
//!
//! ```toml
//! log_level = "info"
//!
//! [batch]
//! job_queue = "scheduler-jobs"
//! job_definition_suffix = "prd"
//!
//! [[engines]]
//! name = "redshift_engine"
//! ```

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/action_scheduler".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub url: String,
    /// Subject prefix; each call is published to `{subject}.{CALL}`
    pub subject: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            subject: "scheduler.triggers".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub job_queue: String,
    /// Environment suffix appended to job definition families and job names
    pub job_definition_suffix: String,
    /// Batch gateway base URL
    pub endpoint: String,
    pub request_timeout_secs: u64,
    /// Passed to jobs so they can publish their completion notice
    pub notification_target: Option<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            job_queue: "scheduler-jobs".to_string(),
            job_definition_suffix: "dev".to_string(),
            endpoint: "http://localhost:8080/".to_string(),
            request_timeout_secs: 30,
            notification_target: None,
        }
    }
}

impl BatchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Control loop pacing
///
/// Thresholds are in ticks: a task runs once its counter exceeds the
/// threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub tick_millis: u64,
    pub transition_queued_threshold: u32,
    pub transition_stale_threshold: u32,
    pub scale_down_threshold: u32,
    /// How long an action may sit in PENDING before it is reconciled
    pub stale_after_secs: i64,
    /// How close to a new billing hour an idle host must be to get terminated
    pub scale_down_window_secs: i64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_millis: 700,
            transition_queued_threshold: 1,
            transition_stale_threshold: 30,
            scale_down_threshold: 600,
            stale_after_secs: 600,
            scale_down_window_secs: 300,
        }
    }
}

impl SchedulerSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            cors: true,
        }
    }
}

/// One entry of the static engine registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub name: String,
    /// Job definition family; defaults to the engine name
    #[serde(default)]
    pub job_definition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub database: DatabaseConfig,
    pub nats: NatsConfig,
    pub batch: BatchConfig,
    pub scheduler: SchedulerSettings,
    pub server: ServerConfig,
    pub engines: Vec<EngineConfig>,
    pub log_level: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            nats: NatsConfig::default(),
            batch: BatchConfig::default(),
            scheduler: SchedulerSettings::default(),
            server: ServerConfig::default(),
            engines: ["elasticsearch_engine", "redshift_engine", "emr_engine", "s3_engine"]
                .iter()
                .map(|name| EngineConfig {
                    name: name.to_string(),
                    job_definition: None,
                })
                .collect(),
            log_level: "info".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Load defaults, then the optional file, then `SCHEDULER__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&SchedulerConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let config = builder
            .add_source(Environment::with_prefix("SCHEDULER").separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.scheduler.tick_interval(), Duration::from_millis(700));
        assert_eq!(config.scheduler.transition_queued_threshold, 1);
        assert!(config.engines.iter().any(|e| e.name == "redshift_engine"));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("scheduler-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[scheduler]
tick_millis = 250

[batch]
job_queue = "etl"

[[engines]]
name = "es"
job_definition = "elasticsearch_engine"
"#
        )
        .unwrap();

        let config = SchedulerConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.scheduler.tick_millis, 250);
        assert_eq!(config.scheduler.stale_after_secs, 600);
        assert_eq!(config.batch.job_queue, "etl");
        assert_eq!(config.batch.job_definition_suffix, "dev");
        assert_eq!(config.engines[0].name, "es");
        assert_eq!(config.engines[0].job_definition.as_deref(), Some("elasticsearch_engine"));
    }
}
