//! CLI configuration management.
//!
//! Settings come from an optional YAML file, then `CADENCE_*` environment
//! variables (a `.env` file is loaded first when present).

use anyhow::{Context, Result};
use cadence_scheduler::EngineConfig;
use cadence_scheduler::config::duration_str;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration file looked up when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "cadence.yaml";

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Directory receiving one JSON-lines release log per pipeline.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Emit logs as JSON objects instead of human-readable lines.
    #[serde(default)]
    pub json_logs: bool,
    #[serde(flatten)]
    pub engine: EngineConfig,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".cadence/logs")
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            json_logs: false,
            engine: EngineConfig::default(),
        }
    }
}

impl CliConfig {
    /// Load configuration from `path`, or from [`DEFAULT_CONFIG_FILE`] when
    /// it exists, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.engine.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Override settings from `CADENCE_*` variables resolved by `get`.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        let engine = &mut self.engine;

        if let Some(v) = get("CADENCE_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Some(v) = get("CADENCE_JSON_LOGS") {
            self.json_logs = parse_bool("CADENCE_JSON_LOGS", &v)?;
        }
        if let Some(v) = get("CADENCE_PIPELINE_WORKER") {
            engine.pipeline.worker = v.parse().context("CADENCE_PIPELINE_WORKER")?;
        }
        if let Some(v) = get("CADENCE_PIPELINE_TIMEOUT") {
            engine.pipeline.timeout = parse_duration("CADENCE_PIPELINE_TIMEOUT", &v)?;
        }
        if let Some(v) = get("CADENCE_JOB_BRANCH_TIMEOUT") {
            engine.job.branch_timeout = parse_duration("CADENCE_JOB_BRANCH_TIMEOUT", &v)?;
        }
        if let Some(v) = get("CADENCE_CONTROLLER_CHUNK_SIZE") {
            engine.controller.chunk_size = v.parse().context("CADENCE_CONTROLLER_CHUNK_SIZE")?;
        }
        if let Some(v) = get("CADENCE_CONTROLLER_MAX_PROCESSES") {
            engine.controller.max_processes =
                v.parse().context("CADENCE_CONTROLLER_MAX_PROCESSES")?;
        }
        if let Some(v) = get("CADENCE_CONTROLLER_STOP_AFTER") {
            engine.controller.stop_after = parse_duration("CADENCE_CONTROLLER_STOP_AFTER", &v)?;
        }
        if let Some(v) = get("CADENCE_TIMEZONE") {
            engine.controller.timezone = v;
        }
        Ok(())
    }
}

fn parse_duration(key: &str, raw: &str) -> Result<std::time::Duration> {
    duration_str::parse(raw).map_err(|e| anyhow::anyhow!("{}: {}", key, e))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("{}: expected a boolean, got {:?}", key, raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_yaml_sections_and_defaults() {
        let config: CliConfig = serde_yaml::from_str(
            r#"
log_dir: /var/lib/cadence
pipeline:
  worker: 4
controller:
  timezone: Asia/Tokyo
  stop_after: 10m
"#,
        )
        .unwrap();

        assert_eq!(config.log_dir, PathBuf::from("/var/lib/cadence"));
        assert_eq!(config.engine.pipeline.worker, 4);
        assert_eq!(config.engine.controller.timezone, "Asia/Tokyo");
        assert_eq!(config.engine.controller.stop_after, Duration::from_secs(600));
        assert_eq!(config.engine.controller.chunk_size, 100);
        assert!(!config.json_logs);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = CliConfig::default();
        config
            .apply_env(env(&[
                ("CADENCE_PIPELINE_WORKER", "8"),
                ("CADENCE_CONTROLLER_CHUNK_SIZE", "25"),
                ("CADENCE_PIPELINE_TIMEOUT", "1h30m"),
                ("CADENCE_TIMEZONE", "Europe/Paris"),
                ("CADENCE_JSON_LOGS", "yes"),
            ]))
            .unwrap();

        assert_eq!(config.engine.pipeline.worker, 8);
        assert_eq!(config.engine.controller.chunk_size, 25);
        assert_eq!(config.engine.pipeline.timeout, Duration::from_secs(5400));
        assert_eq!(config.engine.controller.timezone, "Europe/Paris");
        assert!(config.json_logs);
    }

    #[test]
    fn test_bad_env_value_is_reported() {
        let mut config = CliConfig::default();
        let err = config
            .apply_env(env(&[("CADENCE_PIPELINE_WORKER", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("CADENCE_PIPELINE_WORKER"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.yaml");
        std::fs::write(&path, "json_logs: true\njob:\n  branch_timeout: 90s\n").unwrap();

        let config = CliConfig::load(Some(&path)).unwrap();
        assert!(config.json_logs);
        assert_eq!(config.engine.job.branch_timeout, Duration::from_secs(90));
    }
}
