//! Engine configuration.

use cadence_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub release: ReleaseConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
}

impl EngineConfig {
    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.worker == 0 {
            return Err(invalid("pipeline.worker must be at least 1"));
        }
        if self.pipeline.poll_interval.is_zero() {
            return Err(invalid("pipeline.poll_interval must be positive"));
        }
        if self.release.coarse_sleep.is_zero() {
            return Err(invalid("release.coarse_sleep must be positive"));
        }
        if self.release.final_margin > self.release.waiting_window {
            return Err(invalid(
                "release.final_margin must not exceed release.waiting_window",
            ));
        }
        if self.controller.tick_offset >= Duration::from_secs(60) {
            return Err(invalid("controller.tick_offset must be below one minute"));
        }
        if self.controller.chunk_size == 0 {
            return Err(invalid("controller.chunk_size must be at least 1"));
        }
        if self.controller.max_processes == 0 {
            return Err(invalid("controller.max_processes must be at least 1"));
        }
        if self.controller.drain_poll.is_zero() || self.controller.sweep_interval.is_zero() {
            return Err(invalid("controller intervals must be positive"));
        }
        self.controller
            .timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| invalid(format!("unknown timezone {:?}", self.controller.timezone)))?;
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::Configuration(message.into())
}

/// Branch aggregation limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Upper bound on a fail-fast job waiting for its branches.
    #[serde(default = "default_fail_fast_ceiling", with = "duration_str")]
    pub fail_fast_ceiling: Duration,
    /// Per-branch result timeout in all-completed mode.
    #[serde(default = "default_branch_timeout", with = "duration_str")]
    pub branch_timeout: Duration,
}

fn default_fail_fast_ceiling() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_branch_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            fail_fast_ceiling: default_fail_fast_ceiling(),
            branch_timeout: default_branch_timeout(),
        }
    }
}

impl JobConfig {
    pub fn with_fail_fast_ceiling(mut self, ceiling: Duration) -> Self {
        self.fail_fast_ceiling = ceiling;
        self
    }

    pub fn with_branch_timeout(mut self, timeout: Duration) -> Self {
        self.branch_timeout = timeout;
        self
    }
}

/// Multi-job execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Jobs allowed to run at once. `1` selects sequential mode.
    #[serde(default = "default_worker")]
    pub worker: usize,
    /// Wall-clock bound on one pipeline execution.
    #[serde(default = "default_pipeline_timeout", with = "duration_str")]
    pub timeout: Duration,
    /// Back-off between dependency checks.
    #[serde(default = "default_poll_interval", with = "duration_str")]
    pub poll_interval: Duration,
}

fn default_worker() -> usize {
    2
}

fn default_pipeline_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(250)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker: default_worker(),
            timeout: default_pipeline_timeout(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl PipelineConfig {
    pub fn with_worker(mut self, worker: usize) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Release arming and wait tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseConfig {
    /// Releases farther away than this are parked.
    #[serde(default = "default_waiting_window", with = "duration_str")]
    pub waiting_window: Duration,
    /// Sleep step while far from the fire time.
    #[serde(default = "default_coarse_sleep", with = "duration_str")]
    pub coarse_sleep: Duration,
    /// Distance at which coarse sleeping stops.
    #[serde(default = "default_final_margin", with = "duration_str")]
    pub final_margin: Duration,
    /// Short pause after the wait, before firing.
    #[serde(default = "default_settle_delay", with = "duration_str")]
    pub settle_delay: Duration,
}

fn default_waiting_window() -> Duration {
    Duration::from_secs(55)
}

fn default_coarse_sleep() -> Duration {
    Duration::from_secs(15)
}

fn default_final_margin() -> Duration {
    Duration::from_secs(20)
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(500)
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            waiting_window: default_waiting_window(),
            coarse_sleep: default_coarse_sleep(),
            final_margin: default_final_margin(),
            settle_delay: default_settle_delay(),
        }
    }
}

impl ReleaseConfig {
    pub fn with_waiting_window(mut self, window: Duration) -> Self {
        self.waiting_window = window;
        self
    }

    pub fn with_coarse_sleep(mut self, sleep: Duration) -> Self {
        self.coarse_sleep = sleep;
        self
    }

    pub fn with_final_margin(mut self, margin: Duration) -> Self {
        self.final_margin = margin;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }
}

/// Controller cadence and fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Offset past each minute at which the tick runs.
    #[serde(default = "default_tick_offset", with = "duration_str")]
    pub tick_offset: Duration,
    /// Interval of the finished-task sweep.
    #[serde(default = "default_sweep_interval", with = "duration_str")]
    pub sweep_interval: Duration,
    /// Default distance from start to the stop boundary.
    #[serde(default = "default_stop_after", with = "duration_str")]
    pub stop_after: Duration,
    /// Poll interval while draining in-flight releases.
    #[serde(default = "default_drain_poll", with = "duration_str")]
    pub drain_poll: Duration,
    /// Pipelines per worker process.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Worker processes allowed at once.
    #[serde(default = "default_max_processes")]
    pub max_processes: usize,
    /// Timezone used for minute buckets and task names.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_tick_offset() -> Duration {
    Duration::from_secs(2)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_stop_after() -> Duration {
    Duration::from_secs(5 * 60 + 20)
}

fn default_drain_poll() -> Duration {
    Duration::from_secs(15)
}

fn default_chunk_size() -> usize {
    100
}

fn default_max_processes() -> usize {
    2
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_offset: default_tick_offset(),
            sweep_interval: default_sweep_interval(),
            stop_after: default_stop_after(),
            drain_poll: default_drain_poll(),
            chunk_size: default_chunk_size(),
            max_processes: default_max_processes(),
            timezone: default_timezone(),
        }
    }
}

impl ControllerConfig {
    pub fn with_tick_offset(mut self, offset: Duration) -> Self {
        self.tick_offset = offset;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_stop_after(mut self, stop_after: Duration) -> Self {
        self.stop_after = stop_after;
        self
    }

    pub fn with_drain_poll(mut self, poll: Duration) -> Self {
        self.drain_poll = poll;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_processes(mut self, max_processes: usize) -> Self {
        self.max_processes = max_processes;
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }
}

/// Serde helper for durations written as `"1h"`, `"5m20s"` or `"250ms"`.
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    /// Longest accepted duration, one hundred years.
    pub const MAX: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

    /// Parse a sequence of `<number><unit>` pairs. Units: `h`, `m`, `s`, `ms`.
    /// Totals above [`MAX`] are rejected.
    pub fn parse(raw: &str) -> Result<Duration, String> {
        let input = raw.trim();
        if input.is_empty() {
            return Err("empty duration".to_string());
        }
        let too_long = || format!("duration {:?} exceeds {}", raw, format(MAX));

        let mut total = Duration::ZERO;
        let mut rest = input;
        while !rest.is_empty() {
            let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
            if digits == 0 {
                return Err(format!("invalid duration {:?}", raw));
            }
            let amount: u64 = rest[..digits].parse().map_err(|_| too_long())?;
            rest = &rest[digits..];

            let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
            let step = match &rest[..unit_len] {
                "h" => amount.checked_mul(3600).map(Duration::from_secs),
                "m" => amount.checked_mul(60).map(Duration::from_secs),
                "s" => Some(Duration::from_secs(amount)),
                "ms" => Some(Duration::from_millis(amount)),
                unit => return Err(format!("unknown duration unit {:?} in {:?}", unit, raw)),
            };
            total = step
                .and_then(|step| total.checked_add(step))
                .filter(|total| *total <= MAX)
                .ok_or_else(too_long)?;
            rest = &rest[unit_len..];
        }
        Ok(total)
    }

    pub fn format(value: Duration) -> String {
        let millis = value.as_millis();
        if millis == 0 {
            return "0s".to_string();
        }

        let mut out = String::new();
        let mut remaining = millis;
        for (unit, size) in [("h", 3_600_000), ("m", 60_000), ("s", 1_000), ("ms", 1)] {
            let count = remaining / size;
            if count > 0 {
                out.push_str(&format!("{}{}", count, unit));
                remaining %= size;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.job.fail_fast_ceiling, Duration::from_secs(1800));
        assert_eq!(config.pipeline.worker, 2);
        assert_eq!(config.release.waiting_window, Duration::from_secs(55));
        assert_eq!(config.controller.stop_after, Duration::from_secs(320));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_sections_fill_defaults() {
        let yaml = r#"
pipeline:
  worker: 4
  poll_interval: 100ms
controller:
  stop_after: 1h30m
  timezone: Asia/Bangkok
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pipeline.worker, 4);
        assert_eq!(config.pipeline.poll_interval, Duration::from_millis(100));
        assert_eq!(config.pipeline.timeout, Duration::from_secs(3600));
        assert_eq!(config.controller.stop_after, Duration::from_secs(5400));
        assert_eq!(config.job, JobConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.pipeline.worker = 0;
        assert!(config.validate().is_err());

        let config = EngineConfig {
            controller: ControllerConfig::default().with_timezone("Mars/Olympus"),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_format() {
        assert_eq!(duration_str::format(Duration::from_secs(320)), "5m20s");
        assert_eq!(duration_str::format(Duration::from_millis(250)), "250ms");
        assert_eq!(duration_str::parse("5m20s").unwrap(), Duration::from_secs(320));
        assert!(duration_str::parse("5 minutes").is_err());
        assert!(duration_str::parse("").is_err());
    }

    #[test]
    fn test_duration_overflow_is_rejected() {
        let err = duration_str::parse("99999999999999999h").unwrap_err();
        assert!(err.contains("exceeds"));
        assert!(duration_str::parse("99999999999999999999999s").is_err());
        assert!(duration_str::parse("876000h1s").is_err());
        assert_eq!(duration_str::parse("876000h").unwrap(), duration_str::MAX);
    }
}
