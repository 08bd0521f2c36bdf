//! CLI command definitions.

use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde_json::Value;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a definitions file
    Validate {
        /// Path to definitions file
        #[arg(default_value = "pipelines.yaml")]
        path: PathBuf,
    },

    /// Execute one pipeline now
    Run {
        /// Path to definitions file
        path: PathBuf,

        /// Pipeline name
        pipeline: String,

        /// Parameter as key=value (value parsed as JSON when possible)
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,
    },

    /// Release scheduled pipelines until the stop time
    Schedule {
        /// Path to definitions file
        path: PathBuf,

        /// Stop time (RFC 3339); defaults to the configured stop distance
        #[arg(long, value_parser = parse_stop)]
        stop: Option<DateTime<Utc>>,
    },

    /// Run one controller for a chunk of pipelines
    #[command(hide = true)]
    Worker {
        /// Path to definitions file
        path: PathBuf,

        /// Comma-separated pipeline names
        #[arg(long, value_delimiter = ',')]
        names: Vec<String>,

        /// Stop time (RFC 3339)
        #[arg(long, value_parser = parse_stop)]
        stop: DateTime<Utc>,
    },
}

pub fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {:?}", raw))?;
    if key.is_empty() {
        return Err(format!("empty parameter name in {:?}", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

pub fn parse_stop(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 time {:?}: {}", raw, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("x=5").unwrap(), ("x".to_string(), json!(5)));
        assert_eq!(parse_param("name=etl").unwrap(), ("name".to_string(), json!("etl")));
        assert_eq!(parse_param("list=[1,2]").unwrap(), ("list".to_string(), json!([1, 2])));
        assert_eq!(parse_param("empty=").unwrap(), ("empty".to_string(), json!("")));
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=1").is_err());
    }

    #[test]
    fn test_parse_stop() {
        assert_eq!(
            parse_stop("2024-06-01T14:00:00+02:00").unwrap(),
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
        );
        assert!(parse_stop("tomorrow").is_err());
    }
}
