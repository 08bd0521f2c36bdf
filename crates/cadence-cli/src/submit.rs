//! Process-per-chunk submission.

use async_trait::async_trait;
use cadence_core::{ChunkSubmitter, Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Runs each chunk in a child `cadence worker` process.
///
/// The child inherits stderr, so its logs interleave with the parent's,
/// and reports the scheduled names as a JSON array on its last stdout line.
#[derive(Debug, Clone)]
pub struct ProcessSubmitter {
    program: PathBuf,
    definitions: PathBuf,
    config: Option<PathBuf>,
}

impl ProcessSubmitter {
    pub fn new(program: impl Into<PathBuf>, definitions: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            definitions: definitions.into(),
            config: None,
        }
    }

    /// Submitter re-executing the running binary.
    pub fn current(definitions: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, definitions))
    }

    pub fn with_config(mut self, config: Option<PathBuf>) -> Self {
        self.config = config;
        self
    }

    fn command(&self, chunk: &[String], stop: DateTime<Utc>) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(config) = &self.config {
            cmd.arg("--config").arg(config);
        }
        cmd.arg("worker")
            .arg(&self.definitions)
            .arg("--names")
            .arg(chunk.join(","))
            .arg("--stop")
            .arg(stop.to_rfc3339_opts(SecondsFormat::Secs, true));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ChunkSubmitter for ProcessSubmitter {
    async fn submit(&self, chunk: Vec<String>, stop: DateTime<Utc>) -> Result<Vec<String>> {
        info!(names = ?chunk, "Starting worker process");
        let output = self
            .command(&chunk, stop)
            .output()
            .await
            .map_err(|e| Error::Submit(format!("failed to start {}: {}", self.program.display(), e)))?;

        if !output.status.success() {
            return Err(Error::Submit(format!(
                "worker for {:?} exited with {}",
                chunk, output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(stdout = %stdout.trim(), "Worker finished");
        parse_names(&stdout)
    }
}

/// Parse the JSON array of names on the last non-empty line of `stdout`.
pub fn parse_names(stdout: &str) -> Result<Vec<String>> {
    let line = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| Error::Submit("worker printed no result".to_string()))?;
    serde_json::from_str(line).map_err(|e| Error::Submit(format!("unreadable worker result {:?}: {}", line, e)))
}
