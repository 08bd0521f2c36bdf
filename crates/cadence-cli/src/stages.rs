//! Built-in stage kinds available to YAML definitions.

use async_trait::async_trait;
use cadence_core::template::{self, is_truthy};
use cadence_core::{ExecutionContext, Stage, StageError};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Fields shared by every built-in stage.
#[derive(Debug, Clone)]
pub struct StageMeta {
    pub id: String,
    pub name: Option<String>,
    /// `${{ ... }}` expression; the stage runs only when it renders truthy.
    pub condition: Option<String>,
}

impl StageMeta {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    fn is_skipped(&self, ctx: &ExecutionContext) -> bool {
        let Some(condition) = &self.condition else {
            return false;
        };
        match template::render(&Value::String(condition.clone()), &ctx.to_value()) {
            Ok(value) => !is_truthy(&value),
            Err(err) => {
                warn!(stage = %self.id, error = %err, "Condition could not be rendered, skipping");
                true
            }
        }
    }

    fn render(&self, value: &Value, ctx: &ExecutionContext) -> Result<Value, StageError> {
        template::render(value, &ctx.to_value()).map_err(|e| StageError::new(&self.id, e.to_string()))
    }
}

/// Outputs its rendered `with` mapping, or a single rendered `value`.
#[derive(Debug, Clone)]
pub struct EchoStage {
    meta: StageMeta,
    with: Map<String, Value>,
    value: Option<Value>,
}

impl EchoStage {
    pub fn new(meta: StageMeta, with: Map<String, Value>, value: Option<Value>) -> Self {
        Self { meta, with, value }
    }
}

#[async_trait]
impl Stage for EchoStage {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn name(&self) -> &str {
        self.meta.name.as_deref().unwrap_or(&self.meta.id)
    }

    fn is_skipped(&self, ctx: &ExecutionContext) -> bool {
        self.meta.is_skipped(ctx)
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Value, StageError> {
        match &self.value {
            Some(value) => self.meta.render(value, ctx),
            None => self.meta.render(&Value::Object(self.with.clone()), ctx),
        }
    }
}

/// Runs a script with `sh -c`.
///
/// Outputs `{return_code, stdout, stderr}`; a non-zero exit is a failure.
#[derive(Debug, Clone)]
pub struct ShellStage {
    meta: StageMeta,
    run: String,
    env: BTreeMap<String, String>,
}

impl ShellStage {
    pub fn new(meta: StageMeta, run: impl Into<String>, env: BTreeMap<String, String>) -> Self {
        Self {
            meta,
            run: run.into(),
            env,
        }
    }
}

#[async_trait]
impl Stage for ShellStage {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn name(&self) -> &str {
        self.meta.name.as_deref().unwrap_or(&self.meta.id)
    }

    fn is_skipped(&self, ctx: &ExecutionContext) -> bool {
        self.meta.is_skipped(ctx)
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Value, StageError> {
        let script = match self.meta.render(&Value::String(self.run.clone()), ctx)? {
            Value::String(s) => s,
            other => other.to_string(),
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&script);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        for (key, value) in &self.env {
            let value = match self.meta.render(&Value::String(value.clone()), ctx)? {
                Value::String(s) => s,
                other => other.to_string(),
            };
            cmd.env(key, value);
        }

        debug!(stage = %self.meta.id, "Running shell stage");
        let output = cmd
            .output()
            .await
            .map_err(|e| StageError::new(&self.meta.id, format!("failed to spawn sh: {}", e)))?;

        let return_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();

        if !output.status.success() {
            return Err(StageError::new(
                &self.meta.id,
                format!("exit code {}: {}", return_code, stderr),
            ));
        }
        Ok(json!({
            "return_code": return_code,
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}
