//! Execution context threaded through one pipeline execution.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One concrete axis-value assignment of a strategy.
pub type Branch = Map<String, Value>;

/// Inputs and outputs visible to stages.
///
/// The context is merge-append: executors clone it at every fan-out
/// boundary and only ever add keys to their own copy, so concurrent units
/// never observe each other's partial writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Parameterized pipeline inputs.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Results of finished jobs keyed by job id.
    #[serde(default)]
    pub jobs: Map<String, Value>,
    /// Axis values of the branch currently executing.
    #[serde(default)]
    pub matrix: Branch,
    /// Outputs of the stages already run in the current branch.
    #[serde(default)]
    pub stages: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(params: Map<String, Value>) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }

    /// Copy of this context scoped to one strategy branch.
    pub fn for_branch(&self, branch: &Branch) -> Self {
        Self {
            params: self.params.clone(),
            jobs: self.jobs.clone(),
            matrix: branch.clone(),
            stages: Map::new(),
        }
    }

    pub fn set_stage_output(&mut self, stage_id: impl Into<String>, output: Value) {
        self.stages.insert(stage_id.into(), output);
    }

    pub fn record_job(&mut self, job_id: impl Into<String>, output: Value) {
        self.jobs.insert(job_id.into(), output);
    }

    pub fn has_job(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    /// The context as a single JSON object, used for template lookups.
    pub fn to_value(&self) -> Value {
        let mut root = Map::new();
        root.insert("params".to_string(), Value::Object(self.params.clone()));
        root.insert("jobs".to_string(), Value::Object(self.jobs.clone()));
        root.insert("matrix".to_string(), Value::Object(self.matrix.clone()));
        root.insert("stages".to_string(), Value::Object(self.stages.clone()));
        Value::Object(root)
    }

    /// Look up a dotted path such as `jobs.build.version`.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        crate::template::lookup(&self.to_value(), path).cloned()
    }
}
