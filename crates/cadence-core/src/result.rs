//! Execution results.

use crate::ids::RunId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key under which failures are embedded in a result context.
pub const ERROR_MESSAGE_KEY: &str = "error_message";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Failure,
    Cancelled,
}

impl Status {
    /// Numeric status: 0 success, 1 failure, 2 cancelled.
    pub fn code(&self) -> u8 {
        match self {
            Status::Success => 0,
            Status::Failure => 1,
            Status::Cancelled => 2,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

/// Outcome of a branch, job, pipeline or release execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub status: Status,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub parent_run_id: Option<RunId>,
}

impl RunResult {
    pub fn new(status: Status, context: Map<String, Value>) -> Self {
        Self {
            status,
            context,
            run_id: None,
            parent_run_id: None,
        }
    }

    pub fn success(context: Map<String, Value>) -> Self {
        Self::new(Status::Success, context)
    }

    pub fn failure(context: Map<String, Value>) -> Self {
        Self::new(Status::Failure, context)
    }

    /// A failed result whose context carries only the error message.
    pub fn failed_with(message: impl Into<String>) -> Self {
        let mut context = Map::new();
        context.insert(ERROR_MESSAGE_KEY.to_string(), Value::String(message.into()));
        Self::failure(context)
    }

    pub fn cancelled(context: Map<String, Value>) -> Self {
        Self::new(Status::Cancelled, context)
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_parent_run_id(mut self, parent: RunId) -> Self {
        self.parent_run_id = Some(parent);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.context.get(ERROR_MESSAGE_KEY).and_then(Value::as_str)
    }
}
