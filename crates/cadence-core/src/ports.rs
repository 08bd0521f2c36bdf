//! Port traits.
//!
//! These traits define the interfaces between the engine and its external
//! collaborators: stage bodies, the release log sink, and the process
//! boundary used to partition schedules.

use crate::context::ExecutionContext;
use crate::error::StageError;
use crate::ids::RunId;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An opaque unit of work inside a job.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Identity used as the key of this stage's output.
    fn id(&self) -> &str;

    /// Human-readable name for logs.
    fn name(&self) -> &str {
        self.id()
    }

    /// Skip predicate evaluated against the context before execution.
    fn is_skipped(&self, _ctx: &ExecutionContext) -> bool {
        false
    }

    /// Run the stage body. The returned value is merged into the branch
    /// context under [`Stage::id`].
    async fn execute(&self, ctx: &ExecutionContext) -> std::result::Result<Value, StageError>;
}

/// One persisted release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub pipeline: String,
    pub cron: String,
    pub release: DateTime<Utc>,
    pub context: Map<String, Value>,
    pub parent_run_id: Option<RunId>,
    pub run_id: Option<RunId>,
}

/// Sink receiving the result of every release.
#[async_trait]
pub trait ReleaseLog: Send + Sync {
    /// Persist one release result.
    async fn save(&self, record: &ReleaseRecord) -> Result<()>;

    /// Whether `release` is already taken for `pipeline`, either because it
    /// sits in `queue` or because a release for it was persisted before.
    async fn is_pointed(
        &self,
        pipeline: &str,
        release: DateTime<Utc>,
        queue: &[DateTime<Utc>],
    ) -> Result<bool>;
}

/// Boundary that runs one controller per chunk of pipeline names.
#[async_trait]
pub trait ChunkSubmitter: Send + Sync {
    /// Schedule `chunk` until `stop` and return the names that were
    /// scheduled successfully.
    async fn submit(&self, chunk: Vec<String>, stop: DateTime<Utc>) -> Result<Vec<String>>;
}
