//! Cadence Core
//!
//! Core domain types, traits, and error handling for Cadence.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the scheduler engine and the command-line adapters.

pub mod cancel;
pub mod context;
pub mod dag;
pub mod error;
pub mod ids;
pub mod pipeline;
pub mod ports;
pub mod result;
pub mod template;

pub use cancel::CancelFlag;
pub use context::{Branch, ExecutionContext};
pub use dag::DagError;
pub use error::{Error, JobError, ParamError, Result, StageError};
pub use ids::RunId;
pub use pipeline::{
    Job, Param, ParamKind, Pipeline, PipelineBuilder, ScheduleEntry, ScheduleSpec, Strategy,
};
pub use ports::{ChunkSubmitter, ReleaseLog, ReleaseRecord, Stage};
pub use result::{RunResult, Status};
