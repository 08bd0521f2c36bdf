//! Pipeline execution and release scheduling for Cadence.

pub mod config;
pub mod controller;
pub mod executor;
pub mod fanout;
pub mod job;
pub mod log;
pub mod release;
pub mod schedule;
pub mod strategy;

pub use config::{ControllerConfig, EngineConfig, JobConfig, PipelineConfig, ReleaseConfig};
pub use controller::{ControllerReport, WorkflowController};
pub use executor::PipelineExecutor;
pub use fanout::{InProcessSubmitter, fan_out};
pub use job::JobExecutor;
pub use log::MemoryReleaseLog;
pub use release::{ReleaseBook, ReleaseOutcome, ReleaseScheduler, ReleaseSlots, ReleaseTarget};
pub use schedule::{Clock, Schedule};
pub use strategy::StrategyExpander;
