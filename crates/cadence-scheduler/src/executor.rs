//! Dependency-ordered pipeline execution.
//!
//! Jobs sit in a FIFO queue. A job whose `needs` are not all recorded in
//! the context goes back to the end of the queue, and the executor backs
//! off for one poll interval before looking again. Job results are merged
//! into the context only on the driving loop, so dependents always observe
//! fully merged outputs.

use crate::config::{EngineConfig, JobConfig, PipelineConfig};
use crate::job::{JobExecutor, STRATEGIES_KEY};
use cadence_core::pipeline::{Job, Pipeline};
use cadence_core::result::ERROR_MESSAGE_KEY;
use cadence_core::{CancelFlag, Error, ExecutionContext, JobError, Result, RunResult};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info};

/// Executor for one validated pipeline.
#[derive(Debug)]
pub struct PipelineExecutor {
    pipeline: Pipeline,
    jobs: JobExecutor,
    config: PipelineConfig,
}

impl PipelineExecutor {
    pub fn new(pipeline: Pipeline, config: &EngineConfig) -> Result<Self> {
        Self::with_config(pipeline, config.job.clone(), config.pipeline.clone())
    }

    pub fn with_config(
        pipeline: Pipeline,
        job_config: JobConfig,
        config: PipelineConfig,
    ) -> Result<Self> {
        Ok(Self {
            pipeline,
            jobs: JobExecutor::new(job_config),
            config,
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validate and coerce input parameters into a fresh context.
    pub fn parameterize(&self, input: &Map<String, Value>) -> Result<ExecutionContext> {
        Ok(self.pipeline.parameterize(input)?)
    }

    /// Execute every job of the pipeline.
    ///
    /// Never fails: wiring errors, timeouts and job failures are embedded
    /// in the returned context under `error_message` with a failure status.
    /// `limit` defaults to the configured pipeline timeout.
    pub async fn execute(&self, mut ctx: ExecutionContext, limit: Option<Duration>) -> RunResult {
        let instance = self.pipeline.fresh();
        let limit = limit.unwrap_or(self.config.timeout);

        info!(
            pipeline = %instance.name(),
            run_id = %instance.run_id(),
            jobs = instance.jobs().len(),
            worker = self.config.worker,
            "Executing pipeline"
        );

        let outcome = if self.config.worker <= 1 {
            self.run_sequential(&instance, &mut ctx, limit).await
        } else {
            self.run_threaded(&instance, &mut ctx, limit).await
        };

        let mut context = Map::new();
        context.insert("params".to_string(), Value::Object(ctx.params));
        context.insert("jobs".to_string(), Value::Object(ctx.jobs));

        let result = match outcome {
            Ok(()) => {
                info!(pipeline = %instance.name(), run_id = %instance.run_id(), "Pipeline completed");
                RunResult::success(context)
            }
            Err(err) => {
                error!(
                    pipeline = %instance.name(),
                    run_id = %instance.run_id(),
                    error = %err,
                    "Pipeline failed"
                );
                context.insert(
                    ERROR_MESSAGE_KEY.to_string(),
                    Value::String(format!("{}: {}", err.kind(), err)),
                );
                RunResult::failure(context)
            }
        };
        result.with_run_id(instance.run_id())
    }

    async fn run_sequential(
        &self,
        pipeline: &Pipeline,
        ctx: &mut ExecutionContext,
        limit: Duration,
    ) -> Result<()> {
        let start = Instant::now();
        let mut queue: VecDeque<&Job> = pipeline.jobs().iter().collect();

        while let Some(job) = queue.pop_front() {
            let remaining = remaining(start, limit, pipeline)?;
            if !is_ready(job, ctx) {
                debug!(job = %job.id, "Dependencies pending, requeueing");
                queue.push_back(job);
                sleep(self.config.poll_interval.min(remaining)).await;
                continue;
            }

            let instance = job.with_run_id(cadence_core::RunId::new());
            let result = timeout(remaining, self.jobs.execute(&instance, ctx))
                .await
                .map_err(|_| timeout_error(limit, pipeline))??;
            merge(ctx, job, result)?;
        }
        Ok(())
    }

    async fn run_threaded(
        &self,
        pipeline: &Pipeline,
        ctx: &mut ExecutionContext,
        limit: Duration,
    ) -> Result<()> {
        let start = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.config.worker));
        let mut queue: VecDeque<&Job> = pipeline.jobs().iter().collect();
        let mut set: JoinSet<(Job, Result<RunResult>)> = JoinSet::new();
        let mut flags: Vec<CancelFlag> = Vec::new();

        let outcome = loop {
            let remaining = match remaining(start, limit, pipeline) {
                Ok(remaining) => remaining,
                Err(err) => break Err(err),
            };

            for _ in 0..queue.len() {
                let Some(job) = queue.pop_front() else { break };
                if !is_ready(job, ctx) {
                    queue.push_back(job);
                    continue;
                }

                let instance = job.with_run_id(cadence_core::RunId::new());
                let executor = self.jobs.clone();
                let job_ctx = ctx.clone();
                let semaphore = semaphore.clone();
                let cancel = CancelFlag::new();
                flags.push(cancel.clone());

                debug!(job = %instance.id, run_id = %instance.run_id, "Dispatching job");
                set.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        let err = Error::Internal("job pool closed".to_string());
                        return (instance, Err(err));
                    };
                    let result = executor.execute_with_cancel(&instance, &job_ctx, cancel).await;
                    (instance, result)
                });
            }

            if queue.is_empty() && set.is_empty() {
                break Ok(());
            }

            match timeout(self.config.poll_interval.min(remaining), set.join_next()).await {
                Ok(Some(Ok((job, result)))) => {
                    if let Err(err) = result.and_then(|result| merge(ctx, &job, result)) {
                        break Err(err);
                    }
                }
                Ok(Some(Err(join_err))) => {
                    break Err(Error::Internal(format!("job task crashed: {}", join_err)));
                }
                Ok(None) => sleep(self.config.poll_interval.min(remaining)).await,
                Err(_) => debug!(pending = queue.len(), running = set.len(), "Waiting on jobs"),
            }
        };

        if outcome.is_err() {
            for flag in &flags {
                flag.cancel();
            }
            set.abort_all();
        }
        outcome
    }
}

fn is_ready(job: &Job, ctx: &ExecutionContext) -> bool {
    job.needs.iter().all(|need| ctx.has_job(need))
}

fn remaining(start: Instant, limit: Duration, pipeline: &Pipeline) -> Result<Duration> {
    limit
        .checked_sub(start.elapsed())
        .filter(|left| !left.is_zero())
        .ok_or_else(|| timeout_error(limit, pipeline))
}

fn timeout_error(limit: Duration, pipeline: &Pipeline) -> Error {
    Error::Timeout {
        seconds: limit.as_secs(),
        context: format!("execution of pipeline {:?}", pipeline.name()),
    }
}

/// Record a finished job. A job that did not succeed aborts the pipeline.
fn merge(ctx: &mut ExecutionContext, job: &Job, result: RunResult) -> Result<()> {
    let success = result.is_success();
    let message = failure_message(&result);
    ctx.record_job(job.id.clone(), Value::Object(result.context));

    if success {
        debug!(job = %job.id, "Job merged into context");
        Ok(())
    } else {
        Err(JobError::new(&job.id, message).into())
    }
}

fn failure_message(result: &RunResult) -> String {
    if let Some(message) = result.error_message() {
        return message.to_string();
    }
    let Some(strategies) = result.context.get(STRATEGIES_KEY).and_then(Value::as_object) else {
        return format!("finished with status {:?}", result.status);
    };

    let errors: Vec<&str> = strategies
        .values()
        .filter_map(|entry| entry.get(ERROR_MESSAGE_KEY).and_then(Value::as_str))
        .collect();
    match errors.first() {
        Some(first) => format!("{} of {} branches failed; first: {}", errors.len(), strategies.len(), first),
        None => format!("finished with status {:?}", result.status),
    }
}
