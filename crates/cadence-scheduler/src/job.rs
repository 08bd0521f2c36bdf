//! Job execution across strategy branches.
//!
//! Stages of one branch always run in declared order. Branches of one job
//! run sequentially or on a pool bounded by `max_parallel`, sharing a
//! [`CancelFlag`] that is checked before every stage.

use crate::config::JobConfig;
use crate::strategy::StrategyExpander;
use cadence_core::ids::branch_id;
use cadence_core::pipeline::Job;
use cadence_core::result::ERROR_MESSAGE_KEY;
use cadence_core::{Branch, CancelFlag, ExecutionContext, JobError, Result, RunResult, Status};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

/// Output key holding per-branch results of a fanned-out job.
pub const STRATEGIES_KEY: &str = "strategies";

/// Terminal state of one branch.
#[derive(Debug, Clone)]
pub enum BranchState {
    Completed,
    Failed(JobError),
    Cancelled,
}

/// Result of running one branch of a job.
#[derive(Debug, Clone)]
pub struct BranchOutcome {
    pub matrix: Branch,
    /// Outputs of the stages that finished before the branch ended.
    pub stages: Map<String, Value>,
    pub state: BranchState,
}

impl BranchOutcome {
    fn cancelled(matrix: Branch) -> Self {
        Self {
            matrix,
            stages: Map::new(),
            state: BranchState::Cancelled,
        }
    }

    /// A branch that produced no usable result in time.
    fn timed_out(job: &str, matrix: Branch, limit: Duration) -> Self {
        Self {
            matrix,
            stages: Map::new(),
            state: BranchState::Failed(JobError::new(
                job,
                format!("TimeoutError: branch result not ready within {}s", limit.as_secs()),
            )),
        }
    }

    fn crashed(job: &str, matrix: Branch, reason: impl std::fmt::Display) -> Self {
        Self {
            matrix,
            stages: Map::new(),
            state: BranchState::Failed(JobError::new(job, format!("branch task crashed: {}", reason))),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, BranchState::Failed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.state, BranchState::Cancelled)
    }

    fn error_message(&self) -> Option<String> {
        match &self.state {
            BranchState::Failed(err) => Some(err.to_string()),
            _ => None,
        }
    }
}

/// Executor for a single job.
#[derive(Debug, Clone, Default)]
pub struct JobExecutor {
    config: JobConfig,
    expander: StrategyExpander,
}

impl JobExecutor {
    pub fn new(config: JobConfig) -> Self {
        Self {
            config,
            expander: StrategyExpander::new(),
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Run the job's stages for one branch against a private copy of `ctx`.
    pub async fn execute_branch(
        &self,
        job: &Job,
        branch: &Branch,
        ctx: &ExecutionContext,
        cancel: &CancelFlag,
    ) -> BranchOutcome {
        run_branch(job, branch, ctx, cancel).await
    }

    /// Run every branch of `job` and aggregate the outcomes.
    pub async fn execute(&self, job: &Job, ctx: &ExecutionContext) -> Result<RunResult> {
        self.execute_with_cancel(job, ctx, CancelFlag::new()).await
    }

    /// Like [`JobExecutor::execute`] with a caller-owned cancellation flag.
    ///
    /// Fails only when the strategy cannot be expanded. Branch failures are
    /// reported through the returned status.
    pub async fn execute_with_cancel(
        &self,
        job: &Job,
        ctx: &ExecutionContext,
        cancel: CancelFlag,
    ) -> Result<RunResult> {
        let branches = self.expander.expand(&job.strategy)?;
        let max_parallel = job.strategy.max_parallel.max(1);

        info!(
            job = %job.id,
            run_id = %job.run_id,
            branches = branches.len(),
            max_parallel,
            fail_fast = job.strategy.fail_fast,
            "Executing job"
        );

        let outcomes = if branches.len() == 1 || max_parallel == 1 {
            self.execute_sequential(job, branches, ctx, &cancel).await
        } else if job.strategy.fail_fast {
            self.execute_fail_fast(job, branches, ctx, &cancel, max_parallel)
                .await
        } else {
            self.execute_all_completed(job, branches, ctx, &cancel, max_parallel)
                .await
        };

        let result = shape_outcomes(outcomes).with_run_id(job.run_id);
        match result.status {
            Status::Success => info!(job = %job.id, "Job completed"),
            status => warn!(job = %job.id, status = ?status, "Job did not complete cleanly"),
        }
        Ok(result)
    }

    async fn execute_sequential(
        &self,
        job: &Job,
        branches: Vec<Branch>,
        ctx: &ExecutionContext,
        cancel: &CancelFlag,
    ) -> Vec<BranchOutcome> {
        let mut outcomes = Vec::with_capacity(branches.len());
        for branch in branches {
            if cancel.is_cancelled() {
                outcomes.push(BranchOutcome::cancelled(branch));
                continue;
            }
            let outcome = run_branch(job, &branch, ctx, cancel).await;
            if outcome.is_failed() && job.strategy.fail_fast {
                cancel.cancel();
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Wait for every branch or the first failure, bounded by the
    /// fail-fast ceiling. The first failure aborts the remaining branch
    /// tasks; branches that had not finished by then report as cancelled.
    async fn execute_fail_fast(
        &self,
        job: &Job,
        branches: Vec<Branch>,
        ctx: &ExecutionContext,
        cancel: &CancelFlag,
        max_parallel: usize,
    ) -> Vec<BranchOutcome> {
        let (mut set, index_of) = spawn_branches(job, &branches, ctx, cancel, max_parallel, None);
        let mut outcomes: Vec<Option<BranchOutcome>> = vec![None; branches.len()];
        let deadline = Instant::now() + self.config.fail_fast_ceiling;
        let mut ceiling_hit = false;

        loop {
            match timeout_at(deadline, set.join_next_with_id()).await {
                Ok(Some(Ok((id, outcome)))) => {
                    let failed = outcome.is_failed();
                    if let Some(&index) = index_of.get(&id) {
                        outcomes[index] = Some(outcome);
                    }
                    if failed {
                        warn!(job = %job.id, running = set.len(), "Branch failed, aborting remaining branches");
                        cancel.cancel();
                        set.abort_all();
                    }
                }
                Ok(Some(Err(err))) if err.is_cancelled() => {
                    debug!(job = %job.id, "Branch task aborted");
                }
                Ok(Some(Err(err))) => {
                    cancel.cancel();
                    set.abort_all();
                    if let Some(&index) = index_of.get(&err.id()) {
                        outcomes[index] =
                            Some(BranchOutcome::crashed(&job.id, branches[index].clone(), &err));
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        job = %job.id,
                        ceiling_secs = self.config.fail_fast_ceiling.as_secs(),
                        "Fail-fast ceiling reached, aborting unfinished branches"
                    );
                    cancel.cancel();
                    set.abort_all();
                    ceiling_hit = true;
                    break;
                }
            }
        }

        outcomes
            .into_iter()
            .zip(branches)
            .map(|(outcome, branch)| match outcome {
                Some(outcome) => outcome,
                None if ceiling_hit => {
                    BranchOutcome::timed_out(&job.id, branch, self.config.fail_fast_ceiling)
                }
                None => BranchOutcome::cancelled(branch),
            })
            .collect()
    }

    /// Wait for every branch. Each branch is bounded by its own timeout and
    /// a failure never stops its siblings.
    async fn execute_all_completed(
        &self,
        job: &Job,
        branches: Vec<Branch>,
        ctx: &ExecutionContext,
        cancel: &CancelFlag,
        max_parallel: usize,
    ) -> Vec<BranchOutcome> {
        let (mut set, index_of) = spawn_branches(
            job,
            &branches,
            ctx,
            cancel,
            max_parallel,
            Some(self.config.branch_timeout),
        );
        let mut outcomes: Vec<Option<BranchOutcome>> = vec![None; branches.len()];

        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((id, outcome)) => {
                    if let Some(err) = outcome.error_message() {
                        warn!(job = %job.id, error = %err, "Branch failed");
                    }
                    if let Some(&index) = index_of.get(&id) {
                        outcomes[index] = Some(outcome);
                    }
                }
                Err(err) => {
                    if let Some(&index) = index_of.get(&err.id()) {
                        outcomes[index] =
                            Some(BranchOutcome::crashed(&job.id, branches[index].clone(), &err));
                    }
                }
            }
        }

        outcomes
            .into_iter()
            .zip(branches)
            .map(|(outcome, branch)| {
                outcome.unwrap_or_else(|| BranchOutcome::crashed(&job.id, branch, "no result"))
            })
            .collect()
    }
}

/// Spawn one task per branch. Each task holds a pool permit while it runs
/// and re-checks the flag once the permit is granted.
fn spawn_branches(
    job: &Job,
    branches: &[Branch],
    ctx: &ExecutionContext,
    cancel: &CancelFlag,
    max_parallel: usize,
    branch_timeout: Option<Duration>,
) -> (JoinSet<BranchOutcome>, HashMap<tokio::task::Id, usize>) {
    let semaphore = Arc::new(Semaphore::new(max_parallel));
    let mut set = JoinSet::new();
    let mut index_of = HashMap::with_capacity(branches.len());

    for (index, branch) in branches.iter().enumerate() {
        let semaphore = semaphore.clone();
        let job = job.clone();
        let branch = branch.clone();
        let ctx = ctx.clone();
        let cancel = cancel.clone();

        let handle = set.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return BranchOutcome::cancelled(branch);
            };
            if cancel.is_cancelled() {
                debug!(job = %job.id, "Branch cancelled before start");
                return BranchOutcome::cancelled(branch);
            }
            match branch_timeout {
                Some(limit) => match timeout(limit, run_branch(&job, &branch, &ctx, &cancel)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(job = %job.id, limit_secs = limit.as_secs(), "Branch timed out");
                        BranchOutcome::timed_out(&job.id, branch, limit)
                    }
                },
                None => run_branch(&job, &branch, &ctx, &cancel).await,
            }
        });
        index_of.insert(handle.id(), index);
    }

    (set, index_of)
}

async fn run_branch(
    job: &Job,
    branch: &Branch,
    ctx: &ExecutionContext,
    cancel: &CancelFlag,
) -> BranchOutcome {
    let mut scoped = ctx.for_branch(branch);

    for stage in &job.stages {
        if cancel.is_cancelled() {
            debug!(job = %job.id, stage = stage.id(), "Branch cancelled between stages");
            return BranchOutcome {
                matrix: branch.clone(),
                stages: scoped.stages,
                state: BranchState::Cancelled,
            };
        }
        if stage.is_skipped(&scoped) {
            debug!(job = %job.id, stage = stage.id(), "Stage skipped");
            continue;
        }

        debug!(job = %job.id, stage = stage.id(), name = stage.name(), "Running stage");
        match stage.execute(&scoped).await {
            Ok(output) => scoped.set_stage_output(stage.id(), output),
            Err(err) => {
                warn!(job = %job.id, stage = stage.id(), error = %err, "Stage failed");
                return BranchOutcome {
                    matrix: branch.clone(),
                    stages: scoped.stages,
                    state: BranchState::Failed(JobError::from_stage(&job.id, &err)),
                };
            }
        }
    }

    BranchOutcome {
        matrix: branch.clone(),
        stages: scoped.stages,
        state: BranchState::Completed,
    }
}

/// Fold branch outcomes into the job result.
///
/// A single branch yields its stage outputs directly; several branches are
/// nested under [`STRATEGIES_KEY`] keyed by branch id.
fn shape_outcomes(outcomes: Vec<BranchOutcome>) -> RunResult {
    let status = if outcomes.iter().any(BranchOutcome::is_failed) {
        Status::Failure
    } else if outcomes.iter().any(BranchOutcome::is_cancelled) {
        Status::Cancelled
    } else {
        Status::Success
    };

    if let [single] = outcomes.as_slice() {
        let mut context = single.stages.clone();
        if let Some(message) = single.error_message() {
            context.insert(ERROR_MESSAGE_KEY.to_string(), Value::String(message));
        }
        if single.is_cancelled() {
            context.insert("cancelled".to_string(), Value::Bool(true));
        }
        return RunResult::new(status, context);
    }

    let mut strategies = Map::new();
    for outcome in outcomes {
        let id = branch_id(&outcome.matrix);
        let error = outcome.error_message();
        let cancelled = outcome.is_cancelled();

        let mut entry = Map::new();
        entry.insert("matrix".to_string(), Value::Object(outcome.matrix));
        entry.insert("stages".to_string(), Value::Object(outcome.stages));
        if let Some(message) = error {
            entry.insert(ERROR_MESSAGE_KEY.to_string(), Value::String(message));
        }
        if cancelled {
            entry.insert("cancelled".to_string(), Value::Bool(true));
        }
        strategies.insert(id, Value::Object(entry));
    }

    let mut context = Map::new();
    context.insert(STRATEGIES_KEY.to_string(), Value::Object(strategies));
    RunResult::new(status, context)
}
