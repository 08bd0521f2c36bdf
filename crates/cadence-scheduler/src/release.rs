//! Release scheduling for one pipeline and one of its schedules.
//!
//! A release moves through three steps: arm (pick the next free fire time
//! and either park it in the queue or mark it running), wait (coarse sleeps
//! followed by one precise sleep), and fire (execute a fresh pipeline
//! instance and persist the result). Queued and running fire times live in
//! a [`ReleaseBook`] shared by every pair of the same pipeline.

use crate::config::EngineConfig;
use crate::executor::PipelineExecutor;
use crate::schedule::{Clock, Schedule, minute_floor};
use cadence_core::pipeline::{Pipeline, RELEASE_KEY, ScheduleEntry};
use cadence_core::ports::{ReleaseLog, ReleaseRecord};
use cadence_core::{Error, Result, RunResult, template};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::join_all;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Upper bound on occurrences inspected when looking for a free fire time.
const MAX_CANDIDATES: usize = 1024;

/// A pipeline paired with one of its schedules.
#[derive(Debug, Clone)]
pub struct ReleaseTarget {
    pipeline: Arc<Pipeline>,
    schedule: Schedule,
    params: Map<String, Value>,
}

impl ReleaseTarget {
    pub fn new(pipeline: Arc<Pipeline>, schedule: Schedule, params: Map<String, Value>) -> Self {
        Self {
            pipeline,
            schedule,
            params,
        }
    }

    /// One target per schedule declared on the pipeline.
    pub fn from_pipeline(pipeline: Arc<Pipeline>, params: &Map<String, Value>) -> Result<Vec<Self>> {
        pipeline
            .on()
            .iter()
            .map(|spec| Ok(Self::new(pipeline.clone(), Schedule::from_spec(spec)?, params.clone())))
            .collect()
    }

    /// Targets for a scheduling entry, preferring the entry's own schedules.
    pub fn from_entry(pipeline: Arc<Pipeline>, entry: &ScheduleEntry) -> Result<Vec<Self>> {
        let Some(on) = &entry.on else {
            return Self::from_pipeline(pipeline, &entry.params);
        };
        on.iter()
            .map(|spec| {
                Ok(Self::new(
                    pipeline.clone(),
                    Schedule::from_spec(spec)?,
                    entry.params.clone(),
                ))
            })
            .collect()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn name(&self) -> &str {
        self.pipeline.name()
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// Identity of the pair, `"{pipeline}|{cron}"`.
    pub fn key(&self) -> String {
        format!("{}|{}", self.pipeline.name(), self.schedule.expression())
    }
}

/// Pending and in-flight fire times of one pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReleaseSlots {
    pub queue: BTreeSet<DateTime<Utc>>,
    pub running: BTreeSet<DateTime<Utc>>,
}

impl ReleaseSlots {
    pub fn contains(&self, at: &DateTime<Utc>) -> bool {
        self.queue.contains(at) || self.running.contains(at)
    }

    /// Earliest queued fire time.
    pub fn head(&self) -> Option<DateTime<Utc>> {
        self.queue.first().copied()
    }

    /// Queued and running times, ascending.
    pub fn taken(&self) -> Vec<DateTime<Utc>> {
        self.queue.union(&self.running).copied().collect()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.running.is_empty()
    }
}

/// Per-pipeline release slots, owned by one controller or poke call.
#[derive(Debug, Default)]
pub struct ReleaseBook {
    pipelines: Mutex<HashMap<String, Arc<Mutex<ReleaseSlots>>>>,
}

impl ReleaseBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slots of `pipeline`, created empty on first use.
    pub async fn slots(&self, pipeline: &str) -> Arc<Mutex<ReleaseSlots>> {
        self.pipelines
            .lock()
            .await
            .entry(pipeline.to_string())
            .or_default()
            .clone()
    }

    /// Copy of every pipeline's slots.
    pub async fn snapshot(&self) -> BTreeMap<String, ReleaseSlots> {
        let pipelines = self.pipelines.lock().await;
        let mut out = BTreeMap::new();
        for (name, slots) in pipelines.iter() {
            out.insert(name.clone(), slots.lock().await.clone());
        }
        out
    }
}

/// Result of one release attempt.
#[derive(Debug, Clone)]
pub enum ReleaseOutcome {
    /// The next fire time is outside the waiting window and was queued.
    Parked { next: DateTime<Utc> },
    /// The pipeline ran for the logical time `release`.
    Released {
        release: DateTime<Utc>,
        result: RunResult,
    },
    /// Arming or firing failed; the pair must not be re-armed.
    Halted { reason: String },
}

impl ReleaseOutcome {
    pub fn is_halted(&self) -> bool {
        matches!(self, ReleaseOutcome::Halted { .. })
    }
}

enum Armed {
    Parked(DateTime<Utc>),
    Ready(DateTime<Utc>),
}

/// Scheduler running releases for pipeline × schedule pairs.
pub struct ReleaseScheduler {
    config: EngineConfig,
    book: Arc<ReleaseBook>,
    log: Arc<dyn ReleaseLog>,
    clock: Clock,
}

impl ReleaseScheduler {
    pub fn new(config: EngineConfig, log: Arc<dyn ReleaseLog>) -> Self {
        Self {
            config,
            book: Arc::new(ReleaseBook::new()),
            log,
            clock: Clock::system(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn with_book(mut self, book: Arc<ReleaseBook>) -> Self {
        self.book = book;
        self
    }

    pub fn book(&self) -> &Arc<ReleaseBook> {
        &self.book
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// First occurrence at or after `from` that is neither queued nor
    /// running and that the log does not already point at.
    pub async fn next_fire(
        &self,
        target: &ReleaseTarget,
        from: DateTime<Utc>,
        slots: &ReleaseSlots,
    ) -> Result<DateTime<Utc>> {
        let taken = slots.taken();
        for candidate in target.schedule.upcoming(from).take(MAX_CANDIDATES) {
            if slots.contains(&candidate) {
                continue;
            }
            if self.log.is_pointed(target.name(), candidate, &taken).await? {
                debug!(pipeline = %target.name(), release = %candidate, "Release already pointed");
                continue;
            }
            return Ok(candidate);
        }
        Err(Error::Cron {
            expression: target.schedule.expression().to_string(),
            message: format!("no free occurrence after {}", from),
        })
    }

    /// Release `target` for the current minute bucket or later.
    ///
    /// Never fails: errors while arming or firing are logged and reported
    /// as [`ReleaseOutcome::Halted`].
    pub async fn release(&self, target: &ReleaseTarget) -> ReleaseOutcome {
        self.release_at(target, self.clock.now()).await
    }

    /// Like [`ReleaseScheduler::release`], starting from the minute bucket
    /// containing `bucket` instead of the current one.
    pub async fn release_at(&self, target: &ReleaseTarget, bucket: DateTime<Utc>) -> ReleaseOutcome {
        self.release_in(&self.book, target, minute_floor(bucket)).await
    }

    /// Release every schedule of `pipeline` once, strictly after the
    /// current minute, sharing a private book between the schedules.
    pub async fn poke(
        &self,
        pipeline: Arc<Pipeline>,
        params: &Map<String, Value>,
    ) -> Result<Vec<ReleaseOutcome>> {
        let targets = ReleaseTarget::from_pipeline(pipeline, params)?;
        let book = ReleaseBook::new();
        let from = minute_floor(self.clock.now()) + chrono::Duration::minutes(1);

        info!(pipeline = %targets.first().map(|t| t.name()).unwrap_or_default(), schedules = targets.len(), "Poking pipeline");
        Ok(join_all(targets.iter().map(|target| self.release_in(&book, target, from))).await)
    }

    async fn release_in(
        &self,
        book: &ReleaseBook,
        target: &ReleaseTarget,
        from: DateTime<Utc>,
    ) -> ReleaseOutcome {
        let slots = book.slots(target.name()).await;

        let release = match self.arm(target, from, &slots).await {
            Ok(Armed::Parked(next)) => return ReleaseOutcome::Parked { next },
            Ok(Armed::Ready(at)) => at,
            Err(err) => {
                error!(pipeline = %target.name(), cron = %target.schedule, error = %err, "Failed to arm release");
                return ReleaseOutcome::Halted {
                    reason: format!("{}: {}", err.kind(), err),
                };
            }
        };

        self.wait_until(target, release).await;
        let fired = self.fire(target, release).await;

        let mut slots = slots.lock().await;
        slots.running.remove(&release);
        match fired {
            Ok(result) => {
                self.queue_following(target, release, &mut slots);
                ReleaseOutcome::Released { release, result }
            }
            Err(err) => {
                error!(
                    pipeline = %target.name(),
                    cron = %target.schedule,
                    release = %release,
                    error = %err,
                    "Release failed"
                );
                ReleaseOutcome::Halted {
                    reason: format!("{}: {}", err.kind(), err),
                }
            }
        }
    }

    async fn arm(
        &self,
        target: &ReleaseTarget,
        from: DateTime<Utc>,
        slots: &Mutex<ReleaseSlots>,
    ) -> Result<Armed> {
        let mut slots = slots.lock().await;
        let candidate = self.next_fire(target, from, &slots).await?;
        let distance = (candidate - self.clock.now()).to_std().unwrap_or_default();

        if distance > self.config.release.waiting_window {
            debug!(
                pipeline = %target.name(),
                cron = %target.schedule,
                release = %candidate,
                "Release not close enough, parking"
            );
            slots.queue.insert(candidate);
            return Ok(Armed::Parked(candidate));
        }

        debug!(pipeline = %target.name(), cron = %target.schedule, release = %candidate, "Release armed");
        slots.running.insert(candidate);
        Ok(Armed::Ready(candidate))
    }

    /// Sleep in coarse steps until within the final margin, then sleep the
    /// exact remainder plus the settle delay.
    async fn wait_until(&self, target: &ReleaseTarget, release: DateTime<Utc>) {
        let config = &self.config.release;
        loop {
            let remaining = (release - self.clock.now()).to_std().unwrap_or_default();
            if remaining <= config.final_margin {
                sleep(remaining).await;
                break;
            }
            debug!(
                pipeline = %target.name(),
                remaining_secs = remaining.as_secs(),
                "Sleeping until release"
            );
            sleep(config.coarse_sleep.min(remaining - config.final_margin).max(Duration::from_millis(1)))
                .await;
        }
        sleep(config.settle_delay).await;
    }

    async fn fire(&self, target: &ReleaseTarget, release: DateTime<Utc>) -> Result<RunResult> {
        let overlay = release_overlay(target, release);
        let mut params = match template::render(&Value::Object(target.params.clone()), &overlay)? {
            Value::Object(params) => params,
            other => {
                return Err(Error::Internal(format!(
                    "rendered parameters are not a mapping: {}",
                    other
                )));
            }
        };
        params.insert(RELEASE_KEY.to_string(), overlay[RELEASE_KEY].clone());

        let template_run = target.pipeline.run_id();
        let executor = PipelineExecutor::new(target.pipeline().clone(), &self.config)?;
        let ctx = executor.parameterize(&params)?;

        info!(
            pipeline = %target.name(),
            cron = %target.schedule,
            release = %release,
            parent_run_id = %template_run,
            "Releasing pipeline"
        );
        let result = executor
            .execute(ctx, None)
            .await
            .with_parent_run_id(template_run);

        self.log
            .save(&ReleaseRecord {
                pipeline: target.name().to_string(),
                cron: target.schedule.expression().to_string(),
                release,
                context: result.context.clone(),
                parent_run_id: result.parent_run_id,
                run_id: result.run_id,
            })
            .await?;

        info!(
            pipeline = %target.name(),
            release = %release,
            status = ?result.status,
            "Release finished"
        );
        Ok(result)
    }

    /// Queue the occurrence after `release`, skipping times already taken
    /// and times earlier than the minute the release finished in.
    fn queue_following(&self, target: &ReleaseTarget, release: DateTime<Utc>, slots: &mut ReleaseSlots) {
        let finished = minute_floor(self.clock.now());
        let following = target
            .schedule
            .upcoming(release + chrono::Duration::seconds(1))
            .take(MAX_CANDIDATES)
            .find(|at| !slots.contains(at) && *at >= finished);

        match following {
            Some(at) => {
                debug!(pipeline = %target.name(), cron = %target.schedule, next = %at, "Queued following release");
                slots.queue.insert(at);
            }
            None => warn!(pipeline = %target.name(), cron = %target.schedule, "No following release found"),
        }
    }
}

/// Parameters visible to templates of a release.
fn release_overlay(target: &ReleaseTarget, release: DateTime<Utc>) -> Value {
    let tz = target.schedule.timezone();
    json!({
        RELEASE_KEY: {
            "logical_date": release.with_timezone(&tz).to_rfc3339_opts(SecondsFormat::Secs, true),
            "cron": target.schedule.expression(),
            "timezone": tz.name(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReleaseConfig;
    use crate::log::MemoryReleaseLog;
    use async_trait::async_trait;
    use cadence_core::pipeline::{Job, ScheduleSpec};
    use cadence_core::ports::Stage;
    use cadence_core::{ExecutionContext, StageError, Status};
    use chrono::TimeZone;

    struct ParamsStage;

    #[async_trait]
    impl Stage for ParamsStage {
        fn id(&self) -> &str {
            "params"
        }

        async fn execute(&self, ctx: &ExecutionContext) -> std::result::Result<Value, StageError> {
            Ok(Value::Object(ctx.params.clone()))
        }
    }

    fn pipeline(crons: &[&str]) -> Arc<Pipeline> {
        let mut builder = Pipeline::builder("nightly").job(Job::new("A").with_stage(Arc::new(ParamsStage)));
        for cron in crons {
            builder = builder.schedule(ScheduleSpec::new(*cron));
        }
        Arc::new(builder.build().unwrap())
    }

    fn scheduler(log: Arc<MemoryReleaseLog>) -> ReleaseScheduler {
        let config = EngineConfig {
            release: ReleaseConfig::default().with_settle_delay(Duration::from_millis(10)),
            ..Default::default()
        };
        ReleaseScheduler::new(config, log)
    }

    fn target(crons: &[&str], params: Value) -> ReleaseTarget {
        let params = params.as_object().cloned().unwrap_or_default();
        ReleaseTarget::from_pipeline(pipeline(crons), &params)
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn test_next_fire_skips_taken_times() {
        let log = Arc::new(MemoryReleaseLog::new());
        let scheduler = scheduler(log.clone());
        let target = target(&["* * * * *"], json!({}));
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let minute = chrono::Duration::minutes(1);

        let mut slots = ReleaseSlots::default();
        slots.queue.insert(t0);
        slots.running.insert(t0 + minute);
        log.save(&ReleaseRecord {
            pipeline: "nightly".to_string(),
            cron: "* * * * *".to_string(),
            release: t0 + minute * 2,
            context: Map::new(),
            parent_run_id: None,
            run_id: None,
        })
        .await
        .unwrap();

        let next = scheduler.next_fire(&target, t0, &slots).await.unwrap();
        assert_eq!(next, t0 + minute * 3);
        assert!(!slots.contains(&next));
    }

    #[tokio::test]
    async fn test_far_release_is_parked_in_queue() {
        let scheduler = scheduler(Arc::new(MemoryReleaseLog::new()));
        let target = target(&["0 0 0 1 1 * 2099"], json!({}));

        let outcome = scheduler.release(&target).await;
        let ReleaseOutcome::Parked { next } = outcome else {
            panic!("expected parked, got {:?}", outcome);
        };

        let slots = scheduler.book().slots("nightly").await;
        let slots = slots.lock().await;
        assert_eq!(slots.head(), Some(next));
        assert!(slots.running.is_empty());
    }

    #[tokio::test]
    async fn test_release_fires_and_queues_following() {
        let log = Arc::new(MemoryReleaseLog::new());
        let scheduler = scheduler(log.clone());
        let target = target(
            &["* * * * *"],
            json!({"day": "${{ release.logical_date }}", "plain": 1}),
        );

        let outcome = scheduler.release(&target).await;
        let ReleaseOutcome::Released { release, result } = outcome else {
            panic!("expected released, got {:?}", outcome);
        };
        assert_eq!(result.status, Status::Success);
        assert_eq!(result.parent_run_id, Some(target.pipeline().run_id()));

        let params = &result.context["jobs"]["A"]["params"];
        let logical = release.to_rfc3339_opts(SecondsFormat::Secs, true);
        assert_eq!(params["day"], json!(logical));
        assert_eq!(params["plain"], json!(1));
        assert_eq!(params["release"]["cron"], json!("* * * * *"));

        let records = log.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].release, release);
        assert_eq!(records[0].run_id, result.run_id);

        let slots = scheduler.book().slots("nightly").await;
        let slots = slots.lock().await;
        assert!(slots.running.is_empty());
        assert!(slots.head().is_some_and(|next| next > release));
    }

    #[tokio::test]
    async fn test_firing_error_halts_without_rearming() {
        let scheduler = scheduler(Arc::new(MemoryReleaseLog::new()));
        let target = target(&["* * * * *"], json!({"x": "${{ nowhere.to.be.found }}"}));

        let outcome = scheduler.release(&target).await;
        match &outcome {
            ReleaseOutcome::Halted { reason } => assert!(reason.starts_with("ConfigurationError")),
            other => panic!("expected halted, got {:?}", other),
        }

        let slots = scheduler.book().slots("nightly").await;
        assert!(slots.lock().await.is_idle());
    }

    #[tokio::test]
    async fn test_poke_releases_every_schedule_with_private_book() {
        let scheduler = scheduler(Arc::new(MemoryReleaseLog::new()));
        let outcomes = scheduler
            .poke(pipeline(&["0 0 0 1 1 * 2099", "0 0 0 1 1 * 2098"]), &Map::new())
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| matches!(o, ReleaseOutcome::Parked { .. })));
        assert!(scheduler.book().snapshot().await.is_empty());
    }

    #[test]
    fn test_target_key_and_entry_override() {
        let pipeline = pipeline(&["*/5 * * * *"]);
        let entry = ScheduleEntry::new("nightly").with_schedules(vec![
            ScheduleSpec::new("0 1 * * *"),
            ScheduleSpec::new("0 2 * * *").with_timezone("Asia/Tokyo"),
        ]);

        let targets = ReleaseTarget::from_entry(pipeline.clone(), &entry).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].key(), "nightly|0 1 * * *");

        let defaults = ReleaseTarget::from_entry(pipeline, &ScheduleEntry::new("nightly")).unwrap();
        assert_eq!(defaults[0].key(), "nightly|*/5 * * * *");
    }
}
