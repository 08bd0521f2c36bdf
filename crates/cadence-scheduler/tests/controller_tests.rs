//! Controller and fan-out tests.

use async_trait::async_trait;
use cadence_core::{ChunkSubmitter, Error, ExecutionContext, Job, Pipeline, ScheduleSpec, Stage, StageError};
use cadence_scheduler::{
    Clock, ControllerConfig, EngineConfig, InProcessSubmitter, MemoryReleaseLog, ReleaseConfig,
    ReleaseScheduler, ReleaseTarget, Schedule, WorkflowController, fan_out,
};
use chrono::{DateTime, TimeZone, Utc};
use futures::FutureExt;
use pretty_assertions::assert_eq;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

struct Noop;

#[async_trait]
impl Stage for Noop {
    fn id(&self) -> &str {
        "noop"
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> Result<Value, StageError> {
        Ok(Value::Null)
    }
}

fn registry() -> Arc<HashMap<String, Arc<Pipeline>>> {
    let pipelines = ["alpha", "beta", "gamma", "delta", "epsilon"]
        .into_iter()
        .map(|name| {
            let pipeline = Pipeline::builder(name)
                .schedule(ScheduleSpec::new("0 0 1 1 *"))
                .schedule(ScheduleSpec::new("30 12 * * 1").with_timezone("Europe/Paris"))
                .job(Job::new("only").with_stage(Arc::new(Noop)))
                .build()
                .unwrap();
            (name.to_string(), Arc::new(pipeline))
        })
        .collect();
    Arc::new(pipelines)
}

fn engine() -> EngineConfig {
    EngineConfig {
        controller: ControllerConfig::default().with_drain_poll(Duration::from_millis(10)),
        ..Default::default()
    }
}

/// Runs one controller per chunk, skipping names it does not know.
fn controller_submitter(pipelines: Arc<HashMap<String, Arc<Pipeline>>>) -> Arc<dyn ChunkSubmitter> {
    Arc::new(InProcessSubmitter::new(move |chunk, stop| {
        let pipelines = pipelines.clone();
        async move {
            let mut targets = Vec::new();
            for name in &chunk {
                if let Some(pipeline) = pipelines.get(name) {
                    targets.extend(ReleaseTarget::from_pipeline(pipeline.clone(), &Map::new())?);
                }
            }
            let scheduler = Arc::new(ReleaseScheduler::new(engine(), Arc::new(MemoryReleaseLog::new())));
            let report = WorkflowController::new(targets, scheduler)?.run(Some(stop)).await?;
            Ok(report.scheduled)
        }
        .boxed()
    }))
}

#[tokio::test]
async fn test_fan_out_runs_one_controller_per_chunk() {
    let names: Vec<String> = ["epsilon", "alpha", "ghost", "delta", "beta", "gamma"]
        .into_iter()
        .map(String::from)
        .collect();
    let stop = Utc::now() - chrono::Duration::seconds(1);

    let scheduled = fan_out(names, 2, 2, stop, controller_submitter(registry()))
        .await
        .unwrap();

    assert_eq!(scheduled, vec!["alpha", "beta", "delta", "epsilon", "gamma"]);
}

#[tokio::test]
async fn test_controller_report_lists_every_pipeline_once() {
    let pipelines = registry();
    let mut targets = Vec::new();
    for pipeline in pipelines.values() {
        targets.extend(ReleaseTarget::from_pipeline(pipeline.clone(), &Map::new()).unwrap());
    }
    assert_eq!(targets.len(), 10);

    let scheduler = Arc::new(ReleaseScheduler::new(engine(), Arc::new(MemoryReleaseLog::new())));
    let controller = WorkflowController::new(targets, scheduler.clone()).unwrap();
    let report = controller
        .run(Some(Utc::now() - chrono::Duration::seconds(1)))
        .await
        .unwrap();

    let mut scheduled = report.scheduled.clone();
    scheduled.sort();
    assert_eq!(scheduled, vec!["alpha", "beta", "delta", "epsilon", "gamma"]);
    assert_eq!(report.fired, 0);

    let book = scheduler.book().snapshot().await;
    assert_eq!(book.len(), 5);
    assert!(book.values().all(|slots| slots.queue.len() == 2 && slots.running.is_empty()));
}

#[tokio::test]
async fn test_failing_chunk_surfaces_submit_error() {
    let submitter: Arc<dyn ChunkSubmitter> = Arc::new(InProcessSubmitter::new(|_chunk, _stop| {
        async { Err(Error::Submit("worker exited with status 101".to_string())) }.boxed()
    }));

    let err = fan_out(vec!["alpha".to_string()], 1, 1, Utc::now(), submitter)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("status 101"));
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
}

fn minutes(n: i64) -> chrono::Duration {
    chrono::Duration::minutes(n)
}

fn every_minute() -> ReleaseTarget {
    let pipeline = Pipeline::builder("etl")
        .job(Job::new("only").with_stage(Arc::new(Noop)))
        .build()
        .unwrap();
    ReleaseTarget::new(
        Arc::new(pipeline),
        Schedule::new("* * * * *", "UTC").unwrap(),
        Map::new(),
    )
}

fn clocked_scheduler(clock: Clock, log: Arc<MemoryReleaseLog>) -> Arc<ReleaseScheduler> {
    let engine = EngineConfig {
        controller: ControllerConfig::default()
            .with_sweep_interval(Duration::from_secs(30))
            .with_drain_poll(Duration::from_secs(1)),
        release: ReleaseConfig::default().with_settle_delay(Duration::from_millis(10)),
        ..Default::default()
    };
    Arc::new(ReleaseScheduler::new(engine, log).with_clock(clock))
}

async fn queue(scheduler: &ReleaseScheduler) -> BTreeSet<DateTime<Utc>> {
    scheduler.book().slots("etl").await.lock().await.queue.clone()
}

/// Advance paused time to `at` on `clock`.
async fn advance_to(clock: &Clock, at: DateTime<Utc>) {
    tokio::time::advance((at - clock.now()).to_std().unwrap()).await;
}

async fn wait_for_releases(controller: &mut WorkflowController) {
    for _ in 0..100 {
        controller.sweep().await;
        if controller.task_names().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("releases still running: {:?}", controller.task_names());
}

#[tokio::test(start_paused = true)]
async fn test_pair_fires_on_consecutive_minutes() {
    let clock = Clock::starting_at(t0() + chrono::Duration::seconds(30));
    let log = Arc::new(MemoryReleaseLog::new());
    let scheduler = clocked_scheduler(clock, log.clone());
    let mut controller = WorkflowController::new(vec![every_minute()], scheduler.clone()).unwrap();

    controller.seed(clock.now()).await;
    assert_eq!(queue(&scheduler).await, BTreeSet::from([t0() + minutes(1)]));

    advance_to(&clock, t0() + minutes(1) + chrono::Duration::seconds(2)).await;
    let fired = controller.tick(clock.now()).await;
    assert_eq!(fired, vec!["etl|* * * * *|202405010801".to_string()]);
    assert!(queue(&scheduler).await.is_empty());

    wait_for_releases(&mut controller).await;
    assert_eq!(queue(&scheduler).await, BTreeSet::from([t0() + minutes(2)]));
    let records = log.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].release, t0() + minutes(1));

    advance_to(&clock, t0() + minutes(2) + chrono::Duration::seconds(2)).await;
    let fired = controller.tick(clock.now()).await;
    assert_eq!(fired, vec!["etl|* * * * *|202405010802".to_string()]);

    wait_for_releases(&mut controller).await;
    assert_eq!(queue(&scheduler).await, BTreeSet::from([t0() + minutes(3)]));
    let releases: Vec<_> = log.records().await.iter().map(|r| r.release).collect();
    assert_eq!(releases, vec![t0() + minutes(1), t0() + minutes(2)]);
    assert!(controller.halted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_run_releases_every_minute_until_stop() {
    let clock = Clock::starting_at(t0() + chrono::Duration::seconds(30));
    let log = Arc::new(MemoryReleaseLog::new());
    let scheduler = clocked_scheduler(clock, log.clone());
    let controller = WorkflowController::new(vec![every_minute()], scheduler.clone()).unwrap();

    let report = controller
        .run(Some(t0() + minutes(3) + chrono::Duration::seconds(30)))
        .await
        .unwrap();

    assert_eq!(report.scheduled, vec!["etl".to_string()]);
    assert_eq!(report.fired, 3);
    assert!(report.halted.is_empty());

    let releases: Vec<_> = log.records().await.iter().map(|r| r.release).collect();
    assert_eq!(releases, vec![t0() + minutes(1), t0() + minutes(2), t0() + minutes(3)]);
    assert_eq!(queue(&scheduler).await, BTreeSet::from([t0() + minutes(4)]));
}
