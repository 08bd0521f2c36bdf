//! Fixed-cadence controller driving many release pairs.
//!
//! Once per minute, at a fixed offset past the minute, every pair whose
//! queue head equals the current minute bucket is released on its own task.
//! A slower sweep evicts finished tasks. Past the stop boundary no new
//! ticks are armed; in-flight releases are awaited, never aborted.

use crate::config::ControllerConfig;
use crate::release::{ReleaseOutcome, ReleaseScheduler, ReleaseTarget};
use crate::schedule::minute_floor;
use cadence_core::{Error, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep};
use tracing::{debug, error, info, warn};

/// Summary returned when a controller exits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerReport {
    /// Pipelines this controller was responsible for.
    pub scheduled: Vec<String>,
    /// Release tasks spawned.
    pub fired: usize,
    /// Pairs that stopped re-arming after a failed release.
    pub halted: Vec<String>,
}

struct ReleaseTask {
    key: String,
    handle: JoinHandle<ReleaseOutcome>,
}

/// Controller owning the release book and task map of a set of pairs.
pub struct WorkflowController {
    targets: Vec<ReleaseTarget>,
    scheduler: Arc<ReleaseScheduler>,
    config: ControllerConfig,
    timezone: Tz,
    tasks: HashMap<String, ReleaseTask>,
    halted: BTreeSet<String>,
    fired: usize,
}

impl WorkflowController {
    pub fn new(targets: Vec<ReleaseTarget>, scheduler: Arc<ReleaseScheduler>) -> Result<Self> {
        let config = scheduler.config().controller.clone();
        let timezone = config
            .timezone
            .parse::<Tz>()
            .map_err(|_| Error::Configuration(format!("unknown timezone {:?}", config.timezone)))?;

        Ok(Self {
            targets,
            scheduler,
            config,
            timezone,
            tasks: HashMap::new(),
            halted: BTreeSet::new(),
            fired: 0,
        })
    }

    pub fn targets(&self) -> &[ReleaseTarget] {
        &self.targets
    }

    /// Names of release tasks not yet swept.
    pub fn task_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn halted(&self) -> &BTreeSet<String> {
        &self.halted
    }

    /// Distinct pipeline names, in first-seen order.
    pub fn pipeline_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for target in &self.targets {
            if !names.iter().any(|n| n == target.name()) {
                names.push(target.name().to_string());
            }
        }
        names
    }

    /// Queue each pair's first occurrence at or after the minute following
    /// `start`, skipping times already queued for the same pipeline.
    pub async fn seed(&self, start: DateTime<Utc>) {
        let from = minute_floor(start) + chrono::Duration::minutes(1);
        for target in &self.targets {
            let slots = self.scheduler.book().slots(target.name()).await;
            let mut slots = slots.lock().await;
            match target.schedule().upcoming(from).find(|at| !slots.queue.contains(at)) {
                Some(at) => {
                    debug!(pipeline = %target.name(), cron = %target.schedule(), first = %at, "Seeded release queue");
                    slots.queue.insert(at);
                }
                None => warn!(pipeline = %target.name(), cron = %target.schedule(), "Schedule has no future occurrence"),
            }
        }
    }

    /// Run one tick for the minute bucket containing `now` and return the
    /// names of the release tasks spawned.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let bucket = minute_floor(now);
        let mut spawned = Vec::new();

        for target in &self.targets {
            let key = target.key();
            if self.halted.contains(&key) {
                continue;
            }

            let slots = self.scheduler.book().slots(target.name()).await;
            let mut slots = slots.lock().await;

            let stale: Vec<DateTime<Utc>> = slots
                .queue
                .iter()
                .filter(|at| **at < bucket && target.schedule().includes(**at))
                .copied()
                .collect();
            if !stale.is_empty() {
                warn!(pipeline = %target.name(), cron = %target.schedule(), missed = ?stale, "Dropping missed releases");
                for at in &stale {
                    slots.queue.remove(at);
                }
                if let Some(next) = target.schedule().upcoming(bucket).find(|at| !slots.contains(at)) {
                    slots.queue.insert(next);
                }
            }

            if slots.is_idle() {
                warn!(pipeline = %target.name(), cron = %target.schedule(), "Release queue is empty");
                continue;
            }
            if slots.head() != Some(bucket) || !target.schedule().includes(bucket) {
                debug!(pipeline = %target.name(), cron = %target.schedule(), bucket = %bucket, "Skipping schedule");
                continue;
            }
            slots.queue.remove(&bucket);
            drop(slots);

            let name = format!(
                "{}|{}",
                key,
                bucket.with_timezone(&self.timezone).format("%Y%m%d%H%M")
            );
            let scheduler = self.scheduler.clone();
            let task_target = target.clone();
            let handle = tokio::spawn(async move { scheduler.release_at(&task_target, bucket).await });

            info!(task = %name, "Spawned release task");
            self.tasks.insert(name.clone(), ReleaseTask { key, handle });
            self.fired += 1;
            spawned.push(name);
        }

        spawned
    }

    /// Evict finished release tasks and return how many were removed.
    /// Pairs whose release halted or panicked are never re-armed.
    pub async fn sweep(&mut self) -> usize {
        let finished: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();

        for name in &finished {
            let Some(task) = self.tasks.remove(name) else {
                continue;
            };
            match task.handle.await {
                Ok(ReleaseOutcome::Halted { reason }) => {
                    warn!(task = %name, reason = %reason, "Release halted, pair will not be re-armed");
                    self.halted.insert(task.key);
                }
                Ok(_) => debug!(task = %name, "Release task finished"),
                Err(err) => {
                    error!(task = %name, error = %err, "Release task crashed");
                    self.halted.insert(task.key);
                }
            }
        }
        finished.len()
    }

    /// Drive ticks until `stop` (or the configured stop distance from now),
    /// then wait for in-flight releases.
    pub async fn run(self, stop: Option<DateTime<Utc>>) -> Result<ControllerReport> {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        self.run_until(stop, shutdown_rx).await
    }

    /// Like [`WorkflowController::run`], also stopping when `shutdown`
    /// flips to `true`.
    pub async fn run_until(
        mut self,
        stop: Option<DateTime<Utc>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ControllerReport> {
        let clock = *self.scheduler.clock();
        let start = clock.now();
        let stop_after = chrono::Duration::from_std(self.config.stop_after)
            .map_err(|e| Error::Configuration(format!("controller.stop_after: {}", e)))?;
        let stop = stop.unwrap_or(start + stop_after);

        self.seed(start).await;
        info!(
            pipelines = ?self.pipeline_names(),
            pairs = self.targets.len(),
            stop = %stop,
            "Starting workflow controller"
        );

        let mut sweeper = interval_at(
            Instant::now() + self.config.sweep_interval,
            self.config.sweep_interval,
        );

        loop {
            if clock.now() > stop {
                info!("Stop boundary reached");
                break;
            }
            let wait = until_next_tick(clock.now(), self.config.tick_offset);
            tokio::select! {
                _ = sleep(wait) => {
                    let now = clock.now();
                    if now > stop {
                        info!("Stop boundary reached");
                        break;
                    }
                    self.tick(now).await;
                }
                _ = sweeper.tick() => {
                    let removed = self.sweep().await;
                    debug!(removed, running = self.tasks.len(), "Swept release tasks");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested");
                        break;
                    }
                }
            }
        }

        self.sweep().await;
        while !self.tasks.is_empty() {
            warn!(running = ?self.task_names(), "Waiting for in-flight releases");
            sleep(self.config.drain_poll).await;
            self.sweep().await;
        }

        for (pipeline, slots) in self.scheduler.book().snapshot().await {
            if !slots.is_idle() {
                warn!(pipeline = %pipeline, queue = ?slots.queue, running = ?slots.running, "Residual release slots");
            }
        }

        let report = ControllerReport {
            scheduled: self.pipeline_names(),
            fired: self.fired,
            halted: self.halted.iter().cloned().collect(),
        };
        info!(fired = report.fired, halted = report.halted.len(), "Workflow controller stopped");
        Ok(report)
    }
}

/// Time until the next tick at `offset` past a minute.
fn until_next_tick(now: DateTime<Utc>, offset: Duration) -> Duration {
    let offset = chrono::Duration::from_std(offset).unwrap_or_default();
    let mut next = minute_floor(now) + offset;
    if next <= now {
        next += chrono::Duration::minutes(1);
    }
    (next - now).to_std().unwrap_or_default()
}
