//! JSON-lines release log.

use async_trait::async_trait;
use cadence_core::{Error, ReleaseLog, ReleaseRecord, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Appends one JSON object per release to `<dir>/<pipeline>.jsonl`.
///
/// Release times already persisted are cached per pipeline after the first
/// lookup and kept current by [`ReleaseLog::save`].
#[derive(Debug)]
pub struct JsonReleaseLog {
    dir: PathBuf,
    released: Mutex<HashMap<String, BTreeSet<DateTime<Utc>>>>,
}

impl JsonReleaseLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            released: Mutex::new(HashMap::new()),
        }
    }

    /// Log file of `pipeline`. Characters other than ASCII letters, digits,
    /// `-` and `_` are replaced so the file stays inside the log directory.
    pub fn path_for(&self, pipeline: &str) -> PathBuf {
        let stem: String = pipeline
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.jsonl", stem))
    }

    /// Every readable record of `pipeline`, oldest first.
    pub async fn records(&self, pipeline: &str) -> Result<Vec<ReleaseRecord>> {
        let mut records = read_records(&self.path_for(pipeline)).await?;
        records.retain(|r| r.pipeline == pipeline);
        Ok(records)
    }
}

async fn read_records(path: &Path) -> Result<Vec<ReleaseRecord>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(Error::Log(format!("reading {}: {}", path.display(), err))),
    };

    let mut records = Vec::new();
    for (number, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ReleaseRecord>(line) {
            Ok(record) => records.push(record),
            Err(err) => warn!(path = %path.display(), line = number + 1, error = %err, "Skipping unreadable release record"),
        }
    }
    Ok(records)
}

#[async_trait]
impl ReleaseLog for JsonReleaseLog {
    async fn save(&self, record: &ReleaseRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut released = self.released.lock().await;
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&record.pipeline);
        let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        if let Some(times) = released.get_mut(&record.pipeline) {
            times.insert(record.release);
        }
        debug!(path = %path.display(), release = %record.release, "Release record written");
        Ok(())
    }

    async fn is_pointed(
        &self,
        pipeline: &str,
        release: DateTime<Utc>,
        queue: &[DateTime<Utc>],
    ) -> Result<bool> {
        if queue.contains(&release) {
            return Ok(true);
        }

        let mut released = self.released.lock().await;
        if !released.contains_key(pipeline) {
            let times = self.records(pipeline).await?.into_iter().map(|r| r.release).collect();
            debug!(pipeline, "Loaded persisted release times");
            released.insert(pipeline.to_string(), times);
        }
        Ok(released
            .get(pipeline)
            .is_some_and(|times| times.contains(&release)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::Map;

    fn record(pipeline: &str, minute: u32) -> ReleaseRecord {
        ReleaseRecord {
            pipeline: pipeline.to_string(),
            cron: "* * * * *".to_string(),
            release: Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap(),
            context: Map::new(),
            parent_run_id: None,
            run_id: None,
        }
    }

    #[tokio::test]
    async fn test_save_appends_per_pipeline_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonReleaseLog::new(dir.path().join("logs"));

        log.save(&record("etl", 1)).await.unwrap();
        log.save(&record("etl", 2)).await.unwrap();
        log.save(&record("other", 1)).await.unwrap();

        let etl = log.records("etl").await.unwrap();
        assert_eq!(etl, vec![record("etl", 1), record("etl", 2)]);
        let raw = std::fs::read_to_string(log.path_for("etl")).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_is_pointed_checks_queue_then_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonReleaseLog::new(dir.path());
        log.save(&record("etl", 5)).await.unwrap();

        let queued = record("etl", 7).release;
        assert!(log.is_pointed("etl", record("etl", 5).release, &[]).await.unwrap());
        assert!(log.is_pointed("etl", queued, &[queued]).await.unwrap());
        assert!(!log.is_pointed("etl", record("etl", 6).release, &[queued]).await.unwrap());
        assert!(!log.is_pointed("other", record("etl", 5).release, &[]).await.unwrap());
    }

    #[tokio::test]
    async fn test_unreadable_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonReleaseLog::new(dir.path());
        log.save(&record("etl", 1)).await.unwrap();
        std::fs::write(
            log.path_for("etl"),
            format!("not json\n{}\n", serde_json::to_string(&record("etl", 3)).unwrap()),
        )
        .unwrap();

        assert_eq!(log.records("etl").await.unwrap(), vec![record("etl", 3)]);
    }

    #[test]
    fn test_path_stays_inside_log_dir() {
        let log = JsonReleaseLog::new("/var/log/cadence");
        assert_eq!(log.path_for("etl-daily_2"), PathBuf::from("/var/log/cadence/etl-daily_2.jsonl"));
        assert_eq!(log.path_for("../../etc/passwd"), PathBuf::from("/var/log/cadence/______etc_passwd.jsonl"));
        assert_eq!(log.path_for("a/b").parent(), Some(Path::new("/var/log/cadence")));
    }

    #[tokio::test]
    async fn test_sanitized_names_keep_records_apart() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonReleaseLog::new(dir.path());
        log.save(&record("a/b", 1)).await.unwrap();
        log.save(&record("a_b", 2)).await.unwrap();

        assert_eq!(log.records("a/b").await.unwrap(), vec![record("a/b", 1)]);
        assert!(!log.is_pointed("a/b", record("a_b", 2).release, &[]).await.unwrap());
        assert!(std::fs::read_dir(dir.path()).unwrap().count() == 1);
    }

    #[tokio::test]
    async fn test_cached_release_times_follow_saves() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonReleaseLog::new(dir.path());
        log.save(&record("etl", 1)).await.unwrap();

        assert!(log.is_pointed("etl", record("etl", 1).release, &[]).await.unwrap());
        std::fs::remove_file(log.path_for("etl")).unwrap();
        assert!(log.is_pointed("etl", record("etl", 1).release, &[]).await.unwrap());

        log.save(&record("etl", 2)).await.unwrap();
        assert!(log.is_pointed("etl", record("etl", 2).release, &[]).await.unwrap());
    }
}
