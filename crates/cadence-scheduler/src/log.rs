//! In-memory release log.

use async_trait::async_trait;
use cadence_core::Result;
use cadence_core::ports::{ReleaseLog, ReleaseRecord};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

/// Release log keeping every record in memory.
#[derive(Debug, Default)]
pub struct MemoryReleaseLog {
    records: RwLock<Vec<ReleaseRecord>>,
}

impl MemoryReleaseLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the saved records, oldest first.
    pub async fn records(&self) -> Vec<ReleaseRecord> {
        self.records.read().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl ReleaseLog for MemoryReleaseLog {
    async fn save(&self, record: &ReleaseRecord) -> Result<()> {
        debug!(pipeline = %record.pipeline, release = %record.release, "Saving release record");
        self.records.write().await.push(record.clone());
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
        let records = self.records.read().await;
        Ok(records
            .iter()
            .any(|r| r.pipeline == pipeline && r.release == release))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::Map;

    #[tokio::test]
    async fn test_pointed_by_queue_or_saved_record() {
        let log = MemoryReleaseLog::new();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 2, 0).unwrap();

        assert!(log.is_pointed("p", t1, &[t1]).await.unwrap());
        assert!(!log.is_pointed("p", t2, &[t1]).await.unwrap());

        log.save(&ReleaseRecord {
            pipeline: "p".to_string(),
            cron: "* * * * *".to_string(),
            release: t2,
            context: Map::new(),
            parent_run_id: None,
            run_id: None,
        })
        .await
        .unwrap();

        assert!(log.is_pointed("p", t2, &[]).await.unwrap());
        assert!(!log.is_pointed("other", t2, &[]).await.unwrap());
        assert_eq!(log.count().await, 1);
    }

    #[test]
    fn test_records_snapshot_is_ordered() {
        let log = MemoryReleaseLog::new();
        let times: Vec<_> = (1..=3)
            .map(|m| Utc.with_ymd_and_hms(2024, 1, 1, 0, m, 0).unwrap())
            .collect();

        tokio_test::block_on(async {
            for release in &times {
                let record = ReleaseRecord {
                    pipeline: "p".to_string(),
                    cron: "* * * * *".to_string(),
                    release: *release,
                    context: Map::new(),
                    parent_run_id: None,
                    run_id: None,
                };
                tokio_test::assert_ok!(log.save(&record).await);
            }
        });

        let saved: Vec<_> = tokio_test::block_on(log.records())
            .into_iter()
            .map(|r| r.release)
            .collect();
        assert_eq!(saved, times);
    }
}
