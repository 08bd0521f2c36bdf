//! Partitioning many pipelines across isolated controllers.

use async_trait::async_trait;
use cadence_core::ports::ChunkSubmitter;
use cadence_core::{Error, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Split `names` into sorted chunks of `chunk_size` and submit at most
/// `max_concurrent` of them at a time.
///
/// Returns the scheduled names in chunk order. The first failing chunk
/// aborts the remaining ones and its error is returned.
pub async fn fan_out(
    mut names: Vec<String>,
    chunk_size: usize,
    max_concurrent: usize,
    stop: DateTime<Utc>,
    submitter: Arc<dyn ChunkSubmitter>,
) -> Result<Vec<String>> {
    if chunk_size == 0 || max_concurrent == 0 {
        return Err(Error::Configuration(
            "chunk size and concurrency must be at least 1".to_string(),
        ));
    }
    names.sort();
    names.dedup();

    let chunks: Vec<Vec<String>> = names.chunks(chunk_size).map(<[String]>::to_vec).collect();
    info!(
        names = names.len(),
        chunks = chunks.len(),
        max_concurrent,
        stop = %stop,
        "Fanning out schedules"
    );

    let permits = Arc::new(Semaphore::new(max_concurrent));
    let mut set = JoinSet::new();
    let mut index_of = HashMap::new();

    for (index, chunk) in chunks.into_iter().enumerate() {
        let permits = permits.clone();
        let submitter = submitter.clone();
        let handle = set.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
            submitter.submit(chunk, stop).await
        });
        index_of.insert(handle.id(), index);
    }

    let mut results: Vec<Option<Vec<String>>> = vec![None; index_of.len()];
    while let Some(joined) = set.join_next_with_id().await {
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, outcome),
            Err(err) => {
                set.abort_all();
                return Err(Error::Submit(err.to_string()));
            }
        };
        match outcome {
            Ok(scheduled) => {
                if let Some(&index) = index_of.get(&id) {
                    results[index] = Some(scheduled);
                }
            }
            Err(err) => {
                error!(error = %err, "Chunk failed, aborting fan-out");
                set.abort_all();
                return Err(err);
            }
        }
    }

    Ok(results.into_iter().flatten().flatten().collect())
}

type ChunkFn = dyn Fn(Vec<String>, DateTime<Utc>) -> BoxFuture<'static, Result<Vec<String>>> + Send + Sync;

/// Submitter running each chunk on its own tokio task.
///
/// A panicking chunk surfaces as [`Error::Submit`] instead of unwinding
/// into the caller.
pub struct InProcessSubmitter {
    run: Arc<ChunkFn>,
}

impl InProcessSubmitter {
    pub fn new<F>(run: F) -> Self
    where
        F: Fn(Vec<String>, DateTime<Utc>) -> BoxFuture<'static, Result<Vec<String>>> + Send + Sync + 'static,
    {
        Self { run: Arc::new(run) }
    }
}

#[async_trait]
impl ChunkSubmitter for InProcessSubmitter {
    async fn submit(&self, chunk: Vec<String>, stop: DateTime<Utc>) -> Result<Vec<String>> {
        let future = (self.run)(chunk, stop);
        tokio::spawn(future)
            .await
            .map_err(|e| Error::Submit(e.to_string()))?
    }
}
