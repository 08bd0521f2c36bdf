//! Job dependency graph.

use crate::Error;
use crate::pipeline::Job;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("Cycle detected in job dependencies at {0:?}")]
    CycleDetected(String),
}

impl From<DagError> for Error {
    fn from(err: DagError) -> Self {
        Error::Configuration(err.to_string())
    }
}

/// Job ids in an order where every job follows the jobs it needs.
///
/// Needs naming jobs outside `jobs` are ignored; callers check them first.
pub fn topological_order(jobs: &[Job]) -> Result<Vec<&str>, DagError> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut id_to_index: HashMap<&str, NodeIndex> = HashMap::with_capacity(jobs.len());

    for job in jobs {
        id_to_index.insert(job.id.as_str(), graph.add_node(job.id.as_str()));
    }
    for job in jobs {
        let job_idx = id_to_index[job.id.as_str()];
        for need in &job.needs {
            if let Some(&need_idx) = id_to_index.get(need.as_str()) {
                graph.add_edge(need_idx, job_idx, ());
            }
        }
    }

    toposort(&graph, None)
        .map(|indices| indices.into_iter().map(|idx| graph[idx]).collect())
        .map_err(|cycle| DagError::CycleDetected(graph[cycle.node_id()].to_string()))
}
