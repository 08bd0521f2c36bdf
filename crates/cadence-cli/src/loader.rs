//! YAML definition loader.
//!
//! A definitions file holds named pipelines and optional scheduling
//! entries:
//!
//! ```yaml
//! pipelines:
//!   nightly:
//!     params:
//!       run_date: { type: datetime, required: true }
//!     on:
//!       - cron: "0 2 * * *"
//!         timezone: Asia/Tokyo
//!     jobs:
//!       extract:
//!         stages:
//!           - id: fetch
//!             uses: shell
//!             run: ./fetch.sh ${{ params.run_date }}
//! schedules:
//!   - pipeline: nightly
//!     params:
//!       run_date: ${{ release.logical_date }}
//! ```

use crate::stages::{EchoStage, ShellStage, StageMeta};
use anyhow::{Context, Result};
use cadence_core::{Job, Param, Pipeline, ScheduleEntry, ScheduleSpec, Stage, Strategy};
use cadence_scheduler::ReleaseTarget;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefinitionsFile {
    #[serde(default)]
    pipelines: BTreeMap<String, PipelineDef>,
    #[serde(default)]
    schedules: Vec<ScheduleEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineDef {
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    params: BTreeMap<String, Param>,
    #[serde(default)]
    on: Vec<ScheduleSpec>,
    /// Mapping of job id to job; kept as a YAML mapping to preserve order.
    #[serde(default)]
    jobs: serde_yaml::Mapping,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobDef {
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    needs: Vec<String>,
    #[serde(default)]
    strategy: Strategy,
    #[serde(default)]
    stages: Vec<StageDef>,
}

#[derive(Debug, Deserialize)]
struct StageDef {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "if")]
    condition: Option<String>,
    #[serde(flatten)]
    kind: StageKind,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "uses", rename_all = "snake_case")]
enum StageKind {
    Echo {
        #[serde(default)]
        with: Map<String, Value>,
        #[serde(default)]
        value: Option<Value>,
    },
    Shell {
        run: String,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
}

impl StageDef {
    fn into_stage(self) -> Arc<dyn Stage> {
        let mut meta = StageMeta {
            name: self.name,
            ..StageMeta::new(self.id)
        };
        if let Some(condition) = self.condition {
            meta = meta.with_condition(condition);
        }
        match self.kind {
            StageKind::Echo { with, value } => Arc::new(EchoStage::new(meta, with, value)),
            StageKind::Shell { run, env } => Arc::new(ShellStage::new(meta, run, env)),
        }
    }
}

/// Validated pipelines and scheduling entries of one definitions file.
#[derive(Debug, Default)]
pub struct Definitions {
    pipelines: BTreeMap<String, Arc<Pipeline>>,
    schedules: Vec<ScheduleEntry>,
}

impl Definitions {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading definitions {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("loading definitions {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: DefinitionsFile = serde_yaml::from_str(content)?;

        let mut pipelines = BTreeMap::new();
        for (name, def) in file.pipelines {
            let pipeline = build_pipeline(&name, def).with_context(|| format!("pipeline {:?}", name))?;
            pipelines.insert(name, Arc::new(pipeline));
        }
        for entry in &file.schedules {
            if !pipelines.contains_key(&entry.pipeline) {
                anyhow::bail!("schedule entry names unknown pipeline {:?}", entry.pipeline);
            }
        }

        Ok(Self {
            pipelines,
            schedules: file.schedules,
        })
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &Arc<Pipeline>> {
        self.pipelines.values()
    }

    pub fn pipeline(&self, name: &str) -> Result<Arc<Pipeline>> {
        self.pipelines
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("pipeline {:?} is not defined", name))
    }

    /// Release targets of the named pipelines.
    ///
    /// Pipelines with explicit scheduling entries use those entries;
    /// others fall back to their own `on` list with no extra parameters.
    /// Unknown names are ignored.
    pub fn targets(&self, names: &[String]) -> Result<Vec<ReleaseTarget>> {
        let mut targets = Vec::new();
        for name in names {
            let Some(pipeline) = self.pipelines.get(name) else {
                continue;
            };
            let entries: Vec<&ScheduleEntry> =
                self.schedules.iter().filter(|e| &e.pipeline == name).collect();
            if entries.is_empty() {
                targets.extend(ReleaseTarget::from_pipeline(pipeline.clone(), &Map::new())?);
            }
            for entry in entries {
                targets.extend(ReleaseTarget::from_entry(pipeline.clone(), entry)?);
            }
        }
        Ok(targets)
    }

    /// Names of the pipelines that have at least one schedule.
    pub fn scheduled_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for name in self.pipelines.keys() {
            if !self.targets(std::slice::from_ref(name))?.is_empty() {
                names.push(name.clone());
            }
        }
        Ok(names)
    }
}

fn build_pipeline(name: &str, def: PipelineDef) -> Result<Pipeline> {
    let mut builder = Pipeline::builder(name);
    if let Some(desc) = def.desc {
        builder = builder.desc(desc);
    }
    for (param_name, param) in def.params {
        builder = builder.param(param_name, param);
    }
    for spec in def.on {
        builder = builder.schedule(spec);
    }
    for (key, value) in def.jobs {
        let id = key
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("job ids must be strings, got {:?}", key))?
            .to_string();
        let job_def: JobDef = serde_yaml::from_value(value).with_context(|| format!("job {:?}", id))?;
        builder = builder.job(build_job(id, job_def));
    }
    Ok(builder.build()?)
}

fn build_job(id: String, def: JobDef) -> Job {
    let mut job = Job::new(id).with_needs(def.needs).with_strategy(def.strategy);
    if let Some(desc) = def.desc {
        job = job.with_desc(desc);
    }
    for stage in def.stages {
        job = job.with_stage(stage.into_stage());
    }
    job
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DEFINITIONS: &str = r#"
pipelines:
  nightly:
    desc: Nightly export
    params:
      run_date:
        type: datetime
        required: true
      region:
        type: choice
        options: [eu, us]
        default: eu
    on:
      - cron: "0 2 * * *"
        timezone: Asia/Tokyo
    jobs:
      extract:
        strategy:
          max-parallel: 2
          matrix:
            shard: [1, 2]
        stages:
          - id: announce
            uses: echo
            value: ${{ matrix.shard }}
      load:
        needs: [extract]
        stages:
          - id: done
            uses: echo
            if: ${{ params.region }}
            with:
              region: ${{ params.region }}
  adhoc:
    jobs:
      only:
        stages:
          - id: hi
            uses: shell
            run: echo hi
schedules:
  - pipeline: nightly
    params:
      run_date: ${{ release.logical_date }}
  - pipeline: nightly
    on:
      - cron: "30 6 * * 1"
    params:
      run_date: ${{ release.logical_date }}
      region: us
"#;

    #[test]
    fn test_load_builds_pipelines_in_declared_job_order() {
        let defs = Definitions::from_yaml(DEFINITIONS).unwrap();
        let nightly = defs.pipeline("nightly").unwrap();

        let ids: Vec<&str> = nightly.jobs().iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["extract", "load"]);
        assert_eq!(nightly.job("load").unwrap().needs, vec!["extract".to_string()]);
        assert_eq!(nightly.job("extract").unwrap().strategy.max_parallel, 2);
        assert_eq!(nightly.on()[0].timezone, "Asia/Tokyo");
        assert!(defs.pipeline("missing").is_err());
    }

    #[test]
    fn test_targets_prefer_schedule_entries() {
        let defs = Definitions::from_yaml(DEFINITIONS).unwrap();

        let targets = defs.targets(&["nightly".to_string(), "ghost".to_string()]).unwrap();
        let keys: Vec<String> = targets.iter().map(ReleaseTarget::key).collect();
        assert_eq!(keys, vec!["nightly|0 2 * * *", "nightly|30 6 * * 1"]);
        assert_eq!(targets[1].params()["region"], "us");

        assert_eq!(defs.scheduled_names().unwrap(), vec!["nightly".to_string()]);
    }

    #[test]
    fn test_unknown_need_is_configuration_error() {
        let err = Definitions::from_yaml(
            r#"
pipelines:
  broken:
    jobs:
      A:
        needs: [B]
"#,
        )
        .unwrap_err();

        let core = err.downcast_ref::<cadence_core::Error>().unwrap();
        assert_eq!(core.kind(), "ConfigurationError");
    }

    #[test]
    fn test_cyclic_needs_fail_to_load() {
        let err = Definitions::from_yaml(
            r#"
pipelines:
  looped:
    jobs:
      A:
        needs: [B]
      B:
        needs: [A]
"#,
        )
        .unwrap_err();

        let core = err.downcast_ref::<cadence_core::Error>().unwrap();
        assert_eq!(core.kind(), "ConfigurationError");
        assert!(core.to_string().contains("Cycle detected"));
    }

    #[test]
    fn test_unknown_stage_kind_and_entry_are_rejected() {
        let bad_stage = r#"
pipelines:
  p:
    jobs:
      a:
        stages:
          - id: x
            uses: teleport
"#;
        assert!(Definitions::from_yaml(bad_stage).is_err());

        let bad_entry = "schedules:\n  - pipeline: nowhere\n";
        assert!(Definitions::from_yaml(bad_entry).is_err());
    }
}
