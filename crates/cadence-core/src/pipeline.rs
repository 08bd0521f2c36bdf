//! Pipeline definition types.
//!
//! Definitions are immutable templates supplied by a loader. Every
//! execution works on a clone carrying a fresh [`RunId`].

use crate::context::{Branch, ExecutionContext};
use crate::dag;
use crate::error::ParamError;
use crate::ids::RunId;
use crate::ports::Stage;
use crate::template::has_template;
use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Parameter key reserved for the release overlay.
pub const RELEASE_KEY: &str = "release";

/// Fan-out configuration of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Strategy {
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Axis name to ordered list of values, in declaration order.
    #[serde(default)]
    pub matrix: Map<String, Value>,
    #[serde(default)]
    pub include: Vec<Branch>,
    #[serde(default)]
    pub exclude: Vec<Branch>,
}

fn default_max_parallel() -> usize {
    1
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            fail_fast: false,
            max_parallel: default_max_parallel(),
            matrix: Map::new(),
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl Strategy {
    /// Whether a matrix was declared at all.
    pub fn is_set(&self) -> bool {
        !self.matrix.is_empty()
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_axis(mut self, name: impl Into<String>, values: Vec<Value>) -> Self {
        self.matrix.insert(name.into(), Value::Array(values));
        self
    }

    pub fn with_include(mut self, row: Branch) -> Self {
        self.include.push(row);
        self
    }

    pub fn with_exclude(mut self, row: Branch) -> Self {
        self.exclude.push(row);
        self
    }

    /// Axes in declaration order. Fails if an axis is not a list.
    pub fn axes(&self) -> Result<Vec<(&str, &[Value])>> {
        self.matrix
            .iter()
            .map(|(name, values)| match values {
                Value::Array(items) => Ok((name.as_str(), items.as_slice())),
                other => Err(Error::Configuration(format!(
                    "matrix axis {:?} must be a list, got {}",
                    name, other
                ))),
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel < 1 {
            return Err(Error::Configuration(
                "strategy max-parallel must be at least 1".to_string(),
            ));
        }
        self.axes()?;
        for row in &self.include {
            if let Some(key) = row.keys().find(|k| !self.matrix.contains_key(*k)) {
                return Err(Error::Configuration(format!(
                    "include row key {:?} is not a matrix axis",
                    key
                )));
            }
        }
        Ok(())
    }
}

/// A group of stages executed once per strategy branch.
#[derive(Clone)]
pub struct Job {
    pub id: String,
    pub desc: Option<String>,
    pub stages: Vec<Arc<dyn Stage>>,
    pub needs: Vec<String>,
    pub strategy: Strategy,
    pub run_id: RunId,
}

impl Job {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            desc: None,
            stages: Vec::new(),
            needs: Vec::new(),
            strategy: Strategy::default(),
            run_id: RunId::new(),
        }
    }

    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_needs<I, S>(mut self, needs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.needs.extend(needs.into_iter().map(Into::into));
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Clone of this job bound to another execution instance.
    pub fn with_run_id(&self, run_id: RunId) -> Self {
        Self {
            run_id,
            ..self.clone()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.id.is_empty() || has_template(&self.id) {
            return Err(Error::Configuration(format!(
                "job id {:?} must be a non-empty literal",
                self.id
            )));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.id()) {
                return Err(Error::Configuration(format!(
                    "stage id {:?} is duplicated in job {:?}",
                    stage.id(),
                    self.id
                )));
            }
        }
        self.strategy
            .validate()
            .map_err(|e| Error::Configuration(format!("job {:?}: {}", self.id, e)))
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("stages", &self.stages.iter().map(|s| s.id()).collect::<Vec<_>>())
            .field("needs", &self.needs)
            .field("strategy", &self.strategy)
            .field("run_id", &self.run_id)
            .finish()
    }
}

/// Declared type of a pipeline parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamKind {
    Str,
    Int,
    Float,
    Bool,
    Datetime,
    Choice { options: Vec<Value> },
    Json,
}

/// One entry of a pipeline's parameter schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    #[serde(flatten)]
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub desc: Option<String>,
}

impl Param {
    pub fn new(kind: ParamKind) -> Self {
        Self {
            kind,
            required: false,
            default: None,
            desc: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Coerce an incoming value to the declared type.
    pub fn receive(&self, name: &str, value: &Value) -> std::result::Result<Value, ParamError> {
        let invalid = |expected: &str, message: String| ParamError::Invalid {
            name: name.to_string(),
            expected: expected.to_string(),
            message,
        };

        match &self.kind {
            ParamKind::Str => Ok(match value {
                Value::String(_) => value.clone(),
                Value::Null => return Err(invalid("str", "got null".to_string())),
                other => Value::String(other.to_string()),
            }),
            ParamKind::Int => match value {
                Value::Number(n) if n.is_i64() => Ok(value.clone()),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|e| invalid("int", e.to_string())),
                other => Err(invalid("int", format!("got {}", other))),
            },
            ParamKind::Float => match value {
                Value::Number(n) => n
                    .as_f64()
                    .map(Value::from)
                    .ok_or_else(|| invalid("float", format!("got {}", n))),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::from)
                    .map_err(|e| invalid("float", e.to_string())),
                other => Err(invalid("float", format!("got {}", other))),
            },
            ParamKind::Bool => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::String(s) => match s.trim().to_lowercase().as_str() {
                    "true" | "yes" | "1" => Ok(Value::Bool(true)),
                    "false" | "no" | "0" => Ok(Value::Bool(false)),
                    other => Err(invalid("bool", format!("got {:?}", other))),
                },
                other => Err(invalid("bool", format!("got {}", other))),
            },
            ParamKind::Datetime => {
                let Some(raw) = value.as_str() else {
                    return Err(invalid("datetime", format!("got {}", value)));
                };
                parse_datetime(raw)
                    .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true)))
                    .ok_or_else(|| invalid("datetime", format!("cannot parse {:?}", raw)))
            }
            ParamKind::Choice { options } => {
                if options.contains(value) {
                    Ok(value.clone())
                } else {
                    Err(invalid("choice", format!("{} is not one of {:?}", value, options)))
                }
            }
            ParamKind::Json => Ok(value.clone()),
        }
    }
}

fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw.trim()) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// A cron schedule entry ("on") of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl ScheduleSpec {
    pub fn new(cron: impl Into<String>) -> Self {
        Self {
            cron: cron.into(),
            timezone: default_timezone(),
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }
}

/// Scheduling entry naming a pipeline, with per-entry parameters and an
/// optional replacement for the pipeline's own schedules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub pipeline: String,
    #[serde(default)]
    pub on: Option<Vec<ScheduleSpec>>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl ScheduleEntry {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            on: None,
            params: Map::new(),
        }
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_schedules(mut self, on: Vec<ScheduleSpec>) -> Self {
        self.on = Some(on);
        self
    }
}

/// A validated DAG of jobs plus its parameter schema and schedules.
#[derive(Clone)]
pub struct Pipeline {
    name: String,
    desc: Option<String>,
    params: BTreeMap<String, Param>,
    on: Vec<ScheduleSpec>,
    jobs: Vec<Job>,
    run_id: RunId,
}

impl Pipeline {
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder {
            name: name.into(),
            desc: None,
            params: BTreeMap::new(),
            on: Vec::new(),
            jobs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn desc(&self) -> Option<&str> {
        self.desc.as_deref()
    }

    pub fn params(&self) -> &BTreeMap<String, Param> {
        &self.params
    }

    pub fn on(&self) -> &[ScheduleSpec] {
        &self.on
    }

    /// Jobs in declaration order.
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Clone of this pipeline bound to another execution instance.
    pub fn with_run_id(&self, run_id: RunId) -> Self {
        Self {
            run_id,
            ..self.clone()
        }
    }

    /// Clone of this pipeline with a freshly generated run id.
    pub fn fresh(&self) -> Self {
        self.with_run_id(RunId::new())
    }

    /// Validate and coerce input parameters into a fresh context.
    ///
    /// Undeclared inputs pass through unchanged; declared ones are coerced
    /// to their type, and absent ones fall back to their default.
    pub fn parameterize(
        &self,
        input: &Map<String, Value>,
    ) -> std::result::Result<ExecutionContext, ParamError> {
        let missing: Vec<String> = self
            .params
            .iter()
            .filter(|(name, p)| p.required && p.default.is_none() && !input.contains_key(*name))
            .map(|(name, _)| name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(ParamError::Missing(missing));
        }

        let mut params = input.clone();
        for (name, param) in &self.params {
            let received = match (input.get(name), &param.default) {
                (Some(value), _) => param.receive(name, value)?,
                (None, Some(default)) => param.receive(name, default)?,
                (None, None) => continue,
            };
            params.insert(name.clone(), received);
        }
        Ok(ExecutionContext::new(params))
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("on", &self.on)
            .field("jobs", &self.jobs)
            .field("run_id", &self.run_id)
            .finish()
    }
}

/// Builder that enforces the structural invariants of a pipeline.
pub struct PipelineBuilder {
    name: String,
    desc: Option<String>,
    params: BTreeMap<String, Param>,
    on: Vec<ScheduleSpec>,
    jobs: Vec<Job>,
}

impl PipelineBuilder {
    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, param: Param) -> Self {
        self.params.insert(name.into(), param);
        self
    }

    pub fn schedule(mut self, spec: ScheduleSpec) -> Self {
        self.on.push(spec);
        self
    }

    pub fn job(mut self, job: Job) -> Self {
        self.jobs.push(job);
        self
    }

    /// Validate the definition.
    ///
    /// Fails with a configuration error when a job id repeats, a `needs`
    /// entry does not name a job of this pipeline, the needs form a cycle,
    /// a strategy is malformed, or a parameter uses the reserved release key.
    pub fn build(self) -> Result<Pipeline> {
        if self.name.is_empty() || has_template(&self.name) {
            return Err(Error::Configuration(format!(
                "pipeline name {:?} must be a non-empty literal",
                self.name
            )));
        }
        if self.params.contains_key(RELEASE_KEY) {
            return Err(Error::Configuration(format!(
                "parameter name {:?} is reserved",
                RELEASE_KEY
            )));
        }
        for (name, param) in &self.params {
            if let ParamKind::Choice { options } = &param.kind
                && options.is_empty()
            {
                return Err(Error::Configuration(format!(
                    "choice parameter {:?} has no options",
                    name
                )));
            }
            if let Some(default) = &param.default {
                param.receive(name, default)?;
            }
        }

        let mut ids = HashSet::new();
        for job in &self.jobs {
            job.validate()?;
            if !ids.insert(job.id.as_str()) {
                return Err(Error::Configuration(format!(
                    "job id {:?} is duplicated in pipeline {:?}",
                    job.id, self.name
                )));
            }
        }
        for job in &self.jobs {
            let unknown: Vec<&str> = job
                .needs
                .iter()
                .map(String::as_str)
                .filter(|need| !ids.contains(need))
                .collect();
            if !unknown.is_empty() {
                return Err(Error::Configuration(format!(
                    "jobs {:?} needed by {:?} do not exist in pipeline {:?}",
                    unknown, job.id, self.name
                )));
            }
        }
        dag::topological_order(&self.jobs)?;

        Ok(Pipeline {
            name: self.name,
            desc: self.desc,
            params: self.params,
            on: self.on,
            jobs: self.jobs,
            run_id: RunId::new(),
        })
    }
}
