//! Error types for Cadence.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Definition errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Param(#[from] ParamError),

    #[error("Invalid cron expression {expression:?}: {message}")]
    Cron { expression: String, message: String },

    // Execution errors
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("Timed out after {seconds}s: {context}")]
    Timeout { seconds: u64, context: String },

    // Collaborator errors
    #[error("Release log error: {0}")]
    Log(String),

    #[error("Chunk submission failed: {0}")]
    Submit(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Short type name used when embedding the error in a result context.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "ConfigurationError",
            Error::Param(_) => "ParamError",
            Error::Cron { .. } => "CronError",
            Error::Stage(_) => "StageError",
            Error::Job(_) => "JobError",
            Error::Timeout { .. } => "TimeoutError",
            Error::Log(_) => "LogError",
            Error::Submit(_) => "SubmitError",
            Error::Io(_) => "IoError",
            Error::Serialization(_) => "SerializationError",
            Error::Internal(_) => "InternalError",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Failure raised by a stage body.
#[derive(Debug, Clone, Error)]
#[error("Stage {stage} failed: {message}")]
pub struct StageError {
    pub stage: String,
    pub message: String,
}

impl StageError {
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Job-level failure wrapping a stage or wiring error.
#[derive(Debug, Clone, Error)]
#[error("Job {job} failed: {message}")]
pub struct JobError {
    pub job: String,
    pub message: String,
}

impl JobError {
    pub fn new(job: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            message: message.into(),
        }
    }

    pub fn from_stage(job: impl Into<String>, err: &StageError) -> Self {
        Self::new(job, format!("StageError: {}", err))
    }
}

/// Parameter validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("Required parameters not set: {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("Parameter {name} expects {expected}: {message}")]
    Invalid {
        name: String,
        expected: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_params_message_lists_names() {
        let err = ParamError::Missing(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.to_string(), "Required parameters not set: a, b");
    }

    #[test]
    fn test_job_error_wraps_stage_error() {
        let stage = StageError::new("build", "exit code 2");
        let job = JobError::from_stage("compile", &stage);
        assert_eq!(
            job.to_string(),
            "Job compile failed: StageError: Stage build failed: exit code 2"
        );
        assert_eq!(Error::from(job).kind(), "JobError");
    }
}
