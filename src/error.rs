//! Engine-level errors
//!
//! Verdicts (wrong answer, timeouts, ...) are never errors; they are encoded
//! in [`crate::judger::JudgeResult`]. What ends up here is either a bad
//! request, a cancelled run or an infrastructure fault.

use thiserror::Error;

use crate::problem::RepositoryError;
use crate::sandbox::SandboxError;

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("problem not found: {0}")]
    ProblemNotFound(String),

    #[error("invalid problem {id}: {reason}")]
    InvalidProblem { id: String, reason: String },

    #[error("judging cancelled")]
    Cancelled,

    #[error("judging infrastructure failure: {0:#}")]
    Infrastructure(#[from] anyhow::Error),
}

impl From<SandboxError> for JudgeError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Cancelled => JudgeError::Cancelled,
            other => JudgeError::Infrastructure(other.into()),
        }
    }
}

impl From<RepositoryError> for JudgeError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(id) => JudgeError::ProblemNotFound(id),
            RepositoryError::Invalid { id, reason } => JudgeError::InvalidProblem { id, reason },
            other => JudgeError::Infrastructure(other.into()),
        }
    }
}

impl JudgeError {
    /// Short machine-readable kind, used by the worker's error lines
    pub fn kind(&self) -> &'static str {
        match self {
            JudgeError::UnsupportedLanguage(_) => "unsupported_language",
            JudgeError::ProblemNotFound(_) => "problem_not_found",
            JudgeError::InvalidProblem { .. } => "invalid_problem",
            JudgeError::Cancelled => "cancelled",
            JudgeError::Infrastructure(_) => "infrastructure",
        }
    }
}

pub type JudgeOutcome<T> = std::result::Result<T, JudgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_sandbox_maps_to_cancelled() {
        let err: JudgeError = SandboxError::Cancelled.into();
        assert!(matches!(err, JudgeError::Cancelled));
        assert_eq!(err.kind(), "cancelled");
    }

    #[test]
    fn test_spawn_failure_is_infrastructure() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: JudgeError = SandboxError::Spawn {
            program: "javac".into(),
            source: io,
        }
        .into();
        assert!(matches!(err, JudgeError::Infrastructure(_)));
        assert!(err.to_string().contains("javac"));
    }

    #[test]
    fn test_repository_not_found() {
        let err: JudgeError = RepositoryError::NotFound("fib".into()).into();
        assert!(matches!(err, JudgeError::ProblemNotFound(ref id) if id == "fib"));
    }
}
