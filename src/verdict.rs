use serde::{Deserialize, Serialize};
use std::fmt;

/// Status code of a finished judging run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Accepted,
    WrongAnswer,
    CompileError,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
}

impl StatusCode {
    pub fn is_accepted(&self) -> bool {
        matches!(self, StatusCode::Accepted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Accepted => "ACCEPTED",
            StatusCode::WrongAnswer => "WRONG_ANSWER",
            StatusCode::CompileError => "COMPILE_ERROR",
            StatusCode::RuntimeError => "RUNTIME_ERROR",
            StatusCode::TimeLimitExceeded => "TIME_LIMIT_EXCEEDED",
            StatusCode::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
