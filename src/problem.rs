//! Problems and the repository that supplies them
//!
//! Problems are immutable once loaded and handed out as `Arc<Problem>`, so
//! any number of judging runs can read the same one concurrently.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::comparator::Comparison;
use crate::sandbox::ExecutionLimits;

/// One (input, expected output) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    #[serde(alias = "output")]
    pub expected_output: String,
}

impl TestCase {
    pub fn new(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: expected_output.into(),
        }
    }
}

/// A coding exercise with ordered test cases and per-test limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Wall-clock limit per test case, in milliseconds
    pub time_limit_ms: u64,
    /// Memory ceiling per test case, in bytes
    pub memory_limit_bytes: u64,
    /// Evaluated in this order
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub comparison: Comparison,
}

impl Problem {
    pub fn new(
        id: impl Into<String>,
        time_limit: Duration,
        memory_limit_bytes: u64,
        test_cases: Vec<TestCase>,
    ) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            time_limit_ms: u64::try_from(time_limit.as_millis()).unwrap_or(u64::MAX),
            memory_limit_bytes,
            test_cases,
            comparison: Comparison::Exact,
        }
    }

    pub fn with_comparison(mut self, comparison: Comparison) -> Self {
        self.comparison = comparison;
        self
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(self.time_limit_ms)
    }

    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits::new(self.time_limit(), self.memory_limit_bytes)
    }

    /// Reject problems the engine cannot judge meaningfully
    pub fn validate(&self) -> Result<(), String> {
        if self.test_cases.is_empty() {
            return Err("problem has no test cases".into());
        }
        if self.time_limit_ms == 0 {
            return Err("time limit must be positive".into());
        }
        if self.memory_limit_bytes == 0 {
            return Err("memory limit must be positive".into());
        }
        if let Comparison::Float { epsilon } = self.comparison {
            if !(epsilon.is_finite() && epsilon >= 0.0) {
                return Err(format!("invalid float epsilon {}", epsilon));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("problem {0} not found")]
    NotFound(String),

    #[error("problem {id} is invalid: {reason}")]
    Invalid { id: String, reason: String },

    #[error("failed to load problem {id}: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

/// Source of problem definitions
#[async_trait]
pub trait ProblemRepository: Send + Sync {
    async fn find(&self, problem_id: &str) -> Result<Arc<Problem>, RepositoryError>;
}

/// Problems held in memory
#[derive(Debug, Default)]
pub struct InMemoryProblemRepository {
    problems: HashMap<String, Arc<Problem>>,
}

impl InMemoryProblemRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, problem: Problem) -> Result<(), RepositoryError> {
        problem.validate().map_err(|reason| RepositoryError::Invalid {
            id: problem.id.clone(),
            reason,
        })?;
        self.problems.insert(problem.id.clone(), Arc::new(problem));
        Ok(())
    }
}

#[async_trait]
impl ProblemRepository for InMemoryProblemRepository {
    async fn find(&self, problem_id: &str) -> Result<Arc<Problem>, RepositoryError> {
        self.problems
            .get(problem_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(problem_id.to_string()))
    }
}

/// Problems stored as `<id>.json` files in one directory, cached after the
/// first successful load
pub struct FsProblemRepository {
    root: PathBuf,
    cache: RwLock<HashMap<String, Arc<Problem>>>,
}

impl FsProblemRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        info!("Serving problems from {}", root.display());
        Self {
            root,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn load(&self, problem_id: &str) -> Result<Problem, RepositoryError> {
        let path = self.root.join(format!("{}.json", problem_id));
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RepositoryError::NotFound(problem_id.to_string()));
            }
            Err(source) => {
                return Err(RepositoryError::Io {
                    id: problem_id.to_string(),
                    source,
                })
            }
        };

        let invalid = |reason: String| RepositoryError::Invalid {
            id: problem_id.to_string(),
            reason,
        };

        let problem: Problem = serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?;
        if problem.id != problem_id {
            return Err(invalid(format!(
                "file declares id {:?}",
                problem.id
            )));
        }
        problem.validate().map_err(invalid)?;

        debug!(
            "Loaded problem {} with {} test cases",
            problem.id,
            problem.test_cases.len()
        );
        Ok(problem)
    }
}

/// Identifiers become file names; anything beyond `[A-Za-z0-9_-]` could
/// escape the problem directory.
fn is_valid_problem_id(problem_id: &str) -> bool {
    !problem_id.is_empty()
        && problem_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[async_trait]
impl ProblemRepository for FsProblemRepository {
    async fn find(&self, problem_id: &str) -> Result<Arc<Problem>, RepositoryError> {
        if !is_valid_problem_id(problem_id) {
            return Err(RepositoryError::NotFound(problem_id.to_string()));
        }

        if let Some(problem) = self.cache.read().await.get(problem_id) {
            return Ok(Arc::clone(problem));
        }

        let problem = Arc::new(self.load(problem_id).await?);
        let mut cache = self.cache.write().await;
        // Another run may have loaded it meanwhile; keep the first copy.
        let cached = cache
            .entry(problem_id.to_string())
            .or_insert_with(|| Arc::clone(&problem));
        Ok(Arc::clone(cached))
    }
}
