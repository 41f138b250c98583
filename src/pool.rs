//! Bounded concurrency for judging runs
//!
//! Every run holds one permit for its whole lifetime (compile and all test
//! cases), so at most `size` submissions execute sandboxed processes at once.
//! Excess requests wait for a permit in FIFO order.

use anyhow::anyhow;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{JudgeError, JudgeOutcome};
use crate::judger::{JudgeEngine, JudgeRequest, JudgeResult};
use crate::problem::{Problem, ProblemRepository};

pub struct JudgePool {
    engine: Arc<JudgeEngine>,
    repository: Arc<dyn ProblemRepository>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl JudgePool {
    pub fn new(
        engine: Arc<JudgeEngine>,
        repository: Arc<dyn ProblemRepository>,
        size: usize,
    ) -> Self {
        let size = size.max(1);
        Self {
            engine,
            repository,
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// One worker per CPU core
    pub fn default_size() -> usize {
        num_cpus::get().max(1)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held by a run
    pub fn idle_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// Judge against an already loaded problem once a worker is free
    pub async fn judge(
        &self,
        problem: &Problem,
        request: &JudgeRequest,
        cancel: &CancellationToken,
    ) -> JudgeOutcome<JudgeResult> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JudgeError::Cancelled),
            permit = self.permits.acquire() => permit
                .map_err(|_| JudgeError::Infrastructure(anyhow!("judge pool is closed")))?,
        };
        debug!(
            "Submission {} acquired a worker ({} idle)",
            request.submission_id,
            self.permits.available_permits()
        );

        self.engine.judge(problem, request, cancel).await
    }

    /// Resolve the problem through the repository, then judge
    pub async fn judge_by_id(
        &self,
        request: &JudgeRequest,
        cancel: &CancellationToken,
    ) -> JudgeOutcome<JudgeResult> {
        let problem = self.repository.find(&request.problem_id).await?;
        self.judge(&problem, request, cancel).await
    }
}
