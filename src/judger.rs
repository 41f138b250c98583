//! Judger module for processing submissions
//!
//! Drives one submission through compile -> run each test case -> compare,
//! stopping at the first failing test case, and resolves the single verdict.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::comparator::Comparison;
use crate::error::{JudgeError, JudgeOutcome};
use crate::problem::{Problem, TestCase};
use crate::runtime::{Compilation, RuntimeRegistry};
use crate::sandbox::{ExecutionOutcome, ExecutionStatus};
use crate::verdict::StatusCode;

/// Bytes of program output kept in a result for debugging
const OUTPUT_PREVIEW_BYTES: usize = 4096;
/// Bytes of stderr kept as a runtime error message
const STDERR_TAIL_BYTES: usize = 4096;

/// A submission to judge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeRequest {
    /// Opaque correlation token, echoed back in the result
    #[serde(default)]
    pub submission_id: String,
    pub problem_id: String,
    pub language: String,
    pub source_code: String,
}

/// Result of judging a submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeResult {
    pub submission_id: String,
    pub status: StatusCode,
    /// 1-based index of the first failing test case
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_test_case: Option<usize>,
    pub passed_test_cases: usize,
    pub total_test_cases: usize,
    /// Failing test case's time, or the slowest one when accepted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    /// Failing test case's peak memory, or the largest when accepted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_used_bytes: Option<u64>,
    /// Compile error / Runtime error message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Program output of the failing test case (at most 4 KiB)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl JudgeResult {
    fn compile_error(request: &JudgeRequest, problem: &Problem, diagnostic: String) -> Self {
        Self {
            submission_id: request.submission_id.clone(),
            status: StatusCode::CompileError,
            failed_test_case: None,
            passed_test_cases: 0,
            total_test_cases: problem.test_cases.len(),
            elapsed_ms: None,
            memory_used_bytes: None,
            error_message: Some(diagnostic),
            output: None,
        }
    }
}

/// Orchestrates compile and test execution for one submission at a time;
/// share it behind an `Arc` to judge many concurrently.
pub struct JudgeEngine {
    registry: Arc<RuntimeRegistry>,
}

impl JudgeEngine {
    pub fn new(registry: Arc<RuntimeRegistry>) -> Self {
        Self { registry }
    }

    /// Judge `request` against `problem`.
    ///
    /// Every submission-caused failure is an `Ok` result with its status;
    /// `Err` means the request itself was unusable, the run was cancelled,
    /// or the judging infrastructure failed.
    pub async fn judge(
        &self,
        problem: &Problem,
        request: &JudgeRequest,
        cancel: &CancellationToken,
    ) -> JudgeOutcome<JudgeResult> {
        problem
            .validate()
            .map_err(|reason| JudgeError::InvalidProblem {
                id: problem.id.clone(),
                reason,
            })?;

        let runtime = self
            .registry
            .get(&request.language)
            .ok_or_else(|| JudgeError::UnsupportedLanguage(request.language.clone()))?;

        info!(
            "Judging submission {} for problem {} ({}, {} test cases)",
            request.submission_id,
            problem.id,
            runtime.language(),
            problem.test_cases.len()
        );

        // The artifact (and its workspace) lives until this function returns,
        // whichever way it returns.
        let artifact = match runtime.compile(&request.source_code, cancel).await? {
            Compilation::Ready(artifact) => artifact,
            Compilation::Rejected { diagnostic } => {
                info!(
                    "Submission {} verdict: {}",
                    request.submission_id,
                    StatusCode::CompileError
                );
                return Ok(JudgeResult::compile_error(request, problem, diagnostic));
            }
        };

        let limits = runtime.limits_for(&problem.limits());
        let total = problem.test_cases.len();
        let mut max_elapsed = Duration::ZERO;
        let mut max_memory = 0u64;

        for (idx, tc) in problem.test_cases.iter().enumerate() {
            let outcome = runtime.run(&artifact, &tc.input, &limits, cancel).await?;
            let verdict = classify(&outcome, tc, &problem.comparison);

            debug!(
                "Submission {} test case {}/{}: {:?} in {:?}",
                request.submission_id,
                idx + 1,
                total,
                verdict.unwrap_or(StatusCode::Accepted),
                outcome.elapsed
            );

            let Some(status) = verdict else {
                max_elapsed = max_elapsed.max(outcome.elapsed);
                max_memory = max_memory.max(outcome.peak_memory_bytes);
                continue;
            };

            info!(
                "Submission {} verdict: {} on test case {}",
                request.submission_id,
                status,
                idx + 1
            );
            return Ok(JudgeResult {
                submission_id: request.submission_id.clone(),
                status,
                failed_test_case: Some(idx + 1),
                passed_test_cases: idx,
                total_test_cases: total,
                elapsed_ms: Some(millis(outcome.elapsed)),
                memory_used_bytes: Some(outcome.peak_memory_bytes),
                error_message: failure_message(&outcome),
                output: output_preview(&outcome),
            });
        }

        info!(
            "Submission {} verdict: {}",
            request.submission_id,
            StatusCode::Accepted
        );
        Ok(JudgeResult {
            submission_id: request.submission_id.clone(),
            status: StatusCode::Accepted,
            failed_test_case: None,
            passed_test_cases: total,
            total_test_cases: total,
            elapsed_ms: Some(millis(max_elapsed)),
            memory_used_bytes: Some(max_memory),
            error_message: None,
            output: None,
        })
    }
}

/// Map one test case's outcome to a failing status, or `None` if it passed
pub fn classify(
    outcome: &ExecutionOutcome,
    test_case: &TestCase,
    comparison: &Comparison,
) -> Option<StatusCode> {
    match outcome.status {
        ExecutionStatus::TimeLimitExceeded => Some(StatusCode::TimeLimitExceeded),
        ExecutionStatus::MemoryLimitExceeded => Some(StatusCode::MemoryLimitExceeded),
        ExecutionStatus::Exited(0) => {
            // Output cut at the cap can never be trusted to match
            if !outcome.stdout_truncated
                && comparison.matches(&outcome.stdout, &test_case.expected_output)
            {
                None
            } else {
                Some(StatusCode::WrongAnswer)
            }
        }
        ExecutionStatus::Exited(_) | ExecutionStatus::Signaled(_) => Some(StatusCode::RuntimeError),
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn failure_message(outcome: &ExecutionOutcome) -> Option<String> {
    match outcome.status {
        ExecutionStatus::Exited(0) if outcome.stdout_truncated => {
            Some("Output limit exceeded".to_string())
        }
        ExecutionStatus::Exited(code) if code != 0 => Some(
            tail(&outcome.stderr, STDERR_TAIL_BYTES)
                .unwrap_or_else(|| format!("Process exited with code {}", code)),
        ),
        ExecutionStatus::Signaled(sig) => Some(
            tail(&outcome.stderr, STDERR_TAIL_BYTES)
                .unwrap_or_else(|| format!("Process killed by signal {}", sig)),
        ),
        _ => None,
    }
}

fn output_preview(outcome: &ExecutionOutcome) -> Option<String> {
    if outcome.stdout.is_empty() {
        return None;
    }
    let mut end = outcome.stdout.len().min(OUTPUT_PREVIEW_BYTES);
    while !outcome.stdout.is_char_boundary(end) {
        end -= 1;
    }
    Some(outcome.stdout[..end].to_string())
}

/// Last `max` bytes of `s`, or `None` if there is nothing but whitespace
fn tail(s: &str, max: usize) -> Option<String> {
    let trimmed = s.trim_end();
    if trimmed.trim().is_empty() {
        return None;
    }
    let mut start = trimmed.len().saturating_sub(max);
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    Some(trimmed[start..].to_string())
}
