//! Compiler module - Source code compilation
//!
//! Runs a toolchain step (a real compiler, or a syntax checker for
//! interpreted languages) inside the sandbox and turns the outcome into a
//! pass/fail with the diagnostic a user should see.

use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::sandbox::{CommandSpec, ExecutionLimits, ExecutionStatus, Executor, SandboxError};

/// Result of a compilation attempt
#[derive(Debug)]
pub struct CompileResult {
    pub success: bool,
    pub message: Option<String>,
}

impl CompileResult {
    fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }
}

/// Compile source code inside the sandbox
///
/// A toolchain that cannot be started at all is an `Err`; a toolchain that
/// runs and rejects the source is `Ok` with `success == false`.
pub async fn compile_in_sandbox(
    executor: &dyn Executor,
    source_dir: &Path,
    compile_cmd: &[String],
    limits: &ExecutionLimits,
    cancel: &CancellationToken,
) -> Result<CompileResult, SandboxError> {
    if compile_cmd.is_empty() {
        return Ok(CompileResult::ok());
    }

    debug!("Compiling with {:?} inside sandbox", compile_cmd);

    let cmd = CommandSpec::from_vec(compile_cmd).with_work_dir(source_dir);
    let result = executor.execute(&cmd, "", limits, cancel).await?;

    if result.is_success() {
        return Ok(CompileResult::ok());
    }

    let error_msg = if !result.stderr.trim().is_empty() {
        result.stderr
    } else if !result.stdout.trim().is_empty() {
        result.stdout
    } else {
        match result.status {
            ExecutionStatus::TimeLimitExceeded => "Compilation timed out".to_string(),
            ExecutionStatus::MemoryLimitExceeded => {
                "Compilation exceeded the memory limit".to_string()
            }
            ExecutionStatus::Signaled(_) => "Compiler crashed".to_string(),
            ExecutionStatus::Exited(code) => {
                format!("Compilation failed with exit code {}", code)
            }
        }
    };

    Ok(CompileResult {
        success: false,
        message: Some(error_msg),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ProcessSandbox;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn test_success() {
        let dir = tempfile::tempdir().unwrap();
        let result = compile_in_sandbox(
            &ProcessSandbox::default(),
            dir.path(),
            &sh("touch main"),
            &ExecutionLimits::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(result.success);
        assert!(dir.path().join("main").exists());
    }

    #[tokio::test]
    async fn test_diagnostic_from_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let result = compile_in_sandbox(
            &ProcessSandbox::default(),
            dir.path(),
            &sh("echo 'main.c:1: error: expected ;' >&2; exit 1"),
            &ExecutionLimits::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(!result.success);
        assert_eq!(result.message.as_deref(), Some("main.c:1: error: expected ;\n"));
    }

    #[tokio::test]
    async fn test_silent_failure_gets_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let result = compile_in_sandbox(
            &ProcessSandbox::default(),
            dir.path(),
            &sh("exit 4"),
            &ExecutionLimits::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(
            result.message.as_deref(),
            Some("Compilation failed with exit code 4")
        );
    }

    #[tokio::test]
    async fn test_compiler_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let result = compile_in_sandbox(
            &ProcessSandbox::default(),
            dir.path(),
            &sh("while :; do :; done"),
            &ExecutionLimits::from_millis_and_mb(200, 256),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(!result.success);
        assert_eq!(result.message.as_deref(), Some("Compilation timed out"));
    }

    #[tokio::test]
    async fn test_empty_command_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let result = compile_in_sandbox(
            &ProcessSandbox::default(),
            dir.path(),
            &[],
            &ExecutionLimits::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(result.success);
    }
}
