//! Runtime for languages that run from source (Python, JavaScript, Bash)
//!
//! The compile step only validates syntax; the artifact is the workspace
//! holding the untouched source.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{CompiledArtifact, Compilation, LanguageRuntime, Toolchain};
use crate::compiler::compile_in_sandbox;
use crate::error::JudgeOutcome;
use crate::sandbox::{ExecutionLimits, ExecutionOutcome};

pub struct InterpretedRuntime {
    toolchain: Toolchain,
    check_command: Option<Vec<String>>,
}

impl InterpretedRuntime {
    pub(crate) fn new(toolchain: Toolchain, check_command: Option<Vec<String>>) -> Self {
        Self {
            toolchain,
            check_command,
        }
    }
}

#[async_trait]
impl LanguageRuntime for InterpretedRuntime {
    fn language(&self) -> &str {
        &self.toolchain.config.name
    }

    fn limits_for(&self, problem_limits: &ExecutionLimits) -> ExecutionLimits {
        self.toolchain.config.adjust_limits(problem_limits)
    }

    async fn compile(
        &self,
        source_code: &str,
        cancel: &CancellationToken,
    ) -> JudgeOutcome<Compilation> {
        let workspace = self.toolchain.prepare_workspace(source_code).await?;

        if let Some(check_command) = &self.check_command {
            let result = compile_in_sandbox(
                self.toolchain.executor.as_ref(),
                workspace.path(),
                check_command,
                &self.toolchain.settings.compile_limits,
                cancel,
            )
            .await?;

            if !result.success {
                debug!("{} syntax check rejected the source", self.language());
                return Ok(Compilation::Rejected {
                    diagnostic: result.message.unwrap_or_default(),
                });
            }
        }

        Ok(Compilation::Ready(self.toolchain.artifact(workspace)))
    }

    async fn run(
        &self,
        artifact: &CompiledArtifact,
        input: &str,
        limits: &ExecutionLimits,
        cancel: &CancellationToken,
    ) -> JudgeOutcome<ExecutionOutcome> {
        self.toolchain.run(artifact, input, limits, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JudgeError;
    use crate::languages::LanguageTable;
    use crate::runtime::{LanguageRuntime, RuntimeRegistry, RuntimeSettings};
    use crate::sandbox::{ExecutionStatus, ProcessSandbox};
    use std::sync::Arc;

    fn bash() -> Arc<dyn LanguageRuntime> {
        let table = LanguageTable::builtin().unwrap();
        RuntimeRegistry::from_languages(
            &table,
            Arc::new(ProcessSandbox::default()),
            RuntimeSettings::default(),
        )
        .get("bash")
        .unwrap()
    }

    #[tokio::test]
    async fn test_syntax_error_is_rejected() {
        let result = bash()
            .compile("if then fi (", &CancellationToken::new())
            .await
            .unwrap();
        match result {
            Compilation::Rejected { diagnostic } => assert!(diagnostic.contains("syntax error")),
            Compilation::Ready(_) => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn test_runtime_failure_is_an_outcome() {
        let runtime = bash();
        let cancel = CancellationToken::new();
        let Compilation::Ready(artifact) = runtime.compile("exit 7", &cancel).await.unwrap() else {
            panic!("expected artifact");
        };
        let outcome = runtime
            .run(&artifact, "", &ExecutionLimits::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Exited(7));
    }

    #[tokio::test]
    async fn test_no_check_command() {
        let table = LanguageTable::from_toml_str(
            r#"
[plain]
source_file = "main.sh"
run_command = "sh main.sh"
"#,
        )
        .unwrap();
        let runtime = RuntimeRegistry::from_languages(
            &table,
            Arc::new(ProcessSandbox::default()),
            RuntimeSettings::default(),
        )
        .get("plain")
        .unwrap();

        // Without a checker nothing is rejected up front
        let result = runtime
            .compile("this is not ( valid", &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(result, Compilation::Ready(_)));
    }

    #[tokio::test]
    async fn test_cancelled_compile() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = bash().compile("echo hi", &cancel).await;
        assert!(matches!(result, Err(JudgeError::Cancelled)));
    }
}
