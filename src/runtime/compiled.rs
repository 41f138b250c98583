//! Runtime for languages with a separate compile step (C, C++, Java, Rust)

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{CompiledArtifact, Compilation, LanguageRuntime, Toolchain};
use crate::compiler::compile_in_sandbox;
use crate::error::JudgeOutcome;
use crate::sandbox::{ExecutionLimits, ExecutionOutcome};

pub struct CompiledRuntime {
    toolchain: Toolchain,
    compile_command: Vec<String>,
}

impl CompiledRuntime {
    pub(crate) fn new(toolchain: Toolchain, compile_command: Vec<String>) -> Self {
        Self {
            toolchain,
            compile_command,
        }
    }
}

#[async_trait]
impl LanguageRuntime for CompiledRuntime {
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

        let result = compile_in_sandbox(
            self.toolchain.executor.as_ref(),
            workspace.path(),
            &self.compile_command,
            &self.toolchain.settings.compile_limits,
            cancel,
        )
        .await?;

        if !result.success {
            debug!("{} compilation rejected the source", self.language());
            return Ok(Compilation::Rejected {
                diagnostic: result.message.unwrap_or_default(),
            });
        }

        info!("Compiled {} submission in {:?}", self.language(), workspace.path());
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
    use crate::languages::LanguageTable;
    use crate::runtime::{RuntimeRegistry, RuntimeSettings};
    use crate::sandbox::{ExecutionStatus, ProcessSandbox};
    use std::sync::Arc;

    /// Stand-in toolchains built from coreutils: `copy` "compiles" by
    /// producing a separate artifact, `checked` by rejecting bad syntax.
    const TEST_LANGUAGES: &str = r#"
[copy]
source_file = "main.src"
compile_command = "cp main.src main"
run_command = "sh main"

[checked]
source_file = "main.src"
compile_command = "sh -n main.src"
run_command = "sh main.src"
"#;

    fn runtime(name: &str) -> Arc<dyn LanguageRuntime> {
        let table = LanguageTable::from_toml_str(TEST_LANGUAGES).unwrap();
        RuntimeRegistry::from_languages(
            &table,
            Arc::new(ProcessSandbox::default()),
            RuntimeSettings::default(),
        )
        .get(name)
        .unwrap()
    }

    #[tokio::test]
    async fn test_compile_and_run() {
        let runtime = runtime("copy");
        let cancel = CancellationToken::new();

        let Compilation::Ready(artifact) = runtime
            .compile("read n; echo $((n * 2))", &cancel)
            .await
            .unwrap()
        else {
            panic!("expected a compiled artifact");
        };
        assert!(artifact.work_dir().join("main").exists());
        assert_eq!(artifact.language(), "copy");

        let outcome = runtime
            .run(&artifact, "21\n", &ExecutionLimits::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Exited(0));
        assert_eq!(outcome.stdout, "42\n");
    }

    #[tokio::test]
    async fn test_compile_error_carries_diagnostic() {
        let result = runtime("checked")
            .compile("if then fi (", &CancellationToken::new())
            .await
            .unwrap();
        match result {
            Compilation::Rejected { diagnostic } => assert!(diagnostic.contains("main.src")),
            Compilation::Ready(_) => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn test_each_compile_gets_its_own_workspace() {
        let runtime = runtime("copy");
        let cancel = CancellationToken::new();
        let (Compilation::Ready(a), Compilation::Ready(b)) = (
            runtime.compile("echo a", &cancel).await.unwrap(),
            runtime.compile("echo a", &cancel).await.unwrap(),
        ) else {
            panic!("expected compiled artifacts");
        };
        assert_ne!(a.work_dir(), b.work_dir());
    }
}
