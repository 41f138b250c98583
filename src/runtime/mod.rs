//! Runtime module - one uniform contract over every submission language
//!
//! - `CompiledRuntime`: a compiler turns the source into an artifact
//! - `InterpretedRuntime`: the source runs as-is after a syntax check
//!
//! Every compile gets its own temporary workspace, owned by the returned
//! [`CompiledArtifact`]; dropping the artifact removes the workspace, so no
//! file outlives the judging run that created it, whatever path it takes.

pub mod compiled;
pub mod interpreted;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::JudgeOutcome;
use crate::languages::{LanguageConfig, LanguageKind, LanguageTable};
use crate::sandbox::{CommandSpec, ExecutionLimits, ExecutionOutcome, Executor};

pub use compiled::CompiledRuntime;
pub use interpreted::InterpretedRuntime;

/// Runnable form of one submission, exclusive to one judging run
#[derive(Debug)]
pub struct CompiledArtifact {
    language: String,
    workspace: TempDir,
    run_command: Vec<String>,
}

impl CompiledArtifact {
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Directory holding the source and whatever the toolchain produced
    pub fn work_dir(&self) -> &Path {
        self.workspace.path()
    }

    /// Command that starts the program, rooted in the workspace
    pub fn command(&self) -> CommandSpec {
        CommandSpec::from_vec(&self.run_command).with_work_dir(self.work_dir())
    }
}

/// What the compile step produced
#[derive(Debug)]
pub enum Compilation {
    Ready(CompiledArtifact),
    /// The toolchain rejected the source
    Rejected { diagnostic: String },
}

/// Language-specific compile and run steps
#[async_trait]
pub trait LanguageRuntime: Send + Sync {
    /// Canonical language name
    fn language(&self) -> &str;

    /// Per-test limits for this language, derived from the problem's limits
    fn limits_for(&self, problem_limits: &ExecutionLimits) -> ExecutionLimits;

    /// Turn source text into a runnable artifact.
    ///
    /// A rejection by the toolchain is `Ok(Compilation::Rejected)`; `Err` is
    /// reserved for cancellation and infrastructure faults.
    async fn compile(
        &self,
        source_code: &str,
        cancel: &CancellationToken,
    ) -> JudgeOutcome<Compilation>;

    /// Run the artifact once with `input` on stdin.
    ///
    /// Crashes, non-zero exits and limit violations are reported in the
    /// outcome, never as errors.
    async fn run(
        &self,
        artifact: &CompiledArtifact,
        input: &str,
        limits: &ExecutionLimits,
        cancel: &CancellationToken,
    ) -> JudgeOutcome<ExecutionOutcome>;
}

/// Settings shared by all runtimes
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Parent directory of per-run workspaces (system temp dir if `None`)
    pub workspace_root: Option<PathBuf>,
    /// Limits applied to compile and syntax-check steps
    pub compile_limits: ExecutionLimits,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            workspace_root: None,
            compile_limits: ExecutionLimits::from_millis_and_mb(30_000, 2048),
        }
    }
}

/// State common to both runtime variants
#[derive(Clone)]
pub(crate) struct Toolchain {
    pub(crate) config: Arc<LanguageConfig>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) settings: RuntimeSettings,
}

impl Toolchain {
    /// Create a fresh workspace holding the submitted source
    pub(crate) async fn prepare_workspace(&self, source_code: &str) -> anyhow::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("judge-");
        let workspace = match &self.settings.workspace_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };

        let source_path = workspace.path().join(&self.config.source_file);
        tokio::fs::write(&source_path, source_code).await?;
        debug!(
            "Prepared {} workspace at {:?}",
            self.config.name,
            workspace.path()
        );

        Ok(workspace)
    }

    pub(crate) fn artifact(&self, workspace: TempDir) -> CompiledArtifact {
        CompiledArtifact {
            language: self.config.name.clone(),
            workspace,
            run_command: self.config.run_command.clone(),
        }
    }

    pub(crate) async fn run(
        &self,
        artifact: &CompiledArtifact,
        input: &str,
        limits: &ExecutionLimits,
        cancel: &CancellationToken,
    ) -> JudgeOutcome<ExecutionOutcome> {
        let outcome = self
            .executor
            .execute(&artifact.command(), input, limits, cancel)
            .await?;
        Ok(outcome)
    }
}

/// Mapping from language tag to runtime, built once at startup
#[derive(Clone, Default)]
pub struct RuntimeRegistry {
    runtimes: HashMap<String, Arc<dyn LanguageRuntime>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one runtime per configured language, reachable by every alias
    pub fn from_languages(
        table: &LanguageTable,
        executor: Arc<dyn Executor>,
        settings: RuntimeSettings,
    ) -> Self {
        let mut registry = Self::new();
        let mut built: HashMap<String, Arc<dyn LanguageRuntime>> = HashMap::new();

        for (tag, config) in table.tags() {
            let runtime = built
                .entry(config.name.clone())
                .or_insert_with(|| {
                    let toolchain = Toolchain {
                        config: Arc::clone(config),
                        executor: Arc::clone(&executor),
                        settings: settings.clone(),
                    };
                    let runtime: Arc<dyn LanguageRuntime> = match &config.kind {
                        LanguageKind::Compiled { compile_command } => {
                            Arc::new(CompiledRuntime::new(toolchain, compile_command.clone()))
                        }
                        LanguageKind::Interpreted { check_command } => {
                            Arc::new(InterpretedRuntime::new(toolchain, check_command.clone()))
                        }
                    };
                    runtime
                })
                .clone();
            registry.register(tag, runtime);
        }

        registry
    }

    pub fn register(&mut self, tag: &str, runtime: Arc<dyn LanguageRuntime>) {
        self.runtimes.insert(tag.to_lowercase(), runtime);
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn LanguageRuntime>> {
        self.runtimes.get(&tag.to_lowercase()).cloned()
    }

    /// All registered tags, sorted
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.runtimes.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}
