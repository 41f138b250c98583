//! Worker configuration
//!
//! Loaded once at startup from the environment (a `.env` file is honored by
//! the binary through `dotenvy`).

use anyhow::Context;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::languages::LanguageTable;
use crate::pool::JudgePool;
use crate::runtime::RuntimeSettings;
use crate::sandbox::cgroup::CgroupRoot;
use crate::sandbox::{ExecutionLimits, ProcessSandbox};

/// Judge worker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeConfig {
    /// Languages TOML overriding the built-in table
    pub languages_config: Option<PathBuf>,
    /// Directory of `<id>.json` problem files
    pub problems_dir: PathBuf,
    /// Parent of per-run workspaces (default: system temp dir)
    pub work_dir: Option<PathBuf>,
    /// Concurrent judging runs (default: CPU cores)
    pub max_workers: usize,
    /// Compile time limit in milliseconds (default: 30000ms = 30s)
    pub compile_time_limit_ms: u64,
    /// Compile memory limit in MB (default: 2048MB)
    pub compile_memory_limit_mb: u64,
    /// Captured stdout per run, in bytes
    pub output_limit_bytes: usize,
    /// How often a running program's memory is sampled
    pub memory_poll_interval_ms: u64,
    /// Delegated cgroup v2 directory; runs get a child cgroup each when set
    pub cgroup_root: Option<PathBuf>,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            languages_config: None,
            problems_dir: PathBuf::from("./problems"),
            work_dir: None,
            max_workers: JudgePool::default_size(),
            compile_time_limit_ms: 30_000,
            compile_memory_limit_mb: 2048,
            output_limit_bytes: 64 * 1024 * 1024,
            memory_poll_interval_ms: 10,
            cgroup_root: None,
        }
    }
}

impl JudgeConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key-value source; unset or empty keys keep defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            languages_config: lookup("LANGUAGES_CONFIG").map(PathBuf::from),
            problems_dir: lookup("PROBLEMS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.problems_dir),
            work_dir: lookup("JUDGE_WORK_DIR").map(PathBuf::from),
            max_workers: parse_or(&lookup, "JUDGE_MAX_WORKERS", defaults.max_workers)?,
            compile_time_limit_ms: parse_or(
                &lookup,
                "COMPILE_TIME_LIMIT_MS",
                defaults.compile_time_limit_ms,
            )?,
            compile_memory_limit_mb: parse_or(
                &lookup,
                "COMPILE_MEMORY_LIMIT_MB",
                defaults.compile_memory_limit_mb,
            )?,
            output_limit_bytes: parse_or(
                &lookup,
                "OUTPUT_LIMIT_BYTES",
                defaults.output_limit_bytes,
            )?,
            memory_poll_interval_ms: parse_or(
                &lookup,
                "MEMORY_POLL_INTERVAL_MS",
                defaults.memory_poll_interval_ms,
            )?,
            cgroup_root: lookup("JUDGE_CGROUP_ROOT").map(PathBuf::from),
        };

        anyhow::ensure!(config.max_workers > 0, "JUDGE_MAX_WORKERS must be positive");
        anyhow::ensure!(
            config.compile_time_limit_ms > 0 && config.compile_memory_limit_mb > 0,
            "compile limits must be positive"
        );
        Ok(config)
    }

    /// The configured language table, or the built-in one
    pub fn language_table(&self) -> anyhow::Result<LanguageTable> {
        match &self.languages_config {
            Some(path) => LanguageTable::from_path(path),
            None => LanguageTable::builtin(),
        }
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            workspace_root: self.work_dir.clone(),
            compile_limits: ExecutionLimits::from_millis_and_mb(
                self.compile_time_limit_ms,
                self.compile_memory_limit_mb,
            ),
        }
    }

    /// The process sandbox, contained in cgroups when a root is configured
    pub fn sandbox(&self) -> anyhow::Result<ProcessSandbox> {
        let sandbox = ProcessSandbox::new(
            self.output_limit_bytes,
            Duration::from_millis(self.memory_poll_interval_ms),
        );
        match &self.cgroup_root {
            Some(path) => {
                let root = CgroupRoot::prepare(path)
                    .with_context(|| format!("Unusable JUDGE_CGROUP_ROOT {}", path.display()))?;
                Ok(sandbox.with_cgroup_root(root))
            }
            None => Ok(sandbox),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
