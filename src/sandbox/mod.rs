//! Sandbox module - Sandboxed Executor
//!
//! Runs exactly one external program under a wall-clock limit and a memory
//! ceiling, and guarantees the program and everything it spawned are gone
//! when `execute` returns.
//!
//! Containment comes from a per-run cgroup v2 when a delegated cgroup root is
//! configured. Without one, the run is tracked by its process group and by a
//! run tag inherited through the environment (see [`tracking`]).
//!
//! The sandbox module does NOT:
//! - Interpret verdicts (that's the judge's job)
//! - Know about languages or compilation
//! - Compare outputs

pub mod cgroup;
pub mod limits;
pub mod process;
pub mod tracking;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use process::ProcessSandbox;

/// Command specification for execution
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program path or name
    pub program: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Working directory
    pub work_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    /// Set the working directory. A program given as `./name` is resolved
    /// against it, so the child never depends on the caller's cwd.
    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        if let Some(rest) = self.program.strip_prefix("./") {
            self.program = dir.join(rest).to_string_lossy().into_owned();
        }
        self.work_dir = Some(dir);
        self
    }

    /// Create from a command vector (first element is program, rest are args)
    pub fn from_vec(cmd: &[String]) -> Self {
        let mut iter = cmd.iter();
        let program = iter.next().cloned().unwrap_or_default();
        Self::new(program).with_args(iter.cloned())
    }

    /// Convert to a vector of strings (program + args)
    pub fn to_vec(&self) -> Vec<String> {
        let mut v = vec![self.program.clone()];
        v.extend(self.args.iter().cloned());
        v
    }
}

/// Resource limits for one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Wall-clock limit
    pub time: Duration,
    /// Memory ceiling in bytes
    pub memory_bytes: u64,
    /// Hard RLIMIT_AS for the program, if any. Allocations past it fail
    /// inside the program instead of growing the host's memory use.
    pub address_space_bytes: Option<u64>,
}

/// Headroom between the memory ceiling and the address-space backstop
const ADDRESS_SPACE_SLACK_BYTES: u64 = 256 * 1024 * 1024;

impl ExecutionLimits {
    pub fn new(time: Duration, memory_bytes: u64) -> Self {
        Self {
            time,
            memory_bytes,
            address_space_bytes: None,
        }
    }

    pub fn from_millis_and_mb(time_ms: u64, memory_mb: u64) -> Self {
        Self::new(
            Duration::from_millis(time_ms),
            memory_mb.saturating_mul(1024 * 1024),
        )
    }

    /// Add an address-space backstop well above the memory ceiling, so the
    /// ceiling itself is still what a program normally runs into.
    pub fn with_address_space_backstop(mut self) -> Self {
        self.address_space_bytes = Some(
            self.memory_bytes
                .saturating_mul(4)
                .saturating_add(ADDRESS_SPACE_SLACK_BYTES),
        );
        self
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self::from_millis_and_mb(1000, 256)
    }
}

/// How an invocation ended (raw, no verdict interpretation)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Program exited normally with given exit code
    Exited(i32),
    /// Terminated by a signal it did not get from us
    Signaled(i32),
    /// Killed after exceeding the wall-clock (or CPU) limit
    TimeLimitExceeded,
    /// Killed after exceeding the memory ceiling
    MemoryLimitExceeded,
}

/// Outcome of running a program
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    /// Stdout content, lossily decoded
    pub stdout: String,
    /// Stderr content, lossily decoded
    pub stderr: String,
    /// Set when stdout went past the output cap and was cut
    pub stdout_truncated: bool,
    /// Wall-clock time from spawn to exit
    pub elapsed: Duration,
    /// Peak memory in bytes: the run's cgroup peak when contained, else
    /// the largest resident set of the program and the children it waited
    /// for (0 if not observable)
    pub peak_memory_bytes: u64,
}

impl ExecutionOutcome {
    /// Exited with code 0 within limits
    pub fn is_success(&self) -> bool {
        matches!(self.status, ExecutionStatus::Exited(0))
    }

    pub fn exit_code(&self) -> i32 {
        match self.status {
            ExecutionStatus::Exited(code) => code,
            _ => -1,
        }
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sandbox I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("empty command")]
    EmptyCommand,

    #[error("cgroup setup failed for {path}: {source}")]
    Cgroup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("execution cancelled")]
    Cancelled,
}

/// Sandboxed execution capability consumed by every language runtime
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `cmd` with `stdin` as its standard input under `limits`.
    ///
    /// Ordinary misbehavior of the program is reported in the outcome; an
    /// `Err` means the program could not be run or the call was cancelled.
    async fn execute(
        &self,
        cmd: &CommandSpec,
        stdin: &str,
        limits: &ExecutionLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, SandboxError>;
}
