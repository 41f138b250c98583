//! Process sandbox implementation
//!
//! Spawns the program as the leader of a fresh process group, feeds stdin on
//! its own task, drains stdout/stderr concurrently, and supervises the wall
//! clock, the memory ceiling and cancellation. The child is reaped with
//! `wait4` so its peak resident set is known even when it exits between two
//! samples. Whatever happens, the process group and every process tagged
//! with the run (or the run's cgroup) is SIGKILLed before `execute` returns.

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::cgroup::{CgroupRoot, CgroupUsage, RunCgroup};
use super::limits::{sample_memory_bytes, wait_for_exit, ChildRlimits, Reaped};
use super::tracking::{kill_tagged, next_run_id, RUN_TAG_VAR};
use super::{CommandSpec, ExecutionLimits, ExecutionOutcome, ExecutionStatus, Executor, SandboxError};

/// Default cap on captured stdout (64 MiB)
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 64 * 1024 * 1024;
/// Cap on captured stderr; only used for diagnostics
const STDERR_LIMIT_BYTES: usize = 64 * 1024;
/// Largest file a program may create (256 MiB)
const FSIZE_LIMIT_BYTES: u64 = 256 * 1024 * 1024;
/// How long to wait for pipes to close after the run is gone
const PIPE_GRACE: Duration = Duration::from_millis(500);

/// Executor that runs programs as supervised host processes
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    output_limit_bytes: usize,
    poll_interval: Duration,
    cgroup_root: Option<CgroupRoot>,
}

impl ProcessSandbox {
    pub fn new(output_limit_bytes: usize, poll_interval: Duration) -> Self {
        Self {
            output_limit_bytes,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            cgroup_root: None,
        }
    }

    /// Contain every run in its own cgroup below `root`
    pub fn with_cgroup_root(mut self, root: CgroupRoot) -> Self {
        self.cgroup_root = Some(root);
        self
    }

    fn build_command(
        &self,
        cmd: &CommandSpec,
        limits: &ExecutionLimits,
        run_id: &str,
        cgroup: Option<&RunCgroup>,
    ) -> Command {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .env_clear()
            .env(
                "PATH",
                std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".into()),
            )
            .env("LANG", "C.UTF-8")
            .env(RUN_TAG_VAR, run_id);

        if let Some(dir) = &cmd.work_dir {
            command.current_dir(dir).env("HOME", dir);
        }

        let rlimits = ChildRlimits::for_limits(limits, FSIZE_LIMIT_BYTES);
        let cgroup_fd = cgroup.and_then(RunCgroup::procs_fd);
        // SAFETY: the closure only makes async-signal-safe calls (prctl,
        // setrlimit, write) and touches no shared state.
        unsafe {
            command.pre_exec(move || {
                if let Some(fd) = cgroup_fd {
                    RunCgroup::join_from_child(fd)?;
                }
                #[cfg(target_os = "linux")]
                nix::sys::prctl::set_pdeathsig(Signal::SIGKILL)?;
                rlimits.apply()
            });
        }

        command
    }
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_LIMIT_BYTES, Duration::from_millis(10))
    }
}

/// Why supervision stopped
enum Ending {
    Exited(Reaped),
    TimedOut,
    OutOfMemory,
    Cancelled,
}

/// Everything a run can leave behind. Killed explicitly on the normal path
/// and again on drop, so even a dropped `execute` future leaves nothing.
struct RunGuard {
    pgid: Option<Pid>,
    run_id: String,
    cgroup: Option<RunCgroup>,
    done: bool,
}

impl RunGuard {
    fn kill_group(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("Failed to kill process group {}: {}", pgid, e),
        }
    }

    /// Kill the group, then whatever escaped it, and wait for the cgroup to
    /// empty when there is one.
    async fn shutdown(&mut self) {
        self.kill_group();
        match &self.cgroup {
            Some(cgroup) => {
                cgroup.kill();
                cgroup.drain().await;
            }
            None => {
                let run_id = self.run_id.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || kill_tagged(&run_id)).await {
                    warn!("Sweep for run {} failed: {}", self.run_id, e);
                    kill_tagged(&self.run_id);
                }
            }
        }
        self.done = true;
    }

    fn usage(&self) -> CgroupUsage {
        self.cgroup.as_ref().map(RunCgroup::usage).unwrap_or_default()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.kill_group();
        match &self.cgroup {
            Some(cgroup) => cgroup.kill(),
            None => {
                kill_tagged(&self.run_id);
            }
        }
    }
}

#[async_trait]
impl Executor for ProcessSandbox {
    async fn execute(
        &self,
        cmd: &CommandSpec,
        stdin: &str,
        limits: &ExecutionLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, SandboxError> {
        if cmd.program.is_empty() {
            return Err(SandboxError::EmptyCommand);
        }
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }

        let run_id = next_run_id();
        debug!(
            "Running sandboxed command {:?} as run {} (time={:?}, memory={}B)",
            cmd.to_vec(),
            run_id,
            limits.time,
            limits.memory_bytes
        );

        let cgroup = match &self.cgroup_root {
            Some(root) => Some(root.create_run(&run_id, limits)?),
            None => None,
        };
        let mut command = self.build_command(cmd, limits, &run_id, cgroup.as_ref());
        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;

        let pid = child.id();
        let mut guard = RunGuard {
            pgid: i32::try_from(pid).ok().map(Pid::from_raw),
            run_id,
            cgroup,
            done: false,
        };

        // The child is only ever reaped here, through wait4.
        let mut waiter = tokio::task::spawn_blocking(move || wait_for_exit(pid));

        let stdin_task = match child.stdin.take() {
            Some(pipe) => {
                let mut pipe = tokio::process::ChildStdin::from_std(pipe)?;
                let input = stdin.as_bytes().to_vec();
                Some(tokio::spawn(async move {
                    // A program that never reads its input closes the pipe early;
                    // that is its own business.
                    let _ = pipe.write_all(&input).await;
                    let _ = pipe.shutdown().await;
                }))
            }
            None => None,
        };
        let stdout_task = match child.stdout.take() {
            Some(pipe) => Some(tokio::spawn(read_capped(
                tokio::process::ChildStdout::from_std(pipe)?,
                self.output_limit_bytes,
            ))),
            None => None,
        };
        let stderr_task = match child.stderr.take() {
            Some(pipe) => Some(tokio::spawn(read_capped(
                tokio::process::ChildStderr::from_std(pipe)?,
                STDERR_LIMIT_BYTES,
            ))),
            None => None,
        };

        let deadline = tokio::time::sleep(limits.time);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The cgroup enforces the ceiling itself
        let sampling = guard.cgroup.is_none();
        let mut sampled_peak = 0u64;

        let ending = loop {
            tokio::select! {
                biased;
                reaped = &mut waiter => break Ending::Exited(join_waiter(reaped)?),
                _ = cancel.cancelled() => break Ending::Cancelled,
                _ = &mut deadline => break Ending::TimedOut,
                _ = ticker.tick(), if sampling => {
                    if let Some(bytes) = sample_memory_bytes(pid) {
                        sampled_peak = sampled_peak.max(bytes);
                        if sampled_peak > limits.memory_bytes {
                            break Ending::OutOfMemory;
                        }
                    }
                }
            }
        };
        let elapsed = started.elapsed();

        // Reap stragglers: background children, escaped sessions, or the
        // whole tree when we are the ones stopping it.
        guard.shutdown().await;
        let reaped = match ending {
            Ending::Exited(reaped) => Some(reaped),
            _ => join_waiter(waiter.await).ok(),
        };
        if let Some(task) = stdin_task {
            task.abort();
        }

        let usage = guard.usage();
        let peak_memory = sampled_peak
            .max(reaped.map_or(0, |r| r.max_rss_bytes))
            .max(usage.peak_bytes);

        let status = match ending {
            Ending::Cancelled => {
                abort_reader(stdout_task);
                abort_reader(stderr_task);
                debug!("Sandboxed command {:?} cancelled", cmd.program);
                return Err(SandboxError::Cancelled);
            }
            Ending::TimedOut => ExecutionStatus::TimeLimitExceeded,
            Ending::OutOfMemory => ExecutionStatus::MemoryLimitExceeded,
            Ending::Exited(reaped) => classify_exit(reaped.status, elapsed, peak_memory, usage, limits),
        };

        // Output of a killed program is never looked at.
        let killed = matches!(
            status,
            ExecutionStatus::TimeLimitExceeded | ExecutionStatus::MemoryLimitExceeded
        );
        let (stdout, stdout_truncated, stderr) = if killed {
            abort_reader(stdout_task);
            abort_reader(stderr_task);
            (Vec::new(), false, Vec::new())
        } else {
            let (stdout, truncated) = join_reader(stdout_task).await;
            let (stderr, _) = join_reader(stderr_task).await;
            (stdout, truncated, stderr)
        };

        debug!(
            "Sandboxed command {:?} finished: {:?} in {:?}, peak {}B",
            cmd.program, status, elapsed, peak_memory
        );

        Ok(ExecutionOutcome {
            status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            stdout_truncated,
            elapsed,
            peak_memory_bytes: peak_memory,
        })
    }
}

fn join_waiter(
    joined: Result<std::io::Result<Reaped>, tokio::task::JoinError>,
) -> Result<Reaped, SandboxError> {
    match joined {
        Ok(reaped) => Ok(reaped?),
        Err(e) => Err(SandboxError::Io(std::io::Error::other(e))),
    }
}

fn classify_exit(
    exit: ExitStatus,
    elapsed: Duration,
    peak_memory: u64,
    usage: CgroupUsage,
    limits: &ExecutionLimits,
) -> ExecutionStatus {
    if exit.signal() == Some(Signal::SIGXCPU as i32) || elapsed > limits.time {
        return ExecutionStatus::TimeLimitExceeded;
    }
    if usage.oom_kills > 0 || peak_memory > limits.memory_bytes {
        return ExecutionStatus::MemoryLimitExceeded;
    }
    match (exit.code(), exit.signal()) {
        (Some(code), _) => ExecutionStatus::Exited(code),
        (None, Some(sig)) => ExecutionStatus::Signaled(sig),
        (None, None) => ExecutionStatus::Exited(-1),
    }
}

/// Read everything from `reader`, keeping at most `cap` bytes.
///
/// Keeps draining past the cap so a chatty program never blocks on a full
/// pipe; the flag reports whether anything was dropped.
async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    cap: usize,
) -> std::io::Result<(Vec<u8>, bool)> {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(kept.len());
        if n > room {
            truncated = true;
        }
        kept.extend_from_slice(&buf[..n.min(room)]);
    }

    Ok((kept, truncated))
}

type ReaderTask = Option<JoinHandle<std::io::Result<(Vec<u8>, bool)>>>;

/// Collect a reader's output. Output that could not be read completely is
/// reported as truncated, never as a complete empty string.
async fn join_reader(task: ReaderTask) -> (Vec<u8>, bool) {
    join_reader_within(task, PIPE_GRACE).await
}

async fn join_reader_within(task: ReaderTask, grace: Duration) -> (Vec<u8>, bool) {
    let Some(mut task) = task else {
        return (Vec::new(), false);
    };
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(Ok(read))) => read,
        Ok(Ok(Err(e))) => {
            warn!("Failed to read program output: {}", e);
            (Vec::new(), true)
        }
        Ok(Err(e)) => {
            warn!("Output reader task failed: {}", e);
            (Vec::new(), true)
        }
        Err(_) => {
            // Something outside the run still holds the pipe.
            warn!("Output pipe still open {:?} after the run ended", grace);
            task.abort();
            (Vec::new(), true)
        }
    }
}

fn abort_reader(task: ReaderTask) {
    if let Some(task) = task {
        task.abort();
    }
}
