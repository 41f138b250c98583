//! Per-run cgroup v2 containment
//!
//! Given a delegated cgroup directory, each run gets a child cgroup with
//! `memory.max` set to its ceiling and swap disabled. The child process
//! joins it between fork and exec, so everything it ever spawns is counted
//! against the ceiling and killed together through `cgroup.kill`.
//!
//! The worker itself must not be a member of the root it is given: cgroup v2
//! only lets leaf cgroups hold processes once controllers are enabled below.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::{ExecutionLimits, SandboxError};

/// How long to wait for a killed cgroup to empty
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const DRAIN_POLL: Duration = Duration::from_millis(5);

/// A delegated cgroup v2 directory that run cgroups are created under
#[derive(Debug, Clone)]
pub struct CgroupRoot {
    path: PathBuf,
}

impl CgroupRoot {
    /// Check that the memory controller is available and enable it for
    /// children of `path`.
    pub fn prepare(path: impl Into<PathBuf>) -> Result<Self, SandboxError> {
        let path = path.into();
        let fail = |source| SandboxError::Cgroup {
            path: path.clone(),
            source,
        };

        let controllers = std::fs::read_to_string(path.join("cgroup.controllers")).map_err(fail)?;
        if !controllers.split_whitespace().any(|c| c == "memory") {
            return Err(fail(io::Error::new(
                io::ErrorKind::Unsupported,
                "memory controller not delegated",
            )));
        }

        let enabled = std::fs::read_to_string(path.join("cgroup.subtree_control")).map_err(fail)?;
        if !enabled.split_whitespace().any(|c| c == "memory") {
            std::fs::write(path.join("cgroup.subtree_control"), "+memory").map_err(fail)?;
        }

        debug!("Using cgroup root {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the cgroup for one run, ready to be joined
    pub fn create_run(&self, run_id: &str, limits: &ExecutionLimits) -> Result<RunCgroup, SandboxError> {
        let path = self.path.join(format!("run-{}", run_id));
        let fail = |source| SandboxError::Cgroup {
            path: path.clone(),
            source,
        };

        std::fs::create_dir(&path).map_err(fail)?;
        // From here on Drop removes the directory
        let mut cgroup = RunCgroup {
            path: path.clone(),
            procs: None,
        };

        std::fs::write(path.join("memory.max"), limits.memory_bytes.to_string()).map_err(fail)?;
        // Optional knobs: absent without swap accounting or on older kernels
        if let Err(e) = std::fs::write(path.join("memory.swap.max"), "0") {
            debug!("memory.swap.max not set for {}: {}", path.display(), e);
        }
        if let Err(e) = std::fs::write(path.join("memory.oom.group"), "1") {
            debug!("memory.oom.group not set for {}: {}", path.display(), e);
        }

        let procs = OpenOptions::new()
            .write(true)
            .open(path.join("cgroup.procs"))
            .map_err(fail)?;
        cgroup.procs = Some(procs);
        Ok(cgroup)
    }
}

/// Memory figures read back after a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CgroupUsage {
    /// memory.peak, or memory.current where the kernel lacks it
    pub peak_bytes: u64,
    /// oom_kill count from memory.events
    pub oom_kills: u64,
}

/// The cgroup of one run; removed on drop
#[derive(Debug)]
pub struct RunCgroup {
    path: PathBuf,
    procs: Option<File>,
}

impl RunCgroup {
    /// Descriptor of `cgroup.procs`, open for writing.
    ///
    /// Writing "0" to it from the child moves the child into this cgroup.
    pub fn procs_fd(&self) -> Option<RawFd> {
        self.procs.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Join the calling process. Runs between fork and exec, so it only
    /// issues a raw `write`.
    pub fn join_from_child(fd: RawFd) -> io::Result<()> {
        // SAFETY: write(2) on an inherited descriptor is async-signal-safe
        let written = unsafe { libc::write(fd, b"0".as_ptr().cast(), 1) };
        if written == 1 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// SIGKILL every member. Prefers `cgroup.kill`, which also catches
    /// processes forked while the kill is in progress.
    pub fn kill(&self) {
        if std::fs::write(self.path.join("cgroup.kill"), "1").is_ok() {
            return;
        }
        // cgroup.kill needs Linux 5.14
        for _ in 0..16 {
            let pids = self.members();
            if pids.is_empty() {
                return;
            }
            for pid in pids {
                match kill(pid, Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => warn!("Failed to kill process {} in {}: {}", pid, self.path.display(), e),
                }
            }
        }
    }

    fn members(&self) -> Vec<Pid> {
        std::fs::read_to_string(self.path.join("cgroup.procs"))
            .map(|procs| {
                procs
                    .lines()
                    .filter_map(|line| line.trim().parse::<i32>().ok())
                    .map(Pid::from_raw)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_populated(&self) -> bool {
        std::fs::read_to_string(self.path.join("cgroup.events"))
            .ok()
            .and_then(|events| parse_keyed(&events, "populated"))
            .is_some_and(|populated| populated != 0)
    }

    /// Wait until every member has exited
    pub async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while self.is_populated() {
            if tokio::time::Instant::now() >= deadline {
                warn!("cgroup {} still populated after kill", self.path.display());
                return;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    pub fn usage(&self) -> CgroupUsage {
        let read = |file: &str| std::fs::read_to_string(self.path.join(file)).ok();

        let peak_bytes = read("memory.peak")
            .or_else(|| read("memory.current"))
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0);
        let oom_kills = read("memory.events")
            .and_then(|events| parse_keyed(&events, "oom_kill"))
            .unwrap_or(0);

        CgroupUsage {
            peak_bytes,
            oom_kills,
        }
    }
}

impl Drop for RunCgroup {
    fn drop(&mut self) {
        self.procs.take();
        if std::fs::remove_dir(&self.path).is_ok() {
            return;
        }
        // Still populated: kill and retry once the members are gone
        self.kill();
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
                    loop {
                        match std::fs::remove_dir(&path) {
                            Ok(()) => return,
                            Err(e) if tokio::time::Instant::now() >= deadline => {
                                warn!("Failed to remove cgroup {}: {}", path.display(), e);
                                return;
                            }
                            Err(_) => tokio::time::sleep(DRAIN_POLL).await,
                        }
                    }
                });
            }
            Err(_) => warn!("Leaving cgroup {} behind", path.display()),
        }
    }
}

/// Value of `key` in a flat-keyed cgroup file such as memory.events
pub fn parse_keyed(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? != key {
            return None;
        }
        parts.next()?.parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_events() {
        let events = "low 0\nhigh 0\nmax 12\noom 1\noom_kill 1\noom_group_kill 1\n";
        assert_eq!(parse_keyed(events, "oom_kill"), Some(1));
        assert_eq!(parse_keyed(events, "oom"), Some(1));
        assert_eq!(parse_keyed(events, "max"), Some(12));
        assert_eq!(parse_keyed(events, "missing"), None);
    }

    #[test]
    fn test_parse_cgroup_events() {
        assert_eq!(parse_keyed("populated 1\nfrozen 0\n", "populated"), Some(1));
        assert_eq!(parse_keyed("populated 0\nfrozen 0\n", "populated"), Some(0));
    }

    #[test]
    fn test_prepare_rejects_non_cgroup_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            CgroupRoot::prepare(dir.path()),
            Err(SandboxError::Cgroup { .. })
        ));

        std::fs::write(dir.path().join("cgroup.controllers"), "cpu io\n").unwrap();
        let err = CgroupRoot::prepare(dir.path()).unwrap_err();
        assert!(err.to_string().contains("memory controller"));
    }

    #[test]
    fn test_usage_falls_back_to_memory_current() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("memory.current"), "4096\n").unwrap();
        std::fs::write(dir.path().join("memory.events"), "oom 0\noom_kill 2\n").unwrap();

        let cgroup = RunCgroup {
            path: dir.path().join("."),
            procs: None,
        };
        assert_eq!(
            cgroup.usage(),
            CgroupUsage {
                peak_bytes: 4096,
                oom_kills: 2
            }
        );
        assert!(!cgroup.is_populated());
        // Leave removal of the tempdir to TempDir
        std::mem::forget(cgroup);
    }
}
