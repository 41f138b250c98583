//! Host-level limit enforcement helpers
//!
//! rlimits are a backstop applied in the child between fork and exec. The
//! wall clock and the memory ceiling are enforced by the supervising task in
//! [`super::process`], which reads the run's cgroup when it has one, samples
//! `/proc` while the program runs, and collects `wait4` rusage at the end.

use nix::sys::resource::{setrlimit, Resource};

use super::ExecutionLimits;

/// Limits installed in the child right before exec
#[derive(Debug, Clone, Copy)]
pub struct ChildRlimits {
    /// CPU seconds; the kernel sends SIGXCPU past the soft limit
    pub cpu_secs: u64,
    /// Largest file the program may write, in bytes
    pub fsize_bytes: u64,
    /// Maximum number of open descriptors
    pub open_files: u64,
    /// RLIMIT_AS, when the language tolerates one
    pub address_space_bytes: Option<u64>,
}

impl ChildRlimits {
    /// CPU limit is the wall limit rounded up plus one second, so the wall
    /// clock normally fires first and SIGXCPU only catches a stuck supervisor.
    pub fn for_limits(limits: &ExecutionLimits, fsize_bytes: u64) -> Self {
        let cpu_secs = u64::try_from(limits.time.as_millis().div_ceil(1000))
            .unwrap_or(u64::MAX)
            .saturating_add(1);
        Self {
            cpu_secs,
            fsize_bytes,
            open_files: 256,
            address_space_bytes: limits.address_space_bytes,
        }
    }

    /// Install the limits in the calling process.
    ///
    /// Runs between fork and exec: it must only make async-signal-safe calls.
    pub fn apply(&self) -> std::io::Result<()> {
        setrlimit(
            Resource::RLIMIT_CPU,
            self.cpu_secs as _,
            self.cpu_secs.saturating_add(1) as _,
        )?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        setrlimit(Resource::RLIMIT_FSIZE, self.fsize_bytes as _, self.fsize_bytes as _)?;
        setrlimit(Resource::RLIMIT_NOFILE, self.open_files as _, self.open_files as _)?;
        if let Some(bytes) = self.address_space_bytes {
            setrlimit(Resource::RLIMIT_AS, bytes as _, bytes as _)?;
        }
        Ok(())
    }
}

/// Current memory footprint of `pid` in bytes, if the host exposes it
#[cfg(target_os = "linux")]
pub fn sample_memory_bytes(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    parse_proc_status(&status)
}

#[cfg(not(target_os = "linux"))]
pub fn sample_memory_bytes(_pid: u32) -> Option<u64> {
    None
}

/// Exit status and peak resident set of a finished child
#[derive(Debug, Clone, Copy)]
pub struct Reaped {
    pub status: std::process::ExitStatus,
    /// `ru_maxrss` in bytes. Covers the child and the descendants it waited
    /// for, so a shell's finished subprocesses are included.
    pub max_rss_bytes: u64,
}

/// Block until `pid` exits and reap it with `wait4`, collecting its rusage.
///
/// Must be the only waiter for `pid`: the child is spawned through
/// `std::process::Command` and never waited on through its handle.
#[cfg(unix)]
pub fn wait_for_exit(pid: u32) -> std::io::Result<Reaped> {
    use std::os::unix::process::ExitStatusExt;

    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain data and zero is a valid bit pattern
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };

    loop {
        // SAFETY: both out-pointers refer to live locals
        let ret = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if ret == pid {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    // ru_maxrss is in kilobytes on Linux
    let max_rss_kb = u64::try_from(usage.ru_maxrss).unwrap_or(0);
    Ok(Reaped {
        status: std::process::ExitStatus::from_raw(status),
        max_rss_bytes: max_rss_kb.saturating_mul(1024),
    })
}

/// Extract the larger of VmHWM (peak RSS) and VmRSS from `/proc/<pid>/status`
pub fn parse_proc_status(content: &str) -> Option<u64> {
    let mut best: Option<u64> = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key != "VmHWM" && key != "VmRSS" {
            continue;
        }
        // "   1234 kB"
        let kb = value
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok());
        if let Some(kb) = kb {
            let bytes = kb.saturating_mul(1024);
            best = Some(best.map_or(bytes, |b| b.max(bytes)));
        }
    }

    best
}
