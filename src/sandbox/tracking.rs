//! Run tagging for hosts without a delegated cgroup
//!
//! Every run exports `JUDGE_RUN_ID=<id>` into the program's environment.
//! Children inherit it even after `setsid` or double forks take them out of
//! the process group, so a sweep of `/proc/*/environ` finds them. A process
//! that execs with a scrubbed environment drops the tag; only a cgroup
//! contains that case.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Environment variable carrying the run tag
pub const RUN_TAG_VAR: &str = "JUDGE_RUN_ID";

/// Passes before giving up on a tree that keeps forking
const MAX_SWEEPS: usize = 16;

static NEXT_RUN: AtomicU64 = AtomicU64::new(0);

/// Tag unique to this worker process and run
pub fn next_run_id() -> String {
    format!("{}-{}", std::process::id(), NEXT_RUN.fetch_add(1, Ordering::Relaxed))
}

/// The `KEY=value` entry a tagged process carries
pub fn tag_entry(run_id: &str) -> Vec<u8> {
    format!("{}={}", RUN_TAG_VAR, run_id).into_bytes()
}

/// True if a NUL-separated environ block holds exactly `entry`
pub fn environ_has(environ: &[u8], entry: &[u8]) -> bool {
    environ.split(|b| *b == 0).any(|var| var == entry)
}

/// Pids of live processes tagged with `run_id`
#[cfg(target_os = "linux")]
pub fn tagged_pids(run_id: &str) -> Vec<Pid> {
    let entry = tag_entry(run_id);
    let own = std::process::id();
    let Ok(proc_dir) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    proc_dir
        .flatten()
        .filter_map(|dir| dir.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| *pid != own)
        .filter(|pid| {
            // Other users' processes and ones that already exited fail to
            // read; neither can be ours.
            std::fs::read(format!("/proc/{}/environ", pid))
                .map(|environ| environ_has(&environ, &entry))
                .unwrap_or(false)
        })
        .filter_map(|pid| i32::try_from(pid).ok().map(Pid::from_raw))
        .collect()
}

#[cfg(not(target_os = "linux"))]
pub fn tagged_pids(_run_id: &str) -> Vec<Pid> {
    Vec::new()
}

/// SIGKILL every process tagged with `run_id` until a pass finds none.
///
/// Returns how many processes were signalled.
pub fn kill_tagged(run_id: &str) -> usize {
    let mut killed = 0;
    for _ in 0..MAX_SWEEPS {
        let pids = tagged_pids(run_id);
        if pids.is_empty() {
            if killed > 0 {
                debug!("Killed {} escaped processes of run {}", killed, run_id);
            }
            return killed;
        }
        for pid in pids {
            match kill(pid, Signal::SIGKILL) {
                Ok(()) => killed += 1,
                Err(Errno::ESRCH) => {}
                Err(e) => warn!("Failed to kill process {} of run {}: {}", pid, run_id, e),
            }
        }
    }
    warn!("Run {} still has tagged processes after {} sweeps", run_id, MAX_SWEEPS);
    killed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_run_ids_are_unique() {
        let a = next_run_id();
        let b = next_run_id();
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("{}-", std::process::id())));
    }

    #[test]
    fn test_environ_match_is_exact() {
        let entry = tag_entry("7-1");
        assert_eq!(entry, b"JUDGE_RUN_ID=7-1");

        assert!(environ_has(b"PATH=/bin\0JUDGE_RUN_ID=7-1\0", &entry));
        assert!(!environ_has(b"JUDGE_RUN_ID=7-10\0", &entry));
        assert!(!environ_has(b"X_JUDGE_RUN_ID=7-1\0", &entry));
        assert!(!environ_has(b"", &entry));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_kill_tagged_reaches_new_session() {
        let run_id = next_run_id();
        let mut child = std::process::Command::new("setsid")
            .args(["sleep", "98781"])
            .env(RUN_TAG_VAR, &run_id)
            .spawn()
            .unwrap();

        let mut found = false;
        for _ in 0..50 {
            if !tagged_pids(&run_id).is_empty() {
                found = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(found);

        assert!(kill_tagged(&run_id) >= 1);
        let _ = child.wait();
        assert!(tagged_pids(&run_id).is_empty());
    }
}
