//! The real-time watchdog: a concurrent task tied to one child process that
//! kills the process group if it runs past its wall-clock budget, and exits
//! harmlessly otherwise.
//!

use std::process::Command;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use super::Result;

/// Interval between consecutive `wait` calls in the watchdog thread, while a
/// realtime budget is in effect.
const WAIT_INTERVAL: Duration = Duration::from_millis(250);

/// Provide a RAII guard type for safely waiting for `pid`s.
///
/// This type ensures that the child process is correctly waited for. If any
/// error occurs before the wait guard receives a status indicating the
/// process has exited (either normally or abnormally), the guard kills the
/// child process when it is dropped.
struct WaitPidGuard {
    /// The pid of the process to wait on.
    pid: Pid,

    /// Whether the process should be killed when this instance is dropped.
    kill: bool,
}

impl WaitPidGuard {
    fn new(pid: Pid) -> Self {
        WaitPidGuard { pid, kill: true }
    }

    /// Wait for the child process. If a status indicating the child process
    /// has exited is received, the guard is released (it will not try to
    /// kill the child process when it is dropped).
    fn wait(&mut self, options: Option<WaitPidFlag>) -> nix::Result<WaitStatus> {
        let wait_res = nix::sys::wait::waitpid(self.pid, options);
        if let Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) = wait_res {
            self.kill = false;
        }
        wait_res
    }
}

impl Drop for WaitPidGuard {
    fn drop(&mut self) {
        if self.kill {
            nix::sys::signal::kill(self.pid, Signal::SIGKILL).ok();
        }
    }
}

/// Type for the join handle of the watchdog thread. Joining it yields the
/// POSIX-style exit status of the child: non-negative is `exit()`'s code,
/// negative is `-signal_number` for a signal-terminated child.
pub type WatchdogJoinHandle = JoinHandle<Result<i32>>;

/// Issue a privileged kill against the child's process group. The child may
/// have been started as the sandbox user via `sudo`, so the host user
/// usually cannot signal it directly and must go through the same
/// elevation mechanism.
fn kill_process_group(pid: Pid, pgid: Pid, elapsed: Duration) {
    log::warn!(
        "Killing process {} (group {}), ran too long: {:.1}s",
        pid, pgid, elapsed.as_secs_f64(),
    );

    match Command::new("sudo").args(&["pkill", "-9", "-g", &pgid.to_string()]).status() {
        Ok(status) if status.success() => (),
        Ok(status) => log::warn!("sudo pkill exited with status {:?}", status.code()),
        Err(e) => log::error!("failed to invoke sudo pkill: {}", e),
    }
}

/// Convert a `WaitStatus` known to represent a terminated process into a
/// POSIX-style exit status. Returns `None` for statuses that do not mean
/// "the process is gone" (e.g. `StillAlive`, `Stopped`).
fn exit_status_of(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, sig, _) => Some(-(sig as i32)),
        _ => None,
    }
}

/// Main entry point of the watchdog thread. Loops waiting for `pid`; if
/// `realtime_secs` is nonzero and elapsed wall time exceeds it before the
/// child exits on its own, issues a privileged kill of the child's process
/// group, then keeps waiting so it can reap the resulting signal-terminated
/// status.
fn watchdog_main(pid: Pid, realtime_secs: u64) -> Result<i32> {
    let mut guard = WaitPidGuard::new(pid);
    let has_realtime = realtime_secs > 0;
    let wait_flag = if has_realtime { Some(WaitPidFlag::WNOHANG) } else { None };
    let budget = Duration::from_secs(realtime_secs);
    let timer = SystemTime::now();
    let mut killed = false;

    loop {
        let wait_status = guard.wait(wait_flag)?;
        if let Some(status) = exit_status_of(wait_status) {
            return Ok(status);
        }

        if has_realtime {
            let elapsed = timer.elapsed().unwrap_or_default();
            if !killed && elapsed >= budget {
                killed = true;
                match nix::unistd::getpgid(Some(pid)) {
                    Ok(pgid) => kill_process_group(pid, pgid, elapsed),
                    Err(e) => log::error!("cannot look up process group of pid {}: {}", pid, e),
                }
            }

            std::thread::sleep(WAIT_INTERVAL);
        }
    }
}

/// Start the watchdog thread for the given child pid. The returned handle
/// yields the child's POSIX-style exit status when joined. The watchdog
/// performs the only `waitpid` call made against `pid` — the subprocess
/// runner joins this handle rather than waiting on the child itself, so
/// there is never more than one waiter racing to reap it.
pub fn spawn(pid: Pid, realtime_secs: u64) -> WatchdogJoinHandle {
    std::thread::spawn(move || watchdog_main(pid, realtime_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::WaitStatus;

    #[test]
    fn exit_status_of_exited() {
        let status = WaitStatus::Exited(Pid::from_raw(1), 42);
        assert_eq!(Some(42), exit_status_of(status));
    }

    #[test]
    fn exit_status_of_signaled_is_negative() {
        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false);
        assert_eq!(Some(-(Signal::SIGKILL as i32)), exit_status_of(status));
    }

    #[test]
    fn exit_status_of_still_alive_is_none() {
        assert_eq!(None, exit_status_of(WaitStatus::StillAlive));
    }
}
