//! This crate implements the sandbox half of the jail: the low-level
//! machinery that runs one command to completion under kernel-enforced
//! resource limits and a real-time watchdog.
//!
//! The sandbox implements:
//!
//! * Resource limits: CPU time, virtual memory, file size and process count,
//!   applied with the native `rlimit` mechanism;
//!
//! * A subprocess runner: fork/exec a child in its own process group, pipe
//!   its stdin/stdout/stderr, and collect its POSIX-style exit status;
//!
//! * A real-time watchdog: a thread that kills the process group of a child
//!   that runs past its wall-clock budget.
//!

#[macro_use]
extern crate error_chain;
extern crate libc;
extern crate log;
extern crate nix;

mod misc;
mod process;
mod rlimits;
mod watchdog;

pub use misc::{dup_and_cloexec, expand_path, is_valid_c_string};
pub use process::{run, ProcessOutput, ProcessSpec};
pub use rlimits::{build_rlimits, setrlimit, Resource, ResourceLimit};
pub use watchdog::{spawn as spawn_watchdog, WatchdogJoinHandle};

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        Io(::std::io::Error);
        Nix(::nix::Error);
    }

    errors {
        InvalidProcessArgument(arg: String) {
            description("invalid argv")
            display("invalid argv entry: {:?}", arg)
        }

        InvalidEnvironmentVariable(name: String) {
            description("invalid environment variable")
            display("invalid environment variable: {:?}", name)
        }

        WatchdogJoinFailed {
            description("failed to join the watchdog thread")
        }
    }
}

/// Whether, and how, a command should be routed through the long-lived proxy
/// helper process instead of being forked directly from the calling process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Proxy {
    /// Always dispatch through the proxy.
    On,

    /// Never dispatch through the proxy, fork directly.
    Off,

    /// Use whatever the caller's default is.
    Inherit,
}

/// The effective resource limits to apply to one run. All fields are in the
/// unit the underlying `rlimit` resource expects (seconds for `cpu` and
/// `realtime`, bytes for `vmem` and `fsize`, a bare count for `nproc`). Zero
/// means "no limit" for `cpu` and `vmem`, and is a real, enforced value of
/// zero for `fsize` and `nproc`.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    /// CPU time limit in seconds. Zero disables the limit.
    pub cpu: u64,

    /// Wall-clock limit in seconds, enforced by the watchdog rather than by
    /// a kernel rlimit. Zero disables the watchdog.
    pub realtime: u64,

    /// Virtual address space limit in bytes. Zero disables the limit.
    pub vmem: u64,

    /// Maximum size in bytes of any file the child creates or extends.
    pub fsize: u64,

    /// Maximum number of processes (and threads) the sandbox user may have
    /// alive at once.
    pub nproc: u64,

    /// Whether this run should go through the proxy helper.
    pub proxy: Proxy,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits { cpu: 0, realtime: 0, vmem: 0, fsize: 0, nproc: 0, proxy: Proxy::Inherit }
    }
}
