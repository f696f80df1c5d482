//! This module provide Rust friendly bindings to the native `rlimit` mechanism,
//! and the mapping from a `Limits` snapshot to the ordered list of rlimits to
//! install in a child process just before `execve`.
//!

use libc::rlimit;

use crate::Limits;

/// Represent a resource governed by the kernel `rlimit` mechanism.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resource {
    /// Maximum size of the process's virtual memory (address space). This
    /// variant corresponds to the `RLIMIT_AS` native constant.
    AddressSpace = libc::RLIMIT_AS,

    /// Limit, in seconds, on the amount of CPU time that the process can
    /// consume. This variant corresponds to the `RLIMIT_CPU` native constant.
    CPUTime = libc::RLIMIT_CPU,

    /// Maximum size, in bytes, of a single file the process may create or
    /// extend. This variant corresponds to the `RLIMIT_FSIZE` native
    /// constant.
    FileSize = libc::RLIMIT_FSIZE,

    /// Maximum number of processes (and threads) the owning user may have
    /// alive at once. This variant corresponds to the `RLIMIT_NPROC` native
    /// constant.
    NumProcesses = libc::RLIMIT_NPROC,
}

/// Specify the soft limit and the hard limit for some resource.
#[derive(Clone, Copy, Debug)]
pub struct ResourceLimit {
    /// The soft limit of the resource.
    pub soft_limit: u64,

    /// The hard limit of the resource.
    pub hard_limit: u64
}

impl ResourceLimit {
    /// Build a `ResourceLimit` with `soft_limit == hard_limit == value`.
    pub fn hard(value: u64) -> ResourceLimit {
        ResourceLimit { soft_limit: value, hard_limit: value }
    }

    /// Convert the `ResourceLimit` structure into native representation.
    fn as_native(&self) -> rlimit {
        rlimit {
            rlim_cur: self.soft_limit,
            rlim_max: self.hard_limit
        }
    }
}

/// Set resource limit for the calling process, using the native `rlimit` mechanism.
/// Intended to be called in the child, between `fork` and `execve`.
pub fn setrlimit(resource: Resource, limit: &ResourceLimit) -> std::io::Result<()> {
    let ret = unsafe { libc::setrlimit(resource as u32, &limit.as_native()) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Build the ordered list of `(Resource, ResourceLimit)` pairs to install for the given
/// effective `Limits`. This is a pure mapping: no syscalls happen here, the caller applies
/// each pair with `setrlimit` in the child.
///
/// * `NPROC` is always set, soft == hard == `limits.nproc` (0 forbids fork).
/// * `CPU` is only set when nonzero, with a soft/hard gap of one second so the SIGXCPU
///   soft-limit delivery is distinguishable from the SIGKILL hard kill.
/// * `VMEM` is only set when nonzero.
/// * `FSIZE` is always set (0 is the default and forbids writing any file).
pub fn build_rlimits(limits: &Limits) -> Vec<(Resource, ResourceLimit)> {
    let mut rlimits = Vec::new();

    rlimits.push((Resource::NumProcesses, ResourceLimit::hard(limits.nproc)));

    if limits.cpu > 0 {
        rlimits.push((Resource::CPUTime, ResourceLimit {
            soft_limit: limits.cpu,
            hard_limit: limits.cpu + 1,
        }));
    }

    if limits.vmem > 0 {
        rlimits.push((Resource::AddressSpace, ResourceLimit::hard(limits.vmem)));
    }

    rlimits.push((Resource::FileSize, ResourceLimit::hard(limits.fsize)));

    rlimits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Proxy;

    fn limits(cpu: u64, realtime: u64, vmem: u64, fsize: u64, nproc: u64) -> Limits {
        Limits { cpu, realtime, vmem, fsize, nproc, proxy: Proxy::Inherit }
    }

    #[test]
    fn nproc_always_present() {
        let built = build_rlimits(&limits(0, 0, 0, 0, 0));
        let (_, limit) = built.iter().find(|(r, _)| *r == Resource::NumProcesses).unwrap();
        assert_eq!(0, limit.soft_limit);
        assert_eq!(0, limit.hard_limit);
    }

    #[test]
    fn cpu_zero_is_omitted() {
        let built = build_rlimits(&limits(0, 0, 0, 0, 10));
        assert!(!built.iter().any(|(r, _)| *r == Resource::CPUTime));
    }

    #[test]
    fn cpu_nonzero_has_one_second_gap() {
        let built = build_rlimits(&limits(5, 0, 0, 0, 10));
        let (_, limit) = built.iter().find(|(r, _)| *r == Resource::CPUTime).unwrap();
        assert_eq!(5, limit.soft_limit);
        assert_eq!(6, limit.hard_limit);
    }

    #[test]
    fn vmem_zero_is_omitted() {
        let built = build_rlimits(&limits(0, 0, 0, 0, 10));
        assert!(!built.iter().any(|(r, _)| *r == Resource::AddressSpace));
    }

    #[test]
    fn fsize_always_present_even_at_zero() {
        let built = build_rlimits(&limits(0, 0, 0, 0, 10));
        let (_, limit) = built.iter().find(|(r, _)| *r == Resource::FileSize).unwrap();
        assert_eq!(0, limit.soft_limit);
        assert_eq!(0, limit.hard_limit);
    }
}
