//! The subprocess runner: forks/execs a child in a new process group with a
//! given rlimit list, plumbs stdin/stdout/stderr, launches the realtime
//! watchdog when requested, waits, reaps, and returns the captured result.
//!

use std::ffi::CString;
use std::io::{Read, Write};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::thread;

use nix::unistd::ForkResult;

use crate::misc::is_valid_c_string;
use crate::rlimits::{self, Resource, ResourceLimit};
use crate::watchdog;
use crate::{Error, ErrorKind, Result};

/// The fully assembled description of a child process to run in the
/// sandbox. All fields here are exactly the parameters the subprocess
/// runner's contract takes.
pub struct ProcessSpec {
    /// The full argv, `argv[0]` included.
    pub argv: Vec<String>,

    /// Working directory of the child process.
    pub cwd: std::path::PathBuf,

    /// Environment variables passed to the child process. The child never
    /// inherits the parent's environment beyond what is listed here.
    pub env: Vec<(String, String)>,

    /// Bytes to write to the child's stdin, then close it.
    pub stdin: Vec<u8>,

    /// Resource limits to install in the child between `fork` and `execve`.
    pub rlimits: Vec<(Resource, ResourceLimit)>,

    /// Wall-clock budget in seconds. Zero disables the watchdog.
    pub realtime_secs: u64,

    /// Opaque tag used only in log messages to correlate this run.
    pub slug: Option<String>,
}

/// Result of running a child process to completion.
pub struct ProcessOutput {
    /// POSIX-style exit status: non-negative is `exit()`'s code, negative is
    /// `-signal_number` for a signal-terminated child.
    pub status: i32,

    /// Bytes the child wrote to stdout.
    pub stdout: Vec<u8>,

    /// Bytes the child wrote to stderr.
    pub stderr: Vec<u8>,
}

/// A connected pair of pipe ends.
struct Pipe {
    reader: std::fs::File,
    writer: std::fs::File,
}

fn create_pipe() -> Result<Pipe> {
    let (reader_fd, writer_fd) = nix::unistd::pipe()?;
    Ok(Pipe {
        reader: unsafe { std::fs::File::from_raw_fd(reader_fd) },
        writer: unsafe { std::fs::File::from_raw_fd(writer_fd) },
    })
}

/// Build the native argv/envp for `execve`, validating that every piece is a
/// valid C string first.
fn build_native_exec_args(spec: &ProcessSpec) -> Result<(CString, Vec<CString>, Vec<CString>)> {
    if spec.argv.is_empty() {
        bail!(ErrorKind::InvalidProcessArgument("argv is empty".to_owned()));
    }

    for arg in &spec.argv {
        if !is_valid_c_string(arg) {
            bail!(ErrorKind::InvalidProcessArgument(arg.clone()));
        }
    }
    for (name, value) in &spec.env {
        if !is_valid_c_string(name) || !is_valid_c_string(value) {
            bail!(ErrorKind::InvalidEnvironmentVariable(name.clone()));
        }
    }

    let file = CString::new(spec.argv[0].as_bytes())
        .map_err(|_| Error::from(ErrorKind::InvalidProcessArgument(spec.argv[0].clone())))?;
    let argv = spec.argv.iter()
        .map(|a| CString::new(a.as_bytes()).unwrap())
        .collect();
    let envp = spec.env.iter()
        .map(|(k, v)| CString::new(format!("{}={}", k, v)).unwrap())
        .collect();

    Ok((file, argv, envp))
}

/// Runs in the child only, between `fork` and `execve`. Never returns on
/// success.
fn start_child(
    spec: &ProcessSpec,
    stdin: std::fs::File,
    stdout: std::fs::File,
    stderr: std::fs::File,
) -> Result<()> {
    // New session so the child (and everything it forks) lands in a fresh
    // process group, which is what lets the watchdog kill them all at once.
    nix::unistd::setsid()?;

    nix::unistd::chdir(spec.cwd.as_path())?;

    for (resource, limit) in &spec.rlimits {
        rlimits::setrlimit(*resource, limit)?;
    }

    crate::misc::dup_and_cloexec(stdin.into_raw_fd(), libc::STDIN_FILENO)?;
    crate::misc::dup_and_cloexec(stdout.into_raw_fd(), libc::STDOUT_FILENO)?;
    crate::misc::dup_and_cloexec(stderr.into_raw_fd(), libc::STDERR_FILENO)?;

    let (file, argv, envp) = build_native_exec_args(spec)?;
    nix::unistd::execve(&file, &argv, &envp)?;

    unreachable!()
}

/// Drain `reader` to a `Vec<u8>`, tolerating binary content of any size.
fn drain(mut reader: impl Read) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Run the given process specification to completion in the sandbox
/// directory `spec.cwd`, with the given resource limits and optional
/// realtime budget. Blocks until the child has exited and all streams have
/// reached EOF.
pub fn run(spec: ProcessSpec) -> Result<ProcessOutput> {
    let stdin_pipe = create_pipe()?;
    let stdout_pipe = create_pipe()?;
    let stderr_pipe = create_pipe()?;

    match nix::unistd::fork()? {
        ForkResult::Child => {
            // Close the ends the child does not use before duplicating the
            // others onto the standard fds.
            drop(stdin_pipe.writer);
            drop(stdout_pipe.reader);
            drop(stderr_pipe.reader);

            match start_child(&spec, stdin_pipe.reader, stdout_pipe.writer, stderr_pipe.writer) {
                Ok(()) => unreachable!(),
                Err(e) => {
                    eprintln!("failed to start child process: {}", e);
                    std::process::exit(127);
                }
            }
        }
        ForkResult::Parent { child } => {
            drop(stdin_pipe.reader);
            drop(stdout_pipe.writer);
            drop(stderr_pipe.writer);

            if let Some(slug) = &spec.slug {
                log::info!("Executed jailed code {} in {}, with PID {}",
                    slug, spec.cwd.display(), child);
            }

            let watchdog_handle = watchdog::spawn(child, spec.realtime_secs);

            let stdin_bytes = spec.stdin;
            let mut stdin_writer = stdin_pipe.writer;
            let stdin_thread = thread::spawn(move || {
                // Errors writing stdin (e.g. the child closed it early) are
                // not fatal to the run; the child's own exit status is the
                // authoritative outcome.
                let _ = stdin_writer.write_all(&stdin_bytes);
            });

            let stdout_reader = stdout_pipe.reader;
            let stderr_reader = stderr_pipe.reader;
            let stdout_thread = thread::spawn(move || drain(stdout_reader));
            let stderr_thread = thread::spawn(move || drain(stderr_reader));

            stdin_thread.join().expect("stdin writer thread panicked");
            let stdout = stdout_thread.join().expect("stdout reader thread panicked")?;
            let stderr = stderr_thread.join().expect("stderr reader thread panicked")?;

            let status = watchdog_handle.join()
                .map_err(|_| Error::from(ErrorKind::WatchdogJoinFailed))??;

            Ok(ProcessOutput { status, stdout, stderr })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec(argv: &[&str]) -> ProcessSpec {
        ProcessSpec {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            cwd: PathBuf::from("/"),
            env: Vec::new(),
            stdin: Vec::new(),
            rlimits: Vec::new(),
            realtime_secs: 0,
            slug: None,
        }
    }

    #[test]
    fn hello_world_exit_and_stdout() {
        let out = run(spec(&["/bin/echo", "hello"])).unwrap();
        assert_eq!(0, out.status);
        assert_eq!(b"hello\n".to_vec(), out.stdout);
        assert_eq!(Vec::<u8>::new(), out.stderr);
    }

    #[test]
    fn nonzero_exit_status() {
        let out = run(spec(&["/bin/sh", "-c", "exit 7"])).unwrap();
        assert_eq!(7, out.status);
    }

    #[test]
    fn stdin_is_forwarded_byte_for_bytes() {
        let mut s = spec(&["/bin/cat"]);
        s.stdin = vec![0u8, 1, 2, 255, b'\n', b'x'];
        let out = run(s).unwrap();
        assert_eq!(vec![0u8, 1, 2, 255, b'\n', b'x'], out.stdout);
    }

    #[test]
    fn killed_by_signal_is_negative_status() {
        let out = run(spec(&["/bin/sh", "-c", "kill -TERM $$"])).unwrap();
        assert_eq!(-(nix::sys::signal::Signal::SIGTERM as i32), out.status);
    }

    #[test]
    fn realtime_budget_kills_long_running_child() {
        let mut s = spec(&["/bin/sleep", "5"]);
        s.realtime_secs = 1;
        let start = std::time::Instant::now();
        let out = run(s).unwrap();
        assert!(out.status < 0);
        assert!(start.elapsed() < std::time::Duration::from_secs(4));
    }

    #[test]
    fn empty_argv_is_rejected() {
        assert!(run(spec(&[])).is_err());
    }
}
