//! Client side of the proxy channel: a long-lived helper process that forks
//! on behalf of a host whose own address space is too large to fork
//! cheaply. The wire protocol is line-delimited JSON in both directions,
//! one request line in, one response line out.
//!

#[macro_use]
extern crate error_chain;
extern crate log;

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        Io(::std::io::Error);
        Json(::serde_json::Error);
    }

    errors {
        HelperEof {
            description("proxy helper closed its end of the channel")
        }
        RetriesExhausted {
            description("proxy round-trip failed after all retries")
        }
    }
}

/// Number of times a failed round-trip is retried (with a respawned helper)
/// before the failure is surfaced to the caller.
const RETRY_BUDGET: u32 = 3;

/// Pause between retries.
const RETRY_PAUSE: Duration = Duration::from_millis(100);

/// A resource kind as seen on the wire. Mirrors `sandbox::Resource` but is
/// independently `Serialize`/`Deserialize` since the sandbox crate's enum is
/// a bare `#[repr(u32)]` over libc constants, not a wire type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ProxyResource {
    Nproc,
    Cpu,
    AddressSpace,
    Fsize,
}

impl From<sandbox::Resource> for ProxyResource {
    fn from(r: sandbox::Resource) -> ProxyResource {
        match r {
            sandbox::Resource::NumProcesses => ProxyResource::Nproc,
            sandbox::Resource::CPUTime => ProxyResource::Cpu,
            sandbox::Resource::AddressSpace => ProxyResource::AddressSpace,
            sandbox::Resource::FileSize => ProxyResource::Fsize,
        }
    }
}

impl From<ProxyResource> for sandbox::Resource {
    fn from(r: ProxyResource) -> sandbox::Resource {
        match r {
            ProxyResource::Nproc => sandbox::Resource::NumProcesses,
            ProxyResource::Cpu => sandbox::Resource::CPUTime,
            ProxyResource::AddressSpace => sandbox::Resource::AddressSpace,
            ProxyResource::Fsize => sandbox::Resource::FileSize,
        }
    }
}

/// One rlimit pair as shipped over the wire.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ProxyRlimit {
    pub resource: ProxyResource,
    pub soft: u64,
    pub hard: u64,
}

impl From<(sandbox::Resource, sandbox::ResourceLimit)> for ProxyRlimit {
    fn from((resource, limit): (sandbox::Resource, sandbox::ResourceLimit)) -> ProxyRlimit {
        ProxyRlimit { resource: resource.into(), soft: limit.soft_limit, hard: limit.hard_limit }
    }
}

impl From<ProxyRlimit> for (sandbox::Resource, sandbox::ResourceLimit) {
    fn from(rl: ProxyRlimit) -> (sandbox::Resource, sandbox::ResourceLimit) {
        (rl.resource.into(), sandbox::ResourceLimit { soft_limit: rl.soft, hard_limit: rl.hard })
    }
}

/// One call to be forked on the helper's behalf.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub stdin: Vec<u8>,
    pub rlimits: Vec<ProxyRlimit>,
    pub realtime_secs: u64,
    pub slug: Option<String>,
}

/// One log record captured by the helper while handling a request, replayed
/// into the host's own logging stack once the response arrives.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: log::Level,
    pub message: String,
}

/// The outcome of running `ProxyRequest` in the helper, plus whatever it
/// logged in the meantime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyResponse {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub log_records: Vec<LogRecord>,
}

impl ProxyRequest {
    /// Build a request from a `sandbox::ProcessSpec`-shaped call.
    pub fn new(
        argv: Vec<String>,
        cwd: PathBuf,
        env: Vec<(String, String)>,
        stdin: Vec<u8>,
        rlimits: Vec<(sandbox::Resource, sandbox::ResourceLimit)>,
        realtime_secs: u64,
        slug: Option<String>,
    ) -> ProxyRequest {
        ProxyRequest {
            argv,
            cwd,
            env,
            stdin,
            rlimits: rlimits.into_iter().map(ProxyRlimit::from).collect(),
            realtime_secs,
            slug,
        }
    }
}

/// A live connection to a spawned helper process, plus the bookkeeping
/// needed to respawn it transparently.
struct Connection {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Client side of the proxy channel. At most one call may be in flight at a
/// time — `call` takes an internal lock for the duration of a round-trip, so
/// concurrent callers serialize rather than deadlock, matching the "not
/// safe for concurrent callers" contract: callers still must not rely on
/// interleaving semantics beyond mutual exclusion.
pub struct ProxyChannel {
    /// Path to the helper binary to spawn.
    helper_path: PathBuf,

    /// Log level passed to the helper on its argv so it can filter what it
    /// captures.
    log_level: log::LevelFilter,

    /// The live connection, or `None` if no helper has been spawned yet (or
    /// the last one died and has not been respawned).
    connection: Mutex<Option<Connection>>,
}

impl ProxyChannel {
    /// Create a channel that lazily spawns `helper_path` on first use.
    pub fn new(helper_path: impl Into<PathBuf>, log_level: log::LevelFilter) -> ProxyChannel {
        ProxyChannel { helper_path: helper_path.into(), log_level, connection: Mutex::new(None) }
    }

    fn spawn_helper(&self) -> Result<Connection> {
        let mut child = Command::new(&self.helper_path)
            .arg(self.log_level.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take().expect("helper spawned with piped stdin");
        let stdout = BufReader::new(child.stdout.take().expect("helper spawned with piped stdout"));

        Ok(Connection { child, stdin, stdout })
    }

    /// Probe a connection with a non-blocking wait; `true` means the helper
    /// process is still running.
    fn is_alive(conn: &mut Child) -> bool {
        matches!(conn.try_wait(), Ok(None))
    }

    fn round_trip(conn: &mut Connection, request: &ProxyRequest) -> Result<ProxyResponse> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        conn.stdin.write_all(line.as_bytes())?;
        conn.stdin.flush()?;

        let mut response_line = String::new();
        let n = conn.stdout.read_line(&mut response_line)?;
        if n == 0 {
            bail!(ErrorKind::HelperEof);
        }

        Ok(serde_json::from_str(&response_line)?)
    }

    /// Run `request` through the helper, replaying any log records it
    /// captured into this process's own `log` facade. Retries with a fresh
    /// helper up to `RETRY_BUDGET` times on transport failure.
    pub fn call(&self, request: &ProxyRequest) -> Result<ProxyResponse> {
        let mut guard = self.connection.lock().expect("proxy channel mutex poisoned");
        let mut last_error = None;

        for attempt in 0..RETRY_BUDGET {
            let needs_respawn = match guard.as_mut() {
                Some(conn) => !Self::is_alive(&mut conn.child),
                None => true,
            };
            if needs_respawn {
                *guard = Some(self.spawn_helper()?);
            }

            let conn = guard.as_mut().expect("just ensured a connection exists");
            match Self::round_trip(conn, request) {
                Ok(response) => {
                    for record in &response.log_records {
                        log::log!(record.level, "{}", record.message);
                    }
                    return Ok(response);
                }
                Err(e) => {
                    log::warn!("proxy round-trip attempt {} failed: {}", attempt + 1, e);
                    *guard = None;
                    last_error = Some(e);
                    std::thread::sleep(RETRY_PAUSE);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::from(ErrorKind::RetriesExhausted)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_resource_round_trips_through_sandbox_resource() {
        for r in [
            sandbox::Resource::NumProcesses,
            sandbox::Resource::CPUTime,
            sandbox::Resource::AddressSpace,
            sandbox::Resource::FileSize,
        ] {
            let wire: ProxyResource = r.into();
            let back: sandbox::Resource = wire.into();
            assert_eq!(r, back);
        }
    }

    #[test]
    fn request_serializes_to_a_single_line() {
        let request = ProxyRequest::new(
            vec!["/bin/echo".to_owned(), "hi".to_owned()],
            PathBuf::from("/tmp"),
            Vec::new(),
            b"\x00\x01binary".to_vec(),
            Vec::new(),
            5,
            Some("test-slug".to_owned()),
        );
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains('\n'));

        let decoded: ProxyRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(request.stdin, decoded.stdin);
        assert_eq!(request.slug, decoded.slug);
    }
}
