//! The proxy helper: a small long-lived process that receives one
//! line-delimited JSON request per call, forks/execs via `sandbox::process`,
//! and writes back one line-delimited JSON response, looping until its
//! stdin is closed.
//!

extern crate jail_proxy;
extern crate log;
extern crate sandbox;
extern crate serde_json;

use std::io::{BufRead, Write};
use std::sync::Mutex;

use jail_proxy::{LogRecord, ProxyRequest, ProxyResponse};

/// A `log::Log` implementation that buffers every record into memory
/// instead of printing it, so it can be shipped back to the host inside the
/// next response rather than getting lost on the helper's (null-redirected)
/// stderr.
struct CapturingLogger {
    records: Mutex<Vec<LogRecord>>,
}

impl CapturingLogger {
    fn new() -> CapturingLogger {
        CapturingLogger { records: Mutex::new(Vec::new()) }
    }

    /// Take every record captured since the last drain.
    fn drain(&self) -> Vec<LogRecord> {
        std::mem::take(&mut *self.records.lock().expect("capturing logger mutex poisoned"))
    }
}

impl log::Log for CapturingLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.records.lock().expect("capturing logger mutex poisoned").push(LogRecord {
            level: record.level(),
            message: record.args().to_string(),
        });
    }

    fn flush(&self) {}
}

fn run_request(request: ProxyRequest) -> ProxyResponse {
    let spec = sandbox::ProcessSpec {
        argv: request.argv,
        cwd: request.cwd,
        env: request.env,
        stdin: request.stdin,
        rlimits: request.rlimits.into_iter().map(Into::into).collect(),
        realtime_secs: request.realtime_secs,
        slug: request.slug,
    };

    match sandbox::run(spec) {
        Ok(output) => ProxyResponse {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
            log_records: Vec::new(),
        },
        Err(e) => {
            log::error!("proxy helper failed to run request: {}", e);
            ProxyResponse { status: 127, stdout: Vec::new(), stderr: Vec::new(), log_records: Vec::new() }
        }
    }
}

fn main() {
    let log_level: log::LevelFilter = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(log::LevelFilter::Warn);

    let logger = Box::leak(Box::new(CapturingLogger::new()));
    log::set_logger(logger).expect("logger already set");
    log::set_max_level(log_level);

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut input = stdin.lock();
    let mut output = stdout.lock();
    let mut line = String::new();

    loop {
        line.clear();
        let n = input.read_line(&mut line).expect("failed to read request line");
        if n == 0 {
            // Host closed its end; exit cleanly.
            break;
        }

        let request: ProxyRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                log::error!("malformed proxy request: {}", e);
                continue;
            }
        };

        let mut response = run_request(request);
        response.log_records = logger.drain();

        let mut reply = serde_json::to_string(&response).expect("response is always serializable");
        reply.push('\n');
        output.write_all(reply.as_bytes()).expect("failed to write response line");
        output.flush().expect("failed to flush response line");
    }
}
