//! The jail orchestrator: the public entry points. Stages a disposable
//! sandbox directory, materializes caller-supplied inputs, composes the
//! final argv, dispatches to the subprocess runner (directly or through the
//! proxy), sweeps up after the sandboxed user, and returns the result.
//!

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sandbox::{Limits, Proxy};
use serde_json::{Map, Value};

use crate::config::{CommandSpec, ConfigProvider};
use crate::languages::json_safe;
use crate::{Error, ErrorKind, Result};

/// One call to `execute`.
pub struct JobRequest {
    /// Logical command name, looked up in the configuration's registry.
    pub command: String,

    /// Source code to write to `<home>/jailed_code` and prepend to argv, if
    /// any.
    pub code: Option<Vec<u8>>,

    /// `(name, content)` pairs written verbatim to `<home>/<name>`. Names
    /// must be flat (no path separators).
    pub extra_files: Vec<(String, Vec<u8>)>,

    /// Host paths copied into the sandbox, flattened to their basenames.
    pub copied_files: Vec<PathBuf>,

    /// Argv appended after the command's fixed argv (and after
    /// `jailed_code`, when `code` is supplied).
    pub argv: Vec<String>,

    /// Bytes written to the child's stdin.
    pub stdin: Vec<u8>,

    /// Overrides-context key used to resolve effective limits. `None` uses
    /// the process-wide defaults.
    pub context_key: Option<String>,

    /// Opaque tag correlating this call in log lines.
    pub slug: Option<String>,
}

impl JobRequest {
    pub fn new(command: impl Into<String>) -> JobRequest {
        JobRequest {
            command: command.into(),
            code: None,
            extra_files: Vec::new(),
            copied_files: Vec::new(),
            argv: Vec::new(),
            stdin: Vec::new(),
            context_key: None,
            slug: None,
        }
    }
}

/// Extra inputs specific to `evaluate`: files and directories copied into
/// the sandbox alongside the driver script, and directories appended to the
/// driver's import search path before it runs the caller's code.
#[derive(Default)]
pub struct EvaluateExtras {
    /// Host paths copied into the sandbox, flattened to their basenames.
    pub files: Vec<PathBuf>,

    /// `(name, content)` pairs written verbatim to `<home>/<name>`.
    pub extra_files: Vec<(String, Vec<u8>)>,

    /// Directories copied into the sandbox and appended to the driver's
    /// import search path before it executes the caller's code. Subject to
    /// the same flat-basename copy rule as `files`.
    pub python_path: Vec<PathBuf>,
}

/// The result of a completed `execute` call.
#[derive(Clone, Debug)]
pub struct JobResult {
    /// POSIX-style exit status: non-negative is `exit()`'s code, negative is
    /// `-signal_number`.
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// The jail orchestrator. Owns a configuration provider and, optionally, a
/// shared proxy channel.
pub struct Jail {
    config: Arc<dyn ConfigProvider>,
    proxy: Option<Arc<jail_proxy::ProxyChannel>>,
}

impl Jail {
    /// Build an orchestrator that always forks directly, never through a
    /// proxy.
    pub fn new(config: Arc<dyn ConfigProvider>) -> Jail {
        Jail { config, proxy: None }
    }

    /// Build an orchestrator that dispatches through `proxy` whenever the
    /// effective limits (or `CODEJAIL_PROXY`) say to.
    pub fn with_proxy(config: Arc<dyn ConfigProvider>, proxy: Arc<jail_proxy::ProxyChannel>) -> Jail {
        Jail { config, proxy: Some(proxy) }
    }

    /// Whether `name` is a registered command.
    pub fn is_configured(&self, name: &str) -> bool {
        self.config.get_command(name).is_some()
    }

    /// Stage a sandbox directory, run `request`, and clean up.
    pub fn execute(&self, request: JobRequest) -> Result<JobResult> {
        let command = self
            .config
            .get_command(&request.command)
            .ok_or_else(|| Error::from(ErrorKind::NotConfigured(request.command.clone())))?;

        let limits = match &request.context_key {
            Some(key) => self.config.effective_limits(key),
            None => self.config.get_default_limits(),
        };

        let sandbox_dir = SandboxDir::create()?;
        let result = self.execute_in(&command, &limits, &request, &sandbox_dir);

        let cleanup_result = self.sweep_and_remove(&command, &limits, &sandbox_dir);
        let result = result.and_then(|r| cleanup_result.map(|()| r));

        result
    }

    fn execute_in(
        &self,
        command: &CommandSpec,
        limits: &Limits,
        request: &JobRequest,
        sandbox_dir: &SandboxDir,
    ) -> Result<JobResult> {
        let mut argv = request.argv.clone();
        materialize_inputs(sandbox_dir, request, &mut argv)?;

        let full_argv = build_argv(command, &argv);
        self.run(full_argv, sandbox_dir.path().to_owned(), request.stdin.clone(), limits, request.slug.clone())
    }

    /// Dispatch one command line through the subprocess runner, directly or
    /// through the proxy per `limits.proxy` / `CODEJAIL_PROXY`.
    fn run(
        &self,
        argv: Vec<String>,
        cwd: PathBuf,
        stdin: Vec<u8>,
        limits: &Limits,
        slug: Option<String>,
    ) -> Result<JobResult> {
        let rlimits = sandbox::build_rlimits(limits);

        if self.should_use_proxy(limits) {
            let proxy = self.proxy.as_ref().expect("should_use_proxy implies a proxy is configured");
            let request =
                jail_proxy::ProxyRequest::new(argv, cwd, Vec::new(), stdin, rlimits, limits.realtime, slug);
            let response = proxy.call(&request)?;
            Ok(JobResult { status: response.status, stdout: response.stdout, stderr: response.stderr })
        } else {
            let spec = sandbox::ProcessSpec {
                argv,
                cwd,
                env: Vec::new(),
                stdin,
                rlimits,
                realtime_secs: limits.realtime,
                slug,
            };
            let output = sandbox::run(spec)?;
            Ok(JobResult { status: output.status, stdout: output.stdout, stderr: output.stderr })
        }
    }

    fn should_use_proxy(&self, limits: &Limits) -> bool {
        if self.proxy.is_none() {
            return false;
        }
        match limits.proxy {
            Proxy::On => true,
            Proxy::Off => false,
            Proxy::Inherit => std::env::var("CODEJAIL_PROXY").map(|v| v == "1").unwrap_or(false),
        }
    }

    /// Remove the contents of `tmp/` as the sandbox user (the sandbox user
    /// may have created files the host user cannot remove), then remove the
    /// sandbox directory itself as the host user.
    fn sweep_and_remove(&self, command: &CommandSpec, limits: &Limits, sandbox_dir: &SandboxDir) -> Result<()> {
        let tmp_path = sandbox_dir.tmp_path();
        let tmp_str = tmp_path.to_string_lossy().into_owned();

        let mut sweep_argv = Vec::new();
        if let Some(user) = &command.user {
            sweep_argv.push("sudo".to_owned());
            sweep_argv.push("-u".to_owned());
            sweep_argv.push(user.clone());
        }
        sweep_argv.extend(
            ["find", &tmp_str, "-mindepth", "1", "-maxdepth", "1", "-exec", "rm", "-rf", "{}", ";"]
                .iter()
                .map(|s| s.to_string()),
        );

        self.run(sweep_argv, sandbox_dir.path().to_owned(), Vec::new(), limits, None)?;

        sandbox_dir.remove()
    }

    /// Convenience mode: run `code` through `command`'s driver template,
    /// seeding it with `globals_in` and returning the globals it reports
    /// back, merged on top of `globals_in`. `extras` carries the files and
    /// `python_path` directories the driver needs alongside the code itself.
    pub fn evaluate(
        &self,
        command_name: &str,
        code: &str,
        globals_in: &Map<String, Value>,
        extras: &EvaluateExtras,
        context_key: Option<String>,
        slug: Option<String>,
    ) -> Result<Map<String, Value>> {
        let command = self
            .config
            .get_command(command_name)
            .ok_or_else(|| Error::from(ErrorKind::NotConfigured(command_name.to_owned())))?;

        let driver_template = command
            .binding
            .as_ref()
            .and_then(|b| b.driver_template())
            .ok_or_else(|| Error::from(ErrorKind::NotSupportedForEvaluate(command_name.to_owned())))?;

        let filtered_globals_in = json_safe(&Value::Object(globals_in.clone()))
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();

        let python_path_names = extras
            .python_path
            .iter()
            .map(|p| {
                p.file_name()
                    .ok_or_else(|| Error::from(ErrorKind::InvalidFileName(p.display().to_string())))
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .collect::<Result<Vec<String>>>()?;

        let stdin_payload = serde_json::to_vec(&(code, filtered_globals_in, python_path_names))?;

        let mut request = JobRequest::new(command_name);
        request.code = Some(driver_template.as_bytes().to_vec());
        request.stdin = stdin_payload;
        request.context_key = context_key;
        request.slug = slug;
        request.copied_files = extras.files.iter().cloned().chain(extras.python_path.iter().cloned()).collect();
        request.extra_files = extras.extra_files.clone();

        let result = self.execute(request)?;

        if result.status != 0 {
            return Err(Error::from(ErrorKind::ExecutionFailed(result.status, result.stdout, result.stderr)));
        }

        let parsed: Value = serde_json::from_slice(&result.stdout)
            .map_err(|_| Error::from(ErrorKind::ProtocolError(result.stdout.clone())))?;
        let parsed_object =
            parsed.as_object().cloned().ok_or_else(|| Error::from(ErrorKind::ProtocolError(result.stdout)))?;

        let mut merged = globals_in.clone();
        for (key, value) in parsed_object {
            merged.insert(key, value);
        }

        Ok(merged)
    }
}

/// Build `[sudo, -u, <user>]` (omitted if no user), `["TMPDIR=tmp"]`, the
/// command's fixed argv, then the caller's argv.
fn build_argv(command: &CommandSpec, request_argv: &[String]) -> Vec<String> {
    let mut argv = Vec::new();
    if let Some(user) = &command.user {
        argv.push("sudo".to_owned());
        argv.push("-u".to_owned());
        argv.push(user.clone());
    }
    argv.push("TMPDIR=tmp".to_owned());
    argv.push(command.bin_path.to_string_lossy().into_owned());
    argv.extend(command.extra_argv.iter().cloned());
    if let Some(binding) = &command.binding {
        argv.extend(binding.extra_argv().iter().map(|s| s.to_string()));
    }
    argv.extend(request_argv.iter().cloned());
    argv
}

/// Copy `request`'s files and code into `sandbox_dir`, prepending
/// `jailed_code` to `argv` when `code` is supplied.
fn materialize_inputs(sandbox_dir: &SandboxDir, request: &JobRequest, argv: &mut Vec<String>) -> Result<()> {
    for path in &request.copied_files {
        copy_flat(path, sandbox_dir.path())?;
    }

    for (name, content) in &request.extra_files {
        write_flat(sandbox_dir.path(), name, content)?;
    }

    if let Some(code) = &request.code {
        write_flat(sandbox_dir.path(), "jailed_code", code)?;
        argv.insert(0, "jailed_code".to_owned());
    }

    Ok(())
}

/// Write `content` to `<dir>/<name>`. Rejects `name`s containing a path
/// separator — the sandbox must not expose host directory layout.
fn write_flat(dir: &Path, name: &str, content: &[u8]) -> Result<()> {
    if name.contains('/') {
        return Err(Error::from(ErrorKind::InvalidFileName(name.to_owned())));
    }
    let mut file = File::create(dir.join(name))?;
    file.write_all(content)?;
    Ok(())
}

/// Copy `src` into `dest_dir`, under `src`'s basename. Symlinks are
/// recreated as symlinks (never dereferenced); directories are copied
/// recursively, preserving symlinks within them; everything else is copied
/// as a regular file.
fn copy_flat(src: &Path, dest_dir: &Path) -> Result<()> {
    let name = src
        .file_name()
        .ok_or_else(|| Error::from(ErrorKind::InvalidFileName(src.display().to_string())))?;
    copy_preserving_symlinks(src, &dest_dir.join(name))
}

fn copy_preserving_symlinks(src: &Path, dest: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(src)?;

    if metadata.file_type().is_symlink() {
        let target = fs::read_link(src)?;
        std::os::unix::fs::symlink(target, dest)?;
    } else if metadata.is_dir() {
        fs::create_dir(dest)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_preserving_symlinks(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        fs::copy(src, dest)?;
    }

    Ok(())
}

/// A freshly-created, disposable sandbox directory: `0o775`, owned by the
/// host user, with a `0o777` `tmp/` subdirectory for the sandbox user to
/// write into.
struct SandboxDir {
    path: PathBuf,
}

impl SandboxDir {
    fn create() -> Result<SandboxDir> {
        let path = tempfile::Builder::new().prefix("codejail-").tempdir()?.into_path();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o775))?;

        let tmp_path = path.join("tmp");
        fs::create_dir(&tmp_path)?;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o777))?;

        Ok(SandboxDir { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.join("tmp")
    }

    /// Remove the sandbox directory, which the host user owns and can
    /// always delete (assuming `tmp/`'s contents were already swept by the
    /// sandbox user).
    fn remove(&self) -> Result<()> {
        fs::remove_dir_all(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_dir_has_the_documented_modes() {
        let dir = SandboxDir::create().unwrap();

        let home_mode = fs::metadata(dir.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(0o775, home_mode);

        let tmp_mode = fs::metadata(dir.tmp_path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(0o777, tmp_mode);

        dir.remove().unwrap();
        assert!(!dir.path().exists());
    }

    #[test]
    fn write_flat_rejects_path_separators() {
        let dir = SandboxDir::create().unwrap();
        let err = write_flat(dir.path(), "a/b", b"x").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidFileName(_)));
        dir.remove().unwrap();
    }

    #[test]
    fn copy_preserves_symlinks() {
        let src_dir = tempfile::tempdir().unwrap();
        let target = src_dir.path().join("target.txt");
        fs::write(&target, b"hi").unwrap();
        let link = src_dir.path().join("link.txt");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let dest_dir = SandboxDir::create().unwrap();
        copy_flat(&link, dest_dir.path()).unwrap();

        let copied = dest_dir.path().join("link.txt");
        assert!(fs::symlink_metadata(&copied).unwrap().file_type().is_symlink());

        dest_dir.remove().unwrap();
    }

    #[test]
    fn build_argv_orders_sudo_tmpdir_fixed_then_request_argv() {
        let mut command = CommandSpec::new("python", "/usr/bin/python3");
        command.user = Some("sandbox".to_owned());
        command.extra_argv = vec!["-E".to_owned()];

        let argv = build_argv(&command, &["jailed_code".to_owned(), "arg1".to_owned()]);
        assert_eq!(
            vec!["sudo", "-u", "sandbox", "TMPDIR=tmp", "/usr/bin/python3", "-E", "jailed_code", "arg1"],
            argv
        );
    }

    #[test]
    fn build_argv_appends_bindings_extra_argv_after_commands_own() {
        let mut command = CommandSpec::new("python", "/usr/bin/python3");
        command.binding = Some(std::sync::Arc::new(crate::languages::PythonBinding));

        let argv = build_argv(&command, &["jailed_code".to_owned()]);
        assert_eq!(vec!["TMPDIR=tmp", "/usr/bin/python3", "-E", "-B", "jailed_code"], argv);
    }
}
