//! Worker process supervision.
//!
//! Resolves the script reference, builds the runtime's argument vector
//! (`<runtime args> [-c config] <permission flags> <script> <script args>`),
//! spawns with stdin/stdout/stderr piped and forwards stderr lines into
//! tracing under the `scriptbridge::worker` target.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use futures::StreamExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::Level;
use url::Url;

use crate::config_lookup::ConfigLocator;
use crate::permissions::{Permissions, launch_flags, launch_flags_with_network};

/// Overrides the runtime executable for every [`RuntimeCommand::default`].
pub const RUNTIME_ENV: &str = "SCRIPTBRIDGE_RUNTIME";

const STDERR_MAX_LINE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("invalid script reference {script:?}: {reason}")]
    InvalidScript { script: String, reason: String },
    #[error("failed to determine working directory: {0}")]
    CurrentDir(#[source] io::Error),
    #[error("failed to spawn {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("worker {0} was not captured")]
    StdioNotCaptured(&'static str),
    #[error("failed to wait for worker: {0}")]
    Wait(#[source] io::Error),
    #[error("failed to kill worker: {0}")]
    Kill(#[source] io::Error),
}

/// Where the worker script lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptRef {
    /// Absolute local path.
    Local(PathBuf),
    /// Any non-`file` URL, handed to the runtime untouched.
    Remote(String),
}

impl ScriptRef {
    pub fn resolve(script: &str, cwd: &Path) -> Result<Self, SupervisorError> {
        let invalid = |reason: &str| SupervisorError::InvalidScript {
            script: script.to_string(),
            reason: reason.to_string(),
        };

        if script.trim().is_empty() {
            return Err(invalid("empty script reference"));
        }

        if script.contains("://") {
            let url = Url::parse(script).map_err(|e| invalid(&e.to_string()))?;
            if url.scheme() != "file" {
                return Ok(ScriptRef::Remote(script.to_string()));
            }
            let path = url
                .to_file_path()
                .map_err(|()| invalid("file URL does not name a local path"))?;
            return Ok(ScriptRef::Local(absolutize(&path, cwd)));
        }

        Ok(ScriptRef::Local(absolutize(Path::new(script), cwd)))
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            ScriptRef::Local(path) => Some(path),
            ScriptRef::Remote(_) => None,
        }
    }

    fn to_arg(&self) -> OsString {
        match self {
            ScriptRef::Local(path) => path.as_os_str().to_owned(),
            ScriptRef::Remote(url) => OsString::from(url),
        }
    }
}

/// Join onto `cwd` if relative and drop `.`/`..` lexically, without touching
/// the filesystem.
fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Runtime config file selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfigFile {
    /// Search upward from a local script.
    #[default]
    Auto,
    Path(PathBuf),
    /// Never pass a config file.
    Disabled,
}

impl ConfigFile {
    /// `/dev/null` is accepted as an explicit "no config".
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path == Path::new("/dev/null") {
            ConfigFile::Disabled
        } else {
            ConfigFile::Path(path)
        }
    }
}

/// The runtime executable and its leading arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub config_flag: String,
}

impl Default for RuntimeCommand {
    fn default() -> Self {
        let program = std::env::var_os(RUNTIME_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("deno"));
        Self::new(program)
    }
}

impl RuntimeCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["run".to_string(), "-q".to_string()],
            config_flag: "-c".to_string(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config_flag(mut self, flag: impl Into<String>) -> Self {
        self.config_flag = flag.into();
        self
    }
}

/// Which transport the worker will speak. The secure binding listens on a
/// socket and so always needs network permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Stdio,
    Secure,
}

/// Everything needed to start one worker.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub script: String,
    pub config: ConfigFile,
    pub permissions: Option<Permissions>,
    pub script_args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub runtime: RuntimeCommand,
    /// Level for stderr lines that carry no recognizable severity.
    pub stderr_level: Level,
}

impl LaunchSpec {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            config: ConfigFile::Auto,
            permissions: None,
            script_args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            runtime: RuntimeCommand::default(),
            stderr_level: Level::DEBUG,
        }
    }

    pub fn with_config(mut self, config: ConfigFile) -> Self {
        self.config = config;
        self
    }

    pub fn with_config_path(self, path: impl Into<PathBuf>) -> Self {
        self.with_config(ConfigFile::from_path(path))
    }

    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.script_args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeCommand) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_stderr_level(mut self, level: Level) -> Self {
        self.stderr_level = level;
        self
    }
}

/// Fully resolved program and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub script: ScriptRef,
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Spawns workers. Holds the config lookup cache so repeated launches of the
/// same script skip the filesystem walk.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    locator: Arc<ConfigLocator>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_locator(locator: Arc<ConfigLocator>) -> Self {
        Self { locator }
    }

    pub fn locator(&self) -> &Arc<ConfigLocator> {
        &self.locator
    }

    pub fn command_line(
        &self,
        spec: &LaunchSpec,
        binding: Binding,
    ) -> Result<CommandLine, SupervisorError> {
        let cwd = match &spec.current_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().map_err(SupervisorError::CurrentDir)?,
        };
        let script = ScriptRef::resolve(&spec.script, &cwd)?;

        let config = match &spec.config {
            ConfigFile::Auto => script.local_path().and_then(|p| self.locator.locate(p)),
            ConfigFile::Path(path) => Some(absolutize(path, &cwd)),
            ConfigFile::Disabled => None,
        };

        let mut args: Vec<OsString> = spec.runtime.args.iter().map(OsString::from).collect();
        if let Some(config) = config {
            args.push(OsString::from(&spec.runtime.config_flag));
            args.push(config.into_os_string());
        }

        let flags = match binding {
            Binding::Stdio => launch_flags(spec.permissions.as_ref()),
            Binding::Secure => launch_flags_with_network(spec.permissions.as_ref()),
        };
        args.extend(flags.into_iter().map(OsString::from));
        args.push(script.to_arg());
        args.extend(spec.script_args.iter().map(OsString::from));

        Ok(CommandLine {
            program: spec.runtime.program.clone(),
            args,
            script,
        })
    }

    /// Start the worker with all three standard streams piped. The child is
    /// killed if the returned handle is dropped.
    pub fn spawn(
        &self,
        spec: &LaunchSpec,
        binding: Binding,
    ) -> Result<WorkerProcess, SupervisorError> {
        let line = self.command_line(spec, binding)?;
        tracing::debug!(command = %line, "Spawning worker");

        let mut command = Command::new(&line.program);
        command
            .args(&line.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            program: line.program.clone(),
            source,
        })?;
        let pid = child.id();
        tracing::info!(pid, script = ?line.script, "Worker started");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(forward_stderr(stderr, spec.stderr_level, pid)));

        Ok(WorkerProcess {
            child,
            pid,
            stdin,
            stdout,
            stderr_task,
            status: None,
        })
    }
}

/// A running (or finished) worker and its pipes.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_task: Option<JoinHandle<()>>,
    status: Option<ExitStatus>,
}

impl WorkerProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_stdin(&mut self) -> Result<ChildStdin, SupervisorError> {
        self.stdin.take().ok_or(SupervisorError::StdioNotCaptured("stdin"))
    }

    pub fn take_stdout(&mut self) -> Result<ChildStdout, SupervisorError> {
        self.stdout.take().ok_or(SupervisorError::StdioNotCaptured("stdout"))
    }

    /// Exit status, if the process has been reaped.
    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Wait for exit. Cancel-safe; the status is remembered.
    pub async fn wait(&mut self) -> Result<ExitStatus, SupervisorError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait().await.map_err(SupervisorError::Wait)?;
        tracing::debug!(pid = self.pid, %status, "Worker exited");
        self.status = Some(status);
        Ok(status)
    }

    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, SupervisorError> {
        if self.status.is_none() {
            self.status = self.child.try_wait().map_err(SupervisorError::Wait)?;
        }
        Ok(self.status)
    }

    /// Kill the process if it is still running, then reap it.
    pub async fn kill(&mut self) -> Result<ExitStatus, SupervisorError> {
        if let Some(status) = self.try_wait()? {
            return Ok(status);
        }
        tracing::debug!(pid = self.pid, "Killing worker");
        if let Err(e) = self.child.start_kill() {
            // Lost a race with a natural exit.
            if let Some(status) = self.try_wait()? {
                return Ok(status);
            }
            return Err(SupervisorError::Kill(e));
        }
        self.wait().await
    }

    /// Wait for the stderr forwarder to drain.
    pub async fn join_stderr(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            let _ = task.await;
        }
    }
}

/// Remove ANSI escape sequences (colours from the worker's log formatter).
fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            if chars.next() == Some('[') {
                for c in chars.by_ref() {
                    if ('@'..='~').contains(&c) {
                        break;
                    }
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

fn is_timestamp(token: &str) -> bool {
    token.chars().any(|c| c.is_ascii_digit())
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || "-:.,/+TZ".contains(c))
}

/// Best-effort severity of a worker log line: a level keyword as the first
/// token (`ERROR`, `warn:`, `[info]`, ...), optionally after a timestamp.
pub fn line_severity(line: &str) -> Option<Level> {
    let line = strip_ansi(line);
    let token = line
        .split_whitespace()
        .map(|token| token.trim_matches(|c: char| "[]()<>:".contains(c)))
        .filter(|token| !token.is_empty())
        .take(3)
        .find(|token| !is_timestamp(token))?;
    match token.to_ascii_uppercase().as_str() {
        "ERROR" | "FATAL" | "PANIC" => Some(Level::ERROR),
        "WARN" | "WARNING" => Some(Level::WARN),
        "INFO" => Some(Level::INFO),
        "DEBUG" => Some(Level::DEBUG),
        "TRACE" => Some(Level::TRACE),
        _ => None,
    }
}

fn emit_worker_line(level: Level, pid: Option<u32>, line: &str) {
    match level {
        Level::ERROR => tracing::error!(target: "scriptbridge::worker", pid, "{}", line),
        Level::WARN => tracing::warn!(target: "scriptbridge::worker", pid, "{}", line),
        Level::INFO => tracing::info!(target: "scriptbridge::worker", pid, "{}", line),
        Level::DEBUG => tracing::debug!(target: "scriptbridge::worker", pid, "{}", line),
        _ => tracing::trace!(target: "scriptbridge::worker", pid, "{}", line),
    }
}

async fn forward_stderr(stderr: ChildStderr, default_level: Level, pid: Option<u32>) {
    let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(STDERR_MAX_LINE));
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => {
                let line = strip_ansi(&line);
                emit_worker_line(line_severity(&line).unwrap_or(default_level), pid, &line);
            }
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::warn!(
                    target: "scriptbridge::worker",
                    pid,
                    "Worker stderr line too long, truncated"
                );
            }
            Err(LinesCodecError::Io(e)) => {
                tracing::debug!(pid, error = %e, "Worker stderr closed");
                break;
            }
        }
    }
}

/// Forward any lines left on a reader (stdout after the secure handshake)
/// to the debug log until EOF.
pub(crate) async fn forward_lines<R>(reader: R, pid: Option<u32>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(STDERR_MAX_LINE));
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                tracing::debug!(target: "scriptbridge::worker", pid, stream = "stdout", "{}", line)
            }
            Err(LinesCodecError::MaxLineLengthExceeded) => continue,
            Err(LinesCodecError::Io(_)) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn deno() -> RuntimeCommand {
        RuntimeCommand::new("deno")
    }

    fn args_of(line: &CommandLine) -> Vec<String> {
        line.args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn relative_script_resolved_against_cwd() {
        let script =
            ScriptRef::resolve("./scripts/../main.ts", Path::new("/work/project")).unwrap();
        assert_eq!(script, ScriptRef::Local(PathBuf::from("/work/project/main.ts")));
    }

    #[test]
    fn absolute_script_kept() {
        let script = ScriptRef::resolve("/opt/worker.ts", Path::new("/elsewhere")).unwrap();
        assert_eq!(script, ScriptRef::Local(PathBuf::from("/opt/worker.ts")));
    }

    #[cfg(unix)]
    #[test]
    fn file_url_becomes_local_path() {
        let script =
            ScriptRef::resolve("file:///opt/my%20scripts/worker.ts", Path::new("/")).unwrap();
        assert_eq!(
            script,
            ScriptRef::Local(PathBuf::from("/opt/my scripts/worker.ts"))
        );
    }

    #[test]
    fn remote_url_passed_through() {
        let url = "https://deno.land/x/worker/mod.ts?v=1";
        let script = ScriptRef::resolve(url, Path::new("/")).unwrap();
        assert_eq!(script, ScriptRef::Remote(url.to_string()));
    }

    #[test]
    fn empty_script_rejected() {
        assert!(matches!(
            ScriptRef::resolve("  ", Path::new("/")),
            Err(SupervisorError::InvalidScript { .. })
        ));
    }

    #[test]
    fn argument_order() {
        let spec = LaunchSpec::new("main.ts")
            .with_current_dir("/work")
            .with_runtime(deno())
            .with_config_path("/work/deno.json")
            .with_permissions(Permissions::new().with_allow("read").with_deny("env"))
            .with_arg("--verbose");

        let line = ProcessSupervisor::new().command_line(&spec, Binding::Stdio).unwrap();
        assert_eq!(line.program, PathBuf::from("deno"));
        assert_eq!(
            args_of(&line),
            vec![
                "run",
                "-q",
                "-c",
                "/work/deno.json",
                "--allow-read",
                "--deny-env",
                "/work/main.ts",
                "--verbose",
            ]
        );
        assert_eq!(
            line.to_string(),
            "deno run -q -c /work/deno.json --allow-read --deny-env /work/main.ts --verbose"
        );
    }

    #[test]
    fn dev_null_disables_config() {
        let spec = LaunchSpec::new("/srv/main.ts")
            .with_runtime(deno())
            .with_config_path("/dev/null");
        assert_eq!(spec.config, ConfigFile::Disabled);
        let line = ProcessSupervisor::new().command_line(&spec, Binding::Stdio).unwrap();
        assert_eq!(args_of(&line), vec!["run", "-q", "/srv/main.ts"]);
    }

    #[test]
    fn config_discovered_for_local_scripts_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("deno.jsonc"), "{}").unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();

        let supervisor = ProcessSupervisor::new();
        let local = LaunchSpec::new("src/main.ts")
            .with_current_dir(dir.path())
            .with_runtime(deno());
        let line = supervisor.command_line(&local, Binding::Stdio).unwrap();
        let config = dir.path().join("deno.jsonc");
        assert_eq!(
            args_of(&line),
            vec![
                "run".to_string(),
                "-q".to_string(),
                "-c".to_string(),
                config.display().to_string(),
                dir.path().join("src/main.ts").display().to_string(),
            ]
        );
        assert_eq!(supervisor.locator().cached_entries(), 1);

        let remote = LaunchSpec::new("https://example.com/main.ts").with_runtime(deno());
        let line = supervisor.command_line(&remote, Binding::Stdio).unwrap();
        assert_eq!(args_of(&line), vec!["run", "-q", "https://example.com/main.ts"]);
        assert_eq!(supervisor.locator().cached_entries(), 1);
    }

    #[test]
    fn secure_binding_adds_network_flag() {
        let spec = LaunchSpec::new("/srv/main.ts")
            .with_runtime(deno())
            .with_config(ConfigFile::Disabled);
        let line = ProcessSupervisor::new().command_line(&spec, Binding::Secure).unwrap();
        assert_eq!(args_of(&line), vec!["run", "-q", "--allow-net", "/srv/main.ts"]);
    }

    #[test]
    fn severity_detection() {
        assert_eq!(line_severity("error: Uncaught TypeError"), Some(Level::ERROR));
        assert_eq!(line_severity("[WARN] deprecated flag"), Some(Level::WARN));
        assert_eq!(
            line_severity("2026-01-02T03:04:05.000000Z  INFO worker: ready"),
            Some(Level::INFO)
        );
        assert_eq!(
            line_severity("\u{1b}[2m2026-01-02T03:04:05Z\u{1b}[0m \u{1b}[34mDEBUG\u{1b}[0m x"),
            Some(Level::DEBUG)
        );
        assert_eq!(line_severity("listening on 127.0.0.1"), None);
        assert_eq!(line_severity("2026-01-02 03:04:05,120 [warning] slow"), Some(Level::WARN));
        assert_eq!(line_severity("[2026-01-02T03:04:05Z ERROR] boom"), Some(Level::ERROR));
    }

    #[test]
    fn level_words_mid_sentence_are_not_levels() {
        assert_eq!(line_severity("failed to load debug symbols"), None);
        assert_eq!(line_severity("no error found"), None);
        assert_eq!(line_severity("2026-01-02T03:04:05Z retrying after warn threshold"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_wires_pipes_and_reports_exit() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let spec = LaunchSpec::new("/unused/main.ts")
            .with_config(ConfigFile::Disabled)
            .with_runtime(RuntimeCommand::new("sh").with_args([
                "-c",
                "echo 'WARN starting' >&2; read line; echo \"got $line\"; exit 3",
                "worker",
            ]));

        let mut worker = ProcessSupervisor::new().spawn(&spec, Binding::Stdio).unwrap();
        assert!(worker.pid().is_some());

        let mut stdin = worker.take_stdin().unwrap();
        let stdout = worker.take_stdout().unwrap();
        assert!(matches!(
            worker.take_stdin(),
            Err(SupervisorError::StdioNotCaptured("stdin"))
        ));

        stdin.write_all(b"ping\n").await.unwrap();
        let mut lines = BufReader::new(stdout).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("got ping"));

        let status = worker.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
        assert_eq!(worker.kill().await.unwrap().code(), Some(3));
        worker.join_stderr().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_stops_a_running_worker() {
        let spec = LaunchSpec::new("/unused/main.ts")
            .with_config(ConfigFile::Disabled)
            .with_runtime(RuntimeCommand::new("sh").with_args(["-c", "sleep 30", "worker"]));

        let mut worker = ProcessSupervisor::new().spawn(&spec, Binding::Stdio).unwrap();
        assert!(worker.try_wait().unwrap().is_none());
        let status = worker.kill().await.unwrap();
        assert!(!status.success());
        assert_eq!(worker.status(), Some(status));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let spec = LaunchSpec::new("/srv/main.ts")
            .with_config(ConfigFile::Disabled)
            .with_runtime(RuntimeCommand::new("/definitely/not/a/runtime"));
        let err = ProcessSupervisor::new()
            .spawn(&spec, Binding::Stdio)
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }), "{err}");
    }
}
