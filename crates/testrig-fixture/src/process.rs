//! Argument-vector building and a thin handle over spawned OS processes.
//!
//! The launcher knows nothing about what the program does.  It turns a
//! structured option map into `--key[=value]` arguments and exposes
//! `start`/`poll`/`stop`/`wait` over the child process.  Child stdout and
//! stderr are forwarded line by line to the `log` facade, prefixed with the
//! process name.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;
use thiserror::Error;

const SPAWN_RETRIES: u32 = 10;

/// Options whose values name credential or key files.  These files are made
/// owner-only before the process starts.
pub const CREDENTIAL_OPTIONS: &[&str] = &[
    "keyFile",
    "sslPEMKeyFile",
    "sslClusterFile",
    "tlsCertificateKeyFile",
    "tlsClusterFile",
];

/// A single option value.
///
/// An empty string renders as a bare flag.  Lists are space-joined.  Maps are
/// flattened into repeated `--key name=value` pairs, which is how
/// `setParameter` is passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<String>),
    Map(BTreeMap<String, OptionValue>),
}

/// Structured options for one program invocation.
pub type OptionMap = BTreeMap<String, OptionValue>;

impl OptionValue {
    /// A bare `--key` flag.
    pub fn flag() -> Self {
        OptionValue::Str(String::new())
    }

    /// Render a scalar (or list) value.  Booleans are lower-cased.
    fn render(&self) -> String {
        match self {
            OptionValue::Bool(b) => b.to_string(),
            OptionValue::Int(n) => n.to_string(),
            OptionValue::Str(s) => s.clone(),
            OptionValue::List(items) => items.join(" "),
            OptionValue::Map(map) => map
                .iter()
                .map(|(k, v)| format!("{}={}", k, v.render()))
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        OptionValue::Str(s.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        OptionValue::Str(s)
    }
}

impl From<bool> for OptionValue {
    fn from(b: bool) -> Self {
        OptionValue::Bool(b)
    }
}

impl From<i64> for OptionValue {
    fn from(n: i64) -> Self {
        OptionValue::Int(n)
    }
}

impl From<u16> for OptionValue {
    fn from(n: u16) -> Self {
        OptionValue::Int(i64::from(n))
    }
}

impl From<Vec<String>> for OptionValue {
    fn from(items: Vec<String>) -> Self {
        OptionValue::List(items)
    }
}

impl From<BTreeMap<String, OptionValue>> for OptionValue {
    fn from(map: BTreeMap<String, OptionValue>) -> Self {
        OptionValue::Map(map)
    }
}

/// Build the argument vector for `executable`.
///
/// `setParameter` pairs come first, then the remaining options in key order,
/// then `positional`.
///
/// ```
/// use std::path::Path;
/// use testrig_fixture::process::{build_args, OptionMap, OptionValue};
///
/// let mut options = OptionMap::new();
/// options.insert("port".into(), OptionValue::from(20000u16));
/// options.insert("nojournal".into(), OptionValue::flag());
/// let args = build_args(Path::new("mongod"), &options, &[]);
/// assert_eq!(args, vec!["mongod", "--nojournal", "--port=20000"]);
/// ```
pub fn build_args(executable: &Path, options: &OptionMap, positional: &[String]) -> Vec<String> {
    let mut args = vec![executable.to_string_lossy().into_owned()];

    if let Some(OptionValue::Map(params)) = options.get("setParameter") {
        push_repeated(&mut args, "setParameter", params);
    }

    for (key, value) in options {
        match value {
            OptionValue::Map(_) if key == "setParameter" => {}
            OptionValue::Map(pairs) => push_repeated(&mut args, key, pairs),
            other => {
                let rendered = other.render();
                if rendered.is_empty() {
                    args.push(format!("--{}", key));
                } else {
                    args.push(format!("--{}={}", key, rendered));
                }
            }
        }
    }

    args.extend(positional.iter().cloned());
    args
}

fn push_repeated(args: &mut Vec<String>, key: &str, pairs: &BTreeMap<String, OptionValue>) {
    for (name, value) in pairs {
        args.push(format!("--{}", key));
        args.push(format!("{}={}", name, value.render()));
    }
}

/// Make credential files named in `options` readable by the owner only.
///
/// Failures are logged and ignored: some filesystems do not support the
/// permission change, and the process may still start.
pub fn restrict_credential_files(options: &OptionMap) {
    for key in CREDENTIAL_OPTIONS {
        let Some(OptionValue::Str(path)) = options.get(*key) else {
            continue;
        };
        if path.is_empty() {
            continue;
        }
        let result = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
        if let Err(err) = result {
            warn!("Could not restrict permissions of {} ({}): {}", path, key, err);
        }
    }
}

/// Errors from launching and controlling a process.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("empty argument vector for process '{0}'")]
    EmptyArgs(String),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("process '{0}' has not been started")]
    NotStarted(String),

    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for pid {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Lifecycle of a process handle.
///
/// Exit codes follow the shell convention for signals: a process terminated
/// by signal N reports `-N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Exited(i32),
    /// Exited after `stop(StopSignal::Kill)`.
    Killed(i32),
}

/// How to ask a process to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM: clean shutdown.
    Terminate,
    /// SIGKILL: no cleanup.
    Kill,
}

impl StopSignal {
    fn as_raw(self) -> libc::c_int {
        match self {
            StopSignal::Terminate => libc::SIGTERM,
            StopSignal::Kill => libc::SIGKILL,
        }
    }
}

/// Handle to one spawned OS process.
///
/// Owned exclusively by the fixture that launched it.  A handle can be
/// started again after its process exited.
pub struct Process {
    name: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    child: Option<Child>,
    state: ProcessState,
    kill_requested: bool,
}

impl Process {
    /// Create a handle for `args` (`args[0]` is the executable).
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            args,
            env: BTreeMap::new(),
            child: None,
            state: ProcessState::NotStarted,
            kill_requested: false,
        }
    }

    /// Set an environment variable for the child.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// PID of the current child, if one was spawned.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Last observed state, without polling.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Spawn the process.
    pub fn start(&mut self) -> Result<(), ProcessError> {
        if self.args.is_empty() {
            return Err(ProcessError::EmptyArgs(self.name.clone()));
        }
        if self.poll() == ProcessState::Running {
            warn!("Process '{}' is already running; not starting it again", self.name);
            return Ok(());
        }

        info!("Starting {}: {}", self.name, self.args.join(" "));
        let program = self.args[0].clone();
        let mut attempt = 0;
        let mut child = loop {
            let spawned = Command::new(&program)
                .args(&self.args[1..])
                .envs(&self.env)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn();
            match spawned {
                Ok(child) => break child,
                // ETXTBSY: a freshly written executable is still open in a
                // concurrently forked child.
                Err(err) if err.raw_os_error() == Some(libc::ETXTBSY) && attempt < SPAWN_RETRIES => {
                    attempt += 1;
                    thread::sleep(Duration::from_millis(20));
                }
                Err(source) => return Err(ProcessError::Spawn { program, source }),
            }
        };

        if let Some(stdout) = child.stdout.take() {
            forward_output(self.name.clone(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(self.name.clone(), stderr);
        }

        debug!("{} started with pid {}", self.name, child.id());
        self.child = Some(child);
        self.state = ProcessState::Running;
        self.kill_requested = false;
        Ok(())
    }

    /// Non-blocking liveness check.
    pub fn poll(&mut self) -> ProcessState {
        if self.state != ProcessState::Running {
            return self.state;
        }
        let Some(child) = self.child.as_mut() else {
            return self.state;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(status);
            }
            Ok(None) => {}
            Err(err) => warn!("Could not poll {} (pid {}): {}", self.name, child.id(), err),
        }
        self.state
    }

    /// Whether the process is currently alive.
    pub fn is_running(&mut self) -> bool {
        self.poll() == ProcessState::Running
    }

    /// Send `signal` to the process.  A no-op if it is not running.
    pub fn stop(&mut self, signal: StopSignal) -> Result<(), ProcessError> {
        if self.poll() != ProcessState::Running {
            return Ok(());
        }
        let Some(pid) = self.pid() else {
            return Ok(());
        };

        if signal == StopSignal::Kill {
            self.kill_requested = true;
        }
        debug!("Sending {:?} to {} (pid {})", signal, self.name, pid);
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal.as_raw()) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // ESRCH: the process exited between poll() and kill().
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(ProcessError::Signal { pid, source: err });
            }
        }
        Ok(())
    }

    /// Block until the process exits and return its exit code.
    pub fn wait(&mut self) -> Result<i32, ProcessError> {
        match self.state {
            ProcessState::Exited(code) | ProcessState::Killed(code) => return Ok(code),
            ProcessState::NotStarted => return Err(ProcessError::NotStarted(self.name.clone())),
            ProcessState::Running => {}
        }
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| ProcessError::NotStarted(self.name.clone()))?;
        let pid = child.id();
        let status = child.wait().map_err(|source| ProcessError::Wait { pid, source })?;
        Ok(self.record_exit(status))
    }

    fn record_exit(&mut self, status: ExitStatus) -> i32 {
        let code = exit_code(status);
        self.state = if self.kill_requested {
            ProcessState::Killed(code)
        } else {
            ProcessState::Exited(code)
        };
        info!("{} exited with code {}", self.name, code);
        code
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.name)
            .field("pid", &self.pid())
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.poll() == ProcessState::Running {
            warn!("{} still running when its handle was dropped; killing it", self.name);
            if self.stop(StopSignal::Kill).is_ok() {
                let _ = self.wait();
            }
        }
    }
}

/// Exit code of `status`, or `-signal` if the process was killed by a signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(0))
}

fn forward_output<R: Read + Send + 'static>(label: String, stream: R) {
    let spawned = thread::Builder::new()
        .name(format!("{}-output", label))
        .spawn(move || {
            for line in BufReader::new(stream).lines() {
                match line {
                    Ok(line) => info!("[{}] {}", label, line),
                    Err(_) => break,
                }
            }
        });
    if let Err(err) = spawned {
        warn!("Could not start output forwarding thread: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn options(pairs: &[(&str, OptionValue)]) -> OptionMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn empty_value_is_bare_flag() {
        let args = build_args(
            Path::new("/bin/mongod"),
            &options(&[("nojournal", OptionValue::flag()), ("port", 27017u16.into())]),
            &[],
        );
        assert_eq!(args, vec!["/bin/mongod", "--nojournal", "--port=27017"]);
    }

    #[test]
    fn lists_are_space_joined() {
        let args = build_args(
            Path::new("mongo"),
            &options(&[(
                "eval",
                OptionValue::List(vec!["a=1;".to_string(), "b=2;".to_string()]),
            )]),
            &[],
        );
        assert_eq!(args, vec!["mongo", "--eval=a=1; b=2;"]);
    }

    #[test]
    fn set_parameter_is_flattened_first_with_lowercase_booleans() {
        let mut params = BTreeMap::new();
        params.insert("enableTestCommands".to_string(), OptionValue::Bool(true));
        params.insert("logLevel".to_string(), OptionValue::Int(1));
        params.insert("useFoo".to_string(), OptionValue::Bool(false));

        let args = build_args(
            Path::new("mongod"),
            &options(&[("dbpath", "/data/db".into()), ("setParameter", params.into())]),
            &["extra".to_string()],
        );
        assert_eq!(
            args,
            vec![
                "mongod",
                "--setParameter",
                "enableTestCommands=true",
                "--setParameter",
                "logLevel=1",
                "--setParameter",
                "useFoo=false",
                "--dbpath=/data/db",
                "extra",
            ]
        );
    }

    #[test]
    fn option_values_deserialize_untagged() {
        let parsed: OptionMap = serde_json::from_str(
            r#"{"a": true, "b": 3, "c": "x", "d": ["p", "q"], "e": {"k": false}}"#,
        )
        .unwrap();
        assert_eq!(parsed["a"], OptionValue::Bool(true));
        assert_eq!(parsed["b"], OptionValue::Int(3));
        assert_eq!(parsed["c"], OptionValue::from("x"));
        assert_eq!(parsed["d"], OptionValue::List(vec!["p".into(), "q".into()]));
        assert!(matches!(parsed["e"], OptionValue::Map(_)));
    }

    #[test]
    fn credential_files_become_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("keyfile");
        std::fs::write(&key, "secret").unwrap();
        std::fs::set_permissions(&key, std::fs::Permissions::from_mode(0o644)).unwrap();

        restrict_credential_files(&options(&[(
            "keyFile",
            key.to_string_lossy().into_owned().into(),
        )]));

        let mode = std::fs::metadata(&key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn missing_credential_file_is_ignored() {
        restrict_credential_files(&options(&[("keyFile", "/nonexistent/keyfile".into())]));
    }

    #[test]
    fn lifecycle_of_a_real_process() {
        let mut process = Process::new("sleep", vec!["sleep".into(), "30".into()]);
        assert_eq!(process.poll(), ProcessState::NotStarted);
        assert!(matches!(process.wait(), Err(ProcessError::NotStarted(_))));

        process.start().unwrap();
        assert!(process.is_running());
        assert!(process.pid().is_some());

        process.stop(StopSignal::Terminate).unwrap();
        assert_eq!(process.wait().unwrap(), -libc::SIGTERM);
        assert_eq!(process.state(), ProcessState::Exited(-libc::SIGTERM));

        // Stopping an exited process is a no-op.
        process.stop(StopSignal::Kill).unwrap();
    }

    #[test]
    fn kill_is_reported_as_killed() {
        let mut process = Process::new("sleep", vec!["sleep".into(), "30".into()]);
        process.start().unwrap();
        process.stop(StopSignal::Kill).unwrap();
        assert_eq!(process.wait().unwrap(), -libc::SIGKILL);
        assert_eq!(process.state(), ProcessState::Killed(-libc::SIGKILL));
    }

    #[test]
    fn poll_observes_exit_code() {
        let mut process = Process::new("sh", vec!["sh".into(), "-c".into(), "exit 3".into()]);
        process.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while process.poll() == ProcessState::Running && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(process.poll(), ProcessState::Exited(3));
    }

    #[test]
    fn spawn_failure_is_reported() {
        let mut process = Process::new("missing", vec!["/nonexistent/program".into()]);
        assert!(matches!(process.start(), Err(ProcessError::Spawn { .. })));
        assert!(matches!(
            Process::new("empty", Vec::new()).start(),
            Err(ProcessError::EmptyArgs(_))
        ));
    }
}
