//! Spawn requests and the processes they start.
//!
//! A [`SpawnRequest`] is validated into argv and environment before any
//! backend sees it. Host-side children are tracked in a [`ProcessTable`]
//! until they are reaped, either by the caller through
//! [`ProcessTable::wait`] or by [`ProcessTable::terminate_all`] at destroy.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use containerv_common::constants::REAP_POLL_INTERVAL_MS;
use containerv_common::error::{ContainervError, Result};
use containerv_image::layer;
use serde::{Deserialize, Serialize};

/// Which output stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// One captured line, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    /// Source stream.
    pub stream: OutputStream,
    /// Line content. Invalid UTF-8 is replaced.
    pub line: String,
}

/// Receives captured output. Called from reader threads, one per stream.
pub type OutputHandler = Arc<dyn Fn(OutputLine) + Send + Sync>;

/// Spawn behavior switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnFlags {
    /// Block until the process exits and return its status.
    pub wait: bool,
    /// Stream stdout and stderr to the request's handler.
    pub capture_output: bool,
}

/// A command to run inside a container.
#[derive(Clone)]
pub struct SpawnRequest {
    /// Executable, resolved inside the container.
    pub path: PathBuf,
    /// Argument string, split with shell-like quoting.
    pub arguments: String,
    /// `KEY=VALUE` entries. Nothing is inherited from the caller.
    pub environment: Vec<String>,
    /// Absolute directory inside the container.
    pub working_dir: PathBuf,
    /// Behavior switches.
    pub flags: SpawnFlags,
    /// Output receiver, required with `capture_output`.
    pub handler: Option<OutputHandler>,
}

impl fmt::Debug for SpawnRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnRequest")
            .field("path", &self.path)
            .field("arguments", &self.arguments)
            .field("environment", &self.environment)
            .field("working_dir", &self.working_dir)
            .field("flags", &self.flags)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl SpawnRequest {
    /// Runs `path` with no arguments in `/`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            arguments: String::new(),
            environment: Vec::new(),
            working_dir: PathBuf::from("/"),
            flags: SpawnFlags::default(),
            handler: None,
        }
    }

    /// Sets the argument string.
    #[must_use]
    pub fn args(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = arguments.into();
        self
    }

    /// Adds one `KEY=VALUE` entry.
    #[must_use]
    pub fn env(mut self, entry: impl Into<String>) -> Self {
        self.environment.push(entry.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Waits for the process to exit.
    #[must_use]
    pub const fn wait(mut self) -> Self {
        self.flags.wait = true;
        self
    }

    /// Streams output lines to `handler`.
    #[must_use]
    pub fn capture(mut self, handler: impl Fn(OutputLine) + Send + Sync + 'static) -> Self {
        self.flags.capture_output = true;
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Checks the request and splits it into argv and environment.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` for an empty path, an unbalanced quote, a bad
    /// environment entry, a working directory that is relative or climbs
    /// out, or output capture without a handler.
    pub fn prepare(&self) -> Result<PreparedSpawn> {
        if self.path.as_os_str().is_empty() {
            return Err(ContainervError::invalid("spawn path is empty"));
        }
        if self.flags.capture_output && self.handler.is_none() {
            return Err(ContainervError::invalid(
                "output capture requested without a handler",
            ));
        }
        if !self.working_dir.is_absolute() {
            return Err(ContainervError::invalid(format!(
                "working directory must be absolute: {}",
                self.working_dir.display()
            )));
        }
        let inside = layer::relative_inside(&self.working_dir, "working directory")?;
        Ok(PreparedSpawn {
            path: self.path.clone(),
            arguments: split_arguments(&self.arguments)?,
            environment: validate_environment(&self.environment)?,
            working_dir: Path::new("/").join(inside),
        })
    }
}

/// A validated request, ready for a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSpawn {
    /// Executable.
    pub path: PathBuf,
    /// Split arguments, not including the executable.
    pub arguments: Vec<String>,
    /// Environment in request order.
    pub environment: Vec<(String, String)>,
    /// Normalized absolute directory inside the container.
    pub working_dir: PathBuf,
}

/// Result of a spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpawnOutcome {
    /// The process ran to completion with this status.
    Exited(i32),
    /// The process is running; reap it with `wait_process`.
    Running(u32),
}

impl SpawnOutcome {
    /// Exit status, if the spawn waited.
    #[must_use]
    pub const fn exit_code(self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(code),
            Self::Running(_) => None,
        }
    }

    /// Pid to reap, if the spawn did not wait.
    #[must_use]
    pub const fn pid(self) -> Option<u32> {
        match self {
            Self::Exited(_) => None,
            Self::Running(pid) => Some(pid),
        }
    }
}

/// Splits an argument string the way a POSIX shell would, without
/// expansion: whitespace separates words, single quotes are literal, double
/// quotes honor `\"`, `\\`, `` \` ``, and `\$`, and a bare backslash escapes
/// the next character.
///
/// # Errors
///
/// Returns `InvalidSpec` for an unterminated quote or a trailing backslash.
pub fn split_arguments(input: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(ContainervError::invalid("unterminated single quote")),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some('\n') => {}
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => {
                                return Err(ContainervError::invalid("unterminated double quote"));
                            }
                        },
                        Some(c) => current.push(c),
                        None => return Err(ContainervError::invalid("unterminated double quote")),
                    }
                }
            }
            '\\' => match chars.next() {
                Some('\n') => {}
                Some(c) => {
                    in_word = true;
                    current.push(c);
                }
                None => return Err(ContainervError::invalid("trailing backslash in arguments")),
            },
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}

/// Parses `KEY=VALUE` entries, keeping their order.
///
/// # Errors
///
/// Returns `InvalidSpec` for an entry without `=`, an empty key, or a key
/// given twice.
pub fn validate_environment(entries: &[String]) -> Result<Vec<(String, String)>> {
    let mut seen = HashSet::new();
    let mut vars = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some((key, value)) = entry.split_once('=') else {
            return Err(ContainervError::invalid(format!(
                "environment entry without '=': {entry:?}"
            )));
        };
        if key.is_empty() {
            return Err(ContainervError::invalid(format!(
                "environment entry with empty key: {entry:?}"
            )));
        }
        if !seen.insert(key) {
            return Err(ContainervError::invalid(format!(
                "duplicate environment key: {key}"
            )));
        }
        vars.push((key.to_string(), value.to_string()));
    }
    Ok(vars)
}

/// Maps a wait status to a shell-style exit code: the exit status, or
/// `128 + signal` for a signal death.
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;

        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

#[derive(Debug)]
struct Tracked {
    child: Child,
    readers: Vec<JoinHandle<()>>,
}

/// Host-side children of one container that have not been reaped.
#[derive(Debug, Default)]
pub struct ProcessTable {
    entries: HashMap<u32, Tracked>,
}

impl ProcessTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Unreaped children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether every child has been reaped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pids of unreaped children.
    #[must_use]
    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.entries.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Starts `command` with the request's flags. Stdin is always null;
    /// uncaptured output is discarded.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the program does not exist, or the spawn or
    /// wait failure.
    pub fn run(&mut self, mut command: Command, request: &SpawnRequest) -> Result<SpawnOutcome> {
        let program = PathBuf::from(command.get_program());
        let capture = request.handler.as_ref().filter(|_| request.flags.capture_output);
        let _ = command.stdin(Stdio::null());
        if capture.is_some() {
            let _ = command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            let _ = command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = command.spawn().map_err(|e| spawn_error(&program, e))?;
        let pid = child.id();
        let readers = match capture {
            Some(handler) => match attach_readers(&mut child, handler) {
                Ok(readers) => readers,
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(e);
                }
            },
            None => Vec::new(),
        };
        tracing::debug!(pid, program = %program.display(), wait = request.flags.wait, "process spawned");

        if request.flags.wait {
            let status = child.wait().map_err(|e| ContainervError::io(&program, e))?;
            join_readers(readers);
            let code = exit_code(status);
            tracing::debug!(pid, code, "process exited");
            return Ok(SpawnOutcome::Exited(code));
        }
        let _ = self.entries.insert(pid, Tracked { child, readers });
        Ok(SpawnOutcome::Running(pid))
    }

    /// Blocks until `pid` exits and returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `pid` is not an unreaped child of this table.
    pub fn wait(&mut self, pid: u32) -> Result<i32> {
        let mut tracked = self.entries.remove(&pid).ok_or_else(|| ContainervError::NotFound {
            kind: "process",
            id: pid.to_string(),
        })?;
        let status = tracked
            .child
            .wait()
            .map_err(|e| ContainervError::io(format!("/proc/{pid}"), e))?;
        join_readers(tracked.readers);
        Ok(exit_code(status))
    }

    /// Sends SIGTERM to every child, waits up to `grace` for them to exit,
    /// then kills the rest. Every child is reaped. Returns how many had to
    /// be killed.
    pub fn terminate_all(&mut self, grace: Duration) -> usize {
        if self.entries.is_empty() {
            return 0;
        }
        for (pid, tracked) in &mut self.entries {
            tracing::debug!(pid, "sending SIGTERM");
            request_exit(&mut tracked.child);
        }

        let deadline = Instant::now() + grace;
        loop {
            self.entries.retain(|pid, tracked| match tracked.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(pid, code = exit_code(status), "process exited");
                    false
                }
                Ok(None) | Err(_) => true,
            });
            if self.entries.is_empty() || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(REAP_POLL_INTERVAL_MS));
        }

        let killed = self.entries.len();
        for (pid, mut tracked) in self.entries.drain() {
            tracing::warn!(pid, "process ignored SIGTERM, killing");
            let _ = tracked.child.kill();
            let _ = tracked.child.wait();
        }
        killed
    }
}

impl Drop for ProcessTable {
    fn drop(&mut self) {
        let _ = self.terminate_all(Duration::ZERO);
    }
}

fn spawn_error(program: &Path, e: std::io::Error) -> ContainervError {
    match e.kind() {
        std::io::ErrorKind::NotFound => ContainervError::NotFound {
            kind: "executable",
            id: program.display().to_string(),
        },
        std::io::ErrorKind::PermissionDenied => ContainervError::PermissionDenied {
            message: format!("cannot execute {}: {e}", program.display()),
        },
        _ => ContainervError::io(program, e),
    }
}

#[cfg(unix)]
fn request_exit(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) {
    let _ = child.kill();
}

fn attach_readers(child: &mut Child, handler: &OutputHandler) -> Result<Vec<JoinHandle<()>>> {
    let mut readers = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        readers.push(forward_lines(out, OutputStream::Stdout, Arc::clone(handler))?);
    }
    if let Some(err) = child.stderr.take() {
        readers.push(forward_lines(err, OutputStream::Stderr, Arc::clone(handler))?);
    }
    Ok(readers)
}

/// Reads `source` line by line on its own thread until EOF.
pub(crate) fn forward_lines(
    source: impl Read + Send + 'static,
    stream: OutputStream,
    handler: OutputHandler,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("capture-{stream}"))
        .spawn(move || {
            let mut reader = BufReader::new(source);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        while matches!(buf.last(), Some(b'\n' | b'\r')) {
                            let _ = buf.pop();
                        }
                        handler(OutputLine {
                            stream,
                            line: String::from_utf8_lossy(&buf).into_owned(),
                        });
                    }
                }
            }
        })
        .map_err(|e| ContainervError::io("capture thread", e))
}

fn join_readers(readers: Vec<JoinHandle<()>>) {
    for reader in readers {
        if reader.join().is_err() {
            tracing::warn!("output handler panicked");
        }
    }
}
