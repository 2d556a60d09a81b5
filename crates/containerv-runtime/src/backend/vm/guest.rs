//! Client for the agent running inside a guest.
//!
//! Each call opens a TCP connection to the forwarded agent port, writes one
//! JSON request line, and reads reply lines until a final one:
//!
//! ```text
//! -> {"method":"spawn","params":{...}}
//! <- {"output":{"stream":"stdout","line":"hello"}}
//! <- {"result":{"exit_code":0}}
//! ```
//!
//! `install` is followed on the same connection by a tar stream of the
//! files to place at the target.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::time::{Duration, Instant};

use containerv_common::error::{ContainervError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::spawn::{OutputLine, PreparedSpawn, SpawnOutcome, SpawnRequest};

/// Maximum connection attempts per call.
const CONNECT_MAX_RETRIES: u32 = 8;
/// Delay between connection attempts.
const CONNECT_RETRY_DELAY_MS: u64 = 800;
/// Interval between readiness checks.
const READY_POLL_INTERVAL_MS: u64 = 500;
/// Timeout for one readiness check.
const PING_TIMEOUT: Duration = Duration::from_secs(1);
/// Reply timeout for calls that do not wait on guest processes.
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct Request<'a> {
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Reply {
    Output(OutputLine),
    Result(Value),
    Error(AgentError),
}

#[derive(Debug, Deserialize)]
struct AgentError {
    kind: String,
    message: String,
}

impl From<AgentError> for ContainervError {
    fn from(e: AgentError) -> Self {
        let message = format!("guest agent: {}", e.message);
        match e.kind.as_str() {
            "invalid_spec" => Self::InvalidSpec { message },
            "not_found" => Self::NotFound {
                kind: "guest resource",
                id: e.message,
            },
            "permission_denied" => Self::PermissionDenied { message },
            "not_supported" => Self::NotSupported { message },
            _ => Self::Internal { message },
        }
    }
}

#[derive(Debug, Deserialize)]
struct SpawnReply {
    exit_code: Option<i32>,
    pid: Option<u32>,
}

/// Connection details of one guest agent.
#[derive(Debug, Clone)]
pub struct GuestAgent {
    addr: SocketAddr,
    io_timeout: Duration,
}

impl GuestAgent {
    /// Agent reachable at `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    /// Overrides the reply timeout of non-waiting calls.
    #[must_use]
    pub const fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Agent address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the agent answers a ping right now.
    #[must_use]
    pub fn ping(&self) -> bool {
        let Ok(mut stream) = TcpStream::connect_timeout(&self.addr, PING_TIMEOUT) else {
            return false;
        };
        let _ = stream.set_read_timeout(Some(PING_TIMEOUT));
        matches!(
            exchange(&mut stream, "ping", json!({}), &mut |_| {}),
            Ok(Value::String(s)) if s == "pong"
        )
    }

    /// Polls until the agent answers or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on timeout.
    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.ping() {
                tracing::info!(addr = %self.addr, elapsed_ms = start.elapsed().as_millis(), "guest agent ready");
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(READY_POLL_INTERVAL_MS));
        }
        Err(ContainervError::internal(format!(
            "guest agent at {} not reachable within {}s",
            self.addr,
            timeout.as_secs()
        )))
    }

    /// Sends one request and returns its result.
    ///
    /// # Errors
    ///
    /// Returns the agent's error, or `Io` if it cannot be reached.
    pub fn call(&self, method: &str, params: Value) -> Result<Value> {
        let mut stream = self.connect(Some(self.io_timeout))?;
        exchange(&mut stream, method, params, &mut |_| {})
    }

    /// Runs a prepared request in the guest. Output lines go to the
    /// request's handler when capture is on.
    ///
    /// # Errors
    ///
    /// Returns the agent's error, or `Internal` for a malformed reply.
    pub fn provision(&self, request: &SpawnRequest, prepared: &PreparedSpawn) -> Result<SpawnOutcome> {
        let wait = request.flags.wait;
        let mut stream = self.connect((!wait).then_some(self.io_timeout))?;
        let params = json!({
            "path": prepared.path,
            "arguments": prepared.arguments,
            "environment": prepared.environment,
            "working_dir": prepared.working_dir,
            "wait": wait,
            "capture_output": request.flags.capture_output,
        });
        let handler = request.handler.as_ref().filter(|_| request.flags.capture_output);
        let result = exchange(&mut stream, "spawn", params, &mut |line| {
            if let Some(handler) = handler {
                handler(line);
            }
        })?;

        let reply: SpawnReply = serde_json::from_value(result)?;
        match (wait, reply.exit_code, reply.pid) {
            (true, Some(code), _) => Ok(SpawnOutcome::Exited(code)),
            (false, _, Some(pid)) => Ok(SpawnOutcome::Running(pid)),
            _ => Err(ContainervError::internal(
                "guest agent spawn reply lacks exit code or pid",
            )),
        }
    }

    /// Waits for a guest process started without `wait`.
    ///
    /// # Errors
    ///
    /// Returns the agent's error.
    pub fn wait(&self, pid: u32) -> Result<i32> {
        let mut stream = self.connect(None)?;
        let result = exchange(&mut stream, "wait", json!({ "pid": pid }), &mut |_| {})?;
        let reply: SpawnReply = serde_json::from_value(result)?;
        reply
            .exit_code
            .ok_or_else(|| ContainervError::internal("guest agent wait reply lacks exit code"))
    }

    /// Terminates every guest process this agent started, escalating after
    /// `grace`.
    ///
    /// # Errors
    ///
    /// Returns the agent's error.
    pub fn kill_all(&self, grace: Duration) -> Result<()> {
        let grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        let _ = self.call("kill_all", json!({ "grace_ms": grace_ms }))?;
        Ok(())
    }

    /// Copies the contents of host directory `source` to `target` in the
    /// guest.
    ///
    /// # Errors
    ///
    /// Returns an I/O error while streaming, or the agent's error.
    pub fn install(&self, target: &Path, source: &Path) -> Result<()> {
        let mut stream = self.connect(Some(self.io_timeout))?;
        let request = Request {
            method: "install",
            params: json!({ "target": target }),
        };
        write_line(&mut stream, &request)?;

        let mut archive = tar::Builder::new(&mut stream);
        archive.follow_symlinks(false);
        archive
            .append_dir_all(".", source)
            .and_then(|()| archive.finish())
            .map_err(|e| ContainervError::io(source, e))?;
        drop(archive);

        let _ = read_reply(&mut stream, &mut |_| {})?;
        tracing::debug!(target = %target.display(), source = %source.display(), "layer installed in guest");
        Ok(())
    }

    fn connect(&self, read_timeout: Option<Duration>) -> Result<TcpStream> {
        let mut last_err = None;
        for attempt in 0..CONNECT_MAX_RETRIES {
            if attempt > 0 {
                std::thread::sleep(Duration::from_millis(CONNECT_RETRY_DELAY_MS));
            }
            match TcpStream::connect(self.addr) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(read_timeout)
                        .map_err(|e| ContainervError::io("guest agent", e))?;
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::debug!(attempt, addr = %self.addr, error = %e, "agent connect failed, retrying");
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) => ContainervError::io("guest agent", e),
            None => ContainervError::internal("guest agent unreachable"),
        })
    }
}

fn write_line(stream: &mut TcpStream, request: &Request<'_>) -> Result<()> {
    let mut payload = serde_json::to_string(request)?;
    payload.push('\n');
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| ContainervError::io("guest agent", e))
}

fn exchange(
    stream: &mut TcpStream,
    method: &str,
    params: Value,
    on_output: &mut dyn FnMut(OutputLine),
) -> Result<Value> {
    write_line(stream, &Request { method, params })?;
    read_reply(stream, on_output)
}

fn read_reply(stream: &mut TcpStream, on_output: &mut dyn FnMut(OutputLine)) -> Result<Value> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| ContainervError::io("guest agent", e))?;
        if read == 0 {
            return Err(ContainervError::internal(
                "guest agent closed the connection without a result",
            ));
        }
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line)? {
            Reply::Output(output) => on_output(output),
            Reply::Result(value) => return Ok(value),
            Reply::Error(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;

    use super::*;
    use crate::spawn::OutputStream;

    /// Serves `replies` (one list of lines per connection) and records the
    /// request lines it received.
    pub(crate) fn fake_agent(
        replies: Vec<Vec<String>>,
    ) -> (SocketAddr, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let mut requests = Vec::new();
            for lines in replies {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request = String::new();
                let _ = reader.read_line(&mut request).unwrap();
                requests.push(request.trim().to_string());
                let mut stream = stream;
                for line in lines {
                    stream.write_all(line.as_bytes()).unwrap();
                    stream.write_all(b"\n").unwrap();
                }
                // Drain whatever followed the request so closing does not
                // reset the connection under the client.
                stream.shutdown(std::net::Shutdown::Write).unwrap();
                let mut rest = Vec::new();
                let _ = reader.read_to_end(&mut rest);
            }
            requests
        });
        (addr, handle)
    }

    #[test]
    fn ping_and_ready() {
        let (addr, server) = fake_agent(vec![vec![r#"{"result":"pong"}"#.into()]]);
        let agent = GuestAgent::new(addr);
        agent.wait_ready(Duration::from_secs(5)).unwrap();
        let requests = server.join().unwrap();
        assert!(requests[0].contains(r#""method":"ping""#));
    }

    #[test]
    fn provision_streams_output_then_exit_code() {
        let (addr, server) = fake_agent(vec![vec![
            r#"{"output":{"stream":"stdout","line":"hello"}}"#.into(),
            r#"{"output":{"stream":"stderr","line":"warn"}}"#.into(),
            r#"{"result":{"exit_code":3}}"#.into(),
        ]]);
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let request = SpawnRequest::new("C:\\app.exe")
            .args("--fast")
            .env("MODE=ci")
            .wait()
            .capture(move |line| sink.lock().unwrap().push(line));
        let prepared = request.prepare().unwrap();

        let outcome = GuestAgent::new(addr).provision(&request, &prepared).unwrap();
        assert_eq!(outcome, SpawnOutcome::Exited(3));
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].stream, OutputStream::Stderr);

        let sent: Value = serde_json::from_str(&server.join().unwrap()[0]).unwrap();
        assert_eq!(sent["params"]["arguments"][0], "--fast");
        assert_eq!(sent["params"]["environment"][0][1], "ci");
    }

    #[test]
    fn agent_errors_keep_their_kind() {
        let (addr, server) = fake_agent(vec![vec![
            r#"{"error":{"kind":"not_found","message":"pid 9"}}"#.into(),
        ]]);
        let err = GuestAgent::new(addr).wait(9).unwrap_err();
        assert!(matches!(err, ContainervError::NotFound { .. }));
        let _ = server.join().unwrap();
    }

    #[test]
    fn closed_connection_is_internal() {
        let (addr, server) = fake_agent(vec![vec![]]);
        let err = GuestAgent::new(addr).call("list", json!({})).unwrap_err();
        assert!(matches!(err, ContainervError::Internal { .. }));
        let _ = server.join().unwrap();
    }
}
