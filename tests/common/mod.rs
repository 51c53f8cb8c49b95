#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);
const EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// One spawned worker process, driven over its stdio like a parent would.
/// Stdout is drained by a reader thread so receive timeouts never hang a
/// test on a silent worker.
pub struct Worker {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: mpsc::Receiver<String>,
}

impl Worker {
    pub fn spawn() -> TestResult<Self> {
        let mut child = Command::new(env!("CARGO_BIN_EXE_vm-console"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;
        let stdin = child.stdin.take().ok_or("missing worker stdin")?;
        let stdout = child.stdout.take().ok_or("missing worker stdout")?;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Ok(Self {
            child,
            stdin: Some(stdin),
            lines: rx,
        })
    }

    pub fn send(&mut self, command: Value) -> TestResult<()> {
        self.send_raw(&command.to_string())
    }

    pub fn send_raw(&mut self, line: &str) -> TestResult<()> {
        let stdin = self.stdin.as_mut().ok_or("worker stdin already closed")?;
        writeln!(stdin, "{line}")?;
        stdin.flush()?;
        Ok(())
    }

    pub fn recv(&mut self) -> TestResult<Value> {
        let line = self
            .lines
            .recv_timeout(RECV_TIMEOUT)
            .map_err(|err| format!("timed out waiting for worker output: {err}"))?;
        Ok(serde_json::from_str(&line)?)
    }

    /// Reads until the response correlated to `id`, collecting any events
    /// seen on the way.
    pub fn recv_response(&mut self, id: Value) -> TestResult<(Value, Vec<Value>)> {
        let mut events = Vec::new();
        loop {
            let message = self.recv()?;
            match message.get("type").and_then(Value::as_str) {
                Some("response") => {
                    if message.get("id") == Some(&id) {
                        return Ok((message, events));
                    }
                    return Err(format!("response for unexpected id: {message}").into());
                }
                _ => events.push(message),
            }
        }
    }

    /// Sends a command and returns its response, failing on interleaved
    /// events (use `recv_response` directly when events are expected).
    pub fn round_trip(&mut self, command: Value) -> TestResult<Value> {
        let id = command.get("id").cloned().ok_or("command without id")?;
        self.send(command)?;
        let (response, events) = self.recv_response(id)?;
        if !events.is_empty() {
            return Err(format!("unexpected events before response: {events:?}").into());
        }
        Ok(response)
    }

    /// Creates a session of the given kind and returns its handle.
    pub fn create(&mut self, kind: &str) -> TestResult<u64> {
        let response = self.round_trip(json!({"id": "create", "action": "create", "type": kind}))?;
        expect_success(&response);
        response
            .get("value")
            .and_then(Value::as_u64)
            .ok_or_else(|| format!("create response without handle: {response}").into())
    }

    /// Closes the worker's stdin; the read loop sees EOF.
    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    pub fn wait_for_exit(&mut self) -> TestResult<std::process::ExitStatus> {
        let deadline = Instant::now() + EXIT_TIMEOUT;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err("worker did not exit in time".into());
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn expect_success(response: &Value) {
    assert_eq!(
        response.get("status").and_then(Value::as_str),
        Some("success"),
        "expected success response: {response}"
    );
}

pub fn expect_error(response: &Value, message: &str) {
    assert_eq!(
        response.get("status").and_then(Value::as_str),
        Some("error"),
        "expected error response: {response}"
    );
    assert_eq!(
        response.get("error").and_then(Value::as_str),
        Some(message),
        "unexpected error message: {response}"
    );
}
