use std::io::{BufRead, Write};
use std::sync::mpsc;
use std::thread;

use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::{self, JoinHandle};

use crate::engine::{ConsoleSink, EngineFactory, Outcome};
use crate::event_log;
use crate::protocol::{Command, Outbound};
use crate::registry::Registry;
use crate::session::{DispatchError, ModuleSession, PlainSession, Session, require_handle};

/// The output channel is gone: the writer thread stopped after a stream
/// write failure. Transport-fatal.
#[derive(Debug)]
pub struct OutputClosed;

impl std::fmt::Display for OutputClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("output stream closed")
    }
}

impl std::error::Error for OutputClosed {}

/// Runs the worker until `close` or stdin EOF on a current-thread runtime.
/// Deferred correlations are local tasks on the same thread, so session
/// state needs no locking.
pub fn run(factory: Box<dyn EngineFactory>) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread().build()?;
    let local = task::LocalSet::new();
    local.block_on(&runtime, serve(factory))
}

/// Reads stdin on a dedicated thread so the serve loop can await lines
/// without tying runtime shutdown to an uncancellable blocking read. EOF
/// closes the channel.
fn spawn_stdin_reader() -> std::io::Result<UnboundedReceiver<std::io::Result<String>>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            let mut reader = std::io::BufReader::new(stdin.lock());
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        let trimmed = line.trim_end_matches(['\n', '\r']).to_string();
                        if tx.send(Ok(trimmed)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

async fn serve(factory: Box<dyn EngineFactory>) -> Result<(), Box<dyn std::error::Error>> {
    let (out_tx, out_rx) = mpsc::channel();
    let writer = spawn_writer(out_rx, std::io::stdout())?;
    let mut server = Server::new(factory, out_tx);
    let mut pending: Vec<JoinHandle<()>> = Vec::new();

    event_log::log("serve_begin", json!({}));
    let mut lines = spawn_stdin_reader()?;
    let result = loop {
        let line = match lines.recv().await {
            Some(Ok(line)) => line,
            Some(Err(err)) => break Err(err),
            None => break Ok(()),
        };
        if line.trim().is_empty() {
            continue;
        }
        match server.dispatch_line(&line) {
            Ok(Some(handle)) => pending.push(handle),
            Ok(None) => {}
            Err(OutputClosed) => {
                break Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    OutputClosed.to_string(),
                ));
            }
        }
        pending.retain(|handle| !handle.is_finished());
        if server.closing {
            break Ok(());
        }
    };

    // Already-dispatched commands still get their responses; a deferred
    // computation that never resolves stalls shutdown here.
    for handle in pending {
        let _ = handle.await;
    }
    drop(server);

    match result {
        Ok(()) => {
            let _ = writer.join();
            event_log::log("serve_end", json!({"status": "ok"}));
            Ok(())
        }
        Err(err) => {
            event_log::log(
                "serve_end",
                json!({"status": "error", "error": err.to_string()}),
            );
            Err(err.into())
        }
    }
}

fn spawn_writer<W>(
    rx: mpsc::Receiver<Outbound>,
    mut writer: W,
) -> std::io::Result<thread::JoinHandle<()>>
where
    W: Write + Send + 'static,
{
    thread::Builder::new()
        .name("output-writer".to_string())
        .spawn(move || {
            for message in rx {
                let payload = match serde_json::to_string(&message) {
                    Ok(payload) => payload,
                    Err(err) => {
                        eprintln!("outbound serialize error: {err}");
                        continue;
                    }
                };
                if writer.write_all(payload.as_bytes()).is_err() {
                    break;
                }
                if writer.write_all(b"\n").is_err() {
                    break;
                }
                if writer.flush().is_err() {
                    break;
                }
            }
        })
}

struct Server {
    sessions: Registry<Session>,
    factory: Box<dyn EngineFactory>,
    out: mpsc::Sender<Outbound>,
    closing: bool,
}

impl Server {
    fn new(factory: Box<dyn EngineFactory>, out: mpsc::Sender<Outbound>) -> Self {
        Self {
            sessions: Registry::new(),
            factory,
            out,
            closing: false,
        }
    }

    /// Parses one input line and dispatches it fully. Returns the handle of
    /// the spawned correlation task when the raw result was deferred.
    fn dispatch_line(&mut self, line: &str) -> Result<Option<JoinHandle<()>>, OutputClosed> {
        let command: Command = match serde_json::from_str(line) {
            Ok(command) => command,
            Err(err) => {
                event_log::log_lazy("parse_error", || json!({"error": err.to_string()}));
                self.send(Outbound::failure(Value::Null, err.to_string()))?;
                return Ok(None);
            }
        };
        event_log::log_lazy("command_received", || {
            json!({"action": command.action.clone(), "id": command.id.clone()})
        });
        let id = command.id.clone();
        let result = self.process(&command);
        self.correlate(id, result)
    }

    fn process(&mut self, command: &Command) -> Result<Option<Outcome>, DispatchError> {
        match command.action.as_str() {
            "ping" => Ok(None),
            "close" => {
                self.closing = true;
                event_log::log("close_requested", json!({}));
                Ok(None)
            }
            "create" => self.create(command),
            "destroy" => {
                let vm_id = require_handle(&command.vm_id, "vmId")?;
                self.sessions.remove(vm_id)?;
                event_log::log_lazy("session_destroyed", || json!({"vm_id": vm_id}));
                Ok(None)
            }
            _ => {
                let vm_id = require_handle(&command.vm_id, "vmId")?;
                let session = self.sessions.get_mut(vm_id)?;
                session.dispatch(command)
            }
        }
    }

    fn create(&mut self, command: &Command) -> Result<Option<Outcome>, DispatchError> {
        let kind = command
            .kind
            .as_deref()
            .ok_or_else(|| DispatchError::Parse("missing field `type`".to_string()))?;
        let handle = match kind {
            "plain" => {
                let session = PlainSession::create(
                    self.factory.as_ref(),
                    command.options.as_ref(),
                    command.code.as_deref(),
                )?;
                self.sessions.add(Session::Plain(session))
            }
            "module" => {
                let session =
                    ModuleSession::create(self.factory.as_ref(), command.options.as_ref())?;
                let routes = session.routes_console();
                let handle = self.sessions.add(Session::Module(session));
                if routes {
                    let sink = self.console_sink(handle);
                    if let Ok(Session::Module(session)) = self.sessions.get_mut(handle) {
                        session.subscribe_console(sink);
                    }
                }
                handle
            }
            other => return Err(DispatchError::UnknownType(other.to_string())),
        };
        event_log::log_lazy("session_created", || json!({"vm_id": handle, "kind": kind}));
        Ok(Some(Outcome::Value(handle.into())))
    }

    /// Forwarder hook for one session: every intercepted console call, on
    /// either channel, becomes an event line queued immediately. The
    /// error-output channel keeps the `console.log` name on the wire.
    fn console_sink(&self, vm_id: u64) -> ConsoleSink {
        let out = self.out.clone();
        ConsoleSink::new(move |_channel, args| {
            let _ = out.send(Outbound::console_event(vm_id, args));
        })
    }

    /// Guarantees exactly one response per command. Immediate results and
    /// dispatch errors are emitted now; a deferred result hands its
    /// response shell to a local task that finishes it on completion.
    fn correlate(
        &self,
        id: Value,
        result: Result<Option<Outcome>, DispatchError>,
    ) -> Result<Option<JoinHandle<()>>, OutputClosed> {
        match result {
            Err(err) => {
                self.send(Outbound::failure(id, err.to_string()))?;
                Ok(None)
            }
            Ok(None) => {
                self.send(Outbound::success(id, None))?;
                Ok(None)
            }
            Ok(Some(Outcome::Value(value))) => {
                self.send(Outbound::success(id, Some(value)))?;
                Ok(None)
            }
            Ok(Some(Outcome::Deferred(receiver))) => {
                let out = self.out.clone();
                Ok(Some(task::spawn_local(async move {
                    let message = match receiver.await {
                        Ok(Ok(value)) => Outbound::success(id, Some(value)),
                        Ok(Err(err)) => Outbound::failure(id, err.message().to_string()),
                        Err(_) => {
                            Outbound::failure(id, "deferred result dropped without resolving")
                        }
                    };
                    let _ = out.send(message);
                })))
            }
        }
    }

    fn send(&self, message: Outbound) -> Result<(), OutputClosed> {
        self.out.send(message).map_err(|_| OutputClosed)
    }
}
