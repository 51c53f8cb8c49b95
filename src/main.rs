mod diagnostics;
mod engine;
mod event_log;
mod expr_engine;
mod protocol;
mod registry;
mod server;
mod session;

use std::path::PathBuf;

use crate::engine::EngineFactory;
use crate::expr_engine::ExprFactory;

struct CliOptions {
    engine: EngineKind,
    debug_events_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineKind {
    Expr,
}

impl EngineKind {
    fn parse(value: &str) -> Result<Self, String> {
        match value {
            "expr" => Ok(Self::Expr),
            _ => Err(format!("invalid engine: {value} (expected expr)")),
        }
    }

    fn name(self) -> &'static str {
        match self {
            EngineKind::Expr => "expr",
        }
    }

    fn factory(self) -> Box<dyn EngineFactory> {
        match self {
            EngineKind::Expr => Box::new(ExprFactory),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(target_family = "unix")]
    // Stdout is the wire. If the parent closes its read end, a write would
    // raise SIGPIPE and kill the process on Unix; ignore it so the failure
    // surfaces as a broken-pipe error on the transport path instead.
    ignore_sigpipe();
    diagnostics::startup_log("main: entry");

    let options = parse_cli_args()?;
    event_log::initialize(
        options.debug_events_dir,
        event_log::StartupContext {
            engine: options.engine.name().to_string(),
        },
    )?;
    diagnostics::startup_log("main: serving stdio");
    server::run(options.engine.factory())
}

#[cfg(target_family = "unix")]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn parse_cli_args() -> Result<CliOptions, Box<dyn std::error::Error>> {
    let mut parser = ArgParser::new();
    let mut engine = EngineKind::Expr;
    let mut debug_events_dir = None;
    while let Some(arg) = parser.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "--engine" => {
                let value = parser.next_value("--engine")?;
                engine = EngineKind::parse(&value).map_err(|err| err.to_string())?;
            }
            _ if arg.starts_with("--engine=") => {
                let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
                if value.is_empty() {
                    return Err("missing value for --engine".into());
                }
                engine = EngineKind::parse(value).map_err(|err| err.to_string())?;
            }
            "--debug-events-dir" => {
                let value = parser.next_value("--debug-events-dir")?;
                if value.trim().is_empty() {
                    return Err("missing value for --debug-events-dir".into());
                }
                debug_events_dir = Some(PathBuf::from(value));
            }
            _ if arg.starts_with("--debug-events-dir=") => {
                let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
                if value.trim().is_empty() {
                    return Err("missing value for --debug-events-dir".into());
                }
                debug_events_dir = Some(PathBuf::from(value));
            }
            _ => return Err(format!("unknown argument: {arg}").into()),
        }
    }

    Ok(CliOptions {
        engine,
        debug_events_dir,
    })
}

struct ArgParser {
    args: Vec<String>,
    index: usize,
}

impl ArgParser {
    fn new() -> Self {
        Self {
            args: std::env::args().skip(1).collect(),
            index: 0,
        }
    }

    fn next(&mut self) -> Option<String> {
        let value = self.args.get(self.index)?.clone();
        self.index += 1;
        Some(value)
    }

    fn next_value(&mut self, flag: &str) -> Result<String, Box<dyn std::error::Error>> {
        self.next()
            .ok_or_else(|| format!("missing value for {flag}").into())
    }
}

fn print_usage() {
    println!(
        "Usage:\n\
vm-console [--engine <expr>] [--debug-events-dir <dir>]\n\n\
Reads one JSON command per line on stdin and writes one JSON response or\n\
event per line on stdout. Stops on `close` or end of input.\n\n\
--engine: sandbox engine backing created sessions (default: expr)\n\
--debug-events-dir: optional directory for per-startup JSONL debug event logs (env: VM_CONSOLE_DEBUG_EVENTS_DIR)"
    );
}
