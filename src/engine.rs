use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;

/// Failure raised inside a sandbox engine. The message travels to the
/// remote caller unchanged, so it carries no prefix.
#[derive(Debug, Clone)]
pub struct EngineError {
    message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for EngineError {}

/// Completion channel for a result the engine produces later. Resolved
/// exactly once; dropping the sender without resolving is a contract
/// breach surfaced to the caller as an error response.
pub type DeferredOutcome = oneshot::Receiver<Result<Value, EngineError>>;

/// Raw result of an engine operation: available now, or pending.
pub enum Outcome {
    Value(Value),
    Deferred(DeferredOutcome),
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Outcome::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleChannel {
    Output,
    ErrorOutput,
}

/// Console interception hook handed to a module-capable engine. Cheap to
/// clone; safe to invoke from engine-internal threads.
#[derive(Clone)]
pub struct ConsoleSink {
    inner: Arc<dyn Fn(ConsoleChannel, &[String]) + Send + Sync>,
}

impl ConsoleSink {
    pub fn new(hook: impl Fn(ConsoleChannel, &[String]) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(hook),
        }
    }

    pub fn emit(&self, channel: ConsoleChannel, args: &[String]) {
        (self.inner)(channel, args);
    }
}

/// Console routing requested at session creation. Anything other than
/// `off` makes the engine route console calls through a [`ConsoleSink`]
/// instead of the real console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsoleMode {
    #[default]
    Inherit,
    Redirect,
    Off,
}

impl ConsoleMode {
    pub fn from_options(options: Option<&Value>) -> Self {
        match options
            .and_then(|options| options.get("console"))
            .and_then(Value::as_str)
        {
            Some("off") => ConsoleMode::Off,
            Some("redirect") => ConsoleMode::Redirect,
            _ => ConsoleMode::Inherit,
        }
    }

    pub fn routes_console(self) -> bool {
        self != ConsoleMode::Off
    }
}

/// Plain sandbox engine: evaluate source text, or resolve an expression to
/// a callable and invoke it.
pub trait Engine {
    fn run(&mut self, code: &str) -> Result<Outcome, EngineError>;
    fn call(&mut self, function_name: &str, args: &[Value]) -> Result<Outcome, EngineError>;
}

/// An opaque value produced inside a module-capable engine. Addressed
/// remotely through a handle; never serialized as a native reference.
pub trait EngineObject {
    fn value(&self) -> Result<Value, EngineError>;
    fn invoke(&self, args: &[Value]) -> Result<Outcome, EngineError>;
    fn member(&self, name: &str) -> Result<Outcome, EngineError>;
    fn invoke_member(&self, name: &str, args: &[Value]) -> Result<Outcome, EngineError>;
}

/// Module-capable sandbox engine: loads source text as a named module and
/// reports console activity through a subscribed sink.
pub trait ModuleEngine {
    fn load(
        &mut self,
        code: &str,
        filename: Option<&str>,
    ) -> Result<Box<dyn EngineObject>, EngineError>;
    fn subscribe_console(&mut self, sink: ConsoleSink);
}

/// Constructs engine instances for session creation. The options bag is
/// opaque JSON; this layer inspects only the console mode.
pub trait EngineFactory {
    fn create_plain(&self, options: Option<&Value>) -> Result<Box<dyn Engine>, EngineError>;
    fn create_module(
        &self,
        options: Option<&Value>,
        console: ConsoleMode,
    ) -> Result<Box<dyn ModuleEngine>, EngineError>;
}
