use serde_json::Value;

use crate::engine::{
    ConsoleMode, ConsoleSink, Engine, EngineError, EngineFactory, EngineObject, ModuleEngine,
    Outcome,
};
use crate::protocol::Command;
use crate::registry::{NotFound, Registry};

/// Anything that can go wrong between parsing a command and obtaining its
/// raw result. Converted to an error response at the dispatch boundary;
/// never fatal.
#[derive(Debug)]
pub enum DispatchError {
    Parse(String),
    UnknownType(String),
    UnknownAction(String),
    NotFound(u64),
    Engine(EngineError),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Parse(message) => f.write_str(message),
            DispatchError::UnknownType(kind) => write!(f, "Unknown VM type: {kind}"),
            DispatchError::UnknownAction(action) => write!(f, "Unknown action: {action}"),
            DispatchError::NotFound(handle) => write!(f, "Index doesn't exist: {handle}"),
            DispatchError::Engine(err) => f.write_str(err.message()),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<NotFound> for DispatchError {
    fn from(err: NotFound) -> Self {
        DispatchError::NotFound(err.0)
    }
}

impl From<EngineError> for DispatchError {
    fn from(err: EngineError) -> Self {
        DispatchError::Engine(err)
    }
}

pub(crate) fn require_str<'a>(
    field: &'a Option<String>,
    name: &str,
) -> Result<&'a str, DispatchError> {
    field
        .as_deref()
        .ok_or_else(|| DispatchError::Parse(format!("missing field `{name}`")))
}

pub(crate) fn require_handle(field: &Option<u64>, name: &str) -> Result<u64, DispatchError> {
    field.ok_or_else(|| DispatchError::Parse(format!("missing field `{name}`")))
}

/// One live sandbox instance, addressed by its handle in the session
/// registry. The two variants expose disjoint action sets.
pub enum Session {
    Plain(PlainSession),
    Module(ModuleSession),
}

impl Session {
    /// Resolves a session-level action by name. Raw results may be
    /// deferred; this never waits.
    pub fn dispatch(&mut self, command: &Command) -> Result<Option<Outcome>, DispatchError> {
        match self {
            Session::Plain(session) => session.dispatch(command),
            Session::Module(session) => session.dispatch(command),
        }
    }
}

pub struct PlainSession {
    engine: Box<dyn Engine>,
}

impl PlainSession {
    /// Builds the engine and, when the create command carried code, runs it
    /// once with the result discarded. A failure here is a creation
    /// failure: no handle is ever registered.
    pub fn create(
        factory: &dyn EngineFactory,
        options: Option<&Value>,
        initial_code: Option<&str>,
    ) -> Result<Self, DispatchError> {
        let mut engine = factory.create_plain(options)?;
        if let Some(code) = initial_code {
            engine.run(code)?;
        }
        Ok(Self { engine })
    }

    fn dispatch(&mut self, command: &Command) -> Result<Option<Outcome>, DispatchError> {
        match command.action.as_str() {
            "run" => {
                let code = require_str(&command.code, "code")?;
                Ok(Some(self.engine.run(code)?))
            }
            "call" => {
                let function_name = require_str(&command.function_name, "functionName")?;
                let args = command.args.as_deref().unwrap_or(&[]);
                Ok(Some(self.engine.call(function_name, args)?))
            }
            action => Err(DispatchError::UnknownAction(action.to_string())),
        }
    }
}

pub struct ModuleSession {
    engine: Box<dyn ModuleEngine>,
    modules: Registry<Box<dyn EngineObject>>,
    console: ConsoleMode,
}

impl ModuleSession {
    pub fn create(
        factory: &dyn EngineFactory,
        options: Option<&Value>,
    ) -> Result<Self, DispatchError> {
        let console = ConsoleMode::from_options(options);
        let engine = factory.create_module(options, console)?;
        Ok(Self {
            engine,
            modules: Registry::new(),
            console,
        })
    }

    pub fn routes_console(&self) -> bool {
        self.console.routes_console()
    }

    pub fn subscribe_console(&mut self, sink: ConsoleSink) {
        self.engine.subscribe_console(sink);
    }

    fn dispatch(&mut self, command: &Command) -> Result<Option<Outcome>, DispatchError> {
        match command.action.as_str() {
            "run" => {
                let code = require_str(&command.code, "code")?;
                let module = self.engine.load(code, command.filename.as_deref())?;
                let handle = self.modules.add(module);
                Ok(Some(Outcome::Value(handle.into())))
            }
            "get" => {
                let module = self.module(command)?;
                Ok(Some(Outcome::Value(module.value()?)))
            }
            "call" => {
                let args = command.args.clone().unwrap_or_default();
                let module = self.module(command)?;
                Ok(Some(module.invoke(&args)?))
            }
            "getMember" => {
                let member = require_str(&command.member, "member")?.to_string();
                let module = self.module(command)?;
                Ok(Some(module.member(&member)?))
            }
            "callMember" => {
                let member = require_str(&command.member, "member")?.to_string();
                let args = command.args.clone().unwrap_or_default();
                let module = self.module(command)?;
                Ok(Some(module.invoke_member(&member, &args)?))
            }
            "destroyModule" => {
                let module_id = require_handle(&command.module_id, "moduleId")?;
                self.modules.remove(module_id)?;
                Ok(None)
            }
            action => Err(DispatchError::UnknownAction(action.to_string())),
        }
    }

    fn module(&self, command: &Command) -> Result<&dyn EngineObject, DispatchError> {
        let module_id = require_handle(&command.module_id, "moduleId")?;
        Ok(self.modules.get(module_id)?.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command(payload: Value) -> Command {
        serde_json::from_value(payload).expect("test command")
    }

    struct NullEngine;

    impl Engine for NullEngine {
        fn run(&mut self, _code: &str) -> Result<Outcome, EngineError> {
            Ok(Outcome::Value(Value::Null))
        }

        fn call(&mut self, _function_name: &str, args: &[Value]) -> Result<Outcome, EngineError> {
            Ok(Outcome::Value(json!(args.len())))
        }
    }

    fn plain_session() -> PlainSession {
        PlainSession {
            engine: Box::new(NullEngine),
        }
    }

    #[test]
    fn plain_session_rejects_unknown_actions() {
        let mut session = plain_session();
        let err = session
            .dispatch(&command(json!({"id": 1, "action": "foo"})))
            .expect_err("unknown action");
        assert_eq!(err.to_string(), "Unknown action: foo");
    }

    #[test]
    fn plain_run_requires_code() {
        let mut session = plain_session();
        let err = session
            .dispatch(&command(json!({"id": 1, "action": "run"})))
            .expect_err("missing code");
        assert_eq!(err.to_string(), "missing field `code`");
    }

    #[test]
    fn plain_call_defaults_args_to_empty() {
        let mut session = plain_session();
        let result = session
            .dispatch(&command(json!({"id": 1, "action": "call", "functionName": "f"})))
            .expect("call dispatch");
        match result {
            Some(Outcome::Value(value)) => assert_eq!(value, json!(0)),
            _ => panic!("expected immediate value"),
        }
    }

    #[test]
    fn dispatch_error_messages_are_wire_compatible() {
        assert_eq!(
            DispatchError::UnknownType("X".to_string()).to_string(),
            "Unknown VM type: X"
        );
        assert_eq!(DispatchError::NotFound(9999).to_string(), "Index doesn't exist: 9999");
        assert_eq!(
            DispatchError::Engine(EngineError::new("boom")).to_string(),
            "boom"
        );
    }
}
