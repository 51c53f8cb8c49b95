use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event name used for every forwarded console call. The error-output
/// channel reuses the same name; remote clients key on it.
pub const CONSOLE_EVENT_NAME: &str = "console.log";

/// One inbound command line. `id` is caller-assigned and echoed back
/// verbatim; it is never interpreted. All other fields are optional at the
/// schema level and validated per action at dispatch time.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: Value,
    pub action: String,
    #[serde(default)]
    pub vm_id: Option<u64>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub options: Option<Value>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub function_name: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<Value>>,
    #[serde(default)]
    pub module_id: Option<u64>,
    #[serde(default)]
    pub member: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// One outbound line: either a response correlated to a command `id`, or an
/// unsolicited event tagged with the emitting session's handle.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Response {
        id: Value,
        status: Status,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Event {
        vm_id: u64,
        name: String,
        value: String,
    },
}

impl Outbound {
    pub fn success(id: Value, value: Option<Value>) -> Self {
        Outbound::Response {
            id,
            status: Status::Success,
            value,
            error: None,
        }
    }

    pub fn failure(id: Value, error: impl Into<String>) -> Self {
        Outbound::Response {
            id,
            status: Status::Error,
            value: None,
            error: Some(error.into()),
        }
    }

    pub fn console_event(vm_id: u64, args: &[String]) -> Self {
        Outbound::Event {
            vm_id,
            name: CONSOLE_EVENT_NAME.to_string(),
            value: args.join(" "),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_accepts_camel_case_fields() {
        let command: Command = serde_json::from_str(
            r#"{"id": 7, "action": "callMember", "vmId": 2, "moduleId": 3, "member": "greet", "args": ["hi"]}"#,
        )
        .expect("parse command");
        assert_eq!(command.id, json!(7));
        assert_eq!(command.action, "callMember");
        assert_eq!(command.vm_id, Some(2));
        assert_eq!(command.module_id, Some(3));
        assert_eq!(command.member.as_deref(), Some("greet"));
        assert_eq!(command.args, Some(vec![json!("hi")]));
    }

    #[test]
    fn command_requires_id_and_action() {
        assert!(serde_json::from_str::<Command>(r#"{"action": "ping"}"#).is_err());
        assert!(serde_json::from_str::<Command>(r#"{"id": 1}"#).is_err());
    }

    #[test]
    fn command_id_may_be_any_json_value() {
        let command: Command =
            serde_json::from_str(r#"{"id": "req-42", "action": "ping"}"#).expect("parse command");
        assert_eq!(command.id, json!("req-42"));
    }

    #[test]
    fn success_response_serializes_without_error_field() {
        let line = serde_json::to_value(Outbound::success(json!(1), Some(json!(2)))).expect("json");
        assert_eq!(
            line,
            json!({"type": "response", "id": 1, "status": "success", "value": 2})
        );
    }

    #[test]
    fn error_response_serializes_without_value_field() {
        let line = serde_json::to_value(Outbound::failure(json!("a"), "boom")).expect("json");
        assert_eq!(
            line,
            json!({"type": "response", "id": "a", "status": "error", "error": "boom"})
        );
    }

    #[test]
    fn console_event_joins_arguments_with_spaces() {
        let line = serde_json::to_value(Outbound::console_event(
            4,
            &["hello".to_string(), "world".to_string()],
        ))
        .expect("json");
        assert_eq!(
            line,
            json!({"type": "event", "vmId": 4, "name": "console.log", "value": "hello world"})
        );
    }
}
