mod common;

use common::{TestResult, Worker, expect_error, expect_success};
use serde_json::{Value, json};

#[test]
fn ping_answers_with_empty_success() -> TestResult<()> {
    let mut worker = Worker::spawn()?;
    let response = worker.round_trip(json!({"id": 1, "action": "ping"}))?;
    expect_success(&response);
    assert_eq!(response.get("id"), Some(&json!(1)));
    assert!(response.get("value").is_none());
    assert!(response.get("error").is_none());
    Ok(())
}

#[test]
fn id_is_echoed_verbatim_whatever_its_shape() -> TestResult<()> {
    let mut worker = Worker::spawn()?;
    for id in [json!("req-1"), json!(2.5), json!({"nested": [1, 2]}), json!(null)] {
        let response = worker.round_trip(json!({"id": id, "action": "ping"}))?;
        expect_success(&response);
        assert_eq!(response.get("id"), Some(&id));
    }
    Ok(())
}

#[test]
fn created_plain_session_runs_code() -> TestResult<()> {
    let mut worker = Worker::spawn()?;
    let vm_id = worker.create("plain")?;
    assert_eq!(vm_id, 1);
    let response =
        worker.round_trip(json!({"id": 2, "action": "run", "vmId": vm_id, "code": "1+1"}))?;
    expect_success(&response);
    assert_eq!(response.get("value"), Some(&json!(2)));
    Ok(())
}

#[test]
fn session_state_survives_between_runs() -> TestResult<()> {
    let mut worker = Worker::spawn()?;
    let vm_id = worker.create("plain")?;
    let response =
        worker.round_trip(json!({"id": 2, "action": "run", "vmId": vm_id, "code": "x = 20"}))?;
    expect_success(&response);
    let response =
        worker.round_trip(json!({"id": 3, "action": "run", "vmId": vm_id, "code": "x + 22"}))?;
    expect_success(&response);
    assert_eq!(response.get("value"), Some(&json!(42)));
    Ok(())
}

#[test]
fn create_may_seed_the_session_with_code() -> TestResult<()> {
    let mut worker = Worker::spawn()?;
    let response = worker.round_trip(
        json!({"id": 1, "action": "create", "type": "plain", "code": "fn triple(n) n * 3"}),
    )?;
    expect_success(&response);
    let vm_id = response.get("value").and_then(Value::as_u64).expect("handle");
    let response = worker.round_trip(
        json!({"id": 2, "action": "call", "vmId": vm_id, "functionName": "triple", "args": [14]}),
    )?;
    expect_success(&response);
    assert_eq!(response.get("value"), Some(&json!(42)));
    Ok(())
}

#[test]
fn failing_creation_code_fails_the_create() -> TestResult<()> {
    let mut worker = Worker::spawn()?;
    let response = worker.round_trip(
        json!({"id": 1, "action": "create", "type": "plain", "code": "fail(\"nope\")"}),
    )?;
    expect_error(&response, "nope");
    // The failed create consumed no handle.
    let vm_id = worker.create("plain")?;
    assert_eq!(vm_id, 1);
    Ok(())
}

#[test]
fn handles_increase_across_session_kinds() -> TestResult<()> {
    let mut worker = Worker::spawn()?;
    assert_eq!(worker.create("plain")?, 1);
    assert_eq!(worker.create("module")?, 2);
    let response = worker.round_trip(json!({"id": 3, "action": "destroy", "vmId": 1}))?;
    expect_success(&response);
    // Handle 1 is gone for good; the next session gets a fresh handle.
    assert_eq!(worker.create("plain")?, 3);
    Ok(())
}

#[test]
fn unknown_vm_type_is_rejected() -> TestResult<()> {
    let mut worker = Worker::spawn()?;
    let response = worker.round_trip(json!({"id": 1, "action": "create", "type": "NodeVM"}))?;
    expect_error(&response, "Unknown VM type: NodeVM");
    Ok(())
}

#[test]
fn unknown_handle_reports_missing_index() -> TestResult<()> {
    let mut worker = Worker::spawn()?;
    let response =
        worker.round_trip(json!({"id": 1, "action": "run", "vmId": 9999, "code": "1+1"}))?;
    expect_error(&response, "Index doesn't exist: 9999");
    Ok(())
}

#[test]
fn unknown_action_does_not_crash_the_worker() -> TestResult<()> {
    let mut worker = Worker::spawn()?;
    let vm_id = worker.create("plain")?;
    let response = worker.round_trip(json!({"id": 2, "action": "foo", "vmId": vm_id}))?;
    expect_error(&response, "Unknown action: foo");
    // Still alive and serving.
    let response = worker.round_trip(json!({"id": 3, "action": "ping"}))?;
    expect_success(&response);
    Ok(())
}

#[test]
fn destroyed_session_rejects_further_actions() -> TestResult<()> {
    let mut worker = Worker::spawn()?;
    let vm_id = worker.create("plain")?;
    let response = worker.round_trip(json!({"id": 2, "action": "destroy", "vmId": vm_id}))?;
    expect_success(&response);
    let response =
        worker.round_trip(json!({"id": 3, "action": "run", "vmId": vm_id, "code": "1+1"}))?;
    expect_error(&response, "Index doesn't exist: 1");
    let response = worker.round_trip(json!({"id": 4, "action": "destroy", "vmId": vm_id}))?;
    expect_error(&response, "Index doesn't exist: 1");
    Ok(())
}

#[test]
fn malformed_line_yields_error_response_with_null_id() -> TestResult<()> {
    let mut worker = Worker::spawn()?;
    worker.send_raw("this is not json")?;
    let message = worker.recv()?;
    assert_eq!(message.get("type").and_then(Value::as_str), Some("response"));
    assert_eq!(message.get("id"), Some(&Value::Null));
    assert_eq!(message.get("status").and_then(Value::as_str), Some("error"));
    // The bad line is not fatal.
    let response = worker.round_trip(json!({"id": 1, "action": "ping"}))?;
    expect_success(&response);
    Ok(())
}

#[test]
fn engine_errors_flow_back_as_error_responses() -> TestResult<()> {
    let mut worker = Worker::spawn()?;
    let vm_id = worker.create("plain")?;
    let response = worker
        .round_trip(json!({"id": 2, "action": "run", "vmId": vm_id, "code": "fail(\"boom\")"}))?;
    expect_error(&response, "boom");
    let response =
        worker.round_trip(json!({"id": 3, "action": "run", "vmId": vm_id, "code": "nope"}))?;
    expect_error(&response, "nope is not defined");
    Ok(())
}
