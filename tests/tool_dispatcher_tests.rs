use anyhow::anyhow;
use chatloop::tools::{
    handler_fn, register_builtin_tools, validate_tool_definitions, ToolDispatcher,
};
use chatloop::types::{empty_object_schema, ToolCall, ToolDefinition, ToolResultState};
use serde_json::{json, Value};
use std::time::Duration;

fn dispatcher() -> ToolDispatcher {
    let dispatcher = ToolDispatcher::new(Duration::from_millis(200));
    register_builtin_tools(&dispatcher).expect("builtin tools register");
    dispatcher
}

#[tokio::test]
async fn test_results_follow_call_order_regardless_of_timing() {
    let dispatcher = dispatcher();
    dispatcher
        .register_local(
            ToolDefinition::function("sleepy", "Sleeps briefly", empty_object_schema()),
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!("awake"))
            }),
        )
        .unwrap();

    let calls = vec![
        ToolCall::new(0, "c0", "sleepy", ""),
        ToolCall::new(1, "c1", "add_numbers", r#"{"a":2,"b":3}"#),
        ToolCall::new(2, "c2", "nope", "{}"),
    ];
    let results = dispatcher.execute(&calls).await;

    assert_eq!(results.len(), calls.len());
    for (call, result) in calls.iter().zip(&results) {
        assert_eq!(result.tool_call_id, call.id);
    }
    assert_eq!(results[0].output, Some(json!("awake")));
}

#[tokio::test]
async fn test_unknown_tool_is_an_error_result() {
    let results = dispatcher()
        .execute(&[ToolCall::new(0, "c", "missing", "{}")])
        .await;
    assert_eq!(results[0].state, ToolResultState::OutputError);
    assert_eq!(results[0].error_text.as_deref(), Some("Unknown tool: missing"));
}

#[tokio::test]
async fn test_empty_arguments_parse_to_empty_object() {
    let dispatcher = dispatcher();
    dispatcher
        .register_local(
            ToolDefinition::function("echo_args", "Returns its input", empty_object_schema()),
            handler_fn(|args: Value| async move { Ok(args) }),
        )
        .unwrap();

    let results = dispatcher
        .execute(&[ToolCall::new(0, "c", "echo_args", "  ")])
        .await;
    assert_eq!(results[0].input, json!({}));
    assert_eq!(results[0].output, Some(json!({})));
}

#[tokio::test]
async fn test_handler_failure_and_timeout_stay_isolated() {
    let dispatcher = dispatcher();
    dispatcher
        .register_local(
            ToolDefinition::function("explode", "Always fails", empty_object_schema()),
            handler_fn(|_| async { Err(anyhow!("kaboom")) }),
        )
        .unwrap();
    dispatcher
        .register_local(
            ToolDefinition::function("hang", "Never returns", empty_object_schema()),
            handler_fn(|_| async {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }),
        )
        .unwrap();

    let results = dispatcher
        .execute(&[
            ToolCall::new(0, "a", "explode", "{}"),
            ToolCall::new(1, "b", "hang", "{}"),
            ToolCall::new(2, "c", "multiply_numbers", r#"{"a":4,"b":2.5}"#),
            ToolCall::new(3, "d", "divide_numbers", "{not json"),
        ])
        .await;

    assert_eq!(results[0].error_text.as_deref(), Some("kaboom"));
    assert!(results[1]
        .error_text
        .as_deref()
        .is_some_and(|text| text.contains("timed out")));
    assert_eq!(results[2].output.as_ref().unwrap()["result"], json!(10));
    assert_eq!(results[3].input, json!({"_raw": "{not json"}));
    assert!(results[3].is_error());
}

#[test]
fn test_invalid_definitions_are_refused() {
    let dispatcher = dispatcher();
    let nameless = ToolDefinition::function("", "No name", empty_object_schema());
    assert!(dispatcher
        .register_local(nameless, handler_fn(|_| async { Ok(Value::Null) }))
        .is_err());

    let not_object = ToolDefinition::function("bad", "Array schema", json!({"type": "array"}));
    assert!(validate_tool_definitions(&[not_object]).is_err());
    assert_eq!(dispatcher.definitions().len(), 3);
}
