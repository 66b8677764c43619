use super::{handler_fn, ToolDispatcher};
use crate::types::ToolDefinition;
use anyhow::{Context, Result};
use serde_json::{json, Value};

fn two_number_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "a": { "type": "number", "description": "The first number" },
            "b": { "type": "number", "description": "The second number" }
        },
        "required": ["a", "b"]
    })
}

fn operands(args: &Value) -> Result<(f64, f64)> {
    let a = args
        .get("a")
        .and_then(Value::as_f64)
        .context("argument 'a' must be a number")?;
    let b = args
        .get("b")
        .and_then(Value::as_f64)
        .context("argument 'b' must be a number")?;
    Ok((a, b))
}

/// Integral results stay integers on the wire (`5`, not `5.0`).
fn number(value: f64) -> Value {
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    if value.fract() == 0.0 && value.abs() <= MAX_EXACT {
        json!(value as i64)
    } else {
        json!(value)
    }
}

fn add_numbers(args: &Value) -> Result<Value> {
    let (a, b) = operands(args)?;
    let result = a + b;
    Ok(json!({
        "operation": "addition",
        "a": number(a),
        "b": number(b),
        "result": number(result),
        "message": format!("The sum of {a} and {b} is {result}"),
    }))
}

fn multiply_numbers(args: &Value) -> Result<Value> {
    let (a, b) = operands(args)?;
    Ok(json!({
        "operation": "multiplication",
        "a": number(a),
        "b": number(b),
        "result": number(a * b),
    }))
}

fn divide_numbers(args: &Value) -> Result<Value> {
    let (a, b) = operands(args)?;
    if b == 0.0 {
        return Ok(json!({
            "operation": "division",
            "a": number(a),
            "b": number(b),
            "error": "Division by zero is not allowed",
            "result": null,
        }));
    }
    Ok(json!({
        "operation": "division",
        "a": number(a),
        "b": number(b),
        "result": number(a / b),
    }))
}

type Operation = fn(&Value) -> Result<Value>;

const BUILTINS: [(&str, &str, Operation); 3] = [
    (
        "add_numbers",
        "Add two numbers together and return the result",
        add_numbers,
    ),
    (
        "multiply_numbers",
        "Multiply two numbers together",
        multiply_numbers,
    ),
    (
        "divide_numbers",
        "Divide first number by second number",
        divide_numbers,
    ),
];

pub fn builtin_definitions() -> Vec<ToolDefinition> {
    BUILTINS
        .iter()
        .map(|(name, description, _)| ToolDefinition::function(*name, *description, two_number_schema()))
        .collect()
}

/// Install the arithmetic tools as local handlers.
pub fn register_builtin_tools(dispatcher: &ToolDispatcher) -> Result<()> {
    for (definition, (_, _, op)) in builtin_definitions().into_iter().zip(BUILTINS) {
        dispatcher.register_local(definition, handler_fn(move |args: Value| async move { op(&args) }))?;
    }
    Ok(())
}
