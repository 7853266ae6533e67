//! Functions a JSON module can export by name.

use std::time::Duration;

use modulik_core::bridge::Arg;
use modulik_core::worker::{CallArgs, Function, RemoteCallback};
use serde_json::{Value, json};

/// Prefix marking a string export as a built-in function.
pub const FUNCTION_PREFIX: &str = "fn:";

/// The built-in named by a `fn:<name>` export.
pub fn lookup(name: &str) -> Option<Function> {
    let function = match name {
        "join" => {
            Function::new(|args: CallArgs| async move { Ok::<_, String>(join(&args, false)) })
        }
        "join_reversed" => {
            Function::new(|args: CallArgs| async move { Ok::<_, String>(join(&args, true)) })
        }
        "sum" => Function::new(|args: CallArgs| async move { sum(&args) }),
        "echo" => Function::new(|args: CallArgs| async move {
            let values: Vec<Value> = args
                .iter()
                .map(|arg| arg.as_value().cloned().unwrap_or(Value::Null))
                .collect();
            Ok::<_, String>(values)
        }),
        "fail" => Function::new(|args: CallArgs| async move {
            let message = args
                .value(0)
                .and_then(Value::as_str)
                .unwrap_or("Function failed")
                .to_string();
            Err::<Value, _>(message)
        }),
        "delay" => Function::new(|args: CallArgs| async move {
            let millis = args.value(0).and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok::<_, String>(args.value(1).cloned().unwrap_or(Value::Null))
        }),
        "invoke_callback" => Function::new(|args: CallArgs| async move {
            let callback = args
                .callback(0)
                .cloned()
                .ok_or_else(|| "First argument must be a callback".to_string())?;
            let rest: Vec<Value> = args
                .iter()
                .skip(1)
                .filter_map(|arg| arg.as_value().cloned())
                .collect();
            callback.call(rest).await.map_err(|e| e.to_string())
        }),
        "invoke_callbacks" => Function::new(|args: CallArgs| async move {
            let callbacks: Vec<RemoteCallback> =
                args.iter().flat_map(Arg::callbacks).cloned().collect();
            let mut results = Vec::with_capacity(callbacks.len());
            for (position, callback) in callbacks.iter().enumerate() {
                let result = callback.call(vec![json!(position)]).await;
                results.push(result.map_err(|e| e.to_string())?);
            }
            Ok::<_, String>(results)
        }),
        "nan" => Function::new(|_: CallArgs| async move { Ok::<_, String>(f64::NAN) }),
        "crash" => Function::new(|args: CallArgs| async move {
            crash(exit_code(args.value(0)))
        }),
        _ => return None,
    };
    Some(function)
}

/// Exit the worker abruptly, as a broken module would.
fn crash(code: i32) -> Result<Value, String> {
    std::process::exit(code)
}

/// Exit code requested by a `crash` call; 1 when missing or out of range.
fn exit_code(value: Option<&Value>) -> i32 {
    value
        .and_then(Value::as_i64)
        .and_then(|code| i32::try_from(code).ok())
        .unwrap_or(1)
}

fn join(args: &CallArgs, reversed: bool) -> String {
    let mut parts: Vec<String> = args
        .iter()
        .filter_map(|arg| arg.as_value())
        .map(|value| match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .collect();
    if reversed {
        parts.reverse();
    }
    parts.join(" ")
}

fn sum(args: &CallArgs) -> Result<Value, String> {
    let values: Vec<&Value> = args.iter().filter_map(|arg| arg.as_value()).collect();
    if values.iter().all(|value| value.is_i64()) {
        return Ok(json!(values.iter().filter_map(|value| value.as_i64()).sum::<i64>()));
    }

    let mut total = 0.0;
    for value in values {
        total += value
            .as_f64()
            .ok_or_else(|| format!("Cannot add {}", value))?;
    }
    Ok(json!(total))
}
