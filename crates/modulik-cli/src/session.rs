//! Line-oriented session driving a module from stdin.
//!
//! Each input line is one of:
//! - `[1, 2]` calls the default function with the array as arguments
//! - `{"function": "sum", "args": [1, 2]}` calls a named export
//! - `module` prints the current export surface
//! - `restart` or `kill`
//!
//! Every command prints exactly one JSON line to stdout.

use modulik_core::bridge::DEFAULT_FUNCTION_ID;
use modulik_core::{Arg, Module, ModuleError, ModuleHandle};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Deserialize)]
struct CallRequest {
    #[serde(default = "default_function")]
    function: String,
    #[serde(default)]
    args: Vec<Value>,
}

fn default_function() -> String {
    DEFAULT_FUNCTION_ID.to_string()
}

#[derive(Debug, PartialEq)]
enum Command {
    Call { function: String, args: Vec<Value> },
    Module,
    Restart,
    Kill,
}

fn parse(line: &str) -> anyhow::Result<Option<Command>> {
    let line = line.trim();
    let command = match line {
        "" => return Ok(None),
        "module" => Command::Module,
        "restart" => Command::Restart,
        "kill" => Command::Kill,
        _ if line.starts_with('[') => Command::Call {
            function: default_function(),
            args: serde_json::from_str(line)?,
        },
        _ => {
            let request: CallRequest = serde_json::from_str(line)?;
            Command::Call {
                function: request.function,
                args: request.args,
            }
        }
    };
    Ok(Some(command))
}

/// Read commands until stdin closes, `kill` is entered or Ctrl+C is pressed.
pub async fn run(handle: &ModuleHandle) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        let command = match parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                print_line(&json!({ "error": format!("Invalid command: {}", e) }));
                continue;
            }
        };

        match command {
            Command::Call { function, args } => {
                let outcome = call(handle, &function, args).await;
                print_line(&outcome_json(outcome));
            }
            Command::Module => {
                let outcome = handle.module().await.map(|module| describe(&module));
                print_line(&outcome_json(outcome));
            }
            Command::Restart => {
                let outcome = handle.restart().await.map(|()| Value::Null);
                print_line(&outcome_json(outcome));
            }
            Command::Kill => break,
        }
    }

    handle.kill().await;
    Ok(())
}

async fn call(handle: &ModuleHandle, function: &str, args: Vec<Value>) -> Result<Value, ModuleError> {
    let module = handle.module().await?;
    let Some(proxy) = module.function(function) else {
        return Err(ModuleError::InvalidModuleType(format!(
            "Module does not export a function named \"{}\"",
            function
        )));
    };
    proxy.call(args.into_iter().map(Arg::Value).collect()).await
}

fn describe(module: &Module) -> Value {
    match module {
        Module::Value(value) => json!({ "value": value }),
        Module::Function(_) => json!({ "function": DEFAULT_FUNCTION_ID }),
        Module::Exports(exports) => json!({
            "functions": exports.function_names().collect::<Vec<_>>(),
        }),
    }
}

fn outcome_json(outcome: Result<Value, ModuleError>) -> Value {
    match outcome {
        Ok(value) => json!({ "ok": value }),
        Err(e) => json!({ "error": e.to_string() }),
    }
}

fn print_line(value: &Value) {
    println!("{}", value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_array_calls_default() {
        assert_eq!(
            parse("[1, \"a\"]").unwrap(),
            Some(Command::Call {
                function: "default".to_string(),
                args: vec![json!(1), json!("a")],
            })
        );
    }

    #[test]
    fn test_parse_named_call() {
        assert_eq!(
            parse(r#"{"function": "sum", "args": [1, 2]}"#).unwrap(),
            Some(Command::Call {
                function: "sum".to_string(),
                args: vec![json!(1), json!(2)],
            })
        );
        assert_eq!(
            parse(r#"{"args": []}"#).unwrap(),
            Some(Command::Call {
                function: "default".to_string(),
                args: Vec::new(),
            })
        );
    }

    #[test]
    fn test_parse_keywords_and_blanks() {
        assert_eq!(parse("  restart ").unwrap(), Some(Command::Restart));
        assert_eq!(parse("kill").unwrap(), Some(Command::Kill));
        assert_eq!(parse("module").unwrap(), Some(Command::Module));
        assert_eq!(parse("   ").unwrap(), None);
        assert!(parse("bogus").is_err());
    }

    #[test]
    fn test_outcome_json() {
        assert_eq!(outcome_json(Ok(json!(3))), json!({"ok": 3}));
        assert_eq!(
            outcome_json(Err(ModuleError::Killed)),
            json!({"error": ModuleError::Killed.to_string()})
        );
    }
}
