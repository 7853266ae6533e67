//! Loading JSON module sources.
//!
//! - A string `"fn:<name>"` exports the built-in function `<name>`.
//! - An object with a `default` key exports only that key.
//! - Any other object exports each field by name.
//! - Anything else is exported as a plain value.

use std::path::Path;

use anyhow::{Context, anyhow};
use modulik_core::worker::WorkerModule;
use serde_json::Value;

use crate::builtins::{self, FUNCTION_PREFIX};

/// Read and interpret the module source at `path`.
pub fn load(path: &Path) -> anyhow::Result<WorkerModule> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read module source {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("Module source {} is not valid JSON", path.display()))?;
    module_from_value(value)
}

pub fn module_from_value(value: Value) -> anyhow::Result<WorkerModule> {
    match value {
        Value::Object(mut fields) if fields.contains_key("default") => {
            let export = fields.remove("default").unwrap_or(Value::Null);
            single(export)
        }
        Value::Object(fields) => {
            let mut module = WorkerModule::named();
            for (name, value) in fields {
                module = match function_name(&value) {
                    Some(builtin) => module.with_function(name, lookup(builtin)?),
                    None => module.with_value(name, &value),
                };
            }
            Ok(module)
        }
        other => single(other),
    }
}

fn single(export: Value) -> anyhow::Result<WorkerModule> {
    match function_name(&export) {
        Some(builtin) => Ok(WorkerModule::function(lookup(builtin)?)),
        None => Ok(WorkerModule::value(&export)),
    }
}

fn function_name(value: &Value) -> Option<&str> {
    value.as_str()?.strip_prefix(FUNCTION_PREFIX)
}

fn lookup(name: &str) -> anyhow::Result<modulik_core::worker::Function> {
    builtins::lookup(name).ok_or_else(|| anyhow!("Unknown built-in function \"{}\"", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use modulik_core::bridge::{DEFAULT_FUNCTION_ID, FUNCTION_MARKER};
    use serde_json::json;

    #[test]
    fn test_plain_value() {
        let readiness = module_from_value(json!(1)).unwrap().readiness();
        assert_eq!(readiness.body, Some(json!(1)));
        assert!(!readiness.exports_functions());
    }

    #[test]
    fn test_default_function() {
        let readiness = module_from_value(json!({"default": "fn:join_reversed", "ignored": 1}))
            .unwrap()
            .readiness();
        assert!(readiness.is_callable(DEFAULT_FUNCTION_ID));
        assert_eq!(readiness.body, Some(json!(FUNCTION_MARKER)));
    }

    #[test]
    fn test_named_exports() {
        let readiness = module_from_value(json!({"sum": "fn:sum", "name": "calc"}))
            .unwrap()
            .readiness();
        assert!(readiness.is_callable("sum"));
        assert_eq!(readiness.body, Some(json!({"sum": FUNCTION_MARKER, "name": "calc"})));
    }

    #[test]
    fn test_unknown_builtin_is_an_error() {
        assert!(module_from_value(json!("fn:missing")).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("module.json");
        std::fs::write(&path, r#""fn:echo""#).unwrap();
        assert!(load(&path).unwrap().readiness().is_callable(DEFAULT_FUNCTION_ID));

        std::fs::write(&path, "{not json").unwrap();
        assert!(load(&path).is_err());
    }
}
