//! Bridge protocol messages exchanged between host and worker.
//!
//! Uses length-prefixed JSON messages over the worker's stdin/stdout.
//! Format: 4-byte length (u32 LE) + JSON-encoded message.

use std::collections::BTreeSet;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{Error, ModuleError, Result};

use super::guard;

/// Function id of a module's default (or sole) function export.
pub const DEFAULT_FUNCTION_ID: &str = "default";

/// Stand-in for a function export inside a readiness body.
pub const FUNCTION_MARKER: &str = "[[modulik-function]]";

/// Upper bound for a single frame (100MB).
const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Identifies one call attempt. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies a host-side callback passed as a call argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackId(Uuid);

impl CallbackId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub(crate) fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(Self)
    }
}

impl Default for CallbackId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The shape a worker reports once per incarnation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessData {
    /// The exported value, with function exports replaced by [`FUNCTION_MARKER`].
    /// Absent when the export failed its round-trip check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Whether `body` survived the round-trip check.
    pub serializable: bool,
    /// Callable function ids: `"default"` and/or named export names.
    #[serde(default)]
    pub exported_function_ids: BTreeSet<String>,
}

impl ReadinessData {
    /// Whether calls to `function_id` can be delivered.
    pub fn is_callable(&self, function_id: &str) -> bool {
        self.exported_function_ids.contains(function_id)
    }

    /// Whether the module exports any function at all.
    pub fn exports_functions(&self) -> bool {
        !self.exported_function_ids.is_empty()
    }

    /// Type name of the export, for error messages.
    pub fn kind(&self) -> &'static str {
        if self.is_callable(DEFAULT_FUNCTION_ID) {
            return "function";
        }
        match &self.body {
            None | Some(Value::Null) => "null",
            Some(Value::Bool(_)) => "boolean",
            Some(Value::Number(_)) => "number",
            Some(Value::String(_)) => "string",
            Some(Value::Array(_)) => "array",
            Some(Value::Object(_)) => "object",
        }
    }
}

/// Tagged result of a function or callback execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Whether `data` carries an error message.
    pub error: bool,
    /// The result value, or an error message.
    #[serde(default)]
    pub data: Value,
    /// Whether the result survived the round-trip check.
    #[serde(default = "serializable_by_default")]
    pub serializable: bool,
}

fn serializable_by_default() -> bool {
    true
}

impl ExecutionOutcome {
    pub fn success(data: Value) -> Self {
        Self {
            error: false,
            data,
            serializable: true,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: true,
            data: Value::String(message.into()),
            serializable: true,
        }
    }

    /// A result that could not be represented; `message` replaces the data.
    pub fn not_serializable(message: impl Into<String>) -> Self {
        Self {
            error: false,
            data: Value::String(message.into()),
            serializable: false,
        }
    }

    /// Build an outcome from a typed result, checking it survives the round trip.
    pub fn from_result<T, E>(result: std::result::Result<T, E>, serialization_message: &str) -> Self
    where
        T: Serialize + DeserializeOwned + PartialEq,
        E: fmt::Display,
    {
        match result {
            Ok(value) => match guard::verify(&value) {
                Ok(data) => Self::success(data),
                Err(_) => Self::not_serializable(serialization_message),
            },
            Err(e) => Self::failure(e.to_string()),
        }
    }

    /// Convert to the caller-visible result.
    pub fn into_result(self, serialization_message: &str) -> std::result::Result<Value, ModuleError> {
        if !self.serializable {
            let message = match self.data {
                Value::String(message) => message,
                _ => serialization_message.to_string(),
            };
            return Err(ModuleError::Serialization(message));
        }
        if self.error {
            let message = match self.data {
                Value::String(message) => message,
                other => other.to_string(),
            };
            return Err(ModuleError::Worker(message));
        }
        Ok(self.data)
    }
}

/// Message sent from worker to host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum WorkerMessage {
    /// The module is loaded; sent once per incarnation.
    Ready(ReadinessData),

    /// A function call finished.
    ExecutionResult {
        execution_id: ExecutionId,
        result: ExecutionOutcome,
    },

    /// The worker invokes a callback that arrived as a call argument.
    ExecuteCallback {
        callback_id: CallbackId,
        execution_id: ExecutionId,
        args: Vec<Value>,
    },
}

/// Message sent from host to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum HostMessage {
    /// Call an exported function.
    Execute {
        function_id: String,
        execution_id: ExecutionId,
        args: Vec<Value>,
    },

    /// A callback invoked through `executeCallback` finished.
    CallbackExecutionResult {
        execution_id: ExecutionId,
        result: ExecutionOutcome,
    },
}

/// Encode a message as a length-prefixed frame.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", body.len())));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame body (without its length prefix).
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))
}

/// Write a message to a writer using length-prefixed encoding.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(message)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;
    Ok(())
}

/// Read a message from a reader using length-prefixed encoding.
///
/// Returns `None` when the stream ends before a new frame starts.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Ipc(format!("Failed to read IPC message length: {}", e))),
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    decode(&body).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_execute_roundtrip() {
        let execution_id = ExecutionId::new();
        let message = HostMessage::Execute {
            function_id: "default".to_string(),
            execution_id,
            args: vec![json!(1), json!("two")],
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &message).await.unwrap();

        let mut reader = buf.as_slice();
        let decoded: HostMessage = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_wire_shape_is_tagged_and_camel_case() {
        let execution_id = ExecutionId::new();
        let message = WorkerMessage::ExecutionResult {
            execution_id,
            result: ExecutionOutcome::success(json!("2 1")),
        };

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "executionResult");
        assert_eq!(value["data"]["executionId"], json!(execution_id.to_string()));
        assert_eq!(value["data"]["result"]["data"], "2 1");
        assert_eq!(value["data"]["result"]["error"], false);

        let ready = WorkerMessage::Ready(ReadinessData {
            body: Some(json!(FUNCTION_MARKER)),
            serializable: true,
            exported_function_ids: [DEFAULT_FUNCTION_ID.to_string()].into(),
        });
        let value = serde_json::to_value(&ready).unwrap();
        assert_eq!(value["type"], "ready");
        assert_eq!(value["data"]["exportedFunctionIds"], json!(["default"]));
    }

    #[tokio::test]
    async fn test_end_of_stream_yields_none() {
        let mut reader: &[u8] = &[];
        let decoded: Option<WorkerMessage> = read_message(&mut reader).await.unwrap();
        assert!(decoded.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let frame = ((MAX_FRAME_LEN as u32) + 1).to_le_bytes();
        let mut reader: &[u8] = &frame;
        let result: Result<Option<WorkerMessage>> = read_message(&mut reader).await;
        assert!(matches!(result, Err(Error::Ipc(_))));
    }

    #[tokio::test]
    async fn test_consecutive_frames_keep_order() {
        let mut buf = Vec::new();
        for n in 0..3 {
            let message = HostMessage::CallbackExecutionResult {
                execution_id: ExecutionId::new(),
                result: ExecutionOutcome::success(json!(n)),
            };
            write_message(&mut buf, &message).await.unwrap();
        }

        let mut reader = buf.as_slice();
        for n in 0..3 {
            match read_message::<_, HostMessage>(&mut reader).await.unwrap() {
                Some(HostMessage::CallbackExecutionResult { result, .. }) => {
                    assert_eq!(result.data, json!(n));
                }
                other => panic!("Wrong message: {:?}", other),
            }
        }
    }

    #[test]
    fn test_outcome_into_result() {
        assert_eq!(
            ExecutionOutcome::success(json!(3)).into_result(RESULT_MESSAGE),
            Ok(json!(3))
        );
        assert_eq!(
            ExecutionOutcome::failure("boom").into_result(RESULT_MESSAGE),
            Err(ModuleError::Worker("boom".to_string()))
        );
        assert_eq!(
            ExecutionOutcome {
                error: false,
                data: Value::Null,
                serializable: false,
            }
            .into_result(RESULT_MESSAGE),
            Err(ModuleError::Serialization(RESULT_MESSAGE.to_string()))
        );
    }

    #[test]
    fn test_outcome_from_non_finite_float_is_not_serializable() {
        let outcome = ExecutionOutcome::from_result(Ok::<f64, String>(f64::NAN), RESULT_MESSAGE);
        assert!(!outcome.serializable);
        assert_eq!(outcome.data, json!(RESULT_MESSAGE));
    }

    #[test]
    fn test_readiness_kind() {
        let readiness = ReadinessData {
            body: Some(json!(1)),
            serializable: true,
            exported_function_ids: BTreeSet::new(),
        };
        assert_eq!(readiness.kind(), "number");
        assert!(!readiness.exports_functions());
    }

    const RESULT_MESSAGE: &str = "not serializable";
}
