//! Wire protocol between the host and a worker process.
//!
//! The same codec and message types are used on both sides of the boundary.

pub mod args;
pub mod guard;
pub mod protocol;

pub use args::{Arg, ArgItem, CALLBACK_TOKEN_PREFIX, callback_token, parse_callback_token};
pub use protocol::{
    CallbackId, DEFAULT_FUNCTION_ID, ExecutionId, ExecutionOutcome, FUNCTION_MARKER, HostMessage,
    ReadinessData, WorkerMessage, read_message, write_message,
};
