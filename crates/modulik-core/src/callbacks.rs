//! Host-side callbacks passed as call arguments.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::bridge::{CallbackId, ExecutionOutcome};
use crate::error::CALLBACK_RESULT_NOT_SERIALIZABLE;

type CallbackFn = dyn Fn(Vec<Value>) -> BoxFuture<'static, ExecutionOutcome> + Send + Sync;

/// A host function the worker may invoke while executing a call.
#[derive(Clone)]
pub struct Callback {
    inner: Arc<CallbackFn>,
}

impl Callback {
    /// Wrap an async function. Its result is checked before it is sent back.
    pub fn new<F, Fut, T, E>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Serialize + DeserializeOwned + PartialEq,
        E: fmt::Display,
    {
        Self {
            inner: Arc::new(move |args| {
                f(args)
                    .map(|result| {
                        ExecutionOutcome::from_result(result, CALLBACK_RESULT_NOT_SERIALIZABLE)
                    })
                    .boxed()
            }),
        }
    }

    pub(crate) fn invoke(&self, args: Vec<Value>) -> BoxFuture<'static, ExecutionOutcome> {
        (self.inner)(args)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").finish_non_exhaustive()
    }
}

/// Callbacks handed to the current worker, by id.
#[derive(Debug, Default)]
pub(crate) struct HostCallbacks {
    entries: FxHashMap<CallbackId, Callback>,
}

impl HostCallbacks {
    pub(crate) fn register(&mut self, callback: Callback) -> CallbackId {
        let id = CallbackId::new();
        self.entries.insert(id, callback);
        id
    }

    pub(crate) fn get(&self, id: CallbackId) -> Option<Callback> {
        self.entries.get(&id).cloned()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_callback_result_is_checked() {
        let sum = Callback::new(|args: Vec<Value>| async move {
            Ok::<_, String>(args.iter().filter_map(Value::as_i64).sum::<i64>())
        });
        assert_eq!(
            sum.invoke(vec![json!(1), json!(2)]).await,
            ExecutionOutcome::success(json!(3))
        );

        let nan = Callback::new(|_| async { Ok::<_, String>(f64::NAN) });
        let outcome = nan.invoke(Vec::new()).await;
        assert!(!outcome.serializable);
        assert_eq!(outcome.data, json!(CALLBACK_RESULT_NOT_SERIALIZABLE));

        let failing = Callback::new(|_| async { Err::<Value, _>("nope") });
        assert_eq!(failing.invoke(Vec::new()).await, ExecutionOutcome::failure("nope"));
    }

    #[test]
    fn test_arena_clear() {
        let mut callbacks = HostCallbacks::default();
        let id = callbacks.register(Callback::new(|_| async { Ok::<_, String>(Value::Null) }));
        assert!(callbacks.get(id).is_some());
        assert_eq!(callbacks.len(), 1);

        callbacks.clear();
        assert!(callbacks.get(id).is_none());
    }
}
