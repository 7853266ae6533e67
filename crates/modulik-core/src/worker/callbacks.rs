//! Worker-side stand-ins for host callbacks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::bridge::{CallbackId, ExecutionId, ExecutionOutcome, WorkerMessage};
use crate::error::{CALLBACK_RESULT_NOT_SERIALIZABLE, ModuleError};

#[derive(Debug)]
struct Inner {
    outbox: mpsc::UnboundedSender<WorkerMessage>,
    callbacks: Mutex<FxHashSet<CallbackId>>,
    pending: Mutex<FxHashMap<ExecutionId, oneshot::Sender<ExecutionOutcome>>>,
}

/// Callbacks received in call arguments, and their invocations awaiting an answer.
#[derive(Debug, Clone)]
pub(crate) struct CallbackRegistry {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CallbackRegistry {
    pub(crate) fn new(outbox: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self {
            inner: Arc::new(Inner {
                outbox,
                callbacks: Mutex::new(FxHashSet::default()),
                pending: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// Create the stand-in for a callback token.
    pub(crate) fn register(&self, id: CallbackId) -> RemoteCallback {
        lock(&self.inner.callbacks).insert(id);
        RemoteCallback {
            id,
            registry: self.clone(),
        }
    }

    /// Ask the host to run a callback and wait for its result.
    pub(crate) async fn invoke(&self, id: CallbackId, args: Vec<Value>) -> Result<Value, ModuleError> {
        if !lock(&self.inner.callbacks).contains(&id) {
            return Err(ModuleError::Worker("Callback is no longer available".to_string()));
        }

        let execution_id = ExecutionId::new();
        let (reply, outcome) = oneshot::channel();
        lock(&self.inner.pending).insert(execution_id, reply);

        let message = WorkerMessage::ExecuteCallback {
            callback_id: id,
            execution_id,
            args,
        };
        if self.inner.outbox.send(message).is_err() {
            lock(&self.inner.pending).remove(&execution_id);
            return Err(ModuleError::Worker("Host connection closed".to_string()));
        }

        match outcome.await {
            Ok(outcome) => outcome.into_result(CALLBACK_RESULT_NOT_SERIALIZABLE),
            Err(_) => Err(ModuleError::Worker("Callback invocation was dropped".to_string())),
        }
    }

    /// Deliver the host's answer to a callback invocation.
    pub(crate) fn complete(&self, execution_id: ExecutionId, outcome: ExecutionOutcome) {
        match lock(&self.inner.pending).remove(&execution_id) {
            Some(reply) => {
                let _ = reply.send(outcome);
            }
            None => tracing::debug!(%execution_id, "Ignoring unknown callback result"),
        }
    }

    /// Forget every callback and pending invocation.
    pub(crate) fn clear(&self) {
        lock(&self.inner.callbacks).clear();
        lock(&self.inner.pending).clear();
    }
}

/// A host callback as seen from inside the worker.
#[derive(Debug, Clone)]
pub struct RemoteCallback {
    id: CallbackId,
    registry: CallbackRegistry,
}

impl RemoteCallback {
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Invoke the host callback and wait for its result.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value, ModuleError> {
        self.registry.invoke(self.id, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_invoke_round_trip() {
        let (outbox, mut sent) = mpsc::unbounded_channel();
        let registry = CallbackRegistry::new(outbox);
        let callback = registry.register(CallbackId::new());

        let call = tokio::spawn({
            let callback = callback.clone();
            async move { callback.call(vec![json!(2)]).await }
        });

        let Some(WorkerMessage::ExecuteCallback {
            callback_id,
            execution_id,
            args,
        }) = sent.recv().await
        else {
            panic!("expected executeCallback");
        };
        assert_eq!(callback_id, callback.id());
        assert_eq!(args, vec![json!(2)]);

        registry.complete(execution_id, ExecutionOutcome::success(json!(4)));
        assert_eq!(call.await.unwrap(), Ok(json!(4)));
    }

    #[tokio::test]
    async fn test_cleared_callback_is_unavailable() {
        let (outbox, _sent) = mpsc::unbounded_channel();
        let registry = CallbackRegistry::new(outbox);
        let callback = registry.register(CallbackId::new());

        registry.clear();
        assert!(matches!(callback.call(Vec::new()).await, Err(ModuleError::Worker(_))));
    }

    #[tokio::test]
    async fn test_host_error_is_forwarded() {
        let (outbox, mut sent) = mpsc::unbounded_channel();
        let registry = CallbackRegistry::new(outbox);
        let callback = registry.register(CallbackId::new());

        let call = tokio::spawn(async move { callback.call(Vec::new()).await });
        let Some(WorkerMessage::ExecuteCallback { execution_id, .. }) = sent.recv().await else {
            panic!("expected executeCallback");
        };
        registry.complete(execution_id, ExecutionOutcome::failure("host says no"));
        assert_eq!(
            call.await.unwrap(),
            Err(ModuleError::Worker("host says no".to_string()))
        );
    }
}
