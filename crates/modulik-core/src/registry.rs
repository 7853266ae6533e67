//! Pending calls: buffered until a worker can take them, then tracked until answered.
//!
//! Every execution is settled exactly once. Settling removes it from the
//! registry, so a late or duplicate result finds nothing to complete.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::bridge::{Arg, ExecutionId};
use crate::error::ModuleError;
use crate::state::Incarnation;

/// Completion side of a caller's call future.
pub(crate) type Reply = oneshot::Sender<Result<Value, ModuleError>>;

#[derive(Debug)]
struct Execution {
    function_id: String,
    /// Taken when the execution is delivered.
    args: Option<Vec<Arg>>,
    reply: Reply,
    /// The worker incarnation the execution was delivered to.
    delivered_to: Option<Incarnation>,
}

impl Execution {
    fn settle(self, result: Result<Value, ModuleError>) {
        // The caller may have stopped waiting.
        let _ = self.reply.send(result);
    }
}

/// Per function id FIFO of executions awaiting delivery.
#[derive(Debug, Default)]
pub(crate) struct ExecutionBuffer {
    groups: FxHashMap<String, VecDeque<ExecutionId>>,
}

impl ExecutionBuffer {
    fn push(&mut self, function_id: &str, id: ExecutionId) {
        self.groups
            .entry(function_id.to_string())
            .or_default()
            .push_back(id);
    }

    /// Empty the group, keeping it present.
    fn take(&mut self, function_id: &str) -> VecDeque<ExecutionId> {
        self.groups
            .get_mut(function_id)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Remove the group entirely.
    fn discard(&mut self, function_id: &str) -> VecDeque<ExecutionId> {
        self.groups.remove(function_id).unwrap_or_default()
    }

    fn remove(&mut self, function_id: &str, id: ExecutionId) {
        if let Some(group) = self.groups.get_mut(function_id) {
            group.retain(|buffered| *buffered != id);
        }
    }

    /// Function ids with at least one buffered execution, sorted.
    fn non_empty(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .groups
            .iter()
            .filter(|(_, group)| !group.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// All executions not yet settled, buffered or in flight.
#[derive(Debug, Default)]
pub(crate) struct ExecutionRegistry {
    executions: FxHashMap<ExecutionId, Execution>,
    buffer: ExecutionBuffer,
}

impl ExecutionRegistry {
    /// Track a new call and buffer it under its function id.
    pub(crate) fn register(&mut self, function_id: &str, args: Vec<Arg>, reply: Reply) -> ExecutionId {
        let id = ExecutionId::new();
        self.executions.insert(
            id,
            Execution {
                function_id: function_id.to_string(),
                args: Some(args),
                reply,
                delivered_to: None,
            },
        );
        self.buffer.push(function_id, id);
        id
    }

    /// Take every buffered execution of `function_id` in submission order,
    /// marking it as delivered to `incarnation`.
    pub(crate) fn drain(&mut self, function_id: &str, incarnation: Incarnation) -> Vec<(ExecutionId, Vec<Arg>)> {
        let mut delivered = Vec::new();
        for id in self.buffer.take(function_id) {
            if let Some(execution) = self.executions.get_mut(&id) {
                execution.delivered_to = Some(incarnation);
                delivered.push((id, execution.args.take().unwrap_or_default()));
            }
        }
        delivered
    }

    /// Complete an execution with a result from `incarnation`.
    ///
    /// Returns false if the execution is unknown or was delivered elsewhere.
    pub(crate) fn resolve(
        &mut self,
        id: ExecutionId,
        incarnation: Incarnation,
        result: Result<Value, ModuleError>,
    ) -> bool {
        match self.executions.get(&id) {
            Some(execution) if execution.delivered_to == Some(incarnation) => {}
            _ => return false,
        }
        match self.executions.remove(&id) {
            Some(execution) => {
                execution.settle(result);
                true
            }
            None => false,
        }
    }

    /// Reject one execution wherever it is.
    pub(crate) fn reject(&mut self, id: ExecutionId, error: ModuleError) {
        if let Some(execution) = self.executions.remove(&id) {
            self.buffer.remove(&execution.function_id, id);
            execution.settle(Err(error));
        }
    }

    /// Reject and discard the buffered group of `function_id`.
    pub(crate) fn reject_all(&mut self, function_id: &str, error: ModuleError) -> usize {
        let group = self.buffer.discard(function_id);
        let count = group.len();
        for id in group {
            if let Some(execution) = self.executions.remove(&id) {
                execution.settle(Err(error.clone()));
            }
        }
        count
    }

    /// Reject every buffered execution.
    pub(crate) fn reject_buffered(&mut self, error: ModuleError) -> usize {
        self.buffer
            .non_empty()
            .iter()
            .map(|function_id| self.reject_all(function_id, error.clone()))
            .sum()
    }

    /// Reject every execution in flight on `incarnation`.
    pub(crate) fn abandon(&mut self, incarnation: Incarnation, error: ModuleError) -> usize {
        let abandoned: Vec<ExecutionId> = self
            .executions
            .iter()
            .filter(|(_, execution)| execution.delivered_to == Some(incarnation))
            .map(|(id, _)| *id)
            .collect();
        for id in &abandoned {
            if let Some(execution) = self.executions.remove(id) {
                execution.settle(Err(error.clone()));
            }
        }
        abandoned.len()
    }

    /// Function ids with buffered executions.
    pub(crate) fn buffered_function_ids(&self) -> Vec<String> {
        self.buffer.non_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.executions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(registry: &mut ExecutionRegistry, function_id: &str, n: i64) -> (ExecutionId, oneshot::Receiver<Result<Value, ModuleError>>) {
        let (tx, rx) = oneshot::channel();
        let id = registry.register(function_id, vec![Arg::Value(json!(n))], tx);
        (id, rx)
    }

    #[test]
    fn test_drain_is_fifo_and_leaves_group_empty() {
        let mut registry = ExecutionRegistry::default();
        let (first, _rx1) = call(&mut registry, "default", 1);
        let (second, _rx2) = call(&mut registry, "default", 2);
        let (_other, _rx3) = call(&mut registry, "other", 3);

        let drained = registry.drain("default", Incarnation(1));
        let ids: Vec<ExecutionId> = drained.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(drained[0].1[0].as_value(), Some(&json!(1)));

        assert!(registry.drain("default", Incarnation(1)).is_empty());
        assert_eq!(registry.buffered_function_ids(), vec!["other".to_string()]);
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_resolve_only_from_delivering_incarnation() {
        let mut registry = ExecutionRegistry::default();
        let (id, rx) = call(&mut registry, "default", 1);
        registry.drain("default", Incarnation(2));

        assert!(!registry.resolve(id, Incarnation(1), Ok(json!("stale"))));
        assert!(registry.resolve(id, Incarnation(2), Ok(json!("fresh"))));
        assert!(!registry.resolve(id, Incarnation(2), Ok(json!("twice"))));

        assert_eq!(rx.await.unwrap(), Ok(json!("fresh")));
    }

    #[tokio::test]
    async fn test_reject_all_discards_group() {
        let mut registry = ExecutionRegistry::default();
        let (_a, rx_a) = call(&mut registry, "default", 1);
        let (_b, rx_b) = call(&mut registry, "default", 2);

        let error = ModuleError::InvalidModuleType("gone".to_string());
        assert_eq!(registry.reject_all("default", error.clone()), 2);
        assert!(registry.buffered_function_ids().is_empty());
        assert_eq!(registry.len(), 0);

        assert_eq!(rx_a.await.unwrap(), Err(error.clone()));
        assert_eq!(rx_b.await.unwrap(), Err(error));
    }

    #[tokio::test]
    async fn test_abandon_rejects_in_flight_only() {
        let mut registry = ExecutionRegistry::default();
        let (_sent, rx_sent) = call(&mut registry, "default", 1);
        registry.drain("default", Incarnation(1));
        let (_buffered, _rx_buffered) = call(&mut registry, "default", 2);

        assert_eq!(registry.abandon(Incarnation(1), ModuleError::Failure), 1);
        assert_eq!(rx_sent.await.unwrap(), Err(ModuleError::Failure));
        assert_eq!(registry.buffered_function_ids(), vec!["default".to_string()]);
    }

    #[tokio::test]
    async fn test_reject_single_buffered_execution() {
        let mut registry = ExecutionRegistry::default();
        let (id, rx) = call(&mut registry, "default", 1);
        let (_keep, _rx_keep) = call(&mut registry, "default", 2);

        registry.reject(id, ModuleError::Killed);
        assert_eq!(rx.await.unwrap(), Err(ModuleError::Killed));
        assert_eq!(registry.drain("default", Incarnation(1)).len(), 1);

        assert_eq!(registry.reject_buffered(ModuleError::Killed), 0);
    }
}
