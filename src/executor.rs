//! Pluggable task executors.
//!
//! The worker maps a node's type to an [`Executor`] registered at startup.
//! Executors are black boxes to the runtime: they receive the task with its
//! resolved inputs and return an output plus usage accounting. Effects must
//! be idempotent or keyed by the task id, because delivery is at-least-once.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::dag::NodeType;
use crate::messages::Task;

/// What an executor hands back on success.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    pub output: Value,
    pub cost_cents: i64,
    pub tokens_prompt: i64,
    pub tokens_completion: i64,
}

impl ExecutionOutput {
    pub fn from_value(output: Value) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ExecutorError(pub String);

impl ExecutorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A single execution attempt. The worker applies deadlines, retries, and
/// cancellation around this call; dropping the returned future aborts the
/// attempt.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<ExecutionOutput, ExecutorError>;
}

/// Node-type to executor mapping, closed after component startup.
#[derive(Clone, Default)]
pub struct ExecutorSet {
    executors: HashMap<NodeType, Arc<dyn Executor>>,
}

impl ExecutorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, node_type: NodeType, executor: Arc<dyn Executor>) {
        self.executors.insert(node_type, executor);
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn Executor>> {
        self.executors.get(&node_type).cloned()
    }
}

type NamedFunction =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ExecutorError>> + Send + Sync>;

/// Executor for `Function` nodes backed by named, registered closures.
///
/// The node's `params.function` selects the closure; the closure receives the
/// task's resolved inputs.
#[derive(Clone, Default)]
pub struct FunctionExecutor {
    functions: HashMap<String, NamedFunction>,
}

impl FunctionExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `noop` (returns null) and `echo` (returns the
    /// resolved inputs), enough for smoke workflows.
    pub fn with_builtins() -> Self {
        let mut executor = Self::new();
        executor.register("noop", |_| Box::pin(async { Ok(Value::Null) }));
        executor.register("echo", |inputs: Value| Box::pin(async move { Ok(inputs) }));
        executor
    }

    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(Value) -> BoxFuture<'static, Result<Value, ExecutorError>>
            + Send
            + Sync
            + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }
}

#[async_trait]
impl Executor for FunctionExecutor {
    async fn execute(&self, task: &Task) -> Result<ExecutionOutput, ExecutorError> {
        let name = task
            .node
            .params
            .get("function")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ExecutorError::new(format!(
                    "node '{}' has no 'function' parameter",
                    task.node.id
                ))
            })?;

        let function = self.functions.get(name).ok_or_else(|| {
            ExecutorError::new(format!("unknown function '{name}'"))
        })?;

        let output = function(task.inputs.clone()).await?;
        Ok(ExecutionOutput::from_value(output))
    }
}
