use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use strata_core::error::Result;
use strata_core::state::State;
use strata_core::trace::RunId;

/// Per-attempt context handed to a node operation.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub node: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// 1-based superstep number.
    pub step: usize,
    pub run_id: RunId,
    /// Cancelled when the attempt times out. Operations that ignore it keep
    /// running in the background after their result has been discarded.
    pub cancel: CancellationToken,
}

impl NodeContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The work a node performs: read a state snapshot, return a partial update.
pub trait NodeOperation: Send + Sync + 'static {
    fn call(&self, state: Arc<State>, ctx: NodeContext) -> BoxFuture<'static, Result<State>>;
}

/// Adapts an async closure into a `NodeOperation`.
struct AsyncOperation<F>(F);

impl<F, Fut> NodeOperation for AsyncOperation<F>
where
    F: Fn(Arc<State>, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<State>> + Send + 'static,
{
    fn call(&self, state: Arc<State>, ctx: NodeContext) -> BoxFuture<'static, Result<State>> {
        Box::pin((self.0)(state, ctx))
    }
}

/// Adapts a synchronous function into a `NodeOperation`. The function runs
/// inside the returned future, not when `call` is made.
struct SyncOperation<F>(Arc<F>);

impl<F> NodeOperation for SyncOperation<F>
where
    F: Fn(&State) -> Result<State> + Send + Sync + 'static,
{
    fn call(&self, state: Arc<State>, _ctx: NodeContext) -> BoxFuture<'static, Result<State>> {
        let operation = Arc::clone(&self.0);
        Box::pin(async move { operation(&state) })
    }
}

/// A named unit of work with its reliability policy.
///
/// Immutable once registered; cloning shares the operation.
#[derive(Clone)]
pub struct NodeDefinition {
    /// Unique identifier for this node.
    pub name: String,
    /// Human-readable description.
    pub description: Option<String>,
    /// Extra attempts after the first failure.
    pub max_retries: u32,
    /// Per-attempt deadline.
    pub timeout: Option<Duration>,
    /// State keys this node reads. Documentation only.
    pub input_keys: Vec<String>,
    /// State keys this node writes. Documentation only.
    pub output_keys: Vec<String>,
    operation: Arc<dyn NodeOperation>,
}

impl NodeDefinition {
    /// Create a node from an async operation.
    pub fn new<F, Fut>(name: impl Into<String>, operation: F) -> Self
    where
        F: Fn(Arc<State>, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<State>> + Send + 'static,
    {
        Self::from_operation(name, Arc::new(AsyncOperation(operation)))
    }

    /// Create a node from a synchronous function of the state.
    pub fn from_fn<F>(name: impl Into<String>, operation: F) -> Self
    where
        F: Fn(&State) -> Result<State> + Send + Sync + 'static,
    {
        Self::from_operation(name, Arc::new(SyncOperation(Arc::new(operation))))
    }

    pub fn from_operation(name: impl Into<String>, operation: Arc<dyn NodeOperation>) -> Self {
        Self {
            name: name.into(),
            description: None,
            max_retries: 0,
            timeout: None,
            input_keys: vec![],
            output_keys: vec![],
            operation,
        }
    }

    /// Set the retry budget.
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Document the keys read from the state.
    pub fn with_inputs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Document the keys written to the state.
    pub fn with_outputs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn operation(&self) -> Arc<dyn NodeOperation> {
        Arc::clone(&self.operation)
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl std::fmt::Debug for NodeDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("input_keys", &self.input_keys)
            .field("output_keys", &self.output_keys)
            .finish_non_exhaustive()
    }
}
