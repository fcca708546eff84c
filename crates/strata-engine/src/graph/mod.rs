//! Superstep graph engine.
//!
//! A graph is a registry of named `NodeDefinition`s plus an edge table of
//! static and conditional `Edge`s. The `GraphExecutor` runs it in lock-step
//! supersteps: every node in the frontier executes concurrently against the
//! same state snapshot, the updates are merged once all of them finish, and
//! the edges leaving the nodes that ran decide the next frontier.
//!
//! Each node runs through a `ReliabilityWrapper` that applies its timeout and
//! retry budget, recording every attempt on the run's `TraceRecorder`.

pub mod edge;
pub mod executor;
pub mod node;
pub mod policy;
pub mod registry;

pub use edge::{evaluate_condition, Decide, Edge, EdgeCondition, END};
pub use executor::{ExecutionResult, GraphExecutor};
pub use node::{NodeContext, NodeDefinition, NodeOperation};
pub use policy::{calculate_backoff, ReliabilityWrapper};
pub use registry::Graph;
