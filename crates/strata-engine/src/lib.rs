pub mod definition;
pub mod graph;
pub mod trace_log;

pub use definition::{EdgeSpec, GraphDefinition, NodeSpec};
pub use graph::{
    Edge, EdgeCondition, ExecutionResult, Graph, GraphExecutor, NodeContext, NodeDefinition,
    NodeOperation, ReliabilityWrapper, END,
};
pub use trace_log::TraceLogger;
