use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use strata_core::config::{MergePolicy, StrataConfig};
use strata_core::error::{Result, RunError, StrataError};
use strata_core::event::EventBus;
use strata_core::state::State;
use strata_core::trace::{RunId, RunStatus, TraceEvent, TraceRecorder};

use super::policy::ReliabilityWrapper;
use super::registry::Graph;

/// Result of a run that did not abort.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: RunId,
    /// The merged state when the run stopped.
    pub state: State,
    /// `Completed`, or `BudgetExhausted` when the step budget cut it short.
    pub status: RunStatus,
    /// Supersteps executed.
    pub steps: usize,
    /// The frontier of every executed superstep, in order.
    pub frontiers: Vec<Vec<String>>,
    pub trace: Vec<TraceEvent>,
    /// Total execution time in milliseconds.
    pub total_elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Superstep scheduler.
///
/// Starting from a single node, each superstep runs the whole frontier
/// concurrently against one state snapshot, waits for every member, merges
/// their updates, then asks the edge table for the next frontier. The run
/// ends when the frontier is empty or the step budget is spent.
pub struct GraphExecutor {
    graph: Arc<Graph>,
    config: StrataConfig,
    event_bus: Option<Arc<EventBus>>,
}

impl GraphExecutor {
    /// Create an executor with default configuration.
    pub fn new(graph: Graph) -> Self {
        Self::from_shared(Arc::new(graph))
    }

    /// Create an executor over a graph shared with other executors.
    pub fn from_shared(graph: Arc<Graph>) -> Self {
        Self {
            graph,
            config: StrataConfig::default(),
            event_bus: None,
        }
    }

    pub fn with_config(mut self, config: StrataConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the step budget. At least one superstep always runs.
    pub fn with_step_budget(mut self, step_budget: usize) -> Self {
        self.config.engine.step_budget = step_budget.max(1);
        self
    }

    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.config.engine.merge_policy = policy;
        self
    }

    /// Publish trace events on this bus as they are recorded.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    /// Execute the graph from `start` with a fresh run id.
    pub async fn run(
        &self,
        initial: State,
        start: &str,
    ) -> std::result::Result<ExecutionResult, RunError> {
        self.run_with_id(RunId::new(), initial, start).await
    }

    /// Execute the graph from `start` under a caller-chosen run id.
    pub async fn run_with_id(
        &self,
        run_id: RunId,
        initial: State,
        start: &str,
    ) -> std::result::Result<ExecutionResult, RunError> {
        let started = Instant::now();
        let trace = Arc::new(self.recorder(run_id.clone()));
        let wrapper = ReliabilityWrapper::new(self.config.retry.clone(), Arc::clone(&trace));
        let budget = self.config.engine.step_budget.max(1);

        let mut state = initial;
        if let Err(e) = self.graph.validate(start) {
            error!(run_id = %run_id, start, error = %e, "Cannot start run");
            trace.record_finished(0, RunStatus::Failed);
            return Err(RunError::new(e, state, trace.dump()));
        }

        info!(run_id = %run_id, start, step_budget = budget, "Starting graph run");

        let mut frontier = vec![start.to_string()];
        let mut frontiers = Vec::new();
        let mut step = 0;

        let status = loop {
            if frontier.is_empty() {
                break RunStatus::Completed;
            }
            if step >= budget {
                warn!(
                    run_id = %run_id,
                    step_budget = budget,
                    pending = ?frontier,
                    "Step budget exhausted, stopping run"
                );
                trace.record_budget_exhausted(step, budget, frontier.clone());
                break RunStatus::BudgetExhausted;
            }
            step += 1;
            debug!(run_id = %run_id, step, frontier = ?frontier, "Executing superstep");

            // Every member sees the same snapshot; nothing is merged until all finish.
            let snapshot = Arc::new(state.clone());
            let mut futs = Vec::with_capacity(frontier.len());
            for name in &frontier {
                let Some(node) = self.graph.node(name) else {
                    let e = StrataError::unknown_node(name, "frontier member");
                    return Err(self.abort(e, state, &trace, step));
                };
                futs.push(wrapper.invoke_with_policy(node, Arc::clone(&snapshot), step));
            }
            let results = futures::future::join_all(futs).await;

            let mut updates = Vec::with_capacity(results.len());
            for (name, result) in frontier.iter().zip(results) {
                match result {
                    Ok(update) => updates.push((name.clone(), update)),
                    Err(e) => {
                        error!(run_id = %run_id, step, node = %name, error = %e, "Aborting run");
                        return Err(self.abort(e, state, &trace, step));
                    }
                }
            }

            if let Err(e) = merge_updates(&mut state, &updates, self.config.engine.merge_policy) {
                error!(run_id = %run_id, step, error = %e, "Merge failed, aborting run");
                return Err(self.abort(e, state, &trace, step));
            }

            let next = match self.next_frontier(&frontier, &state) {
                Ok(next) => next,
                Err(e) => {
                    error!(run_id = %run_id, step, error = %e, "Invalid transition, aborting run");
                    return Err(self.abort(e, state, &trace, step));
                }
            };
            frontiers.push(std::mem::replace(&mut frontier, next));
        };

        trace.record_finished(step, status);
        let total_elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            run_id = %run_id,
            steps = step,
            status = ?status,
            total_elapsed_ms,
            "Graph run finished"
        );

        Ok(ExecutionResult {
            run_id,
            state,
            status,
            steps: step,
            frontiers,
            trace: trace.dump(),
            total_elapsed_ms,
        })
    }

    /// Deduplicated union of the successors of every node that just ran.
    fn next_frontier(&self, ran: &[String], state: &State) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut next = Vec::new();
        for from in ran {
            for name in self.graph.next_nodes(from, state) {
                if !self.graph.contains(&name) {
                    return Err(StrataError::unknown_node(
                        name,
                        format!("scheduled by an edge from '{}'", from),
                    ));
                }
                if seen.insert(name.clone()) {
                    next.push(name);
                }
            }
        }
        Ok(next)
    }

    fn recorder(&self, run_id: RunId) -> TraceRecorder {
        if !self.config.trace.enabled {
            return TraceRecorder::disabled(run_id);
        }
        match &self.event_bus {
            Some(bus) => TraceRecorder::new(run_id).with_bus(Arc::clone(bus)),
            None => TraceRecorder::new(run_id),
        }
    }

    fn abort(&self, error: StrataError, state: State, trace: &TraceRecorder, step: usize) -> RunError {
        trace.record_finished(step, RunStatus::Failed);
        RunError::new(error, state, trace.dump())
    }
}

/// Overlay each node's update onto the state in frontier order.
///
/// With `RejectConflicts` every update is checked before any is applied, so a
/// conflict leaves the state untouched.
fn merge_updates(state: &mut State, updates: &[(String, State)], policy: MergePolicy) -> Result<()> {
    if policy == MergePolicy::RejectConflicts {
        let mut writers: HashMap<&str, &str> = HashMap::new();
        for (node, update) in updates {
            for key in update.keys() {
                if let Some(first) = writers.insert(key, node.as_str()) {
                    return Err(StrataError::ConflictingWrite {
                        key: key.to_string(),
                        nodes: vec![first.to_string(), node.clone()],
                    });
                }
            }
        }
    }
    for (_, update) in updates {
        state.merge(update);
    }
    Ok(())
}
