use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::EventBus;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The frontier became empty.
    Completed,
    /// The step budget ran out with work still pending. Not an error.
    BudgetExhausted,
    /// A node exhausted its retries or the graph was invalid at run time.
    Failed,
}

/// Result of a single node attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { error: String },
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TracePhase {
    Start {
        attempt: u32,
    },
    End {
        attempt: u32,
        elapsed_ms: u64,
        outcome: AttemptOutcome,
    },
    StepBudgetExhausted {
        budget: usize,
        pending: Vec<String>,
    },
    RunFinished {
        status: RunStatus,
    },
}

/// A single entry in a run's trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub run_id: RunId,
    /// Superstep the event belongs to (1-based; 0 before the first step).
    pub step: usize,
    /// Node the event is about. `None` for run-level events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub phase: TracePhase,
    pub timestamp: DateTime<Utc>,
}

/// Append-only log of node start/end events for one run.
///
/// Purely an observer: the scheduler never reads it to make decisions, and a
/// disabled recorder drops every event.
pub struct TraceRecorder {
    run_id: RunId,
    enabled: bool,
    events: Mutex<Vec<TraceEvent>>,
    bus: Option<Arc<EventBus>>,
}

impl TraceRecorder {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            enabled: true,
            events: Mutex::new(Vec::new()),
            bus: None,
        }
    }

    /// A recorder that keeps nothing.
    pub fn disabled(run_id: RunId) -> Self {
        Self {
            enabled: false,
            ..Self::new(run_id)
        }
    }

    /// Also publish every recorded event on the given bus.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_start(&self, step: usize, node: &str, attempt: u32) {
        self.push(step, Some(node), TracePhase::Start { attempt });
    }

    pub fn record_end(
        &self,
        step: usize,
        node: &str,
        attempt: u32,
        elapsed_ms: u64,
        outcome: AttemptOutcome,
    ) {
        self.push(
            step,
            Some(node),
            TracePhase::End {
                attempt,
                elapsed_ms,
                outcome,
            },
        );
    }

    pub fn record_budget_exhausted(&self, step: usize, budget: usize, pending: Vec<String>) {
        self.push(step, None, TracePhase::StepBudgetExhausted { budget, pending });
    }

    pub fn record_finished(&self, step: usize, status: RunStatus) {
        self.push(step, None, TracePhase::RunFinished { status });
    }

    /// Ordered copy of every event recorded so far.
    pub fn dump(&self) -> Vec<TraceEvent> {
        self.lock().clone()
    }

    /// Number of attempts started for a node across the whole run.
    pub fn attempts(&self, node: &str) -> usize {
        self.lock()
            .iter()
            .filter(|e| e.node.as_deref() == Some(node))
            .filter(|e| matches!(e.phase, TracePhase::Start { .. }))
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn push(&self, step: usize, node: Option<&str>, phase: TracePhase) {
        if !self.enabled {
            return;
        }
        let event = TraceEvent {
            run_id: self.run_id.clone(),
            step,
            node: node.map(str::to_string),
            phase,
            timestamp: Utc::now(),
        };
        // Publish under the lock so subscribers see the same order as `dump`.
        let mut events = self.lock();
        if let Some(bus) = self.bus.as_ref().filter(|b| b.has_subscribers()) {
            bus.publish(event.clone());
        }
        events.push(event);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TraceEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}
