use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use strata_core::config::expand_env_vars;
use strata_core::error::{Result, StrataError};
use strata_core::state::State;

use crate::graph::edge::{evaluate_condition, is_valid_condition, EdgeCondition, END};
use crate::graph::node::{NodeContext, NodeDefinition};
use crate::graph::registry::Graph;

/// A graph described in TOML.
///
/// Nodes here do no real work: each one optionally sleeps, optionally fails
/// its first attempts, then writes its `set` table and bumps its `increment`
/// counters. That is enough to exercise fan-out, routing, retries, timeouts
/// and the step budget without writing Rust.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDefinition {
    /// Entry node. Defaults to the first node listed.
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Simulated work per attempt.
    #[serde(default)]
    pub delay_ms: u64,
    /// Attempts 1..=fail_attempts report an error.
    #[serde(default)]
    pub fail_attempts: u32,
    /// Written into the state on success.
    #[serde(default)]
    pub set: State,
    /// Integer keys incremented from the snapshot on success. Missing keys start at 0.
    #[serde(default)]
    pub increment: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
    /// `key == "v"`, `key != "v"` or `key contains "v"`.
    #[serde(default)]
    pub when: Option<String>,
}

impl EdgeSpec {
    pub fn condition(&self) -> EdgeCondition {
        match &self.when {
            Some(expr) => EdgeCondition::When { expr: expr.clone() },
            None => EdgeCondition::Always,
        }
    }
}

impl GraphDefinition {
    /// Load a definition from a TOML file, expanding `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StrataError::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| StrataError::InvalidGraph(e.to_string()))
    }

    /// Entry node: the declared `start`, else the first node.
    pub fn start_node(&self) -> Option<&str> {
        self.start
            .as_deref()
            .or_else(|| self.nodes.first().map(|n| n.name.as_str()))
    }

    /// Register every node and edge.
    ///
    /// Unconditional edges become static edges. All `when` edges leaving one
    /// node become a single conditional edge whose decision returns every
    /// target whose expression matches, in declaration order. That edge is
    /// registered where the first of its `when` edges is declared, so
    /// frontier order follows the order of `[[edges]]`. Every target must be
    /// a declared node or `END`.
    pub fn build(&self) -> Result<Graph> {
        let mut graph = Graph::new();
        for spec in &self.nodes {
            graph.add_node(spec.to_node())?;
        }

        let mut routes: HashMap<&str, Vec<(String, String)>> = HashMap::new();
        for edge in &self.edges {
            if let EdgeCondition::When { expr } = edge.condition() {
                if !is_valid_condition(&expr) {
                    return Err(StrataError::InvalidGraph(format!(
                        "edge {} -> {}: cannot parse condition '{}'",
                        edge.from, edge.to, expr
                    )));
                }
                if edge.to != END && !graph.contains(&edge.to) {
                    return Err(StrataError::unknown_node(
                        &edge.to,
                        format!("target of edge from '{}'", edge.from),
                    ));
                }
                routes
                    .entry(edge.from.as_str())
                    .or_default()
                    .push((expr, edge.to.clone()));
            }
        }

        for edge in &self.edges {
            if edge.when.is_none() {
                graph.add_edge(edge.from.as_str(), edge.to.as_str())?;
                continue;
            }
            // Later `when` edges from the same node were folded into the first.
            let Some(targets) = routes.remove(edge.from.as_str()) else {
                continue;
            };
            debug!(from = %edge.from, routes = targets.len(), "Registering conditional edge");
            graph.add_conditional_edge(edge.from.as_str(), move |state: &State| {
                targets
                    .iter()
                    .filter(|(expr, _)| evaluate_condition(expr, state))
                    .map(|(_, to)| to.clone())
                    .collect::<Vec<String>>()
            })?;
        }

        Ok(graph)
    }
}

impl NodeSpec {
    fn to_node(&self) -> NodeDefinition {
        let behaviour = Arc::new(self.clone());
        let mut node = NodeDefinition::new(self.name.as_str(), move |state: Arc<State>, ctx: NodeContext| {
            let spec = Arc::clone(&behaviour);
            async move { spec.perform(&state, &ctx).await }
        })
        .with_retries(self.max_retries)
        .with_outputs(self.set.keys().chain(self.increment.iter().map(String::as_str)));

        if let Some(ms) = self.timeout_ms {
            node = node.with_timeout(Duration::from_millis(ms));
        }
        if let Some(description) = &self.description {
            node = node.with_description(description.as_str());
        }
        node
    }

    async fn perform(&self, state: &State, ctx: &NodeContext) -> Result<State> {
        if self.delay_ms > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.delay_ms)) => {}
                _ = ctx.cancel.cancelled() => {
                    return Err(StrataError::operation("cancelled"));
                }
            }
        }

        if ctx.attempt <= self.fail_attempts {
            return Err(StrataError::operation(format!(
                "scripted failure on attempt {}",
                ctx.attempt
            )));
        }

        let mut update = self.set.clone();
        for key in &self.increment {
            update.set(key.as_str(), state.get_i64(key).unwrap_or(0) + 1);
        }
        Ok(update)
    }
}
