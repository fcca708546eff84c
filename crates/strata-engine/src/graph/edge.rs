use std::sync::Arc;

use serde::{Deserialize, Serialize};

use strata_core::state::State;

/// Terminal sentinel. An edge or decision pointing here schedules nothing.
pub const END: &str = "__end__";

/// Decision function of a conditional edge.
///
/// Must be a pure function of the state; the scheduler may call it once per
/// superstep in which its source node ran.
pub type Decide = Arc<dyn Fn(&State) -> Vec<String> + Send + Sync>;

/// A registered transition out of a node.
#[derive(Clone)]
pub enum Edge {
    /// Always taken.
    Static { from: String, to: String },
    /// Next nodes computed from the state after the superstep's merge.
    Conditional { from: String, decide: Decide },
}

impl Edge {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::Static {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create a conditional edge from a decision function.
    pub fn conditional<F, I, S>(from: impl Into<String>, decide: F) -> Self
    where
        F: Fn(&State) -> I + Send + Sync + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Conditional {
            from: from.into(),
            decide: Arc::new(move |state: &State| {
                decide(state).into_iter().map(Into::into).collect::<Vec<String>>()
            }),
        }
    }

    pub fn from(&self) -> &str {
        match self {
            Self::Static { from, .. } | Self::Conditional { from, .. } => from,
        }
    }

    /// Targets of this edge for the given state, in decision order.
    pub fn targets(&self, state: &State) -> Vec<String> {
        match self {
            Self::Static { to, .. } => vec![to.clone()],
            Self::Conditional { decide, .. } => decide(state),
        }
    }

    pub fn is_conditional(&self) -> bool {
        matches!(self, Self::Conditional { .. })
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static { from, to } => f
                .debug_struct("Static")
                .field("from", from)
                .field("to", to)
                .finish(),
            Self::Conditional { from, .. } => f
                .debug_struct("Conditional")
                .field("from", from)
                .finish_non_exhaustive(),
        }
    }
}

/// Routing condition of a declarative edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Always traverse this edge.
    #[default]
    Always,
    /// Traverse if a simple expression matches the state.
    /// Supported: `key == "value"`, `key != "value"`, `key contains "substr"`.
    When { expr: String },
}

/// Evaluate a simple conditional expression against the state.
///
/// Supported expressions:
/// - `key == "value"`: exact match
/// - `key != "value"`: not equal
/// - `key contains "substr"`: substring match
///
/// Non-string values are compared by their JSON rendering, so
/// `flag == "true"` matches a boolean `true`. Returns `false` for
/// unparseable expressions and missing keys.
pub fn evaluate_condition(expr: &str, state: &State) -> bool {
    let expr = expr.trim();

    // key contains "value"
    if let Some((key, substr)) = parse_operator(expr, " contains ") {
        return value_text(state, key).is_some_and(|s| s.contains(substr));
    }

    // key != "value"
    if let Some((key, value)) = parse_operator(expr, "!=") {
        return value_text(state, key).is_some_and(|s| s != value);
    }

    // key == "value"
    if let Some((key, value)) = parse_operator(expr, "==") {
        return value_text(state, key).is_some_and(|s| s == value);
    }

    false
}

/// Check that an expression is one `evaluate_condition` understands.
pub fn is_valid_condition(expr: &str) -> bool {
    let expr = expr.trim();
    [" contains ", "!=", "=="]
        .iter()
        .any(|op| parse_operator(expr, op).is_some_and(|(key, _)| !key.is_empty()))
}

fn value_text(state: &State, key: &str) -> Option<String> {
    state.get(key).map(|v| match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    Some((key.trim(), val.trim().trim_matches('"')))
}
