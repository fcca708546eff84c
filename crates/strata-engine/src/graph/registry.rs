use std::collections::{HashMap, HashSet};

use strata_core::error::{Result, StrataError};
use strata_core::state::State;

use super::edge::{Edge, END};
use super::node::NodeDefinition;

/// Node registry plus edge table.
///
/// Built once, then shared read-only by every run. Node names are kept in
/// registration order so diagnostics and `to_dot` are stable.
#[derive(Debug, Default, Clone)]
pub struct Graph {
    nodes: HashMap<String, NodeDefinition>,
    order: Vec<String>,
    edges: Vec<Edge>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Names must be unique and must not be `END`.
    pub fn add_node(&mut self, node: NodeDefinition) -> Result<&mut Self> {
        if node.name.is_empty() || node.name == END {
            return Err(StrataError::InvalidGraph(format!(
                "'{}' is not a valid node name",
                node.name
            )));
        }
        if self.nodes.contains_key(&node.name) {
            return Err(StrataError::DuplicateNode(node.name));
        }
        self.order.push(node.name.clone());
        self.nodes.insert(node.name.clone(), node);
        Ok(self)
    }

    /// Register a static edge. Both endpoints must already be registered;
    /// `to` may also be `END`.
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> Result<&mut Self> {
        let (from, to) = (from.into(), to.into());
        self.require(&from, || format!("source of edge to '{}'", to))?;
        if to != END {
            self.require(&to, || format!("target of edge from '{}'", from))?;
        }
        self.edges.push(Edge::always(from, to));
        Ok(self)
    }

    /// Register a conditional edge. The source must already be registered;
    /// the decision's results are checked when the frontier is computed.
    pub fn add_conditional_edge<F, I, S>(&mut self, from: impl Into<String>, decide: F) -> Result<&mut Self>
    where
        F: Fn(&State) -> I + Send + Sync + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let from = from.into();
        self.require(&from, || "source of conditional edge".to_string())?;
        self.edges.push(Edge::conditional(from, decide));
        Ok(self)
    }

    /// Deduplicated union of every edge target leaving `from`.
    ///
    /// Static edges are always taken, conditional edges are asked to decide.
    /// Order follows edge registration, then decision order. `END` is dropped.
    pub fn next_nodes(&self, from: &str, state: &State) -> Vec<String> {
        let mut seen = HashSet::new();
        self.edges_from(from)
            .flat_map(|edge| edge.targets(state))
            .filter(|name| name != END)
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }

    /// Outgoing edges of a node, in registration order.
    pub fn edges_from<'a>(&'a self, from: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from() == from)
    }

    pub fn node(&self, name: &str) -> Option<&NodeDefinition> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Node names in registration order.
    pub fn node_names(&self) -> &[String] {
        &self.order
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check that a run can start at `start`.
    pub fn validate(&self, start: &str) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(StrataError::InvalidGraph("graph has no nodes".into()));
        }
        self.require(start, || "start node".to_string())
    }

    /// Graphviz rendering. Conditional edges are dashed and point at a
    /// diamond since their targets are only known at run time.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph strata {\n");
        for name in &self.order {
            out.push_str(&format!("    \"{}\";\n", name));
        }
        for (i, edge) in self.edges.iter().enumerate() {
            match edge {
                Edge::Static { from, to } => {
                    out.push_str(&format!("    \"{}\" -> \"{}\";\n", from, to));
                }
                Edge::Conditional { from, .. } => {
                    out.push_str(&format!(
                        "    \"decide_{i}\" [shape=diamond,label=\"?\"];\n    \"{}\" -> \"decide_{i}\" [style=dashed];\n",
                        from
                    ));
                }
            }
        }
        out.push_str("}\n");
        out
    }

    fn require(&self, name: &str, context: impl FnOnce() -> String) -> Result<()> {
        if self.nodes.contains_key(name) {
            Ok(())
        } else {
            Err(StrataError::unknown_node(name, context()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> NodeDefinition {
        NodeDefinition::from_fn(name, |_| Ok(State::new()))
    }

    fn graph(names: &[&str]) -> Graph {
        let mut g = Graph::new();
        for name in names {
            g.add_node(noop(name)).unwrap();
        }
        g
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut g = graph(&["a"]);
        let err = g.add_node(noop("a")).unwrap_err();
        assert!(matches!(err, StrataError::DuplicateNode(ref n) if n == "a"));
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_end_is_reserved() {
        let mut g = Graph::new();
        assert!(matches!(
            g.add_node(noop(END)),
            Err(StrataError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_edge_to_unknown_node_rejected() {
        let mut g = graph(&["a"]);
        let err = g.add_edge("a", "ghost").unwrap_err();
        assert!(matches!(err, StrataError::UnknownNode { ref name, .. } if name == "ghost"));

        let err = g.add_edge("ghost", "a").unwrap_err();
        assert!(matches!(err, StrataError::UnknownNode { ref name, .. } if name == "ghost"));

        let err = g.add_conditional_edge("ghost", |_: &State| ["a"]).unwrap_err();
        assert!(matches!(err, StrataError::UnknownNode { .. }));
        assert!(g.edges().is_empty());
    }

    #[test]
    fn test_fluent_construction() -> Result<()> {
        let mut g = Graph::new();
        g.add_node(noop("a"))?
            .add_node(noop("b"))?
            .add_edge("a", "b")?
            .add_edge("b", END)?;
        assert_eq!(g.node_names(), ["a", "b"]);
        assert_eq!(g.edges().len(), 2);
        Ok(())
    }

    #[test]
    fn test_next_nodes_fan_out() {
        let mut g = graph(&["a", "b", "c"]);
        g.add_edge("a", "b").unwrap();
        g.add_edge("a", "c").unwrap();
        assert_eq!(g.next_nodes("a", &State::new()), vec!["b", "c"]);
        assert!(g.next_nodes("b", &State::new()).is_empty());
    }

    #[test]
    fn test_next_nodes_deduplicates_static_and_conditional() {
        let mut g = graph(&["a", "b", "c"]);
        g.add_edge("a", "b").unwrap();
        g.add_conditional_edge("a", |_: &State| ["b", "c", "b"]).unwrap();
        assert_eq!(g.next_nodes("a", &State::new()), vec!["b", "c"]);
    }

    #[test]
    fn test_next_nodes_drops_end() {
        let mut g = graph(&["a", "b"]);
        g.add_conditional_edge("a", |s: &State| {
            if s.get_bool("done") == Some(true) {
                vec![END]
            } else {
                vec!["b"]
            }
        })
        .unwrap();
        assert_eq!(g.next_nodes("a", &State::new()), vec!["b"]);
        assert!(g
            .next_nodes("a", &State::new().with("done", true))
            .is_empty());
    }

    #[test]
    fn test_validate_start() {
        let g = graph(&["a"]);
        assert!(g.validate("a").is_ok());
        assert!(matches!(
            g.validate("zzz"),
            Err(StrataError::UnknownNode { .. })
        ));
        assert!(matches!(
            Graph::new().validate("a"),
            Err(StrataError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_to_dot() {
        let mut g = graph(&["a", "b"]);
        g.add_edge("a", "b").unwrap();
        g.add_conditional_edge("b", |_: &State| [END]).unwrap();
        let dot = g.to_dot();
        assert!(dot.starts_with("digraph strata {"));
        assert!(dot.contains("\"a\" -> \"b\";"));
        assert!(dot.contains("style=dashed"));
    }
}
