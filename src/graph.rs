use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;

use crate::Point;

const EMPTY_GRAPH_JSON: &str = r#"{"nodes":[],"edges":[]}"#;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub position: Point,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind: None,
            position: Point::default(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Trimmed id, label falling back to the id, no blank kind, finite position.
    pub fn normalized(self) -> Self {
        let id = self.id.trim().to_string();
        let label = if self.label.trim().is_empty() {
            id.clone()
        } else {
            self.label
        };
        let position = if self.position.x.is_finite() && self.position.y.is_finite() {
            self.position
        } else {
            Point::default()
        };
        GraphNode {
            id,
            label,
            kind: self.kind.filter(|kind| !kind.trim().is_empty()),
            position,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(skip_serializing_if = "is_false")]
    pub animated: bool,
}

impl GraphEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: edge_identifier(&source, &target),
            source,
            target,
            animated: false,
        }
    }

    pub fn animated(mut self) -> Self {
        self.animated = true;
        self
    }

    pub fn connects(&self, source: &str, target: &str) -> bool {
        self.source == source && self.target == target
    }

    pub fn normalized(self) -> Self {
        let source = self.source.trim().to_string();
        let target = self.target.trim().to_string();
        let id = match self.id.trim() {
            "" => edge_identifier(&source, &target),
            id => id.to_string(),
        };
        GraphEdge {
            id,
            source,
            target,
            animated: self.animated,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

pub fn edge_identifier(source: &str, target: &str) -> String {
    format!("{source}->{target}")
}

/// Node/edge collection shared by templates and diagrams.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Graph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

/// Input accepted by [`Graph::parse`].
#[derive(Debug, Clone)]
pub enum GraphSource<'a> {
    Text(&'a str),
    Value(Value),
}

impl<'a> From<&'a str> for GraphSource<'a> {
    fn from(raw: &'a str) -> Self {
        GraphSource::Text(raw)
    }
}

impl From<Value> for GraphSource<'_> {
    fn from(value: Value) -> Self {
        GraphSource::Value(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("graph encoding is not valid JSON: {0}")]
    Malformed(String),
    #[error("graph does not have the expected shape: {0}")]
    Shape(String),
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        match err.classify() {
            serde_json::error::Category::Syntax | serde_json::error::Category::Eof => {
                GraphError::Malformed(err.to_string())
            }
            _ => GraphError::Shape(err.to_string()),
        }
    }
}

/// Everything the validator removed while repairing a graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDiagnostics {
    pub dropped_edges: Vec<GraphEdge>,
    pub duplicate_nodes: Vec<String>,
    pub blank_nodes: usize,
}

impl GraphDiagnostics {
    pub fn is_clean(&self) -> bool {
        self.dropped_edges.is_empty() && self.duplicate_nodes.is_empty() && self.blank_nodes == 0
    }
}

/// Result of parsing: always carries a usable graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedGraph {
    pub graph: Graph,
    pub diagnostics: GraphDiagnostics,
    pub error: Option<GraphError>,
}

impl ParsedGraph {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(serde_json::Number),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(text) => text.trim().to_string(),
            RawId::Number(number) => number.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawNodeData {
    #[serde(default)]
    label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    id: RawId,
    #[serde(default)]
    label: Option<String>,
    #[serde(default, alias = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: Option<RawNodeData>,
    #[serde(default)]
    position: Option<Point>,
}

impl From<RawNode> for GraphNode {
    fn from(raw: RawNode) -> Self {
        let id = raw.id.into_string();
        let label = raw
            .label
            .or_else(|| raw.data.and_then(|data| data.label))
            .unwrap_or_default();
        GraphNode {
            id,
            label,
            kind: raw.kind,
            position: raw.position.unwrap_or_default(),
        }
        .normalized()
    }
}

#[derive(Debug, Deserialize)]
struct RawEdge {
    #[serde(default)]
    id: Option<RawId>,
    source: RawId,
    target: RawId,
    #[serde(default)]
    animated: Option<bool>,
}

impl From<RawEdge> for GraphEdge {
    fn from(raw: RawEdge) -> Self {
        GraphEdge {
            id: raw.id.map(RawId::into_string).unwrap_or_default(),
            source: raw.source.into_string(),
            target: raw.target.into_string(),
            animated: raw.animated.unwrap_or(false),
        }
        .normalized()
    }
}

#[derive(Debug, Deserialize)]
struct RawGraph {
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default)]
    edges: Vec<RawEdge>,
}

impl RawGraph {
    fn into_graph(self) -> Graph {
        Graph {
            nodes: self.nodes.into_iter().map(GraphNode::from).collect(),
            edges: self.edges.into_iter().map(GraphEdge::from).collect(),
        }
    }
}

impl Graph {
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Self {
        Self { nodes, edges }
    }

    /// Decodes a graph from text or a structured value and validates it.
    ///
    /// Never fails: malformed input produces an empty graph with `error` set.
    pub fn parse<'a>(raw: impl Into<GraphSource<'a>>) -> ParsedGraph {
        let decoded = match raw.into() {
            GraphSource::Text(text) if text.trim().is_empty() => Ok(Graph::default()),
            GraphSource::Text(text) => {
                serde_json::from_str::<RawGraph>(text).map(RawGraph::into_graph)
            }
            GraphSource::Value(Value::Null) => Ok(Graph::default()),
            GraphSource::Value(value) => {
                serde_json::from_value::<RawGraph>(value).map(RawGraph::into_graph)
            }
        };

        match decoded {
            Ok(graph) => {
                let (graph, diagnostics) = graph.validate();
                ParsedGraph {
                    graph,
                    diagnostics,
                    error: None,
                }
            }
            Err(err) => {
                let error = GraphError::from(err);
                tracing::warn!(%error, "substituting empty graph for undecodable input");
                ParsedGraph {
                    error: Some(error),
                    ..ParsedGraph::default()
                }
            }
        }
    }

    /// Decodes the separately stored node and edge arrays of a record.
    ///
    /// Broken edges keep the nodes; broken nodes empty the whole graph.
    pub fn parse_parts(nodes_raw: &str, edges_raw: &str) -> ParsedGraph {
        let nodes = if nodes_raw.trim().is_empty() {
            Ok(Vec::new())
        } else {
            serde_json::from_str::<Vec<RawNode>>(nodes_raw)
        };
        let nodes = match nodes {
            Ok(nodes) => nodes.into_iter().map(GraphNode::from).collect::<Vec<_>>(),
            Err(err) => {
                let error = GraphError::from(err);
                tracing::warn!(%error, "substituting empty graph for undecodable node list");
                return ParsedGraph {
                    error: Some(error),
                    ..ParsedGraph::default()
                };
            }
        };

        let edges = if edges_raw.trim().is_empty() {
            Ok(Vec::new())
        } else {
            serde_json::from_str::<Vec<RawEdge>>(edges_raw)
        };
        let (edges, error) = match edges {
            Ok(edges) => (edges.into_iter().map(GraphEdge::from).collect(), None),
            Err(err) => {
                let error = GraphError::from(err);
                tracing::warn!(%error, "dropping undecodable edge list");
                (Vec::new(), Some(error))
            }
        };

        let (graph, diagnostics) = Graph::new(nodes, edges).validate();
        ParsedGraph {
            graph,
            diagnostics,
            error,
        }
    }

    /// Repairs the graph: ids are trimmed, blank labels take the node id,
    /// blank and duplicate node ids are dropped, as are edges whose
    /// endpoints are not nodes of this graph.
    pub fn validate(self) -> (Graph, GraphDiagnostics) {
        let mut diagnostics = GraphDiagnostics::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut nodes = Vec::with_capacity(self.nodes.len());

        for node in self.nodes.into_iter().map(GraphNode::normalized) {
            if node.id.is_empty() {
                diagnostics.blank_nodes += 1;
                continue;
            }
            if !seen.insert(node.id.clone()) {
                diagnostics.duplicate_nodes.push(node.id);
                continue;
            }
            nodes.push(node);
        }

        let mut edges = Vec::with_capacity(self.edges.len());
        for edge in self.edges.into_iter().map(GraphEdge::normalized) {
            if seen.contains(&edge.source) && seen.contains(&edge.target) {
                edges.push(edge);
            } else {
                tracing::warn!(
                    edge = %edge.id,
                    source = %edge.source,
                    target = %edge.target,
                    "dropping edge with dangling endpoint"
                );
                diagnostics.dropped_edges.push(edge);
            }
        }

        if !diagnostics.duplicate_nodes.is_empty() || diagnostics.blank_nodes > 0 {
            tracing::warn!(
                duplicates = diagnostics.duplicate_nodes.len(),
                blank = diagnostics.blank_nodes,
                "dropped invalid nodes while validating graph"
            );
        }

        (Graph { nodes, edges }, diagnostics)
    }

    pub fn validated(self) -> Graph {
        self.validate().0
    }

    pub fn serialize(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| EMPTY_GRAPH_JSON.to_string())
    }

    pub fn serialize_nodes(&self) -> String {
        serde_json::to_string(&self.nodes).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn serialize_edges(&self) -> String {
        serde_json::to_string(&self.edges).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.iter().any(|node| node.id == id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|node| node.id.as_str())
    }

    pub fn edge(&self, id: &str) -> Option<&GraphEdge> {
        self.edges.iter().find(|edge| edge.id == id)
    }

    pub fn remove_node(&mut self, node_id: &str) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|node| node.id != node_id);
        let existed = self.nodes.len() != before;
        if existed {
            self.edges
                .retain(|edge| edge.source != node_id && edge.target != node_id);
        }
        existed
    }

    pub fn remove_edge(&mut self, edge_id: &str) -> bool {
        let before = self.edges.len();
        self.edges.retain(|edge| edge.id != edge_id);
        self.edges.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn abc() -> Graph {
        Graph::new(
            vec![
                GraphNode::new("a", "Start"),
                GraphNode::new("b", "Review").with_kind("task"),
                GraphNode::new("c", "End"),
            ],
            vec![GraphEdge::new("a", "b"), GraphEdge::new("b", "c").animated()],
        )
    }

    #[test]
    fn parses_canonical_text() {
        let parsed = Graph::parse(
            r#"{"nodes":[{"id":"a","label":"Start","position":{"x":10,"y":20}},{"id":"b","label":"End"}],
                "edges":[{"source":"a","target":"b","animated":true}]}"#,
        );
        assert!(parsed.is_ok());
        assert_eq!(parsed.graph.nodes.len(), 2);
        assert_eq!(parsed.graph.nodes[0].position, Point::new(10.0, 20.0));
        assert_eq!(parsed.graph.edges[0].id, "a->b");
        assert!(parsed.graph.edges[0].animated);
    }

    #[test]
    fn parses_react_flow_shape_with_numeric_ids() {
        let value = json!({
            "nodes": [
                {"id": 1, "type": "input", "data": {"label": "Intake"}},
                {"id": "2", "data": {}}
            ],
            "edges": [{"id": "e1-2", "source": 1, "target": "2"}]
        });
        let parsed = Graph::parse(value);
        assert!(parsed.is_ok());
        assert_eq!(parsed.graph.nodes[0].id, "1");
        assert_eq!(parsed.graph.nodes[0].label, "Intake");
        assert_eq!(parsed.graph.nodes[0].kind.as_deref(), Some("input"));
        assert_eq!(parsed.graph.nodes[1].label, "2");
        assert_eq!(parsed.graph.edges[0].id, "e1-2");
    }

    #[test]
    fn malformed_text_yields_empty_graph_with_error() {
        let parsed = Graph::parse("{not json");
        assert!(parsed.graph.is_empty());
        assert!(matches!(parsed.error, Some(GraphError::Malformed(_))));
    }

    #[test]
    fn non_conforming_value_yields_empty_graph_with_error() {
        let parsed = Graph::parse(json!({"nodes": "oops"}));
        assert!(parsed.graph.is_empty());
        assert!(matches!(parsed.error, Some(GraphError::Shape(_))));

        let parsed = Graph::parse(json!([1, 2, 3]));
        assert!(parsed.graph.is_empty());
        assert!(parsed.error.is_some());
    }

    #[test]
    fn blank_input_is_an_empty_graph_without_error() {
        let parsed = Graph::parse("   ");
        assert!(parsed.is_ok());
        assert!(parsed.graph.is_empty());
    }

    #[test]
    fn validate_drops_only_dangling_edges() {
        let mut graph = abc();
        graph.edges.insert(1, GraphEdge::new("x", "y"));
        graph.edges.push(GraphEdge::new("a", "ghost"));

        let (validated, diagnostics) = graph.validate();

        let ids: Vec<_> = validated.edges.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a->b", "b->c"]);
        let dropped: Vec<_> = diagnostics.dropped_edges.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(dropped, vec!["x->y", "a->ghost"]);
    }

    #[test]
    fn validate_keeps_first_of_duplicate_nodes() {
        let graph = Graph::new(
            vec![
                GraphNode::new("a", "First"),
                GraphNode::new("a", "Second"),
                GraphNode::new("", "Blank"),
            ],
            Vec::new(),
        );
        let (validated, diagnostics) = graph.validate();
        assert_eq!(validated.nodes.len(), 1);
        assert_eq!(validated.nodes[0].label, "First");
        assert_eq!(diagnostics.duplicate_nodes, vec!["a".to_string()]);
        assert_eq!(diagnostics.blank_nodes, 1);
        assert!(!diagnostics.is_clean());
    }

    #[test]
    fn round_trip_matches_validation() {
        let mut graph = abc();
        graph.edges.push(GraphEdge::new("c", "missing"));

        let reparsed = Graph::parse(graph.serialize().as_str());
        assert!(reparsed.is_ok());
        assert_eq!(reparsed.graph, graph.clone().validated());
    }

    #[test]
    fn round_trip_normalizes_blank_labels_and_padded_ids() {
        let graph = Graph::new(
            vec![
                GraphNode::new("a", ""),
                GraphNode::new(" b", "B").with_kind("  "),
            ],
            vec![GraphEdge::new("a", " b")],
        );

        let validated = graph.clone().validated();
        assert_eq!(validated.nodes[0].label, "a");
        assert_eq!(validated.nodes[1].id, "b");
        assert_eq!(validated.nodes[1].kind, None);
        assert_eq!(validated.edges[0].id, "a-> b");
        assert_eq!(validated.edges[0].target, "b");

        let reparsed = Graph::parse(graph.serialize().as_str());
        assert_eq!(reparsed.graph, validated);
        let from_parts = Graph::parse_parts(&graph.serialize_nodes(), &graph.serialize_edges());
        assert_eq!(from_parts.graph, validated);
    }

    #[test]
    fn parse_parts_keeps_nodes_when_edges_are_broken() {
        let graph = abc();
        let parsed = Graph::parse_parts(&graph.serialize_nodes(), "[{\"source\":");
        assert_eq!(parsed.graph.nodes, graph.nodes);
        assert!(parsed.graph.edges.is_empty());
        assert!(parsed.error.is_some());

        let parsed = Graph::parse_parts("nope", &graph.serialize_edges());
        assert!(parsed.graph.is_empty());
        assert!(parsed.error.is_some());
    }

    #[test]
    fn remove_node_drops_incident_edges() {
        let mut graph = abc();
        assert!(graph.remove_node("b"));
        assert!(graph.edges.is_empty());
        assert!(!graph.remove_node("b"));
    }
}
