use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use crate::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagramStatus {
    /// Edited in memory, not yet confirmed by the store.
    #[default]
    Draft,
    Saved,
}

/// An instantiated copy of a template graph with entity bindings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagram {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub project_id: Option<i64>,
    pub document_id: Option<i64>,
    pub template_id: i64,
    #[serde(flatten)]
    pub graph: Graph,
    pub node_entities: BTreeMap<String, Option<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout_override: Option<LayoutDirection>,
    pub status: DiagramStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Diagram {
    pub fn binding(&self, node_id: &str) -> Option<i64> {
        self.node_entities.get(node_id).copied().flatten()
    }

    /// Binds or unbinds one node. `Some(0)` is treated as unbound.
    pub fn set_binding(&mut self, node_id: &str, entity_id: Option<i64>) -> Result<()> {
        if !self.graph.contains_node(node_id) {
            return Err(Error::NodeNotInDiagram {
                diagram_id: self.id,
                node_id: node_id.to_string(),
            });
        }
        let entity_id = entity_id.filter(|&id| id != 0);
        self.node_entities.insert(node_id.to_string(), entity_id);
        self.touch();
        Ok(())
    }

    /// Appends a diagram-local edge. An identical edge is returned as is.
    pub fn add_edge(&mut self, source: &str, target: &str) -> Result<GraphEdge> {
        for endpoint in [source, target] {
            if !self.graph.contains_node(endpoint) {
                return Err(Error::NodeNotInDiagram {
                    diagram_id: self.id,
                    node_id: endpoint.to_string(),
                });
            }
        }
        if let Some(existing) = self.graph.edges.iter().find(|e| e.connects(source, target)) {
            return Ok(existing.clone());
        }

        let mut edge = GraphEdge::new(source, target);
        if self.graph.edge(&edge.id).is_some() {
            edge.id = format!("{}#{}", edge.id, self.graph.edges.len());
        }
        self.graph.edges.push(edge.clone());
        self.touch();
        Ok(edge)
    }

    pub fn remove_edge(&mut self, edge_id: &str) -> Result<()> {
        if !self.graph.remove_edge(edge_id) {
            return Err(Error::not_found("edge", edge_id));
        }
        self.touch();
        Ok(())
    }

    pub fn add_node(&mut self, node: GraphNode) -> Result<GraphNode> {
        let node = node.normalized();
        if node.id.is_empty() {
            return Err(Error::validation("node id must not be empty"));
        }
        if self.graph.contains_node(&node.id) {
            return Err(Error::validation(format!(
                "node '{}' already exists in diagram {}",
                node.id, self.id
            )));
        }
        self.node_entities.insert(node.id.clone(), None);
        self.graph.nodes.push(node.clone());
        self.touch();
        Ok(node)
    }

    /// Removes the node, its incident edges and its binding.
    pub fn remove_node(&mut self, node_id: &str) -> Result<()> {
        if !self.graph.remove_node(node_id) {
            return Err(Error::NodeNotInDiagram {
                diagram_id: self.id,
                node_id: node_id.to_string(),
            });
        }
        self.node_entities.remove(node_id);
        self.touch();
        Ok(())
    }

    /// Restores the mapping invariant: one key per node, nothing else.
    pub fn sync_bindings(&mut self) {
        let graph = &self.graph;
        self.node_entities.retain(|node_id, _| graph.contains_node(node_id));
        for node in &graph.nodes {
            self.node_entities.entry(node.id.clone()).or_insert(None);
        }
    }

    pub fn mark_saved(&mut self) {
        self.status = DiagramStatus::Saved;
    }

    fn touch(&mut self) {
        self.status = DiagramStatus::Draft;
        self.updated_at = Utc::now();
    }

    pub fn encode_node_entities(&self) -> String {
        serde_json::to_string(&self.node_entities).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Reads a persisted binding map. `0` and `null` mean unbound; unreadable
/// input yields an empty map.
pub fn decode_node_entities(raw: &str) -> BTreeMap<String, Option<i64>> {
    if raw.trim().is_empty() {
        return BTreeMap::new();
    }
    match serde_json::from_str::<BTreeMap<String, Option<i64>>>(raw) {
        Ok(map) => map
            .into_iter()
            .map(|(node, entity)| (node, entity.filter(|&id| id != 0)))
            .collect(),
        Err(error) => {
            tracing::warn!(%error, "ignoring unreadable node entity map");
            BTreeMap::new()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagramDraft {
    pub template_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub project_id: Option<i64>,
    #[serde(default)]
    pub document_id: Option<i64>,
}

impl DiagramDraft {
    pub fn new(template_id: i64, name: impl Into<String>) -> Self {
        Self {
            template_id,
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Partial update; `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagramPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub project_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "present")]
    pub document_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "present")]
    pub layout_override: Option<Option<LayoutDirection>>,
}

fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Default)]
pub struct DiagramStore {
    diagrams: BTreeMap<i64, Diagram>,
    next_id: i64,
}

impl DiagramStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> Vec<Diagram> {
        self.diagrams.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagram> {
        self.diagrams.values()
    }

    pub fn get(&self, id: i64) -> Option<&Diagram> {
        self.diagrams.get(&id)
    }

    pub fn get_mut(&mut self, id: i64) -> Result<&mut Diagram> {
        self.diagrams
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("diagram", id))
    }

    pub fn len(&self) -> usize {
        self.diagrams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagrams.is_empty()
    }

    pub fn allocate_id(&self) -> i64 {
        self.next_id.max(1)
    }

    pub fn reserve_ids(&mut self, last_id: i64) {
        self.next_id = self.next_id.max(last_id + 1);
    }

    pub fn insert(&mut self, diagram: Diagram) {
        self.next_id = self.next_id.max(diagram.id + 1);
        self.diagrams.insert(diagram.id, diagram);
    }

    pub fn remove(&mut self, id: i64) -> Result<Diagram> {
        self.diagrams
            .remove(&id)
            .ok_or_else(|| Error::not_found("diagram", id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedNode {
    pub id: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub position: Point,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_label: Option<String>,
}

impl RenderedNode {
    pub fn display_label(&self) -> String {
        match &self.entity_label {
            Some(entity) => format!("{} ({entity})", self.label),
            None => self.label.clone(),
        }
    }
}

/// Laid-out diagram with resolved entity names, ready for drawing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedDiagram {
    pub diagram_id: i64,
    pub name: String,
    pub direction: LayoutDirection,
    pub nodes: Vec<RenderedNode>,
    pub edges: Vec<GraphEdge>,
    pub entity_labels: BTreeMap<String, String>,
    pub size: CanvasSize,
}

impl RenderedDiagram {
    pub fn node(&self, node_id: &str) -> Option<&RenderedNode> {
        self.nodes.iter().find(|node| node.id == node_id)
    }
}
