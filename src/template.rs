use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::*;

/// A reusable, named graph plus its default layout direction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub layout_direction: LayoutDirection,
    #[serde(flatten)]
    pub graph: Graph,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when creating or replacing a template.
///
/// `nodes` and `edges` are left as raw JSON so that malformed payloads go
/// through the graph model's repair path instead of being rejected by serde.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "layout")]
    pub layout_direction: LayoutDirection,
    #[serde(default)]
    pub nodes: Value,
    #[serde(default)]
    pub edges: Value,
}

impl TemplateDraft {
    pub fn new(name: impl Into<String>, direction: LayoutDirection, graph: &Graph) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            layout_direction: direction,
            nodes: serde_json::to_value(&graph.nodes).unwrap_or(Value::Null),
            edges: serde_json::to_value(&graph.edges).unwrap_or(Value::Null),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    fn parse_graph(&self) -> Result<(Graph, GraphDiagnostics)> {
        let parsed = Graph::parse(serde_json::json!({
            "nodes": non_null(&self.nodes),
            "edges": non_null(&self.edges),
        }));
        if let Some(error) = parsed.error {
            return Err(Error::validation(error.to_string()));
        }
        Ok((parsed.graph, parsed.diagnostics))
    }
}

fn non_null(value: &Value) -> Value {
    match value {
        Value::Null => Value::Array(Vec::new()),
        other => other.clone(),
    }
}

/// Owns every template, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    templates: BTreeMap<i64, Template>,
    next_id: i64,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> Vec<Template> {
        self.templates.values().cloned().collect()
    }

    pub fn get(&self, id: i64) -> Option<&Template> {
        self.templates.get(&id)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Creates a template. Dangling edges are dropped and reported back.
    pub fn create(&mut self, draft: TemplateDraft) -> Result<(Template, GraphDiagnostics)> {
        let name = draft.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::validation("template name must not be empty"));
        }
        let (graph, diagnostics) = draft.parse_graph()?;

        let now = Utc::now();
        let template = Template {
            id: self.next_id.max(1),
            name,
            description: draft.description.trim().to_string(),
            layout_direction: draft.layout_direction,
            graph,
            created_at: now,
            updated_at: now,
        };
        self.insert(template.clone());
        Ok((template, diagnostics))
    }

    /// Edits in place. Diagrams created earlier keep their own copy.
    pub fn update(
        &mut self,
        id: i64,
        draft: TemplateDraft,
    ) -> Result<(Template, GraphDiagnostics)> {
        let name = draft.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::validation("template name must not be empty"));
        }
        let (graph, diagnostics) = draft.parse_graph()?;

        let template = self
            .templates
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("template", id))?;
        template.name = name;
        template.description = draft.description.trim().to_string();
        template.layout_direction = draft.layout_direction;
        template.graph = graph;
        template.updated_at = Utc::now();
        Ok((template.clone(), diagnostics))
    }

    /// Always allowed; diagrams keep `template_id` only as provenance.
    pub fn delete(&mut self, id: i64) -> Result<Template> {
        self.templates
            .remove(&id)
            .ok_or_else(|| Error::not_found("template", id))
    }

    pub fn reserve_ids(&mut self, last_id: i64) {
        self.next_id = self.next_id.max(last_id + 1);
    }

    pub fn insert(&mut self, template: Template) {
        self.next_id = self.next_id.max(template.id + 1);
        self.templates.insert(template.id, template);
    }
}
