use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::*;

/// Templates, diagrams and the entity registry, with the operations that
/// span more than one of them.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    pub registry: EntityRegistry,
    pub templates: TemplateStore,
    pub diagrams: DiagramStore,
    pub layout_options: LayoutOptions,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layout_options(mut self, options: LayoutOptions) -> Self {
        self.layout_options = options;
        self
    }

    pub fn delete_category(&mut self, id: i64) -> Result<EntityCategory> {
        match self.registry.delete_category(id) {
            Ok(category) => {
                info!(category = id, "deleted entity category");
                Ok(category)
            }
            Err(err) => {
                warn!(category = id, %err, "refusing to delete entity category");
                Err(err)
            }
        }
    }

    pub fn delete_entity(&mut self, id: i64) -> Result<Entity> {
        let entity = self.registry.delete_entity(id)?;
        let dangling = self
            .diagrams
            .iter()
            .filter(|diagram| diagram.node_entities.values().any(|bound| *bound == Some(id)))
            .count();
        if dangling > 0 {
            info!(entity = id, diagrams = dangling, "entity deleted while still bound");
        }
        Ok(entity)
    }

    pub fn delete_template(&mut self, id: i64) -> Result<Template> {
        let template = self.templates.delete(id)?;
        let derived = self
            .diagrams
            .iter()
            .filter(|diagram| diagram.template_id == id)
            .count();
        info!(template = id, derived, "deleted template");
        Ok(template)
    }

    /// Copies the template's current graph into a new diagram with every
    /// node unbound.
    pub fn instantiate(&mut self, draft: DiagramDraft) -> Result<Diagram> {
        let name = draft.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::validation("diagram name must not be empty"));
        }
        let template = self
            .templates
            .get(draft.template_id)
            .ok_or_else(|| Error::not_found("template", draft.template_id))?;

        let now = Utc::now();
        let mut diagram = Diagram {
            id: self.diagrams.allocate_id(),
            name,
            description: draft.description.trim().to_string(),
            project_id: draft.project_id,
            document_id: draft.document_id,
            template_id: template.id,
            graph: template.graph.clone(),
            node_entities: BTreeMap::new(),
            layout_override: None,
            status: DiagramStatus::Draft,
            created_at: now,
            updated_at: now,
        };
        diagram.sync_bindings();

        info!(
            diagram = diagram.id,
            template = template.id,
            nodes = diagram.graph.nodes.len(),
            "instantiated diagram from template"
        );
        self.diagrams.insert(diagram.clone());
        Ok(diagram)
    }

    /// Binds `node_id` to an entity, or unbinds it with `None`/`Some(0)`.
    pub fn bind_entity(
        &mut self,
        diagram_id: i64,
        node_id: &str,
        entity_id: Option<i64>,
    ) -> Result<Diagram> {
        if let Some(id) = entity_id.filter(|&id| id != 0) {
            if self.registry.entity(id).is_none() {
                return Err(Error::not_found("entity", id));
            }
        }
        let diagram = self.diagrams.get_mut(diagram_id)?;
        diagram.set_binding(node_id, entity_id)?;
        debug!(diagram = diagram_id, node = node_id, ?entity_id, "updated node binding");
        Ok(diagram.clone())
    }

    pub fn add_manual_edge(
        &mut self,
        diagram_id: i64,
        source: &str,
        target: &str,
    ) -> Result<GraphEdge> {
        let edge = self.diagrams.get_mut(diagram_id)?.add_edge(source, target)?;
        debug!(diagram = diagram_id, edge = %edge.id, "added diagram edge");
        Ok(edge)
    }

    pub fn remove_edge(&mut self, diagram_id: i64, edge_id: &str) -> Result<()> {
        self.diagrams.get_mut(diagram_id)?.remove_edge(edge_id)
    }

    pub fn add_node(&mut self, diagram_id: i64, node: GraphNode) -> Result<GraphNode> {
        self.diagrams.get_mut(diagram_id)?.add_node(node)
    }

    pub fn remove_node(&mut self, diagram_id: i64, node_id: &str) -> Result<()> {
        self.diagrams.get_mut(diagram_id)?.remove_node(node_id)
    }

    pub fn update_diagram(&mut self, diagram_id: i64, patch: DiagramPatch) -> Result<Diagram> {
        let diagram = self.diagrams.get_mut(diagram_id)?;
        if let Some(name) = patch.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(Error::validation("diagram name must not be empty"));
            }
            diagram.name = name;
        }
        if let Some(description) = patch.description {
            diagram.description = description.trim().to_string();
        }
        if let Some(project_id) = patch.project_id {
            diagram.project_id = project_id;
        }
        if let Some(document_id) = patch.document_id {
            diagram.document_id = document_id;
        }
        if let Some(layout_override) = patch.layout_override {
            diagram.layout_override = layout_override;
        }
        diagram.status = DiagramStatus::Draft;
        diagram.updated_at = Utc::now();
        Ok(diagram.clone())
    }

    /// Replaces the diagram's graph with the template's current one.
    /// Bindings survive for node ids present in both.
    pub fn resync_from_template(&mut self, diagram_id: i64) -> Result<Diagram> {
        let template_id = self
            .diagrams
            .get(diagram_id)
            .ok_or_else(|| Error::not_found("diagram", diagram_id))?
            .template_id;
        let graph = self
            .templates
            .get(template_id)
            .ok_or_else(|| Error::not_found("template", template_id))?
            .graph
            .clone();

        let diagram = self.diagrams.get_mut(diagram_id)?;
        diagram.graph = graph;
        diagram.sync_bindings();
        diagram.status = DiagramStatus::Draft;
        diagram.updated_at = Utc::now();
        info!(diagram = diagram_id, template = template_id, "resynced diagram from template");
        Ok(diagram.clone())
    }

    pub fn delete_diagram(&mut self, diagram_id: i64) -> Result<Diagram> {
        let diagram = self.diagrams.remove(diagram_id)?;
        info!(diagram = diagram_id, "deleted diagram");
        Ok(diagram)
    }

    pub fn mark_saved(&mut self, diagram_id: i64) -> Result<()> {
        self.diagrams.get_mut(diagram_id)?.mark_saved();
        Ok(())
    }

    /// Override first, then the originating template, then top-down.
    pub fn diagram_direction(&self, diagram: &Diagram) -> LayoutDirection {
        if let Some(direction) = diagram.layout_override {
            return direction;
        }
        match self.templates.get(diagram.template_id) {
            Some(template) => template.layout_direction,
            None => {
                warn!(
                    diagram = diagram.id,
                    template = diagram.template_id,
                    "originating template is gone, falling back to top-down"
                );
                LayoutDirection::TopDown
            }
        }
    }

    /// Resolves entity names and lays the diagram out.
    pub fn render(&self, diagram_id: i64) -> Result<RenderedDiagram> {
        let diagram = self
            .diagrams
            .get(diagram_id)
            .ok_or_else(|| Error::not_found("diagram", diagram_id))?;
        let direction = self.diagram_direction(diagram);
        let layout = layout(&diagram.graph, direction, &self.layout_options);

        let mut entity_labels = BTreeMap::new();
        let nodes = layout
            .nodes
            .iter()
            .map(|node| {
                let entity_id = diagram.binding(&node.id);
                let entity_label = entity_id
                    .map(|id| self.registry.entity_display_name(Some(id)).to_string());
                if let Some(label) = &entity_label {
                    entity_labels.insert(node.id.clone(), label.clone());
                }
                RenderedNode {
                    id: node.id.clone(),
                    label: node.label.clone(),
                    kind: node.kind.clone(),
                    position: node.position,
                    rank: layout.rank(&node.id),
                    entity_id,
                    entity_label,
                }
            })
            .collect();

        Ok(RenderedDiagram {
            diagram_id,
            name: diagram.name.clone(),
            direction,
            nodes,
            edges: diagram.graph.edges.clone(),
            entity_labels,
            size: layout.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        workspace: Workspace,
        template: Template,
        entity: Entity,
    }

    fn fixture() -> Fixture {
        let mut workspace = Workspace::new();
        let graph = Graph::new(
            vec![
                GraphNode::new("A", "Start"),
                GraphNode::new("B", "Review"),
                GraphNode::new("C", "End"),
            ],
            vec![GraphEdge::new("A", "B"), GraphEdge::new("B", "C")],
        );
        let (template, _) = workspace
            .templates
            .create(TemplateDraft::new("T1", LayoutDirection::TopDown, &graph))
            .unwrap();
        let category = workspace
            .registry
            .create_category(CategoryDraft::new("Reviewers"))
            .unwrap();
        let entity = workspace
            .registry
            .create_entity(EntityDraft::new("Quality Team", category.id))
            .unwrap();
        Fixture {
            workspace,
            template,
            entity,
        }
    }

    #[test]
    fn instantiate_copies_graph_and_leaves_nodes_unbound() {
        let Fixture {
            mut workspace,
            template,
            ..
        } = fixture();
        let diagram = workspace
            .instantiate(DiagramDraft::new(template.id, "D1"))
            .unwrap();

        assert_eq!(diagram.graph, template.graph);
        assert_eq!(diagram.node_entities.len(), 3);
        assert!(diagram.node_entities.values().all(Option::is_none));
        assert_eq!(diagram.status, DiagramStatus::Draft);
    }

    #[test]
    fn instantiate_requires_template_and_name() {
        let Fixture {
            mut workspace,
            template,
            ..
        } = fixture();
        assert!(matches!(
            workspace.instantiate(DiagramDraft::new(99, "D")),
            Err(Error::NotFound { kind: "template", .. })
        ));
        assert!(matches!(
            workspace.instantiate(DiagramDraft::new(template.id, "  ")),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn template_edits_do_not_reach_existing_diagrams() {
        let Fixture {
            mut workspace,
            template,
            ..
        } = fixture();
        let diagram = workspace
            .instantiate(DiagramDraft::new(template.id, "D1"))
            .unwrap();
        let before = workspace.render(diagram.id).unwrap();

        let replacement = Graph::new(vec![GraphNode::new("Z", "Only")], Vec::new());
        workspace
            .templates
            .update(
                template.id,
                TemplateDraft::new("T1", LayoutDirection::TopDown, &replacement),
            )
            .unwrap();

        assert_eq!(workspace.diagrams.get(diagram.id).unwrap().graph, diagram.graph);
        assert_eq!(workspace.render(diagram.id).unwrap(), before);
    }

    #[test]
    fn binding_sentinel_round_trip() {
        let Fixture {
            mut workspace,
            template,
            entity,
        } = fixture();
        let diagram = workspace
            .instantiate(DiagramDraft::new(template.id, "D1"))
            .unwrap();

        workspace.bind_entity(diagram.id, "B", None).unwrap();
        let rendered = workspace.render(diagram.id).unwrap();
        assert_eq!(rendered.node("B").unwrap().entity_label, None);
        assert!(rendered.entity_labels.is_empty());

        workspace.bind_entity(diagram.id, "B", Some(entity.id)).unwrap();
        let rendered = workspace.render(diagram.id).unwrap();
        assert_eq!(
            rendered.node("B").unwrap().entity_label.as_deref(),
            Some("Quality Team")
        );
        assert_eq!(rendered.entity_labels.len(), 1);
    }

    #[test]
    fn bind_rejects_unknown_node_and_entity() {
        let Fixture {
            mut workspace,
            template,
            entity,
        } = fixture();
        let diagram = workspace
            .instantiate(DiagramDraft::new(template.id, "D1"))
            .unwrap();

        assert!(matches!(
            workspace.bind_entity(diagram.id, "Q", Some(entity.id)),
            Err(Error::NodeNotInDiagram { .. })
        ));
        assert!(matches!(
            workspace.bind_entity(diagram.id, "B", Some(777)),
            Err(Error::NotFound { kind: "entity", .. })
        ));
        assert_eq!(workspace.diagrams.get(diagram.id).unwrap().binding("B"), None);
    }

    #[test]
    fn bind_checks_diagram_nodes_not_template_nodes() {
        let Fixture {
            mut workspace,
            template,
            entity,
        } = fixture();
        let diagram = workspace
            .instantiate(DiagramDraft::new(template.id, "D1"))
            .unwrap();
        workspace
            .add_node(diagram.id, GraphNode::new("D", "Escalate"))
            .unwrap();
        workspace.bind_entity(diagram.id, "D", Some(entity.id)).unwrap();

        workspace.remove_node(diagram.id, "A").unwrap();
        assert!(workspace.bind_entity(diagram.id, "A", None).is_err());
    }

    #[test]
    fn deleted_entity_renders_as_unknown() {
        let Fixture {
            mut workspace,
            template,
            entity,
        } = fixture();
        let diagram = workspace
            .instantiate(DiagramDraft::new(template.id, "D1"))
            .unwrap();
        workspace.bind_entity(diagram.id, "C", Some(entity.id)).unwrap();
        workspace.delete_entity(entity.id).unwrap();

        let rendered = workspace.render(diagram.id).unwrap();
        assert_eq!(rendered.entity_labels.get("C").map(String::as_str), Some("Unknown"));
    }

    #[test]
    fn manual_edges_stay_local_to_the_diagram() {
        let Fixture {
            mut workspace,
            template,
            ..
        } = fixture();
        let diagram = workspace
            .instantiate(DiagramDraft::new(template.id, "D1"))
            .unwrap();
        let edge = workspace.add_manual_edge(diagram.id, "A", "C").unwrap();

        assert_eq!(workspace.diagrams.get(diagram.id).unwrap().graph.edges.len(), 3);
        assert_eq!(workspace.templates.get(template.id).unwrap().graph.edges.len(), 2);

        workspace.remove_edge(diagram.id, &edge.id).unwrap();
        assert!(workspace.remove_edge(diagram.id, &edge.id).is_err());
    }

    #[test]
    fn resync_keeps_bindings_of_surviving_nodes() {
        let Fixture {
            mut workspace,
            template,
            entity,
        } = fixture();
        let diagram = workspace
            .instantiate(DiagramDraft::new(template.id, "D1"))
            .unwrap();
        workspace.bind_entity(diagram.id, "B", Some(entity.id)).unwrap();
        workspace.bind_entity(diagram.id, "C", Some(entity.id)).unwrap();

        let graph = Graph::new(
            vec![GraphNode::new("B", "Review"), GraphNode::new("E", "Sign-off")],
            vec![GraphEdge::new("B", "E")],
        );
        workspace
            .templates
            .update(template.id, TemplateDraft::new("T1", LayoutDirection::LeftRight, &graph))
            .unwrap();

        let synced = workspace.resync_from_template(diagram.id).unwrap();
        assert_eq!(synced.graph, graph);
        assert_eq!(synced.binding("B"), Some(entity.id));
        assert_eq!(synced.node_entities.get("E"), Some(&None));
        assert!(!synced.node_entities.contains_key("C"));
    }

    #[test]
    fn direction_prefers_override_then_template_then_default() {
        let Fixture {
            mut workspace,
            template,
            ..
        } = fixture();
        let diagram = workspace
            .instantiate(DiagramDraft::new(template.id, "D1"))
            .unwrap();
        assert_eq!(workspace.render(diagram.id).unwrap().direction, LayoutDirection::TopDown);

        workspace
            .update_diagram(
                diagram.id,
                DiagramPatch {
                    layout_override: Some(Some(LayoutDirection::Grid)),
                    ..DiagramPatch::default()
                },
            )
            .unwrap();
        assert_eq!(workspace.render(diagram.id).unwrap().direction, LayoutDirection::Grid);

        workspace
            .update_diagram(
                diagram.id,
                DiagramPatch {
                    layout_override: Some(None),
                    ..DiagramPatch::default()
                },
            )
            .unwrap();
        workspace.delete_template(template.id).unwrap();
        let rendered = workspace.render(diagram.id).unwrap();
        assert_eq!(rendered.direction, LayoutDirection::TopDown);
        assert_eq!(rendered.nodes.len(), 3);
    }

    #[test]
    fn category_guard_goes_through_workspace() {
        let Fixture {
            mut workspace,
            entity,
            ..
        } = fixture();
        let category_id = entity.category_id;
        assert!(matches!(
            workspace.delete_category(category_id),
            Err(Error::CategoryInUse { .. })
        ));
        workspace.delete_entity(entity.id).unwrap();
        workspace.delete_category(category_id).unwrap();
    }

    #[test]
    fn delete_diagram_is_unconditional() {
        let Fixture {
            mut workspace,
            template,
            entity,
        } = fixture();
        let diagram = workspace
            .instantiate(DiagramDraft::new(template.id, "D1"))
            .unwrap();
        workspace.bind_entity(diagram.id, "A", Some(entity.id)).unwrap();
        workspace.delete_diagram(diagram.id).unwrap();

        assert!(workspace.render(diagram.id).is_err());
        assert!(workspace.templates.get(template.id).is_some());
        assert!(workspace.registry.entity(entity.id).is_some());
    }
}
