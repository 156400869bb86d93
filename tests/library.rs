use anyhow::Result;
use pidraw::{
    CategoryDraft, DiagramDraft, EntityDraft, Error, Graph, GraphEdge, GraphNode, LayoutDirection,
    LayoutOptions, TemplateDraft, Workspace, render_svg,
};

fn approval_template() -> TemplateDraft {
    let graph = Graph::new(
        vec![
            GraphNode::new("A", "Start"),
            GraphNode::new("B", "Review"),
            GraphNode::new("C", "End"),
        ],
        vec![GraphEdge::new("A", "B"), GraphEdge::new("B", "C")],
    );
    TemplateDraft::new("T1", LayoutDirection::TopDown, &graph)
}

#[test]
fn template_instantiation_binding_and_render() -> Result<()> {
    let mut workspace = Workspace::new();
    let (template, diagnostics) = workspace.templates.create(approval_template())?;
    assert!(diagnostics.is_clean());

    let diagram = workspace.instantiate(DiagramDraft::new(template.id, "D1"))?;
    let rendered = workspace.render(diagram.id)?;
    let (a, b, c) = (
        rendered.node("A").unwrap(),
        rendered.node("B").unwrap(),
        rendered.node("C").unwrap(),
    );
    assert_eq!((a.rank, b.rank, c.rank), (Some(0), Some(1), Some(2)));
    assert!(a.position.y < b.position.y && b.position.y < c.position.y);
    assert_eq!(a.position.x, b.position.x);
    assert_eq!(b.position.x, c.position.x);

    let reviewers = workspace
        .registry
        .create_category(CategoryDraft::new("Reviewers"))?;
    let quality = workspace
        .registry
        .create_entity(EntityDraft::new("Quality Team", reviewers.id))?;
    workspace.bind_entity(diagram.id, "B", Some(quality.id))?;

    let rendered = workspace.render(diagram.id)?;
    assert!(rendered.node("B").unwrap().display_label().contains("Quality Team"));
    assert_eq!(rendered.node("A").unwrap().entity_label, None);
    assert_eq!(rendered.node("C").unwrap().entity_label, None);
    assert_eq!(rendered.entity_labels.len(), 1);

    let svg = render_svg(&rendered, "white", &LayoutOptions::default())?;
    assert!(svg.contains("<svg"), "rendered svg should contain root element");
    assert!(svg.contains("Quality Team"), "entity names should appear in output");

    Ok(())
}

#[test]
fn stored_graph_text_round_trips() -> Result<()> {
    let mut workspace = Workspace::new();
    let (template, _) = workspace.templates.create(approval_template())?;

    let reparsed = Graph::parse_parts(
        &template.graph.serialize_nodes(),
        &template.graph.serialize_edges(),
    );
    assert!(reparsed.is_ok());
    assert_eq!(reparsed.graph, template.graph);

    let whole = Graph::parse(template.graph.serialize().as_str());
    assert_eq!(whole.graph, template.graph);
    Ok(())
}

#[test]
fn registry_guards_categories_in_use() -> Result<()> {
    let mut workspace = Workspace::new();
    let category = workspace
        .registry
        .create_category(CategoryDraft::new("Vendors"))?;
    let entity = workspace
        .registry
        .create_entity(EntityDraft::new("Acme", category.id))?;

    let err = workspace.delete_category(category.id).unwrap_err();
    assert_eq!(
        err,
        Error::CategoryInUse {
            id: category.id,
            entity_count: 1
        }
    );
    assert_eq!(err.to_string(), "category 1 is in use by 1 entity");

    workspace.delete_entity(entity.id)?;
    workspace.delete_category(category.id)?;
    assert!(workspace.registry.categories().is_empty());
    Ok(())
}
