use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::future::Future;
use tracing::{debug, warn};

use crate::*;

/// A workspace record with a row of its own in SQLite.
pub trait StoredRecord {
    const TABLE: &'static str;

    fn id(&self) -> i64;

    /// Inserts the record, or overwrites the row with the same id.
    fn save(&self, pool: &SqlitePool) -> impl Future<Output = Result<()>> + Send;

    fn delete(pool: &SqlitePool, id: i64) -> impl Future<Output = Result<()>> + Send {
        async move {
            sqlx::query(&format!("DELETE FROM {} WHERE id = ?", Self::TABLE))
                .bind(id)
                .execute(pool)
                .await
                .with_context(|| format!("Failed to delete from {}", Self::TABLE))?;
            debug!(table = Self::TABLE, id, "deleted row");
            Ok(())
        }
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse().unwrap_or_else(|_| Utc::now())
}

#[derive(sqlx::FromRow)]
struct CategoryRow {
    id: i64,
    name: String,
    description: Option<String>,
}

impl StoredRecord for EntityCategory {
    const TABLE: &'static str = "entity_categories";

    fn id(&self) -> i64 {
        self.id
    }

    async fn save(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO entity_categories (id, name, description) VALUES (?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET name = excluded.name, description = excluded.description"#,
        )
        .bind(self.id)
        .bind(&self.name)
        .bind(&self.description)
        .execute(pool)
        .await
        .context("Failed to save entity category")?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    id: i64,
    name: String,
    category_id: i64,
    description: Option<String>,
    contact_name: Option<String>,
    contact_email: Option<String>,
    contact_phone: Option<String>,
    address: Option<String>,
}

impl StoredRecord for Entity {
    const TABLE: &'static str = "entities";

    fn id(&self) -> i64 {
        self.id
    }

    async fn save(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO entities (id, name, category_id, description, contact_name, contact_email, contact_phone, address)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   category_id = excluded.category_id,
                   description = excluded.description,
                   contact_name = excluded.contact_name,
                   contact_email = excluded.contact_email,
                   contact_phone = excluded.contact_phone,
                   address = excluded.address"#,
        )
        .bind(self.id)
        .bind(&self.name)
        .bind(self.category_id)
        .bind(&self.description)
        .bind(&self.contact_name)
        .bind(&self.contact_email)
        .bind(&self.contact_phone)
        .bind(&self.address)
        .execute(pool)
        .await
        .context("Failed to save entity")?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct TemplateRow {
    id: i64,
    name: String,
    description: String,
    layout: String,
    nodes: String,
    edges: String,
    created_at: String,
    updated_at: String,
}

impl StoredRecord for Template {
    const TABLE: &'static str = "templates";

    fn id(&self) -> i64 {
        self.id
    }

    async fn save(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO templates (id, name, description, layout, nodes, edges, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   description = excluded.description,
                   layout = excluded.layout,
                   nodes = excluded.nodes,
                   edges = excluded.edges,
                   updated_at = excluded.updated_at"#,
        )
        .bind(self.id)
        .bind(&self.name)
        .bind(&self.description)
        .bind(self.layout_direction.as_str())
        .bind(self.graph.serialize_nodes())
        .bind(self.graph.serialize_edges())
        .bind(self.created_at.to_rfc3339())
        .bind(self.updated_at.to_rfc3339())
        .execute(pool)
        .await
        .context("Failed to save template")?;
        Ok(())
    }
}

impl From<TemplateRow> for Template {
    fn from(row: TemplateRow) -> Self {
        let parsed = Graph::parse_parts(&row.nodes, &row.edges);
        if let Some(error) = &parsed.error {
            warn!(template = row.id, %error, "stored template graph is unreadable");
        }
        let layout_direction = row.layout.parse().unwrap_or_else(|_| {
            warn!(template = row.id, layout = %row.layout, "unknown stored layout direction");
            LayoutDirection::default()
        });
        Template {
            id: row.id,
            name: row.name,
            description: row.description,
            layout_direction,
            graph: parsed.graph,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct DiagramRow {
    id: i64,
    name: String,
    description: String,
    project_id: Option<i64>,
    document_id: Option<i64>,
    template_id: i64,
    nodes: String,
    edges: String,
    node_entities: String,
    layout_override: Option<String>,
    created_at: String,
    updated_at: String,
}

impl StoredRecord for Diagram {
    const TABLE: &'static str = "diagrams";

    fn id(&self) -> i64 {
        self.id
    }

    async fn save(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO diagrams (id, name, description, project_id, document_id, template_id,
                                     nodes, edges, node_entities, layout_override, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   description = excluded.description,
                   project_id = excluded.project_id,
                   document_id = excluded.document_id,
                   template_id = excluded.template_id,
                   nodes = excluded.nodes,
                   edges = excluded.edges,
                   node_entities = excluded.node_entities,
                   layout_override = excluded.layout_override,
                   updated_at = excluded.updated_at"#,
        )
        .bind(self.id)
        .bind(&self.name)
        .bind(&self.description)
        .bind(self.project_id)
        .bind(self.document_id)
        .bind(self.template_id)
        .bind(self.graph.serialize_nodes())
        .bind(self.graph.serialize_edges())
        .bind(self.encode_node_entities())
        .bind(self.layout_override.map(|direction| direction.as_str()))
        .bind(self.created_at.to_rfc3339())
        .bind(self.updated_at.to_rfc3339())
        .execute(pool)
        .await
        .context("Failed to save diagram")?;
        Ok(())
    }
}

impl From<DiagramRow> for Diagram {
    fn from(row: DiagramRow) -> Self {
        let parsed = Graph::parse_parts(&row.nodes, &row.edges);
        if let Some(error) = &parsed.error {
            warn!(diagram = row.id, %error, "stored diagram graph is unreadable");
        }
        let layout_override = row.layout_override.as_deref().and_then(|raw| {
            raw.parse::<LayoutDirection>()
                .map_err(|_| {
                    warn!(diagram = row.id, layout = raw, "ignoring unknown layout override")
                })
                .ok()
        });
        let mut diagram = Diagram {
            id: row.id,
            name: row.name,
            description: row.description,
            project_id: row.project_id,
            document_id: row.document_id,
            template_id: row.template_id,
            graph: parsed.graph,
            node_entities: decode_node_entities(&row.node_entities),
            layout_override,
            status: DiagramStatus::Saved,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
        };
        diagram.sync_bindings();
        diagram
    }
}

/// Highest id ever issued per table, deleted rows included.
async fn issued_ids(pool: &SqlitePool) -> Result<HashMap<String, i64>> {
    let rows: Vec<(String, i64)> = sqlx::query_as("SELECT name, seq FROM sqlite_sequence")
        .fetch_all(pool)
        .await
        .context("Failed to read id sequences")?;
    Ok(rows.into_iter().collect())
}

/// Reads every table into a fresh workspace.
///
/// Id counters resume after the highest id ever issued, not the highest
/// surviving one.
pub async fn load_workspace(pool: &SqlitePool) -> Result<Workspace> {
    let mut workspace = Workspace::new();

    let categories: Vec<CategoryRow> =
        sqlx::query_as("SELECT id, name, description FROM entity_categories ORDER BY id")
            .fetch_all(pool)
            .await
            .context("Failed to load entity categories")?;
    for row in categories {
        workspace.registry.insert_category(EntityCategory {
            id: row.id,
            name: row.name,
            description: row.description,
        });
    }

    let entities: Vec<EntityRow> = sqlx::query_as(
        "SELECT id, name, category_id, description, contact_name, contact_email, contact_phone, address
         FROM entities ORDER BY id",
    )
    .fetch_all(pool)
    .await
    .context("Failed to load entities")?;
    for row in entities {
        workspace.registry.insert_entity(Entity {
            id: row.id,
            name: row.name,
            category_id: row.category_id,
            description: row.description,
            contact_name: row.contact_name,
            contact_email: row.contact_email,
            contact_phone: row.contact_phone,
            address: row.address,
        });
    }

    let templates: Vec<TemplateRow> = sqlx::query_as(
        "SELECT id, name, description, layout, nodes, edges, created_at, updated_at
         FROM templates ORDER BY id",
    )
    .fetch_all(pool)
    .await
    .context("Failed to load templates")?;
    for row in templates {
        workspace.templates.insert(Template::from(row));
    }

    let diagrams: Vec<DiagramRow> = sqlx::query_as(
        "SELECT id, name, description, project_id, document_id, template_id,
                nodes, edges, node_entities, layout_override, created_at, updated_at
         FROM diagrams ORDER BY id",
    )
    .fetch_all(pool)
    .await
    .context("Failed to load diagrams")?;
    for row in diagrams {
        workspace.diagrams.insert(Diagram::from(row));
    }

    let issued = issued_ids(pool).await?;
    let last = |table: &str| issued.get(table).copied().unwrap_or(0);
    workspace
        .registry
        .reserve_category_ids(last(EntityCategory::TABLE));
    workspace.registry.reserve_entity_ids(last(Entity::TABLE));
    workspace.templates.reserve_ids(last(Template::TABLE));
    workspace.diagrams.reserve_ids(last(Diagram::TABLE));

    tracing::info!(
        categories = workspace.registry.categories().len(),
        entities = workspace.registry.entities().len(),
        templates = workspace.templates.len(),
        diagrams = workspace.diagrams.len(),
        "loaded workspace"
    );
    Ok(workspace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, DatabaseConfig};
    use tempfile::TempDir;

    async fn setup_test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(DatabaseConfig::new(temp_dir.path().join("test.db")))
            .await
            .unwrap();
        (temp_dir, db)
    }

    fn seeded_workspace() -> (Workspace, i64) {
        let mut workspace = Workspace::new();
        let category = workspace
            .registry
            .create_category(CategoryDraft::new("Reviewers"))
            .unwrap();
        let entity = workspace
            .registry
            .create_entity(EntityDraft::new("Quality Team", category.id))
            .unwrap();
        let graph = Graph::new(
            vec![GraphNode::new("A", "Start"), GraphNode::new("B", "Review")],
            vec![GraphEdge::new("A", "B")],
        );
        let (template, _) = workspace
            .templates
            .create(TemplateDraft::new("T1", LayoutDirection::LeftRight, &graph))
            .unwrap();
        let diagram = workspace
            .instantiate(DiagramDraft::new(template.id, "D1"))
            .unwrap();
        workspace.bind_entity(diagram.id, "B", Some(entity.id)).unwrap();
        workspace
            .update_diagram(
                diagram.id,
                DiagramPatch {
                    layout_override: Some(Some(LayoutDirection::Grid)),
                    ..DiagramPatch::default()
                },
            )
            .unwrap();
        (workspace, diagram.id)
    }

    async fn save_all(workspace: &Workspace, pool: &SqlitePool) {
        for category in workspace.registry.categories() {
            category.save(pool).await.unwrap();
        }
        for entity in workspace.registry.entities() {
            entity.save(pool).await.unwrap();
        }
        for template in workspace.templates.list() {
            template.save(pool).await.unwrap();
        }
        for diagram in workspace.diagrams.list() {
            diagram.save(pool).await.unwrap();
        }
    }

    #[tokio::test]
    async fn workspace_round_trips_through_sqlite() {
        let (_dir, db) = setup_test_db().await;
        let (workspace, diagram_id) = seeded_workspace();
        save_all(&workspace, db.pool()).await;

        let loaded = load_workspace(db.pool()).await.unwrap();
        assert_eq!(loaded.registry.categories(), workspace.registry.categories());
        assert_eq!(loaded.registry.entities(), workspace.registry.entities());
        assert_eq!(loaded.templates.len(), 1);

        let original = workspace.diagrams.get(diagram_id).unwrap();
        let restored = loaded.diagrams.get(diagram_id).unwrap();
        assert_eq!(restored.graph, original.graph);
        assert_eq!(restored.node_entities, original.node_entities);
        assert_eq!(restored.layout_override, Some(LayoutDirection::Grid));
        assert_eq!(restored.status, DiagramStatus::Saved);
        assert_eq!(
            loaded.render(diagram_id).unwrap().entity_labels,
            workspace.render(diagram_id).unwrap().entity_labels
        );
    }

    #[tokio::test]
    async fn save_overwrites_and_delete_removes() {
        let (_dir, db) = setup_test_db().await;
        let (mut workspace, diagram_id) = seeded_workspace();
        save_all(&workspace, db.pool()).await;

        let renamed = workspace
            .update_diagram(
                diagram_id,
                DiagramPatch {
                    name: Some("D1 revised".into()),
                    ..DiagramPatch::default()
                },
            )
            .unwrap();
        renamed.save(db.pool()).await.unwrap();
        let loaded = load_workspace(db.pool()).await.unwrap();
        assert_eq!(loaded.diagrams.len(), 1);
        assert_eq!(loaded.diagrams.get(diagram_id).unwrap().name, "D1 revised");

        Diagram::delete(db.pool(), diagram_id).await.unwrap();
        let loaded = load_workspace(db.pool()).await.unwrap();
        assert!(loaded.diagrams.is_empty());
        assert_eq!(loaded.templates.len(), 1);
    }

    #[tokio::test]
    async fn deleted_ids_are_not_reissued_after_reload() {
        let (_dir, db) = setup_test_db().await;
        let mut workspace = Workspace::new();
        let category = workspace
            .registry
            .create_category(CategoryDraft::new("Vendors"))
            .unwrap();
        workspace
            .registry
            .create_entity(EntityDraft::new("Acme", category.id))
            .unwrap();
        let bound = workspace
            .registry
            .create_entity(EntityDraft::new("Globex", category.id))
            .unwrap();
        let graph = Graph::new(
            vec![GraphNode::new("A", "Start"), GraphNode::new("B", "Review")],
            vec![GraphEdge::new("A", "B")],
        );
        let (template, _) = workspace
            .templates
            .create(TemplateDraft::new("T1", LayoutDirection::LeftRight, &graph))
            .unwrap();
        let diagram = workspace
            .instantiate(DiagramDraft::new(template.id, "D1"))
            .unwrap();
        workspace.bind_entity(diagram.id, "B", Some(bound.id)).unwrap();
        save_all(&workspace, db.pool()).await;

        workspace.delete_entity(bound.id).unwrap();
        Entity::delete(db.pool(), bound.id).await.unwrap();
        workspace.delete_template(template.id).unwrap();
        Template::delete(db.pool(), template.id).await.unwrap();

        let mut loaded = load_workspace(db.pool()).await.unwrap();
        let newcomer = loaded
            .registry
            .create_entity(EntityDraft::new("Initech", category.id))
            .unwrap();
        let other_graph = Graph::new(vec![GraphNode::new("X", "Other")], Vec::new());
        let (replacement, _) = loaded
            .templates
            .create(TemplateDraft::new("T2", LayoutDirection::Grid, &other_graph))
            .unwrap();
        assert_ne!(newcomer.id, bound.id);
        assert_ne!(replacement.id, template.id);

        let rendered = loaded.render(diagram.id).unwrap();
        assert_eq!(
            rendered.node("B").unwrap().entity_label.as_deref(),
            Some(UNKNOWN_LABEL)
        );
        assert_eq!(rendered.direction, LayoutDirection::TopDown);
        assert!(loaded.resync_from_template(diagram.id).is_err());

        let next_diagram = loaded
            .instantiate(DiagramDraft::new(replacement.id, "D2"))
            .unwrap();
        assert_ne!(next_diagram.id, diagram.id);
    }

    #[tokio::test]
    async fn malformed_stored_graph_degrades_to_empty() {
        let (_dir, db) = setup_test_db().await;
        sqlx::query(
            "INSERT INTO diagrams (id, name, template_id, nodes, edges, node_entities, layout_override)
             VALUES (3, 'Broken', 9, 'not json', '[]', '{\"x\": 4}', 'sideways')",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let loaded = load_workspace(db.pool()).await.unwrap();
        let diagram = loaded.diagrams.get(3).unwrap();
        assert!(diagram.graph.is_empty());
        assert!(diagram.node_entities.is_empty());
        assert_eq!(diagram.layout_override, None);

        let rendered = loaded.render(3).unwrap();
        assert!(rendered.nodes.is_empty());
        assert_eq!(rendered.direction, LayoutDirection::TopDown);
    }
}
