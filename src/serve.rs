use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path as AxumPath, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::database::{Database, DatabaseConfig};
use crate::store::{StoredRecord, load_workspace};
use crate::*;

type ApiError = (StatusCode, String);

/// Arguments for running the pidraw HTTP API
#[derive(Debug, Clone, Parser)]
#[command(name = "pidraw serve", about = "Start the pidraw template and diagram API server.")]
pub struct ServeArgs {
    /// SQLite database file. Defaults to $PIDRAW_DB_PATH or the user data directory.
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 5151)]
    pub port: u16,

    /// Background color for rendered SVG previews.
    #[arg(long = "background-color", default_value = "white")]
    pub background_color: String,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Categories,
    Entities,
    Templates,
    Diagrams,
}

/// Serialized list responses, dropped whenever their collection changes.
#[derive(Debug, Default)]
pub struct ListCache {
    lists: Mutex<HashMap<Collection, Value>>,
}

impl ListCache {
    pub async fn get(&self, collection: Collection) -> Option<Value> {
        self.lists.lock().await.get(&collection).cloned()
    }

    async fn put(&self, collection: Collection, value: Value) {
        self.lists.lock().await.insert(collection, value);
    }

    async fn invalidate(&self, collection: Collection) {
        if self.lists.lock().await.remove(&collection).is_some() {
            debug!(?collection, "invalidated list cache");
        }
    }
}

/// A record a mutation created, changed or removed.
#[derive(Debug, Clone, Copy)]
enum Touched {
    Category(i64),
    Entity(i64),
    Template(i64),
    Diagram(i64),
}

impl Touched {
    fn collection(self) -> Collection {
        match self {
            Touched::Category(_) => Collection::Categories,
            Touched::Entity(_) => Collection::Entities,
            Touched::Template(_) => Collection::Templates,
            Touched::Diagram(_) => Collection::Diagrams,
        }
    }
}

pub struct ServeState {
    workspace: RwLock<Workspace>,
    db: Option<Database>,
    cache: ListCache,
    background: String,
}

impl ServeState {
    pub fn new(workspace: Workspace, db: Option<Database>, background: impl Into<String>) -> Self {
        Self {
            workspace: RwLock::new(workspace),
            db,
            cache: ListCache::default(),
            background: background.into(),
        }
    }

    pub fn cache(&self) -> &ListCache {
        &self.cache
    }

    /// Applies `apply` to the workspace and writes the touched records.
    /// Either both succeed or the workspace is restored.
    async fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut Workspace) -> crate::Result<(T, Vec<Touched>)>,
    ) -> Result<T, ApiError> {
        let mut workspace = self.workspace.write().await;
        let snapshot = workspace.clone();

        let (value, touched) = match apply(&mut *workspace) {
            Ok(applied) => applied,
            Err(err) => {
                *workspace = snapshot;
                return Err(api_error(err));
            }
        };

        if let Some(db) = &self.db {
            if let Err(err) = persist(db, &workspace, &touched).await {
                warn!(error = %err, "persisting change failed, restoring workspace");
                *workspace = snapshot;
                return Err(internal_error(err));
            }
            for record in &touched {
                if let Touched::Diagram(id) = *record {
                    if workspace.diagrams.get(id).is_some() {
                        workspace.mark_saved(id).map_err(api_error)?;
                    }
                }
            }
        }

        for record in &touched {
            self.cache.invalidate(record.collection()).await;
        }
        Ok(value)
    }

    async fn list(&self, collection: Collection) -> Result<Json<Value>, ApiError> {
        if let Some(cached) = self.cache.get(collection).await {
            return Ok(Json(cached));
        }
        let workspace = self.workspace.read().await;
        let value = match collection {
            Collection::Categories => serde_json::to_value(workspace.registry.categories()),
            Collection::Entities => serde_json::to_value(workspace.registry.entities()),
            Collection::Templates => serde_json::to_value(workspace.templates.list()),
            Collection::Diagrams => serde_json::to_value(workspace.diagrams.list()),
        }
        .map_err(|err| internal_error(err.into()))?;
        self.cache.put(collection, value.clone()).await;
        Ok(Json(value))
    }

    async fn diagram(&self, id: i64) -> Result<Json<Diagram>, ApiError> {
        let workspace = self.workspace.read().await;
        workspace
            .diagrams
            .get(id)
            .cloned()
            .map(Json)
            .ok_or_else(|| api_error(Error::not_found("diagram", id)))
    }
}

async fn persist(db: &Database, workspace: &Workspace, touched: &[Touched]) -> Result<()> {
    let pool = db.pool();
    for record in touched {
        match *record {
            Touched::Category(id) => match workspace.registry.category(id) {
                Some(category) => category.save(pool).await?,
                None => EntityCategory::delete(pool, id).await?,
            },
            Touched::Entity(id) => match workspace.registry.entity(id) {
                Some(entity) => entity.save(pool).await?,
                None => Entity::delete(pool, id).await?,
            },
            Touched::Template(id) => match workspace.templates.get(id) {
                Some(template) => template.save(pool).await?,
                None => Template::delete(pool, id).await?,
            },
            Touched::Diagram(id) => match workspace.diagrams.get(id) {
                Some(diagram) => diagram.save(pool).await?,
                None => Diagram::delete(pool, id).await?,
            },
        }
    }
    Ok(())
}

fn api_error(err: Error) -> ApiError {
    let status = match &err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::NotFound { .. } | Error::NodeNotInDiagram { .. } => StatusCode::NOT_FOUND,
        Error::CategoryInUse { .. } => StatusCode::CONFLICT,
    };
    (status, err.to_string())
}

fn internal_error(err: anyhow::Error) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

pub fn build_router(state: Arc<ServeState>) -> Router {
    Router::new()
        .route("/api/categories", get(list_categories).post(create_category))
        .route(
            "/api/categories/:id",
            get(get_category).put(update_category).delete(delete_category),
        )
        .route("/api/entities", get(list_entities).post(create_entity))
        .route(
            "/api/entities/:id",
            get(get_entity).put(update_entity).delete(delete_entity),
        )
        .route("/api/templates", get(list_templates).post(create_template))
        .route(
            "/api/templates/:id",
            get(get_template).put(update_template).delete(delete_template),
        )
        .route("/api/diagrams", get(list_diagrams).post(create_diagram))
        .route(
            "/api/diagrams/:id",
            get(get_diagram).put(update_diagram).delete(delete_diagram),
        )
        .route("/api/diagrams/:id/bindings/:node_id", put(put_binding))
        .route("/api/diagrams/:id/edges", post(post_edge))
        .route("/api/diagrams/:id/edges/:edge_id", delete(delete_edge))
        .route("/api/diagrams/:id/nodes", post(post_node))
        .route("/api/diagrams/:id/nodes/:node_id", delete(delete_node))
        .route("/api/diagrams/:id/resync", post(post_resync))
        .route("/api/diagrams/:id/render", get(get_render))
        .route("/api/diagrams/:id/svg", get(get_svg))
        .route("/api/layout", post(post_layout))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

pub async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = args.db.clone().map(DatabaseConfig::new).unwrap_or_default();
    let db = Database::new(config).await?;
    let workspace = load_workspace(db.pool()).await?;

    let state = Arc::new(ServeState::new(
        workspace,
        Some(db),
        args.background_color.clone(),
    ));
    let app = build_router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind HTTP server to {addr}"))?;

    info!("pidraw server listening on http://{addr}");
    println!("Press Ctrl+C to stop.");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("HTTP server error")?;

    Ok(())
}

async fn list_categories(State(state): State<Arc<ServeState>>) -> Result<Json<Value>, ApiError> {
    state.list(Collection::Categories).await
}

async fn get_category(
    State(state): State<Arc<ServeState>>,
    AxumPath(id): AxumPath<i64>,
) -> Result<Json<EntityCategory>, ApiError> {
    let workspace = state.workspace.read().await;
    workspace
        .registry
        .category(id)
        .cloned()
        .map(Json)
        .ok_or_else(|| api_error(Error::not_found("category", id)))
}

async fn create_category(
    State(state): State<Arc<ServeState>>,
    Json(draft): Json<CategoryDraft>,
) -> Result<(StatusCode, Json<EntityCategory>), ApiError> {
    let category = state
        .mutate(|workspace| {
            let category = workspace.registry.create_category(draft)?;
            let id = category.id;
            Ok((category, vec![Touched::Category(id)]))
        })
        .await?;
    Ok((StatusCode::CREATED, Json(category)))
}

async fn update_category(
    State(state): State<Arc<ServeState>>,
    AxumPath(id): AxumPath<i64>,
    Json(draft): Json<CategoryDraft>,
) -> Result<Json<EntityCategory>, ApiError> {
    let category = state
        .mutate(|workspace| {
            let category = workspace.registry.update_category(id, draft)?;
            Ok((category, vec![Touched::Category(id)]))
        })
        .await?;
    Ok(Json(category))
}

async fn delete_category(
    State(state): State<Arc<ServeState>>,
    AxumPath(id): AxumPath<i64>,
) -> Result<StatusCode, ApiError> {
    state
        .mutate(|workspace| {
            workspace.delete_category(id)?;
            Ok(((), vec![Touched::Category(id)]))
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_entities(State(state): State<Arc<ServeState>>) -> Result<Json<Value>, ApiError> {
    state.list(Collection::Entities).await
}

async fn get_entity(
    State(state): State<Arc<ServeState>>,
    AxumPath(id): AxumPath<i64>,
) -> Result<Json<Entity>, ApiError> {
    let workspace = state.workspace.read().await;
    workspace
        .registry
        .entity(id)
        .cloned()
        .map(Json)
        .ok_or_else(|| api_error(Error::not_found("entity", id)))
}

async fn create_entity(
    State(state): State<Arc<ServeState>>,
    Json(draft): Json<EntityDraft>,
) -> Result<(StatusCode, Json<Entity>), ApiError> {
    let entity = state
        .mutate(|workspace| {
            let entity = workspace.registry.create_entity(draft)?;
            let id = entity.id;
            Ok((entity, vec![Touched::Entity(id)]))
        })
        .await?;
    Ok((StatusCode::CREATED, Json(entity)))
}

async fn update_entity(
    State(state): State<Arc<ServeState>>,
    AxumPath(id): AxumPath<i64>,
    Json(draft): Json<EntityDraft>,
) -> Result<Json<Entity>, ApiError> {
    let entity = state
        .mutate(|workspace| {
            let entity = workspace.registry.update_entity(id, draft)?;
            Ok((entity, vec![Touched::Entity(id)]))
        })
        .await?;
    Ok(Json(entity))
}

async fn delete_entity(
    State(state): State<Arc<ServeState>>,
    AxumPath(id): AxumPath<i64>,
) -> Result<StatusCode, ApiError> {
    state
        .mutate(|workspace| {
            workspace.delete_entity(id)?;
            Ok(((), vec![Touched::Entity(id)]))
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct TemplatePayload {
    #[serde(flatten)]
    template: Template,
    diagnostics: GraphDiagnostics,
}

async fn list_templates(State(state): State<Arc<ServeState>>) -> Result<Json<Value>, ApiError> {
    state.list(Collection::Templates).await
}

async fn get_template(
    State(state): State<Arc<ServeState>>,
    AxumPath(id): AxumPath<i64>,
) -> Result<Json<Template>, ApiError> {
    let workspace = state.workspace.read().await;
    workspace
        .templates
        .get(id)
        .cloned()
        .map(Json)
        .ok_or_else(|| api_error(Error::not_found("template", id)))
}

async fn create_template(
    State(state): State<Arc<ServeState>>,
    Json(draft): Json<TemplateDraft>,
) -> Result<(StatusCode, Json<TemplatePayload>), ApiError> {
    let (template, diagnostics) = state
        .mutate(|workspace| {
            let created = workspace.templates.create(draft)?;
            let id = created.0.id;
            Ok((created, vec![Touched::Template(id)]))
        })
        .await?;
    info!(template = template.id, "created template");
    Ok((
        StatusCode::CREATED,
        Json(TemplatePayload {
            template,
            diagnostics,
        }),
    ))
}

async fn update_template(
    State(state): State<Arc<ServeState>>,
    AxumPath(id): AxumPath<i64>,
    Json(draft): Json<TemplateDraft>,
) -> Result<Json<TemplatePayload>, ApiError> {
    let (template, diagnostics) = state
        .mutate(|workspace| {
            let updated = workspace.templates.update(id, draft)?;
            Ok((updated, vec![Touched::Template(id)]))
        })
        .await?;
    Ok(Json(TemplatePayload {
        template,
        diagnostics,
    }))
}

async fn delete_template(
    State(state): State<Arc<ServeState>>,
    AxumPath(id): AxumPath<i64>,
) -> Result<StatusCode, ApiError> {
    state
        .mutate(|workspace| {
            workspace.delete_template(id)?;
            Ok(((), vec![Touched::Template(id)]))
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_diagrams(State(state): State<Arc<ServeState>>) -> Result<Json<Value>, ApiError> {
    state.list(Collection::Diagrams).await
}

async fn get_diagram(
    State(state): State<Arc<ServeState>>,
    AxumPath(id): AxumPath<i64>,
) -> Result<Json<Diagram>, ApiError> {
    state.diagram(id).await
}

async fn create_diagram(
    State(state): State<Arc<ServeState>>,
    Json(draft): Json<DiagramDraft>,
) -> Result<(StatusCode, Json<Diagram>), ApiError> {
    let id = state
        .mutate(|workspace| {
            let diagram = workspace.instantiate(draft)?;
            Ok((diagram.id, vec![Touched::Diagram(diagram.id)]))
        })
        .await?;
    Ok((StatusCode::CREATED, state.diagram(id).await?))
}

async fn update_diagram(
    State(state): State<Arc<ServeState>>,
    AxumPath(id): AxumPath<i64>,
    Json(patch): Json<DiagramPatch>,
) -> Result<Json<Diagram>, ApiError> {
    state
        .mutate(|workspace| {
            workspace.update_diagram(id, patch)?;
            Ok(((), vec![Touched::Diagram(id)]))
        })
        .await?;
    state.diagram(id).await
}

async fn delete_diagram(
    State(state): State<Arc<ServeState>>,
    AxumPath(id): AxumPath<i64>,
) -> Result<StatusCode, ApiError> {
    state
        .mutate(|workspace| {
            workspace.delete_diagram(id)?;
            Ok(((), vec![Touched::Diagram(id)]))
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BindingRequest {
    #[serde(default)]
    entity_id: Option<i64>,
}

async fn put_binding(
    State(state): State<Arc<ServeState>>,
    AxumPath((id, node_id)): AxumPath<(i64, String)>,
    Json(request): Json<BindingRequest>,
) -> Result<Json<Diagram>, ApiError> {
    state
        .mutate(|workspace| {
            workspace.bind_entity(id, &node_id, request.entity_id)?;
            Ok(((), vec![Touched::Diagram(id)]))
        })
        .await?;
    state.diagram(id).await
}

#[derive(Debug, Deserialize)]
struct EdgeRequest {
    source: String,
    target: String,
}

async fn post_edge(
    State(state): State<Arc<ServeState>>,
    AxumPath(id): AxumPath<i64>,
    Json(request): Json<EdgeRequest>,
) -> Result<(StatusCode, Json<GraphEdge>), ApiError> {
    let edge = state
        .mutate(|workspace| {
            let edge = workspace.add_manual_edge(id, &request.source, &request.target)?;
            Ok((edge, vec![Touched::Diagram(id)]))
        })
        .await?;
    Ok((StatusCode::CREATED, Json(edge)))
}

async fn delete_edge(
    State(state): State<Arc<ServeState>>,
    AxumPath((id, edge_id)): AxumPath<(i64, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .mutate(|workspace| {
            workspace.remove_edge(id, &edge_id)?;
            Ok(((), vec![Touched::Diagram(id)]))
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct NodeRequest {
    id: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default, alias = "type")]
    kind: Option<String>,
}

async fn post_node(
    State(state): State<Arc<ServeState>>,
    AxumPath(id): AxumPath<i64>,
    Json(request): Json<NodeRequest>,
) -> Result<(StatusCode, Json<GraphNode>), ApiError> {
    let label = request
        .label
        .filter(|label| !label.trim().is_empty())
        .unwrap_or_else(|| request.id.trim().to_string());
    let mut node = GraphNode::new(request.id, label);
    node.kind = request.kind;

    let node = state
        .mutate(|workspace| {
            let node = workspace.add_node(id, node)?;
            Ok((node, vec![Touched::Diagram(id)]))
        })
        .await?;
    Ok((StatusCode::CREATED, Json(node)))
}

async fn delete_node(
    State(state): State<Arc<ServeState>>,
    AxumPath((id, node_id)): AxumPath<(i64, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .mutate(|workspace| {
            workspace.remove_node(id, &node_id)?;
            Ok(((), vec![Touched::Diagram(id)]))
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_resync(
    State(state): State<Arc<ServeState>>,
    AxumPath(id): AxumPath<i64>,
) -> Result<Json<Diagram>, ApiError> {
    state
        .mutate(|workspace| {
            workspace.resync_from_template(id)?;
            Ok(((), vec![Touched::Diagram(id)]))
        })
        .await?;
    state.diagram(id).await
}

async fn get_render(
    State(state): State<Arc<ServeState>>,
    AxumPath(id): AxumPath<i64>,
) -> Result<Json<RenderedDiagram>, ApiError> {
    let workspace = state.workspace.read().await;
    workspace.render(id).map(Json).map_err(api_error)
}

async fn get_svg(
    State(state): State<Arc<ServeState>>,
    AxumPath(id): AxumPath<i64>,
) -> Result<Response, ApiError> {
    let workspace = state.workspace.read().await;
    let rendered = workspace.render(id).map_err(api_error)?;
    let svg = render_svg(&rendered, &state.background, &workspace.layout_options)
        .map_err(internal_error)?;
    Ok(([(header::CONTENT_TYPE, "image/svg+xml")], svg).into_response())
}

#[derive(Debug, Deserialize)]
struct LayoutRequest {
    #[serde(default)]
    nodes: Value,
    #[serde(default)]
    edges: Value,
    #[serde(default, alias = "layout")]
    direction: LayoutDirection,
}

/// Lays out a posted graph without storing anything.
async fn post_layout(
    State(state): State<Arc<ServeState>>,
    Json(request): Json<LayoutRequest>,
) -> Result<Json<LayoutReport>, ApiError> {
    let or_empty = |value: Value| match value {
        Value::Null => Value::Array(Vec::new()),
        other => other,
    };
    let nodes = or_empty(request.nodes);
    let edges = or_empty(request.edges);
    let parsed = Graph::parse(serde_json::json!({ "nodes": nodes, "edges": edges }));
    if let Some(error) = &parsed.error {
        return Err((StatusCode::BAD_REQUEST, error.to_string()));
    }

    let options = state.workspace.read().await.layout_options;
    Ok(Json(LayoutReport::new(parsed, request.direction, &options)))
}
