use anyhow::{Context, Result};
use directories::ProjectDirs;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::{Pool, Sqlite};
use std::path::PathBuf;

const DB_FILE_NAME: &str = "pidraw.db";

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl DatabaseConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = std::env::var("PIDRAW_DB_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                ProjectDirs::from("", "", "pidraw")
                    .map(|dirs| dirs.data_dir().join(DB_FILE_NAME))
            })
            .unwrap_or_else(|| PathBuf::from(DB_FILE_NAME));
        Self { path }
    }
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    config: DatabaseConfig,
}

impl Database {
    pub async fn new(config: DatabaseConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create '{}'", parent.display()))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        let db = Self { pool, config };
        db.run_migrations().await?;
        tracing::info!(path = %db.config.path.display(), "opened database");
        Ok(db)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entity_categories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create entity_categories table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                category_id INTEGER NOT NULL,
                description TEXT,
                contact_name TEXT,
                contact_email TEXT,
                contact_phone TEXT,
                address TEXT
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create entities table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                layout TEXT NOT NULL DEFAULT 'top-down',
                nodes TEXT NOT NULL DEFAULT '[]',
                edges TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create templates table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS diagrams (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                project_id INTEGER,
                document_id INTEGER,
                template_id INTEGER NOT NULL,
                nodes TEXT NOT NULL DEFAULT '[]',
                edges TEXT NOT NULL DEFAULT '[]',
                node_entities TEXT NOT NULL DEFAULT '{}',
                layout_override TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create diagrams table")?;

        sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_entities_category ON entities(category_id)"#)
            .execute(&self.pool)
            .await
            .context("Failed to create entities_category index")?;

        sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_diagrams_template ON diagrams(template_id)"#)
            .execute(&self.pool)
            .await
            .context("Failed to create diagrams_template index")?;

        Ok(())
    }
}
