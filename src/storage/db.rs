use anyhow::{Context, Result};
use log::info;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection};
use std::path::Path;
use std::time::Duration;

use crate::constants::{
    TABLE_DELETED_GROUPS, TABLE_DELETED_TASKS, TABLE_GROUPS, TABLE_GROUP_QUEUE, TABLE_PROMOTED_GROUPS,
    TABLE_PROMOTED_TASKS, TABLE_SESSION, TABLE_TASKS, TABLE_TASK_QUEUE,
};

/// Keeps the single in-memory connection from being recycled, which would drop the database.
const MEMORY_CONNECTION_LIFETIME: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Local storage backed by SQLite.
///
/// The pool holds exactly one connection, so statements are serialized. Code
/// running inside a transaction must issue its statements on the transaction
/// handle, never on `conn`, or it will wait on itself.
pub struct LocalStorage {
    pub conn: DatabaseConnection,
}

impl LocalStorage {
    /// Open (or create) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
            }
        }

        let url = format!("sqlite://{}?mode=rwc", path.display());
        let mut options = ConnectOptions::new(url);
        options.max_connections(1).min_connections(1).sqlx_logging(false);

        let conn = Database::connect(options)
            .await
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        let storage = LocalStorage { conn };
        storage.init_schema().await?;
        info!("💾 Opened local store at {}", path.display());
        Ok(storage)
    }

    /// Open a private in-memory database.
    pub async fn in_memory() -> Result<Self> {
        let mut options = ConnectOptions::new("sqlite::memory:".to_string());
        options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(MEMORY_CONNECTION_LIFETIME)
            .max_lifetime(MEMORY_CONNECTION_LIFETIME)
            .sqlx_logging(false);

        let conn = Database::connect(options)
            .await
            .context("Failed to open in-memory database")?;

        let storage = LocalStorage { conn };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create every table if it does not exist yet.
    async fn init_schema(&self) -> Result<()> {
        let statements = [
            format!(
                r"
                CREATE TABLE IF NOT EXISTS {TABLE_GROUPS} (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    synced INTEGER NOT NULL DEFAULT 0
                )
                "
            ),
            format!(
                r"
                CREATE TABLE IF NOT EXISTS {TABLE_TASKS} (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    description TEXT,
                    group_id TEXT NOT NULL,
                    is_completed INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    synced INTEGER NOT NULL DEFAULT 0
                )
                "
            ),
            format!("CREATE INDEX IF NOT EXISTS idx_{TABLE_TASKS}_group ON {TABLE_TASKS}(group_id)"),
            queue_table_sql(TABLE_TASK_QUEUE),
            queue_table_sql(TABLE_GROUP_QUEUE),
            tombstone_table_sql(TABLE_DELETED_TASKS),
            tombstone_table_sql(TABLE_DELETED_GROUPS),
            alias_table_sql(TABLE_PROMOTED_TASKS),
            alias_table_sql(TABLE_PROMOTED_GROUPS),
            format!(
                r"
                CREATE TABLE IF NOT EXISTS {TABLE_SESSION} (
                    slot INTEGER PRIMARY KEY CHECK (slot = 1),
                    user_id TEXT NOT NULL,
                    email TEXT,
                    stored_at TEXT NOT NULL
                )
                "
            ),
        ];

        for sql in statements {
            self.conn.execute_unprepared(&sql).await?;
        }

        Ok(())
    }
}

fn queue_table_sql(table: &str) -> String {
    format!(
        r"
        CREATE TABLE IF NOT EXISTS {table} (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            op TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            enqueued_at TEXT NOT NULL
        )
        "
    )
}

fn tombstone_table_sql(table: &str) -> String {
    format!(
        r"
        CREATE TABLE IF NOT EXISTS {table} (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            deleted_at TEXT NOT NULL
        )
        "
    )
}

fn alias_table_sql(table: &str) -> String {
    format!(
        r"
        CREATE TABLE IF NOT EXISTS {table} (
            temp_id TEXT PRIMARY KEY,
            permanent_id TEXT NOT NULL,
            promoted_at TEXT NOT NULL
        )
        "
    )
}
