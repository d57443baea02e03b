//! Repository layer for database operations.
//!
//! Repositories are stateless structs whose methods take any
//! `sea_orm::ConnectionTrait`, so the same call works on the plain connection
//! and inside a transaction. Entity tables go through the SeaORM query builder;
//! the queue, tombstone, alias and session bookkeeping tables use raw statements.

pub mod alias;
pub mod group;
pub mod queue;
pub mod session;
pub mod task;
pub mod tombstone;

pub use alias::AliasRepository;
pub use group::GroupRepository;
pub use queue::{OperationKind, PendingOperation, QueueRepository};
pub use session::{SessionRepository, StoredOwner};
pub use task::TaskRepository;
pub use tombstone::TombstoneRepository;

use anyhow::Result;
use sea_orm::{ConnectionTrait, DbBackend, Statement, Value};

pub(crate) fn statement(sql: &str, values: Vec<Value>) -> Statement {
    Statement::from_sql_and_values(DbBackend::Sqlite, sql, values)
}

/// Run a `SELECT COUNT(*) AS count ...` statement.
pub(crate) async fn count<C>(conn: &C, sql: &str, values: Vec<Value>) -> Result<u64>
where
    C: ConnectionTrait,
{
    let row = conn.query_one(statement(sql, values)).await?;
    let count = match row {
        Some(row) => row.try_get::<i64>("", "count")?,
        None => 0,
    };
    Ok(count.max(0) as u64)
}
