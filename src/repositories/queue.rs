//! Pending-operation queues, one table per entity kind.
//!
//! Each row records an operation that still has to reach the remote store,
//! together with the JSON snapshot needed to replay it. Rows are replayed in
//! `seq` order.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, FromQueryResult, Value};
use serde::de::DeserializeOwned;
use std::fmt;
use std::str::FromStr;

use super::{count, statement};
use crate::identifier::{EntityId, EntityKind};
use crate::utils::datetime;

/// Kind of a queued operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Update,
    Rename,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Rename => "rename",
            OperationKind::Delete => "delete",
        }
    }
}

impl FromStr for OperationKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "rename" => Ok(OperationKind::Rename),
            "delete" => Ok(OperationKind::Delete),
            other => Err(anyhow!("Unknown operation kind: {other}")),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued operation as read back from the store.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingOperation {
    pub seq: i64,
    pub kind: EntityKind,
    pub op: OperationKind,
    pub entity_id: EntityId,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingOperation {
    /// Decode the snapshot into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .with_context(|| format!("Malformed {} {} payload (seq {})", self.kind, self.op, self.seq))
    }
}

#[derive(Debug, FromQueryResult)]
struct QueueRow {
    seq: i64,
    op: String,
    entity_id: String,
    payload: String,
    enqueued_at: String,
}

impl QueueRow {
    fn into_operation(self, kind: EntityKind) -> Result<PendingOperation> {
        Ok(PendingOperation {
            seq: self.seq,
            kind,
            op: self.op.parse()?,
            entity_id: EntityId::from(self.entity_id),
            payload: serde_json::from_str(&self.payload)
                .with_context(|| format!("Corrupt payload in {} (seq {})", kind.queue_table(), self.seq))?,
            enqueued_at: datetime::parse_storage(&self.enqueued_at)?,
        })
    }
}

/// Repository for both pending-operation queues.
pub struct QueueRepository;

impl QueueRepository {
    /// Append an operation. Returns its sequence number.
    pub async fn enqueue<C>(
        conn: &C,
        kind: EntityKind,
        op: OperationKind,
        entity_id: &EntityId,
        payload: &serde_json::Value,
    ) -> Result<i64>
    where
        C: ConnectionTrait,
    {
        let sql = format!(
            "INSERT INTO {} (op, entity_id, payload, enqueued_at) VALUES (?, ?, ?, ?)",
            kind.queue_table()
        );
        let values: Vec<Value> = vec![
            op.as_str().into(),
            entity_id.as_str().into(),
            payload.to_string().into(),
            datetime::format_storage(datetime::now()).into(),
        ];
        let result = conn.execute(statement(&sql, values)).await?;
        Ok(result.last_insert_id() as i64)
    }

    /// Every queued operation of `kind`, oldest first.
    pub async fn list<C>(conn: &C, kind: EntityKind) -> Result<Vec<PendingOperation>>
    where
        C: ConnectionTrait,
    {
        let sql = format!(
            "SELECT seq, op, entity_id, payload, enqueued_at FROM {} ORDER BY seq ASC",
            kind.queue_table()
        );
        Self::fetch(conn, kind, &sql, Vec::new()).await
    }

    /// Queued operations for one entity, oldest first.
    pub async fn list_for<C>(conn: &C, kind: EntityKind, entity_id: &EntityId) -> Result<Vec<PendingOperation>>
    where
        C: ConnectionTrait,
    {
        let sql = format!(
            "SELECT seq, op, entity_id, payload, enqueued_at FROM {} WHERE entity_id = ? ORDER BY seq ASC",
            kind.queue_table()
        );
        Self::fetch(conn, kind, &sql, vec![entity_id.as_str().into()]).await
    }

    /// The queued `create` for an entity, if any.
    pub async fn find_create<C>(conn: &C, kind: EntityKind, entity_id: &EntityId) -> Result<Option<PendingOperation>>
    where
        C: ConnectionTrait,
    {
        Ok(Self::list_for(conn, kind, entity_id)
            .await?
            .into_iter()
            .find(|op| op.op == OperationKind::Create))
    }

    /// The most recently queued operation for an entity, if any.
    pub async fn last_for<C>(conn: &C, kind: EntityKind, entity_id: &EntityId) -> Result<Option<PendingOperation>>
    where
        C: ConnectionTrait,
    {
        Ok(Self::list_for(conn, kind, entity_id).await?.pop())
    }

    pub async fn remove<C>(conn: &C, kind: EntityKind, seq: i64) -> Result<bool>
    where
        C: ConnectionTrait,
    {
        let sql = format!("DELETE FROM {} WHERE seq = ?", kind.queue_table());
        let result = conn.execute(statement(&sql, vec![seq.into()])).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drop every queued operation for an entity.
    pub async fn remove_by_entity_id<C>(conn: &C, kind: EntityKind, entity_id: &EntityId) -> Result<u64>
    where
        C: ConnectionTrait,
    {
        let sql = format!("DELETE FROM {} WHERE entity_id = ?", kind.queue_table());
        let result = conn
            .execute(statement(&sql, vec![entity_id.as_str().into()]))
            .await?;
        Ok(result.rows_affected())
    }

    /// Drop queued updates and renames for an entity, keeping creates and deletes.
    pub async fn remove_updates_for<C>(conn: &C, kind: EntityKind, entity_id: &EntityId) -> Result<u64>
    where
        C: ConnectionTrait,
    {
        let sql = format!(
            "DELETE FROM {} WHERE entity_id = ? AND op IN (?, ?)",
            kind.queue_table()
        );
        let values: Vec<Value> = vec![
            entity_id.as_str().into(),
            OperationKind::Update.as_str().into(),
            OperationKind::Rename.as_str().into(),
        ];
        let result = conn.execute(statement(&sql, values)).await?;
        Ok(result.rows_affected())
    }

    /// Replace the snapshot of a queued operation.
    pub async fn update_payload<C>(conn: &C, kind: EntityKind, seq: i64, payload: &serde_json::Value) -> Result<bool>
    where
        C: ConnectionTrait,
    {
        let sql = format!("UPDATE {} SET payload = ? WHERE seq = ?", kind.queue_table());
        let values: Vec<Value> = vec![payload.to_string().into(), seq.into()];
        let result = conn.execute(statement(&sql, values)).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Rewrite every reference to `old` as `new` in both queues.
    ///
    /// Covers the `entity_id` column and every top-level payload field whose
    /// value is the old identifier (a task snapshot's `group_id`, for example).
    /// Returns the number of queue rows touched.
    pub async fn remap_entity_id<C>(conn: &C, old: &EntityId, new: &EntityId) -> Result<u64>
    where
        C: ConnectionTrait,
    {
        let mut touched = 0;

        for kind in [EntityKind::Group, EntityKind::Task] {
            for operation in Self::list(conn, kind).await? {
                let mut payload = operation.payload.clone();
                let payload_changed = rewrite_references(&mut payload, old.as_str(), new.as_str());
                let id_changed = operation.entity_id == *old;
                if !payload_changed && !id_changed {
                    continue;
                }

                let entity_id = if id_changed { new.as_str() } else { operation.entity_id.as_str() };
                let sql = format!(
                    "UPDATE {} SET entity_id = ?, payload = ? WHERE seq = ?",
                    kind.queue_table()
                );
                let values: Vec<Value> = vec![entity_id.into(), payload.to_string().into(), operation.seq.into()];
                conn.execute(statement(&sql, values)).await?;
                touched += 1;
            }
        }

        Ok(touched)
    }

    /// Whether any queued operation of either kind mentions `id`.
    pub async fn references<C>(conn: &C, id: &EntityId) -> Result<bool>
    where
        C: ConnectionTrait,
    {
        for kind in [EntityKind::Group, EntityKind::Task] {
            for operation in Self::list(conn, kind).await? {
                if operation.entity_id == *id || payload_mentions(&operation.payload, id.as_str()) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    pub async fn clear<C>(conn: &C, kind: EntityKind) -> Result<u64>
    where
        C: ConnectionTrait,
    {
        let sql = format!("DELETE FROM {}", kind.queue_table());
        let result = conn.execute(statement(&sql, Vec::new())).await?;
        Ok(result.rows_affected())
    }

    pub async fn count<C>(conn: &C, kind: EntityKind) -> Result<u64>
    where
        C: ConnectionTrait,
    {
        let sql = format!("SELECT COUNT(*) AS count FROM {}", kind.queue_table());
        count(conn, &sql, Vec::new()).await
    }

    /// Whether an entity still has operations waiting for the remote store.
    pub async fn has_pending<C>(conn: &C, kind: EntityKind, entity_id: &EntityId) -> Result<bool>
    where
        C: ConnectionTrait,
    {
        let sql = format!("SELECT COUNT(*) AS count FROM {} WHERE entity_id = ?", kind.queue_table());
        Ok(count(conn, &sql, vec![entity_id.as_str().into()]).await? > 0)
    }

    async fn fetch<C>(conn: &C, kind: EntityKind, sql: &str, values: Vec<Value>) -> Result<Vec<PendingOperation>>
    where
        C: ConnectionTrait,
    {
        QueueRow::find_by_statement(statement(sql, values))
            .all(conn)
            .await?
            .into_iter()
            .map(|row| row.into_operation(kind))
            .collect()
    }
}

fn rewrite_references(payload: &mut serde_json::Value, old: &str, new: &str) -> bool {
    let Some(fields) = payload.as_object_mut() else {
        return false;
    };

    let mut changed = false;
    for value in fields.values_mut() {
        if value.as_str() == Some(old) {
            *value = serde_json::Value::String(new.to_string());
            changed = true;
        }
    }
    changed
}

fn payload_mentions(payload: &serde_json::Value, id: &str) -> bool {
    payload
        .as_object()
        .map(|fields| fields.values().any(|value| value.as_str() == Some(id)))
        .unwrap_or(false)
}
