//! Tombstones: records of local deletes that suppress re-insertion from a remote fetch.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, Value};

use super::{count, statement};
use crate::identifier::EntityKind;
use crate::utils::datetime;

pub struct TombstoneRepository;

impl TombstoneRepository {
    /// Record a delete. Re-deleting refreshes the timestamp.
    pub async fn insert<C>(conn: &C, kind: EntityKind, id: &str, owner: &str) -> Result<()>
    where
        C: ConnectionTrait,
    {
        let sql = format!(
            "INSERT INTO {} (id, user_id, deleted_at) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET deleted_at = excluded.deleted_at",
            kind.tombstone_table()
        );
        let values: Vec<Value> = vec![
            id.into(),
            owner.into(),
            datetime::format_storage(datetime::now()).into(),
        ];
        conn.execute(statement(&sql, values)).await?;
        Ok(())
    }

    pub async fn is_tombstoned<C>(conn: &C, kind: EntityKind, id: &str) -> Result<bool>
    where
        C: ConnectionTrait,
    {
        let sql = format!("SELECT COUNT(*) AS count FROM {} WHERE id = ?", kind.tombstone_table());
        Ok(count(conn, &sql, vec![id.into()]).await? > 0)
    }

    /// Delete tombstones recorded before `cutoff`. Returns how many were removed.
    pub async fn prune<C>(conn: &C, kind: EntityKind, cutoff: DateTime<Utc>) -> Result<u64>
    where
        C: ConnectionTrait,
    {
        let sql = format!("DELETE FROM {} WHERE deleted_at < ?", kind.tombstone_table());
        let result = conn
            .execute(statement(&sql, vec![datetime::format_storage(cutoff).into()]))
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count<C>(conn: &C, kind: EntityKind) -> Result<u64>
    where
        C: ConnectionTrait,
    {
        let sql = format!("SELECT COUNT(*) AS count FROM {}", kind.tombstone_table());
        count(conn, &sql, Vec::new()).await
    }
}
