//! Promoted-id aliases: which remote id a temporary id was replaced by.
//!
//! Callers may still hold a temporary id after its entity was promoted. Every
//! lookup by id goes through [`AliasRepository::resolve`] so those ids keep
//! working until the alias is pruned.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, Value};

use super::{count, statement};
use crate::identifier::{EntityId, EntityKind};
use crate::utils::datetime;

pub struct AliasRepository;

impl AliasRepository {
    pub async fn record<C>(conn: &C, kind: EntityKind, temp: &EntityId, permanent: &EntityId) -> Result<()>
    where
        C: ConnectionTrait,
    {
        let sql = format!(
            "INSERT INTO {} (temp_id, permanent_id, promoted_at) VALUES (?, ?, ?) \
             ON CONFLICT(temp_id) DO UPDATE SET permanent_id = excluded.permanent_id, promoted_at = excluded.promoted_at",
            kind.alias_table()
        );
        let values: Vec<Value> = vec![
            temp.as_str().into(),
            permanent.as_str().into(),
            datetime::format_storage(datetime::now()).into(),
        ];
        conn.execute(statement(&sql, values)).await?;
        Ok(())
    }

    /// The permanent id `id` was promoted to, or `id` itself.
    pub async fn resolve<C>(conn: &C, kind: EntityKind, id: &EntityId) -> Result<EntityId>
    where
        C: ConnectionTrait,
    {
        if id.is_permanent() {
            return Ok(id.clone());
        }
        let sql = format!("SELECT permanent_id FROM {} WHERE temp_id = ?", kind.alias_table());
        let row = conn.query_one(statement(&sql, vec![id.as_str().into()])).await?;
        Ok(match row {
            Some(row) => EntityId::permanent(row.try_get::<String>("", "permanent_id")?),
            None => id.clone(),
        })
    }

    /// Delete aliases recorded before `cutoff`. Returns how many were removed.
    pub async fn prune<C>(conn: &C, kind: EntityKind, cutoff: DateTime<Utc>) -> Result<u64>
    where
        C: ConnectionTrait,
    {
        let sql = format!("DELETE FROM {} WHERE promoted_at < ?", kind.alias_table());
        let result = conn
            .execute(statement(&sql, vec![datetime::format_storage(cutoff).into()]))
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count<C>(conn: &C, kind: EntityKind) -> Result<u64>
    where
        C: ConnectionTrait,
    {
        let sql = format!("SELECT COUNT(*) AS count FROM {}", kind.alias_table());
        count(conn, &sql, Vec::new()).await
    }
}
