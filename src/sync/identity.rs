//! Promotion of temporary identifiers.
//!
//! Once the remote store acknowledges a create, the temporary row is replaced
//! by a row keyed by the remote id and every local reference to the old id is
//! rewritten: task rows pointing at a promoted group, and queued operations of
//! either kind whose entity id or snapshot mentions it. The old id is kept as
//! an alias of the new one.
//!
//! Every function here runs inside the caller's transaction. Events are the
//! caller's job once the transaction has committed.

use anyhow::Result;
use log::{debug, info};
use sea_orm::ConnectionTrait;

use super::queue_mutation;
use super::snapshot::{to_payload, GroupSnapshot, TaskSnapshot};
use crate::backend::{BackendGroup, BackendTask};
use crate::entities::{group, task};
use crate::identifier::{EntityId, EntityKind};
use crate::repositories::{
    AliasRepository, GroupRepository, OperationKind, QueueRepository, TaskRepository, TombstoneRepository,
};
use crate::utils::datetime;

/// Result of promoting one entity.
#[derive(Clone, Debug, PartialEq)]
pub enum Promotion<M> {
    /// The permanent row now exists locally.
    Promoted {
        row: M,
        /// The row changed while the create was in flight and a follow-up
        /// mutation has been queued.
        follow_up_queued: bool,
    },
    /// The temporary row was deleted while its create was in flight. The
    /// permanent id is tombstoned and a delete for it is queued.
    Vanished { permanent: EntityId },
}

pub struct IdentityResolver;

impl IdentityResolver {
    /// Fresh temporary identifier for a locally created entity.
    pub fn assign(kind: EntityKind) -> EntityId {
        EntityId::temporary(kind)
    }

    /// Replace temporary task `temp` by the remote record `remote`.
    ///
    /// `pushed` is the snapshot that was sent; if the local row no longer
    /// matches it, the local state is kept and re-queued as an update.
    pub async fn promote_task<C>(
        conn: &C,
        temp: &EntityId,
        remote: &BackendTask,
        pushed: &TaskSnapshot,
    ) -> Result<Promotion<task::Model>>
    where
        C: ConnectionTrait,
    {
        let permanent = EntityId::permanent(remote.remote_id.clone());
        Self::drop_creates(conn, EntityKind::Task, temp).await?;
        AliasRepository::record(conn, EntityKind::Task, temp, &permanent).await?;

        let Some(local) = TaskRepository::get_by_id(conn, temp.as_str()).await? else {
            QueueRepository::remove_by_entity_id(conn, EntityKind::Task, temp).await?;
            let mut tombstoned = pushed.clone();
            tombstoned.id = permanent.to_string();
            Self::queue_vanished_delete(conn, EntityKind::Task, &permanent, &remote.user_id, to_payload(&tombstoned)?)
                .await?;
            return Ok(Promotion::Vanished { permanent });
        };

        let in_sync = pushed.matches(&local);
        let mut row = if in_sync {
            task::Model {
                id: permanent.to_string(),
                user_id: local.user_id.clone(),
                title: remote.title.clone(),
                description: remote.description.clone(),
                group_id: remote.group_remote_id.clone(),
                is_completed: remote.is_completed,
                created_at: remote.created_at,
                updated_at: remote.updated_at,
                synced: true,
            }
        } else {
            task::Model {
                id: permanent.to_string(),
                created_at: remote.created_at,
                updated_at: datetime::next_stamp(local.updated_at.max(remote.updated_at)),
                synced: false,
                ..local.clone()
            }
        };

        TaskRepository::delete(conn, temp.as_str()).await?;
        Self::upsert_task(conn, &row).await?;
        let remapped = QueueRepository::remap_entity_id(conn, temp, &permanent).await?;

        if !in_sync {
            queue_mutation(
                conn,
                EntityKind::Task,
                OperationKind::Update,
                &permanent,
                &to_payload(&TaskSnapshot::from(&row))?,
            )
            .await?;
        } else if QueueRepository::has_pending(conn, EntityKind::Task, &permanent).await? {
            row.synced = false;
            TaskRepository::update(conn, &row).await?;
        }

        debug!("Promoted task {temp} -> {permanent} ({remapped} queued references rewritten)");
        Ok(Promotion::Promoted {
            row,
            follow_up_queued: !in_sync,
        })
    }

    /// Replace temporary group `temp` by the remote record `remote`.
    ///
    /// `pushed_name` is the name that was sent (or matched, when adopting an
    /// existing remote group). Tasks referencing the temporary id are moved to
    /// the permanent one.
    pub async fn promote_group<C>(
        conn: &C,
        temp: &EntityId,
        remote: &BackendGroup,
        pushed_name: &str,
    ) -> Result<Promotion<group::Model>>
    where
        C: ConnectionTrait,
    {
        let permanent = EntityId::permanent(remote.remote_id.clone());
        Self::drop_creates(conn, EntityKind::Group, temp).await?;
        AliasRepository::record(conn, EntityKind::Group, temp, &permanent).await?;

        let reassigned = TaskRepository::reassign_group(conn, temp.as_str(), permanent.as_str()).await?;

        let Some(local) = GroupRepository::get_by_id(conn, temp.as_str()).await? else {
            QueueRepository::remove_by_entity_id(conn, EntityKind::Group, temp).await?;
            QueueRepository::remap_entity_id(conn, temp, &permanent).await?;
            let snapshot = GroupSnapshot {
                id: permanent.to_string(),
                user_id: remote.user_id.clone(),
                name: remote.name.clone(),
                created_at: remote.created_at,
            };
            Self::queue_vanished_delete(conn, EntityKind::Group, &permanent, &remote.user_id, to_payload(&snapshot)?)
                .await?;
            return Ok(Promotion::Vanished { permanent });
        };

        let in_sync = local.name == pushed_name;
        let mut row = group::Model {
            id: permanent.to_string(),
            user_id: local.user_id.clone(),
            name: if in_sync { remote.name.clone() } else { local.name.clone() },
            created_at: remote.created_at,
            synced: in_sync,
        };

        GroupRepository::delete(conn, temp.as_str()).await?;
        Self::upsert_group(conn, &row).await?;
        let remapped = QueueRepository::remap_entity_id(conn, temp, &permanent).await?;

        if !in_sync {
            queue_mutation(
                conn,
                EntityKind::Group,
                OperationKind::Rename,
                &permanent,
                &to_payload(&GroupSnapshot::from(&row))?,
            )
            .await?;
        } else if QueueRepository::has_pending(conn, EntityKind::Group, &permanent).await? {
            row.synced = false;
            GroupRepository::update(conn, &row).await?;
        }

        info!(
            "🔗 Promoted group {temp} -> {permanent} ({reassigned} tasks moved, {remapped} queued references rewritten)"
        );
        Ok(Promotion::Promoted {
            row,
            follow_up_queued: !in_sync,
        })
    }

    async fn drop_creates<C>(conn: &C, kind: EntityKind, temp: &EntityId) -> Result<()>
    where
        C: ConnectionTrait,
    {
        for operation in QueueRepository::list_for(conn, kind, temp).await? {
            if operation.op == OperationKind::Create {
                QueueRepository::remove(conn, kind, operation.seq).await?;
            }
        }
        Ok(())
    }

    async fn queue_vanished_delete<C>(
        conn: &C,
        kind: EntityKind,
        permanent: &EntityId,
        owner: &str,
        payload: serde_json::Value,
    ) -> Result<()>
    where
        C: ConnectionTrait,
    {
        TombstoneRepository::insert(conn, kind, permanent.as_str(), owner).await?;
        QueueRepository::enqueue(conn, kind, OperationKind::Delete, permanent, &payload).await?;
        info!("🗑️  {kind} {permanent} was deleted locally while its create was in flight, delete queued");
        Ok(())
    }

    async fn upsert_task<C>(conn: &C, row: &task::Model) -> Result<()>
    where
        C: ConnectionTrait,
    {
        if TaskRepository::get_by_id(conn, &row.id).await?.is_some() {
            TaskRepository::update(conn, row).await?;
        } else {
            TaskRepository::insert(conn, row).await?;
        }
        Ok(())
    }

    async fn upsert_group<C>(conn: &C, row: &group::Model) -> Result<()>
    where
        C: ConnectionTrait,
    {
        if GroupRepository::get_by_id(conn, &row.id).await?.is_some() {
            GroupRepository::update(conn, row).await?;
        } else {
            GroupRepository::insert(conn, row).await?;
        }
        Ok(())
    }
}
