//! Task repository for database operations.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveValue, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder};

use crate::entities::task;

/// Repository for task rows.
pub struct TaskRepository;

impl TaskRepository {
    fn to_active(model: &task::Model) -> task::ActiveModel {
        task::ActiveModel {
            id: ActiveValue::Set(model.id.clone()),
            user_id: ActiveValue::Set(model.user_id.clone()),
            title: ActiveValue::Set(model.title.clone()),
            description: ActiveValue::Set(model.description.clone()),
            group_id: ActiveValue::Set(model.group_id.clone()),
            is_completed: ActiveValue::Set(model.is_completed),
            created_at: ActiveValue::Set(model.created_at),
            updated_at: ActiveValue::Set(model.updated_at),
            synced: ActiveValue::Set(model.synced),
        }
    }

    /// Insert a new task row.
    pub async fn insert<C>(conn: &C, model: &task::Model) -> Result<()>
    where
        C: ConnectionTrait,
    {
        task::Entity::insert(Self::to_active(model))
            .exec_without_returning(conn)
            .await?;
        Ok(())
    }

    /// Get a single task by id.
    pub async fn get_by_id<C>(conn: &C, id: &str) -> Result<Option<task::Model>>
    where
        C: ConnectionTrait,
    {
        Ok(task::Entity::find_by_id(id.to_string()).one(conn).await?)
    }

    /// All tasks of an owner, newest first.
    pub async fn get_all<C>(conn: &C, owner: &str) -> Result<Vec<task::Model>>
    where
        C: ConnectionTrait,
    {
        Ok(task::Entity::find()
            .filter(task::Column::UserId.eq(owner))
            .order_by_desc(task::Column::CreatedAt)
            .order_by_asc(task::Column::Id)
            .all(conn)
            .await?)
    }

    /// Tasks of an owner inside one group, newest first.
    pub async fn get_for_group<C>(conn: &C, owner: &str, group_id: &str) -> Result<Vec<task::Model>>
    where
        C: ConnectionTrait,
    {
        Ok(task::Entity::find()
            .filter(task::Column::UserId.eq(owner))
            .filter(task::Column::GroupId.eq(group_id))
            .order_by_desc(task::Column::CreatedAt)
            .order_by_asc(task::Column::Id)
            .all(conn)
            .await?)
    }

    /// Tasks of an owner filtered by completion, newest first.
    pub async fn get_by_status<C>(conn: &C, owner: &str, completed: bool) -> Result<Vec<task::Model>>
    where
        C: ConnectionTrait,
    {
        Ok(task::Entity::find()
            .filter(task::Column::UserId.eq(owner))
            .filter(task::Column::IsCompleted.eq(completed))
            .order_by_desc(task::Column::CreatedAt)
            .order_by_asc(task::Column::Id)
            .all(conn)
            .await?)
    }

    /// Overwrite every column of an existing row. Returns whether a row matched.
    pub async fn update<C>(conn: &C, model: &task::Model) -> Result<bool>
    where
        C: ConnectionTrait,
    {
        let result = task::Entity::update_many()
            .set(Self::to_active(model))
            .filter(task::Column::Id.eq(model.id.as_str()))
            .exec(conn)
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Overwrite a row with a remote version, but only while the local copy is still synced.
    pub async fn apply_remote<C>(conn: &C, model: &task::Model) -> Result<bool>
    where
        C: ConnectionTrait,
    {
        let mut active = Self::to_active(model);
        active.synced = ActiveValue::Set(true);
        let result = task::Entity::update_many()
            .set(active)
            .filter(task::Column::Id.eq(model.id.as_str()))
            .filter(task::Column::Synced.eq(true))
            .exec(conn)
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Delete a task row. Returns whether a row was removed.
    pub async fn delete<C>(conn: &C, id: &str) -> Result<bool>
    where
        C: ConnectionTrait,
    {
        let result = task::Entity::delete_by_id(id.to_string()).exec(conn).await?;
        Ok(result.rows_affected > 0)
    }

    /// Point every task referencing `old_group` at `new_group`.
    pub async fn reassign_group<C>(conn: &C, old_group: &str, new_group: &str) -> Result<u64>
    where
        C: ConnectionTrait,
    {
        let result = task::Entity::update_many()
            .col_expr(task::Column::GroupId, Expr::value(new_group))
            .filter(task::Column::GroupId.eq(old_group))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    /// Mark a row as acknowledged by the remote store.
    ///
    /// Only applies while the row still carries `pushed_at` as its `updated_at`,
    /// i.e. nothing changed locally since the push began. The caller checks the
    /// queue for newer operations first. `remote_updated_at` becomes the row's
    /// new `updated_at` so later fetches compare against the remote clock.
    pub async fn mark_synced<C>(
        conn: &C,
        id: &str,
        pushed_at: DateTime<Utc>,
        remote_updated_at: DateTime<Utc>,
    ) -> Result<bool>
    where
        C: ConnectionTrait,
    {
        let result = task::Entity::update_many()
            .col_expr(task::Column::Synced, Expr::value(true))
            .col_expr(task::Column::UpdatedAt, Expr::value(remote_updated_at))
            .filter(task::Column::Id.eq(id))
            .filter(task::Column::UpdatedAt.eq(pushed_at))
            .exec(conn)
            .await?;
        Ok(result.rows_affected > 0)
    }
}
