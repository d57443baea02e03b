//! Group repository for database operations.

use anyhow::Result;
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveValue, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder};

use crate::entities::group;

/// Repository for group rows.
pub struct GroupRepository;

impl GroupRepository {
    fn to_active(model: &group::Model) -> group::ActiveModel {
        group::ActiveModel {
            id: ActiveValue::Set(model.id.clone()),
            user_id: ActiveValue::Set(model.user_id.clone()),
            name: ActiveValue::Set(model.name.clone()),
            created_at: ActiveValue::Set(model.created_at),
            synced: ActiveValue::Set(model.synced),
        }
    }

    pub async fn insert<C>(conn: &C, model: &group::Model) -> Result<()>
    where
        C: ConnectionTrait,
    {
        group::Entity::insert(Self::to_active(model))
            .exec_without_returning(conn)
            .await?;
        Ok(())
    }

    pub async fn get_by_id<C>(conn: &C, id: &str) -> Result<Option<group::Model>>
    where
        C: ConnectionTrait,
    {
        Ok(group::Entity::find_by_id(id.to_string()).one(conn).await?)
    }

    /// All groups of an owner ordered by name.
    pub async fn get_all<C>(conn: &C, owner: &str) -> Result<Vec<group::Model>>
    where
        C: ConnectionTrait,
    {
        Ok(group::Entity::find()
            .filter(group::Column::UserId.eq(owner))
            .order_by_asc(group::Column::Name)
            .order_by_asc(group::Column::CreatedAt)
            .all(conn)
            .await?)
    }

    /// Case-insensitive lookup by name. A permanent row wins over a temporary one.
    pub async fn find_by_name<C>(conn: &C, owner: &str, name: &str) -> Result<Option<group::Model>>
    where
        C: ConnectionTrait,
    {
        let wanted = name.trim().to_lowercase();
        let mut matches: Vec<group::Model> = Self::get_all(conn, owner)
            .await?
            .into_iter()
            .filter(|g| g.name.trim().to_lowercase() == wanted)
            .collect();
        matches.sort_by_key(|g| g.entity_id().is_temporary());
        Ok(matches.into_iter().next())
    }

    /// Overwrite every column of an existing row. Returns whether a row matched.
    pub async fn update<C>(conn: &C, model: &group::Model) -> Result<bool>
    where
        C: ConnectionTrait,
    {
        let result = group::Entity::update_many()
            .set(Self::to_active(model))
            .filter(group::Column::Id.eq(model.id.as_str()))
            .exec(conn)
            .await?;
        Ok(result.rows_affected > 0)
    }

    pub async fn delete<C>(conn: &C, id: &str) -> Result<bool>
    where
        C: ConnectionTrait,
    {
        let result = group::Entity::delete_by_id(id.to_string()).exec(conn).await?;
        Ok(result.rows_affected > 0)
    }

    /// Mark a row as acknowledged, provided its name is still the pushed one.
    pub async fn mark_synced<C>(conn: &C, id: &str, pushed_name: &str) -> Result<bool>
    where
        C: ConnectionTrait,
    {
        let result = group::Entity::update_many()
            .col_expr(group::Column::Synced, Expr::value(true))
            .filter(group::Column::Id.eq(id))
            .filter(group::Column::Name.eq(pushed_name))
            .exec(conn)
            .await?;
        Ok(result.rows_affected > 0)
    }
}
