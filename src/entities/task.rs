use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::identifier::EntityId;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tasks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub group_id: String,
    pub is_completed: bool,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub synced: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn entity_id(&self) -> EntityId {
        EntityId::from(self.id.clone())
    }

    pub fn group_ref(&self) -> EntityId {
        EntityId::from(self.group_id.clone())
    }
}
