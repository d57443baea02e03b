//! Serialized entity state carried by queued operations.
//!
//! A snapshot holds everything needed to replay an operation against the
//! remote store. Identifier-valued fields are plain top-level strings so
//! [`crate::repositories::QueueRepository::remap_entity_id`] can rewrite them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{CreateGroupArgs, CreateTaskArgs, UpdateGroupArgs, UpdateTaskArgs};
use crate::entities::{group, task};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub group_id: String,
    pub is_completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskSnapshot {
    pub fn create_args(&self) -> CreateTaskArgs {
        CreateTaskArgs {
            user_id: self.user_id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            group_remote_id: self.group_id.clone(),
            is_completed: self.is_completed,
        }
    }

    pub fn update_args(&self) -> UpdateTaskArgs {
        UpdateTaskArgs {
            title: self.title.clone(),
            description: self.description.clone(),
            group_remote_id: self.group_id.clone(),
            is_completed: self.is_completed,
        }
    }

    /// Whether a row still holds the user-visible state this snapshot captured.
    pub fn matches(&self, row: &task::Model) -> bool {
        self.title == row.title
            && self.description == row.description
            && self.group_id == row.group_id
            && self.is_completed == row.is_completed
    }
}

impl From<&task::Model> for TaskSnapshot {
    fn from(model: &task::Model) -> Self {
        TaskSnapshot {
            id: model.id.clone(),
            user_id: model.user_id.clone(),
            title: model.title.clone(),
            description: model.description.clone(),
            group_id: model.group_id.clone(),
            is_completed: model.is_completed,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl GroupSnapshot {
    pub fn create_args(&self) -> CreateGroupArgs {
        CreateGroupArgs {
            user_id: self.user_id.clone(),
            name: self.name.clone(),
        }
    }

    pub fn update_args(&self) -> UpdateGroupArgs {
        UpdateGroupArgs {
            name: self.name.clone(),
        }
    }
}

impl From<&group::Model> for GroupSnapshot {
    fn from(model: &group::Model) -> Self {
        GroupSnapshot {
            id: model.id.clone(),
            user_id: model.user_id.clone(),
            name: model.name.clone(),
            created_at: model.created_at,
        }
    }
}

/// Encode a snapshot for the queue.
pub(crate) fn to_payload<T: Serialize>(snapshot: &T) -> anyhow::Result<serde_json::Value> {
    Ok(serde_json::to_value(snapshot)?)
}
