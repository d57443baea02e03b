//! Entity identifiers.
//!
//! Every task and group row is keyed by a string. Rows created while the remote
//! store has not acknowledged them carry a locally generated placeholder; once
//! the remote store assigns its own id the row is promoted. [`EntityId`] makes
//! that distinction explicit so routing decisions are exhaustive matches rather
//! than prefix checks scattered through the engines.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::constants::{
    TABLE_DELETED_GROUPS, TABLE_DELETED_TASKS, TABLE_GROUP_QUEUE, TABLE_PROMOTED_GROUPS, TABLE_PROMOTED_TASKS,
    TABLE_TASK_QUEUE, TEMP_ID_PREFIX, TEMP_ID_RANDOM_LEN,
};

/// The two entity types the engine synchronizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Task,
    Group,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Task => "task",
            EntityKind::Group => "group",
        }
    }

    /// Local table holding pending operations for this kind.
    pub fn queue_table(&self) -> &'static str {
        match self {
            EntityKind::Task => TABLE_TASK_QUEUE,
            EntityKind::Group => TABLE_GROUP_QUEUE,
        }
    }

    /// Local table holding tombstones for this kind.
    pub fn tombstone_table(&self) -> &'static str {
        match self {
            EntityKind::Task => TABLE_DELETED_TASKS,
            EntityKind::Group => TABLE_DELETED_GROUPS,
        }
    }

    /// Local table mapping promoted temporary ids to their remote ids.
    pub fn alias_table(&self) -> &'static str {
        match self {
            EntityKind::Task => TABLE_PROMOTED_TASKS,
            EntityKind::Group => TABLE_PROMOTED_GROUPS,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a task or group.
///
/// The persisted form is a plain string; temporary identifiers look like
/// `temp_<entity>_<millis>_<random>`. [`From<String>`] is the only place that
/// interprets that encoding.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityId {
    /// Placeholder assigned locally, not yet known to the remote store
    Temporary(String),
    /// Identifier assigned by the remote store
    Permanent(String),
}

impl EntityId {
    /// Generate a fresh temporary identifier for `kind`.
    pub fn temporary(kind: EntityKind) -> Self {
        let random: String = Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(TEMP_ID_RANDOM_LEN)
            .collect();
        EntityId::Temporary(format!(
            "{}{}_{}_{}",
            TEMP_ID_PREFIX,
            kind.as_str(),
            Utc::now().timestamp_millis(),
            random
        ))
    }

    pub fn permanent(id: impl Into<String>) -> Self {
        EntityId::Permanent(id.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            EntityId::Temporary(token) | EntityId::Permanent(token) => token,
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, EntityId::Temporary(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, EntityId::Permanent(_))
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        if value.starts_with(TEMP_ID_PREFIX) {
            EntityId::Temporary(value)
        } else {
            EntityId::Permanent(value)
        }
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        EntityId::from(value.to_string())
    }
}

impl From<EntityId> for String {
    fn from(value: EntityId) -> Self {
        match value {
            EntityId::Temporary(token) | EntityId::Permanent(token) => token,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
