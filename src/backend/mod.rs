//! Remote store abstraction.
//!
//! This module defines the interface every remote relational store must
//! implement, the backend-agnostic record types exchanged with it, and the
//! error type used to classify failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod factory;
pub mod memory;
pub mod rest;

pub use memory::{InMemoryBackend, RemoteCall};
pub use rest::RestBackend;

/// Common error types for backend operations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Backend error: {0}")]
    Other(String),
}

impl BackendError {
    /// Whether the failure is a reachability problem rather than a refusal.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Network(_) => true,
            BackendError::Rejected { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }
}

/// Task as stored remotely.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendTask {
    pub remote_id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub group_remote_id: String,
    pub is_completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Group as stored remotely.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendGroup {
    pub remote_id: String,
    pub user_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Arguments for creating a new task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateTaskArgs {
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub group_remote_id: String,
    pub is_completed: bool,
}

/// Full replacement state for an existing task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateTaskArgs {
    pub title: String,
    pub description: Option<String>,
    pub group_remote_id: String,
    pub is_completed: bool,
}

/// Arguments for creating a new group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateGroupArgs {
    pub user_id: String,
    pub name: String,
}

/// Arguments for renaming a group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateGroupArgs {
    pub name: String,
}

/// Interface to the remote relational store.
///
/// Implementations must be safe to share between the foreground CRUD path and
/// the background drain.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Returns the backend type identifier (e.g., "rest", "memory").
    fn backend_type(&self) -> &str;

    // Tasks
    async fn fetch_tasks(&self, owner: &str) -> Result<Vec<BackendTask>, BackendError>;
    async fn create_task(&self, args: CreateTaskArgs) -> Result<BackendTask, BackendError>;
    async fn update_task(&self, remote_id: &str, args: UpdateTaskArgs) -> Result<BackendTask, BackendError>;
    async fn delete_task(&self, remote_id: &str) -> Result<(), BackendError>;

    // Groups
    async fn fetch_groups(&self, owner: &str) -> Result<Vec<BackendGroup>, BackendError>;
    /// Case-insensitive lookup of an owner's group by name.
    async fn find_group_by_name(&self, owner: &str, name: &str) -> Result<Option<BackendGroup>, BackendError>;
    async fn create_group(&self, args: CreateGroupArgs) -> Result<BackendGroup, BackendError>;
    async fn update_group(&self, remote_id: &str, args: UpdateGroupArgs) -> Result<BackendGroup, BackendError>;
    async fn delete_group(&self, remote_id: &str) -> Result<(), BackendError>;
}
