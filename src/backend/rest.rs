//! PostgREST-style HTTPS backend.
//!
//! Rows live in two tables addressed as `{base_url}/rest/v1/{table}`. Requests
//! carry the API key both as `apikey` and as a bearer token, and writes ask for
//! the affected rows back with `Prefer: return=representation`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{
    Backend, BackendError, BackendGroup, BackendTask, CreateGroupArgs, CreateTaskArgs, UpdateGroupArgs,
    UpdateTaskArgs,
};
use crate::constants::{DEFAULT_REMOTE_GROUPS_TABLE, DEFAULT_REMOTE_TASKS_TABLE};

#[derive(Debug, Deserialize)]
struct TaskRow {
    id: String,
    user_id: String,
    title: String,
    description: Option<String>,
    group_id: String,
    is_completed: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TaskRow> for BackendTask {
    fn from(row: TaskRow) -> Self {
        BackendTask {
            remote_id: row.id,
            user_id: row.user_id,
            title: row.title,
            description: row.description,
            group_remote_id: row.group_id,
            is_completed: row.is_completed,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GroupRow {
    id: String,
    user_id: String,
    name: String,
    created_at: DateTime<Utc>,
}

impl From<GroupRow> for BackendGroup {
    fn from(row: GroupRow) -> Self {
        BackendGroup {
            remote_id: row.id,
            user_id: row.user_id,
            name: row.name,
            created_at: row.created_at,
        }
    }
}

#[derive(Serialize)]
struct NewTaskBody<'a> {
    user_id: &'a str,
    title: &'a str,
    description: Option<&'a str>,
    group_id: &'a str,
    is_completed: bool,
}

#[derive(Serialize)]
struct TaskPatchBody<'a> {
    title: &'a str,
    description: Option<&'a str>,
    group_id: &'a str,
    is_completed: bool,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct NewGroupBody<'a> {
    user_id: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
struct GroupPatchBody<'a> {
    name: &'a str,
}

/// Remote store reached over HTTPS.
pub struct RestBackend {
    client: Client,
    base_url: String,
    api_key: String,
    tasks_table: String,
    groups_table: String,
}

impl RestBackend {
    /// Create a client for `base_url` using the default table names.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            tasks_table: DEFAULT_REMOTE_TASKS_TABLE.to_string(),
            groups_table: DEFAULT_REMOTE_GROUPS_TABLE.to_string(),
        })
    }

    /// Override the remote table names.
    pub fn with_tables(mut self, tasks_table: impl Into<String>, groups_table: impl Into<String>) -> Self {
        self.tasks_table = tasks_table.into();
        self.groups_table = groups_table.into();
        self
    }

    fn table_url(&self, table: &str, query: &[(&str, String)]) -> Result<Url, BackendError> {
        let mut url = Url::parse(&format!("{}/rest/v1/{}", self.base_url, table))
            .map_err(|e| BackendError::Other(format!("Invalid remote URL: {e}")))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Prefer", "return=representation")
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        let response = self.authorized(request).send().await.map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Auth(message),
            StatusCode::NOT_FOUND => BackendError::NotFound(message),
            _ => BackendError::Rejected {
                status: status.as_u16(),
                message,
            },
        })
    }

    async fn rows<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Vec<T>, BackendError> {
        let response = self.send(request).await?;
        response
            .json::<Vec<T>>()
            .await
            .map_err(|e| BackendError::InvalidData(e.to_string()))
    }

    async fn single_row<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T, BackendError> {
        self.rows::<T>(request)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::NotFound(what.to_string()))
    }

    fn by_id(id: &str) -> Vec<(&'static str, String)> {
        vec![("id", format!("eq.{id}"))]
    }
}

fn map_transport_error(error: reqwest::Error) -> BackendError {
    if error.is_decode() {
        BackendError::InvalidData(error.to_string())
    } else {
        BackendError::Network(error.to_string())
    }
}

#[async_trait]
impl Backend for RestBackend {
    fn backend_type(&self) -> &str {
        "rest"
    }

    async fn fetch_tasks(&self, owner: &str) -> Result<Vec<BackendTask>, BackendError> {
        let url = self.table_url(
            &self.tasks_table,
            &[
                ("select", "*".to_string()),
                ("user_id", format!("eq.{owner}")),
                ("order", "created_at.desc".to_string()),
            ],
        )?;
        let rows: Vec<TaskRow> = self.rows(self.client.get(url)).await?;
        debug!("Fetched {} task rows from {}", rows.len(), self.tasks_table);
        Ok(rows.into_iter().map(BackendTask::from).collect())
    }

    async fn create_task(&self, args: CreateTaskArgs) -> Result<BackendTask, BackendError> {
        let url = self.table_url(&self.tasks_table, &[])?;
        let body = NewTaskBody {
            user_id: &args.user_id,
            title: &args.title,
            description: args.description.as_deref(),
            group_id: &args.group_remote_id,
            is_completed: args.is_completed,
        };
        let row: TaskRow = self
            .single_row(self.client.post(url).json(&body), "inserted task")
            .await?;
        Ok(row.into())
    }

    async fn update_task(&self, remote_id: &str, args: UpdateTaskArgs) -> Result<BackendTask, BackendError> {
        let url = self.table_url(&self.tasks_table, &Self::by_id(remote_id))?;
        let body = TaskPatchBody {
            title: &args.title,
            description: args.description.as_deref(),
            group_id: &args.group_remote_id,
            is_completed: args.is_completed,
            updated_at: Utc::now(),
        };
        let row: TaskRow = self
            .single_row(self.client.patch(url).json(&body), &format!("task {remote_id}"))
            .await?;
        Ok(row.into())
    }

    async fn delete_task(&self, remote_id: &str) -> Result<(), BackendError> {
        let url = self.table_url(&self.tasks_table, &Self::by_id(remote_id))?;
        let _: TaskRow = self
            .single_row(self.client.delete(url), &format!("task {remote_id}"))
            .await?;
        Ok(())
    }

    async fn fetch_groups(&self, owner: &str) -> Result<Vec<BackendGroup>, BackendError> {
        let url = self.table_url(
            &self.groups_table,
            &[
                ("select", "*".to_string()),
                ("user_id", format!("eq.{owner}")),
                ("order", "name.asc".to_string()),
            ],
        )?;
        let rows: Vec<GroupRow> = self.rows(self.client.get(url)).await?;
        debug!("Fetched {} group rows from {}", rows.len(), self.groups_table);
        Ok(rows.into_iter().map(BackendGroup::from).collect())
    }

    async fn find_group_by_name(&self, owner: &str, name: &str) -> Result<Option<BackendGroup>, BackendError> {
        let url = self.table_url(
            &self.groups_table,
            &[
                ("select", "*".to_string()),
                ("user_id", format!("eq.{owner}")),
                ("name", format!("ilike.{}", name.trim())),
                ("order", "created_at.asc".to_string()),
            ],
        )?;
        let wanted = name.trim().to_lowercase();
        let rows: Vec<GroupRow> = self.rows(self.client.get(url)).await?;
        Ok(rows
            .into_iter()
            .find(|row| row.name.trim().to_lowercase() == wanted)
            .map(BackendGroup::from))
    }

    async fn create_group(&self, args: CreateGroupArgs) -> Result<BackendGroup, BackendError> {
        let url = self.table_url(&self.groups_table, &[])?;
        let body = NewGroupBody {
            user_id: &args.user_id,
            name: &args.name,
        };
        let row: GroupRow = self
            .single_row(self.client.post(url).json(&body), "inserted group")
            .await?;
        Ok(row.into())
    }

    async fn update_group(&self, remote_id: &str, args: UpdateGroupArgs) -> Result<BackendGroup, BackendError> {
        let url = self.table_url(&self.groups_table, &Self::by_id(remote_id))?;
        let body = GroupPatchBody { name: &args.name };
        let row: GroupRow = self
            .single_row(self.client.patch(url).json(&body), &format!("group {remote_id}"))
            .await?;
        Ok(row.into())
    }

    async fn delete_group(&self, remote_id: &str) -> Result<(), BackendError> {
        let url = self.table_url(&self.groups_table, &Self::by_id(remote_id))?;
        let _: GroupRow = self
            .single_row(self.client.delete(url), &format!("group {remote_id}"))
            .await?;
        Ok(())
    }
}
