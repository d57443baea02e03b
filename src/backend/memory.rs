//! In-process remote store.
//!
//! Behaves like the HTTPS backend (server-assigned ids and timestamps,
//! owner-scoped reads) but keeps everything in memory. It records every call,
//! can be switched to unreachable, and can fail selected calls on demand, which
//! makes it the remote used by the test-suite and by offline demos.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    Backend, BackendError, BackendGroup, BackendTask, CreateGroupArgs, CreateTaskArgs, UpdateGroupArgs,
    UpdateTaskArgs,
};

/// A call received by [`InMemoryBackend`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteCall {
    FetchTasks { owner: String },
    CreateTask { title: String, group_id: String },
    UpdateTask { id: String },
    DeleteTask { id: String },
    FetchGroups { owner: String },
    FindGroupByName { owner: String, name: String },
    CreateGroup { name: String },
    UpdateGroup { id: String, name: String },
    DeleteGroup { id: String },
}

impl RemoteCall {
    /// Whether the call names `id`, as the target or as a task's group.
    pub fn mentions(&self, id: &str) -> bool {
        match self {
            RemoteCall::CreateTask { group_id, .. } => group_id == id,
            RemoteCall::UpdateTask { id: target }
            | RemoteCall::DeleteTask { id: target }
            | RemoteCall::UpdateGroup { id: target, .. }
            | RemoteCall::DeleteGroup { id: target } => target == id,
            _ => false,
        }
    }

    /// Whether the call changes remote state.
    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            RemoteCall::FetchTasks { .. } | RemoteCall::FetchGroups { .. } | RemoteCall::FindGroupByName { .. }
        )
    }
}

/// Call categories that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailPoint {
    FetchTasks,
    CreateTask,
    UpdateTask,
    DeleteTask,
    FetchGroups,
    FindGroupByName,
    CreateGroup,
    UpdateGroup,
    DeleteGroup,
}

#[derive(Default)]
struct RemoteState {
    tasks: BTreeMap<String, BackendTask>,
    groups: BTreeMap<String, BackendGroup>,
    calls: Vec<RemoteCall>,
    unreachable: bool,
    failures: HashMap<FailPoint, Vec<BackendError>>,
}

/// Remote store held entirely in memory.
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<RemoteState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        // A poisoned lock only means a test thread panicked mid-call; the data is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every subsequent call fail with a network error (or succeed again).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Fail the next call of the given category with `error`.
    pub fn fail_next(&self, point: FailPoint, error: BackendError) {
        self.state().failures.entry(point).or_default().push(error);
    }

    /// Insert a task as if another device had created it.
    pub fn seed_task(&self, task: BackendTask) {
        self.state().tasks.insert(task.remote_id.clone(), task);
    }

    /// Insert a group as if another device had created it.
    pub fn seed_group(&self, group: BackendGroup) {
        self.state().groups.insert(group.remote_id.clone(), group);
    }

    /// Move a stored task's `updated_at`, simulating an edit made elsewhere.
    pub fn touch_task(&self, remote_id: &str, updated_at: DateTime<Utc>) -> bool {
        match self.state().tasks.get_mut(remote_id) {
            Some(task) => {
                task.updated_at = updated_at;
                true
            }
            None => false,
        }
    }

    /// Remove a task as if another device had deleted it.
    pub fn remove_task(&self, remote_id: &str) -> bool {
        self.state().tasks.remove(remote_id).is_some()
    }

    pub fn tasks(&self) -> Vec<BackendTask> {
        self.state().tasks.values().cloned().collect()
    }

    pub fn groups(&self) -> Vec<BackendGroup> {
        self.state().groups.values().cloned().collect()
    }

    pub fn task(&self, remote_id: &str) -> Option<BackendTask> {
        self.state().tasks.get(remote_id).cloned()
    }

    pub fn group(&self, remote_id: &str) -> Option<BackendGroup> {
        self.state().groups.get(remote_id).cloned()
    }

    /// Every call received so far, oldest first.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    /// Calls that changed remote state.
    pub fn write_calls(&self) -> Vec<RemoteCall> {
        self.calls().into_iter().filter(RemoteCall::is_write).collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Record `call` and decide whether it should fail.
    fn enter(&self, call: RemoteCall, point: FailPoint) -> Result<MutexGuard<'_, RemoteState>, BackendError> {
        let mut state = self.state();
        state.calls.push(call);
        if state.unreachable {
            return Err(BackendError::Network("remote unreachable".to_string()));
        }
        if let Some(queue) = state.failures.get_mut(&point) {
            if !queue.is_empty() {
                return Err(queue.remove(0));
            }
        }
        Ok(state)
    }

    fn next_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Server clock: microsecond precision, strictly after `floor` when given.
    fn server_now(floor: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        match floor {
            Some(floor) if now <= floor => floor + Duration::microseconds(1),
            _ => now,
        }
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    fn backend_type(&self) -> &str {
        "memory"
    }

    async fn fetch_tasks(&self, owner: &str) -> Result<Vec<BackendTask>, BackendError> {
        let state = self.enter(
            RemoteCall::FetchTasks {
                owner: owner.to_string(),
            },
            FailPoint::FetchTasks,
        )?;
        let mut tasks: Vec<BackendTask> = state.tasks.values().filter(|t| t.user_id == owner).cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn create_task(&self, args: CreateTaskArgs) -> Result<BackendTask, BackendError> {
        let mut state = self.enter(
            RemoteCall::CreateTask {
                title: args.title.clone(),
                group_id: args.group_remote_id.clone(),
            },
            FailPoint::CreateTask,
        )?;
        if args.group_remote_id.is_empty() {
            return Err(BackendError::Rejected {
                status: 400,
                message: "group_id is required".to_string(),
            });
        }
        let now = Self::server_now(None);
        let task = BackendTask {
            remote_id: Self::next_id(),
            user_id: args.user_id,
            title: args.title,
            description: args.description,
            group_remote_id: args.group_remote_id,
            is_completed: args.is_completed,
            created_at: now,
            updated_at: now,
        };
        state.tasks.insert(task.remote_id.clone(), task.clone());
        Ok(task)
    }

    async fn update_task(&self, remote_id: &str, args: UpdateTaskArgs) -> Result<BackendTask, BackendError> {
        let mut state = self.enter(
            RemoteCall::UpdateTask {
                id: remote_id.to_string(),
            },
            FailPoint::UpdateTask,
        )?;
        let task = state
            .tasks
            .get_mut(remote_id)
            .ok_or_else(|| BackendError::NotFound(format!("task {remote_id}")))?;
        task.title = args.title;
        task.description = args.description;
        task.group_remote_id = args.group_remote_id;
        task.is_completed = args.is_completed;
        task.updated_at = Self::server_now(Some(task.updated_at));
        Ok(task.clone())
    }

    async fn delete_task(&self, remote_id: &str) -> Result<(), BackendError> {
        let mut state = self.enter(
            RemoteCall::DeleteTask {
                id: remote_id.to_string(),
            },
            FailPoint::DeleteTask,
        )?;
        state
            .tasks
            .remove(remote_id)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(format!("task {remote_id}")))
    }

    async fn fetch_groups(&self, owner: &str) -> Result<Vec<BackendGroup>, BackendError> {
        let state = self.enter(
            RemoteCall::FetchGroups {
                owner: owner.to_string(),
            },
            FailPoint::FetchGroups,
        )?;
        let mut groups: Vec<BackendGroup> = state.groups.values().filter(|g| g.user_id == owner).cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn find_group_by_name(&self, owner: &str, name: &str) -> Result<Option<BackendGroup>, BackendError> {
        let state = self.enter(
            RemoteCall::FindGroupByName {
                owner: owner.to_string(),
                name: name.to_string(),
            },
            FailPoint::FindGroupByName,
        )?;
        let wanted = name.trim().to_lowercase();
        Ok(state
            .groups
            .values()
            .filter(|g| g.user_id == owner && g.name.trim().to_lowercase() == wanted)
            .min_by_key(|g| g.created_at)
            .cloned())
    }

    async fn create_group(&self, args: CreateGroupArgs) -> Result<BackendGroup, BackendError> {
        let mut state = self.enter(
            RemoteCall::CreateGroup {
                name: args.name.clone(),
            },
            FailPoint::CreateGroup,
        )?;
        let group = BackendGroup {
            remote_id: Self::next_id(),
            user_id: args.user_id,
            name: args.name,
            created_at: Self::server_now(None),
        };
        state.groups.insert(group.remote_id.clone(), group.clone());
        Ok(group)
    }

    async fn update_group(&self, remote_id: &str, args: UpdateGroupArgs) -> Result<BackendGroup, BackendError> {
        let mut state = self.enter(
            RemoteCall::UpdateGroup {
                id: remote_id.to_string(),
                name: args.name.clone(),
            },
            FailPoint::UpdateGroup,
        )?;
        let group = state
            .groups
            .get_mut(remote_id)
            .ok_or_else(|| BackendError::NotFound(format!("group {remote_id}")))?;
        group.name = args.name;
        Ok(group.clone())
    }

    async fn delete_group(&self, remote_id: &str) -> Result<(), BackendError> {
        let mut state = self.enter(
            RemoteCall::DeleteGroup {
                id: remote_id.to_string(),
            },
            FailPoint::DeleteGroup,
        )?;
        state
            .groups
            .remove(remote_id)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(format!("group {remote_id}")))
    }
}
