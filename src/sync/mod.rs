//! Synchronization service module.
//!
//! This module provides the [`SyncService`] struct which keeps the local store
//! consistent with the remote store under intermittent connectivity. Every
//! write lands in the local store first; the remote store is updated
//! immediately when it is reachable and through the pending-operation queues
//! otherwise.
//!
//! The service is composed of:
//! - [`GroupSyncEngine`] and [`TaskSyncEngine`]: per-entity CRUD, fetch and drain
//! - [`IdentityResolver`]: promotion of temporary identifiers
//! - [`ReconciliationScheduler`]: single-flight drain cycles, edge-triggered on reconnect

pub mod groups;
pub mod identity;
pub mod scheduler;
pub mod snapshot;
pub mod tasks;

pub use groups::GroupSyncEngine;
pub use identity::{IdentityResolver, Promotion};
pub use scheduler::ReconciliationScheduler;
pub use snapshot::{GroupSnapshot, TaskSnapshot};
pub use tasks::{NewTask, TaskChanges, TaskSyncEngine};

use anyhow::{Context, Result};
use log::{error, info};
use sea_orm::ConnectionTrait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::backend::{factory::create_backend, Backend, BackendError};
use crate::config::{Config, SyncConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::entities::{group, task};
use crate::events::{EventDispatcher, SyncEvent};
use crate::identifier::{EntityId, EntityKind};
use crate::repositories::{
    AliasRepository, GroupRepository, OperationKind, PendingOperation, QueueRepository, SessionRepository,
    StoredOwner, TaskRepository,
};
use crate::storage::LocalStorage;

/// Input rejected before anything was written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Task title must not be empty")]
    EmptyTitle,

    #[error("Group name must not be empty")]
    EmptyGroupName,

    #[error("A group named '{0}' already exists")]
    DuplicateGroupName(String),

    #[error("Task not found: {0}")]
    TaskNotFound(EntityId),

    #[error("Group not found: {0}")]
    GroupNotFound(EntityId),
}

/// How a task names its group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupRef {
    /// An existing local group
    Id(EntityId),
    /// A group name, ensured (found or created) before the task is written
    Name(String),
}

/// Counters for one drain of one entity kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrainReport {
    pub kind: EntityKind,
    /// Operations applied remotely and removed from the queue
    pub replayed: usize,
    /// Temporary identifiers replaced by remote ones
    pub promoted: usize,
    /// Operations dropped without a remote call (orphans, vanished records, bad payloads)
    pub discarded: usize,
    /// Operations skipped this cycle because an earlier step for the same entity did not succeed
    pub deferred: usize,
    /// Operations the remote store refused or could not be reached for
    pub failed: usize,
    /// Queue length after the drain
    pub remaining: u64,
}

impl DrainReport {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            replayed: 0,
            promoted: 0,
            discarded: 0,
            deferred: 0,
            failed: 0,
            remaining: 0,
        }
    }
}

/// Result of asking the scheduler for a drain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed { groups: DrainReport, tasks: DrainReport },
    /// Another drain was running; nothing was done
    AlreadyRunning,
    /// The remote store is unreachable; nothing was done
    Offline,
}

/// Counters for one fetch of one entity kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub inserted: usize,
    pub updated: usize,
    /// Local temporary groups merged with a same-name remote group
    pub adopted: usize,
    pub skipped_tombstoned: usize,
    /// Remote versions ignored because the local copy has unsynced changes
    pub kept_local: usize,
    pub pruned_tombstones: u64,
    /// Promoted-id aliases past the retention window
    pub pruned_aliases: u64,
}

/// Fetch results for both entity kinds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub groups: FetchReport,
    pub tasks: FetchReport,
}

/// A group with its task counts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupOverview {
    pub group: group::Model,
    pub active: usize,
    pub completed: usize,
}

/// Queue lengths, for a global "pending sync" indicator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub tasks: u64,
    pub groups: u64,
}

impl PendingCounts {
    pub fn total(&self) -> u64 {
        self.tasks + self.groups
    }
}

/// Outcome of replaying one non-create operation.
pub(crate) enum ReplayStatus {
    Applied,
    Dropped,
    Failed(BackendError),
}

/// Outcome of pushing one queued create.
pub(crate) enum CreateReplay<M> {
    Promoted(M),
    /// The row was deleted while the create was in flight
    Vanished,
    /// Another push for this entity is in flight
    Busy,
    /// A task whose group is still temporary
    WaitingForGroup,
    /// No queued create exists any more
    Missing,
    /// The payload could not be decoded and was removed
    Dropped,
    Failed(BackendError),
}

/// State shared by the engines and the scheduler.
pub(crate) struct SyncContext {
    pub storage: Arc<LocalStorage>,
    pub backend: Arc<dyn Backend>,
    pub connectivity: ConnectivityMonitor,
    pub events: EventDispatcher,
    pub settings: SyncConfig,
    claims: Arc<Mutex<HashSet<String>>>,
}

impl SyncContext {
    pub fn conn(&self) -> &sea_orm::DatabaseConnection {
        &self.storage.conn
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Reserve the right to push `id`. `None` while another push for it is in flight.
    pub fn claim(&self, id: &EntityId) -> Option<PushClaim> {
        let mut claims = self.claims.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if claims.insert(id.to_string()) {
            Some(PushClaim {
                claims: Arc::clone(&self.claims),
                id: id.to_string(),
            })
        } else {
            None
        }
    }
}

/// Released on drop.
pub(crate) struct PushClaim {
    claims: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for PushClaim {
    fn drop(&mut self) {
        let mut claims = self.claims.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        claims.remove(&self.id);
    }
}

/// Queue a mutation, replacing the payload of the entity's newest queued
/// operation when it is of the same kind.
pub(crate) async fn queue_mutation<C>(
    conn: &C,
    kind: EntityKind,
    op: OperationKind,
    id: &EntityId,
    payload: &serde_json::Value,
) -> Result<()>
where
    C: ConnectionTrait,
{
    match QueueRepository::last_for(conn, kind, id).await? {
        Some(last) if last.op == op => {
            QueueRepository::update_payload(conn, kind, last.seq, payload).await?;
        }
        _ => {
            QueueRepository::enqueue(conn, kind, op, id, payload).await?;
        }
    }
    Ok(())
}

/// Fold the new state of a temporary entity into its queued create.
///
/// Returns `false` without touching the queue when the entity has no local
/// row, so a promoted or deleted entity never gets a fresh create.
pub(crate) async fn fold_into_create<C>(
    conn: &C,
    kind: EntityKind,
    id: &EntityId,
    payload: &serde_json::Value,
) -> Result<bool>
where
    C: ConnectionTrait,
{
    let exists = match kind {
        EntityKind::Task => TaskRepository::get_by_id(conn, id.as_str()).await?.is_some(),
        EntityKind::Group => GroupRepository::get_by_id(conn, id.as_str()).await?.is_some(),
    };
    if !exists {
        return Ok(false);
    }

    match QueueRepository::find_create(conn, kind, id).await? {
        Some(create) => {
            QueueRepository::update_payload(conn, kind, create.seq, payload).await?;
        }
        None => {
            QueueRepository::enqueue(conn, kind, OperationKind::Create, id, payload).await?;
        }
    }
    Ok(true)
}

/// Drop queued mutations and deletes for temporary ids that have no queued create.
pub(crate) async fn discard_orphans<C>(conn: &C, kind: EntityKind, operations: &[PendingOperation]) -> Result<usize>
where
    C: ConnectionTrait,
{
    let creates: HashSet<&EntityId> = operations
        .iter()
        .filter(|op| op.op == OperationKind::Create)
        .map(|op| &op.entity_id)
        .collect();

    let mut discarded = 0;
    for operation in operations {
        if operation.op != OperationKind::Create
            && operation.entity_id.is_temporary()
            && !creates.contains(&operation.entity_id)
        {
            QueueRepository::remove(conn, kind, operation.seq).await?;
            info!("🧹 Discarded orphaned {} {} for {}", kind, operation.op, operation.entity_id);
            discarded += 1;
        }
    }
    Ok(discarded)
}

/// Decode an operation payload, removing the operation if it is unreadable.
pub(crate) async fn decode_or_drop<T, C>(conn: &C, operation: &PendingOperation) -> Result<Option<T>>
where
    T: serde::de::DeserializeOwned,
    C: ConnectionTrait,
{
    match operation.payload_as::<T>() {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            error!("❌ {e:#}; dropping the operation");
            QueueRepository::remove(conn, operation.kind, operation.seq).await?;
            Ok(None)
        }
    }
}

pub(crate) fn validate_title(title: &str) -> Result<String, ValidationError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ValidationError::EmptyTitle);
    }
    Ok(title.to_string())
}

pub(crate) fn validate_group_name(name: &str) -> Result<String, ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::EmptyGroupName);
    }
    Ok(name.to_string())
}

/// Service that keeps the local store and the remote store in step.
///
/// All reads are served from the local store. Writes are applied locally first
/// and never fail because the remote store is unreachable; they fail only on
/// validation errors or local store errors.
///
/// # Example
/// ```rust,no_run
/// use std::sync::Arc;
/// use todoly_sync::backend::InMemoryBackend;
/// use todoly_sync::config::SyncConfig;
/// use todoly_sync::connectivity::ConnectivityMonitor;
/// use todoly_sync::storage::LocalStorage;
/// use todoly_sync::sync::{GroupRef, NewTask, SyncService};
///
/// # async fn example() -> anyhow::Result<()> {
/// let storage = Arc::new(LocalStorage::in_memory().await?);
/// let service = SyncService::new(
///     storage,
///     Arc::new(InMemoryBackend::new()),
///     ConnectivityMonitor::new(true),
///     SyncConfig::default(),
/// );
/// let _listener = service.start();
///
/// let task = service
///     .create_task("user-1", NewTask::new("Buy milk", GroupRef::Name("Personal".into())))
///     .await?;
/// println!("{} synced: {}", task.title, task.synced);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SyncService {
    ctx: Arc<SyncContext>,
    groups: GroupSyncEngine,
    tasks: TaskSyncEngine,
    scheduler: ReconciliationScheduler,
}

impl SyncService {
    pub fn new(
        storage: Arc<LocalStorage>,
        backend: Arc<dyn Backend>,
        connectivity: ConnectivityMonitor,
        settings: SyncConfig,
    ) -> Self {
        let ctx = Arc::new(SyncContext {
            storage,
            backend,
            connectivity,
            events: EventDispatcher::new(),
            settings,
            claims: Arc::new(Mutex::new(HashSet::new())),
        });
        let groups = GroupSyncEngine::new(Arc::clone(&ctx));
        let tasks = TaskSyncEngine::new(Arc::clone(&ctx), groups.clone());
        let scheduler = ReconciliationScheduler::new(Arc::clone(&ctx), groups.clone(), tasks.clone());

        Self {
            ctx,
            groups,
            tasks,
            scheduler,
        }
    }

    /// Build the store, the remote backend and the monitor from configuration.
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let path = config.storage.resolved_database_path()?;
        let storage = Arc::new(LocalStorage::open(&path).await?);
        let backend: Arc<dyn Backend> = Arc::from(create_backend(&config.remote)?);
        let connectivity = ConnectivityMonitor::new(config.sync.assume_online_at_startup);
        info!("🚀 Sync service ready (backend: {})", backend.backend_type());
        Ok(Self::new(storage, backend, connectivity, config.sync.clone()))
    }

    /// Spawn the background listener that drains on reconnect and on the poll interval.
    pub fn start(&self) -> JoinHandle<()> {
        self.scheduler.spawn()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.ctx.events.subscribe()
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.ctx.connectivity
    }

    pub fn is_online(&self) -> bool {
        self.ctx.is_online()
    }

    pub fn storage(&self) -> &Arc<LocalStorage> {
        &self.ctx.storage
    }

    pub fn groups(&self) -> &GroupSyncEngine {
        &self.groups
    }

    pub fn tasks(&self) -> &TaskSyncEngine {
        &self.tasks
    }

    pub fn scheduler(&self) -> &ReconciliationScheduler {
        &self.scheduler
    }

    // Tasks

    pub async fn get_tasks(&self, owner: &str) -> Result<Vec<task::Model>> {
        self.tasks.get_tasks(owner).await
    }

    pub async fn get_task(&self, id: &EntityId) -> Result<Option<task::Model>> {
        self.tasks.get_task(id).await
    }

    pub async fn get_tasks_for_group(&self, owner: &str, group_id: &EntityId) -> Result<Vec<task::Model>> {
        self.tasks.get_tasks_for_group(owner, group_id).await
    }

    pub async fn get_tasks_by_status(&self, owner: &str, completed: bool) -> Result<Vec<task::Model>> {
        self.tasks.get_tasks_by_status(owner, completed).await
    }

    pub async fn create_task(&self, owner: &str, new_task: NewTask) -> Result<task::Model> {
        self.tasks.create(owner, new_task).await
    }

    pub async fn update_task(&self, id: &EntityId, changes: TaskChanges) -> Result<task::Model> {
        self.tasks.update(id, changes).await
    }

    pub async fn toggle_complete(&self, id: &EntityId) -> Result<task::Model> {
        self.tasks.toggle_complete(id).await
    }

    pub async fn delete_task(&self, id: &EntityId) -> Result<()> {
        self.tasks.delete(id).await
    }

    /// Delete several tasks. Unknown ids are skipped. Returns how many were deleted.
    pub async fn delete_tasks(&self, ids: &[EntityId]) -> Result<usize> {
        self.tasks.delete_many(ids).await
    }

    // Groups

    pub async fn get_groups(&self, owner: &str) -> Result<Vec<group::Model>> {
        self.groups.get_groups(owner).await
    }

    pub async fn get_group(&self, id: &EntityId) -> Result<Option<group::Model>> {
        self.groups.get_group(id).await
    }

    pub async fn create_group(&self, owner: &str, name: &str) -> Result<group::Model> {
        self.groups.create(owner, name).await
    }

    pub async fn rename_group(&self, id: &EntityId, name: &str) -> Result<group::Model> {
        self.groups.rename(id, name).await
    }

    /// Delete a group together with the tasks it contains.
    pub async fn delete_group(&self, id: &EntityId) -> Result<()> {
        let group = self
            .groups
            .get_group(id)
            .await?
            .ok_or_else(|| ValidationError::GroupNotFound(id.clone()))?;

        let group_id = group.entity_id();

        let members: Vec<EntityId> = self
            .tasks
            .get_tasks_for_group(&group.user_id, &group_id)
            .await?
            .iter()
            .map(task::Model::entity_id)
            .collect();
        let removed = self.tasks.delete_many(&members).await?;
        if removed > 0 {
            info!("🗑️  Deleted {removed} tasks of group '{}'", group.name);
        }

        self.groups.delete(&group_id).await
    }

    pub async fn ensure_group(&self, owner: &str, name: &str) -> Result<group::Model> {
        self.groups.ensure_group(owner, name).await
    }

    pub async fn ensure_default_groups(&self, owner: &str) -> Result<Vec<group::Model>> {
        self.groups.ensure_default_groups(owner).await
    }

    /// Every group of `owner` with its active and completed task counts.
    pub async fn group_overview(&self, owner: &str) -> Result<Vec<GroupOverview>> {
        let groups = self.groups.get_groups(owner).await?;
        let tasks = self.tasks.get_tasks(owner).await?;

        let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
        for task in &tasks {
            let entry = counts.entry(task.group_id.as_str()).or_default();
            if task.is_completed {
                entry.1 += 1;
            } else {
                entry.0 += 1;
            }
        }

        Ok(groups
            .into_iter()
            .map(|group| {
                let (active, completed) = counts.get(group.id.as_str()).copied().unwrap_or_default();
                GroupOverview {
                    group,
                    active,
                    completed,
                }
            })
            .collect())
    }

    // Reconciliation

    /// Pull the owner's remote records into the local store, groups first.
    pub async fn refresh(&self, owner: &str) -> Result<RefreshReport> {
        let groups = self.groups.fetch(owner).await?;
        let tasks = self.tasks.fetch(owner).await?;
        Ok(RefreshReport { groups, tasks })
    }

    /// First-start sequence: default groups, then a full refresh.
    pub async fn bootstrap(&self, owner: &str) -> Result<RefreshReport> {
        self.ensure_default_groups(owner).await?;
        self.refresh(owner).await
    }

    /// Replay both queues now (groups, then tasks).
    pub async fn drain(&self) -> Result<DrainOutcome> {
        self.scheduler.drain().await
    }

    /// Drain, then refresh.
    pub async fn sync_now(&self, owner: &str) -> Result<(DrainOutcome, RefreshReport)> {
        let drained = self.drain().await?;
        let refreshed = self.refresh(owner).await?;
        Ok((drained, refreshed))
    }

    pub async fn pending_counts(&self) -> Result<PendingCounts> {
        let conn = self.ctx.conn();
        Ok(PendingCounts {
            tasks: QueueRepository::count(conn, EntityKind::Task).await?,
            groups: QueueRepository::count(conn, EntityKind::Group).await?,
        })
    }

    /// Whether an entity still has operations waiting for the remote store.
    pub async fn is_pending(&self, kind: EntityKind, id: &EntityId) -> Result<bool> {
        let conn = self.ctx.conn();
        let target = AliasRepository::resolve(conn, kind, id).await?;
        QueueRepository::has_pending(conn, kind, &target).await
    }

    // Owner session

    pub async fn remember_owner(&self, user_id: &str, email: Option<&str>) -> Result<()> {
        SessionRepository::remember(self.ctx.conn(), user_id, email)
            .await
            .context("Failed to store owner session")
    }

    pub async fn stored_owner(&self) -> Result<Option<StoredOwner>> {
        SessionRepository::get(self.ctx.conn()).await
    }

    pub async fn forget_owner(&self) -> Result<()> {
        SessionRepository::forget(self.ctx.conn()).await
    }
}
