use anyhow::Result;
use log::{info, warn};
use sea_orm::TransactionTrait;
use std::collections::HashSet;
use std::sync::Arc;

use super::groups::GroupSyncEngine;
use super::identity::{IdentityResolver, Promotion};
use super::snapshot::{to_payload, TaskSnapshot};
use super::{
    decode_or_drop, discard_orphans, fold_into_create, queue_mutation, validate_title, CreateReplay, DrainReport,
    FetchReport, GroupRef, ReplayStatus, SyncContext, ValidationError,
};
use crate::backend::BackendError;
use crate::constants::{LOG_PUSH_FAILED, LOG_QUEUED_OFFLINE};
use crate::entities::{group, task};
use crate::events::SyncEvent;
use crate::identifier::{EntityId, EntityKind};
use crate::repositories::{
    AliasRepository, OperationKind, PendingOperation, QueueRepository, TaskRepository, TombstoneRepository,
};
use crate::utils::datetime;

const KIND: EntityKind = EntityKind::Task;

/// Fields of a task to create.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub group: GroupRef,
}

impl NewTask {
    pub fn new(title: impl Into<String>, group: GroupRef) -> Self {
        Self {
            title: title.into(),
            description: None,
            group,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Fields to change on an existing task. `None` leaves a field as it is.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskChanges {
    pub title: Option<String>,
    /// `Some(None)` clears the description
    pub description: Option<Option<String>>,
    pub group: Option<GroupRef>,
    pub is_completed: Option<bool>,
}

fn normalize_description(description: Option<String>) -> Option<String> {
    description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
}

/// Local-first CRUD, fetch and drain for tasks.
#[derive(Clone)]
pub struct TaskSyncEngine {
    ctx: Arc<SyncContext>,
    groups: GroupSyncEngine,
}

impl TaskSyncEngine {
    pub(crate) fn new(ctx: Arc<SyncContext>, groups: GroupSyncEngine) -> Self {
        Self { ctx, groups }
    }

    /// All tasks of `owner` from local storage, newest first.
    pub async fn get_tasks(&self, owner: &str) -> Result<Vec<task::Model>> {
        TaskRepository::get_all(self.ctx.conn(), owner).await
    }

    /// Look a task up by id. A temporary id that has been promoted finds the promoted task.
    pub async fn get_task(&self, id: &EntityId) -> Result<Option<task::Model>> {
        let conn = self.ctx.conn();
        let target = AliasRepository::resolve(conn, KIND, id).await?;
        TaskRepository::get_by_id(conn, target.as_str()).await
    }

    pub async fn get_tasks_for_group(&self, owner: &str, group_id: &EntityId) -> Result<Vec<task::Model>> {
        let conn = self.ctx.conn();
        let group_id = AliasRepository::resolve(conn, EntityKind::Group, group_id).await?;
        TaskRepository::get_for_group(conn, owner, group_id.as_str()).await
    }

    /// Active (`completed == false`) or completed tasks of `owner`.
    pub async fn get_tasks_by_status(&self, owner: &str, completed: bool) -> Result<Vec<task::Model>> {
        TaskRepository::get_by_status(self.ctx.conn(), owner, completed).await
    }

    async fn resolve_group(&self, owner: &str, group: GroupRef) -> Result<group::Model> {
        match group {
            GroupRef::Id(id) => Ok(self.groups.get_group(&id).await?.ok_or(ValidationError::GroupNotFound(id))?),
            GroupRef::Name(name) => self.groups.ensure_group(owner, &name).await,
        }
    }

    /// Create a task.
    ///
    /// The row is written with a temporary id and a create is queued in the
    /// same transaction. When the remote store is reachable and the group is
    /// already known to it, the create is pushed right away and the promoted
    /// row is returned.
    ///
    /// # Errors
    /// Returns [`ValidationError::EmptyTitle`] or [`ValidationError::GroupNotFound`]
    /// before anything is written, or a local store error.
    pub async fn create(&self, owner: &str, new_task: NewTask) -> Result<task::Model> {
        let title = validate_title(&new_task.title)?;
        let group = self.resolve_group(owner, new_task.group).await?;

        let id = IdentityResolver::assign(KIND);
        let now = datetime::now();
        let row = task::Model {
            id: id.to_string(),
            user_id: owner.to_string(),
            title,
            description: normalize_description(new_task.description),
            group_id: group.id.clone(),
            is_completed: false,
            created_at: now,
            updated_at: now,
            synced: false,
        };

        let txn = self.ctx.conn().begin().await?;
        TaskRepository::insert(&txn, &row).await?;
        QueueRepository::enqueue(&txn, KIND, OperationKind::Create, &id, &to_payload(&TaskSnapshot::from(&row))?).await?;
        txn.commit().await?;
        self.ctx.events.emit_task_changed(&id);

        if !self.ctx.is_online() || group.entity_id().is_temporary() {
            info!("{LOG_QUEUED_OFFLINE}: task '{}'", row.title);
            return Ok(row);
        }

        Ok(self.push_create(&id).await?.unwrap_or(row))
    }

    async fn push_create(&self, id: &EntityId) -> Result<Option<task::Model>> {
        match self.replay_create(id).await? {
            CreateReplay::Promoted(row) => Ok(Some(row)),
            CreateReplay::Failed(e) => {
                warn!("{LOG_PUSH_FAILED}: task {id}: {e}");
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    pub(crate) async fn replay_create(&self, id: &EntityId) -> Result<CreateReplay<task::Model>> {
        let Some(_claim) = self.ctx.claim(id) else {
            return Ok(CreateReplay::Busy);
        };
        let conn = self.ctx.conn();
        let Some(operation) = QueueRepository::find_create(conn, KIND, id).await? else {
            return Ok(CreateReplay::Missing);
        };
        let Some(snapshot) = decode_or_drop::<TaskSnapshot, _>(conn, &operation).await? else {
            return Ok(CreateReplay::Dropped);
        };
        if EntityId::from(snapshot.group_id.clone()).is_temporary() {
            return Ok(CreateReplay::WaitingForGroup);
        }

        let remote = match self.ctx.backend.create_task(snapshot.create_args()).await {
            Ok(remote) => remote,
            Err(e) => return Ok(CreateReplay::Failed(e)),
        };

        let txn = conn.begin().await?;
        let promotion = IdentityResolver::promote_task(&txn, id, &remote, &snapshot).await?;
        txn.commit().await?;

        Ok(match promotion {
            Promotion::Promoted { row, .. } => {
                let to = row.entity_id();
                self.ctx.events.emit_promoted(KIND, id, &to);
                self.ctx.events.emit_task_changed(&to);
                CreateReplay::Promoted(row)
            }
            Promotion::Vanished { .. } => CreateReplay::Vanished,
        })
    }

    /// Change fields of a task.
    ///
    /// # Errors
    /// Returns [`ValidationError::TaskNotFound`], [`ValidationError::EmptyTitle`]
    /// or [`ValidationError::GroupNotFound`] before anything is written.
    pub async fn update(&self, id: &EntityId, changes: TaskChanges) -> Result<task::Model> {
        let current = self
            .get_task(id)
            .await?
            .ok_or_else(|| ValidationError::TaskNotFound(id.clone()))?;

        let title = changes.title.as_deref().map(validate_title).transpose()?;
        let group_id = match changes.group {
            Some(group) => Some(self.resolve_group(&current.user_id, group).await?.id),
            None => None,
        };
        let description = changes.description.map(normalize_description);
        let is_completed = changes.is_completed;

        self.mutate(id, move |row| {
            if let Some(title) = title {
                row.title = title;
            }
            if let Some(description) = description {
                row.description = description;
            }
            if let Some(group_id) = group_id {
                row.group_id = group_id;
            }
            if let Some(is_completed) = is_completed {
                row.is_completed = is_completed;
            }
        })
        .await
    }

    /// Flip the completion flag of a task.
    pub async fn toggle_complete(&self, id: &EntityId) -> Result<task::Model> {
        self.mutate(id, |row| row.is_completed = !row.is_completed).await
    }

    /// Apply `change` to the current row, then push or queue the new state.
    ///
    /// A temporary task has its new state folded into its queued create.
    async fn mutate<F>(&self, id: &EntityId, change: F) -> Result<task::Model>
    where
        F: FnOnce(&mut task::Model),
    {
        let conn = self.ctx.conn();

        let txn = conn.begin().await?;
        let target = AliasRepository::resolve(&txn, KIND, id).await?;
        let current = TaskRepository::get_by_id(&txn, target.as_str())
            .await?
            .ok_or_else(|| ValidationError::TaskNotFound(id.clone()))?;
        let mut row = current.clone();
        change(&mut row);
        if TaskSnapshot::from(&current).matches(&row) {
            txn.commit().await?;
            return Ok(current);
        }
        row.updated_at = datetime::next_stamp(current.updated_at);
        row.synced = false;
        let claim = if target.is_permanent() && self.ctx.is_online() {
            self.ctx.claim(&target)
        } else {
            None
        };
        if !TaskRepository::update(&txn, &row).await? {
            return Err(ValidationError::TaskNotFound(id.clone()).into());
        }

        let payload = to_payload(&TaskSnapshot::from(&row))?;
        let push_now = match &target {
            EntityId::Temporary(_) => {
                if !fold_into_create(&txn, KIND, &target, &payload).await? {
                    return Err(ValidationError::TaskNotFound(id.clone()).into());
                }
                false
            }
            EntityId::Permanent(_) => {
                let direct = claim.is_some()
                    && row.group_ref().is_permanent()
                    && !QueueRepository::has_pending(&txn, KIND, &target).await?;
                if !direct {
                    queue_mutation(&txn, KIND, OperationKind::Update, &target, &payload).await?;
                }
                direct
            }
        };
        txn.commit().await?;
        self.ctx.events.emit_task_changed(&target);

        if push_now {
            self.push_update(&row).await?;
        } else if target.is_permanent() {
            info!("{LOG_QUEUED_OFFLINE}: update of task {target}");
        }
        drop(claim);

        let latest = AliasRepository::resolve(conn, KIND, &target).await?;
        Ok(TaskRepository::get_by_id(conn, latest.as_str()).await?.unwrap_or(row))
    }

    async fn push_update(&self, row: &task::Model) -> Result<()> {
        let id = row.entity_id();
        let conn = self.ctx.conn();
        match self
            .ctx
            .backend
            .update_task(id.as_str(), TaskSnapshot::from(row).update_args())
            .await
        {
            Ok(remote) => {
                let txn = conn.begin().await?;
                let marked = !QueueRepository::has_pending(&txn, KIND, &id).await?
                    && TaskRepository::mark_synced(&txn, id.as_str(), row.updated_at, remote.updated_at).await?;
                txn.commit().await?;
                if marked {
                    self.ctx.events.emit_task_changed(&id);
                }
            }
            Err(BackendError::NotFound(_)) => {
                warn!("⚠️  Remote task {id} no longer exists, change kept locally only");
            }
            Err(e) => {
                warn!("{LOG_PUSH_FAILED}: update of task {id}: {e}");
                let txn = conn.begin().await?;
                if let Some(current) = TaskRepository::get_by_id(&txn, id.as_str()).await? {
                    let payload = to_payload(&TaskSnapshot::from(&current))?;
                    queue_mutation(&txn, KIND, OperationKind::Update, &id, &payload).await?;
                }
                txn.commit().await?;
            }
        }
        Ok(())
    }

    /// Delete a task.
    ///
    /// The row is removed and tombstoned. A temporary task only loses its
    /// queued operations and is never sent to the remote store.
    pub async fn delete(&self, id: &EntityId) -> Result<()> {
        let conn = self.ctx.conn();

        let txn = conn.begin().await?;
        let target = AliasRepository::resolve(&txn, KIND, id).await?;
        let current = TaskRepository::get_by_id(&txn, target.as_str())
            .await?
            .ok_or_else(|| ValidationError::TaskNotFound(id.clone()))?;
        let claim = if target.is_permanent() && self.ctx.is_online() {
            self.ctx.claim(&target)
        } else {
            None
        };

        TombstoneRepository::insert(&txn, KIND, target.as_str(), &current.user_id).await?;
        TaskRepository::delete(&txn, target.as_str()).await?;
        let push_now = match &target {
            EntityId::Temporary(_) => {
                QueueRepository::remove_by_entity_id(&txn, KIND, &target).await?;
                false
            }
            EntityId::Permanent(_) => {
                QueueRepository::remove_updates_for(&txn, KIND, &target).await?;
                let direct = claim.is_some() && !QueueRepository::has_pending(&txn, KIND, &target).await?;
                if !direct {
                    let payload = to_payload(&TaskSnapshot::from(&current))?;
                    QueueRepository::enqueue(&txn, KIND, OperationKind::Delete, &target, &payload).await?;
                }
                direct
            }
        };
        txn.commit().await?;
        self.ctx.events.emit_task_removed(&target);

        if push_now {
            match self.ctx.backend.delete_task(target.as_str()).await {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(e) => {
                    warn!("{LOG_PUSH_FAILED}: delete of task {target}: {e}");
                    let payload = to_payload(&TaskSnapshot::from(&current))?;
                    QueueRepository::enqueue(conn, KIND, OperationKind::Delete, &target, &payload).await?;
                }
            }
        }
        drop(claim);
        Ok(())
    }

    /// Delete every listed task that exists. Returns how many were deleted.
    pub async fn delete_many(&self, ids: &[EntityId]) -> Result<usize> {
        let mut deleted = 0;
        for id in ids {
            if self.get_task(id).await?.is_none() {
                continue;
            }
            self.delete(id).await?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Pull the owner's remote tasks into local storage.
    ///
    /// Tombstoned ids are skipped and unknown ids inserted. A local copy is
    /// replaced only when it is synced and the remote `updated_at` is strictly
    /// newer; unsynced local state always wins.
    pub async fn fetch(&self, owner: &str) -> Result<FetchReport> {
        let mut report = FetchReport::default();
        if !self.ctx.is_online() {
            return Ok(report);
        }

        let remote_tasks = match self.ctx.backend.fetch_tasks(owner).await {
            Ok(tasks) => {
                info!("✅ Fetched {} tasks from remote", tasks.len());
                tasks
            }
            Err(e) => {
                warn!("❌ Failed to fetch tasks: {e}");
                return Ok(report);
            }
        };

        let mut changed = Vec::new();
        let txn = self.ctx.conn().begin().await?;
        for remote in remote_tasks {
            if TombstoneRepository::is_tombstoned(&txn, KIND, &remote.remote_id).await? {
                report.skipped_tombstoned += 1;
                continue;
            }

            let incoming = task::Model {
                id: remote.remote_id.clone(),
                user_id: remote.user_id.clone(),
                title: remote.title.clone(),
                description: remote.description.clone(),
                group_id: remote.group_remote_id.clone(),
                is_completed: remote.is_completed,
                created_at: remote.created_at,
                updated_at: remote.updated_at,
                synced: true,
            };

            match TaskRepository::get_by_id(&txn, &remote.remote_id).await? {
                Some(local) if !local.synced => report.kept_local += 1,
                Some(local) => {
                    if remote.updated_at > local.updated_at && TaskRepository::apply_remote(&txn, &incoming).await? {
                        changed.push(incoming.entity_id());
                        report.updated += 1;
                    }
                }
                None => {
                    TaskRepository::insert(&txn, &incoming).await?;
                    changed.push(incoming.entity_id());
                    report.inserted += 1;
                }
            }
        }

        let cutoff = datetime::retention_cutoff(self.ctx.settings.tombstone_retention_days);
        report.pruned_tombstones = TombstoneRepository::prune(&txn, KIND, cutoff).await?;
        report.pruned_aliases = AliasRepository::prune(&txn, KIND, cutoff).await?;
        txn.commit().await?;

        for id in changed {
            self.ctx.events.emit_task_changed(&id);
        }
        Ok(report)
    }

    /// Replay the task queue.
    ///
    /// Creates go first; a create whose group is still temporary waits for a
    /// later cycle. Updates and deletes follow, skipping any entity whose
    /// earlier operation did not succeed in this cycle.
    pub(crate) async fn drain(&self) -> Result<DrainReport> {
        let conn = self.ctx.conn();
        let mut report = DrainReport::new(KIND);
        self.ctx.events.emit(SyncEvent::DrainStarted { kind: KIND });

        let operations = QueueRepository::list(conn, KIND).await?;
        report.discarded += discard_orphans(conn, KIND, &operations).await?;

        let mut blocked: HashSet<EntityId> = HashSet::new();

        for operation in operations.iter().filter(|op| op.op == OperationKind::Create) {
            if !self.ctx.is_online() {
                break;
            }
            match self.replay_create(&operation.entity_id).await? {
                CreateReplay::Promoted(_) | CreateReplay::Vanished => {
                    report.replayed += 1;
                    report.promoted += 1;
                }
                CreateReplay::Busy | CreateReplay::WaitingForGroup => {
                    report.deferred += 1;
                    blocked.insert(operation.entity_id.clone());
                }
                CreateReplay::Missing => {}
                CreateReplay::Dropped => report.discarded += 1,
                CreateReplay::Failed(e) => {
                    warn!("{LOG_PUSH_FAILED}: task create {}: {e}", operation.entity_id);
                    report.failed += 1;
                    blocked.insert(operation.entity_id.clone());
                }
            }
        }

        for operation in QueueRepository::list(conn, KIND).await? {
            if operation.op == OperationKind::Create {
                continue;
            }
            if !self.ctx.is_online() {
                break;
            }
            if operation.entity_id.is_temporary() || blocked.contains(&operation.entity_id) {
                report.deferred += 1;
                blocked.insert(operation.entity_id.clone());
                continue;
            }
            let Some(_claim) = self.ctx.claim(&operation.entity_id) else {
                report.deferred += 1;
                blocked.insert(operation.entity_id.clone());
                continue;
            };

            let status = match operation.op {
                OperationKind::Delete => self.replay_delete(&operation).await?,
                _ => match self.replay_update(&operation).await? {
                    Some(status) => status,
                    None => {
                        report.deferred += 1;
                        blocked.insert(operation.entity_id.clone());
                        continue;
                    }
                },
            };
            match status {
                ReplayStatus::Applied => report.replayed += 1,
                ReplayStatus::Dropped => report.discarded += 1,
                ReplayStatus::Failed(e) => {
                    warn!("{LOG_PUSH_FAILED}: task {} {}: {e}", operation.op, operation.entity_id);
                    report.failed += 1;
                    blocked.insert(operation.entity_id.clone());
                }
            }
        }

        report.remaining = QueueRepository::count(conn, KIND).await?;
        info!(
            "✅ Task drain: {} replayed, {} promoted, {} failed, {} remaining",
            report.replayed, report.promoted, report.failed, report.remaining
        );
        self.ctx.events.emit(SyncEvent::DrainFinished { report: report.clone() });
        Ok(report)
    }

    /// `None` when the update points at a group that is still temporary.
    async fn replay_update(&self, operation: &PendingOperation) -> Result<Option<ReplayStatus>> {
        let conn = self.ctx.conn();
        let Some(snapshot) = decode_or_drop::<TaskSnapshot, _>(conn, operation).await? else {
            return Ok(Some(ReplayStatus::Dropped));
        };
        if EntityId::from(snapshot.group_id.clone()).is_temporary() {
            return Ok(None);
        }
        let id = &operation.entity_id;

        match self.ctx.backend.update_task(id.as_str(), snapshot.update_args()).await {
            Ok(remote) => {
                let txn = conn.begin().await?;
                QueueRepository::remove(&txn, KIND, operation.seq).await?;
                let marked = !QueueRepository::has_pending(&txn, KIND, id).await?
                    && TaskRepository::mark_synced(&txn, id.as_str(), snapshot.updated_at, remote.updated_at).await?;
                txn.commit().await?;
                if marked {
                    self.ctx.events.emit_task_changed(id);
                }
                Ok(Some(ReplayStatus::Applied))
            }
            Err(BackendError::NotFound(_)) => {
                warn!("⚠️  Remote task {id} no longer exists, dropping queued update");
                QueueRepository::remove(conn, KIND, operation.seq).await?;
                Ok(Some(ReplayStatus::Dropped))
            }
            Err(e) => Ok(Some(ReplayStatus::Failed(e))),
        }
    }

    async fn replay_delete(&self, operation: &PendingOperation) -> Result<ReplayStatus> {
        let conn = self.ctx.conn();
        match self.ctx.backend.delete_task(operation.entity_id.as_str()).await {
            Ok(()) | Err(BackendError::NotFound(_)) => {
                QueueRepository::remove(conn, KIND, operation.seq).await?;
                Ok(ReplayStatus::Applied)
            }
            Err(e) => Ok(ReplayStatus::Failed(e)),
        }
    }
}
