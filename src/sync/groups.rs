use anyhow::Result;
use log::{info, warn};
use sea_orm::TransactionTrait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::identity::{IdentityResolver, Promotion};
use super::snapshot::{to_payload, GroupSnapshot};
use super::{
    decode_or_drop, discard_orphans, fold_into_create, queue_mutation, validate_group_name, CreateReplay, DrainReport,
    FetchReport, ReplayStatus, SyncContext, ValidationError,
};
use crate::backend::{BackendError, BackendGroup};
use crate::constants::{LOG_PUSH_FAILED, LOG_QUEUED_OFFLINE};
use crate::entities::group;
use crate::events::SyncEvent;
use crate::identifier::{EntityId, EntityKind};
use crate::repositories::{
    AliasRepository, GroupRepository, OperationKind, PendingOperation, QueueRepository, TombstoneRepository,
};
use crate::utils::datetime;

const KIND: EntityKind = EntityKind::Group;

/// Local-first CRUD, fetch and drain for groups.
///
/// Name uniqueness per owner is case-insensitive and enforced here. Creating,
/// renaming and ensuring groups are serialized so two concurrent callers can
/// never produce two groups with the same name.
#[derive(Clone)]
pub struct GroupSyncEngine {
    ctx: Arc<SyncContext>,
    name_lock: Arc<Mutex<()>>,
}

impl GroupSyncEngine {
    pub(crate) fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            name_lock: Arc::new(Mutex::new(())),
        }
    }

    /// All groups of `owner` from local storage, ordered by name.
    pub async fn get_groups(&self, owner: &str) -> Result<Vec<group::Model>> {
        GroupRepository::get_all(self.ctx.conn(), owner).await
    }

    /// Look a group up by id. A temporary id that has been promoted finds the promoted group.
    pub async fn get_group(&self, id: &EntityId) -> Result<Option<group::Model>> {
        let conn = self.ctx.conn();
        let target = AliasRepository::resolve(conn, KIND, id).await?;
        GroupRepository::get_by_id(conn, target.as_str()).await
    }

    /// Create a group.
    ///
    /// # Errors
    /// Returns [`ValidationError::EmptyGroupName`] or
    /// [`ValidationError::DuplicateGroupName`] before anything is written, or a
    /// local store error.
    pub async fn create(&self, owner: &str, name: &str) -> Result<group::Model> {
        let name = validate_group_name(name)?;
        let _names = self.name_lock.lock().await;

        if GroupRepository::find_by_name(self.ctx.conn(), owner, &name).await?.is_some() {
            return Err(ValidationError::DuplicateGroupName(name).into());
        }

        self.create_locked(owner, &name).await
    }

    async fn create_locked(&self, owner: &str, name: &str) -> Result<group::Model> {
        let id = IdentityResolver::assign(KIND);
        let row = group::Model {
            id: id.to_string(),
            user_id: owner.to_string(),
            name: name.to_string(),
            created_at: datetime::now(),
            synced: false,
        };

        let txn = self.ctx.conn().begin().await?;
        GroupRepository::insert(&txn, &row).await?;
        QueueRepository::enqueue(&txn, KIND, OperationKind::Create, &id, &to_payload(&GroupSnapshot::from(&row))?).await?;
        txn.commit().await?;
        self.ctx.events.emit_group_changed(&id);

        if !self.ctx.is_online() {
            info!("{LOG_QUEUED_OFFLINE}: group '{name}'");
            return Ok(row);
        }

        Ok(self.push_create(&id).await?.unwrap_or(row))
    }

    /// Push the queued create of a temporary group now. Returns the promoted row on success.
    async fn push_create(&self, id: &EntityId) -> Result<Option<group::Model>> {
        match self.replay_create(id).await? {
            CreateReplay::Promoted(row) => Ok(Some(row)),
            CreateReplay::Failed(e) => {
                warn!("{LOG_PUSH_FAILED}: group {id}: {e}");
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Replay the queued create for `id`.
    ///
    /// A remote group with the same name is adopted instead of creating a
    /// second one.
    pub(crate) async fn replay_create(&self, id: &EntityId) -> Result<CreateReplay<group::Model>> {
        let Some(_claim) = self.ctx.claim(id) else {
            return Ok(CreateReplay::Busy);
        };
        let conn = self.ctx.conn();
        let Some(operation) = QueueRepository::find_create(conn, KIND, id).await? else {
            return Ok(CreateReplay::Missing);
        };
        let Some(snapshot) = decode_or_drop::<GroupSnapshot, _>(conn, &operation).await? else {
            return Ok(CreateReplay::Dropped);
        };

        let backend = &self.ctx.backend;
        let found = match backend.find_group_by_name(&snapshot.user_id, &snapshot.name).await {
            Ok(found) => self.adoptable(found).await?,
            Err(e) => return Ok(CreateReplay::Failed(e)),
        };
        let remote = match found {
            Some(existing) => {
                info!("🔗 Adopting existing remote group '{}'", existing.name);
                existing
            }
            None => match backend.create_group(snapshot.create_args()).await {
                Ok(created) => created,
                Err(e) => return Ok(CreateReplay::Failed(e)),
            },
        };

        let txn = conn.begin().await?;
        let promotion = IdentityResolver::promote_group(&txn, id, &remote, &snapshot.name).await?;
        txn.commit().await?;

        Ok(self.announce(id, promotion))
    }

    /// A remote group may be adopted unless it was deleted locally.
    async fn adoptable(&self, found: Option<BackendGroup>) -> Result<Option<BackendGroup>> {
        if let Some(group) = &found {
            if TombstoneRepository::is_tombstoned(self.ctx.conn(), KIND, &group.remote_id).await? {
                return Ok(None);
            }
        }
        Ok(found)
    }

    fn announce(&self, from: &EntityId, promotion: Promotion<group::Model>) -> CreateReplay<group::Model> {
        match promotion {
            Promotion::Promoted { row, .. } => {
                let to = row.entity_id();
                self.ctx.events.emit_promoted(KIND, from, &to);
                self.ctx.events.emit_group_changed(&to);
                CreateReplay::Promoted(row)
            }
            Promotion::Vanished { .. } => CreateReplay::Vanished,
        }
    }

    /// Rename a group.
    ///
    /// A still-temporary group has the new name folded into its queued create.
    /// A temporary id whose group has since been promoted renames the promoted
    /// group.
    pub async fn rename(&self, id: &EntityId, new_name: &str) -> Result<group::Model> {
        let name = validate_group_name(new_name)?;
        let _names = self.name_lock.lock().await;
        let conn = self.ctx.conn();

        let txn = conn.begin().await?;
        let target = AliasRepository::resolve(&txn, KIND, id).await?;
        let current = GroupRepository::get_by_id(&txn, target.as_str())
            .await?
            .ok_or_else(|| ValidationError::GroupNotFound(id.clone()))?;
        if let Some(other) = GroupRepository::find_by_name(&txn, &current.user_id, &name).await? {
            if other.id != current.id {
                return Err(ValidationError::DuplicateGroupName(name).into());
            }
        }
        if current.name == name {
            txn.commit().await?;
            return Ok(current);
        }

        let row = group::Model {
            name,
            synced: false,
            ..current
        };
        let payload = to_payload(&GroupSnapshot::from(&row))?;
        let claim = if target.is_permanent() && self.ctx.is_online() {
            self.ctx.claim(&target)
        } else {
            None
        };

        if !GroupRepository::update(&txn, &row).await? {
            return Err(ValidationError::GroupNotFound(id.clone()).into());
        }
        let push_now = match &target {
            EntityId::Temporary(_) => {
                if !fold_into_create(&txn, KIND, &target, &payload).await? {
                    return Err(ValidationError::GroupNotFound(id.clone()).into());
                }
                false
            }
            EntityId::Permanent(_) => {
                let direct = claim.is_some() && !QueueRepository::has_pending(&txn, KIND, &target).await?;
                if !direct {
                    queue_mutation(&txn, KIND, OperationKind::Rename, &target, &payload).await?;
                }
                direct
            }
        };
        txn.commit().await?;
        self.ctx.events.emit_group_changed(&target);

        if push_now {
            self.push_rename(&row).await?;
        } else if target.is_permanent() {
            info!("{LOG_QUEUED_OFFLINE}: rename of group {target}");
        }
        drop(claim);

        // A drain may have promoted the group since the commit
        let latest = AliasRepository::resolve(conn, KIND, &target).await?;
        Ok(GroupRepository::get_by_id(conn, latest.as_str()).await?.unwrap_or(row))
    }

    async fn push_rename(&self, row: &group::Model) -> Result<()> {
        let id = row.entity_id();
        let conn = self.ctx.conn();
        match self
            .ctx
            .backend
            .update_group(id.as_str(), GroupSnapshot::from(row).update_args())
            .await
        {
            Ok(_) => {
                let txn = conn.begin().await?;
                let marked = !QueueRepository::has_pending(&txn, KIND, &id).await?
                    && GroupRepository::mark_synced(&txn, id.as_str(), &row.name).await?;
                txn.commit().await?;
                if marked {
                    self.ctx.events.emit_group_changed(&id);
                }
            }
            Err(BackendError::NotFound(_)) => {
                warn!("⚠️  Remote group {id} no longer exists, rename kept locally only");
            }
            Err(e) => {
                warn!("{LOG_PUSH_FAILED}: rename of group {id}: {e}");
                let txn = conn.begin().await?;
                if let Some(current) = GroupRepository::get_by_id(&txn, id.as_str()).await? {
                    let payload = to_payload(&GroupSnapshot::from(&current))?;
                    queue_mutation(&txn, KIND, OperationKind::Rename, &id, &payload).await?;
                }
                txn.commit().await?;
            }
        }
        Ok(())
    }

    /// Delete a group. Tasks are not touched; see `SyncService::delete_group`.
    pub async fn delete(&self, id: &EntityId) -> Result<()> {
        let conn = self.ctx.conn();

        let txn = conn.begin().await?;
        let target = AliasRepository::resolve(&txn, KIND, id).await?;
        let current = GroupRepository::get_by_id(&txn, target.as_str())
            .await?
            .ok_or_else(|| ValidationError::GroupNotFound(id.clone()))?;
        let claim = if target.is_permanent() && self.ctx.is_online() {
            self.ctx.claim(&target)
        } else {
            None
        };

        TombstoneRepository::insert(&txn, KIND, target.as_str(), &current.user_id).await?;
        GroupRepository::delete(&txn, target.as_str()).await?;
        let push_now = match &target {
            EntityId::Temporary(_) => {
                QueueRepository::remove_by_entity_id(&txn, KIND, &target).await?;
                false
            }
            EntityId::Permanent(_) => {
                QueueRepository::remove_updates_for(&txn, KIND, &target).await?;
                let direct = claim.is_some() && !QueueRepository::has_pending(&txn, KIND, &target).await?;
                if !direct {
                    let payload = to_payload(&GroupSnapshot::from(&current))?;
                    QueueRepository::enqueue(&txn, KIND, OperationKind::Delete, &target, &payload).await?;
                }
                direct
            }
        };
        txn.commit().await?;
        self.ctx.events.emit_group_removed(&target);

        if push_now {
            match self.ctx.backend.delete_group(target.as_str()).await {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(e) => {
                    warn!("{LOG_PUSH_FAILED}: delete of group {target}: {e}");
                    let payload = to_payload(&GroupSnapshot::from(&current))?;
                    QueueRepository::enqueue(conn, KIND, OperationKind::Delete, &target, &payload).await?;
                }
            }
        }
        drop(claim);
        Ok(())
    }

    /// Find the owner's group named `name` (case-insensitive), creating it if needed.
    ///
    /// A local permanent group is returned as is. Otherwise the remote store is
    /// asked first and an existing remote group is adopted, taking over any local
    /// temporary group of the same name.
    pub async fn ensure_group(&self, owner: &str, name: &str) -> Result<group::Model> {
        let name = validate_group_name(name)?;
        let _names = self.name_lock.lock().await;
        let conn = self.ctx.conn();

        let local = GroupRepository::find_by_name(conn, owner, &name).await?;
        if let Some(row) = &local {
            if row.entity_id().is_permanent() {
                return Ok(row.clone());
            }
        }

        if !self.ctx.is_online() {
            return match local {
                Some(row) => Ok(row),
                None => self.create_locked(owner, &name).await,
            };
        }

        let lookup = match self.ctx.backend.find_group_by_name(owner, &name).await {
            Ok(found) => Ok(self.adoptable(found).await?),
            Err(e) => Err(e),
        };

        match lookup {
            Ok(Some(remote)) => {
                match local {
                    Some(temp) => {
                        let temp_id = temp.entity_id();
                        let Some(_claim) = self.ctx.claim(&temp_id) else {
                            return Ok(temp);
                        };
                        let txn = conn.begin().await?;
                        if GroupRepository::get_by_id(&txn, temp_id.as_str()).await?.is_none() {
                            // Promoted or deleted since it was read
                            txn.commit().await?;
                            let target = AliasRepository::resolve(conn, KIND, &temp_id).await?;
                            if let Some(promoted) = GroupRepository::get_by_id(conn, target.as_str()).await? {
                                return Ok(promoted);
                            }
                            return self.insert_remote(owner, &remote).await;
                        }
                        let promotion = IdentityResolver::promote_group(&txn, &temp_id, &remote, &temp.name).await?;
                        txn.commit().await?;
                        match self.announce(&temp_id, promotion) {
                            CreateReplay::Promoted(row) => Ok(row),
                            _ => Ok(temp),
                        }
                    }
                    None => self.insert_remote(owner, &remote).await,
                }
            }
            Ok(_) => match local {
                Some(temp) => Ok(self.push_create(&temp.entity_id()).await?.unwrap_or(temp)),
                None => self.create_locked(owner, &name).await,
            },
            Err(e) => {
                warn!("⚠️  Remote group lookup failed, using local state: {e}");
                match local {
                    Some(row) => Ok(row),
                    None => self.create_locked(owner, &name).await,
                }
            }
        }
    }

    /// Store a remote group locally unless it is already there.
    async fn insert_remote(&self, owner: &str, remote: &BackendGroup) -> Result<group::Model> {
        let conn = self.ctx.conn();
        if let Some(existing) = GroupRepository::get_by_id(conn, &remote.remote_id).await? {
            return Ok(existing);
        }
        let row = group::Model {
            id: remote.remote_id.clone(),
            user_id: owner.to_string(),
            name: remote.name.clone(),
            created_at: remote.created_at,
            synced: true,
        };
        GroupRepository::insert(conn, &row).await?;
        self.ctx.events.emit_group_changed(&row.entity_id());
        Ok(row)
    }

    /// Ensure every configured default group exists for `owner`.
    pub async fn ensure_default_groups(&self, owner: &str) -> Result<Vec<group::Model>> {
        let mut groups = Vec::new();
        for name in &self.ctx.settings.default_groups {
            groups.push(self.ensure_group(owner, name).await?);
        }
        Ok(groups)
    }

    /// Pull the owner's remote groups into local storage.
    ///
    /// Tombstoned ids are skipped. A synced local copy takes the remote name; an
    /// unsynced one is kept. A remote group matching a local temporary group by
    /// name is adopted as that group.
    pub async fn fetch(&self, owner: &str) -> Result<FetchReport> {
        let mut report = FetchReport::default();
        if !self.ctx.is_online() {
            return Ok(report);
        }

        let remote_groups = match self.ctx.backend.fetch_groups(owner).await {
            Ok(groups) => {
                info!("✅ Fetched {} groups from remote", groups.len());
                groups
            }
            Err(e) => {
                warn!("❌ Failed to fetch groups: {e}");
                return Ok(report);
            }
        };

        let _names = self.name_lock.lock().await;
        let mut changed = Vec::new();
        let mut promoted = Vec::new();

        let txn = self.ctx.conn().begin().await?;
        for remote in remote_groups {
            if TombstoneRepository::is_tombstoned(&txn, KIND, &remote.remote_id).await? {
                report.skipped_tombstoned += 1;
                continue;
            }

            match GroupRepository::get_by_id(&txn, &remote.remote_id).await? {
                Some(local) if local.synced => {
                    if local.name != remote.name {
                        let row = group::Model {
                            name: remote.name.clone(),
                            ..local
                        };
                        GroupRepository::update(&txn, &row).await?;
                        changed.push(row.entity_id());
                        report.updated += 1;
                    }
                }
                Some(_) => report.kept_local += 1,
                None => {
                    let candidate = GroupRepository::find_by_name(&txn, owner, &remote.name)
                        .await?
                        .filter(|g| g.entity_id().is_temporary());
                    let claim = candidate.as_ref().and_then(|g| self.ctx.claim(&g.entity_id()));

                    match (candidate, claim) {
                        (Some(temp), Some(_claim)) => {
                            let temp_id = temp.entity_id();
                            if let Promotion::Promoted { row, .. } =
                                IdentityResolver::promote_group(&txn, &temp_id, &remote, &temp.name).await?
                            {
                                promoted.push((temp_id, row.entity_id()));
                            }
                            report.adopted += 1;
                        }
                        _ => {
                            let row = group::Model {
                                id: remote.remote_id.clone(),
                                user_id: remote.user_id.clone(),
                                name: remote.name.clone(),
                                created_at: remote.created_at,
                                synced: true,
                            };
                            GroupRepository::insert(&txn, &row).await?;
                            changed.push(row.entity_id());
                            report.inserted += 1;
                        }
                    }
                }
            }
        }

        let cutoff = datetime::retention_cutoff(self.ctx.settings.tombstone_retention_days);
        report.pruned_tombstones = TombstoneRepository::prune(&txn, KIND, cutoff).await?;
        report.pruned_aliases = AliasRepository::prune(&txn, KIND, cutoff).await?;
        txn.commit().await?;

        for (from, to) in promoted {
            self.ctx.events.emit_promoted(KIND, &from, &to);
            self.ctx.events.emit_group_changed(&to);
        }
        for id in changed {
            self.ctx.events.emit_group_changed(&id);
        }

        Ok(report)
    }

    /// Replay the group queue: creates first, then renames and deletes.
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
                    warn!("{LOG_PUSH_FAILED}: group create {}: {e}", operation.entity_id);
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
                _ => self.replay_rename(&operation).await?,
            };
            match status {
                ReplayStatus::Applied => report.replayed += 1,
                ReplayStatus::Dropped => report.discarded += 1,
                ReplayStatus::Failed(e) => {
                    warn!("{LOG_PUSH_FAILED}: group {} {}: {e}", operation.op, operation.entity_id);
                    report.failed += 1;
                    blocked.insert(operation.entity_id.clone());
                }
            }
        }

        report.remaining = QueueRepository::count(conn, KIND).await?;
        info!(
            "✅ Group drain: {} replayed, {} promoted, {} failed, {} remaining",
            report.replayed, report.promoted, report.failed, report.remaining
        );
        self.ctx.events.emit(SyncEvent::DrainFinished { report: report.clone() });
        Ok(report)
    }

    async fn replay_rename(&self, operation: &PendingOperation) -> Result<ReplayStatus> {
        let conn = self.ctx.conn();
        let Some(snapshot) = decode_or_drop::<GroupSnapshot, _>(conn, operation).await? else {
            return Ok(ReplayStatus::Dropped);
        };
        let id = &operation.entity_id;

        match self.ctx.backend.update_group(id.as_str(), snapshot.update_args()).await {
            Ok(_) => {
                let txn = conn.begin().await?;
                QueueRepository::remove(&txn, KIND, operation.seq).await?;
                let marked = !QueueRepository::has_pending(&txn, KIND, id).await?
                    && GroupRepository::mark_synced(&txn, id.as_str(), &snapshot.name).await?;
                txn.commit().await?;
                if marked {
                    self.ctx.events.emit_group_changed(id);
                }
                Ok(ReplayStatus::Applied)
            }
            Err(BackendError::NotFound(_)) => {
                warn!("⚠️  Remote group {id} no longer exists, dropping queued rename");
                QueueRepository::remove(conn, KIND, operation.seq).await?;
                Ok(ReplayStatus::Dropped)
            }
            Err(e) => Ok(ReplayStatus::Failed(e)),
        }
    }

    async fn replay_delete(&self, operation: &PendingOperation) -> Result<ReplayStatus> {
        let conn = self.ctx.conn();
        match self.ctx.backend.delete_group(operation.entity_id.as_str()).await {
            Ok(()) | Err(BackendError::NotFound(_)) => {
                QueueRepository::remove(conn, KIND, operation.seq).await?;
                Ok(ReplayStatus::Applied)
            }
            Err(e) => Ok(ReplayStatus::Failed(e)),
        }
    }
}
