mod common;

use chrono::Duration;
use common::{remote_group, Harness, OWNER};
use serde_json::json;
use std::time::Duration as StdDuration;
use todoly_sync::backend::memory::FailPoint;
use todoly_sync::backend::{BackendError, BackendTask, RemoteCall};
use todoly_sync::events::SyncEvent;
use todoly_sync::identifier::{EntityId, EntityKind};
use todoly_sync::repositories::{OperationKind, QueueRepository, TaskRepository, TombstoneRepository};
use todoly_sync::sync::{
    DrainOutcome, GroupRef, IdentityResolver, NewTask, Promotion, TaskChanges, TaskSnapshot,
};
use todoly_sync::task;
use todoly_sync::utils::datetime;

fn under(title: &str, group: &str) -> NewTask {
    NewTask::new(title, GroupRef::Name(group.to_string()))
}

fn completed(outcome: DrainOutcome) -> (todoly_sync::sync::DrainReport, todoly_sync::sync::DrainReport) {
    match outcome {
        DrainOutcome::Completed { groups, tasks } => (groups, tasks),
        other => panic!("expected a completed drain, got {other:?}"),
    }
}

#[tokio::test]
async fn test_offline_group_and_task_are_promoted_together() {
    let h = Harness::new(false).await;
    let group = h.service.create_group(OWNER, "Work").await.unwrap();
    let task = h
        .service
        .create_task(OWNER, NewTask::new("Buy milk", GroupRef::Id(group.entity_id())))
        .await
        .unwrap();
    assert!(group.entity_id().is_temporary());
    assert_eq!(task.group_id, group.id);

    h.go_online();
    let (groups, tasks) = completed(h.service.drain().await.unwrap());

    assert_eq!(groups.promoted, 1);
    assert_eq!(tasks.promoted, 1);
    assert_eq!((groups.remaining, tasks.remaining), (0, 0));

    let local_groups = h.service.get_groups(OWNER).await.unwrap();
    assert_eq!(local_groups.len(), 1);
    let work = &local_groups[0];
    assert!(work.entity_id().is_permanent());
    assert!(work.synced);

    let local_tasks = h.service.get_tasks(OWNER).await.unwrap();
    assert_eq!(local_tasks.len(), 1);
    let milk = &local_tasks[0];
    assert!(milk.entity_id().is_permanent());
    assert!(milk.synced);
    assert_eq!(milk.group_id, work.id);
    assert_eq!(h.remote.task(&milk.id).unwrap().group_remote_id, work.id);

    // The temporary ids are gone everywhere
    let conn = &h.service.storage().conn;
    assert!(!QueueRepository::references(conn, &group.entity_id()).await.unwrap());
    assert!(!QueueRepository::references(conn, &task.entity_id()).await.unwrap());
    // The old id still finds the promoted task
    let stale = h.service.get_task(&task.entity_id()).await.unwrap().unwrap();
    assert_eq!(stale.id, milk.id);
}

#[tokio::test]
async fn test_promoted_events_are_published() {
    let h = Harness::new(false).await;
    let task = h.service.create_task(OWNER, under("Evented", "Work")).await.unwrap();
    let mut events = h.service.subscribe();

    h.go_online();
    h.service.drain().await.unwrap();

    let mut promoted = Vec::new();
    let mut finished = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            SyncEvent::Promoted { kind, from, .. } => promoted.push((kind, from)),
            SyncEvent::DrainFinished { .. } => finished += 1,
            _ => {}
        }
    }
    assert!(promoted.contains(&(EntityKind::Group, task.group_ref())));
    assert!(promoted.contains(&(EntityKind::Task, task.entity_id())));
    assert_eq!(finished, 2);
}

#[tokio::test]
async fn test_remap_completeness_when_task_create_fails() {
    let h = Harness::new(false).await;
    let task = h.service.create_task(OWNER, under("Buy milk", "Work")).await.unwrap();
    let temp_group = task.group_ref();

    h.go_online();
    h.remote
        .fail_next(FailPoint::CreateTask, BackendError::Network("timeout".to_string()));
    let (groups, tasks) = completed(h.service.drain().await.unwrap());
    assert_eq!(groups.promoted, 1);
    assert_eq!(tasks.failed, 1);
    assert_eq!(tasks.remaining, 1);

    let conn = &h.service.storage().conn;
    assert!(!QueueRepository::references(conn, &temp_group).await.unwrap());
    let queued = QueueRepository::list(conn, EntityKind::Task).await.unwrap();
    let snapshot: TaskSnapshot = queued[0].payload_as().unwrap();
    let permanent_group = h.service.get_groups(OWNER).await.unwrap()[0].id.clone();
    assert_eq!(snapshot.group_id, permanent_group);
    assert_eq!(
        h.service.get_task(&task.entity_id()).await.unwrap().unwrap().group_id,
        permanent_group
    );

    let (_, tasks) = completed(h.service.drain().await.unwrap());
    assert_eq!(tasks.promoted, 1);
    assert_eq!(tasks.remaining, 0);
}

#[tokio::test]
async fn test_task_waits_for_its_group() {
    let h = Harness::new(false).await;
    h.service.create_task(OWNER, under("Blocked", "New group")).await.unwrap();

    h.go_online();
    h.remote
        .fail_next(FailPoint::CreateGroup, BackendError::Network("timeout".to_string()));
    let (groups, tasks) = completed(h.service.drain().await.unwrap());

    assert_eq!(groups.failed, 1);
    assert_eq!(tasks.deferred, 1);
    assert_eq!(h.count_calls(|c| matches!(c, RemoteCall::CreateTask { .. })), 0);
    assert_eq!(h.service.pending_counts().await.unwrap().total(), 2);
}

#[tokio::test]
async fn test_partial_failure_keeps_remaining_operations() {
    let h = Harness::new(false).await;
    let first = h.service.create_group(OWNER, "First").await.unwrap();
    h.service.create_group(OWNER, "Second").await.unwrap();

    h.go_online();
    h.remote.fail_next(
        FailPoint::CreateGroup,
        BackendError::Rejected {
            status: 503,
            message: "unavailable".to_string(),
        },
    );
    let (groups, _) = completed(h.service.drain().await.unwrap());

    assert_eq!(groups.failed, 1);
    assert_eq!(groups.promoted, 1);
    assert_eq!(groups.remaining, 1);
    assert!(h.service.get_group(&first.entity_id()).await.unwrap().is_some());
    assert!(h.monitor.is_online());

    let (groups, _) = completed(h.service.drain().await.unwrap());
    assert_eq!(groups.promoted, 1);
    assert_eq!(groups.remaining, 0);
    assert_eq!(h.remote.groups().len(), 2);
}

#[tokio::test]
async fn test_unreachable_remote_leaves_queue_intact() {
    let h = Harness::new(false).await;
    h.service.create_task(OWNER, under("Later", "Work")).await.unwrap();

    h.go_online();
    h.remote.set_unreachable(true);
    let (groups, tasks) = completed(h.service.drain().await.unwrap());

    assert_eq!(groups.failed, 1);
    assert_eq!((groups.remaining, tasks.remaining), (1, 1));
    assert!(h.service.is_online());
}

#[tokio::test]
async fn test_drain_is_idempotent() {
    let h = Harness::new(false).await;
    let task = h.service.create_task(OWNER, under("Once", "Work")).await.unwrap();
    h.service.toggle_complete(&task.entity_id()).await.unwrap();

    h.go_online();
    completed(h.service.drain().await.unwrap());
    let before = h.service.get_tasks(OWNER).await.unwrap();
    h.remote.clear_calls();

    let (groups, tasks) = completed(h.service.drain().await.unwrap());

    assert_eq!(groups.replayed + tasks.replayed, 0);
    assert!(h.remote.write_calls().is_empty());
    assert_eq!(h.service.get_tasks(OWNER).await.unwrap(), before);
}

#[tokio::test]
async fn test_drain_refuses_while_offline() {
    let h = Harness::new(false).await;
    h.service.create_task(OWNER, under("Queued", "Work")).await.unwrap();

    let outcome = h.service.drain().await.unwrap();

    assert_eq!(outcome, DrainOutcome::Offline);
    assert!(h.remote.calls().is_empty());
    assert_eq!(h.service.pending_counts().await.unwrap().total(), 2);
}

#[tokio::test]
async fn test_concurrent_drains_are_single_flight() {
    let h = Harness::new(false).await;
    h.service.create_task(OWNER, under("Only once", "Work")).await.unwrap();
    h.go_online();

    let (a, b) = tokio::join!(h.service.drain(), h.service.drain());
    let outcomes = [a.unwrap(), b.unwrap()];

    let running = outcomes
        .iter()
        .filter(|o| **o == DrainOutcome::AlreadyRunning)
        .count();
    assert_eq!(running, 1);
    assert_eq!(h.remote.tasks().len(), 1);
    assert_eq!(h.count_calls(|c| matches!(c, RemoteCall::CreateTask { .. })), 1);
    assert!(!h.service.scheduler().is_draining());
}

#[tokio::test]
async fn test_orphaned_operations_are_discarded() {
    let h = Harness::new(true).await;
    let conn = &h.service.storage().conn;
    let orphan = EntityId::temporary(EntityKind::Task);
    QueueRepository::enqueue(
        conn,
        EntityKind::Task,
        OperationKind::Update,
        &orphan,
        &json!({ "id": orphan.as_str() }),
    )
    .await
    .unwrap();

    let (_, tasks) = completed(h.service.drain().await.unwrap());

    assert_eq!(tasks.discarded, 1);
    assert_eq!(tasks.remaining, 0);
    assert!(h.remote.write_calls().is_empty());
}

#[tokio::test]
async fn test_unreadable_payload_is_dropped() {
    let h = Harness::new(true).await;
    let conn = &h.service.storage().conn;
    let id = EntityId::temporary(EntityKind::Task);
    QueueRepository::enqueue(conn, EntityKind::Task, OperationKind::Create, &id, &json!({ "bogus": true }))
        .await
        .unwrap();

    let (_, tasks) = completed(h.service.drain().await.unwrap());

    assert_eq!(tasks.discarded, 1);
    assert_eq!(tasks.remaining, 0);
}

#[tokio::test]
async fn test_remote_not_found_drops_queued_update() {
    let h = Harness::new(true).await;
    let task = h.service.create_task(OWNER, under("Gone remotely", "Work")).await.unwrap();

    h.go_offline();
    h.service
        .update_task(
            &task.entity_id(),
            TaskChanges {
                title: Some("Edited".to_string()),
                ..TaskChanges::default()
            },
        )
        .await
        .unwrap();
    h.remote.remove_task(&task.id);

    h.go_online();
    let (_, tasks) = completed(h.service.drain().await.unwrap());

    assert_eq!(tasks.discarded, 1);
    assert_eq!(tasks.remaining, 0);
    let local = h.service.get_task(&task.entity_id()).await.unwrap().unwrap();
    assert_eq!(local.title, "Edited");
}

#[tokio::test]
async fn test_fetch_overwrites_synced_row_with_newer_remote() {
    let h = Harness::new(true).await;
    let task = h.service.create_task(OWNER, under("Original", "Work")).await.unwrap();

    let mut remote = h.remote.task(&task.id).unwrap();
    remote.title = "Edited elsewhere".to_string();
    remote.updated_at = task.updated_at + Duration::minutes(1);
    h.remote.seed_task(remote);

    let report = h.service.refresh(OWNER).await.unwrap();

    assert_eq!(report.tasks.updated, 1);
    let local = h.service.get_task(&task.entity_id()).await.unwrap().unwrap();
    assert_eq!(local.title, "Edited elsewhere");
    assert!(local.synced);
}

#[tokio::test]
async fn test_fetch_keeps_synced_row_when_remote_is_older() {
    let h = Harness::new(true).await;
    let task = h.service.create_task(OWNER, under("Mine", "Work")).await.unwrap();

    let mut remote = h.remote.task(&task.id).unwrap();
    remote.title = "Stale".to_string();
    remote.updated_at = task.updated_at - Duration::minutes(1);
    h.remote.seed_task(remote);

    let report = h.service.refresh(OWNER).await.unwrap();

    assert_eq!(report.tasks.updated, 0);
    let local = h.service.get_task(&task.entity_id()).await.unwrap().unwrap();
    assert_eq!(local.title, "Mine");
}

#[tokio::test]
async fn test_fetch_keeps_unsynced_row() {
    let h = Harness::new(true).await;
    let task = h.service.create_task(OWNER, under("Shared", "Work")).await.unwrap();

    h.go_offline();
    h.service
        .update_task(
            &task.entity_id(),
            TaskChanges {
                title: Some("Local edit".to_string()),
                ..TaskChanges::default()
            },
        )
        .await
        .unwrap();

    let mut remote = h.remote.task(&task.id).unwrap();
    remote.title = "Remote edit".to_string();
    remote.updated_at = task.updated_at + Duration::hours(1);
    h.remote.seed_task(remote);

    h.go_online();
    let report = h.service.refresh(OWNER).await.unwrap();
    assert_eq!(report.tasks.kept_local, 1);
    assert_eq!(
        h.service.get_task(&task.entity_id()).await.unwrap().unwrap().title,
        "Local edit"
    );

    h.service.drain().await.unwrap();
    assert_eq!(h.remote.task(&task.id).unwrap().title, "Local edit");
}

#[tokio::test]
async fn test_fetch_skips_tombstoned_records() {
    let h = Harness::new(true).await;
    let task = h.service.create_task(OWNER, under("Deleted offline", "Work")).await.unwrap();

    h.go_offline();
    h.service.delete_task(&task.entity_id()).await.unwrap();

    h.go_online();
    let report = h.service.refresh(OWNER).await.unwrap();

    assert_eq!(report.tasks.skipped_tombstoned, 1);
    assert!(h.service.get_task(&task.entity_id()).await.unwrap().is_none());

    h.service.drain().await.unwrap();
    assert!(h.remote.task(&task.id).is_none());
}

#[tokio::test]
async fn test_fetch_adopts_temporary_group_with_same_name() {
    let h = Harness::new(false).await;
    let task = h.service.create_task(OWNER, under("Pack bags", "Travel")).await.unwrap();
    h.remote.seed_group(remote_group("g-travel", "Travel"));

    h.go_online();
    let report = h.service.refresh(OWNER).await.unwrap();

    assert_eq!(report.groups.adopted, 1);
    let groups = h.service.get_groups(OWNER).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].id, "g-travel");
    assert_eq!(
        h.service.get_task(&task.entity_id()).await.unwrap().unwrap().group_id,
        "g-travel"
    );

    h.service.drain().await.unwrap();
    assert_eq!(h.count_calls(|c| matches!(c, RemoteCall::CreateGroup { .. })), 0);
    assert_eq!(h.remote.groups().len(), 1);
}

#[tokio::test]
async fn test_create_replay_adopts_remote_group_with_same_name() {
    let h = Harness::new(false).await;
    h.service.create_group(OWNER, "Family").await.unwrap();
    h.remote.seed_group(remote_group("g-family", "family"));

    h.go_online();
    h.service.drain().await.unwrap();

    let groups = h.service.get_groups(OWNER).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].id, "g-family");
    assert_eq!(h.count_calls(|c| matches!(c, RemoteCall::CreateGroup { .. })), 0);
}

#[tokio::test]
async fn test_concurrent_task_creates_online_share_one_group() {
    let h = Harness::new(true).await;

    let (a, b) = tokio::join!(
        h.service.create_task(OWNER, under("Apples", "Market")),
        h.service.create_task(OWNER, under("Pears", "market"))
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.group_id, b.group_id);
    assert!(a.group_ref().is_permanent());
    assert_eq!(h.remote.groups().len(), 1);
}

#[tokio::test]
async fn test_promotion_keeps_edit_made_while_create_was_in_flight() {
    let h = Harness::new(false).await;
    let conn = &h.service.storage().conn;
    let row = h.service.create_task(OWNER, under("Before", "Work")).await.unwrap();
    let pushed = TaskSnapshot::from(&row);

    let edited = task::Model {
        title: "After".to_string(),
        updated_at: datetime::next_stamp(row.updated_at),
        ..row.clone()
    };
    TaskRepository::update(conn, &edited).await.unwrap();

    let remote = BackendTask {
        remote_id: "t-perm".to_string(),
        user_id: OWNER.to_string(),
        title: "Before".to_string(),
        description: None,
        group_remote_id: row.group_id.clone(),
        is_completed: false,
        created_at: row.created_at,
        updated_at: row.updated_at,
    };
    let promotion = IdentityResolver::promote_task(conn, &row.entity_id(), &remote, &pushed)
        .await
        .unwrap();

    match promotion {
        Promotion::Promoted { row, follow_up_queued } => {
            assert!(follow_up_queued);
            assert_eq!(row.id, "t-perm");
            assert_eq!(row.title, "After");
            assert!(!row.synced);
        }
        other => panic!("expected promotion, got {other:?}"),
    }
    let queued = QueueRepository::list(conn, EntityKind::Task).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].op, OperationKind::Update);
    assert_eq!(queued[0].entity_id, EntityId::permanent("t-perm"));
}

#[tokio::test]
async fn test_promotion_of_deleted_row_queues_remote_delete() {
    let h = Harness::new(false).await;
    let conn = &h.service.storage().conn;
    let row = h.service.create_task(OWNER, under("Short lived", "Work")).await.unwrap();
    let pushed = TaskSnapshot::from(&row);
    TaskRepository::delete(conn, &row.id).await.unwrap();

    let remote = BackendTask {
        remote_id: "t-ghost".to_string(),
        user_id: OWNER.to_string(),
        title: row.title.clone(),
        description: None,
        group_remote_id: row.group_id.clone(),
        is_completed: false,
        created_at: row.created_at,
        updated_at: row.updated_at,
    };
    let promotion = IdentityResolver::promote_task(conn, &row.entity_id(), &remote, &pushed)
        .await
        .unwrap();

    assert_eq!(
        promotion,
        Promotion::Vanished {
            permanent: EntityId::permanent("t-ghost")
        }
    );
    assert!(TombstoneRepository::is_tombstoned(conn, EntityKind::Task, "t-ghost").await.unwrap());
    let queued = QueueRepository::list(conn, EntityKind::Task).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].op, OperationKind::Delete);
    assert!(h.service.get_task(&EntityId::permanent("t-ghost")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_reconnect_triggers_background_drain() {
    let h = Harness::new(false).await;
    h.service.create_task(OWNER, under("Sync me", "Work")).await.unwrap();
    let mut events = h.service.subscribe();
    let listener = h.service.start();

    h.go_online();

    let finished = tokio::time::timeout(StdDuration::from_secs(10), async {
        let mut saw_connectivity = false;
        loop {
            match events.recv().await {
                Ok(SyncEvent::ConnectivityChanged { online: true }) => saw_connectivity = true,
                Ok(SyncEvent::DrainFinished { report }) if report.kind == EntityKind::Task => {
                    return (saw_connectivity, report);
                }
                Ok(_) => {}
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await
    .expect("drain should run after reconnect");
    listener.abort();

    let (saw_connectivity, report) = finished;
    assert!(saw_connectivity);
    assert_eq!(report.remaining, 0);
    assert_eq!(h.remote.tasks().len(), 1);
}

#[tokio::test]
async fn test_repeated_online_signal_does_not_trigger_drain() {
    let h = Harness::new(true).await;
    let listener = h.service.start();

    assert!(!h.monitor.set_online(true));
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    listener.abort();

    assert!(h.remote.calls().is_empty());
}

#[tokio::test]
async fn test_temporary_ids_keep_working_after_promotion() {
    let h = Harness::new(false).await;
    let group = h.service.create_group(OWNER, "Work").await.unwrap();
    let task = h
        .service
        .create_task(OWNER, NewTask::new("Buy milk", GroupRef::Id(group.entity_id())))
        .await
        .unwrap();
    let temp_group = group.entity_id();
    let temp_task = task.entity_id();

    h.go_online();
    h.service.drain().await.unwrap();

    let toggled = h.service.toggle_complete(&temp_task).await.unwrap();
    assert!(toggled.entity_id().is_permanent());
    assert!(toggled.is_completed);
    assert!(h.remote.task(&toggled.id).unwrap().is_completed);

    let renamed = h.service.rename_group(&temp_group, "Office").await.unwrap();
    assert!(renamed.entity_id().is_permanent());
    assert_eq!(h.remote.group(&renamed.id).unwrap().name, "Office");

    assert_eq!(h.service.get_tasks_for_group(OWNER, &temp_group).await.unwrap().len(), 1);

    let updated = h
        .service
        .update_task(
            &temp_task,
            TaskChanges {
                title: Some("Buy oat milk".to_string()),
                group: Some(GroupRef::Id(temp_group.clone())),
                ..TaskChanges::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.group_id, renamed.id);
    assert_eq!(h.remote.task(&updated.id).unwrap().title, "Buy oat milk");
    assert!(!h.service.is_pending(EntityKind::Task, &temp_task).await.unwrap());

    h.service.delete_task(&temp_task).await.unwrap();
    assert!(h.service.get_task(&temp_task).await.unwrap().is_none());
    assert!(h.remote.task(&toggled.id).is_none());

    h.service.delete_group(&temp_group).await.unwrap();
    assert!(h.service.get_group(&temp_group).await.unwrap().is_none());
    assert!(h.remote.group(&renamed.id).is_none());

    assert_eq!(h.count_calls(|c| matches!(c, RemoteCall::CreateTask { .. })), 1);
    assert_eq!(h.count_calls(|c| matches!(c, RemoteCall::CreateGroup { .. })), 1);
    assert_eq!(h.service.pending_counts().await.unwrap().total(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rename_racing_a_drain_is_kept() {
    for _ in 0..25 {
        let h = Harness::new(false).await;
        let group = h.service.create_group(OWNER, "Work").await.unwrap();
        h.go_online();

        let drainer = h.service.clone();
        let renamer = h.service.clone();
        let temp = group.entity_id();
        let (drained, renamed) = tokio::join!(
            tokio::spawn(async move { drainer.drain().await }),
            tokio::spawn(async move { renamer.rename_group(&temp, "Office").await }),
        );
        drained.unwrap().unwrap();
        assert_eq!(renamed.unwrap().unwrap().name, "Office");

        h.service.drain().await.unwrap();

        let groups = h.service.get_groups(OWNER).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "Office");
        assert!(groups[0].entity_id().is_permanent());
        assert!(groups[0].synced);

        let remote = h.remote.groups();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].remote_id, groups[0].id);
        assert_eq!(remote[0].name, "Office");

        assert_eq!(h.count_calls(|c| matches!(c, RemoteCall::DeleteGroup { .. })), 0);
        assert_eq!(h.count_calls(|c| matches!(c, RemoteCall::CreateGroup { .. })), 1);
        assert_eq!(h.service.pending_counts().await.unwrap().total(), 0);
        assert_eq!(TombstoneRepository::count(&h.service.storage().conn, EntityKind::Group).await.unwrap(), 0);
    }
}
