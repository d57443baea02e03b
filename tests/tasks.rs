mod common;

use common::{remote_group, remote_task, Harness, OWNER};
use todoly_sync::backend::memory::FailPoint;
use todoly_sync::backend::{BackendError, RemoteCall};
use todoly_sync::events::SyncEvent;
use todoly_sync::identifier::{EntityId, EntityKind};
use todoly_sync::sync::{GroupRef, NewTask, TaskChanges, ValidationError};

fn in_group(title: &str, group: &str) -> NewTask {
    NewTask::new(title, GroupRef::Name(group.to_string()))
}

#[tokio::test]
async fn test_create_online_is_promoted_immediately() {
    let h = Harness::new(true).await;

    let task = h.service.create_task(OWNER, in_group("Buy milk", "Personal")).await.unwrap();

    assert!(task.entity_id().is_permanent());
    assert!(task.synced);
    assert!(task.group_ref().is_permanent());
    let remote = h.remote.task(&task.id).expect("task should exist remotely");
    assert_eq!(remote.title, "Buy milk");
    assert_eq!(remote.group_remote_id, task.group_id);
    assert_eq!(h.service.pending_counts().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_create_offline_is_queued_with_temporary_id() {
    let h = Harness::new(false).await;

    let task = h.service.create_task(OWNER, in_group("Buy milk", "Personal")).await.unwrap();

    assert!(task.entity_id().is_temporary());
    assert!(!task.synced);
    assert!(h.remote.calls().is_empty());

    let pending = h.service.pending_counts().await.unwrap();
    assert_eq!(pending.tasks, 1);
    assert_eq!(pending.groups, 1);
    assert!(h.service.is_pending(EntityKind::Task, &task.entity_id()).await.unwrap());

    // Reads are served locally while offline
    let tasks = h.service.get_tasks(OWNER).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].title, "Buy milk");
}

#[tokio::test]
async fn test_create_trims_and_normalizes_fields() {
    let h = Harness::new(false).await;

    let task = h
        .service
        .create_task(OWNER, in_group("  Call mom  ", "Personal").with_description("   "))
        .await
        .unwrap();

    assert_eq!(task.title, "Call mom");
    assert_eq!(task.description, None);
    assert!(!task.is_completed);
}

#[tokio::test]
async fn test_empty_title_is_rejected_before_writing() {
    let h = Harness::new(true).await;

    let err = h.service.create_task(OWNER, in_group("   ", "Personal")).await.unwrap_err();

    assert_eq!(err.downcast_ref::<ValidationError>(), Some(&ValidationError::EmptyTitle));
    assert!(h.service.get_tasks(OWNER).await.unwrap().is_empty());
    assert!(h.service.get_groups(OWNER).await.unwrap().is_empty());
    assert!(h.remote.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_group_id_is_rejected() {
    let h = Harness::new(true).await;
    let missing = EntityId::permanent("no-such-group");

    let err = h
        .service
        .create_task(OWNER, NewTask::new("Orphan", GroupRef::Id(missing.clone())))
        .await
        .unwrap_err();

    assert_eq!(
        err.downcast_ref::<ValidationError>(),
        Some(&ValidationError::GroupNotFound(missing))
    );
}

#[tokio::test]
async fn test_update_online_pushes_directly() {
    let h = Harness::new(true).await;
    let task = h.service.create_task(OWNER, in_group("Draft", "Work")).await.unwrap();

    let changes = TaskChanges {
        title: Some("Final".to_string()),
        description: Some(Some("with notes".to_string())),
        ..TaskChanges::default()
    };
    let updated = h.service.update_task(&task.entity_id(), changes).await.unwrap();

    assert_eq!(updated.title, "Final");
    assert_eq!(updated.description.as_deref(), Some("with notes"));
    assert!(updated.synced);
    assert_eq!(h.remote.task(&task.id).unwrap().title, "Final");
    assert_eq!(h.service.pending_counts().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_update_without_changes_is_a_no_op() {
    let h = Harness::new(true).await;
    let task = h.service.create_task(OWNER, in_group("Same", "Work")).await.unwrap();
    let before = h.service.get_task(&task.entity_id()).await.unwrap().unwrap();
    h.remote.clear_calls();

    let unchanged = h
        .service
        .update_task(
            &task.entity_id(),
            TaskChanges {
                title: Some("Same".to_string()),
                ..TaskChanges::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(unchanged, before);
    assert!(h.remote.calls().is_empty());
}

#[tokio::test]
async fn test_update_of_missing_task_fails() {
    let h = Harness::new(true).await;
    let missing = EntityId::permanent("ghost");

    let err = h.service.toggle_complete(&missing).await.unwrap_err();

    assert_eq!(
        err.downcast_ref::<ValidationError>(),
        Some(&ValidationError::TaskNotFound(missing))
    );
}

#[tokio::test]
async fn test_offline_edits_of_temporary_task_fold_into_create() {
    let h = Harness::new(false).await;
    let task = h.service.create_task(OWNER, in_group("Draft", "Work")).await.unwrap();

    h.service
        .update_task(
            &task.entity_id(),
            TaskChanges {
                title: Some("Edited offline".to_string()),
                ..TaskChanges::default()
            },
        )
        .await
        .unwrap();
    h.service.toggle_complete(&task.entity_id()).await.unwrap();

    assert_eq!(h.service.pending_counts().await.unwrap().tasks, 1);

    h.go_online();
    h.service.drain().await.unwrap();

    let remote = h.remote.tasks();
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].title, "Edited offline");
    assert!(remote[0].is_completed);
    assert_eq!(h.count_calls(|c| matches!(c, RemoteCall::UpdateTask { .. })), 0);
}

#[tokio::test]
async fn test_offline_updates_of_permanent_task_coalesce() {
    let h = Harness::new(true).await;
    let task = h.service.create_task(OWNER, in_group("Write report", "Work")).await.unwrap();
    let id = task.entity_id();

    h.go_offline();
    h.service.toggle_complete(&id).await.unwrap();
    h.service
        .update_task(
            &id,
            TaskChanges {
                title: Some("Write the report".to_string()),
                ..TaskChanges::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(h.service.pending_counts().await.unwrap().tasks, 1);
    let local = h.service.get_task(&id).await.unwrap().unwrap();
    assert!(!local.synced);

    h.go_online();
    h.remote.clear_calls();
    h.service.drain().await.unwrap();

    assert_eq!(h.count_calls(|c| matches!(c, RemoteCall::UpdateTask { .. })), 1);
    let remote = h.remote.task(&task.id).unwrap();
    assert_eq!(remote.title, "Write the report");
    assert!(remote.is_completed);
    let local = h.service.get_task(&id).await.unwrap().unwrap();
    assert!(local.synced);
}

#[tokio::test]
async fn test_local_updated_at_is_monotonic() {
    let h = Harness::new(false).await;
    let task = h.service.create_task(OWNER, in_group("Tick", "Work")).await.unwrap();

    let first = h.service.toggle_complete(&task.entity_id()).await.unwrap();
    let second = h.service.toggle_complete(&task.entity_id()).await.unwrap();

    assert!(first.updated_at > task.updated_at);
    assert!(second.updated_at > first.updated_at);
}

#[tokio::test]
async fn test_move_task_to_another_group_by_name() {
    let h = Harness::new(true).await;
    let task = h.service.create_task(OWNER, in_group("Plan trip", "Work")).await.unwrap();

    let moved = h
        .service
        .update_task(
            &task.entity_id(),
            TaskChanges {
                group: Some(GroupRef::Name("Personal".to_string())),
                ..TaskChanges::default()
            },
        )
        .await
        .unwrap();

    let personal = h
        .service
        .get_groups(OWNER)
        .await
        .unwrap()
        .into_iter()
        .find(|g| g.name == "Personal")
        .unwrap();
    assert_eq!(moved.group_id, personal.id);
    assert_eq!(h.remote.task(&task.id).unwrap().group_remote_id, personal.id);
}

#[tokio::test]
async fn test_delete_temporary_task_never_reaches_remote() {
    let h = Harness::new(false).await;
    let task = h.service.create_task(OWNER, in_group("Scratch", "Work")).await.unwrap();

    h.service.delete_task(&task.entity_id()).await.unwrap();

    assert!(h.service.get_task(&task.entity_id()).await.unwrap().is_none());
    assert_eq!(h.service.pending_counts().await.unwrap().tasks, 0);

    h.go_online();
    h.service.drain().await.unwrap();
    assert_eq!(h.count_calls(|c| matches!(c, RemoteCall::CreateTask { .. })), 0);
    assert_eq!(h.count_calls(|c| matches!(c, RemoteCall::DeleteTask { .. })), 0);
}

#[tokio::test]
async fn test_delete_drops_queued_updates() {
    let h = Harness::new(true).await;
    let task = h.service.create_task(OWNER, in_group("Doomed", "Work")).await.unwrap();
    let id = task.entity_id();

    h.go_offline();
    h.service.toggle_complete(&id).await.unwrap();
    h.service.delete_task(&id).await.unwrap();
    assert_eq!(h.service.pending_counts().await.unwrap().tasks, 1);

    h.go_online();
    h.remote.clear_calls();
    h.service.drain().await.unwrap();

    assert_eq!(h.count_calls(|c| matches!(c, RemoteCall::UpdateTask { .. })), 0);
    assert_eq!(h.count_calls(|c| matches!(c, RemoteCall::DeleteTask { .. })), 1);
    assert!(h.remote.task(&task.id).is_none());
}

#[tokio::test]
async fn test_delete_online_removes_remote_record() {
    let h = Harness::new(true).await;
    let task = h.service.create_task(OWNER, in_group("Done soon", "Work")).await.unwrap();

    h.service.delete_task(&task.entity_id()).await.unwrap();

    assert!(h.remote.task(&task.id).is_none());
    assert_eq!(h.service.pending_counts().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_failed_direct_push_is_queued() {
    let h = Harness::new(true).await;
    let task = h.service.create_task(OWNER, in_group("Flaky", "Work")).await.unwrap();

    h.remote
        .fail_next(FailPoint::UpdateTask, BackendError::Network("connection reset".to_string()));
    let updated = h.service.toggle_complete(&task.entity_id()).await.unwrap();

    assert!(updated.is_completed);
    assert!(!updated.synced);
    assert_eq!(h.service.pending_counts().await.unwrap().tasks, 1);

    h.service.drain().await.unwrap();
    assert!(h.remote.task(&task.id).unwrap().is_completed);
    assert_eq!(h.service.pending_counts().await.unwrap().tasks, 0);
}

#[tokio::test]
async fn test_delete_many_skips_unknown_ids() {
    let h = Harness::new(true).await;
    let a = h.service.create_task(OWNER, in_group("A", "Work")).await.unwrap();
    let b = h.service.create_task(OWNER, in_group("B", "Work")).await.unwrap();

    let deleted = h
        .service
        .delete_tasks(&[a.entity_id(), EntityId::permanent("unknown"), b.entity_id()])
        .await
        .unwrap();

    assert_eq!(deleted, 2);
    assert!(h.service.get_tasks(OWNER).await.unwrap().is_empty());
    assert!(h.remote.tasks().is_empty());
}

#[tokio::test]
async fn test_filtered_reads() {
    let h = Harness::new(true).await;
    let work = h.service.create_task(OWNER, in_group("Ship it", "Work")).await.unwrap();
    let home = h.service.create_task(OWNER, in_group("Water plants", "Home")).await.unwrap();
    h.service.toggle_complete(&home.entity_id()).await.unwrap();

    let active = h.service.get_tasks_by_status(OWNER, false).await.unwrap();
    let completed = h.service.get_tasks_by_status(OWNER, true).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, work.id);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, home.id);

    let in_work = h
        .service
        .get_tasks_for_group(OWNER, &work.group_ref())
        .await
        .unwrap();
    assert_eq!(in_work.len(), 1);
    assert_eq!(in_work[0].title, "Ship it");

    assert!(h.service.get_tasks("someone-else").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_events_for_online_create() {
    let h = Harness::new(true).await;
    let mut events = h.service.subscribe();

    let task = h.service.create_task(OWNER, in_group("Notify me", "Work")).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.iter().any(|e| matches!(
        e,
        SyncEvent::Promoted { kind: EntityKind::Task, to, .. } if *to == task.entity_id()
    )));
    assert!(seen
        .iter()
        .any(|e| matches!(e, SyncEvent::TaskChanged { id } if id.is_temporary())));
}

#[tokio::test]
async fn test_fetch_inserts_remote_tasks() {
    let h = Harness::new(true).await;
    h.remote.seed_group(remote_group("g-1", "Inbox"));
    h.remote.seed_task(remote_task("t-1", "From another device", "g-1"));

    let report = h.service.refresh(OWNER).await.unwrap();

    assert_eq!(report.groups.inserted, 1);
    assert_eq!(report.tasks.inserted, 1);
    let local = h.service.get_task(&EntityId::permanent("t-1")).await.unwrap().unwrap();
    assert_eq!(local.title, "From another device");
    assert!(local.synced);
}
