#![allow(dead_code)]

use chrono::{Duration, Utc};
use std::sync::Arc;
use todoly_sync::backend::{Backend, BackendGroup, BackendTask, InMemoryBackend, RemoteCall};
use todoly_sync::config::SyncConfig;
use todoly_sync::connectivity::ConnectivityMonitor;
use todoly_sync::storage::LocalStorage;
use todoly_sync::sync::SyncService;

pub const OWNER: &str = "user-1";

/// A service wired to an in-memory store and an in-memory remote.
pub struct Harness {
    pub service: SyncService,
    pub remote: Arc<InMemoryBackend>,
    pub monitor: ConnectivityMonitor,
}

impl Harness {
    pub async fn new(online: bool) -> Self {
        Self::with_settings(online, test_settings()).await
    }

    pub async fn with_settings(online: bool, settings: SyncConfig) -> Self {
        let storage = Arc::new(LocalStorage::in_memory().await.unwrap());
        let remote = Arc::new(InMemoryBackend::new());
        let monitor = ConnectivityMonitor::new(online);
        let backend: Arc<dyn Backend> = remote.clone();
        let service = SyncService::new(storage, backend, monitor.clone(), settings);
        Self {
            service,
            remote,
            monitor,
        }
    }

    pub fn go_offline(&self) {
        self.monitor.set_online(false);
    }

    pub fn go_online(&self) {
        self.monitor.set_online(true);
    }

    pub fn count_calls(&self, matches: impl Fn(&RemoteCall) -> bool) -> usize {
        self.remote.calls().iter().filter(|call| matches(call)).count()
    }
}

/// No background polling, no default groups.
pub fn test_settings() -> SyncConfig {
    SyncConfig {
        poll_interval_secs: 0,
        default_groups: Vec::new(),
        ..SyncConfig::default()
    }
}

pub fn remote_group(id: &str, name: &str) -> BackendGroup {
    BackendGroup {
        remote_id: id.to_string(),
        user_id: OWNER.to_string(),
        name: name.to_string(),
        created_at: Utc::now() - Duration::days(1),
    }
}

pub fn remote_task(id: &str, title: &str, group_id: &str) -> BackendTask {
    let stamp = Utc::now() - Duration::hours(1);
    BackendTask {
        remote_id: id.to_string(),
        user_id: OWNER.to_string(),
        title: title.to_string(),
        description: None,
        group_remote_id: group_id.to_string(),
        is_completed: false,
        created_at: stamp,
        updated_at: stamp,
    }
}
