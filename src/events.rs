//! Change notifications.
//!
//! The engines publish a [`SyncEvent`] after every local write, promotion,
//! drain and connectivity change. Consumers subscribe instead of re-reading the
//! store on a timer; publishing with nobody listening is fine.

use tokio::sync::broadcast;

use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::identifier::{EntityId, EntityKind};
use crate::sync::DrainReport;

#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    /// A task row was inserted or changed locally or by a fetch
    TaskChanged { id: EntityId },
    /// A group row was inserted or changed locally or by a fetch
    GroupChanged { id: EntityId },
    TaskRemoved { id: EntityId },
    GroupRemoved { id: EntityId },
    /// A temporary identifier was replaced by the remote one
    Promoted { kind: EntityKind, from: EntityId, to: EntityId },
    DrainStarted { kind: EntityKind },
    DrainFinished { report: DrainReport },
    ConnectivityChanged { online: bool },
}

/// Fan-out of [`SyncEvent`]s to any number of subscribers.
#[derive(Clone, Debug)]
pub struct EventDispatcher {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        // No receivers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn emit_task_changed(&self, id: &EntityId) {
        self.emit(SyncEvent::TaskChanged { id: id.clone() });
    }

    pub fn emit_group_changed(&self, id: &EntityId) {
        self.emit(SyncEvent::GroupChanged { id: id.clone() });
    }

    pub fn emit_task_removed(&self, id: &EntityId) {
        self.emit(SyncEvent::TaskRemoved { id: id.clone() });
    }

    pub fn emit_group_removed(&self, id: &EntityId) {
        self.emit(SyncEvent::GroupRemoved { id: id.clone() });
    }

    pub fn emit_promoted(&self, kind: EntityKind, from: &EntityId, to: &EntityId) {
        self.emit(SyncEvent::Promoted {
            kind,
            from: from.clone(),
            to: to.clone(),
        });
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
