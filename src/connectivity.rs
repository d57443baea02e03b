//! Reachability of the remote store.
//!
//! [`ConnectivityMonitor`] holds the current online flag behind a
//! `tokio::sync::watch` channel. Engines read it synchronously; the scheduler
//! subscribes and drains once per offline→online edge. The monitor never
//! probes the network itself: an external event source feeds it, either by
//! calling [`ConnectivityMonitor::set_online`] or through
//! [`ConnectivityMonitor::attach`].

use log::info;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Snapshot published on every change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectivityState {
    pub online: bool,
    /// Number of offline→online transitions observed so far.
    pub reconnects: u64,
}

/// Process-wide observable connectivity flag. Cloning shares the same state.
#[derive(Clone, Debug)]
pub struct ConnectivityMonitor {
    sender: Arc<watch::Sender<ConnectivityState>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (sender, _) = watch::channel(ConnectivityState {
            online: initially_online,
            reconnects: 0,
        });
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn is_online(&self) -> bool {
        self.sender.borrow().online
    }

    pub fn state(&self) -> ConnectivityState {
        *self.sender.borrow()
    }

    /// Record the latest reachability. Returns `true` only for an offline→online edge.
    ///
    /// Repeating the current value publishes nothing.
    pub fn set_online(&self, online: bool) -> bool {
        let mut reconnected = false;
        self.sender.send_if_modified(|state| {
            if state.online == online {
                return false;
            }
            state.online = online;
            if online {
                state.reconnects += 1;
                reconnected = true;
            }
            true
        });

        if reconnected {
            info!("🌐 Remote store reachable again");
        } else if !online {
            info!("📴 Remote store unreachable");
        }
        reconnected
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.sender.subscribe()
    }

    /// Feed the monitor from an external event source until the sender side closes.
    pub fn attach(&self, mut events: mpsc::Receiver<bool>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            while let Some(online) = events.recv().await {
                monitor.set_online(online);
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
