use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, watch};

use crate::NetError;
use crate::config::UintMap;
use crate::device::NetStats;
use crate::net::Network;

/// Tri-valued result of the last reconciliation pass for a container.
#[derive(Debug, Clone, Default)]
pub enum NetStatus {
    #[default]
    Success,
    /// Reconciliation requested, the worker has not finished it yet.
    Queued,
    Failed(Arc<NetError>),
}

impl NetStatus {
    pub fn is_queued(&self) -> bool {
        matches!(self, NetStatus::Queued)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, NetStatus::Failed(_))
    }
}

/// Lock-protected network parameters and results of one container.
#[derive(Debug, Default)]
pub struct NetParams {
    pub priority: UintMap,
    pub guarantee: UintMap,
    pub limit: UintMap,
    pub rx_limit: UintMap,
    /// Strong reference keeping the container's network alive.
    pub net: Option<Arc<Network>>,
    /// The container's namespace, kept for sharing (`container <name>`
    /// recipes and the L3 reuse fast path).
    pub netns: Option<Arc<crate::netns::NetnsFd>>,
    /// Addresses assigned to the container's interfaces.
    pub addresses: Vec<ipnetwork::IpNetwork>,
    /// Per-device and per-group traffic counters published by the worker.
    pub stats: HashMap<String, NetStats>,
    pub stats_time: Option<Instant>,
}

/// Per-container network state the subsystem consumes and reports into.
/// The TC handles are chosen at container creation and never change.
#[derive(Debug)]
pub struct ContainerNet {
    pub name: String,
    /// This container's class handle on every managed device.
    pub container_tc: u32,
    /// The parent container's class handle (or the root-container one).
    pub parent_tc: u32,
    /// Optional sibling leaf class for the container's own traffic.
    pub leaf_tc: u32,

    state: watch::Sender<NetStatus>,
    pub params: Mutex<NetParams>,
}

impl ContainerNet {
    pub fn new(name: impl Into<String>, container_tc: u32, parent_tc: u32, leaf_tc: u32) -> Arc<Self> {
        let (state, _) = watch::channel(NetStatus::Success);
        Arc::new(ContainerNet {
            name: name.into(),
            container_tc,
            parent_tc,
            leaf_tc,
            state,
            params: Mutex::new(NetParams::default()),
        })
    }

    pub fn status(&self) -> NetStatus {
        self.state.borrow().clone()
    }

    /// Publish a new state; every send advances the waiters' epoch, so a
    /// waiter that subscribed before the change is always woken.
    pub fn set_status(&self, status: NetStatus) {
        self.state.send_replace(status);
    }

    pub fn subscribe(&self) -> watch::Receiver<NetStatus> {
        self.state.subscribe()
    }

    pub async fn net(&self) -> Option<Arc<Network>> {
        self.params.lock().await.net.clone()
    }

    /// Attach this container to a network (one more owner).
    pub async fn attach(&self, net: Arc<Network>, netns: Arc<crate::netns::NetnsFd>) {
        net.acquire().await;
        let mut params = self.params.lock().await;
        params.net = Some(net);
        params.netns = Some(netns);
    }

    /// Drop the network reference, releasing ownership. When the last
    /// owner lets go the managed queues are torn down with the handle.
    pub async fn detach(&self) {
        let net = {
            let mut params = self.params.lock().await;
            params.netns = None;
            params.net.take()
        };
        if let Some(net) = net {
            if net.release().await == 0 && !net.is_host() {
                net.destroy().await;
            }
        }
    }
}

/// Read-consistent snapshot of the live container tree, parents before
/// children, injected by the container subsystem. Class installation
/// relies on the ordering: a parent's class always exists before a child
/// attaches under it.
pub trait ContainerTree: Send + Sync {
    fn subtree(&self) -> Vec<Arc<ContainerNet>>;
}

/// Trivial tree used by embedders and tests: a flat, ordered list.
#[derive(Default)]
pub struct ContainerList {
    containers: std::sync::Mutex<Vec<Arc<ContainerNet>>>,
}

impl ContainerList {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, ct: Arc<ContainerNet>) {
        self.containers.lock().unwrap().push(ct);
    }

    pub fn remove(&self, name: &str) {
        self.containers.lock().unwrap().retain(|ct| ct.name != name);
    }
}

impl ContainerTree for ContainerList {
    fn subtree(&self) -> Vec<Arc<ContainerNet>> {
        self.containers.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_changes_wake_waiters() {
        let ct = ContainerNet::new("a", crate::tc_handle(1, 4), crate::tc_handle(1, 1), 0);
        let mut rx = ct.subscribe();

        ct.set_status(NetStatus::Queued);
        assert!(ct.status().is_queued());

        let waiter = tokio::spawn(async move {
            let status = rx
                .wait_for(|s| !s.is_queued())
                .await
                .expect("sender dropped");
            status.clone()
        });

        ct.set_status(NetStatus::Success);
        let seen = waiter.await.unwrap();
        assert!(matches!(seen, NetStatus::Success));
    }

    #[tokio::test]
    async fn epoch_advances_even_for_same_value() {
        let ct = ContainerNet::new("a", crate::tc_handle(1, 4), crate::tc_handle(1, 1), 0);
        let mut rx = ct.subscribe();
        rx.mark_unchanged();
        ct.set_status(NetStatus::Success);
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn list_tree_snapshots_in_order() {
        let tree = ContainerList::new();
        tree.insert(ContainerNet::new("parent", crate::tc_handle(1, 4), crate::tc_handle(1, 1), 0));
        tree.insert(ContainerNet::new("parent/child", crate::tc_handle(1, 5), crate::tc_handle(1, 4), 0));
        let snap = tree.subtree();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].name, "parent");
        tree.remove("parent/child");
        assert_eq!(tree.subtree().len(), 1);
    }
}
