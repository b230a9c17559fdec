use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::net::Network;

/// Process-wide map from namespace inode to its network handle. Entries
/// are weak: a network lives exactly as long as some container owns it.
/// Expired entries are swept on every insert.
#[derive(Default)]
pub struct NetRegistry {
    networks: Mutex<HashMap<u64, Weak<Network>>>,
    host: Mutex<Option<Arc<Network>>>,
}

impl NetRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, net: &Arc<Network>) {
        let mut networks = self.networks.lock().unwrap();
        networks.insert(net.inode(), Arc::downgrade(net));
        networks.retain(|_, weak| weak.strong_count() > 0);
    }

    pub fn get(&self, inode: u64) -> Option<Arc<Network>> {
        self.networks
            .lock()
            .unwrap()
            .get(&inode)
            .and_then(Weak::upgrade)
    }

    /// Copy of the current weak entries, for the worker's per-pass
    /// snapshot.
    pub fn snapshot(&self) -> Vec<Weak<Network>> {
        self.networks.lock().unwrap().values().cloned().collect()
    }

    pub fn set_host(&self, net: Arc<Network>) {
        *self.host.lock().unwrap() = Some(net);
    }

    pub fn host(&self) -> Option<Arc<Network>> {
        self.host.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::netlink::NetlinkClient;

    async fn network(inode: u64) -> Arc<Network> {
        let client = NetlinkClient::connect().expect("netlink connect");
        Network::new(client, Arc::new(NetworkConfig::default()), inode)
    }

    #[tokio::test]
    async fn lookup_returns_live_networks() {
        let registry = NetRegistry::new();
        let net = network(100).await;
        registry.insert(&net);
        let found = registry.get(100).expect("live entry");
        assert!(Arc::ptr_eq(&found, &net));
        assert!(registry.get(101).is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_swept_on_insert() {
        let registry = NetRegistry::new();
        let dead = network(100).await;
        registry.insert(&dead);
        drop(dead);
        assert!(registry.get(100).is_none());

        // sweeping happens on the next insert
        let live = network(200).await;
        registry.insert(&live);
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn same_inode_returns_same_handle() {
        let registry = NetRegistry::new();
        let net = network(300).await;
        registry.insert(&net);

        // second container resolving the same namespace shares the handle
        let first = registry.get(300).unwrap();
        let second = registry.get(300).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        first.acquire().await;
        second.acquire().await;
        assert_eq!(net.owners().await, 2);
    }
}
