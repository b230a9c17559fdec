use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::container::{ContainerNet, ContainerTree, NetStatus};
use crate::registry::NetRegistry;
use crate::{NetError, Result};

#[derive(Default)]
struct Signals {
    work_pending: bool,
    stats_needed: bool,
}

/// The reconciliation worker: one background task owning all long-lived
/// TC programming. Clients queue work by flipping a container to `Queued`
/// and waking it; the worker drains everything pending per network, then
/// sleeps until the next watchdog deadline.
pub struct NetWorker {
    registry: Arc<NetRegistry>,
    tree: Arc<dyn ContainerTree>,
    cfg: Arc<NetworkConfig>,

    signals: Mutex<Signals>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    /// Bumped after every statistics pass.
    stats_seq: watch::Sender<u64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NetWorker {
    pub fn new(
        registry: Arc<NetRegistry>,
        tree: Arc<dyn ContainerTree>,
        cfg: Arc<NetworkConfig>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let (stats_seq, _) = watch::channel(0u64);
        Arc::new(NetWorker {
            registry,
            tree,
            cfg,
            signals: Mutex::new(Signals::default()),
            wake: Notify::new(),
            shutdown,
            stats_seq,
            task: Mutex::new(None),
        })
    }

    /// Spawn the loop. The host network must be prepared first.
    pub fn start(self: &Arc<Self>) {
        let worker = self.clone();
        let handle = tokio::spawn(async move { worker.run().await });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Request shutdown and wait for the final drain pass.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        self.wake.notify_one();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "network worker task failed");
            }
        }
    }

    /// Mark work pending and wake the loop.
    pub fn wake(&self) {
        self.signals.lock().unwrap().work_pending = true;
        self.wake.notify_one();
    }

    /// Queue a container for reconciliation and wait until the worker
    /// publishes the outcome. The returned error is exactly what the
    /// programming pass recorded.
    pub async fn refresh_network(&self, ct: &Arc<ContainerNet>) -> Result<()> {
        let mut rx = ct.subscribe();
        ct.set_status(NetStatus::Queued);
        self.wake();

        let status = rx
            .wait_for(|status| !status.is_queued())
            .await
            .map_err(|_| NetError::Unknown("network worker gone".into()))?
            .clone();

        match status {
            NetStatus::Failed(e) => Err((*e).clone()),
            _ => Ok(()),
        }
    }

    /// Make sure the container's statistics are fresher than the moment
    /// of this call. Without `force`, samples younger than one watchdog
    /// period are accepted as-is.
    pub async fn refresh_stats(&self, ct: &Arc<ContainerNet>, force: bool) {
        let period = Duration::from_millis(self.cfg.watchdog_ms.max(1));
        let start = Instant::now();

        {
            let params = ct.params.lock().await;
            if !force
                && params
                    .stats_time
                    .is_some_and(|t| t + period > start)
            {
                return;
            }
        }

        let mut seq = self.stats_seq.subscribe();
        loop {
            {
                let mut signals = self.signals.lock().unwrap();
                signals.stats_needed = true;
                signals.work_pending = true;
            }
            self.wake.notify_one();

            if seq.changed().await.is_err() {
                return;
            }

            let params = ct.params.lock().await;
            if params.stats_time.is_some_and(|t| t >= start) {
                return;
            }
        }
    }

    async fn run(self: Arc<Self>) {
        info!("network worker started");
        let period = Duration::from_millis(self.cfg.watchdog_ms.max(1));
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut deadline = tokio::time::Instant::now();

        loop {
            // wait for wake, shutdown or the watchdog deadline
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                if self.signals.lock().unwrap().work_pending
                    || tokio::time::Instant::now() >= deadline
                {
                    break;
                }
                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }

            let shutting_down = *shutdown_rx.borrow();
            let deadline_reached = tokio::time::Instant::now() >= deadline;

            let stats_needed = {
                let mut signals = self.signals.lock().unwrap();
                signals.work_pending = false;
                signals.stats_needed
            };

            let nets = self.registry.snapshot();
            let subtree = self.tree.subtree();

            if deadline_reached || stats_needed {
                for weak in &nets {
                    let Some(net) = weak.upgrade() else { continue };
                    let mut st = net.lock().await;
                    if let Err(e) = net.refresh_devices(&mut st, false).await {
                        debug!(error = %e, "device refresh failed");
                    }
                    if st.new_managed {
                        st.new_managed = false;
                        st.need_refresh = true;
                    }
                }
            }

            let mut work_pending = false;

            if let Some(host) = self.registry.host() {
                let mut st = host.lock().await;
                if let Err(e) = host.refresh_classes(&mut st, &subtree).await {
                    info!(error = %e, "failed to refresh host network, retrying next cycle");
                    work_pending = true;
                }
            }

            for weak in &nets {
                let Some(net) = weak.upgrade() else { continue };
                let mut st = net.lock().await;

                if !net.is_host() {
                    if let Err(e) = net.refresh_classes(&mut st, &subtree).await {
                        info!(error = %e, "failed to refresh network, retrying next cycle");
                        work_pending = true;
                    }
                }

                if stats_needed {
                    net.refresh_stats(&mut st, &subtree).await;
                }
            }

            if stats_needed {
                self.signals.lock().unwrap().stats_needed = false;
                self.stats_seq.send_modify(|seq| *seq += 1);
            }

            deadline = tokio::time::Instant::now() + period;
            if work_pending {
                self.signals.lock().unwrap().work_pending = true;
            }

            if shutting_down {
                // the pass above drained every queued container
                break;
            }
        }
        info!("network worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::container::ContainerList;
    use crate::tc_handle;

    fn worker_fixture() -> (Arc<NetWorker>, Arc<ContainerList>) {
        let registry = NetRegistry::new();
        let tree = ContainerList::new();
        let cfg = Arc::new(NetworkConfig {
            watchdog_ms: 10,
            ..Default::default()
        });
        let tree_dyn: Arc<dyn ContainerTree> = tree.clone();
        let worker = NetWorker::new(registry, tree_dyn, cfg);
        (worker, tree)
    }

    #[tokio::test]
    async fn queued_container_without_network_resolves() {
        // a container with no network attached is skipped by every pass;
        // its queued state stays until someone programs it, so the waiter
        // must still be woken when the state is overwritten
        let (worker, tree) = worker_fixture();
        let ct = ContainerNet::new("a", tc_handle(1, 4), tc_handle(1, 1), 0);
        tree.insert(ct.clone());
        worker.start();

        let ct2 = ct.clone();
        let unblock = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ct2.set_status(NetStatus::Success);
        });

        let worker2 = worker.clone();
        let ct3 = ct.clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            worker2.refresh_network(&ct3).await
        })
        .await
        .expect("waiter must not block forever")
        .unwrap();

        unblock.await.unwrap();
        worker.stop().await;
    }

    #[tokio::test]
    async fn stop_terminates_the_loop() {
        let (worker, _tree) = worker_fixture();
        worker.start();
        tokio::time::timeout(Duration::from_secs(5), worker.stop())
            .await
            .expect("stop must join the worker");
    }

    #[tokio::test]
    async fn fresh_stats_short_circuit() {
        let (worker, tree) = worker_fixture();
        let ct = ContainerNet::new("a", tc_handle(1, 4), tc_handle(1, 1), 0);
        tree.insert(ct.clone());
        {
            let mut params = ct.params.lock().await;
            params.stats_time = Some(Instant::now());
        }
        // young sample, no force: returns without involving the loop
        worker.refresh_stats(&ct, false).await;
    }
}
