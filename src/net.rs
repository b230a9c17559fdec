use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Instant;

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use netlink_packet_route::address::{AddressAttribute, AddressMessage, AddressScope};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::bitmap::OrderedBitmap;
use crate::config::{NetworkConfig, UintMap, glob_match};
use crate::container::{ContainerNet, NetStatus};
use crate::device::{NetDevice, NetStats};
use crate::netlink::tc::{
    INGRESS_HANDLE, TC_H_INGRESS, TC_H_ROOT, TcCgroupFilter, TcClass, TcClassInfo, TcPoliceFilter,
    TcQdisc, dump_classes,
};
use crate::netlink::NetlinkClient;
use crate::{
    CONTAINER_TC_MINOR, DEFAULT_TC_MAJOR, DEFAULT_TC_MINOR, LEGACY_CONTAINER_ID, NET_DEFAULT_PRIO,
    NET_MAX_RATE, NetError, ROOT_CONTAINER_ID, ROOT_TC_MAJOR, ROOT_TC_MINOR, Result, tc_handle,
    tc_minor,
};

/// NAT address pool of the host network.
#[derive(Debug, Default)]
pub struct NatPool {
    pub bitmap: OrderedBitmap,
    pub base_v4: Option<Ipv4Addr>,
    pub base_v6: Option<Ipv6Addr>,
}

/// Mutable state of a network, guarded by the network lock. Netlink
/// programming and device-cache refreshes happen only while it is held.
#[derive(Debug, Default)]
pub struct NetState {
    pub devices: Vec<NetDevice>,
    /// Sticky request to reinstall classes on the next pass.
    pub need_refresh: bool,
    /// A device finished SetupQueue since the last worker pass.
    pub new_managed: bool,
    pub nat: NatPool,
    owners: u64,
    iface_seq: u32,
}

/// One network namespace under management: a netlink client, the device
/// list, and the NAT pool, shared by every container attached to it.
#[derive(Debug)]
pub struct Network {
    client: NetlinkClient,
    cfg: Arc<NetworkConfig>,
    /// Namespace identity; registry key and lock-ordering key.
    inode: u64,
    /// Inside a container-managed namespace every device is managed and
    /// rates are not probed from link speed.
    managed_namespace: bool,
    is_host: bool,
    /// Host network only: the root container whose limit/guarantee maps
    /// mirror device ceilings.
    root_ct: Option<Arc<ContainerNet>>,
    state: Mutex<NetState>,
}

impl Network {
    pub fn new(client: NetlinkClient, cfg: Arc<NetworkConfig>, inode: u64) -> Arc<Self> {
        Self::build(client, cfg, inode, false, false, None)
    }

    /// A freshly created namespace fully owned by a container.
    pub fn new_managed(client: NetlinkClient, cfg: Arc<NetworkConfig>, inode: u64) -> Arc<Self> {
        Self::build(client, cfg, inode, true, false, None)
    }

    /// The host network: carries the NAT pool and publishes device rates
    /// into the root container's maps.
    pub fn new_host(
        client: NetlinkClient,
        cfg: Arc<NetworkConfig>,
        inode: u64,
        root_ct: Arc<ContainerNet>,
    ) -> Arc<Self> {
        Self::build(client, cfg, inode, false, true, Some(root_ct))
    }

    fn build(
        client: NetlinkClient,
        cfg: Arc<NetworkConfig>,
        inode: u64,
        managed_namespace: bool,
        is_host: bool,
        root_ct: Option<Arc<ContainerNet>>,
    ) -> Arc<Self> {
        let mut state = NetState::default();
        if is_host {
            state.nat.bitmap.resize(cfg.nat_count);
            state.nat.base_v4 = cfg.nat_first_ipv4;
            state.nat.base_v6 = cfg.nat_first_ipv6;
        }
        Arc::new(Network {
            client,
            cfg,
            inode,
            managed_namespace,
            is_host,
            root_ct,
            state: Mutex::new(state),
        })
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn client(&self) -> &NetlinkClient {
        &self.client
    }

    pub async fn lock(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().await
    }

    pub async fn acquire(&self) {
        self.state.lock().await.owners += 1;
    }

    /// Drop one owner, returning how many remain.
    pub async fn release(&self) -> u64 {
        let mut st = self.state.lock().await;
        st.owners = st.owners.saturating_sub(1);
        st.owners
    }

    pub async fn owners(&self) -> u64 {
        self.state.lock().await.owners
    }

    // ------------------------------------------------------------------
    // Device discovery
    // ------------------------------------------------------------------

    /// Reload the device list from the kernel. `force` drops every
    /// `prepared` mark so queues are rebuilt from scratch.
    pub async fn refresh_devices(&self, st: &mut NetState, force: bool) -> Result<()> {
        // a failed dump leaves the device list untouched
        let links = self.client.dump_links().await?;

        for dev in &mut st.devices {
            dev.missing = true;
        }

        for msg in &links {
            if NetDevice::is_loopback(msg) {
                continue;
            }
            // do not set up queues on down links in the host namespace
            if !self.managed_namespace && !NetDevice::is_running(msg) {
                continue;
            }

            let dev = NetDevice::from_link(msg, &self.cfg, self.managed_namespace);
            if dev.is_internal_veth_peer() {
                continue;
            }

            let configured = dev.config(&self.cfg.device_qdisc, "htb".to_string());
            absorb_link(&mut st.devices, dev, &configured, force);
        }

        let missing: Vec<String> = st
            .devices
            .iter()
            .filter(|d| d.missing)
            .map(|d| {
                info!("delete network device {}", d.desc());
                d.name.clone()
            })
            .collect();
        if !missing.is_empty() {
            if let Some(root) = &self.root_ct {
                let mut params = root.params.lock().await;
                for name in &missing {
                    params.limit.remove(name);
                    params.guarantee.remove(name);
                }
            }
            st.devices.retain(|d| !d.missing);
        }

        for i in 0..st.devices.len() {
            if !st.devices[i].managed || st.devices[i].prepared {
                continue;
            }
            let mut dev = st.devices[i].clone();
            self.setup_queue(&mut dev).await?;
            dev.prepared = true;
            st.devices[i] = dev;
            st.new_managed = true;
        }

        Ok(())
    }

    /// Derive rate/ceil from link speed and configuration.
    async fn device_speed(&self, dev: &mut NetDevice) {
        if self.managed_namespace {
            dev.ceil = NET_MAX_RATE;
            dev.rate = NET_MAX_RATE;
            return;
        }

        let (mut ceil, mut rate) = (NET_MAX_RATE, NET_MAX_RATE);
        let path = format!("/sys/class/net/{}/speed", dev.name);
        if let Ok(text) = tokio::fs::read_to_string(&path).await {
            if let Ok(speed) = text.trim().parse::<u64>() {
                if speed >= 100 {
                    ceil = speed * 125_000; // Mbit -> Bps
                    rate = speed * 112_500; // 90%
                }
            }
        }

        dev.ceil = dev.config(&self.cfg.device_ceil, ceil);
        dev.rate = dev.config(&self.cfg.device_rate, rate);
    }

    /// Install the root qdisc, the cgroup classifier, the root class and
    /// the default class on one managed device.
    pub async fn setup_queue(&self, dev: &mut NetDevice) -> Result<()> {
        info!("setup queue for network device {}", dev.desc());

        let kind = dev.config(&self.cfg.device_qdisc, "htb".to_string());

        let mut qdisc = TcQdisc::new(dev.index, TC_H_ROOT, tc_handle(ROOT_TC_MAJOR, ROOT_TC_MINOR));
        qdisc.kind = kind.clone();
        qdisc.default_minor = DEFAULT_TC_MINOR;
        if !matches!(qdisc.check(&self.client).await, Ok(true)) {
            let _ = qdisc.delete(&self.client).await;
            if let Err(e) = qdisc.create(&self.client).await {
                warn!(device = %dev.desc(), error = %e, "cannot create root qdisc");
                return Err(e);
            }
        }

        let filter = TcCgroupFilter {
            index: dev.index,
            parent: tc_handle(ROOT_TC_MAJOR, ROOT_TC_MINOR),
        };
        let _ = filter.delete(&self.client).await;
        if let Err(e) = filter.create(&self.client).await {
            warn!(device = %dev.desc(), error = %e, "cannot create cgroup filter");
            return Err(e);
        }

        self.device_speed(dev).await;

        let root_class = TcClass {
            index: dev.index,
            parent: tc_handle(ROOT_TC_MAJOR, ROOT_TC_MINOR),
            handle: tc_handle(ROOT_TC_MAJOR, ROOT_CONTAINER_ID),
            kind: kind.clone(),
            prio: NET_DEFAULT_PRIO,
            rate: dev.ceil,
            ceil: dev.ceil,
            mtu: dev.mtu,
            ..Default::default()
        };
        if let Err(e) = root_class.create(&self.client).await {
            warn!(device = %dev.desc(), error = %e, "cannot create root class");
            return Err(e);
        }

        let default_class = TcClass {
            parent: tc_handle(ROOT_TC_MAJOR, ROOT_CONTAINER_ID),
            handle: tc_handle(ROOT_TC_MAJOR, DEFAULT_TC_MINOR),
            rate: dev.config(&self.cfg.default_rate, 0),
            def_rate: dev.config(&self.cfg.default_rate, 0),
            ceil: 0,
            ..root_class
        };
        if let Err(e) = default_class.create(&self.client).await {
            warn!(device = %dev.desc(), error = %e, "cannot create default class");
            return Err(e);
        }

        if self.managed_namespace {
            let mut defq = TcQdisc::new(
                dev.index,
                tc_handle(ROOT_TC_MAJOR, DEFAULT_TC_MINOR),
                tc_handle(DEFAULT_TC_MAJOR, ROOT_TC_MINOR),
            );
            defq.kind = dev.config(&self.cfg.container_qdisc, "pfifo".to_string());
            defq.limit = dev.config(&self.cfg.container_qdisc_limit, dev.mtu as u64 * 20);
            defq.quantum = dev.config(&self.cfg.container_qdisc_quantum, dev.mtu as u64 * 2);
            if !matches!(defq.check(&self.client).await, Ok(true)) {
                defq.create(&self.client).await?;
            }
        }

        if let Some(root) = &self.root_ct {
            let mut params = root.params.lock().await;
            params.limit.set(dev.name.clone(), dev.ceil);
            params.guarantee.set(dev.name.clone(), dev.rate);
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Container classes
    // ------------------------------------------------------------------

    /// Install one container's class (and optional leaf) on every
    /// managed+prepared device.
    pub async fn create_tc(
        &self,
        st: &NetState,
        handle: u32,
        parent: u32,
        leaf: u32,
        prio: &UintMap,
        rate: &UintMap,
        ceil: &UintMap,
    ) -> Result<()> {
        let mut result = Ok(());

        for dev in st.devices.iter().filter(|d| d.managed && d.prepared) {
            let kind = dev.config(&self.cfg.device_qdisc, "htb".to_string());

            let def_rate = if handle == tc_handle(ROOT_TC_MAJOR, ROOT_CONTAINER_ID) {
                dev.rate
            } else if handle == tc_handle(ROOT_TC_MAJOR, LEGACY_CONTAINER_ID) {
                dev.config(&self.cfg.porto_rate, 0)
            } else {
                dev.config(&self.cfg.container_rate, 0)
            };

            let class = TcClass {
                index: dev.index,
                parent,
                handle,
                kind: kind.clone(),
                prio: dev.config(prio, NET_DEFAULT_PRIO),
                rate: dev.config(rate, 0),
                ceil: dev.config(ceil, 0),
                def_rate,
                quantum: dev.config(&self.cfg.device_quantum, dev.mtu as u64 * 2),
                rate_burst: dev.config(&self.cfg.device_rate_burst, dev.mtu as u64 * 10),
                ceil_burst: dev.config(&self.cfg.device_ceil_burst, dev.mtu as u64 * 10),
                mtu: dev.mtu,
            };

            let mut err = class.create(&self.client).await;
            if err.is_err() {
                let _ = TcClass::delete(&self.client, dev.index, handle).await;
                err = class.create(&self.client).await;
            }
            if let Err(e) = err {
                warn!(device = %dev.desc(), error = %e, "cannot add tc class");
                if result.is_ok() {
                    result = Err(e);
                }
                continue;
            }

            if leaf == 0 {
                continue;
            }

            let mut leaf_class = TcClass {
                parent: handle,
                handle: leaf,
                ceil: 0,
                ..class
            };
            let mut leaf_qdisc = TcQdisc::new(
                dev.index,
                leaf,
                tc_handle(tc_minor(handle), CONTAINER_TC_MINOR),
            );

            if leaf == tc_handle(ROOT_TC_MAJOR, DEFAULT_TC_MINOR) {
                leaf_class.rate = dev.config(&self.cfg.default_rate, 0);
                leaf_class.def_rate = leaf_class.rate;

                leaf_qdisc.handle = tc_handle(DEFAULT_TC_MAJOR, ROOT_TC_MINOR);
                leaf_qdisc.kind = dev.config(&self.cfg.default_qdisc, "sfq".to_string());
                leaf_qdisc.limit = dev.config(&self.cfg.default_qdisc_limit, 0);
                leaf_qdisc.quantum =
                    dev.config(&self.cfg.default_qdisc_quantum, dev.mtu as u64 * 2);
            } else {
                leaf_qdisc.kind = dev.config(&self.cfg.container_qdisc, "pfifo".to_string());
                leaf_qdisc.limit =
                    dev.config(&self.cfg.container_qdisc_limit, dev.mtu as u64 * 20);
                leaf_qdisc.quantum =
                    dev.config(&self.cfg.container_qdisc_quantum, dev.mtu as u64 * 2);
            }

            if let Err(e) = leaf_class.create(&self.client).await {
                warn!(device = %dev.desc(), error = %e, "cannot add leaf tc class");
                if result.is_ok() {
                    result = Err(e);
                }
            }

            let mut err = leaf_qdisc.create(&self.client).await;
            if err.is_err() {
                let _ = leaf_qdisc.delete(&self.client).await;
                err = leaf_qdisc.create(&self.client).await;
            }
            if let Err(e) = err {
                warn!(device = %dev.desc(), error = %e, "cannot add container tc qdisc");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        result
    }

    /// Remove a container's classes from every managed+prepared device.
    /// Missing objects are tolerated; the first real error is returned
    /// without stopping the sweep.
    pub async fn destroy_tc(&self, st: &NetState, handle: u32, leaf: u32) -> Result<()> {
        let mut result = Ok(());

        for dev in st.devices.iter().filter(|d| d.managed && d.prepared) {
            let leaf_qdisc = TcQdisc::new(
                dev.index,
                handle,
                tc_handle(tc_minor(handle), CONTAINER_TC_MINOR),
            );
            let _ = leaf_qdisc.delete(&self.client).await;

            if leaf != 0 {
                let _ = TcClass::delete(&self.client, dev.index, leaf).await;
            }

            if let Err(e) = TcClass::delete(&self.client, dev.index, handle).await {
                if !e.is_enoent() {
                    warn!(device = %dev.desc(), error = %e, "cannot del tc class");
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }

        result
    }

    /// Program ingress policers according to a container's rx-limit map.
    /// Devices resolving to rate 0 keep no ingress qdisc at all.
    pub async fn create_ingress_qdisc(&self, st: &NetState, rx_limit: &UintMap) -> Result<()> {
        let mut result = Ok(());

        debug!("setting up ingress qdisc");
        for dev in st.devices.iter().filter(|d| d.managed) {
            let mut ingress = TcQdisc::new(dev.index, TC_H_INGRESS, INGRESS_HANDLE);
            let _ = ingress.delete(&self.client).await;

            let rate = dev.config(rx_limit, 0);
            if rate == 0 {
                continue;
            }

            ingress.kind = "ingress".to_string();
            if let Err(e) = ingress.create(&self.client).await {
                warn!(device = %dev.desc(), error = %e, "cannot create ingress qdisc");
                return Err(e);
            }

            let _ = TcPoliceFilter::delete(&self.client, dev.index).await;

            let mtu = 65536u32; // maximum GRO skb
            let police = TcPoliceFilter {
                index: dev.index,
                mtu,
                rate,
                burst: dev.config(&self.cfg.ingress_burst, (mtu as u64 * 10).max(rate / 10)),
            };
            if let Err(e) = police.create(&self.client).await {
                warn!(device = %dev.desc(), error = %e, "cannot create ingress filter");
                result = Err(e);
            }
        }

        result
    }

    // ------------------------------------------------------------------
    // Reconciliation passes
    // ------------------------------------------------------------------

    /// Reinstall classes for every queued (or globally refresh-marked)
    /// container of the subtree. Parameters are snapshotted under the
    /// container lock, programmed without it, and the outcome published
    /// afterwards. Retries the whole pass with a soft then a hard device
    /// reset; `need_refresh` stays sticky on final failure.
    pub async fn refresh_classes(
        self: &Arc<Self>,
        st: &mut NetState,
        subtree: &[Arc<ContainerNet>],
    ) -> Result<()> {
        let mut try_count = 0u32;

        loop {
            let mut ret = Ok(());

            for ct in subtree {
                let (prio, guarantee, limit, rx_limit, net) = {
                    let params = ct.params.lock().await;
                    (
                        params.priority.clone(),
                        params.guarantee.clone(),
                        params.limit.clone(),
                        params.rx_limit.clone(),
                        params.net.clone(),
                    )
                };
                let status = ct.status();

                let Some(net) = net else { continue };
                let mine = Arc::ptr_eq(&net, self);
                if !mine && !self.is_host {
                    continue;
                }
                if !st.need_refresh && !status.is_queued() && !status.is_failed() {
                    continue;
                }

                let mut err = self
                    .create_tc(
                        st,
                        ct.container_tc,
                        ct.parent_tc,
                        ct.leaf_tc,
                        &prio,
                        &guarantee,
                        &limit,
                    )
                    .await;

                if err.is_ok() && !self.is_host && !rx_limit.is_empty() {
                    err = self.create_ingress_qdisc(st, &rx_limit).await;
                }

                match err {
                    Ok(()) => {
                        if mine {
                            ct.set_status(NetStatus::Success);
                        }
                    }
                    Err(e) => {
                        let shared = Arc::new(e);
                        ct.set_status(NetStatus::Failed(shared.clone()));

                        info!(
                            container = %ct.name,
                            "performing net {} reset",
                            if try_count > 0 { "hard" } else { "soft" }
                        );
                        let _ = self.refresh_devices(st, try_count > 0).await;
                        st.new_managed = false;
                        st.need_refresh = true;
                        ret = Err((*shared).clone());
                        break;
                    }
                }
            }

            match ret {
                Ok(()) => {
                    st.need_refresh = false;
                    return Ok(());
                }
                Err(e) => {
                    if try_count >= 2 {
                        return Err(e);
                    }
                    try_count += 1;
                }
            }
        }
    }

    /// Sample TC class statistics and publish per-device and per-group
    /// counters into every attached container.
    pub async fn refresh_stats(self: &Arc<Self>, st: &mut NetState, subtree: &[Arc<ContainerNet>]) {
        let mut per_dev: HashMap<u32, HashMap<u32, (u32, NetStats)>> = HashMap::new();

        for dev in st.devices.iter().filter(|d| d.managed && d.prepared) {
            let classes = match dump_classes(&self.client, dev.index).await {
                Ok(classes) => classes,
                Err(e) => {
                    warn!(device = %dev.desc(), error = %e, "failed to retrieve tc statistics");
                    st.need_refresh = true;
                    continue;
                }
            };
            per_dev.insert(dev.index, aggregate_classes(&classes, &dev.stats));
        }

        let now = Instant::now();

        for ct in subtree {
            if !matches!(ct.status(), NetStatus::Success) {
                continue;
            }
            let mut params = ct.params.lock().await;
            let Some(net) = params.net.clone() else { continue };
            if !Arc::ptr_eq(&net, self) {
                continue;
            }

            params.stats.clear();
            for dev in &st.devices {
                let entry = per_dev
                    .get(&dev.index)
                    .and_then(|classes| classes.get(&ct.container_tc));
                let stats = match entry {
                    Some((_, stats)) => *stats,
                    None => {
                        warn!(
                            handle = ct.container_tc,
                            device = %dev.desc(),
                            "cannot find tc class"
                        );
                        st.need_refresh = true;
                        NetStats::default()
                    }
                };
                params.stats.insert(dev.name.clone(), stats);

                let group = params
                    .stats
                    .entry(format!("group {}", dev.group_name))
                    .or_default();
                group.rx_bytes += stats.rx_bytes;
                group.rx_packets += stats.rx_packets;
                group.rx_drops += stats.rx_drops;
                group.tx_bytes += stats.tx_bytes;
                group.tx_packets += stats.tx_packets;
                group.tx_drops += stats.tx_drops;
                group.bytes += stats.bytes;
                group.packets += stats.packets;
                group.drops += stats.drops;
                group.overlimits += stats.overlimits;
            }
            params.stats_time = Some(now);
        }
    }

    // ------------------------------------------------------------------
    // Addresses, gateways, NAT
    // ------------------------------------------------------------------

    /// Elect per-family gateway addresses for a set of container
    /// addresses, plus the minimum MTU and first group of the
    /// contributing host devices.
    pub async fn get_gate_address(&self, addrs: &[IpNetwork]) -> Result<GateInfo> {
        let messages = self.client.dump_addresses().await?;
        let links = self.client.dump_links().await?;

        let sources: Vec<GateSource> = messages.iter().filter_map(gate_source).collect();
        let briefs: HashMap<u32, (u32, u32)> = links
            .iter()
            .map(|msg| {
                let dev = NetDevice::from_link(msg, &self.cfg, self.managed_namespace);
                (dev.index, (dev.mtu, dev.group))
            })
            .collect();

        Ok(elect_gateways(&sources, &briefs, addrs))
    }

    /// Publish a proxy neighbour entry for `addr`: on the named master
    /// device, or on every device from which the address is directly
    /// reachable.
    pub async fn add_announce(
        &self,
        st: &NetState,
        addr: IpNetwork,
        master: Option<&str>,
    ) -> Result<()> {
        if let Some(master) = master {
            let Some(index) = device_index(st, master) else {
                return Err(NetError::InvalidValue(format!(
                    "master link not found: {master}"
                )));
            };
            return self.client.proxy_neighbour(index, addr.ip(), true).await;
        }

        let messages = self.client.dump_addresses().await?;
        let sources: Vec<GateSource> = messages.iter().filter_map(gate_source).collect();

        for dev in &st.devices {
            let reachable = sources
                .iter()
                .any(|src| src.index == dev.index && prefix_match(&src.addr, &addr));
            if reachable {
                self.client
                    .proxy_neighbour(dev.index, addr.ip(), true)
                    .await?;
            }
        }
        Ok(())
    }

    /// Withdraw a proxy neighbour entry from every device.
    pub async fn del_announce(&self, st: &NetState, addr: IpNetwork) -> Result<()> {
        let mut result = Ok(());
        for dev in &st.devices {
            if let Err(e) = self.client.proxy_neighbour(dev.index, addr.ip(), false).await {
                result = Err(e);
            }
        }
        result
    }

    /// Allocate one NAT offset and materialize it as V4/V6 addresses.
    pub async fn get_nat_address(&self, st: &mut NetState) -> Result<Vec<IpNetwork>> {
        let offset = st
            .nat
            .bitmap
            .get()
            .map_err(|e| NetError::ResourceNotAvailable(format!("NAT address: {e}")))?;

        let mut addrs = Vec::new();
        if let Some(base) = st.nat.base_v4 {
            let ip = add_offset_v4(base, offset);
            addrs.push(IpNetwork::V4(
                Ipv4Network::new(ip, 32).map_err(|e| NetError::InvalidValue(e.to_string()))?,
            ));
        }
        if let Some(base) = st.nat.base_v6 {
            let ip = add_offset_v6(base, offset);
            addrs.push(IpNetwork::V6(
                Ipv6Network::new(ip, 128).map_err(|e| NetError::InvalidValue(e.to_string()))?,
            ));
        }
        Ok(addrs)
    }

    /// Return a NAT allocation to the pool.
    pub async fn put_nat_address(&self, st: &mut NetState, addrs: &[IpNetwork]) -> Result<()> {
        for addr in addrs {
            match addr {
                IpNetwork::V4(net) => {
                    if let Some(base) = st.nat.base_v4 {
                        let offset =
                            u64::from(u32::from(net.ip()).wrapping_sub(u32::from(base)));
                        return st.nat.bitmap.put(offset);
                    }
                }
                IpNetwork::V6(net) => {
                    if let Some(base) = st.nat.base_v6 {
                        let offset = u128::from(net.ip()).wrapping_sub(u128::from(base));
                        return st.nat.bitmap.put(offset as u64);
                    }
                }
            }
        }
        Ok(())
    }

    /// Pick a fresh device name with the given prefix.
    pub async fn new_device_name(&self, st: &mut NetState, prefix: &str) -> String {
        for _ in 0..100 {
            let name = format!("{prefix}{}", st.iface_seq);
            st.iface_seq += 1;
            match self.client.link_exists(&name).await {
                Ok(false) => return name,
                _ => continue,
            }
        }
        format!("{prefix}0")
    }

    /// First device matching a glob pattern, or the pattern itself.
    pub fn match_device(st: &NetState, pattern: &str) -> String {
        st.devices
            .iter()
            .find(|d| glob_match(&d.name, pattern))
            .map(|d| d.name.clone())
            .unwrap_or_else(|| pattern.to_string())
    }

    /// Tear down every managed root qdisc. Called when the last owner
    /// releases the network.
    pub async fn destroy(&self) {
        let st = self.state.lock().await;
        info!("removing network");
        for dev in st.devices.iter().filter(|d| d.managed) {
            let qdisc =
                TcQdisc::new(dev.index, TC_H_ROOT, tc_handle(ROOT_TC_MAJOR, ROOT_TC_MINOR));
            if let Err(e) = qdisc.delete(&self.client).await {
                if !e.is_enoent() {
                    warn!(device = %dev.desc(), error = %e, "cannot remove root qdisc");
                }
            }
        }
    }
}

pub fn device_index(st: &NetState, name: &str) -> Option<u32> {
    st.devices.iter().find(|d| d.name == name).map(|d| d.index)
}

/// Merge one discovered link into the device list, carrying `prepared`
/// forward unless the kernel qdisc kind drifted or a hard refresh was
/// requested.
fn absorb_link(devices: &mut Vec<NetDevice>, dev: NetDevice, configured_kind: &str, force: bool) {
    match devices
        .iter_mut()
        .find(|d| d.name == dev.name && d.index == dev.index)
    {
        Some(existing) => {
            *existing = dev;
            if existing.managed && existing.qdisc != configured_kind {
                info!("detected missing qdisc on {}", existing.desc());
            } else if !force {
                existing.prepared = true;
            }
        }
        None => {
            if !dev.managed {
                info!("unmanaged device {}", dev.desc());
            } else {
                info!("new network device {}", dev.desc());
            }
            devices.push(dev);
        }
    }
}

/// Fold kernel class dumps of one device into per-handle totals; hfsc
/// child counters are summed into every ancestor.
fn aggregate_classes(
    classes: &[TcClassInfo],
    dev_stats: &NetStats,
) -> HashMap<u32, (u32, NetStats)> {
    let mut map: HashMap<u32, (u32, NetStats)> = HashMap::new();

    for cls in classes {
        let mut stats = *dev_stats;
        stats.bytes = cls.stats.bytes;
        stats.packets = cls.stats.packets;
        stats.drops = cls.stats.drops;
        stats.overlimits = cls.stats.overlimits;
        map.insert(cls.handle, (cls.parent, stats));
    }

    let hfsc: Vec<&TcClassInfo> = classes.iter().filter(|c| c.kind == "hfsc").collect();
    for cls in hfsc {
        let mut parent = cls.parent;
        let mut depth = 0;
        while parent != 0 && parent != TC_H_ROOT && depth < classes.len() {
            let Some(entry) = map.get_mut(&parent) else { break };
            entry.1.bytes += cls.stats.bytes;
            entry.1.packets += cls.stats.packets;
            entry.1.drops += cls.stats.drops;
            entry.1.overlimits += cls.stats.overlimits;
            parent = entry.0;
            depth += 1;
        }
    }

    map
}

/// One host address considered for gateway election.
#[derive(Debug, Clone)]
pub struct GateSource {
    pub index: u32,
    pub addr: IpNetwork,
}

/// Gateway election result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateInfo {
    pub gate4: Option<Ipv4Addr>,
    pub gate6: Option<Ipv6Addr>,
    /// Minimum MTU across contributing host devices, 0 when unknown.
    pub mtu: u32,
    /// Group of the first contributing host device.
    pub group: u32,
}

fn gate_source(msg: &AddressMessage) -> Option<GateSource> {
    if msg.header.scope == AddressScope::Host {
        return None;
    }
    let mut local = None;
    let mut address = None;
    for attr in &msg.attributes {
        match attr {
            AddressAttribute::Local(ip) => local = Some(*ip),
            AddressAttribute::Address(ip) => address = Some(*ip),
            _ => {}
        }
    }
    let ip = local.or(address)?;
    let addr = IpNetwork::new(ip, msg.header.prefix_len).ok()?;
    Some(GateSource {
        index: msg.header.index,
        addr,
    })
}

/// True when the first min(prefix_a, prefix_b) bits of both addresses
/// agree; families must match.
fn prefix_match(a: &IpNetwork, b: &IpNetwork) -> bool {
    let bits = a.prefix().min(b.prefix()) as u32;
    match (a, b) {
        (IpNetwork::V4(a), IpNetwork::V4(b)) => {
            if bits == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - bits);
            (u32::from(a.ip()) & mask) == (u32::from(b.ip()) & mask)
        }
        (IpNetwork::V6(a), IpNetwork::V6(b)) => {
            if bits == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - bits);
            (u128::from(a.ip()) & mask) == (u128::from(b.ip()) & mask)
        }
        _ => false,
    }
}

/// For every container address: take any host address of the same family
/// as a fallback gateway, then prefer addresses sharing a prefix with the
/// container address over fallbacks that do not.
pub fn elect_gateways(
    sources: &[GateSource],
    links: &HashMap<u32, (u32, u32)>,
    want: &[IpNetwork],
) -> GateInfo {
    let mut info = GateInfo::default();
    let mut mtu: Option<u32> = None;

    for src in sources {
        for target in want {
            let family_match = matches!(
                (&src.addr, target),
                (IpNetwork::V4(_), IpNetwork::V4(_)) | (IpNetwork::V6(_), IpNetwork::V6(_))
            );
            if family_match {
                match &src.addr {
                    IpNetwork::V4(net) if info.gate4.is_none() => info.gate4 = Some(net.ip()),
                    IpNetwork::V6(net) if info.gate6.is_none() => info.gate6 = Some(net.ip()),
                    _ => {}
                }
            }

            if prefix_match(&src.addr, target) {
                match &src.addr {
                    IpNetwork::V4(net) => {
                        let current_matches = info.gate4.is_some_and(|gate| {
                            prefix_match(&IpNetwork::from(IpAddr::V4(gate)), target)
                        });
                        if !current_matches {
                            info.gate4 = Some(net.ip());
                        }
                    }
                    IpNetwork::V6(net) => {
                        let current_matches = info.gate6.is_some_and(|gate| {
                            prefix_match(&IpNetwork::from(IpAddr::V6(gate)), target)
                        });
                        if !current_matches {
                            info.gate6 = Some(net.ip());
                        }
                    }
                }

                if let Some((link_mtu, group)) = links.get(&src.index) {
                    if mtu.is_none_or(|m| *link_mtu < m) {
                        mtu = Some(*link_mtu);
                    }
                    if info.group == 0 {
                        info.group = *group;
                    }
                }
            }
        }
    }

    info.mtu = mtu.unwrap_or(0);
    info
}

fn add_offset_v4(base: Ipv4Addr, offset: u64) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(base).wrapping_add(offset as u32))
}

fn add_offset_v6(base: Ipv6Addr, offset: u64) -> Ipv6Addr {
    Ipv6Addr::from(u128::from(base).wrapping_add(offset as u128))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::NetDevice;

    fn dev(index: u32, name: &str, qdisc: &str, managed: bool, prepared: bool) -> NetDevice {
        NetDevice {
            index,
            name: name.into(),
            kind: "dummy".into(),
            group: 0,
            group_name: "0".into(),
            link: 0,
            mtu: 1500,
            qdisc: qdisc.into(),
            managed,
            prepared,
            missing: false,
            rate: 0,
            ceil: 0,
            stats: NetStats::default(),
        }
    }

    #[test]
    fn absorb_appends_new_devices() {
        let mut devices = Vec::new();
        absorb_link(&mut devices, dev(2, "eth0", "htb", true, false), "htb", false);
        assert_eq!(devices.len(), 1);
        assert!(devices[0].prepared); // matched kind, carried prepared
    }

    #[test]
    fn absorb_marks_drifted_devices_unprepared() {
        let mut devices = vec![{
            let mut d = dev(2, "eth0", "htb", true, true);
            d.missing = true;
            d
        }];
        // kernel now reports pfifo_fast at the root
        absorb_link(
            &mut devices,
            dev(2, "eth0", "pfifo_fast", true, false),
            "htb",
            false,
        );
        assert_eq!(devices.len(), 1);
        assert!(!devices[0].prepared);
        assert!(!devices[0].missing);
    }

    #[test]
    fn absorb_force_drops_prepared() {
        let mut devices = vec![dev(2, "eth0", "htb", true, true)];
        absorb_link(&mut devices, dev(2, "eth0", "htb", true, false), "htb", true);
        assert!(!devices[0].prepared);
    }

    #[test]
    fn absorb_matches_by_name_and_index() {
        let mut devices = vec![dev(2, "eth0", "htb", true, true)];
        // same name, new index: a replaced device
        absorb_link(&mut devices, dev(5, "eth0", "htb", true, false), "htb", false);
        assert_eq!(devices.len(), 2);
    }

    fn v4(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn prefix_match_uses_shorter_prefix() {
        assert!(prefix_match(&v4("192.0.2.1/24"), &v4("192.0.2.5/32")));
        assert!(prefix_match(&v4("192.0.2.1/32"), &v4("192.0.2.0/24")));
        assert!(!prefix_match(&v4("192.0.3.1/24"), &v4("192.0.2.5/32")));
        assert!(!prefix_match(&v4("192.0.2.1/24"), &"2001:db8::1/64".parse().unwrap()));
    }

    #[test]
    fn election_prefers_prefix_match_over_any_family() {
        let sources = vec![
            GateSource {
                index: 1,
                addr: v4("10.1.0.1/16"),
            },
            GateSource {
                index: 2,
                addr: v4("192.0.2.1/24"),
            },
        ];
        let links: HashMap<u32, (u32, u32)> =
            [(1, (9000, 0)), (2, (1500, 7))].into_iter().collect();

        let info = elect_gateways(&sources, &links, &[v4("192.0.2.5/32")]);
        assert_eq!(info.gate4, Some("192.0.2.1".parse::<Ipv4Addr>().unwrap()));
        assert_eq!(info.mtu, 1500);
        assert_eq!(info.group, 7);
    }

    #[test]
    fn election_falls_back_to_family_match() {
        let sources = vec![GateSource {
            index: 1,
            addr: v4("10.1.0.1/16"),
        }];
        let info = elect_gateways(&sources, &HashMap::new(), &[v4("192.0.2.5/32")]);
        assert_eq!(info.gate4, Some("10.1.0.1".parse::<Ipv4Addr>().unwrap()));
        assert_eq!(info.gate6, None);
    }

    #[test]
    fn election_handles_both_families() {
        let sources = vec![
            GateSource {
                index: 1,
                addr: v4("192.0.2.1/24"),
            },
            GateSource {
                index: 1,
                addr: "2001:db8::1/64".parse().unwrap(),
            },
        ];
        let want = [v4("192.0.2.5/32"), "2001:db8::5/128".parse().unwrap()];
        let info = elect_gateways(&sources, &HashMap::new(), &want);
        assert_eq!(info.gate4, Some("192.0.2.1".parse::<Ipv4Addr>().unwrap()));
        assert_eq!(info.gate6, Some("2001:db8::1".parse::<Ipv6Addr>().unwrap()));
    }

    #[test]
    fn nat_offset_math() {
        assert_eq!(
            add_offset_v4("10.0.0.0".parse().unwrap(), 2),
            "10.0.0.2".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            add_offset_v6("2001:db8::".parse().unwrap(), 300),
            "2001:db8::12c".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn aggregate_sums_hfsc_ancestors() {
        let mk = |handle, parent, bytes, kind: &str| TcClassInfo {
            handle,
            parent,
            kind: kind.into(),
            stats: NetStats {
                bytes,
                packets: 1,
                ..Default::default()
            },
        };
        let root = tc_handle(1, 1);
        let a = tc_handle(1, 4);
        let b = tc_handle(1, 5);
        let classes = vec![
            mk(root, TC_H_ROOT, 0, "hfsc"),
            mk(a, root, 100, "hfsc"),
            mk(b, a, 50, "hfsc"),
        ];
        let map = aggregate_classes(&classes, &NetStats::default());
        assert_eq!(map[&b].1.bytes, 50);
        assert_eq!(map[&a].1.bytes, 150);
        assert_eq!(map[&root].1.bytes, 150);

        // htb classes keep their own counters
        let classes = vec![mk(root, TC_H_ROOT, 0, "htb"), mk(a, root, 100, "htb")];
        let map = aggregate_classes(&classes, &NetStats::default());
        assert_eq!(map[&root].1.bytes, 0);
    }

    #[test]
    fn device_stats_merge_into_class_entries() {
        let dev_stats = NetStats {
            rx_bytes: 7,
            tx_bytes: 9,
            ..Default::default()
        };
        let classes = vec![TcClassInfo {
            handle: tc_handle(1, 4),
            parent: tc_handle(1, 1),
            kind: "htb".into(),
            stats: NetStats {
                bytes: 100,
                ..Default::default()
            },
        }];
        let map = aggregate_classes(&classes, &dev_stats);
        let entry = map[&tc_handle(1, 4)].1;
        assert_eq!(entry.rx_bytes, 7);
        assert_eq!(entry.tx_bytes, 9);
        assert_eq!(entry.bytes, 100);
    }

    #[test]
    fn match_device_falls_back_to_pattern() {
        let mut st = NetState::default();
        st.devices.push(dev(2, "eth0", "htb", true, true));
        assert_eq!(Network::match_device(&st, "eth*"), "eth0");
        assert_eq!(Network::match_device(&st, "bond*"), "bond*");
        assert_eq!(device_index(&st, "eth0"), Some(2));
        assert_eq!(device_index(&st, "eth9"), None);
    }
}
