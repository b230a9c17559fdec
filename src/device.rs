use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkFlags, LinkInfo, LinkMessage};

use crate::config::{CfgMap, NetworkConfig, glob_match};

/// Per-device / per-class traffic counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NetStats {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_drops: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_drops: u64,
    pub bytes: u64,
    pub packets: u64,
    pub drops: u64,
    pub overlimits: u64,
}

/// One network interface as seen by the subsystem.
#[derive(Debug, Clone)]
pub struct NetDevice {
    pub index: u32,
    pub name: String,
    pub kind: String,
    pub group: u32,
    pub group_name: String,
    /// Parent interface index (IFLA_LINK), 0 when absent.
    pub link: u32,
    pub mtu: u32,
    /// Root qdisc kind currently installed on the kernel side.
    pub qdisc: String,

    pub managed: bool,
    pub prepared: bool,
    pub missing: bool,

    /// Effective guarantee/limit derived from link speed and configuration.
    pub rate: u64,
    pub ceil: u64,

    pub stats: NetStats,
}

fn info_kind_name(kind: &InfoKind) -> String {
    match kind {
        InfoKind::Veth => "veth".into(),
        InfoKind::Bridge => "bridge".into(),
        InfoKind::MacVlan => "macvlan".into(),
        InfoKind::IpVlan => "ipvlan".into(),
        InfoKind::Dummy => "dummy".into(),
        InfoKind::Other(name) => name.clone(),
        other => format!("{other:?}").to_lowercase(),
    }
}

impl NetDevice {
    /// Build a device from a kernel link message. `managed_ns` forces
    /// `managed` inside a container-managed namespace.
    pub fn from_link(msg: &LinkMessage, cfg: &NetworkConfig, managed_ns: bool) -> Self {
        let mut dev = NetDevice {
            index: msg.header.index,
            name: String::new(),
            kind: String::new(),
            group: 0,
            group_name: String::new(),
            link: 0,
            mtu: 0,
            qdisc: String::new(),
            managed: true,
            prepared: false,
            missing: false,
            rate: crate::NET_MAX_RATE,
            ceil: crate::NET_MAX_RATE,
            stats: NetStats::default(),
        };

        for attr in &msg.attributes {
            match attr {
                LinkAttribute::IfName(name) => dev.name = name.clone(),
                LinkAttribute::Mtu(mtu) => dev.mtu = *mtu,
                LinkAttribute::Group(group) => dev.group = *group,
                LinkAttribute::Link(parent) => dev.link = *parent,
                LinkAttribute::Qdisc(kind) => dev.qdisc = kind.clone(),
                LinkAttribute::LinkInfo(info) => {
                    for nested in info {
                        if let LinkInfo::Kind(kind) = nested {
                            dev.kind = info_kind_name(kind);
                        }
                    }
                }
                LinkAttribute::Stats64(stats) => {
                    dev.stats.rx_bytes = stats.rx_bytes;
                    dev.stats.rx_packets = stats.rx_packets;
                    dev.stats.rx_drops = stats.rx_dropped;
                    dev.stats.tx_bytes = stats.tx_bytes;
                    dev.stats.tx_packets = stats.tx_packets;
                    dev.stats.tx_drops = stats.tx_dropped;
                }
                _ => {}
            }
        }

        dev.group_name = cfg.groups.name(dev.group);

        if !managed_ns {
            for pattern in &cfg.unmanaged_device {
                if glob_match(&dev.name, pattern) {
                    dev.managed = false;
                }
            }
            if cfg.unmanaged_gids.contains(&dev.group) {
                dev.managed = false;
            }
        }

        dev
    }

    pub fn is_loopback(msg: &LinkMessage) -> bool {
        msg.header.flags.contains(LinkFlags::Loopback)
    }

    pub fn is_running(msg: &LinkMessage) -> bool {
        msg.header.flags.contains(LinkFlags::Running)
    }

    /// Veth peers created by this subsystem itself; never managed as
    /// container devices.
    pub fn is_internal_veth_peer(&self) -> bool {
        self.kind == "veth" && (self.name.starts_with("portove-") || self.name.starts_with("L3-"))
    }

    pub fn desc(&self) -> String {
        format!("{}:{} ({})", self.index, self.name, self.kind)
    }

    /// Resolve a per-device configuration value: first glob entry in
    /// insertion order, then `"group <name>"`, then `"default"`, then the
    /// caller-supplied default.
    pub fn config<V: Clone>(&self, map: &CfgMap<V>, default: V) -> V {
        self.config_opt(map).cloned().unwrap_or(default)
    }

    pub fn config_opt<'a, V>(&self, map: &'a CfgMap<V>) -> Option<&'a V> {
        map.glob_lookup(&self.name)
            .or_else(|| map.get(&format!("group {}", self.group_name)))
            .or_else(|| map.get("default"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GroupTable, UintMap};

    fn dev(name: &str, group_name: &str) -> NetDevice {
        NetDevice {
            index: 2,
            name: name.into(),
            kind: "veth".into(),
            group: 0,
            group_name: group_name.into(),
            link: 0,
            mtu: 1500,
            qdisc: String::new(),
            managed: true,
            prepared: false,
            missing: false,
            rate: 0,
            ceil: 0,
            stats: NetStats::default(),
        }
    }

    #[test]
    fn resolver_prefers_glob_then_group_then_default() {
        let map: UintMap = [("eth*", 1u64), ("group uplink", 2), ("default", 3)]
            .into_iter()
            .collect();

        assert_eq!(dev("eth0", "uplink").config(&map, 9), 1);
        assert_eq!(dev("bond0", "uplink").config(&map, 9), 2);
        assert_eq!(dev("bond0", "lan").config(&map, 9), 3);
    }

    #[test]
    fn resolver_empty_map_returns_caller_default() {
        let map = UintMap::new();
        assert_eq!(dev("eth0", "0").config(&map, 42), 42);
    }

    #[test]
    fn resolver_insertion_order_wins() {
        let map: UintMap = [("*", 1u64), ("eth0", 2)].into_iter().collect();
        assert_eq!(dev("eth0", "0").config(&map, 9), 1);
    }

    #[test]
    fn internal_veth_peers_are_recognized() {
        assert!(dev("portove-12-0", "0").is_internal_veth_peer());
        assert!(dev("L3-7", "0").is_internal_veth_peer());
        assert!(!dev("eth0", "0").is_internal_veth_peer());

        let mut d = dev("portove-12-0", "0");
        d.kind = "bridge".into();
        assert!(!d.is_internal_veth_peer());
    }

    #[test]
    fn unmanaged_matching_from_config() {
        let mut cfg = NetworkConfig::default();
        cfg.unmanaged_device = vec!["docker*".into()];
        cfg.unmanaged_gids = vec![7];
        cfg.groups = GroupTable::parse("7 infra\n");

        let mut msg = LinkMessage::default();
        msg.header.index = 3;
        msg.attributes
            .push(LinkAttribute::IfName("docker0".into()));
        let d = NetDevice::from_link(&msg, &cfg, false);
        assert!(!d.managed);

        let mut msg = LinkMessage::default();
        msg.header.index = 4;
        msg.attributes.push(LinkAttribute::IfName("eth0".into()));
        msg.attributes.push(LinkAttribute::Group(7));
        let d = NetDevice::from_link(&msg, &cfg, false);
        assert!(!d.managed);
        assert_eq!(d.group_name, "infra");

        // inside a managed namespace everything is managed
        let d = NetDevice::from_link(&msg, &cfg, true);
        assert!(d.managed);
    }
}
